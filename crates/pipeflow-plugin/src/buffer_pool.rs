//! Fixed-capacity arena of equal-size buffers.
//!
//! One contiguous allocation of `single_size * slot_count` bytes is split
//! into slots. `acquire` pops an idle slot without allocating; `release`
//! maps a pointer back to its slot and rejects anything that is not exactly
//! a slot start of this arena.

use std::alloc::{self, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::{PluginError, Result};

/// Slot alignment. Large enough for any tensor element type.
const SLOT_ALIGN: usize = 64;

struct Slots {
    idle: VecDeque<usize>,
    busy: Vec<bool>,
}

pub struct BufferPool {
    base: NonNull<u8>,
    layout: Layout,
    single_size: usize,
    slot_count: usize,
    slots: Mutex<Slots>,
}

// SAFETY: the arena is only reached through raw slot pointers handed out by
// `acquire`; slot bookkeeping is guarded by the mutex.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(single_size: usize, slot_count: usize) -> Result<Self> {
        if single_size == 0 || slot_count == 0 {
            return Err(PluginError::Pool(format!(
                "invalid geometry: {slot_count} slots of {single_size} bytes"
            )));
        }
        // Round slots up so every slot start stays aligned.
        let single_size = single_size
            .checked_next_multiple_of(SLOT_ALIGN)
            .ok_or_else(|| PluginError::Pool("slot size overflow".into()))?;
        let total = single_size
            .checked_mul(slot_count)
            .ok_or_else(|| PluginError::Pool("arena size overflow".into()))?;
        let layout = Layout::from_size_align(total, SLOT_ALIGN)
            .map_err(|e| PluginError::Pool(e.to_string()))?;

        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw)
            .ok_or_else(|| PluginError::Pool(format!("failed to allocate {total} bytes")))?;

        Ok(Self {
            base,
            layout,
            single_size,
            slot_count,
            slots: Mutex::new(Slots {
                idle: (0..slot_count).collect(),
                busy: vec![false; slot_count],
            }),
        })
    }

    /// Pop an idle slot. `None` when every slot is in use.
    pub fn acquire(&self) -> Option<*mut u8> {
        let mut slots = self.lock();
        let index = slots.idle.pop_front()?;
        slots.busy[index] = true;
        // SAFETY: index < slot_count, so the offset stays inside the arena.
        Some(unsafe { self.base.as_ptr().add(index * self.single_size) })
    }

    /// Return a slot. `false` when `ptr` is not an acquired slot start of
    /// this arena; the pool is left untouched in that case.
    pub fn release(&self, ptr: *const u8) -> bool {
        let Some(index) = self.slot_index(ptr) else {
            return false;
        };
        let mut slots = self.lock();
        if !slots.busy[index] {
            return false;
        }
        slots.busy[index] = false;
        slots.idle.push_back(index);
        true
    }

    /// True when `ptr` lies inside the arena, aligned or not.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.layout.size()
    }

    pub fn single_size(&self) -> usize {
        self.single_size
    }

    pub fn capacity(&self) -> usize {
        self.slot_count
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    fn slot_index(&self, ptr: *const u8) -> Option<usize> {
        if !self.contains(ptr) {
            return None;
        }
        let offset = ptr as usize - self.base.as_ptr() as usize;
        if offset % self.single_size != 0 {
            return None;
        }
        Some(offset / self.single_size)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("single_size", &self.single_size)
            .field("slot_count", &self.slot_count)
            .field("idle", &self.idle_count())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
