// Plugin-side helpers shared by the built-in libraries: parameter parsing,
// tracked heap allocations and ABI array construction.

use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::Mutex;

use crate::abi::{CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo};

pub(crate) const STATUS_FAILED: c_int = 1;

const HEAP_ALIGN: usize = 64;

// ── Heap ──────────────────────────────────────────────────────────────────────

/// Allocations handed across the ABI, remembered so `release` can free them
/// with the right layout.
#[derive(Default)]
pub(crate) struct Heap {
    live: Mutex<HashMap<usize, Layout>>,
}

impl Heap {
    /// Zeroed block of `bytes` bytes. Null on failure or zero size.
    pub(crate) fn alloc(&self, bytes: usize) -> *mut u8 {
        if bytes == 0 {
            return ptr::null_mut();
        }
        let Ok(layout) = Layout::from_size_align(bytes, HEAP_ALIGN) else {
            return ptr::null_mut();
        };
        // SAFETY: non-zero size.
        let p = unsafe { alloc::alloc_zeroed(layout) };
        if !p.is_null() {
            self.lock().insert(p as usize, layout);
        }
        p
    }

    pub(crate) fn alloc_array<T>(&self, len: usize) -> *mut T {
        match std::mem::size_of::<T>().checked_mul(len) {
            Some(bytes) => self.alloc(bytes).cast(),
            None => ptr::null_mut(),
        }
    }

    /// Free a block from `alloc`. `false` for pointers this heap never issued.
    pub(crate) fn free(&self, p: *mut u8) -> bool {
        let Some(layout) = self.lock().remove(&(p as usize)) else {
            return false;
        };
        // SAFETY: allocated by `alloc` with this layout, removed from the map once.
        unsafe { alloc::dealloc(p, layout) };
        true
    }

    pub(crate) fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Layout>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let live = std::mem::take(&mut *self.lock());
        for (addr, layout) in live {
            // SAFETY: every entry is an outstanding allocation of this heap.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

// ── Reading ABI input ─────────────────────────────────────────────────────────

/// # Safety
/// `params` must point to `count` valid entries with NUL-terminated strings.
pub(crate) unsafe fn read_params(
    params: *const CustomNodeParam,
    count: c_int,
) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if params.is_null() || count <= 0 {
        return map;
    }
    for p in std::slice::from_raw_parts(params, count as usize) {
        if p.key.is_null() || p.value.is_null() {
            continue;
        }
        map.insert(
            CStr::from_ptr(p.key).to_string_lossy().into_owned(),
            CStr::from_ptr(p.value).to_string_lossy().into_owned(),
        );
    }
    map
}

pub(crate) fn param_or<T: std::str::FromStr>(
    params: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Option<T> {
    match params.get(key) {
        Some(v) => v.trim().parse().ok(),
        None => Some(default),
    }
}

/// # Safety
/// `inputs` must point to `count` valid tensors.
pub(crate) unsafe fn find_input<'a>(
    inputs: *const CustomNodeTensor,
    count: c_int,
    name: &CStr,
) -> Option<&'a CustomNodeTensor> {
    if inputs.is_null() || count <= 0 {
        return None;
    }
    std::slice::from_raw_parts(inputs, count as usize)
        .iter()
        .find(|t| !t.name.is_null() && CStr::from_ptr(t.name) == name)
}

/// # Safety
/// `t` must describe readable memory.
pub(crate) unsafe fn tensor_bytes(t: &CustomNodeTensor) -> &[u8] {
    if t.data.is_null() || t.data_bytes == 0 {
        return &[];
    }
    std::slice::from_raw_parts(t.data, t.data_bytes as usize)
}

/// # Safety
/// `t.dims` must hold `t.dims_count` entries.
pub(crate) unsafe fn tensor_dims(t: &CustomNodeTensor) -> &[u64] {
    if t.dims.is_null() || t.dims_count == 0 {
        return &[];
    }
    std::slice::from_raw_parts(t.dims, t.dims_count as usize)
}

// ── Building ABI output ───────────────────────────────────────────────────────

/// Copy `dims` into a heap array. Null on failure.
pub(crate) fn heap_dims(heap: &Heap, dims: &[u64]) -> *mut u64 {
    let p: *mut u64 = heap.alloc_array(dims.len());
    if !p.is_null() {
        // SAFETY: freshly allocated with room for `dims.len()` entries.
        unsafe { ptr::copy_nonoverlapping(dims.as_ptr(), p, dims.len()) };
    }
    p
}

/// Write a tensor info array to the out-pointers.
///
/// # Safety
/// `info` and `count` must be valid out-pointers.
pub(crate) unsafe fn write_info(
    heap: &Heap,
    info: *mut *mut CustomNodeTensorInfo,
    count: *mut c_int,
    entries: &[(&'static CStr, &[u64], u32)],
) -> c_int {
    if info.is_null() || count.is_null() {
        return STATUS_FAILED;
    }
    let array: *mut CustomNodeTensorInfo = heap.alloc_array(entries.len());
    if array.is_null() {
        return STATUS_FAILED;
    }
    for (i, (name, dims, precision)) in entries.iter().enumerate() {
        let dims_ptr = heap_dims(heap, dims);
        if dims_ptr.is_null() && !dims.is_empty() {
            for j in 0..i {
                heap.free((*array.add(j)).dims.cast());
            }
            heap.free(array.cast());
            return STATUS_FAILED;
        }
        array.add(i).write(CustomNodeTensorInfo {
            name: name.as_ptr() as *const c_char,
            dims: dims_ptr,
            dims_count: dims.len() as u64,
            precision: *precision,
        });
    }
    *info = array;
    *count = entries.len() as c_int;
    0
}

// ── Tests ─────────────────────────────────────────────────────────────────────
