//! Plugin-owned tensor memory on the engine side.
//!
//! [`PluginBuffer`] wraps a buffer produced by a plugin's `execute`. The
//! engine only borrows it: dropping the wrapper hands the pointer back
//! through the plugin's `release` entry point instead of freeing it.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pipeflow_types::{Precision, TensorStorage};
use tracing::warn;

use crate::instance::InstanceState;

const RELEASE_ATTEMPTS: usize = 3;
const RELEASE_BACKOFF: Duration = Duration::from_millis(1);

pub struct PluginBuffer {
    ptr: *mut u8,
    len: usize,
    shape: Vec<usize>,
    precision: Precision,
    owner: Arc<InstanceState>,
}

// SAFETY: the buffer is never written after `execute` returns and the plugin
// contract requires `release` to be callable from any thread.
unsafe impl Send for PluginBuffer {}
unsafe impl Sync for PluginBuffer {}

impl PluginBuffer {
    pub(crate) fn new(
        ptr: *mut u8,
        len: usize,
        shape: Vec<usize>,
        precision: Precision,
        owner: Arc<InstanceState>,
    ) -> Self {
        Self { ptr, len, shape, precision, owner }
    }

    /// The plugin-provided pointer. No allocation happens on the engine side.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

impl TensorStorage for PluginBuffer {
    fn bytes(&self) -> &[u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: the plugin guarantees `len` readable bytes at `ptr` until
        // the buffer is released, which only happens in `drop`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for PluginBuffer {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // Results were already delivered; a failing release is logged only.
        for attempt in 1..=RELEASE_ATTEMPTS {
            match self.owner.release(self.ptr.cast()) {
                Ok(()) => return,
                Err(e) if attempt == RELEASE_ATTEMPTS => {
                    warn!(node = %self.owner.node(), error = %e, "failed to release plugin buffer");
                }
                Err(_) => thread::sleep(RELEASE_BACKOFF),
            }
        }
    }
}

impl PartialEq for PluginBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
            && self.shape == other.shape
            && self.precision == other.precision
            && self.owner.raw_state() == other.owner.raw_state()
    }
}

impl fmt::Debug for PluginBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("shape", &self.shape)
            .field("precision", &self.precision)
            .field("node", &self.owner.node())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::os::raw::{c_int, c_void};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::abi::{CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo, ReleaseFn};
    use crate::instance::PluginInstance;
    use crate::library::{LibraryFns, NodeLibrary};

    static RELEASED: AtomicUsize = AtomicUsize::new(0);
    static RELEASE_ATTEMPTED: AtomicUsize = AtomicUsize::new(0);

    /// Every instance gets its own state pointer.
    unsafe extern "C" fn init_boxed(
        state: *mut *mut c_void,
        _params: *const CustomNodeParam,
        _count: c_int,
    ) -> c_int {
        *state = Box::into_raw(Box::new(0u8)).cast();
        0
    }

    unsafe extern "C" fn deinit_boxed(state: *mut c_void) -> c_int {
        drop(Box::from_raw(state.cast::<u8>()));
        0
    }

    unsafe extern "C" fn exec_unused(
        _inputs: *const CustomNodeTensor,
        _inputs_count: c_int,
        _outputs: *mut *mut CustomNodeTensor,
        _outputs_count: *mut c_int,
        _params: *const CustomNodeParam,
        _params_count: c_int,
        _state: *mut c_void,
    ) -> c_int {
        1
    }

    unsafe extern "C" fn info_empty(
        _info: *mut *mut CustomNodeTensorInfo,
        _count: *mut c_int,
        _params: *const CustomNodeParam,
        _params_count: c_int,
        _state: *mut c_void,
    ) -> c_int {
        0
    }

    unsafe extern "C" fn release_counting(_ptr: *mut c_void, _state: *mut c_void) -> c_int {
        RELEASED.fetch_add(1, Ordering::SeqCst);
        0
    }

    unsafe extern "C" fn release_failing(_ptr: *mut c_void, _state: *mut c_void) -> c_int {
        RELEASE_ATTEMPTED.fetch_add(1, Ordering::SeqCst);
        5
    }

    unsafe extern "C" fn release_ignored(_ptr: *mut c_void, _state: *mut c_void) -> c_int {
        0
    }

    fn instance(release: ReleaseFn) -> PluginInstance {
        let library = NodeLibrary::from_fns(
            "fake",
            LibraryFns {
                initialize: init_boxed,
                deinitialize: deinit_boxed,
                execute: exec_unused,
                get_inputs_info: info_empty,
                get_outputs_info: info_empty,
                release,
            },
        );
        PluginInstance::initialize("n", &library, &BTreeMap::new()).unwrap()
    }

    fn wrap(plugin: &PluginInstance, ptr: *mut u8, shape: Vec<usize>, precision: Precision) -> PluginBuffer {
        PluginBuffer::new(ptr, 8, shape, precision, Arc::clone(plugin.state()))
    }

    #[test]
    fn drop_hands_the_pointer_back_once() {
        let plugin = instance(release_counting);
        let mut data = [1u8; 8];
        let buffer = wrap(&plugin, data.as_mut_ptr(), vec![2], Precision::Fp32);
        assert_eq!(buffer.bytes(), &[1u8; 8]);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 0);
        drop(buffer);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 1);

        // Null buffers have nothing to give back.
        drop(wrap(&plugin, std::ptr::null_mut(), vec![0], Precision::Fp32));
        assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_release_is_retried_then_only_logged() {
        let plugin = instance(release_failing);
        let mut data = [0u8; 8];
        drop(wrap(&plugin, data.as_mut_ptr(), vec![2], Precision::Fp32));
        assert_eq!(RELEASE_ATTEMPTED.load(Ordering::SeqCst), RELEASE_ATTEMPTS);
    }

    #[test]
    fn equality_covers_pointer_shape_precision_and_owner() {
        let plugin = instance(release_ignored);
        let other = instance(release_ignored);
        let mut data = [0u8; 8];
        let mut elsewhere = [0u8; 8];
        let buffer = wrap(&plugin, data.as_mut_ptr(), vec![2], Precision::Fp32);

        assert_eq!(buffer, wrap(&plugin, data.as_mut_ptr(), vec![2], Precision::Fp32));
        assert_ne!(buffer, wrap(&plugin, elsewhere.as_mut_ptr(), vec![2], Precision::Fp32));
        assert_ne!(buffer, wrap(&plugin, data.as_mut_ptr(), vec![1, 2], Precision::Fp32));
        assert_ne!(buffer, wrap(&plugin, data.as_mut_ptr(), vec![2], Precision::I32));
        assert_ne!(buffer, wrap(&other, data.as_mut_ptr(), vec![2], Precision::Fp32));
    }
}
