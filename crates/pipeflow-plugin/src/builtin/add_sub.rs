//! `add_sub`: element-wise `x + add_number - sub_number` over an FP32 tensor.
//!
//! Parameters:
//! - `add_number`, `sub_number` (f32, default 0)
//! - `output_queue_size` (slots in the output pool, default 0 = no pool)
//! - `max_output_elements` (FP32 elements per pooled buffer, default 0)
//!
//! Outputs come from the pool when one is configured, the output fits a slot
//! and a slot is idle; otherwise they fall back to a tracked heap block.
//! Reconfiguring with different pool parameters retires the old pool; it is
//! freed once every buffer it handed out has come back.

use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::{Arc, Mutex, RwLock};

use pipeflow_types::Precision;
use tracing::{debug, warn};

use super::support::{
    self, find_input, heap_dims, param_or, read_params, tensor_bytes, tensor_dims, Heap,
    STATUS_FAILED,
};
use crate::abi::{CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo, STATUS_OK};
use crate::buffer_pool::BufferPool;
use crate::library::{LibraryFns, NodeLibrary};

pub const LIBRARY_NAME: &str = "add_sub";
pub const INPUT_NAME: &CStr = c"input_numbers";
pub const OUTPUT_NAME: &CStr = c"output_numbers";

pub fn library() -> NodeLibrary {
    NodeLibrary::from_fns(
        LIBRARY_NAME,
        LibraryFns {
            initialize,
            deinitialize,
            execute,
            get_inputs_info,
            get_outputs_info,
            release,
        },
    )
}

// ── Internal manager ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Settings {
    add: f32,
    sub: f32,
    queue_size: usize,
    max_elements: usize,
}

impl Settings {
    fn parse(params: &std::collections::BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            add: param_or(params, "add_number", 0.0)?,
            sub: param_or(params, "sub_number", 0.0)?,
            queue_size: param_or(params, "output_queue_size", 0)?,
            max_elements: param_or(params, "max_output_elements", 0)?,
        })
    }

    fn build_pool(&self) -> Option<Result<Arc<BufferPool>, crate::PluginError>> {
        if self.queue_size == 0 || self.max_elements == 0 {
            return None;
        }
        Some(BufferPool::new(self.max_elements * 4, self.queue_size).map(Arc::new))
    }
}

struct Config {
    settings: Settings,
    pool: Option<Arc<BufferPool>>,
}

struct Manager {
    config: RwLock<Config>,
    retired: Mutex<Vec<Arc<BufferPool>>>,
    heap: Heap,
}

impl Manager {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in new settings. Blocks until in-flight executes finish.
    fn reconfigure(&self, settings: Settings) -> c_int {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        let pool_changed = settings.queue_size != config.settings.queue_size
            || settings.max_elements != config.settings.max_elements;
        if pool_changed {
            let pool = match settings.build_pool().transpose() {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(error = %e, "add_sub: cannot rebuild output pool");
                    return STATUS_FAILED;
                }
            };
            if let Some(old) = std::mem::replace(&mut config.pool, pool) {
                self.retire(old);
            }
        }
        config.settings = settings;
        STATUS_OK
    }

    fn retire(&self, pool: Arc<BufferPool>) {
        if pool.idle_count() < pool.capacity() {
            self.retired.lock().unwrap_or_else(|e| e.into_inner()).push(pool);
        }
    }

    fn release(&self, p: *mut u8) -> c_int {
        {
            let config = self.read();
            if let Some(pool) = config.pool.as_ref().filter(|pool| pool.contains(p)) {
                return if pool.release(p) { STATUS_OK } else { STATUS_FAILED };
            }
        }
        {
            let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(i) = retired.iter().position(|pool| pool.contains(p)) {
                if !retired[i].release(p) {
                    return STATUS_FAILED;
                }
                if retired[i].idle_count() == retired[i].capacity() {
                    retired.swap_remove(i);
                    debug!("add_sub: retired pool drained");
                }
                return STATUS_OK;
            }
        }
        if self.heap.free(p) {
            STATUS_OK
        } else {
            STATUS_FAILED
        }
    }
}

/// # Safety
/// `state` must be null or a pointer produced by `initialize`.
unsafe fn manager<'a>(state: *mut c_void) -> Option<&'a Manager> {
    (state as *const Manager).as_ref()
}

// ── Entry points ──────────────────────────────────────────────────────────────

unsafe extern "C" fn initialize(
    state: *mut *mut c_void,
    params: *const CustomNodeParam,
    params_count: c_int,
) -> c_int {
    if state.is_null() {
        return STATUS_FAILED;
    }
    let Some(settings) = Settings::parse(&read_params(params, params_count)) else {
        return STATUS_FAILED;
    };
    if let Some(existing) = manager(*state) {
        return existing.reconfigure(settings);
    }
    let pool = match settings.build_pool().transpose() {
        Ok(pool) => pool,
        Err(_) => return STATUS_FAILED,
    };
    let m = Box::new(Manager {
        config: RwLock::new(Config { settings, pool }),
        retired: Mutex::new(Vec::new()),
        heap: Heap::default(),
    });
    *state = Box::into_raw(m).cast();
    STATUS_OK
}

unsafe extern "C" fn deinitialize(state: *mut c_void) -> c_int {
    if state.is_null() {
        return STATUS_FAILED;
    }
    drop(Box::from_raw(state as *mut Manager));
    STATUS_OK
}

unsafe extern "C" fn execute(
    inputs: *const CustomNodeTensor,
    inputs_count: c_int,
    outputs: *mut *mut CustomNodeTensor,
    outputs_count: *mut c_int,
    _params: *const CustomNodeParam,
    _params_count: c_int,
    state: *mut c_void,
) -> c_int {
    let Some(m) = manager(state) else {
        return STATUS_FAILED;
    };
    if outputs.is_null() || outputs_count.is_null() {
        return STATUS_FAILED;
    }
    let Some(input) = find_input(inputs, inputs_count, INPUT_NAME) else {
        return STATUS_FAILED;
    };
    if input.precision != Precision::Fp32 as u32 {
        return STATUS_FAILED;
    }

    let config = m.read();
    let bytes = tensor_bytes(input);
    let len = bytes.len();

    let pooled = config
        .pool
        .as_ref()
        .filter(|pool| len <= pool.single_size())
        .and_then(|pool| pool.acquire());
    let data = match pooled {
        Some(p) => p,
        None => m.heap.alloc(len),
    };
    if data.is_null() && len != 0 {
        return STATUS_FAILED;
    }

    let delta = config.settings.add - config.settings.sub;
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        let v = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) + delta;
        ptr::copy_nonoverlapping(v.to_ne_bytes().as_ptr(), data.add(i * 4), 4);
    }

    let dims = tensor_dims(input);
    let dims_ptr = heap_dims(&m.heap, dims);
    let array: *mut CustomNodeTensor = m.heap.alloc_array(1);
    if array.is_null() || (dims_ptr.is_null() && !dims.is_empty()) {
        // Own cleanup before reporting failure.
        m.heap.free(array.cast());
        m.heap.free(dims_ptr.cast());
        drop(config);
        if !data.is_null() {
            m.release(data);
        }
        return STATUS_FAILED;
    }
    array.write(CustomNodeTensor {
        name: OUTPUT_NAME.as_ptr(),
        data,
        data_bytes: len as u64,
        dims: dims_ptr,
        dims_count: dims.len() as u64,
        precision: Precision::Fp32 as u32,
    });
    *outputs = array;
    *outputs_count = 1;
    STATUS_OK
}

unsafe extern "C" fn get_inputs_info(
    info: *mut *mut CustomNodeTensorInfo,
    info_count: *mut c_int,
    _params: *const CustomNodeParam,
    _params_count: c_int,
    state: *mut c_void,
) -> c_int {
    let Some(m) = manager(state) else {
        return STATUS_FAILED;
    };
    let _config = m.read();
    support::write_info(&m.heap, info, info_count, &[(INPUT_NAME, &[0, 0], Precision::Fp32 as u32)])
}

unsafe extern "C" fn get_outputs_info(
    info: *mut *mut CustomNodeTensorInfo,
    info_count: *mut c_int,
    _params: *const CustomNodeParam,
    _params_count: c_int,
    state: *mut c_void,
) -> c_int {
    let Some(m) = manager(state) else {
        return STATUS_FAILED;
    };
    let _config = m.read();
    support::write_info(&m.heap, info, info_count, &[(OUTPUT_NAME, &[0, 0], Precision::Fp32 as u32)])
}

unsafe extern "C" fn release(p: *mut c_void, state: *mut c_void) -> c_int {
    match manager(state) {
        Some(m) if !p.is_null() => m.release(p.cast()),
        _ => STATUS_FAILED,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pipeflow_types::{Dimension, Tensor, TensorMap};

    use crate::instance::{NodePlugin, PluginInstance};
    use crate::PluginError;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn input(values: &[f32]) -> TensorMap {
        let mut map = TensorMap::new();
        map.insert(
            "input_numbers".into(),
            Tensor::from_f32(vec![values.len()], values).unwrap(),
        );
        map
    }

    #[test]
    fn adds_number() {
        let plugin =
            PluginInstance::initialize("add", &super::library(), &params(&[("add_number", "1")]))
                .unwrap();
        let out = plugin.execute(&input(&[1.0, 2.0, 3.0])).unwrap();
        let t = &out["output_numbers"];
        assert_eq!(t.shape(), &[3]);
        assert_eq!(t.to_f32_vec().unwrap(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn pooled_outputs_return_to_pool() {
        let plugin = PluginInstance::initialize(
            "add",
            &super::library(),
            &params(&[("output_queue_size", "2"), ("max_output_elements", "8")]),
        )
        .unwrap();
        // More executes than slots: the third falls back to the heap.
        let held: Vec<_> = (0..3).map(|_| plugin.execute(&input(&[1.0])).unwrap()).collect();
        assert_eq!(held.len(), 3);
        drop(held);
        let again: Vec<_> = (0..2).map(|_| plugin.execute(&input(&[5.0])).unwrap()).collect();
        assert_eq!(again[1]["output_numbers"].to_f32_vec().unwrap(), vec![5.0]);
    }

    #[test]
    fn missing_input_fails() {
        let plugin = PluginInstance::initialize("add", &super::library(), &params(&[])).unwrap();
        let mut wrong = TensorMap::new();
        wrong.insert("other".into(), Tensor::from_f32(vec![1], &[1.0]).unwrap());
        let err = plugin.execute(&wrong).unwrap_err();
        assert!(matches!(err, PluginError::Execute { code: 1, .. }));
    }

    #[test]
    fn invalid_param_aborts_initialize() {
        let err = PluginInstance::initialize(
            "add",
            &super::library(),
            &params(&[("add_number", "one")]),
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::Initialize { code: 1, .. }));
    }

    #[test]
    fn reconfigure_keeps_outstanding_buffers_valid() {
        let plugin = PluginInstance::initialize(
            "add",
            &super::library(),
            &params(&[("add_number", "1"), ("output_queue_size", "1"), ("max_output_elements", "4")]),
        )
        .unwrap();
        let before = plugin.execute(&input(&[1.0, 1.0])).unwrap();

        plugin
            .reconfigure(&params(&[("add_number", "10"), ("output_queue_size", "3"), ("max_output_elements", "4")]))
            .unwrap();
        let after = plugin.execute(&input(&[1.0, 1.0])).unwrap();

        assert_eq!(before["output_numbers"].to_f32_vec().unwrap(), vec![2.0, 2.0]);
        assert_eq!(after["output_numbers"].to_f32_vec().unwrap(), vec![11.0, 11.0]);
    }

    #[test]
    fn metadata_queries() {
        let plugin = PluginInstance::initialize("add", &super::library(), &params(&[])).unwrap();
        let inputs = plugin.inputs_info().unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].name, "input_numbers");
        assert_eq!(inputs[0].shape, vec![Dimension::Any, Dimension::Any]);
        assert_eq!(plugin.outputs_info().unwrap()[0].name, "output_numbers");
    }

    #[test]
    fn results_outlive_instance_handle() {
        let plugin = PluginInstance::initialize("add", &super::library(), &params(&[("sub_number", "1")]))
            .unwrap();
        let out = plugin.execute(&input(&[4.0])).unwrap();
        drop(plugin);
        assert_eq!(out["output_numbers"].to_f32_vec().unwrap(), vec![3.0]);
    }
}
