//! Initialized plugin state for one pipeline node.
//!
//! [`PluginInstance`] owns the opaque internal manager a library created in
//! `initialize` and exposes it through the safe [`NodePlugin`] trait. The
//! manager is shared by every in-flight request of the node; buffers handed
//! out by `execute` keep it alive until they are released, so
//! `deinitialize` only runs once nothing references it any more.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, RwLock};

use pipeflow_types::{Dimension, Precision, Tensor, TensorMap, TensorSpec};
use tracing::{debug, info, warn};

use crate::abi::{CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo, TensorInfoFn, STATUS_OK};
use crate::buffer::PluginBuffer;
use crate::error::{PluginError, Result};
use crate::library::NodeLibrary;

/// Upper bound on the rank a plugin may report.
const MAX_DIMS: u64 = 32;

// ── NodePlugin ────────────────────────────────────────────────────────────────

/// Safe engine-side view of a custom node implementation.
///
/// `execute`, `inputs_info` and `outputs_info` may be called concurrently
/// from many request threads. `reconfigure` may run while executes are in
/// flight; implementations serialize it against them.
pub trait NodePlugin: Send + Sync {
    fn node(&self) -> &str;

    fn execute(&self, inputs: &TensorMap) -> Result<TensorMap>;

    fn inputs_info(&self) -> Result<Vec<TensorSpec>>;

    fn outputs_info(&self) -> Result<Vec<TensorSpec>>;

    fn reconfigure(&self, params: &BTreeMap<String, String>) -> Result<()>;
}

// ── Parameters ────────────────────────────────────────────────────────────────

/// Parameters in ABI form. The raw entries point into `owned`.
struct ParamBlock {
    _owned: Vec<(CString, CString)>,
    raw: Vec<CustomNodeParam>,
}

// SAFETY: the raw pointers only reference the immutable `owned` strings.
unsafe impl Send for ParamBlock {}
unsafe impl Sync for ParamBlock {}

impl ParamBlock {
    fn new(params: &BTreeMap<String, String>) -> Result<Self> {
        let owned = params
            .iter()
            .map(|(k, v)| Ok((c_string(k)?, c_string(v)?)))
            .collect::<Result<Vec<_>>>()?;
        let raw = owned
            .iter()
            .map(|(k, v)| CustomNodeParam { key: k.as_ptr(), value: v.as_ptr() })
            .collect();
        Ok(Self { _owned: owned, raw })
    }

    fn as_ptr(&self) -> *const CustomNodeParam {
        self.raw.as_ptr()
    }

    fn count(&self) -> c_int {
        self.raw.len() as c_int
    }
}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| PluginError::InvalidParam(format!("{s:?} contains a NUL byte")))
}

// ── Instance State ────────────────────────────────────────────────────────────

pub(crate) struct InstanceState {
    node: String,
    library: NodeLibrary,
    state: AtomicPtr<c_void>,
    params: RwLock<Arc<ParamBlock>>,
}

impl InstanceState {
    pub(crate) fn node(&self) -> &str {
        &self.node
    }

    pub(crate) fn raw_state(&self) -> *mut c_void {
        self.state.load(Ordering::Acquire)
    }

    /// Hand `ptr` back to the plugin.
    pub(crate) fn release(&self, ptr: *mut c_void) -> Result<()> {
        // SAFETY: `ptr` was produced by this plugin state and is released once.
        let code = unsafe { (self.library.fns().release)(ptr, self.raw_state()) };
        if code == STATUS_OK {
            Ok(())
        } else {
            Err(PluginError::Release { ptr: ptr as usize, code })
        }
    }

    fn release_logged(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        if let Err(e) = self.release(ptr) {
            warn!(node = %self.node, error = %e, "plugin release failed");
        }
    }

    fn params(&self) -> Arc<ParamBlock> {
        Arc::clone(&self.params.read().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Drop for InstanceState {
    fn drop(&mut self) {
        let state = self.raw_state();
        if state.is_null() {
            return;
        }
        // SAFETY: no buffer or caller references the state any more.
        let code = unsafe { (self.library.fns().deinitialize)(state) };
        if code == STATUS_OK {
            info!(node = %self.node, library = %self.library.name(), "plugin deinitialized");
        } else {
            let e = PluginError::Deinitialize { library: self.library.name().to_string(), code };
            warn!(node = %self.node, error = %e, "plugin deinitialize failed");
        }
    }
}

// ── Plugin Instance ───────────────────────────────────────────────────────────

pub struct PluginInstance {
    inner: Arc<InstanceState>,
}

impl PluginInstance {
    /// Run the library's `initialize` for `node`. A non-zero status aborts.
    pub fn initialize(
        node: impl Into<String>,
        library: &NodeLibrary,
        params: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let node = node.into();
        let block = Arc::new(ParamBlock::new(params)?);
        let mut state: *mut c_void = ptr::null_mut();
        // SAFETY: `state` is a valid slot and the params outlive the call.
        let code = unsafe { (library.fns().initialize)(&mut state, block.as_ptr(), block.count()) };
        if code != STATUS_OK {
            return Err(PluginError::Initialize { library: library.name().to_string(), code });
        }
        info!(node = %node, library = %library.name(), params = params.len(), "plugin initialized");
        Ok(Self {
            inner: Arc::new(InstanceState {
                node,
                library: library.clone(),
                state: AtomicPtr::new(state),
                params: RwLock::new(block),
            }),
        })
    }

    pub fn library(&self) -> &str {
        self.inner.library.name()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<InstanceState> {
        &self.inner
    }

    fn corrupted(&self, reason: impl Into<String>) -> PluginError {
        PluginError::OutputsCorrupted { node: self.inner.node.clone(), reason: reason.into() }
    }

    /// Take ownership of what a successful `execute` returned.
    fn collect_outputs(&self, array: *mut CustomNodeTensor, count: c_int) -> Result<TensorMap> {
        let st = &self.inner;
        if array.is_null() {
            return Err(self.corrupted("null outputs array"));
        }
        if count <= 0 {
            st.release_logged(array.cast());
            return Err(self.corrupted(format!("{count} outputs")));
        }

        // SAFETY: the plugin returned `count` initialized entries.
        let raw: Vec<CustomNodeTensor> =
            unsafe { std::slice::from_raw_parts(array, count as usize) }.to_vec();

        // Copy dims out and return every dims array and the outputs array
        // before anything can fail. Data buffers are wrapped right away so
        // an early return releases them. A data pointer seen twice gets a
        // single wrapper.
        let mut pending = Vec::with_capacity(raw.len());
        let mut seen = HashSet::with_capacity(raw.len());
        for t in &raw {
            let dims = read_dims(t.dims, t.dims_count);
            st.release_logged(t.dims.cast());
            let shape: Vec<usize> = dims.iter().flatten().map(|d| *d as usize).collect();
            let precision = Precision::from_u32(t.precision).unwrap_or(Precision::Unspecified);
            let buffer = (t.data.is_null() || seen.insert(t.data)).then(|| {
                PluginBuffer::new(t.data, t.data_bytes as usize, shape, precision, Arc::clone(st))
            });
            pending.push((t.name, dims.is_some(), buffer));
        }
        st.release_logged(array.cast());

        let mut outputs = TensorMap::new();
        for ((name, dims_ok, buffer), t) in pending.into_iter().zip(&raw) {
            if name.is_null() {
                return Err(self.corrupted("output without a name"));
            }
            // SAFETY: plugin names are NUL-terminated and live as long as the library.
            let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
            if !dims_ok {
                return Err(self.corrupted(format!("output {name}: invalid dims")));
            }
            let Some(buffer) = buffer else {
                return Err(
                    self.corrupted(format!("output {name}: data shared with another output"))
                );
            };
            if t.data.is_null() && t.data_bytes != 0 {
                return Err(self.corrupted(format!("output {name}: null data")));
            }
            let precision = buffer.precision();
            if precision == Precision::Unspecified {
                return Err(self.corrupted(format!("output {name}: precision {}", t.precision)));
            }
            let shape = buffer.shape().to_vec();
            let tensor = Tensor::new(precision, shape, Arc::new(buffer))
                .map_err(|e| self.corrupted(format!("output {name}: {e}")))?;
            if outputs.insert(name.clone(), tensor).is_some() {
                return Err(self.corrupted(format!("duplicate output {name}")));
            }
        }
        Ok(outputs)
    }

    fn query_info(&self, query: &'static str, f: TensorInfoFn) -> Result<Vec<TensorSpec>> {
        let st = &self.inner;
        let params = st.params();
        let mut array: *mut CustomNodeTensorInfo = ptr::null_mut();
        let mut count: c_int = 0;
        // SAFETY: out-pointers are valid; params outlive the call.
        let code = unsafe { f(&mut array, &mut count, params.as_ptr(), params.count(), st.raw_state()) };
        if code != STATUS_OK {
            return Err(PluginError::Metadata { node: st.node.clone(), query, code });
        }
        if array.is_null() || count <= 0 {
            st.release_logged(array.cast());
            return Ok(Vec::new());
        }

        // SAFETY: the plugin returned `count` initialized entries.
        let raw = unsafe { std::slice::from_raw_parts(array, count as usize) }.to_vec();
        let mut specs = Vec::with_capacity(raw.len());
        for info in &raw {
            let dims = read_dims(info.dims, info.dims_count).unwrap_or_default();
            st.release_logged(info.dims.cast());
            let name = if info.name.is_null() {
                String::new()
            } else {
                // SAFETY: NUL-terminated, library-lifetime string.
                unsafe { CStr::from_ptr(info.name) }.to_string_lossy().into_owned()
            };
            specs.push(TensorSpec {
                name,
                shape: dims
                    .into_iter()
                    .map(|d| if d == 0 { Dimension::Any } else { Dimension::Fixed(d as usize) })
                    .collect(),
                precision: Precision::from_u32(info.precision).unwrap_or(Precision::Unspecified),
            });
        }
        st.release_logged(array.cast());
        Ok(specs)
    }
}

/// Copy a plugin dims array. `None` for null-with-count or oversized ranks.
fn read_dims(dims: *const u64, count: u64) -> Option<Vec<u64>> {
    if count == 0 {
        return Some(Vec::new());
    }
    if dims.is_null() || count > MAX_DIMS {
        return None;
    }
    // SAFETY: the plugin declared `count` entries at `dims`.
    Some(unsafe { std::slice::from_raw_parts(dims, count as usize) }.to_vec())
}

impl NodePlugin for PluginInstance {
    fn node(&self) -> &str {
        &self.inner.node
    }

    fn execute(&self, inputs: &TensorMap) -> Result<TensorMap> {
        let st = &self.inner;
        let params = st.params();

        let names = inputs
            .keys()
            .map(|k| c_string(k))
            .collect::<Result<Vec<_>>>()?;
        let dims: Vec<Vec<u64>> = inputs
            .values()
            .map(|t| t.shape().iter().map(|d| *d as u64).collect())
            .collect();
        let raw_inputs: Vec<CustomNodeTensor> = inputs
            .values()
            .zip(&names)
            .zip(&dims)
            .map(|((t, name), dims)| CustomNodeTensor {
                name: name.as_ptr(),
                // Inputs are read-only by contract.
                data: t.bytes().as_ptr() as *mut u8,
                data_bytes: t.byte_len() as u64,
                dims: dims.as_ptr() as *mut u64,
                dims_count: dims.len() as u64,
                precision: t.precision() as u32,
            })
            .collect();

        let mut array: *mut CustomNodeTensor = ptr::null_mut();
        let mut count: c_int = 0;
        // SAFETY: every pointer in `raw_inputs` and `params` stays valid for
        // the duration of the call.
        let code = unsafe {
            (st.library.fns().execute)(
                raw_inputs.as_ptr(),
                raw_inputs.len() as c_int,
                &mut array,
                &mut count,
                params.as_ptr(),
                params.count(),
                st.raw_state(),
            )
        };
        if code != STATUS_OK {
            return Err(PluginError::Execute { node: st.node.clone(), code });
        }
        self.collect_outputs(array, count)
    }

    fn inputs_info(&self) -> Result<Vec<TensorSpec>> {
        self.query_info("getInputsInfo", self.inner.library.fns().get_inputs_info)
    }

    fn outputs_info(&self) -> Result<Vec<TensorSpec>> {
        self.query_info("getOutputsInfo", self.inner.library.fns().get_outputs_info)
    }

    fn reconfigure(&self, params: &BTreeMap<String, String>) -> Result<()> {
        let st = &self.inner;
        let block = Arc::new(ParamBlock::new(params)?);
        let current = st.raw_state();
        let mut slot = current;
        // SAFETY: a non-null slot asks the plugin to reconfigure in place.
        let code = unsafe { (st.library.fns().initialize)(&mut slot, block.as_ptr(), block.count()) };
        if code != STATUS_OK {
            return Err(PluginError::Initialize { library: st.library.name().to_string(), code });
        }
        if slot != current {
            // The old manager may still back in-flight buffers; it is left to the plugin.
            warn!(node = %st.node, "plugin replaced its internal manager on reconfigure");
            st.state.store(slot, Ordering::Release);
        }
        *st.params.write().unwrap_or_else(|e| e.into_inner()) = block;
        let keys: BTreeSet<&str> = params.keys().map(String::as_str).collect();
        info!(node = %st.node, ?keys, "plugin reconfigured");
        Ok(())
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("node", &self.inner.node)
            .field("library", &self.inner.library.name())
            .finish()
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        debug!(
            node = %self.inner.node,
            outstanding = Arc::strong_count(&self.inner) - 1,
            "plugin instance dropped"
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
