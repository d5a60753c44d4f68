//! The stable C ABI between the engine and custom node libraries.
//!
//! A library exports six symbols with the signatures below. Every entry
//! point returns `0` on success.
//!
//! Ownership rules:
//! - Input tensors passed to `execute` are owned by the engine and are
//!   read-only for the duration of the call.
//! - On success `execute` hands over a plugin-allocated array of output
//!   tensors. The array, every `dims` array and every `data` buffer are
//!   returned to the plugin through `release`. `name` strings are never
//!   released; they must stay valid for the lifetime of the library.
//! - On failure the plugin frees everything it allocated before returning.
//! - `getInputsInfo`/`getOutputsInfo` hand over an info array and its `dims`
//!   arrays, released the same way. A `0` dimension in an info means "any".

use std::os::raw::{c_char, c_int, c_void};

/// Status code every entry point returns on success.
pub const STATUS_OK: c_int = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CustomNodeTensor {
    pub name: *const c_char,
    pub data: *mut u8,
    pub data_bytes: u64,
    pub dims: *mut u64,
    pub dims_count: u64,
    /// [`pipeflow_types::Precision`] discriminant.
    pub precision: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CustomNodeTensorInfo {
    pub name: *const c_char,
    pub dims: *mut u64,
    pub dims_count: u64,
    pub precision: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CustomNodeParam {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// `state` points at the state slot. A null slot asks for a fresh internal
/// manager; a non-null slot asks the plugin to reconfigure it in place.
pub type InitializeFn = unsafe extern "C" fn(
    state: *mut *mut c_void,
    params: *const CustomNodeParam,
    params_count: c_int,
) -> c_int;

pub type DeinitializeFn = unsafe extern "C" fn(state: *mut c_void) -> c_int;

pub type ExecuteFn = unsafe extern "C" fn(
    inputs: *const CustomNodeTensor,
    inputs_count: c_int,
    outputs: *mut *mut CustomNodeTensor,
    outputs_count: *mut c_int,
    params: *const CustomNodeParam,
    params_count: c_int,
    state: *mut c_void,
) -> c_int;

pub type TensorInfoFn = unsafe extern "C" fn(
    info: *mut *mut CustomNodeTensorInfo,
    info_count: *mut c_int,
    params: *const CustomNodeParam,
    params_count: c_int,
    state: *mut c_void,
) -> c_int;

pub type ReleaseFn = unsafe extern "C" fn(ptr: *mut c_void, state: *mut c_void) -> c_int;

/// Exported symbol names.
pub const SYM_INITIALIZE: &[u8] = b"initialize";
pub const SYM_DEINITIALIZE: &[u8] = b"deinitialize";
pub const SYM_EXECUTE: &[u8] = b"execute";
pub const SYM_GET_INPUTS_INFO: &[u8] = b"getInputsInfo";
pub const SYM_GET_OUTPUTS_INFO: &[u8] = b"getOutputsInfo";
pub const SYM_RELEASE: &[u8] = b"release";
