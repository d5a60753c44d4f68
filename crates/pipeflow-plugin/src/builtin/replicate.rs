//! `replicate`: stacks `copies` copies of its `input` under a new leading
//! dimension, producing `replicated` with shape `[copies, ...input]`.
//!
//! Useful as the source of a dynamic demultiplexer; `copies = 0` yields an
//! empty batch. Any precision is accepted.

use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use std::ptr;

use super::support::{
    find_input, heap_dims, param_or, read_params, tensor_bytes, tensor_dims, write_info, Heap,
    STATUS_FAILED,
};
use crate::abi::{CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo, STATUS_OK};
use crate::library::{LibraryFns, NodeLibrary};

pub const LIBRARY_NAME: &str = "replicate";
pub const INPUT_NAME: &CStr = c"input";
pub const OUTPUT_NAME: &CStr = c"replicated";

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

struct Manager {
    copies: std::sync::RwLock<usize>,
    heap: Heap,
}

unsafe fn manager<'a>(state: *mut c_void) -> Option<&'a Manager> {
    (state as *const Manager).as_ref()
}

unsafe extern "C" fn initialize(
    state: *mut *mut c_void,
    params: *const CustomNodeParam,
    params_count: c_int,
) -> c_int {
    if state.is_null() {
        return STATUS_FAILED;
    }
    let Some(copies) = param_or(&read_params(params, params_count), "copies", 1usize) else {
        return STATUS_FAILED;
    };
    if let Some(existing) = manager(*state) {
        *existing.copies.write().unwrap_or_else(|e| e.into_inner()) = copies;
        return STATUS_OK;
    }
    let m = Box::new(Manager { copies: std::sync::RwLock::new(copies), heap: Heap::default() });
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
    let copies = *m.copies.read().unwrap_or_else(|e| e.into_inner());

    let bytes = tensor_bytes(input);
    let Some(total) = bytes.len().checked_mul(copies) else {
        return STATUS_FAILED;
    };
    let data = m.heap.alloc(total);
    if data.is_null() && total != 0 {
        return STATUS_FAILED;
    }
    if total != 0 {
        for i in 0..copies {
            ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(i * bytes.len()), bytes.len());
        }
    }

    let mut dims = vec![copies as u64];
    dims.extend_from_slice(tensor_dims(input));
    let dims_ptr = heap_dims(&m.heap, &dims);
    let array: *mut CustomNodeTensor = m.heap.alloc_array(1);
    if array.is_null() || dims_ptr.is_null() {
        m.heap.free(array.cast());
        m.heap.free(dims_ptr.cast());
        m.heap.free(data);
        return STATUS_FAILED;
    }
    array.write(CustomNodeTensor {
        name: OUTPUT_NAME.as_ptr(),
        data,
        data_bytes: total as u64,
        dims: dims_ptr,
        dims_count: dims.len() as u64,
        precision: input.precision,
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
    match manager(state) {
        Some(m) => write_info(&m.heap, info, info_count, &[(INPUT_NAME, &[0], 0)]),
        None => STATUS_FAILED,
    }
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
    let copies = *m.copies.read().unwrap_or_else(|e| e.into_inner()) as u64;
    write_info(&m.heap, info, info_count, &[(OUTPUT_NAME, &[copies, 0], 0)])
}

unsafe extern "C" fn release(p: *mut c_void, state: *mut c_void) -> c_int {
    match manager(state) {
        Some(m) if m.heap.free(p.cast()) => STATUS_OK,
        _ => STATUS_FAILED,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
