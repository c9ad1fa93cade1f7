//! The `extern "C"` surface called by synthesised IR.
//!
//! The rewriter hard-codes these symbol names into every constructor,
//! extended stub and trampoline it emits; the [`symbols`] module is the
//! single source of truth for both sides, so the pass and the runtime
//! cannot drift apart.
//!
//! Descriptor lists (struct elements, function arguments) are passed as a
//! count plus a pointer to a contiguous array of descriptor pointers; the
//! generated constructor builds that array on its stack.
//!
//! # Safety
//!
//! All pointer arguments originate in IR the pass generated: strings are
//! NUL-terminated private globals, descriptor pointers come from earlier
//! calls into this module, and the extension-point wiring references the
//! synthesised functions and globals themselves. Nothing here validates
//! beyond null checks that generated code cannot violate.

use std::ffi::{c_char, c_void, CStr};
use std::slice;

use crate::point::FnExtensionPoint;
use crate::types::TypeDesc;
use crate::{registry, ArgVals, RawFn, ReflectFn, RetVal};

/// Symbol names of every function in this module, as the rewriter emits
/// them.
pub mod symbols {
    pub const GET_UNKNOWN_TYPE: &str = "augmentum_get_unknown_type";
    pub const GET_VOID_TYPE: &str = "augmentum_get_void_type";
    pub const GET_I1_TYPE: &str = "augmentum_get_i1_type";
    pub const GET_I8_TYPE: &str = "augmentum_get_i8_type";
    pub const GET_I16_TYPE: &str = "augmentum_get_i16_type";
    pub const GET_I32_TYPE: &str = "augmentum_get_i32_type";
    pub const GET_I64_TYPE: &str = "augmentum_get_i64_type";
    pub const GET_FLOAT_TYPE: &str = "augmentum_get_float_type";
    pub const GET_DOUBLE_TYPE: &str = "augmentum_get_double_type";
    pub const GET_PTR_TYPE: &str = "augmentum_get_ptr_type";
    pub const GET_ARRAY_TYPE: &str = "augmentum_get_array_type";
    pub const GET_ANON_STRUCT_TYPE: &str = "augmentum_get_anon_struct_type";
    pub const GET_FORWARD_STRUCT_TYPE: &str = "augmentum_get_forward_struct_type";
    pub const SET_STRUCT_ELEM_TYPES: &str = "augmentum_set_struct_elem_types";
    pub const GET_FUNCTION_TYPE: &str = "augmentum_get_function_type";
    pub const CREATE_EXTENSION_POINT: &str = "augmentum_create_extension_point";
    pub const EVAL: &str = "augmentum_eval";
    pub const DEBUG_PRINT: &str = "augmentum_debug_print";
    pub const DEBUG_PRINT_ADDR: &str = "augmentum_debug_print_addr";

    /// IR name of the opaque struct type standing in for an extension
    /// point on the generated side.
    pub const STRUCT_EXTENSION_POINT: &str = "augmentum::FnExtensionPoint";
    /// IR name of the opaque struct type standing in for a type
    /// descriptor on the generated side.
    pub const STRUCT_TYPE_DESC: &str = "augmentum::TypeDesc";
}

/// # Safety
/// `s` must be a valid NUL-terminated string.
unsafe fn str_arg(s: *const c_char) -> String {
    CStr::from_ptr(s).to_string_lossy().into_owned()
}

/// # Safety
/// `p` must come from the interning tables (descriptors live until
/// process exit).
unsafe fn desc(p: *const TypeDesc) -> &'static TypeDesc {
    &*p
}

/// # Safety
/// `elems` must point to `num` descriptor pointers.
unsafe fn desc_slice(num: usize, elems: *const *const TypeDesc) -> Vec<&'static TypeDesc> {
    if num == 0 {
        return Vec::new();
    }
    slice::from_raw_parts(elems, num)
        .iter()
        .map(|&p| desc(p))
        .collect()
}

/// Print a message to standard out. Debugging aid for generated code.
#[no_mangle]
pub unsafe extern "C" fn augmentum_debug_print(message: *const c_char) {
    print!("{}", str_arg(message));
}

/// Print an address to standard out. Debugging aid for generated code.
#[no_mangle]
pub extern "C" fn augmentum_debug_print_addr(addr: *const c_void) {
    print!("{addr:p}");
}

#[no_mangle]
pub unsafe extern "C" fn augmentum_get_unknown_type(
    module: *const c_char,
    signature: *const c_char,
) -> *const TypeDesc {
    TypeDesc::unknown(&str_arg(module), &str_arg(signature))
}

#[no_mangle]
pub extern "C" fn augmentum_get_void_type() -> *const TypeDesc {
    TypeDesc::void()
}

#[no_mangle]
pub extern "C" fn augmentum_get_i1_type() -> *const TypeDesc {
    TypeDesc::int(1)
}

#[no_mangle]
pub extern "C" fn augmentum_get_i8_type() -> *const TypeDesc {
    TypeDesc::int(8)
}

#[no_mangle]
pub extern "C" fn augmentum_get_i16_type() -> *const TypeDesc {
    TypeDesc::int(16)
}

#[no_mangle]
pub extern "C" fn augmentum_get_i32_type() -> *const TypeDesc {
    TypeDesc::int(32)
}

#[no_mangle]
pub extern "C" fn augmentum_get_i64_type() -> *const TypeDesc {
    TypeDesc::int(64)
}

#[no_mangle]
pub extern "C" fn augmentum_get_float_type() -> *const TypeDesc {
    TypeDesc::float(32)
}

#[no_mangle]
pub extern "C" fn augmentum_get_double_type() -> *const TypeDesc {
    TypeDesc::float(64)
}

#[no_mangle]
pub unsafe extern "C" fn augmentum_get_ptr_type(element: *const TypeDesc) -> *const TypeDesc {
    desc(element).ptr()
}

#[no_mangle]
pub unsafe extern "C" fn augmentum_get_array_type(
    element: *const TypeDesc,
    num_elems: usize,
) -> *const TypeDesc {
    TypeDesc::array(desc(element), num_elems as u64)
}

#[no_mangle]
pub unsafe extern "C" fn augmentum_get_anon_struct_type(
    num_elems: usize,
    elem_types: *const *const TypeDesc,
) -> *const TypeDesc {
    TypeDesc::anon_struct(desc_slice(num_elems, elem_types))
}

#[no_mangle]
pub unsafe extern "C" fn augmentum_get_forward_struct_type(
    module: *const c_char,
    name: *const c_char,
) -> *const TypeDesc {
    TypeDesc::forward_struct(&str_arg(module), &str_arg(name))
}

#[no_mangle]
pub unsafe extern "C" fn augmentum_set_struct_elem_types(
    struct_type: *const TypeDesc,
    num_elems: usize,
    elem_types: *const *const TypeDesc,
) {
    desc(struct_type).set_elem_types(desc_slice(num_elems, elem_types));
}

#[no_mangle]
pub unsafe extern "C" fn augmentum_get_function_type(
    return_type: *const TypeDesc,
    num_args: usize,
    arg_types: *const *const TypeDesc,
) -> *const TypeDesc {
    TypeDesc::function(desc(return_type), desc_slice(num_args, arg_types))
}

/// Create and register the extension point for one rewritten function.
/// Called from the synthesised per-function constructor before `main`.
/// The registry keeps ownership; the returned pointer is stored in the
/// function's private extension-point global for use by the extended
/// stub.
#[no_mangle]
pub unsafe extern "C" fn augmentum_create_extension_point(
    module: *const c_char,
    name: *const c_char,
    fn_type: *const TypeDesc,
    fn_slot: *mut RawFn,
    original: RawFn,
    extended: RawFn,
    reflect: ReflectFn,
) -> *mut FnExtensionPoint {
    let point = Box::into_raw(Box::new(FnExtensionPoint::new(
        str_arg(module),
        str_arg(name),
        desc(fn_type),
        fn_slot,
        original,
        extended,
        reflect,
    )));
    registry::register(point);
    point
}

/// Evaluator entry point, reached exclusively through synthesised
/// extended stubs.
#[no_mangle]
pub unsafe extern "C" fn augmentum_eval(
    point: *mut FnExtensionPoint,
    ret_value: RetVal,
    arg_values: ArgVals,
) {
    (*point).eval(ret_value, arg_values);
}
