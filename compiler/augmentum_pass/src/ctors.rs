//! `llvm.global_ctors` maintenance.
//!
//! Every rewritten function contributes one registration constructor;
//! the pass collects them and appends them here in a single batch,
//! keeping any constructors the module already had. inkwell has no
//! wrapper for editing the appending-linkage ctor array, so the constant
//! surgery goes through `llvm-sys`.

use std::ffi::CString;

use inkwell::module::Module;
use inkwell::values::{AsValueRef, FunctionValue};
use llvm_sys::core::{
    LLVMAddGlobal, LLVMArrayType, LLVMConstArray, LLVMGetNumOperands, LLVMGetOperand,
    LLVMSetInitializer, LLVMSetLinkage, LLVMTypeOf,
};
use llvm_sys::prelude::LLVMValueRef;
use llvm_sys::LLVMLinkage;

const GLOBAL_CTORS: &str = "llvm.global_ctors";

/// Append `ctors` (each `void()`) to the module's constructor list with
/// priority 0, preserving pre-existing entries.
pub(crate) fn append_to_global_ctors<'ctx>(
    module: &Module<'ctx>,
    ctors: &[FunctionValue<'ctx>],
) {
    if ctors.is_empty() {
        return;
    }
    let ctx = module.get_context();
    let i32_ty = ctx.i32_type();
    let i8_ptr_ty = ctx.i8_type().ptr_type(inkwell::AddressSpace::default());

    // Entries are { i32 priority, void()* ctor, i8* associated-data }.
    let mut entries: Vec<LLVMValueRef> = Vec::new();

    if let Some(existing) = module.get_global(GLOBAL_CTORS) {
        if let Some(init) = existing.get_initializer() {
            let init_ref = init.as_value_ref();
            // SAFETY: the initializer is a constant array; its operands
            // are the existing entries.
            let count = unsafe { LLVMGetNumOperands(init_ref) };
            for index in 0..count {
                entries.push(unsafe { LLVMGetOperand(init_ref, index as u32) });
            }
        }
        // SAFETY: the global is re-created below under the same name.
        unsafe { existing.delete() };
    }

    for ctor in ctors {
        let entry = ctx.const_struct(
            &[
                i32_ty.const_zero().into(),
                ctor.as_global_value().as_pointer_value().into(),
                i8_ptr_ty.const_null().into(),
            ],
            false,
        );
        entries.push(entry.as_value_ref());
    }

    let name = CString::new(GLOBAL_CTORS).expect("static name");
    // SAFETY: all entry values share the structural entry type; the
    // module owns the new global.
    unsafe {
        let entry_ty = LLVMTypeOf(entries[0]);
        let array = LLVMConstArray(entry_ty, entries.as_mut_ptr(), entries.len() as u32);
        let array_ty = LLVMArrayType(entry_ty, entries.len() as u32);
        let global = LLVMAddGlobal(module.as_mut_ptr(), array_ty, name.as_ptr());
        LLVMSetInitializer(global, array);
        LLVMSetLinkage(global, LLVMLinkage::LLVMAppendingLinkage);
    }
}
