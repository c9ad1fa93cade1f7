//! Small IR helpers shared across the pass.

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::context::ContextRef;
use inkwell::module::{Linkage, Module};
use inkwell::types::AnyTypeEnum;
use inkwell::values::{AsValueRef, FunctionValue, GlobalValue};
use llvm_sys::core::{LLVMReplaceAllUsesWith, LLVMSetValueName2};

/// Print an IR type the way LLVM does.
pub(crate) fn type_to_string(ty: AnyTypeEnum) -> String {
    ty.print_to_string().to_string()
}

/// Demangle a symbol name for the statistics sink, or `"NA"` when the
/// symbol does not demangle.
pub(crate) fn demangle(name: &str) -> String {
    match rustc_demangle::try_demangle(name) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => "NA".to_owned(),
    }
}

/// Number of instructions in a function body, before any rewriting.
pub(crate) fn count_instructions(function: FunctionValue) -> usize {
    let mut count = 0;
    for block in function.get_basic_blocks() {
        let mut inst = block.get_first_instruction();
        while let Some(current) = inst {
            count += 1;
            inst = current.get_next_instruction();
        }
    }
    count
}

/// `augmentum::<mid>__<suffix>__`, the namespace every synthesised global
/// lives in.
pub(crate) fn global_name(mid: &str, suffix: &str) -> String {
    format!("augmentum::{mid}__{suffix}__")
}

/// The `byval` attribute of parameter `index`, if the function carries
/// one. By-value aggregate passing changes the marshalling contract, so
/// the rewriter records this per argument.
pub(crate) fn byval_attribute(function: FunctionValue, index: u32) -> Option<Attribute> {
    let kind_id = Attribute::get_named_enum_kind_id("byval");
    function
        .attributes(AttributeLoc::Param(index))
        .into_iter()
        .find(|attr| (attr.is_enum() || attr.is_type()) && attr.get_enum_kind_id() == kind_id)
}

/// Rename any IR value. inkwell exposes renaming only for instructions,
/// so this goes through `llvm-sys` directly.
pub(crate) fn rename_value(value: &impl AsValueRef, name: &str) {
    // SAFETY: the value is live and the name buffer is passed with its
    // explicit length.
    unsafe { LLVMSetValueName2(value.as_value_ref(), name.as_ptr().cast(), name.len()) }
}

/// Redirect every use of `old` to `new`. Both must have the same type.
pub(crate) fn replace_all_uses(old: &impl AsValueRef, new: &impl AsValueRef) {
    // SAFETY: both values are live members of the same context.
    unsafe { LLVMReplaceAllUsesWith(old.as_value_ref(), new.as_value_ref()) }
}

/// Get or create a private constant NUL-terminated string global.
/// Reusing the global name keeps one copy per module, however many
/// functions reference it.
pub(crate) fn cstring_global<'ctx>(
    module: &Module<'ctx>,
    ctx: ContextRef<'ctx>,
    global_id: &str,
    value: &str,
) -> GlobalValue<'ctx> {
    if let Some(existing) = module.get_global(global_id) {
        return existing;
    }
    let data = ctx.const_string(value.as_bytes(), true);
    let global = module.add_global(data.get_type(), None, global_id);
    global.set_linkage(Linkage::Private);
    global.set_constant(true);
    global.set_initializer(&data);
    global
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_name_shape() {
        assert_eq!(global_name("add", "original"), "augmentum::add__original__");
        assert_eq!(global_name("module", "name"), "augmentum::module__name__");
    }

    #[test]
    fn test_demangle_falls_back_to_na() {
        assert_eq!(demangle("_Z3addii"), "NA");
        assert_eq!(demangle("plain_c_symbol"), "NA");
    }
}
