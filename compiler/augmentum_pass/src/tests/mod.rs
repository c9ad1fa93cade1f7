//! Pass-level tests: run the rewriter on constructed modules and check
//! the synthesised IR structurally.

mod descriptor_tests;
mod instrument_tests;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::FunctionValue;

/// `int add(int, int) { return a + b; }`
pub(crate) fn define_add<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
) -> FunctionValue<'ctx> {
    let i32_t = context.i32_type();
    let fn_type = i32_t.fn_type(&[i32_t.into(), i32_t.into()], false);
    let function = module.add_function("add", fn_type, None);
    let entry = context.append_basic_block(function, "entry");
    let builder = context.create_builder();
    builder.position_at_end(entry);
    let a = function.get_nth_param(0).unwrap().into_int_value();
    let b = function.get_nth_param(1).unwrap().into_int_value();
    let sum = builder.build_int_add(a, b, "sum").unwrap();
    builder.build_return(Some(&sum)).unwrap();
    function
}

pub(crate) fn printed(module: &Module) -> String {
    module.print_to_string().to_string()
}
