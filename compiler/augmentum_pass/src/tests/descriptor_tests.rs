//! Tests for the descriptor-construction code emitted into constructors.

use inkwell::context::Context;
use inkwell::values::AnyValue;
use inkwell::AddressSpace;

use crate::config::PassOptions;
use crate::pass::AugmentumPass;
use crate::tests::define_add;

fn ctor_ir(module: &inkwell::module::Module, name: &str) -> String {
    module
        .get_function(name)
        .expect("constructor")
        .print_to_string()
        .to_string()
}

#[test]
fn test_descriptors_are_emitted_once_per_distinct_type() {
    let context = Context::create();
    let module = context.create_module("src/add.c");
    define_add(&context, &module);

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    let ir = ctor_ir(&module, "augmentum::add__init__");
    // i32 appears three times in the signature but is interned once.
    assert_eq!(ir.matches("augmentum_get_i32_type").count(), 1);
    assert_eq!(ir.matches("augmentum_get_function_type").count(), 1);
    assert_eq!(ir.matches("augmentum_create_extension_point").count(), 1);
    module.verify().expect("valid module");
}

#[test]
fn test_recursive_struct_descriptor_terminates() {
    let context = Context::create();
    let module = context.create_module("src/list.c");

    // %Node = type { i32, %Node* }, used in both argument and return
    // position.
    let node = context.opaque_struct_type("Node");
    let node_ptr = node.ptr_type(AddressSpace::default());
    node.set_body(&[context.i32_type().into(), node_ptr.into()], false);

    let fn_type = node_ptr.fn_type(&[node_ptr.into()], false);
    let function = module.add_function("advance", fn_type, None);
    let block = context.append_basic_block(function, "entry");
    let builder = context.create_builder();
    builder.position_at_end(block);
    let param = function.get_nth_param(0).unwrap();
    builder.build_return(Some(&param)).unwrap();

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    let ir = ctor_ir(&module, "augmentum::advance__init__");
    // One forward declaration, completed once; the pointer descriptor is
    // shared between the struct element, the argument and the return.
    assert_eq!(ir.matches("augmentum_get_forward_struct_type").count(), 1);
    assert_eq!(ir.matches("augmentum_set_struct_elem_types").count(), 1);
    assert_eq!(ir.matches("augmentum_get_ptr_type").count(), 1);
    assert!(module.get_global("augmentum::struct__Node__").is_some());

    module.verify().expect("valid module");
}

#[test]
fn test_vector_parameter_degrades_to_unknown() {
    let context = Context::create();
    let module = context.create_module("src/simd.c");

    let vec4 = context.i32_type().vec_type(4);
    let fn_type = context.void_type().fn_type(&[vec4.into()], false);
    let function = module.add_function("blend", fn_type, None);
    let block = context.append_basic_block(function, "entry");
    let builder = context.create_builder();
    builder.position_at_end(block);
    builder.build_return(None).unwrap();

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    let ir = ctor_ir(&module, "augmentum::blend__init__");
    assert_eq!(ir.matches("augmentum_get_unknown_type").count(), 1);
    assert!(module
        .get_global("augmentum::unknown__<4 x i32>__")
        .is_some());

    module.verify().expect("valid module");
}

#[test]
fn test_anon_struct_and_array_descriptors() {
    let context = Context::create();
    let module = context.create_module("src/agg.c");

    let anon = context.struct_type(
        &[context.i64_type().into(), context.f64_type().into()],
        false,
    );
    let arr = context.i8_type().array_type(16);
    let fn_type = context
        .void_type()
        .fn_type(&[anon.into(), arr.into()], false);
    let function = module.add_function("mix", fn_type, None);
    let block = context.append_basic_block(function, "entry");
    let builder = context.create_builder();
    builder.position_at_end(block);
    builder.build_return(None).unwrap();

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    let ir = ctor_ir(&module, "augmentum::mix__init__");
    assert_eq!(ir.matches("augmentum_get_anon_struct_type").count(), 1);
    assert_eq!(ir.matches("augmentum_get_array_type").count(), 1);
    assert_eq!(ir.matches("augmentum_get_i64_type").count(), 1);
    assert_eq!(ir.matches("augmentum_get_double_type").count(), 1);
    assert_eq!(ir.matches("augmentum_get_i8_type").count(), 1);

    module.verify().expect("valid module");
}
