//! End-to-end rewriting tests.

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::context::Context;
use inkwell::module::Linkage;
use inkwell::types::AnyType;
use inkwell::values::AnyValue;
use inkwell::AddressSpace;

use crate::config::PassOptions;
use crate::pass::{can_be_instrumented, AugmentumPass, CanInstrument};
use crate::tests::{define_add, printed};
use crate::utils::count_instructions;

#[test]
fn test_instrumenting_add_synthesises_all_artefacts() {
    let context = Context::create();
    let module = context.create_module("src/add.c");
    define_add(&context, &module);

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    // The five artefacts.
    let entry = module.get_function("add").expect("entry");
    let original = module
        .get_function("augmentum::add__original__")
        .expect("preserved body");
    let reflect = module
        .get_function("augmentum::add__reflect__")
        .expect("reflective trampoline");
    let extended = module
        .get_function("augmentum::add__extended__")
        .expect("extended stub");
    let ctor = module
        .get_function("augmentum::add__init__")
        .expect("constructor");

    // Linkage: the entry keeps the target's linkage, everything
    // synthesised is private.
    assert_eq!(entry.get_linkage(), Linkage::External);
    for synthesised in [original, reflect, extended, ctor] {
        assert_eq!(synthesised.get_linkage(), Linkage::Private);
    }

    // The preserved body still computes the sum; the entry is the
    // minimal load + tail call + ret trampoline.
    assert_eq!(count_instructions(original), 2);
    assert_eq!(entry.count_basic_blocks(), 1);
    assert_eq!(count_instructions(entry), 3);

    // Globals: dispatch slot, extension-point slot, constructor array,
    // string constants.
    assert!(module.get_global("augmentum::add__fn_ptr__").is_some());
    assert!(module
        .get_global("augmentum::add__extension_point_ptr__")
        .is_some());
    assert!(module.get_global("llvm.global_ctors").is_some());
    assert!(module.get_global("augmentum::module__name__").is_some());
    assert!(module.get_global("augmentum::add__name__").is_some());

    // Runtime surface referenced by the synthesised code.
    for symbol in [
        "augmentum_eval",
        "augmentum_create_extension_point",
        "augmentum_get_i32_type",
        "augmentum_get_function_type",
    ] {
        let runtime_fn = module.get_function(symbol).expect(symbol);
        assert_eq!(runtime_fn.count_basic_blocks(), 0, "declaration only");
    }

    module.verify().expect("valid module");
}

#[test]
fn test_entry_dispatches_through_fn_ptr() {
    let context = Context::create();
    let module = context.create_module("src/add.c");
    define_add(&context, &module);

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    let entry = module.get_function("add").expect("entry");
    let ir = entry.print_to_string().to_string();
    assert!(ir.contains("augmentum::add__fn_ptr__"), "loads the slot");
    assert!(ir.contains("tail call"), "dispatch is a tail call");
}

#[test]
fn test_declarations_and_varargs_are_not_rewritten() {
    let context = Context::create();
    let module = context.create_module("src/ext.c");
    let i32_t = context.i32_type();

    // Declaration: no body to preserve.
    let declared = module.add_function("declared", i32_t.fn_type(&[], false), None);
    assert_eq!(can_be_instrumented(declared), CanInstrument::NotDefinition);

    // Variadic definition.
    let variadic = module.add_function("variadic", i32_t.fn_type(&[i32_t.into()], true), None);
    let block = context.append_basic_block(variadic, "entry");
    let builder = context.create_builder();
    builder.position_at_end(block);
    builder.build_return(Some(&i32_t.const_zero())).unwrap();
    assert_eq!(can_be_instrumented(variadic), CanInstrument::NotVarArgs);

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(!pass.run_on_module(&module), "nothing eligible");
    assert!(module.get_function("augmentum::declared__original__").is_none());
    assert!(module.get_function("augmentum::variadic__original__").is_none());
    assert!(module.get_global("llvm.global_ctors").is_none());
}

#[test]
fn test_recursive_calls_dispatch_through_entry() {
    let context = Context::create();
    let module = context.create_module("src/fact.c");
    let i32_t = context.i32_type();
    let fn_type = i32_t.fn_type(&[i32_t.into()], false);
    let fact = module.add_function("fact", fn_type, None);

    // fact(n) = n == 0 ? 1 : n * fact(n - 1)
    let entry = context.append_basic_block(fact, "entry");
    let base = context.append_basic_block(fact, "base");
    let recurse = context.append_basic_block(fact, "recurse");
    let builder = context.create_builder();
    builder.position_at_end(entry);
    let n = fact.get_nth_param(0).unwrap().into_int_value();
    let is_zero = builder
        .build_int_compare(inkwell::IntPredicate::EQ, n, i32_t.const_zero(), "is_zero")
        .unwrap();
    builder.build_conditional_branch(is_zero, base, recurse).unwrap();
    builder.position_at_end(base);
    builder.build_return(Some(&i32_t.const_int(1, false))).unwrap();
    builder.position_at_end(recurse);
    let n_minus_1 = builder
        .build_int_sub(n, i32_t.const_int(1, false), "n1")
        .unwrap();
    let inner = builder
        .build_call(fact, &[n_minus_1.into()], "inner")
        .unwrap()
        .try_as_basic_value()
        .left()
        .unwrap()
        .into_int_value();
    let product = builder.build_int_mul(n, inner, "product").unwrap();
    builder.build_return(Some(&product)).unwrap();

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    // The preserved body's self-call was redirected to the public entry,
    // so recursion re-enters the dispatch pointer.
    let original = module
        .get_function("augmentum::fact__original__")
        .expect("preserved body");
    let body = original.print_to_string().to_string();
    assert!(body.contains("call i32 @fact("), "recurses via the entry");

    module.verify().expect("valid module");
}

#[test]
fn test_byval_aggregate_marshalling() {
    let context = Context::create();
    let module = context.create_module("src/byval.c");

    let pair = context.opaque_struct_type("pair");
    pair.set_body(
        &[context.i64_type().into(), context.f64_type().into()],
        false,
    );
    let pair_ptr = pair.ptr_type(AddressSpace::default());
    let i32_t = context.i32_type();
    let fn_type = context
        .void_type()
        .fn_type(&[i32_t.into(), pair_ptr.into()], false);
    let function = module.add_function("consume", fn_type, None);
    let byval = context.create_type_attribute(
        Attribute::get_named_enum_kind_id("byval"),
        pair.as_any_type_enum(),
    );
    function.add_attribute(AttributeLoc::Param(1), byval);
    let block = context.append_basic_block(function, "entry");
    let builder = context.create_builder();
    builder.position_at_end(block);
    builder.build_return(None).unwrap();

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    // The reflective trampoline loads scalar slots twice but the byval
    // slot once: the slot entry is already the aggregate's address.
    let reflect = module
        .get_function("augmentum::consume__reflect__")
        .expect("trampoline");
    let reflect_ir = reflect.print_to_string().to_string();
    assert!(reflect_ir.contains("arg0PPT"), "scalar goes through T**");
    assert!(!reflect_ir.contains("arg1PPT"), "byval skips one load");
    assert!(reflect_ir.contains("arg1PT"));

    // The extended stub spills the scalar but passes the aggregate's
    // incoming address straight through.
    let extended = module
        .get_function("augmentum::consume__extended__")
        .expect("stub");
    let extended_ir = extended.print_to_string().to_string();
    assert!(extended_ir.contains("arg_alloc0"));
    assert!(!extended_ir.contains("arg_alloc1"));

    // The attribute survives on the entry's dispatch call.
    let entry = module.get_function("consume").expect("entry");
    let entry_ir = entry.print_to_string().to_string();
    assert!(entry_ir.contains("byval"));

    module.verify().expect("valid module");
}

#[test]
fn test_dry_run_transforms_nothing_but_records_stats() {
    let context = Context::create();
    let module = context.create_module("src/survey.c");
    define_add(&context, &module);
    module.add_function("declared", context.i32_type().fn_type(&[], false), None);

    let dir = tempfile::tempdir().expect("temp dir");
    let options = PassOptions {
        dry_run: true,
        stats_output: Some(dir.path().to_path_buf()),
        ..PassOptions::default()
    };
    let mut pass = AugmentumPass::new(options);
    assert!(!pass.run_on_module(&module));

    assert!(module.get_function("augmentum::add__original__").is_none());
    assert!(module.get_global("llvm.global_ctors").is_none());

    let stats = std::fs::read_to_string(dir.path().join("src_survey_c_function_stats.csv"))
        .expect("stats emitted");
    assert!(stats.contains("\"add\""));
    assert!(stats.contains("\"instrument\""), "definition can be instrumented");
    assert!(stats.contains("\"not_decl\""), "declaration cannot");
    assert!(stats.contains("@$ i32, i32, i32 $@"), "full stats serialise types");
}

#[test]
fn test_emit_transformed_ir() {
    let context = Context::create();
    let module = context.create_module("src/add.c");
    define_add(&context, &module);

    let dir = tempfile::tempdir().expect("temp dir");
    let options = PassOptions {
        emit_ir: Some(dir.path().to_path_buf()),
        ..PassOptions::default()
    };
    let mut pass = AugmentumPass::new(options);
    assert!(pass.run_on_module(&module));

    let emitted = std::fs::read_to_string(dir.path().join("src_add.c.ll")).expect("emitted IR");
    assert!(emitted.contains("augmentum::add__original__"));
}

#[test]
fn test_targeted_options_wire_up_the_predicate() {
    use std::io::Write;

    let mut targets = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(targets, "MODULE;FNAME").expect("write");
    writeln!(targets, "src/add.c;add").expect("write");
    targets.flush().expect("flush");

    let context = Context::create();
    let module = context.create_module("src/add.c");
    define_add(&context, &module);
    // A second eligible function that is not targeted.
    let i32_t = context.i32_type();
    let other = module.add_function("other", i32_t.fn_type(&[], false), None);
    let block = context.append_basic_block(other, "entry");
    let builder = context.create_builder();
    builder.position_at_end(block);
    builder.build_return(Some(&i32_t.const_zero())).unwrap();

    let (options, rest) = PassOptions::from_args(vec![format!(
        "--target-functions={}",
        targets.path().display()
    )]);
    assert!(rest.is_empty());
    let mut pass = AugmentumPass::new(options);
    assert!(pass.run_on_module(&module));

    assert!(module.get_function("augmentum::add__original__").is_some());
    assert!(module.get_function("augmentum::other__original__").is_none());
    module.verify().expect("valid module");
}

#[test]
fn test_instrumented_module_ir_smoke() {
    let context = Context::create();
    let module = context.create_module("src/add.c");
    define_add(&context, &module);

    let mut pass = AugmentumPass::new(PassOptions::default());
    assert!(pass.run_on_module(&module));

    let ir = printed(&module);
    assert!(ir.contains("@\"augmentum::add__fn_ptr__\""));
    assert!(ir.contains("llvm.global_ctors"));
    assert!(ir.contains("declare"), "runtime symbols stay declarations");
}
