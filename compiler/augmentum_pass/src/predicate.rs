//! Should-instrument predicates.
//!
//! Eligibility (has a body, not variadic) is a hard gate checked by the
//! pass itself; everything here is the subjective filter layered on top.
//! Four strategies:
//!
//! - [`AlwaysInstrument`]: instrument everything eligible
//! - [`TargetedInstrument`]: instrument only modules/functions named in a
//!   record file
//! - [`HeuristicDetector`]: reject runtime/library plumbing and functions
//!   whose types cannot carry observable data
//! - [`CallbackInstrument`]: defer to an external callable (the embedding
//!   seam)
//!
//! Every strategy can also explain its decision with a textual tag for
//! the statistics sink.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::module::Module;
use inkwell::types::{AnyType, AnyTypeEnum, BasicTypeEnum, StructType};
use inkwell::values::FunctionValue;
use regex::Regex;
use rustc_hash::FxHashSet;
use tracing::{error, warn};

use crate::utils::type_to_string;

pub(crate) const DECISION_NA: &str = "NA";
pub(crate) const DECISION_INSTRUMENT: &str = "instrument";
const DECISION_NOT_MODULE: &str = "not_module";
const DECISION_NOT_FUN_MAIN: &str = "not_fun_main";
const DECISION_NOT_FUN_STD: &str = "not_fun_std";
const DECISION_NOT_FUN_C: &str = "not_fun_c";
const DECISION_NOT_FUN_DTOR: &str = "not_fun_dtor";
const DECISION_NOT_NO_INTERESTING_TYPES: &str = "not_no_interesting_types";
const DECISION_NOT_READONLY_FUNCTION: &str = "not_readonly_function";

const ENTRY_POINT_NAME: &str = "main";

/// Callback deciding whether to instrument modules and functions.
pub trait ShouldInstrument {
    /// Whether any function in `module` may be instrumented.
    fn module(&self, module: &Module) -> bool;

    /// Whether `function` should be instrumented.
    fn function(&self, function: FunctionValue) -> bool;

    /// Textual tag explaining the decision, for the statistics sink.
    fn decision_info(&self, module: &Module, function: FunctionValue) -> String {
        let _ = (module, function);
        DECISION_NA.to_owned()
    }
}

/// Instrument everything the eligibility gate lets through.
#[derive(Default)]
pub struct AlwaysInstrument;

impl ShouldInstrument for AlwaysInstrument {
    fn module(&self, _module: &Module) -> bool {
        true
    }

    fn function(&self, _function: FunctionValue) -> bool {
        true
    }
}

/// Instrument only the modules and mangled symbols listed in a record
/// file: one `module;function` pair per line, `;`-delimited, first line
/// is a header.
pub struct TargetedInstrument {
    target_modules: FxHashSet<String>,
    target_functions: FxHashSet<String>,
}

impl TargetedInstrument {
    /// Parse the record file. A missing file is a warning and yields a
    /// predicate that instruments nothing.
    #[must_use]
    pub fn new(target_spec: &Path) -> Self {
        let mut targets = TargetedInstrument {
            target_modules: FxHashSet::default(),
            target_functions: FxHashSet::default(),
        };
        targets.parse_targets(target_spec);
        targets
    }

    fn parse_targets(&mut self, target_spec: &Path) {
        if !target_spec.exists() {
            warn!(
                path = %target_spec.display(),
                "[augmentum] specified target function file not found"
            );
            return;
        }
        match fs::read_to_string(target_spec) {
            Ok(contents) => {
                for line in contents.lines().skip(1) {
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() {
                        continue;
                    }
                    let mut columns = line.split(';');
                    if let Some(module) = columns.next() {
                        self.target_modules.insert(module.to_owned());
                    }
                    if let Some(function) = columns.next() {
                        self.target_functions.insert(function.to_owned());
                    }
                }
            }
            Err(err) => {
                error!(
                    path = %target_spec.display(),
                    %err,
                    "[augmentum] opening input stream to read target functions failed"
                );
            }
        }
    }

    /// Build directly from pre-computed target sets.
    #[must_use]
    pub fn from_lists(modules: FxHashSet<String>, functions: FxHashSet<String>) -> Self {
        TargetedInstrument {
            target_modules: modules,
            target_functions: functions,
        }
    }
}

impl ShouldInstrument for TargetedInstrument {
    fn module(&self, module: &Module) -> bool {
        self.target_modules
            .contains(&module.get_name().to_string_lossy().into_owned())
    }

    fn function(&self, function: FunctionValue) -> bool {
        self.target_functions
            .contains(&function.get_name().to_string_lossy().into_owned())
    }
}

/// Defer to an external callable; used when an embedding supplies the
/// decision (for instance a script loaded by the driver).
pub struct CallbackInstrument {
    module_callback: Box<dyn Fn(&Module) -> bool>,
    function_callback: Box<dyn Fn(FunctionValue) -> bool>,
}

impl CallbackInstrument {
    /// Wrap module- and function-level callables.
    #[must_use]
    pub fn new(
        module_callback: Box<dyn Fn(&Module) -> bool>,
        function_callback: Box<dyn Fn(FunctionValue) -> bool>,
    ) -> Self {
        CallbackInstrument {
            module_callback,
            function_callback,
        }
    }
}

impl ShouldInstrument for CallbackInstrument {
    fn module(&self, module: &Module) -> bool {
        (self.module_callback)(module)
    }

    fn function(&self, function: FunctionValue) -> bool {
        (self.function_callback)(function)
    }
}

/// A decision plus the tag explaining it.
pub struct InstrDecision {
    pub instrument: bool,
    pub tag: &'static str,
}

/// Heuristic filter: skip the entry point, standard-library and unmangled
/// symbols, destructors, functions with no interesting types, and
/// read-only void functions (they cannot observably carry data out).
#[derive(Default)]
pub struct HeuristicDetector {
    /// Element-type signatures never worth instrumenting.
    type_deny_list: FxHashSet<String>,
    /// Element-type signatures always worth instrumenting.
    type_allow_list: FxHashSet<String>,
}

fn std_namespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Itanium mangling prefixes of the std and GNU C++ namespaces.
    RE.get_or_init(|| {
        Regex::new(r"^_Z+(St|NS|NKSt|NVKS|NVS|N9__gnu_cxx)").expect("static regex")
    })
}

fn destructor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(_ZN)(.*)(D[0,1,2]Ev)$").expect("static regex"))
}

fn readonly_kind_id() -> u32 {
    Attribute::get_named_enum_kind_id("readonly")
}

fn has_enum_attribute(function: FunctionValue, loc: AttributeLoc, kind_id: u32) -> bool {
    function
        .attributes(loc)
        .iter()
        .any(|attr| attr.is_enum() && attr.get_enum_kind_id() == kind_id)
}

/// Whether any struct element is a scalar worth observing.
fn has_scalar_elements(struct_type: StructType) -> bool {
    struct_type.get_field_types().iter().any(|field| {
        if field.is_int_type() {
            return true;
        }
        if field.is_float_type() {
            let printed = type_to_string(field.as_any_type_enum());
            return printed == "float" || printed == "double";
        }
        false
    })
}

impl HeuristicDetector {
    /// All modules pass; the interesting filtering is per function.
    #[must_use]
    pub fn module_decision(&self, _module: &Module) -> InstrDecision {
        InstrDecision {
            instrument: true,
            tag: DECISION_INSTRUMENT,
        }
    }

    /// Apply the rejection chain in order and report the first reason.
    #[must_use]
    pub fn function_decision(&self, function: FunctionValue) -> InstrDecision {
        let name = function.get_name().to_string_lossy().into_owned();

        if name == ENTRY_POINT_NAME {
            return InstrDecision {
                instrument: false,
                tag: DECISION_NOT_FUN_MAIN,
            };
        }
        if std_namespace_regex().is_match(&name) {
            return InstrDecision {
                instrument: false,
                tag: DECISION_NOT_FUN_STD,
            };
        }
        // Unmangled symbols are assumed to be C runtime or library code.
        if !name.starts_with("_Z") {
            return InstrDecision {
                instrument: false,
                tag: DECISION_NOT_FUN_C,
            };
        }
        if destructor_regex().is_match(&name) {
            return InstrDecision {
                instrument: false,
                tag: DECISION_NOT_FUN_DTOR,
            };
        }
        if !self.has_interesting_types(function) {
            return InstrDecision {
                instrument: false,
                tag: DECISION_NOT_NO_INTERESTING_TYPES,
            };
        }
        if is_readonly_void_function(function) {
            return InstrDecision {
                instrument: false,
                tag: DECISION_NOT_READONLY_FUNCTION,
            };
        }
        InstrDecision {
            instrument: true,
            tag: DECISION_INSTRUMENT,
        }
    }

    /// Whether the return type or any parameter type is interesting.
    fn has_interesting_types(&self, function: FunctionValue) -> bool {
        let fn_type = function.get_type();
        let return_interesting = match fn_type.get_return_type() {
            Some(ret) => self.is_interesting_type(ret.as_any_type_enum(), true, false),
            None => false,
        };
        if return_interesting {
            return true;
        }
        let readonly = readonly_kind_id();
        fn_type
            .get_param_types()
            .iter()
            .enumerate()
            .any(|(index, param)| {
                let Ok(param) = BasicTypeEnum::try_from(*param) else {
                    return false;
                };
                let is_readonly =
                    has_enum_attribute(function, AttributeLoc::Param(index as u32), readonly);
                self.is_interesting_type(param.as_any_type_enum(), false, is_readonly)
            })
    }

    /// A return type is interesting when it is a scalar that is not
    /// hidden behind a pointer; a parameter type is interesting when it
    /// is a writable pointer to such a scalar. Aggregates, function
    /// pointers and pointer-to-pointer shapes carry too little signal.
    fn is_interesting_type(&self, ty: AnyTypeEnum, is_return: bool, is_readonly: bool) -> bool {
        let is_ptr = ty.is_pointer_type();
        let element = if is_ptr {
            ty.into_pointer_type().get_element_type()
        } else {
            ty
        };
        let is_ptr_ptr = element.is_pointer_type();

        let element_name = type_to_string(element);
        let on_deny_list = self.type_deny_list.contains(&element_name);
        let on_allow_list = self.type_allow_list.contains(&element_name);

        let (is_named_struct, unnamed_with_scalars) = if element.is_struct_type() {
            let struct_type = element.into_struct_type();
            let named = struct_type.get_name().is_some();
            (named, !named && has_scalar_elements(struct_type))
        } else {
            (false, false)
        };

        let is_function = element.is_function_type();
        let is_array = element.is_array_type();
        let is_vector = element.is_vector_type();

        if is_return {
            let is_void = ty.is_void_type();
            on_allow_list
                || (!is_void
                    && !is_ptr_ptr
                    && !on_deny_list
                    && !is_named_struct
                    && !unnamed_with_scalars
                    && !is_ptr
                    && !is_function
                    && !is_array
                    && !is_vector)
        } else {
            is_ptr
                && (on_allow_list
                    || (!is_readonly
                        && !is_ptr_ptr
                        && !on_deny_list
                        && !is_named_struct
                        && !unnamed_with_scalars
                        && !is_function
                        && !is_array
                        && !is_vector))
        }
    }
}

/// A void function marked read-only cannot write out through its pointer
/// parameters, so nothing it does is observable to advice.
fn is_readonly_void_function(function: FunctionValue) -> bool {
    function.get_type().get_return_type().is_none()
        && has_enum_attribute(function, AttributeLoc::Function, readonly_kind_id())
}

impl ShouldInstrument for HeuristicDetector {
    fn module(&self, module: &Module) -> bool {
        self.module_decision(module).instrument
    }

    fn function(&self, function: FunctionValue) -> bool {
        self.function_decision(function).instrument
    }

    fn decision_info(&self, module: &Module, function: FunctionValue) -> String {
        let module_decision = self.module_decision(module);
        if !module_decision.instrument {
            return DECISION_NOT_MODULE.to_owned();
        }
        self.function_decision(function).tag.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;
    use std::io::Write;

    fn define_fn<'ctx>(
        context: &'ctx Context,
        module: &Module<'ctx>,
        name: &str,
        fn_type: inkwell::types::FunctionType<'ctx>,
    ) -> FunctionValue<'ctx> {
        let function = module.add_function(name, fn_type, None);
        let entry = context.append_basic_block(function, "entry");
        let builder = context.create_builder();
        builder.position_at_end(entry);
        match fn_type.get_return_type() {
            Some(inkwell::types::BasicTypeEnum::IntType(int)) => {
                builder.build_return(Some(&int.const_zero())).expect("ret")
            }
            Some(other) => panic!("unsupported return type in test helper: {other:?}"),
            None => builder.build_return(None).expect("ret"),
        };
        function
    }

    #[test]
    fn test_targeted_instrument_parses_record_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "MODULE;FNAME").expect("write");
        writeln!(file, "src/alpha.c;_Z5alphav").expect("write");
        writeln!(file, "src/beta.c;_Z4betai\r").expect("write");
        file.flush().expect("flush");

        let targets = TargetedInstrument::new(file.path());

        let context = Context::create();
        let module = context.create_module("src/alpha.c");
        let other = context.create_module("src/gamma.c");
        assert!(targets.module(&module));
        assert!(!targets.module(&other));

        let void_fn = context.void_type().fn_type(&[], false);
        let alpha = define_fn(&context, &module, "_Z5alphav", void_fn);
        let beta = define_fn(&context, &module, "_Z4betai", void_fn);
        let gamma = define_fn(&context, &module, "_Z5gammav", void_fn);
        assert!(targets.function(alpha));
        assert!(targets.function(beta), "carriage return stripped");
        assert!(!targets.function(gamma));
    }

    #[test]
    fn test_targeted_instrument_missing_file_matches_nothing() {
        let targets = TargetedInstrument::new(Path::new("/nonexistent/targets.csv"));
        let context = Context::create();
        let module = context.create_module("m.c");
        assert!(!targets.module(&module));
    }

    #[test]
    fn test_heuristic_name_rejections() {
        let context = Context::create();
        let module = context.create_module("m.c");
        let detector = HeuristicDetector::default();

        let i32_t = context.i32_type();
        let scalar_fn = i32_t.fn_type(&[i32_t.into(), i32_t.into()], false);
        let void_fn = context.void_type().fn_type(&[], false);

        let main_fn = define_fn(&context, &module, "main", scalar_fn);
        assert_eq!(detector.function_decision(main_fn).tag, "not_fun_main");

        let std_fn = define_fn(&context, &module, "_ZSt4fillv", scalar_fn);
        assert_eq!(detector.function_decision(std_fn).tag, "not_fun_std");

        let c_fn = define_fn(&context, &module, "memcpy_like", scalar_fn);
        assert_eq!(detector.function_decision(c_fn).tag, "not_fun_c");

        let dtor = define_fn(&context, &module, "_ZN3FooD1Ev", void_fn);
        assert_eq!(detector.function_decision(dtor).tag, "not_fun_dtor");
    }

    #[test]
    fn test_heuristic_type_decisions() {
        let context = Context::create();
        let module = context.create_module("m.c");
        let detector = HeuristicDetector::default();
        let i32_t = context.i32_type();

        // Scalar return: interesting.
        let scalar_fn = i32_t.fn_type(&[i32_t.into(), i32_t.into()], false);
        let add = define_fn(&context, &module, "_Z3addii", scalar_fn);
        assert_eq!(detector.function_decision(add).tag, "instrument");

        // Void return, no pointer parameters: nothing to observe.
        let void_fn = context.void_type().fn_type(&[i32_t.into()], false);
        let sink = define_fn(&context, &module, "_Z4sinki", void_fn);
        assert_eq!(
            detector.function_decision(sink).tag,
            "not_no_interesting_types"
        );

        // Writable pointer-to-scalar parameter: interesting even when
        // the return type is void.
        let i32_ptr = i32_t.ptr_type(inkwell::AddressSpace::default());
        let out_fn = context.void_type().fn_type(&[i32_ptr.into()], false);
        let fill = define_fn(&context, &module, "_Z4fillPi", out_fn);
        assert_eq!(detector.function_decision(fill).tag, "instrument");

        // Pointer-to-pointer parameter carries no usable signal.
        let i32_ptr_ptr = i32_ptr.ptr_type(inkwell::AddressSpace::default());
        let pp_fn = context.void_type().fn_type(&[i32_ptr_ptr.into()], false);
        let indirect = define_fn(&context, &module, "_Z8indirectPPi", pp_fn);
        assert_eq!(
            detector.function_decision(indirect).tag,
            "not_no_interesting_types"
        );
    }

    #[test]
    fn test_heuristic_readonly_void_function() {
        let context = Context::create();
        let module = context.create_module("m.c");
        let detector = HeuristicDetector::default();

        let i32_ptr = context.i32_type().ptr_type(inkwell::AddressSpace::default());
        let fn_type = context.void_type().fn_type(&[i32_ptr.into()], false);
        let function = define_fn(&context, &module, "_Z4peekPi", fn_type);
        let readonly =
            context.create_enum_attribute(Attribute::get_named_enum_kind_id("readonly"), 0);
        function.add_attribute(AttributeLoc::Function, readonly);

        assert_eq!(
            detector.function_decision(function).tag,
            "not_readonly_function"
        );
    }

    #[test]
    fn test_decision_info_default_is_na() {
        let context = Context::create();
        let module = context.create_module("m.c");
        let function = define_fn(
            &context,
            &module,
            "f",
            context.void_type().fn_type(&[], false),
        );
        assert_eq!(AlwaysInstrument.decision_info(&module, function), "NA");
    }
}
