//! The module pass.
//!
//! Walks a module, filters functions through the eligibility gate and
//! the configured predicate, runs the per-function rewriter on each
//! survivor, and registers the synthesised constructors. In dry-run
//! mode nothing is transformed; instead a comprehensive statistics
//! survey of every function is recorded. Either way, statistics are
//! appended to the configured sink directory and transformed modules
//! can be emitted as textual IR.

use std::path::Path;

use inkwell::module::Module;
use inkwell::values::FunctionValue;
use tracing::{debug, error, info};

use crate::config::PassOptions;
use crate::ctors::append_to_global_ctors;
use crate::predicate::{AlwaysInstrument, ShouldInstrument, TargetedInstrument};
use crate::rewrite::{FunctionRewriter, ModuleTypes};
use crate::stats::{InstrumentationStats, INSTRUMENTATION_INFO_NA};

/// Why a function can or cannot be rewritten at all, before any
/// predicate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanInstrument {
    Yes,
    /// Declarations have no body to preserve.
    NotDefinition,
    /// Variadic signatures have no fixed slot count.
    NotVarArgs,
}

impl CanInstrument {
    /// Tag for the statistics sink.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            CanInstrument::Yes => "instrument",
            CanInstrument::NotDefinition => "not_decl",
            CanInstrument::NotVarArgs => "not_varargs",
        }
    }
}

/// The hard eligibility gate. Everything else is accepted; types the
/// rewriter cannot model degrade to unknown descriptors later.
#[must_use]
pub fn can_be_instrumented(function: FunctionValue) -> CanInstrument {
    if function.count_basic_blocks() == 0 {
        return CanInstrument::NotDefinition;
    }
    if function.get_type().is_var_arg() {
        return CanInstrument::NotVarArgs;
    }
    CanInstrument::Yes
}

/// The augmentum instrumentation pass.
pub struct AugmentumPass {
    options: PassOptions,
    predicate: Box<dyn ShouldInstrument>,
    stats: InstrumentationStats,
    record_stats: bool,
}

impl AugmentumPass {
    /// Build a pass from options alone: a targeted predicate when a
    /// target file was given, otherwise instrument everything.
    #[must_use]
    pub fn new(options: PassOptions) -> Self {
        let predicate: Box<dyn ShouldInstrument> = match &options.target_functions {
            Some(path) => Box::new(TargetedInstrument::new(path)),
            None => Box::new(AlwaysInstrument),
        };
        Self::with_predicate(options, predicate)
    }

    /// Build a pass with an explicit predicate (the embedding hook for
    /// script-driven decisions).
    #[must_use]
    pub fn with_predicate(options: PassOptions, predicate: Box<dyn ShouldInstrument>) -> Self {
        let record_stats = options.stats_output.is_some();
        let mut stats = InstrumentationStats::new();
        if options.dry_run {
            stats.collect_full_stats();
        }
        AugmentumPass {
            options,
            predicate,
            stats,
            record_stats,
        }
    }

    /// Run on one module. Returns whether the module was changed.
    pub fn run_on_module(&mut self, module: &Module) -> bool {
        let transformed = if self.options.dry_run {
            self.collect_function_stats(module);
            false
        } else {
            self.run_instrumentation(module)
        };

        if self.record_stats {
            let prefix = sanitise(&module.get_name().to_string_lossy(), &['/', '.']);
            let out_dir = self
                .options
                .stats_output
                .clone()
                .expect("record_stats implies a sink directory");
            self.stats.emit_statistics(&out_dir, &prefix);
        }

        if transformed {
            if let Some(dir) = self.options.emit_ir.clone() {
                emit_ir(module, &dir);
            }
        }
        transformed
    }

    fn run_instrumentation(&mut self, module: &Module) -> bool {
        if !self.predicate.module(module) {
            return false;
        }

        let types = ModuleTypes::new(module.get_context());
        // Snapshot the function list up front so synthesised functions
        // are never themselves considered for instrumentation.
        let functions: Vec<FunctionValue> = module.get_functions().collect();

        let mut ctors = Vec::new();
        for function in functions {
            if can_be_instrumented(function) != CanInstrument::Yes {
                continue;
            }
            if !self.predicate.function(function) {
                continue;
            }
            debug!(
                function = %function.get_name().to_string_lossy(),
                module = %module.get_name().to_string_lossy(),
                "instrumenting function"
            );
            if self.record_stats {
                self.stats
                    .record_function_stats(module, function, INSTRUMENTATION_INFO_NA);
            }
            let ctor = FunctionRewriter::new(module, &types, function).transform();
            ctors.push(ctor);
        }

        let transformed = ctors.len();
        append_to_global_ctors(module, &ctors);
        if transformed > 0 {
            info!(
                module = %module.get_name().to_string_lossy(),
                functions = transformed,
                "instrumented module"
            );
        }
        transformed > 0
    }

    /// Dry-run survey: record decision information for every function,
    /// transforming nothing.
    fn collect_function_stats(&mut self, module: &Module) {
        if !self.record_stats {
            return;
        }
        for function in module.get_functions() {
            let can = can_be_instrumented(function);
            let should = self.predicate.decision_info(module, function);
            self.stats
                .record_function_stats(module, function, (can.tag(), &should));
        }
        self.stats.record_named_struct_stats(module);
    }
}

fn sanitise(name: &str, separators: &[char]) -> String {
    name.replace(separators, "_")
}

/// Write the transformed module as textual IR under `dir`.
fn emit_ir(module: &Module, dir: &Path) {
    if !dir.exists() {
        error!(
            path = %dir.display(),
            "[augmentum] opening output stream to emit module IR code failed; path not found"
        );
        return;
    }
    let name = sanitise(&module.get_name().to_string_lossy(), &['/']);
    let path = dir.join(format!("{name}.ll"));
    if let Err(err) = module.print_to_file(&path) {
        error!(
            path = %path.display(),
            err = %err.to_string(),
            "[augmentum] emitting module IR failed"
        );
    }
}
