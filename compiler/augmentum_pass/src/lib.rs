//! Augmentum instrumentation pass.
//!
//! A module-level LLVM transformation that rewrites eligible functions so
//! every call dispatches through a mutable function pointer, and plants a
//! global constructor per function that registers an *extension point*
//! with the `augmentum_rt` runtime. Observers can then attach before,
//! around and after advice to any instrumented function at run time, or
//! replace it outright.
//!
//! # Per-function artefacts
//!
//! For a function `f` the pass synthesises:
//!
//! | Artefact | Name | Role |
//! |----------|------|------|
//! | preserved body | `augmentum::f__original__` | the never-mutated implementation |
//! | reflective trampoline | `augmentum::f__reflect__` | `(ret_slot, arg_slots)` → typed call |
//! | extended stub | `augmentum::f__extended__` | typed args → reflective form → evaluator |
//! | entry | `f` | load `fn_ptr`, tail-call it |
//! | constructor | `augmentum::f__init__` | builds type descriptors, registers the point |
//!
//! # Eligibility
//!
//! Only definitions (functions with a body) that are not variadic are
//! rewritten; a configurable predicate ([`predicate`]) filters further.
//!
//! # Crate layout
//!
//! - [`pass`]: the module pass driver, dry-run mode, IR emission
//! - [`rewrite`]: the per-function rewriter
//! - [`typedesc`]: emission of runtime type-descriptor construction code
//! - [`predicate`]: should-instrument strategies
//! - [`stats`] / [`serialise`]: the statistics sink and type serialiser
//! - [`config`]: pass options parsed from the documented flags
//!
//! # Debugging
//!
//! Enable tracing with `RUST_LOG=augmentum_pass=debug` (or `=trace`).

// Crate-level lint configuration for codegen-specific patterns.
#![allow(
    // LLVM uses u32 for indices and widths; conversions are intentional.
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    // Codegen functions thread through module, builder, caches, ...
    clippy::too_many_arguments,
    // Internal panics are invariant violations, not API concerns.
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
)]

pub mod config;
pub mod pass;
pub mod predicate;
pub mod serialise;
pub mod stats;

mod ctors;
mod rewrite;
mod typedesc;
mod utils;

pub use config::PassOptions;
pub use pass::AugmentumPass;
pub use predicate::{
    AlwaysInstrument, CallbackInstrument, HeuristicDetector, ShouldInstrument, TargetedInstrument,
};

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for debug output.
///
/// Call this once at startup. Safe to call multiple times.
/// Enable with `RUST_LOG=augmentum_pass=debug` or `=trace`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        // Only initialize if RUST_LOG is set
        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
        }
    });
}

#[cfg(test)]
mod tests;
