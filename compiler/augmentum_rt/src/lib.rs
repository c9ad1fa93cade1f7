//! Augmentum Runtime Library (`libaugmentum_rt`)
//!
//! Runtime support for programs rewritten by the augmentum instrumentation
//! pass. Every instrumented function dispatches through a mutable function
//! pointer; this crate owns the registry of those dispatch sites (extension
//! points), the type descriptors that make them reflectively callable, and
//! the before/around/after advice machinery that observers attach to them.
//!
//! # Build Modes
//!
//! - **rlib**: For Rust consumers (unit tests, the pass crate)
//! - **staticlib / cdylib**: For linking against rewritten IR
//!
//! # Module Map
//!
//! - [`types`]: interned, possibly-cyclic type descriptors
//! - [`point`]: extension points, advice chains, the evaluator
//! - [`registry`]: the process-wide `(module, symbol)` map
//! - [`listener`]: registration/unregistration observers
//! - [`internal`]: the `extern "C"` surface called by synthesised IR
//!
//! # Thread Safety
//!
//! Attaching and removing advice is *not* re-entrant safe and is intended
//! to happen at program start-up and shutdown, before and after worker
//! threads exist. Calls through instrumented function pointers may run
//! concurrently with each other provided no attach/detach is in flight.
//! The interning tables and the registry map are lock-protected so that
//! descriptor construction from multiple module constructors stays
//! coherent; the evaluator itself takes no locks.
//!
//! # Safety
//!
//! The `internal` module uses `#[no_mangle]` and `extern "C"` for FFI
//! compatibility with rewritten IR. Functions that take raw pointers are
//! called from generated code which guarantees valid pointers.

#![allow(unsafe_code)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
// The original/extended/replaced state machine is *defined* by comparing
// the dispatch slot against known function addresses.
#![allow(unpredictable_function_pointer_comparisons)]
// FFI code uses fixed-width casts intentionally.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod internal;
pub mod listener;
pub mod point;
pub mod registry;
pub mod types;

mod advice;

pub use listener::{add_listener, remove_listener, Listener, ListenerGuard};
pub use point::{AfterAdvice, AroundAdvice, BeforeAdvice, FnExtensionPoint};
pub use registry::{lookup, unregister};
pub use types::{TypeDesc, TypeKind};

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

/// Typeless function pointer held in a dispatch slot. Always a disguised
/// pointer to a function with the extension point's real signature.
pub type RawFn = unsafe extern "C" fn();

/// Uniform-ABI entry for a preserved original body:
/// `(ret_slot, arg_slots) -> void`.
pub type ReflectFn = unsafe extern "C" fn(RetVal, ArgVals);

/// Pointer to storage for the return value. Null when the return type is
/// void.
pub type RetVal = *mut c_void;

/// Contiguous array of per-argument slot pointers, one per parameter.
/// Each element addresses storage holding that argument's bit-exact value;
/// for by-value aggregate parameters the element *is* the aggregate's
/// address.
pub type ArgVals = *mut *mut c_void;

/// Opaque identity of an attached before advice, valid until removal.
pub type BeforeHandle = *mut c_void;
/// Opaque identity of an attached around advice. Also the token an around
/// advice passes to `call_previous` to descend the chain.
pub type AroundHandle = *mut c_void;
/// Opaque identity of an attached after advice, valid until removal.
pub type AfterHandle = *mut c_void;

/// Identifier attachable to advice for bulk removal. Zero means "unnamed"
/// and disables id-based removal.
pub type AdviceId = u32;

static NEXT_ADVICE_ID: AtomicU32 = AtomicU32::new(1);

/// Get a unique advice id.
///
/// Advice can always be removed through the handle returned at attach
/// time, but that requires remembering which handle came from which
/// extension point. Tagging advice with one id lets a listener detach
/// everything it attached with a single [`FnExtensionPoint::remove`] per
/// point. Successive calls return strictly increasing values; 0 is never
/// returned.
pub fn unique_advice_id() -> AdviceId {
    NEXT_ADVICE_ID.fetch_add(1, Ordering::SeqCst)
}
