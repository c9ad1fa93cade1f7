//! Extension points and the advice evaluator.
//!
//! One `FnExtensionPoint` exists per instrumented function. The rewriter
//! plants a mutable function pointer next to every rewritten entry; the
//! point flips that pointer between the preserved original body (fast
//! path) and the synthesised extended stub (evaluator path) as advice is
//! attached and removed. A point is therefore always in exactly one of
//! three modes:
//!
//! - *original*: the slot targets the preserved body, no advice attached
//! - *extended*: the slot targets the extended stub and extension data
//!   holds at least one advice
//! - *replaced*: the slot targets an arbitrary user function
//!
//! Attach and detach are not re-entrant safe; do them at program start-up
//! or shutdown. See the crate docs.

use std::cell::Cell;

use crate::advice::{AdviceList, Node};
use crate::types::TypeDesc;
use crate::{
    registry, AdviceId, AfterHandle, ArgVals, AroundHandle, BeforeHandle, RawFn, ReflectFn, RetVal,
};

/// Advice run before arguments flow to the original. Receives the point
/// and the argument slots.
pub type BeforeAdvice = Box<dyn FnMut(&FnExtensionPoint, ArgVals)>;

/// Advice wrapping the original call. Receives its own handle so it can
/// descend the chain with [`FnExtensionPoint::call_previous`]; if it never
/// does, the original is not executed.
pub type AroundAdvice = Box<dyn FnMut(&FnExtensionPoint, AroundHandle, RetVal, ArgVals)>;

/// Advice run after the around chain returns. Observes whatever the return
/// slot holds at that time.
pub type AfterAdvice = Box<dyn FnMut(&FnExtensionPoint, RetVal, ArgVals)>;

/// Per-point advice storage. Exists iff at least one list is non-empty.
pub(crate) struct ExtensionData {
    befores: AdviceList<BeforeAdvice>,
    arounds: AdviceList<AroundAdvice>,
    afters: AdviceList<AfterAdvice>,
}

impl ExtensionData {
    fn new() -> Self {
        ExtensionData {
            befores: AdviceList::new(),
            arounds: AdviceList::new(),
            afters: AdviceList::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.befores.is_empty() && self.arounds.is_empty() && self.afters.is_empty()
    }
}

/// The runtime object representing one instrumented function.
///
/// Instances are created by the per-function constructors the rewriter
/// synthesises; user code obtains them with [`lookup`](crate::lookup) and
/// never constructs one. The registry owns every point and releases them
/// all at process exit after resetting their dispatch slots.
pub struct FnExtensionPoint {
    module_name: String,
    name: String,
    type_desc: &'static TypeDesc,
    /// The mutable dispatch slot embedded in the program image.
    fn_slot: *mut RawFn,
    original: RawFn,
    extended: RawFn,
    reflect: ReflectFn,
    data: Cell<*mut ExtensionData>,
}

impl FnExtensionPoint {
    /// # Safety
    /// `fn_slot` must point to the live dispatch slot for this function
    /// and must currently hold `original`.
    pub(crate) unsafe fn new(
        module_name: String,
        name: String,
        type_desc: &'static TypeDesc,
        fn_slot: *mut RawFn,
        original: RawFn,
        extended: RawFn,
        reflect: ReflectFn,
    ) -> Self {
        debug_assert!(*fn_slot == original, "dispatch slot not initialised");
        FnExtensionPoint {
            module_name,
            name,
            type_desc,
            fn_slot,
            original,
            extended,
            reflect,
            data: Cell::new(std::ptr::null_mut()),
        }
    }

    /// Look up a registered extension point by module and symbol name.
    #[must_use]
    pub fn get(module_name: &str, name: &str) -> Option<&'static FnExtensionPoint> {
        registry::lookup(module_name, name)
    }

    // -- Identity and type --

    /// The symbol name, exactly as the rewriter saw it (i.e. mangled).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the module that defines this function.
    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// The function's type descriptor.
    #[must_use]
    pub fn type_desc(&self) -> &'static TypeDesc {
        self.type_desc
    }

    /// Canonical signature of the function type.
    #[must_use]
    pub fn signature(&self) -> String {
        self.type_desc.signature()
    }

    /// The return type descriptor.
    #[must_use]
    pub fn return_type(&self) -> &'static TypeDesc {
        self.type_desc.return_type()
    }

    /// Number of arguments.
    #[must_use]
    pub fn num_args(&self) -> usize {
        self.type_desc.num_args()
    }

    /// The `i`th argument's type descriptor.
    #[must_use]
    pub fn arg_type(&self, i: usize) -> &'static TypeDesc {
        self.type_desc.arg_type(i)
    }

    /// All argument type descriptors.
    #[must_use]
    pub fn arg_types(&self) -> &[&'static TypeDesc] {
        self.type_desc.arg_types()
    }

    // -- Mode --

    /// Whether the point dispatches to the preserved original body.
    #[must_use]
    pub fn is_original(&self) -> bool {
        self.current_fn() == self.original
    }

    /// Whether the point dispatches through the evaluator.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.current_fn() == self.extended
    }

    /// Whether the point has been replaced with an arbitrary function.
    #[must_use]
    pub fn is_replaced(&self) -> bool {
        !self.is_original() && !self.is_extended()
    }

    /// The function currently installed in the dispatch slot. Low level;
    /// rarely useful.
    #[must_use]
    pub fn current_fn(&self) -> RawFn {
        // SAFETY: the slot outlives the point (both live until process
        // exit) and is only written from this module.
        unsafe { *self.fn_slot }
    }

    /// Replace the function wholesale. The replacement must have the same
    /// concrete signature as the original. Any attached advice is removed
    /// first.
    pub fn replace(&self, f: RawFn) {
        self.reset();
        // SAFETY: see current_fn.
        unsafe { *self.fn_slot = f };
    }

    /// Return to the original implementation, dropping all advice.
    /// A no-op on an already-original point.
    pub fn reset(&self) {
        let data = self.data.replace(std::ptr::null_mut());
        if !data.is_null() {
            // SAFETY: data was allocated by prepare_for_extend and is
            // owned by this point.
            drop(unsafe { Box::from_raw(data) });
        }
        // SAFETY: see current_fn.
        unsafe { *self.fn_slot = self.original };
    }

    // -- Attach --

    /// Attach advice to run before the original. Most recently attached
    /// advice runs first. Returns a handle valid until removal.
    pub fn extend_before<F>(&self, advice: F, id: AdviceId) -> BeforeHandle
    where
        F: FnMut(&FnExtensionPoint, ArgVals) + 'static,
    {
        self.prepare_for_extend().befores.push_front(Box::new(advice), id)
    }

    /// Attach advice wrapping the original call. Most recently attached
    /// advice becomes the outermost frame. Returns a handle valid until
    /// removal.
    pub fn extend_around<F>(&self, advice: F, id: AdviceId) -> AroundHandle
    where
        F: FnMut(&FnExtensionPoint, AroundHandle, RetVal, ArgVals) + 'static,
    {
        self.prepare_for_extend().arounds.push_front(Box::new(advice), id)
    }

    /// Attach advice to run after the around chain returns. Most recently
    /// attached advice runs first. Returns a handle valid until removal.
    pub fn extend_after<F>(&self, advice: F, id: AdviceId) -> AfterHandle
    where
        F: FnMut(&FnExtensionPoint, RetVal, ArgVals) + 'static,
    {
        self.prepare_for_extend().afters.push_front(Box::new(advice), id)
    }

    // -- Detach --

    /// Remove a before advice by handle. No-op unless the point is
    /// extended.
    pub fn remove_before(&self, handle: BeforeHandle) {
        if let Some(data) = self.extended_data() {
            data.befores.erase(handle);
            self.reset_if_empty();
        }
    }

    /// Remove every before advice carrying `id`. Id 0 never matches.
    pub fn remove_before_id(&self, id: AdviceId) {
        if id == 0 {
            return;
        }
        if let Some(data) = self.extended_data() {
            data.befores.remove_id(id);
            self.reset_if_empty();
        }
    }

    /// Remove an around advice by handle. No-op unless the point is
    /// extended.
    pub fn remove_around(&self, handle: AroundHandle) {
        if let Some(data) = self.extended_data() {
            data.arounds.erase(handle);
            self.reset_if_empty();
        }
    }

    /// Remove every around advice carrying `id`. Id 0 never matches.
    pub fn remove_around_id(&self, id: AdviceId) {
        if id == 0 {
            return;
        }
        if let Some(data) = self.extended_data() {
            data.arounds.remove_id(id);
            self.reset_if_empty();
        }
    }

    /// Remove an after advice by handle. No-op unless the point is
    /// extended.
    pub fn remove_after(&self, handle: AfterHandle) {
        if let Some(data) = self.extended_data() {
            data.afters.erase(handle);
            self.reset_if_empty();
        }
    }

    /// Remove every after advice carrying `id`. Id 0 never matches.
    pub fn remove_after_id(&self, id: AdviceId) {
        if id == 0 {
            return;
        }
        if let Some(data) = self.extended_data() {
            data.afters.remove_id(id);
            self.reset_if_empty();
        }
    }

    /// Remove advice carrying `id` from all three lists. Id 0 never
    /// matches.
    pub fn remove(&self, id: AdviceId) {
        if id == 0 {
            return;
        }
        if let Some(data) = self.extended_data() {
            data.befores.remove_id(id);
            data.arounds.remove_id(id);
            data.afters.remove_id(id);
            self.reset_if_empty();
        }
    }

    // -- Reflective calls --

    /// Call the preserved original body reflectively, bypassing all
    /// advice. `ret_value` must point to storage for the return value
    /// (null for void); `arg_values` must hold one slot pointer per
    /// argument.
    pub fn call_original(&self, ret_value: RetVal, arg_values: ArgVals) {
        // SAFETY: reflect was synthesised for exactly this function's
        // signature; the caller supplies conforming slots.
        unsafe { (self.reflect)(ret_value, arg_values) }
    }

    /// Direct pointer to the preserved original body. Cast it to the
    /// function's concrete type yourself; prefer [`call_original`].
    ///
    /// [`call_original`]: Self::call_original
    #[must_use]
    pub fn original_direct(&self) -> RawFn {
        self.original
    }

    /// Invoke the around advice behind `handle`, or the original when
    /// `handle` is null.
    pub fn call_current(&self, handle: AroundHandle, ret_value: RetVal, arg_values: ArgVals) {
        if handle.is_null() {
            self.call_original(ret_value, arg_values);
            return;
        }
        let node: *mut Node<AroundAdvice> = handle.cast();
        // SAFETY: a non-null handle denotes a live node; advice may alias
        // the point, which is why everything here goes through raw
        // pointers.
        unsafe { ((*node).advice)(self, handle, ret_value, arg_values) }
    }

    /// Descend the around chain from `handle`: invoke the advice attached
    /// just before it, or the original at the end of the chain. `handle`
    /// must be the non-null handle the calling advice received.
    pub fn call_previous(&self, handle: AroundHandle, ret_value: RetVal, arg_values: ArgVals) {
        assert!(!handle.is_null(), "call_previous requires a live handle");
        let node: *mut Node<AroundAdvice> = handle.cast();
        // SAFETY: handle denotes a live node.
        let next = unsafe { (*node).next };
        self.call_current(next.cast(), ret_value, arg_values);
    }

    /// Run the advice chains: all befores (most recent first), then the
    /// around chain outermost-first, then all afters. Reached exclusively
    /// through the synthesised extended stub.
    pub(crate) fn eval(&self, ret_value: RetVal, arg_values: ArgVals) {
        debug_assert!(self.is_extended());
        let data = self.data.get();
        debug_assert!(!data.is_null());
        // SAFETY: extended mode implies live extension data; the contract
        // forbids attach/detach while a call is in flight.
        let data = unsafe { &mut *data };

        for node in data.befores.iter_nodes() {
            // SAFETY: node is live for the duration of the call.
            unsafe { ((*node).advice)(self, arg_values) }
        }
        self.call_current(data.arounds.head().cast(), ret_value, arg_values);
        for node in data.afters.iter_nodes() {
            // SAFETY: node is live for the duration of the call.
            unsafe { ((*node).advice)(self, ret_value, arg_values) }
        }
    }

    // -- Internals --

    /// Allocate extension data and flip the slot to the extended stub on
    /// first attach.
    fn prepare_for_extend(&self) -> &mut ExtensionData {
        if self.data.get().is_null() {
            debug_assert!(
                self.is_original(),
                "cannot extend a replaced point; reset it first"
            );
            self.data
                .set(Box::into_raw(Box::new(ExtensionData::new())));
            // SAFETY: see current_fn.
            unsafe { *self.fn_slot = self.extended };
        } else {
            debug_assert!(self.is_extended());
        }
        // SAFETY: just ensured non-null; exclusive by the single-threaded
        // mutation contract.
        unsafe { &mut *self.data.get() }
    }

    fn extended_data(&self) -> Option<&mut ExtensionData> {
        if !self.is_extended() {
            return None;
        }
        let data = self.data.get();
        debug_assert!(!data.is_null());
        // SAFETY: extended mode implies live data.
        Some(unsafe { &mut *data })
    }

    fn reset_if_empty(&self) {
        let data = self.data.get();
        // SAFETY: data, when set, is a live owned allocation.
        if !data.is_null() && unsafe { (*data).is_empty() } {
            self.reset();
        }
    }
}

impl Drop for FnExtensionPoint {
    fn drop(&mut self) {
        let data = self.data.replace(std::ptr::null_mut());
        if !data.is_null() {
            // SAFETY: owned allocation from prepare_for_extend.
            drop(unsafe { Box::from_raw(data) });
        }
    }
}

impl std::fmt::Display for FnExtensionPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
