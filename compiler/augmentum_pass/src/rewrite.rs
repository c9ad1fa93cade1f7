//! Per-function rewriting.
//!
//! For one eligible function `f`, [`FunctionRewriter::transform`]
//! produces the full artefact set:
//!
//! 1. the preserved body, renamed to `augmentum::f__original__` with
//!    private linkage, with every existing use redirected to a fresh
//!    public entry under the original name (so even intra-module and
//!    recursive calls dispatch through the function pointer);
//! 2. two private globals: the mutable dispatch pointer `fn_ptr`
//!    (initialised to the preserved body) and the extension-point slot
//!    (initialised to null, filled by the constructor);
//! 3. `augmentum::f__reflect__`, the uniform-ABI trampoline that turns
//!    `(ret_slot, arg_slots)` back into a direct typed call;
//! 4. `augmentum::f__extended__`, the typed stub that spills arguments
//!    into slots and calls the runtime evaluator;
//! 5. the entry body: load `fn_ptr`, tail-call, return;
//! 6. `augmentum::f__init__`, the constructor that builds the type
//!    descriptor and registers the extension point.
//!
//! By-value aggregate parameters keep their `byval` attribute on every
//! synthesised call, and their slot entries hold the aggregate's address
//! directly (one indirection fewer than scalar slots).

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::context::ContextRef;
use inkwell::module::{Linkage, Module};
use inkwell::types::{AnyType, BasicType, BasicTypeEnum, FunctionType, PointerType};
use inkwell::values::{
    BasicMetadataValueEnum, CallSiteValue, CallableValue, FunctionValue, GlobalValue, PointerValue,
};
use inkwell::AddressSpace;
use tracing::trace;

use augmentum_rt::internal::symbols;

use crate::typedesc::TypeDescEmitter;
use crate::utils::{byval_attribute, cstring_global, global_name, rename_value, replace_all_uses};

/// Opaque runtime types, created once per module so every rewritten
/// function shares the same named structs.
pub(crate) struct ModuleTypes<'ctx> {
    pub ep_ptr_ty: PointerType<'ctx>,
    pub td_ptr_ty: PointerType<'ctx>,
}

impl<'ctx> ModuleTypes<'ctx> {
    pub(crate) fn new(ctx: ContextRef<'ctx>) -> Self {
        ModuleTypes {
            ep_ptr_ty: ctx
                .opaque_struct_type(symbols::STRUCT_EXTENSION_POINT)
                .ptr_type(AddressSpace::default()),
            td_ptr_ty: ctx
                .opaque_struct_type(symbols::STRUCT_TYPE_DESC)
                .ptr_type(AddressSpace::default()),
        }
    }
}

/// Rewrites a single function. Create one per target, call
/// [`transform`](Self::transform), collect the returned constructor.
pub(crate) struct FunctionRewriter<'a, 'ctx> {
    ctx: ContextRef<'ctx>,
    module: &'a Module<'ctx>,
    /// The target; becomes the preserved private body.
    original: FunctionValue<'ctx>,
    fn_type: FunctionType<'ctx>,
    name: String,
    param_types: Vec<BasicTypeEnum<'ctx>>,
    byval: Vec<Option<Attribute>>,

    entry: Option<FunctionValue<'ctx>>,
    reflect: Option<FunctionValue<'ctx>>,
    extended: Option<FunctionValue<'ctx>>,
    fn_ptr: Option<GlobalValue<'ctx>>,
    extension_point_ptr: Option<GlobalValue<'ctx>>,

    ep_ptr_ty: PointerType<'ctx>,
    td_ptr_ty: PointerType<'ctx>,
    i8_ptr_ty: PointerType<'ctx>,
    i8_ptr_ptr_ty: PointerType<'ctx>,
    /// `void()*`, the typeless form function pointers are erased to.
    raw_fn_ptr_ty: PointerType<'ctx>,
}

impl<'a, 'ctx> FunctionRewriter<'a, 'ctx> {
    pub(crate) fn new(
        module: &'a Module<'ctx>,
        types: &ModuleTypes<'ctx>,
        function: FunctionValue<'ctx>,
    ) -> Self {
        let ctx = module.get_context();
        let fn_type = function.get_type();
        let name = function.get_name().to_string_lossy().into_owned();
        let param_types: Vec<BasicTypeEnum<'ctx>> = fn_type
            .get_param_types()
            .iter()
            .map(|param| BasicTypeEnum::try_from(*param).expect("basic parameter type"))
            .collect();
        let byval = (0..function.count_params())
            .map(|index| byval_attribute(function, index))
            .collect();
        let i8_ptr_ty = ctx.i8_type().ptr_type(AddressSpace::default());
        FunctionRewriter {
            ctx,
            module,
            original: function,
            fn_type,
            name,
            param_types,
            byval,
            entry: None,
            reflect: None,
            extended: None,
            fn_ptr: None,
            extension_point_ptr: None,
            ep_ptr_ty: types.ep_ptr_ty,
            td_ptr_ty: types.td_ptr_ty,
            i8_ptr_ty,
            i8_ptr_ptr_ty: i8_ptr_ty.ptr_type(AddressSpace::default()),
            raw_fn_ptr_ty: ctx
                .void_type()
                .fn_type(&[], false)
                .ptr_type(AddressSpace::default()),
        }
    }

    /// Run the whole rewrite. Returns the registration constructor for
    /// the pass to append to `llvm.global_ctors`.
    pub(crate) fn transform(mut self) -> FunctionValue<'ctx> {
        trace!(function = %self.name, "rewriting");
        self.split_entry_from_body();
        self.declare_globals();
        self.make_reflect();
        self.make_extended();
        self.build_entry_body();
        self.make_init()
    }

    /// Move the target's body under its private `__original__` name and
    /// stand up a fresh public entry in its place. Redirecting all uses
    /// afterwards sends every existing caller (the body's own recursive
    /// calls included) through the entry, hence through `fn_ptr`.
    fn split_entry_from_body(&mut self) {
        let linkage = self.original.get_linkage();
        rename_value(&self.original, &global_name(&self.name, "original"));

        let entry = self
            .module
            .add_function(&self.name, self.fn_type, Some(linkage));
        self.add_param_byval_attributes(entry);

        replace_all_uses(&self.original, &entry);
        self.original.set_linkage(Linkage::Private);
        self.entry = Some(entry);
    }

    /// The two per-function globals: the dispatch slot and the
    /// extension-point pointer the constructor fills in.
    fn declare_globals(&mut self) {
        let ep_global = self.module.add_global(
            self.ep_ptr_ty,
            None,
            &global_name(&self.name, "extension_point_ptr"),
        );
        ep_global.set_linkage(Linkage::Private);
        ep_global.set_initializer(&self.ep_ptr_ty.const_null());
        self.extension_point_ptr = Some(ep_global);

        let fn_ptr_ty = self.fn_type.ptr_type(AddressSpace::default());
        let fn_ptr = self
            .module
            .add_global(fn_ptr_ty, None, &global_name(&self.name, "fn_ptr"));
        fn_ptr.set_linkage(Linkage::Private);
        fn_ptr.set_initializer(&self.original.as_global_value().as_pointer_value());
        self.fn_ptr = Some(fn_ptr);
    }

    /// The reflective trampoline:
    ///
    /// ```text
    /// void f__reflect__(i8* ret_slot, i8** arg_slots) {
    ///     T0 arg0 = *(T0*)arg_slots[0];        // scalar: two loads
    ///     S* arg1 = (S*)arg_slots[1];          // byval: one load
    ///     *(R*)ret_slot = f__original__(arg0, arg1);
    /// }
    /// ```
    fn make_reflect(&mut self) {
        let reflect_ty = self
            .ctx
            .void_type()
            .fn_type(&[self.i8_ptr_ty.into(), self.i8_ptr_ptr_ty.into()], false);
        let reflect = self.module.add_function(
            &global_name(&self.name, "reflect"),
            reflect_ty,
            Some(Linkage::Private),
        );

        let block = self.ctx.append_basic_block(reflect, "");
        let builder = self.ctx.create_builder();
        builder.position_at_end(block);

        let ret_slot = reflect.get_nth_param(0).expect("ret slot").into_pointer_value();
        let arg_slots = reflect
            .get_nth_param(1)
            .expect("arg slots")
            .into_pointer_value();

        let mut args: Vec<BasicMetadataValueEnum<'ctx>> = Vec::new();
        for (index, param_ty) in self.param_types.iter().enumerate() {
            let offset = self.ctx.i64_type().const_int(index as u64, false);
            // SAFETY: the caller supplies one slot per parameter.
            let slot_addr = unsafe {
                builder.build_in_bounds_gep(arg_slots, &[offset], &format!("arg{index}PPV"))
            }
            .expect("gep");

            let value = if self.byval[index].is_some() {
                // The slot entry is the aggregate's address itself.
                let slot = builder
                    .build_pointer_cast(
                        slot_addr,
                        param_ty.ptr_type(AddressSpace::default()),
                        &format!("arg{index}PT"),
                    )
                    .expect("cast");
                builder
                    .build_load(slot, &format!("arg{index}T"))
                    .expect("load")
            } else {
                let slot = builder
                    .build_pointer_cast(
                        slot_addr,
                        param_ty
                            .ptr_type(AddressSpace::default())
                            .ptr_type(AddressSpace::default()),
                        &format!("arg{index}PPT"),
                    )
                    .expect("cast");
                let value_ptr = builder
                    .build_load(slot, &format!("arg{index}PT"))
                    .expect("load")
                    .into_pointer_value();
                builder
                    .build_load(value_ptr, &format!("arg{index}T"))
                    .expect("load")
            };
            args.push(value.into());
        }

        let is_void = self.fn_type.get_return_type().is_none();
        let call = builder
            .build_call(self.original, &args, if is_void { "" } else { "retT" })
            .expect("call");
        self.add_call_byval_attributes(call);
        call.set_tail_call(true);

        if let Some(ret_ty) = self.fn_type.get_return_type() {
            let ret_ptr = builder
                .build_pointer_cast(ret_slot, ret_ty.ptr_type(AddressSpace::default()), "retPT")
                .expect("cast");
            let result = call
                .try_as_basic_value()
                .left()
                .expect("non-void call result");
            builder.build_store(ret_ptr, result).expect("store");
        }
        builder.build_return(None).expect("ret");

        self.reflect = Some(reflect);
    }

    /// The extended stub: same typed signature as the target; spills the
    /// return slot and every argument onto the stack, builds the slot
    /// array and calls the evaluator. By-value aggregates contribute
    /// their incoming address directly instead of a local copy.
    fn make_extended(&mut self) {
        let extended = self.module.add_function(
            &global_name(&self.name, "extended"),
            self.fn_type,
            Some(Linkage::Private),
        );
        self.add_param_byval_attributes(extended);

        let block = self.ctx.append_basic_block(extended, "");
        let builder = self.ctx.create_builder();
        builder.position_at_end(block);

        let param_count = self.param_types.len();
        let ret_alloc = self
            .fn_type
            .get_return_type()
            .map(|ret_ty| builder.build_alloca(ret_ty, "ret_alloc").expect("alloca"));

        let mut arg_allocs: Vec<Option<PointerValue<'ctx>>> = vec![None; param_count];
        for (index, param_ty) in self.param_types.iter().enumerate() {
            if self.byval[index].is_none() {
                let alloc = builder
                    .build_alloca(*param_ty, &format!("arg_alloc{index}"))
                    .expect("alloca");
                arg_allocs[index] = Some(alloc);
            }
        }

        let slots_ty = self.i8_ptr_ty.array_type(param_count as u32);
        let slots_alloc = builder.build_alloca(slots_ty, "argsAlloc").expect("alloca");
        let zero = self.ctx.i64_type().const_zero();

        for index in 0..param_count {
            let param = extended
                .get_nth_param(index as u32)
                .expect("declared parameter");
            let offset = self.ctx.i64_type().const_int(index as u64, false);
            // SAFETY: index is within the slot array just allocated.
            let slot_addr = unsafe {
                builder.build_in_bounds_gep(
                    slots_alloc,
                    &[zero, offset],
                    &format!("argVoidPtrPtr{index}"),
                )
            }
            .expect("gep");

            if self.byval[index].is_some() {
                // Store the aggregate's address straight into the slot.
                let slot = builder
                    .build_pointer_cast(
                        slot_addr,
                        self.param_types[index].ptr_type(AddressSpace::default()),
                        &format!("argPtrPtr{index}"),
                    )
                    .expect("cast");
                builder.build_store(slot, param).expect("store");
            } else {
                let alloc = arg_allocs[index].expect("scalar slot");
                builder.build_store(alloc, param).expect("store");
                let slot = builder
                    .build_pointer_cast(
                        slot_addr,
                        self.param_types[index]
                            .ptr_type(AddressSpace::default())
                            .ptr_type(AddressSpace::default()),
                        &format!("argPtrPtr{index}"),
                    )
                    .expect("cast");
                builder.build_store(slot, alloc).expect("store");
            }
        }

        let ret_slot = match ret_alloc {
            Some(alloc) => builder
                .build_pointer_cast(alloc, self.i8_ptr_ty, "retVoidPtr")
                .expect("cast"),
            None => self.i8_ptr_ty.const_null(),
        };
        // SAFETY: [0, 0] decays the slot array to its first element.
        let slots = unsafe {
            builder.build_in_bounds_gep(slots_alloc, &[zero, zero], "argVoidPtrPtr")
        }
        .expect("gep");

        let eval = self.runtime_fn(symbols::EVAL, || {
            self.ctx.void_type().fn_type(
                &[
                    self.ep_ptr_ty.into(),
                    self.i8_ptr_ty.into(),
                    self.i8_ptr_ptr_ty.into(),
                ],
                false,
            )
        });
        let point = builder
            .build_load(
                self.extension_point_ptr
                    .expect("globals declared")
                    .as_pointer_value(),
                "extension_point",
            )
            .expect("load");
        builder
            .build_call(eval, &[point.into(), ret_slot.into(), slots.into()], "")
            .expect("eval call");

        match ret_alloc {
            Some(alloc) => {
                let ret_val = builder.build_load(alloc, "retVal").expect("load");
                builder.build_return(Some(&ret_val)).expect("ret");
            }
            None => {
                builder.build_return(None).expect("ret");
            }
        }

        self.extended = Some(extended);
    }

    /// The minimal inline trampoline that is the public entry: load the
    /// dispatch pointer and tail-call it with the incoming arguments.
    fn build_entry_body(&mut self) {
        let entry = self.entry.expect("entry split");
        let block = self.ctx.append_basic_block(entry, "");
        let builder = self.ctx.create_builder();
        builder.position_at_end(block);

        let target = builder
            .build_load(
                self.fn_ptr.expect("globals declared").as_pointer_value(),
                "fn",
            )
            .expect("load")
            .into_pointer_value();
        let callee = CallableValue::try_from(target).expect("function pointer");

        let args: Vec<BasicMetadataValueEnum<'ctx>> = entry
            .get_params()
            .iter()
            .map(|param| (*param).into())
            .collect();
        let is_void = self.fn_type.get_return_type().is_none();
        let call = builder
            .build_call(callee, &args, if is_void { "" } else { "call" })
            .expect("call");
        self.add_call_byval_attributes(call);
        call.set_tail_call(true);

        if is_void {
            builder.build_return(None).expect("ret");
        } else {
            let result = call
                .try_as_basic_value()
                .left()
                .expect("non-void call result");
            builder.build_return(Some(&result)).expect("ret");
        }
    }

    /// The registration constructor:
    ///
    /// ```text
    /// void f__init__() {
    ///     extension_point_ptr = augmentum_create_extension_point(
    ///         module_name, symbol_name, <type descriptor calls>,
    ///         &fn_ptr, f__original__, f__extended__, f__reflect__);
    /// }
    /// ```
    fn make_init(&mut self) -> FunctionValue<'ctx> {
        let ctor_ty = self.ctx.void_type().fn_type(&[], false);
        let ctor = self.module.add_function(
            &global_name(&self.name, "init"),
            ctor_ty,
            Some(Linkage::Private),
        );

        let block = self.ctx.append_basic_block(ctor, "");
        let builder = self.ctx.create_builder();
        builder.position_at_end(block);

        let module_name_global = cstring_global(
            self.module,
            self.ctx,
            &global_name("module", "name"),
            &self.module.get_name().to_string_lossy(),
        );
        let module_name = builder
            .build_pointer_cast(module_name_global.as_pointer_value(), self.i8_ptr_ty, "module_name")
            .expect("cast");
        let symbol_global = cstring_global(
            self.module,
            self.ctx,
            &global_name(&self.name, "name"),
            &self.name,
        );
        let symbol_name = builder
            .build_pointer_cast(symbol_global.as_pointer_value(), self.i8_ptr_ty, "symbol_name")
            .expect("cast");

        let mut emitter =
            TypeDescEmitter::new(self.module, &builder, self.td_ptr_ty, self.i8_ptr_ty);
        let type_desc = emitter.emit(self.fn_type.as_any_type_enum());

        // Erase the typed pointers down to the runtime's canonical shapes.
        let raw_fn_ptr_ptr_ty = self.raw_fn_ptr_ty.ptr_type(AddressSpace::default());
        let fn_ptr_erased = builder
            .build_pointer_cast(
                self.fn_ptr.expect("globals declared").as_pointer_value(),
                raw_fn_ptr_ptr_ty,
                "fn_ptr_erased",
            )
            .expect("cast");
        let original_erased = builder
            .build_pointer_cast(
                self.original.as_global_value().as_pointer_value(),
                self.raw_fn_ptr_ty,
                "original_erased",
            )
            .expect("cast");
        let extended_erased = builder
            .build_pointer_cast(
                self.extended
                    .expect("extended synthesised")
                    .as_global_value()
                    .as_pointer_value(),
                self.raw_fn_ptr_ty,
                "extended_erased",
            )
            .expect("cast");
        let reflect_ptr = self
            .reflect
            .expect("reflect synthesised")
            .as_global_value()
            .as_pointer_value();

        let reflect_ptr_ty = self
            .ctx
            .void_type()
            .fn_type(&[self.i8_ptr_ty.into(), self.i8_ptr_ptr_ty.into()], false)
            .ptr_type(AddressSpace::default());
        let create = self.runtime_fn(symbols::CREATE_EXTENSION_POINT, || {
            self.ep_ptr_ty.fn_type(
                &[
                    self.i8_ptr_ty.into(),
                    self.i8_ptr_ty.into(),
                    self.td_ptr_ty.into(),
                    raw_fn_ptr_ptr_ty.into(),
                    self.raw_fn_ptr_ty.into(),
                    self.raw_fn_ptr_ty.into(),
                    reflect_ptr_ty.into(),
                ],
                false,
            )
        });

        let call = builder
            .build_call(
                create,
                &[
                    module_name.into(),
                    symbol_name.into(),
                    type_desc.into(),
                    fn_ptr_erased.into(),
                    original_erased.into(),
                    extended_erased.into(),
                    reflect_ptr.into(),
                ],
                "extension_point",
            )
            .expect("create_extension_point call");
        call.set_tail_call(true);

        let point = call
            .try_as_basic_value()
            .left()
            .expect("extension point value");
        builder
            .build_store(
                self.extension_point_ptr
                    .expect("globals declared")
                    .as_pointer_value(),
                point,
            )
            .expect("store");
        builder.build_return(None).expect("ret");

        ctor
    }

    /// Emit a call printing `message` from generated code. Debugging aid
    /// for synthesised bodies; not referenced by the production artefacts.
    #[allow(dead_code)]
    fn gen_debug_print(&self, builder: &inkwell::builder::Builder<'ctx>, message: &str) {
        let text = cstring_global(
            self.module,
            self.ctx,
            &global_name("debug", &format!("msg__{message}")),
            message,
        );
        let ptr = builder
            .build_pointer_cast(text.as_pointer_value(), self.i8_ptr_ty, "debug_msg")
            .expect("cast");
        let print = self.runtime_fn(symbols::DEBUG_PRINT, || {
            self.ctx
                .void_type()
                .fn_type(&[self.i8_ptr_ty.into()], false)
        });
        let call = builder.build_call(print, &[ptr.into()], "").expect("call");
        call.set_tail_call(true);
    }

    /// Propagate `byval` attributes from the target's parameters onto a
    /// synthesised function's parameters.
    fn add_param_byval_attributes(&self, function: FunctionValue<'ctx>) {
        for (index, attr) in self.byval.iter().enumerate() {
            if let Some(attr) = attr {
                function.add_attribute(AttributeLoc::Param(index as u32), *attr);
            }
        }
    }

    /// Propagate `byval` attributes onto a synthesised call site.
    fn add_call_byval_attributes(&self, call: CallSiteValue<'ctx>) {
        for (index, attr) in self.byval.iter().enumerate() {
            if let Some(attr) = attr {
                call.add_attribute(AttributeLoc::Param(index as u32), *attr);
            }
        }
    }

    fn runtime_fn(
        &self,
        name: &str,
        fn_type: impl FnOnce() -> FunctionType<'ctx>,
    ) -> FunctionValue<'ctx> {
        self.module
            .get_function(name)
            .unwrap_or_else(|| self.module.add_function(name, fn_type(), Some(Linkage::External)))
    }
}
