//! Emission of runtime type-descriptor construction code.
//!
//! The per-function constructor must hand the runtime a descriptor of the
//! instrumented function's type. This module walks an IR type and emits
//! calls to the runtime's interning entry points
//! (`augmentum_get_*_type`), threading descriptor values through a
//! per-function visited map so each distinct IR type is materialised
//! once.
//!
//! Named structs are emitted forward-declaration-first: the placeholder
//! call is recorded in the visited map *before* recursing into element
//! types, which is what lets a self-referential aggregate terminate.
//! Anything outside the modelled enumeration (vectors included) is
//! emitted as an unknown descriptor carrying the printed IR type.

use inkwell::builder::Builder;
use inkwell::context::ContextRef;
use inkwell::module::{Linkage, Module};
use inkwell::types::{
    AnyType, AnyTypeEnum, AsTypeRef, FunctionType, IntType, PointerType, StructType,
};
use inkwell::values::{BasicMetadataValueEnum, FunctionValue, PointerValue};
use inkwell::AddressSpace;
use rustc_hash::FxHashMap;

use augmentum_rt::internal::symbols;

use crate::utils::{cstring_global, global_name, type_to_string};

fn type_key(ty: AnyTypeEnum) -> usize {
    ty.as_type_ref() as usize
}

/// Emits descriptor-construction calls into one constructor body.
pub(crate) struct TypeDescEmitter<'a, 'ctx> {
    ctx: ContextRef<'ctx>,
    module: &'a Module<'ctx>,
    builder: &'a Builder<'ctx>,
    td_ptr_ty: PointerType<'ctx>,
    i8_ptr_ty: PointerType<'ctx>,
    isize_ty: IntType<'ctx>,
    /// IR type identity -> already materialised descriptor value.
    visited: FxHashMap<usize, PointerValue<'ctx>>,
    module_name_ptr: Option<PointerValue<'ctx>>,
}

impl<'a, 'ctx> TypeDescEmitter<'a, 'ctx> {
    pub(crate) fn new(
        module: &'a Module<'ctx>,
        builder: &'a Builder<'ctx>,
        td_ptr_ty: PointerType<'ctx>,
        i8_ptr_ty: PointerType<'ctx>,
    ) -> Self {
        let ctx = module.get_context();
        TypeDescEmitter {
            ctx,
            module,
            builder,
            td_ptr_ty,
            i8_ptr_ty,
            isize_ty: ctx.i64_type(),
            visited: FxHashMap::default(),
            module_name_ptr: None,
        }
    }

    /// Emit (or reuse) the descriptor value for `ty`.
    pub(crate) fn emit(&mut self, ty: AnyTypeEnum<'ctx>) -> PointerValue<'ctx> {
        if let Some(&value) = self.visited.get(&type_key(ty)) {
            return value;
        }
        let value = match ty {
            AnyTypeEnum::VoidType(_) => self.emit_nullary(symbols::GET_VOID_TYPE),
            AnyTypeEnum::IntType(int) => match int.get_bit_width() {
                1 => self.emit_nullary(symbols::GET_I1_TYPE),
                8 => self.emit_nullary(symbols::GET_I8_TYPE),
                16 => self.emit_nullary(symbols::GET_I16_TYPE),
                32 => self.emit_nullary(symbols::GET_I32_TYPE),
                64 => self.emit_nullary(symbols::GET_I64_TYPE),
                _ => self.emit_unknown(ty),
            },
            AnyTypeEnum::FloatType(float) => {
                if float == self.ctx.f32_type() {
                    self.emit_nullary(symbols::GET_FLOAT_TYPE)
                } else if float == self.ctx.f64_type() {
                    self.emit_nullary(symbols::GET_DOUBLE_TYPE)
                } else {
                    self.emit_unknown(ty)
                }
            }
            AnyTypeEnum::PointerType(pointer) => self.emit_pointer(pointer),
            AnyTypeEnum::ArrayType(array) => {
                let element = self.emit(array.get_element_type().as_any_type_enum());
                let len = self.isize_ty.const_int(u64::from(array.len()), false);
                let get_array = self.runtime_fn(symbols::GET_ARRAY_TYPE, || {
                    self.td_ptr_ty
                        .fn_type(&[self.td_ptr_ty.into(), self.isize_ty.into()], false)
                });
                self.call_desc(get_array, &[element.into(), len.into()], "array_desc")
            }
            AnyTypeEnum::StructType(strukt) => self.emit_struct(strukt),
            AnyTypeEnum::FunctionType(function) => self.emit_function(function),
            // Vectors and any exotic types collapse to unknown.
            _ => self.emit_unknown(ty),
        };
        self.visited.insert(type_key(ty), value);
        value
    }

    fn emit_pointer(&mut self, pointer: PointerType<'ctx>) -> PointerValue<'ctx> {
        let element = self.emit(pointer.get_element_type());
        let get_ptr = self.runtime_fn(symbols::GET_PTR_TYPE, || {
            self.td_ptr_ty.fn_type(&[self.td_ptr_ty.into()], false)
        });
        self.call_desc(get_ptr, &[element.into()], "ptr_desc")
    }

    fn emit_struct(&mut self, strukt: StructType<'ctx>) -> PointerValue<'ctx> {
        match strukt.get_name() {
            Some(name) => {
                let name = name.to_string_lossy().into_owned();
                self.emit_named_struct(strukt, &name)
            }
            None => self.emit_anon_struct(strukt),
        }
    }

    fn emit_named_struct(&mut self, strukt: StructType<'ctx>, name: &str) -> PointerValue<'ctx> {
        let module_name = self.module_name_ptr();
        let struct_name = self.string_ptr(&global_name("struct", name), name, "struct_name");

        let get_forward = self.runtime_fn(symbols::GET_FORWARD_STRUCT_TYPE, || {
            self.td_ptr_ty
                .fn_type(&[self.i8_ptr_ty.into(), self.i8_ptr_ty.into()], false)
        });
        let descriptor = self.call_desc(
            get_forward,
            &[module_name.into(), struct_name.into()],
            "struct_desc",
        );

        // Recursive element types must find the placeholder, not re-enter.
        self.visited
            .insert(type_key(strukt.as_any_type_enum()), descriptor);

        let elements: Vec<PointerValue<'ctx>> = strukt
            .get_field_types()
            .iter()
            .map(|field| self.emit(field.as_any_type_enum()))
            .collect();
        let array = self.descriptor_array(&elements, "elem_descs");
        let count = self.isize_ty.const_int(elements.len() as u64, false);

        let set_elems = self.runtime_fn(symbols::SET_STRUCT_ELEM_TYPES, || {
            self.ctx.void_type().fn_type(
                &[
                    self.td_ptr_ty.into(),
                    self.isize_ty.into(),
                    self.td_ptr_ty.ptr_type(AddressSpace::default()).into(),
                ],
                false,
            )
        });
        let call = self
            .builder
            .build_call(
                set_elems,
                &[descriptor.into(), count.into(), array.into()],
                "",
            )
            .expect("set_struct_elem_types call");
        call.set_tail_call(true);

        descriptor
    }

    fn emit_anon_struct(&mut self, strukt: StructType<'ctx>) -> PointerValue<'ctx> {
        let elements: Vec<PointerValue<'ctx>> = strukt
            .get_field_types()
            .iter()
            .map(|field| self.emit(field.as_any_type_enum()))
            .collect();
        let array = self.descriptor_array(&elements, "elem_descs");
        let count = self.isize_ty.const_int(elements.len() as u64, false);

        let get_anon = self.runtime_fn(symbols::GET_ANON_STRUCT_TYPE, || {
            self.td_ptr_ty.fn_type(
                &[
                    self.isize_ty.into(),
                    self.td_ptr_ty.ptr_type(AddressSpace::default()).into(),
                ],
                false,
            )
        });
        self.call_desc(get_anon, &[count.into(), array.into()], "anon_struct_desc")
    }

    fn emit_function(&mut self, function: FunctionType<'ctx>) -> PointerValue<'ctx> {
        let ret = match function.get_return_type() {
            Some(ret) => self.emit(ret.as_any_type_enum()),
            None => self.emit_nullary(symbols::GET_VOID_TYPE),
        };
        let args: Vec<PointerValue<'ctx>> = function
            .get_param_types()
            .iter()
            .map(|param| self.emit(unsafe { AnyTypeEnum::new(param.as_type_ref()) }))
            .collect();
        let array = self.descriptor_array(&args, "arg_descs");
        let count = self.isize_ty.const_int(args.len() as u64, false);

        let get_function = self.runtime_fn(symbols::GET_FUNCTION_TYPE, || {
            self.td_ptr_ty.fn_type(
                &[
                    self.td_ptr_ty.into(),
                    self.isize_ty.into(),
                    self.td_ptr_ty.ptr_type(AddressSpace::default()).into(),
                ],
                false,
            )
        });
        self.call_desc(
            get_function,
            &[ret.into(), count.into(), array.into()],
            "fn_desc",
        )
    }

    fn emit_unknown(&mut self, ty: AnyTypeEnum<'ctx>) -> PointerValue<'ctx> {
        let printed = type_to_string(ty);
        let module_name = self.module_name_ptr();
        let signature =
            self.string_ptr(&global_name("unknown", &printed), &printed, "unknown_sig");

        let get_unknown = self.runtime_fn(symbols::GET_UNKNOWN_TYPE, || {
            self.td_ptr_ty
                .fn_type(&[self.i8_ptr_ty.into(), self.i8_ptr_ty.into()], false)
        });
        self.call_desc(
            get_unknown,
            &[module_name.into(), signature.into()],
            "unknown_desc",
        )
    }

    fn emit_nullary(&mut self, symbol: &str) -> PointerValue<'ctx> {
        let accessor = self.runtime_fn(symbol, || self.td_ptr_ty.fn_type(&[], false));
        self.call_desc(accessor, &[], "base_desc")
    }

    /// Pointer to the module-name string, created once per constructor.
    fn module_name_ptr(&mut self) -> PointerValue<'ctx> {
        if let Some(ptr) = self.module_name_ptr {
            return ptr;
        }
        let value = self.module.get_name().to_string_lossy().into_owned();
        let ptr = self.string_ptr(&global_name("module", "name"), &value, "module_name");
        self.module_name_ptr = Some(ptr);
        ptr
    }

    fn string_ptr(&self, global_id: &str, value: &str, label: &str) -> PointerValue<'ctx> {
        let global = cstring_global(self.module, self.ctx, global_id, value);
        self.builder
            .build_pointer_cast(global.as_pointer_value(), self.i8_ptr_ty, label)
            .expect("string pointer cast")
    }

    /// Stack array of descriptor pointers, decayed to its first element.
    /// The runtime constructors take `(count, array)` in place of the
    /// variadic tail a C runtime would use.
    fn descriptor_array(
        &self,
        values: &[PointerValue<'ctx>],
        label: &str,
    ) -> PointerValue<'ctx> {
        let array_ty = self.td_ptr_ty.array_type(values.len() as u32);
        let alloca = self.builder.build_alloca(array_ty, label).expect("alloca");
        let zero = self.isize_ty.const_zero();
        for (index, value) in values.iter().enumerate() {
            let idx = self.isize_ty.const_int(index as u64, false);
            // SAFETY: index is within the array just allocated.
            let slot = unsafe {
                self.builder
                    .build_in_bounds_gep(alloca, &[zero, idx], &format!("{label}{index}"))
            }
            .expect("gep");
            self.builder.build_store(slot, *value).expect("store");
        }
        // SAFETY: [0, 0] decays the array to a pointer to its first slot.
        unsafe {
            self.builder
                .build_in_bounds_gep(alloca, &[zero, zero], label)
        }
        .expect("gep")
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

    fn call_desc(
        &self,
        callee: FunctionValue<'ctx>,
        args: &[BasicMetadataValueEnum<'ctx>],
        name: &str,
    ) -> PointerValue<'ctx> {
        let call = self.builder.build_call(callee, args, name).expect("call");
        call.set_tail_call(true);
        call.try_as_basic_value()
            .left()
            .expect("descriptor constructors return a value")
            .into_pointer_value()
    }
}
