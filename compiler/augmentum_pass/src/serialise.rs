//! Type serialisation for the statistics sink.
//!
//! A compact, delimiter-friendly rendering of IR types. Function types
//! are wrapped in `@$ ... $@`, named structs are referenced by a
//! `@% module::name %@` tag (with the element layout recorded once per
//! tag on the side), and anything unrecognised is wrapped in
//! `@U ... U@` around the printed IR type. A by-value aggregate argument
//! is serialised as its pointee, mirroring the marshalling contract.

use inkwell::module::Module;
use inkwell::types::{AnyType, AnyTypeEnum, AsTypeRef, StructType};
use inkwell::values::FunctionValue;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::utils::{byval_attribute, type_to_string};

/// Where in a signature the type being serialised sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialisationContext {
    /// Anywhere nested.
    Na,
    /// Directly as a by-value aggregate argument.
    ByvalArg,
    /// The function type under inspection itself.
    Function,
}

/// What the serialiser learned about one named struct.
pub struct NamedStructRecord {
    /// The struct's IR name.
    pub struct_name: String,
    /// Serialised element layout, `{ a, b }`.
    pub layout: String,
    /// The printed IR type.
    pub llvm_name: String,
    pub named: bool,
    pub packed: bool,
    pub literal: bool,
    pub opaque: bool,
}

/// Serialises types and caches both the renderings and the named-struct
/// layouts encountered along the way.
#[derive(Default)]
pub struct TypeSerialiser {
    cache: FxHashMap<(usize, SerialisationContext), String>,
    named_structs: FxHashMap<String, NamedStructRecord>,
}

impl TypeSerialiser {
    /// Serialise a function's type, honouring per-argument `byval`
    /// attributes.
    pub fn serialise_function(&mut self, module: &Module, function: FunctionValue) -> String {
        self.serialise(
            module,
            function,
            function.get_type().as_any_type_enum(),
            SerialisationContext::Function,
        )
    }

    /// Named structs discovered so far, keyed by their reference tag.
    #[must_use]
    pub fn named_structs(&self) -> &FxHashMap<String, NamedStructRecord> {
        &self.named_structs
    }

    fn serialise(
        &mut self,
        module: &Module,
        function: FunctionValue,
        ty: AnyTypeEnum,
        ctx: SerialisationContext,
    ) -> String {
        let key = (ty.as_type_ref() as usize, ctx);
        // The function level is always recomputed: the rendering depends
        // on the argument attributes, not just the type.
        if ctx != SerialisationContext::Function {
            if let Some(cached) = self.cache.get(&key) {
                return cached.clone();
            }
        }

        let rendered = match ty {
            AnyTypeEnum::VoidType(_) => "void".to_owned(),
            AnyTypeEnum::IntType(int) => match int.get_bit_width() {
                width @ (1 | 8 | 16 | 32 | 64) => format!("i{width}"),
                _ => unknown_of(ty),
            },
            AnyTypeEnum::FloatType(_) => match type_to_string(ty).as_str() {
                "float" => "f32".to_owned(),
                "double" => "f64".to_owned(),
                _ => unknown_of(ty),
            },
            AnyTypeEnum::PointerType(pointer) => {
                let element = self.serialise(
                    module,
                    function,
                    pointer.get_element_type(),
                    SerialisationContext::Na,
                );
                if ctx == SerialisationContext::ByvalArg {
                    element
                } else {
                    format!("{element}*")
                }
            }
            AnyTypeEnum::ArrayType(array) => {
                let element = self.serialise(
                    module,
                    function,
                    array.get_element_type().as_any_type_enum(),
                    SerialisationContext::Na,
                );
                format!("[ {} x {element} ]", array.len())
            }
            AnyTypeEnum::StructType(strukt) => {
                return self.serialise_struct(module, function, strukt, key);
            }
            AnyTypeEnum::FunctionType(fn_ty) => {
                let mut rendered = format!(
                    "@$ {}",
                    match fn_ty.get_return_type() {
                        Some(ret) => self.serialise(
                            module,
                            function,
                            ret.as_any_type_enum(),
                            SerialisationContext::Na,
                        ),
                        None => "void".to_owned(),
                    }
                );
                for (index, param) in fn_ty.get_param_types().iter().enumerate() {
                    let arg_ctx = if ctx == SerialisationContext::Function
                        && byval_attribute(function, index as u32).is_some()
                    {
                        SerialisationContext::ByvalArg
                    } else {
                        SerialisationContext::Na
                    };
                    rendered.push_str(", ");
                    rendered.push_str(&self.serialise(
                        module,
                        function,
                        unsafe { AnyTypeEnum::new(param.as_type_ref()) },
                        arg_ctx,
                    ));
                }
                rendered.push_str(" $@");
                rendered
            }
            _ => {
                warn!(
                    module = %module.get_name().to_string_lossy(),
                    ty = %type_to_string(ty),
                    "[augmentum] type outside the modelled enumeration, recording as unknown"
                );
                unknown_of(ty)
            }
        };

        self.cache.insert(key, rendered.clone());
        rendered
    }

    fn serialise_struct(
        &mut self,
        module: &Module,
        function: FunctionValue,
        strukt: StructType,
        key: (usize, SerialisationContext),
    ) -> String {
        if let Some(name) = strukt.get_name() {
            let name = name.to_string_lossy().into_owned();
            let tag = format!(
                "@% {}::{} %@",
                module.get_name().to_string_lossy(),
                name
            );
            // Record the tag before walking the elements so recursive
            // aggregates resolve to the tag instead of recursing.
            self.cache.insert(key, tag.clone());
            let layout = self.serialise_struct_elements(module, function, strukt);
            self.named_structs
                .entry(tag.clone())
                .or_insert_with(|| NamedStructRecord {
                    struct_name: name,
                    layout,
                    llvm_name: type_to_string(strukt.as_any_type_enum()),
                    named: true,
                    packed: strukt.is_packed(),
                    literal: false,
                    opaque: strukt.is_opaque(),
                });
            tag
        } else {
            let rendered = self.serialise_struct_elements(module, function, strukt);
            self.cache.insert(key, rendered.clone());
            rendered
        }
    }

    fn serialise_struct_elements(
        &mut self,
        module: &Module,
        function: FunctionValue,
        strukt: StructType,
    ) -> String {
        let elements: Vec<String> = strukt
            .get_field_types()
            .iter()
            .map(|field| {
                self.serialise(
                    module,
                    function,
                    field.as_any_type_enum(),
                    SerialisationContext::Na,
                )
            })
            .collect();
        format!("{{ {} }}", elements.join(", "))
    }
}

fn unknown_of(ty: AnyTypeEnum) -> String {
    format!("@U{}U@", type_to_string(ty))
}
