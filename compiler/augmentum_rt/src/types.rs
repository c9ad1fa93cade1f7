//! Type descriptors.
//!
//! Every extension point carries a descriptor of its function type so that
//! advice can inspect arguments and return values reflectively. Descriptors
//! are interned: two structurally equal descriptors share identity, so
//! identity comparison (`std::ptr::eq`) is structural comparison. The graph
//! may be cyclic — a named struct can reference itself through a pointer —
//! which is why named structs can exist in a *forward* state whose element
//! list is filled in later.
//!
//! Descriptors are created during program initialisation (module
//! constructors run the interning calls emitted by the pass) and live until
//! process exit; nothing is ever released individually.

use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Integer widths the descriptor graph models directly. Anything else is
/// classified as unknown by the rewriter.
pub const SUPPORTED_INT_BITS: [u32; 5] = [1, 8, 16, 32, 64];

/// An interned type descriptor.
///
/// Obtain descriptors through the associated interning constructors
/// ([`TypeDesc::void`], [`TypeDesc::int`], [`TypeDesc::pointer`], ...);
/// there is no public way to build an unregistered one.
pub struct TypeDesc {
    kind: TypeKind,
    /// The unique pointer-to-self descriptor, allocated on first request.
    /// Keying the pointer descriptor on its element guarantees at most one
    /// pointer descriptor per element descriptor.
    ptr_to: OnceLock<&'static TypeDesc>,
}

/// The variant payload of a descriptor.
pub enum TypeKind {
    /// A type outside the modelled enumeration. Carries the defining
    /// module and the printed IR form; advice must treat the associated
    /// slot as an opaque blob.
    Unknown { module: String, signature: String },
    Void,
    Int { bits: u32 },
    Float { bits: u32 },
    Pointer { element: &'static TypeDesc },
    Array { element: &'static TypeDesc, len: u64 },
    Vector { element: &'static TypeDesc, len: u64 },
    Struct(StructDesc),
    Function {
        ret: &'static TypeDesc,
        args: Vec<&'static TypeDesc>,
    },
}

/// Payload of a struct descriptor, named or anonymous.
pub struct StructDesc {
    module: String,
    /// Empty for anonymous structs.
    name: String,
    /// Unset while the struct is a forward declaration.
    elems: OnceLock<Vec<&'static TypeDesc>>,
}

#[derive(Default)]
struct InternTables {
    unknowns: FxHashMap<String, &'static TypeDesc>,
    arrays: FxHashMap<(usize, u64), &'static TypeDesc>,
    vectors: FxHashMap<(usize, u64), &'static TypeDesc>,
    anon_structs: FxHashMap<String, &'static TypeDesc>,
    named_structs: FxHashMap<String, &'static TypeDesc>,
    functions: FxHashMap<String, &'static TypeDesc>,
}

fn tables() -> &'static Mutex<InternTables> {
    static TABLES: OnceLock<Mutex<InternTables>> = OnceLock::new();
    TABLES.get_or_init(Default::default)
}

fn key_of(desc: &'static TypeDesc) -> usize {
    desc as *const TypeDesc as usize
}

impl TypeDesc {
    fn leak(kind: TypeKind) -> &'static TypeDesc {
        Box::leak(Box::new(TypeDesc {
            kind,
            ptr_to: OnceLock::new(),
        }))
    }

    /// The variant payload.
    #[must_use]
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    // -- Interning constructors --

    /// The void descriptor.
    #[must_use]
    pub fn void() -> &'static TypeDesc {
        static VOID: OnceLock<&'static TypeDesc> = OnceLock::new();
        VOID.get_or_init(|| Self::leak(TypeKind::Void))
    }

    /// The integer descriptor of the given width.
    ///
    /// # Panics
    /// Panics on widths outside [`SUPPORTED_INT_BITS`].
    #[must_use]
    pub fn int(bits: u32) -> &'static TypeDesc {
        static INTS: OnceLock<[&'static TypeDesc; 5]> = OnceLock::new();
        let ints = INTS.get_or_init(|| {
            SUPPORTED_INT_BITS.map(|bits| Self::leak(TypeKind::Int { bits }))
        });
        let idx = SUPPORTED_INT_BITS
            .iter()
            .position(|&b| b == bits)
            .unwrap_or_else(|| panic!("unsupported integer width: i{bits}"));
        ints[idx]
    }

    /// The 32- or 64-bit float descriptor.
    ///
    /// # Panics
    /// Panics on widths other than 32 and 64.
    #[must_use]
    pub fn float(bits: u32) -> &'static TypeDesc {
        static FLOATS: OnceLock<[&'static TypeDesc; 2]> = OnceLock::new();
        let floats = FLOATS.get_or_init(|| {
            [32, 64].map(|bits| Self::leak(TypeKind::Float { bits }))
        });
        match bits {
            32 => floats[0],
            64 => floats[1],
            _ => panic!("unsupported float width: f{bits}"),
        }
    }

    /// The unique pointer descriptor for the given element descriptor.
    #[must_use]
    pub fn pointer(element: &'static TypeDesc) -> &'static TypeDesc {
        element.ptr()
    }

    /// The array descriptor `[len x element]`.
    #[must_use]
    pub fn array(element: &'static TypeDesc, len: u64) -> &'static TypeDesc {
        let mut tables = tables().lock();
        *tables
            .arrays
            .entry((key_of(element), len))
            .or_insert_with(|| Self::leak(TypeKind::Array { element, len }))
    }

    /// The vector descriptor `<len x element>`.
    #[must_use]
    pub fn vector(element: &'static TypeDesc, len: u64) -> &'static TypeDesc {
        let mut tables = tables().lock();
        *tables
            .vectors
            .entry((key_of(element), len))
            .or_insert_with(|| Self::leak(TypeKind::Vector { element, len }))
    }

    /// The anonymous struct descriptor with the given element list.
    /// Keyed by canonical signature.
    #[must_use]
    pub fn anon_struct(elem_types: Vec<&'static TypeDesc>) -> &'static TypeDesc {
        let candidate = TypeDesc {
            kind: TypeKind::Struct(StructDesc::new(String::new(), String::new(), Some(elem_types))),
            ptr_to: OnceLock::new(),
        };
        let key = candidate.signature();
        let mut tables = tables().lock();
        *tables
            .anon_structs
            .entry(key)
            .or_insert_with(|| Box::leak(Box::new(candidate)))
    }

    /// The named struct descriptor for `module::name`, completed with the
    /// given element list.
    ///
    /// If a forward declaration exists it is completed in place. If a
    /// definition exists, the element lists must match descriptor for
    /// descriptor.
    ///
    /// # Panics
    /// Panics when an existing definition has a different element list.
    #[must_use]
    pub fn named_struct(
        module: &str,
        name: &str,
        elem_types: Vec<&'static TypeDesc>,
    ) -> &'static TypeDesc {
        let desc = Self::forward_struct(module, name);
        desc.set_elem_types(elem_types);
        desc
    }

    /// The named struct descriptor for `module::name`, as a forward
    /// declaration if it does not exist yet.
    #[must_use]
    pub fn forward_struct(module: &str, name: &str) -> &'static TypeDesc {
        let key = format!("{module}::{name}");
        let mut tables = tables().lock();
        *tables.named_structs.entry(key).or_insert_with(|| {
            Self::leak(TypeKind::Struct(StructDesc::new(
                module.to_owned(),
                name.to_owned(),
                None,
            )))
        })
    }

    /// The function descriptor `ret (args...)`. Keyed by canonical
    /// signature.
    #[must_use]
    pub fn function(
        ret: &'static TypeDesc,
        args: Vec<&'static TypeDesc>,
    ) -> &'static TypeDesc {
        let candidate = TypeDesc {
            kind: TypeKind::Function { ret, args },
            ptr_to: OnceLock::new(),
        };
        let key = candidate.signature();
        let mut tables = tables().lock();
        *tables
            .functions
            .entry(key)
            .or_insert_with(|| Box::leak(Box::new(candidate)))
    }

    /// The opaque descriptor for a type outside the modelled enumeration,
    /// keyed by `module::signature`.
    #[must_use]
    pub fn unknown(module: &str, signature: &str) -> &'static TypeDesc {
        let key = format!("{module}::{signature}");
        let mut tables = tables().lock();
        *tables.unknowns.entry(key).or_insert_with(|| {
            Self::leak(TypeKind::Unknown {
                module: module.to_owned(),
                signature: signature.to_owned(),
            })
        })
    }

    /// The unique pointer descriptor whose element is `self`.
    #[must_use]
    pub fn ptr(&'static self) -> &'static TypeDesc {
        self.ptr_to
            .get_or_init(|| Self::leak(TypeKind::Pointer { element: self }))
    }

    // -- Struct operations --

    /// Complete a forward struct declaration, or re-assert an existing
    /// definition.
    ///
    /// # Panics
    /// Panics when called on a non-struct descriptor or when the struct is
    /// already defined with a different element list.
    pub fn set_elem_types(&self, elem_types: Vec<&'static TypeDesc>) {
        let TypeKind::Struct(data) = &self.kind else {
            panic!("set_elem_types on non-struct descriptor '{self}'");
        };
        let current = data.elems.get_or_init(|| elem_types.clone());
        let matches = current.len() == elem_types.len()
            && current
                .iter()
                .zip(&elem_types)
                .all(|(a, b)| std::ptr::eq(*a, *b));
        assert!(
            matches,
            "struct '{}::{}' redefined with mismatching element types",
            data.module, data.name
        );
    }

    /// Whether this is a named struct whose element list has not been set.
    #[must_use]
    pub fn is_forward(&self) -> bool {
        matches!(&self.kind, TypeKind::Struct(data) if data.elems.get().is_none())
    }

    /// Whether this is an anonymous struct.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(&self.kind, TypeKind::Struct(data) if data.name.is_empty())
    }

    /// The struct's name, `None` for anonymous structs.
    #[must_use]
    pub fn struct_name(&self) -> Option<&str> {
        match &self.kind {
            TypeKind::Struct(data) if !data.name.is_empty() => Some(&data.name),
            _ => None,
        }
    }

    /// The struct's element descriptors. Empty while forward.
    #[must_use]
    pub fn elem_types(&self) -> &[&'static TypeDesc] {
        match &self.kind {
            TypeKind::Struct(data) => data.elems.get().map_or(&[], Vec::as_slice),
            _ => panic!("elem_types on non-struct descriptor '{self}'"),
        }
    }

    // -- Function operations --

    /// The return descriptor of a function descriptor.
    #[must_use]
    pub fn return_type(&self) -> &'static TypeDesc {
        match &self.kind {
            TypeKind::Function { ret, .. } => ret,
            _ => panic!("return_type on non-function descriptor '{self}'"),
        }
    }

    /// The argument count of a function descriptor.
    #[must_use]
    pub fn num_args(&self) -> usize {
        self.arg_types().len()
    }

    /// The `i`th argument descriptor of a function descriptor.
    #[must_use]
    pub fn arg_type(&self, i: usize) -> &'static TypeDesc {
        self.arg_types()[i]
    }

    /// All argument descriptors of a function descriptor.
    #[must_use]
    pub fn arg_types(&self) -> &[&'static TypeDesc] {
        match &self.kind {
            TypeKind::Function { args, .. } => args,
            _ => panic!("arg_types on non-function descriptor '{self}'"),
        }
    }

    // -- Signatures --

    /// Canonical textual signature.
    ///
    /// Named structs print as `'module::name' ` rather than their body;
    /// this is what keeps recursive aggregates finite.
    #[must_use]
    pub fn signature(&self) -> String {
        match &self.kind {
            TypeKind::Unknown { signature, .. } => signature.clone(),
            TypeKind::Void => "void".to_owned(),
            TypeKind::Int { bits } => format!("int{bits}"),
            TypeKind::Float { bits } => {
                if *bits == 32 { "float" } else { "double" }.to_owned()
            }
            TypeKind::Pointer { element } => format!("{}*", element.signature()),
            TypeKind::Array { element, len } => {
                format!("[{len} x {}]", element.signature())
            }
            TypeKind::Vector { element, len } => {
                format!("<{len} x {}>", element.signature())
            }
            TypeKind::Struct(data) => {
                if data.name.is_empty() {
                    let elems: Vec<String> = self
                        .elem_types()
                        .iter()
                        .map(|e| e.signature())
                        .collect();
                    format!("{{{}}}", elems.join(", "))
                } else {
                    format!("'{}::{}' ", data.module, data.name)
                }
            }
            TypeKind::Function { ret, args } => {
                let args: Vec<String> = args.iter().map(|a| a.signature()).collect();
                format!("{} ({})", ret.signature(), args.join(", "))
            }
        }
    }
}

impl StructDesc {
    fn new(module: String, name: String, elems: Option<Vec<&'static TypeDesc>>) -> Self {
        let cell = OnceLock::new();
        if let Some(elems) = elems {
            let _ = cell.set(elems);
        }
        StructDesc {
            module,
            name,
            elems: cell,
        }
    }

    /// The module that defines the struct.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_signatures() {
        assert_eq!(TypeDesc::void().signature(), "void");
        assert_eq!(TypeDesc::int(1).signature(), "int1");
        assert_eq!(TypeDesc::int(32).signature(), "int32");
        assert_eq!(TypeDesc::float(32).signature(), "float");
        assert_eq!(TypeDesc::float(64).signature(), "double");
    }

    #[test]
    fn test_primitives_are_interned() {
        assert!(std::ptr::eq(TypeDesc::int(32), TypeDesc::int(32)));
        assert!(std::ptr::eq(TypeDesc::void(), TypeDesc::void()));
        assert!(!std::ptr::eq(TypeDesc::int(32), TypeDesc::int(64)));
    }

    #[test]
    fn test_pointer_is_unique_per_element() {
        let i32_t = TypeDesc::int(32);
        let p1 = i32_t.ptr();
        let p2 = TypeDesc::pointer(i32_t);
        assert!(std::ptr::eq(p1, p2));
        assert_eq!(p1.signature(), "int32*");
        // A pointer to a pointer is its own descriptor.
        assert!(!std::ptr::eq(p1, p1.ptr()));
        assert_eq!(p1.ptr().signature(), "int32**");
    }

    #[test]
    fn test_array_and_vector_signatures() {
        let arr = TypeDesc::array(TypeDesc::float(64), 4);
        assert_eq!(arr.signature(), "[4 x double]");
        assert!(std::ptr::eq(arr, TypeDesc::array(TypeDesc::float(64), 4)));

        let vec = TypeDesc::vector(TypeDesc::int(8), 16);
        assert_eq!(vec.signature(), "<16 x int8>");
        assert!(!std::ptr::eq(
            vec,
            TypeDesc::vector(TypeDesc::int(8), 8)
        ));
    }

    #[test]
    fn test_anon_struct_interning() {
        let a = TypeDesc::anon_struct(vec![TypeDesc::int(64), TypeDesc::float(64)]);
        let b = TypeDesc::anon_struct(vec![TypeDesc::int(64), TypeDesc::float(64)]);
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.signature(), "{int64, double}");
        assert!(a.is_anonymous());
        assert!(!a.is_forward());
    }

    #[test]
    fn test_function_interning() {
        let f1 = TypeDesc::function(TypeDesc::int(32), vec![TypeDesc::int(32), TypeDesc::int(32)]);
        let f2 = TypeDesc::function(TypeDesc::int(32), vec![TypeDesc::int(32), TypeDesc::int(32)]);
        assert!(std::ptr::eq(f1, f2));
        assert_eq!(f1.signature(), "int32 (int32, int32)");
        assert_eq!(f1.num_args(), 2);
        assert!(std::ptr::eq(f1.return_type(), TypeDesc::int(32)));
        assert!(std::ptr::eq(f1.arg_type(1), TypeDesc::int(32)));
    }

    #[test]
    fn test_forward_struct_completion() {
        let fwd = TypeDesc::forward_struct("m.c", "Pair");
        assert!(fwd.is_forward());
        assert_eq!(fwd.signature(), "'m.c::Pair' ");

        let defined =
            TypeDesc::named_struct("m.c", "Pair", vec![TypeDesc::int(64), TypeDesc::int(64)]);
        assert!(std::ptr::eq(fwd, defined));
        assert!(!fwd.is_forward());
        assert_eq!(fwd.elem_types().len(), 2);

        // Re-declaring with the same layout is fine.
        let again =
            TypeDesc::named_struct("m.c", "Pair", vec![TypeDesc::int(64), TypeDesc::int(64)]);
        assert!(std::ptr::eq(fwd, again));
    }

    #[test]
    #[should_panic(expected = "mismatching element types")]
    fn test_struct_redefinition_mismatch_aborts() {
        let _ = TypeDesc::named_struct("m.c", "Clash", vec![TypeDesc::int(32)]);
        let _ = TypeDesc::named_struct("m.c", "Clash", vec![TypeDesc::int(64)]);
    }

    #[test]
    fn test_recursive_named_struct() {
        // Node { i32; Node* } ties the knot through a forward declaration.
        let node = TypeDesc::forward_struct("list.c", "Node");
        let node_ptr = node.ptr();
        node.set_elem_types(vec![TypeDesc::int(32), node_ptr]);

        assert!(!node.is_forward());
        assert_eq!(node.signature(), "'list.c::Node' ");
        assert_eq!(node_ptr.signature(), "'list.c::Node' *");
        assert!(std::ptr::eq(node.elem_types()[1], node_ptr));

        // Using the type in both argument and return position resolves to
        // the same descriptor with no re-entry into construction.
        let f = TypeDesc::function(node_ptr, vec![node_ptr]);
        assert!(std::ptr::eq(f.return_type(), f.arg_type(0)));
    }

    #[test]
    fn test_unknown_interning() {
        let u1 = TypeDesc::unknown("m.c", "<vscale x 4 x i32>");
        let u2 = TypeDesc::unknown("m.c", "<vscale x 4 x i32>");
        let u3 = TypeDesc::unknown("other.c", "<vscale x 4 x i32>");
        assert!(std::ptr::eq(u1, u2));
        assert!(!std::ptr::eq(u1, u3));
        assert_eq!(u1.signature(), "<vscale x 4 x i32>");
    }
}
