use serde::{Serialize, Serializer};

/// What sort of primitive a [Type] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Integer { signed: bool },
    Float,
    Tuple,
    Void,
}

/// A language-level type. Primitive types are singletons and are compared by address, so two
/// types with the same layout (`UInt8` and `Char8`) are still distinct.
#[derive(Debug)]
pub struct Type {
    /// Size in bytes.
    pub size: u64,
    pub align: u64,
    pub is_floating: bool,
    pub is_void: bool,
    pub name: &'static str,
    pub kind: Kind,
}

impl Type {
    const fn integer(signed: bool, size: u64, name: &'static str) -> Self {
        Type {
            size,
            align: size,
            is_floating: false,
            is_void: false,
            name,
            kind: Kind::Integer { signed },
        }
    }

    const fn float(size: u64, name: &'static str) -> Self {
        Type {
            size,
            align: size,
            is_floating: true,
            is_void: false,
            name,
            kind: Kind::Float,
        }
    }

    const fn void() -> Self {
        Type {
            size: 0,
            align: 1,
            is_floating: false,
            is_void: true,
            name: "Void",
            kind: Kind::Void,
        }
    }

    /// Signedness for integer types, `None` for everything else.
    pub fn is_signed(&self) -> Option<bool> {
        match self.kind {
            Kind::Integer { signed } => Some(signed),
            _ => None,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        // Void is not a distinct type
        (self.is_void && other.is_void) || std::ptr::eq(self, other)
    }
}

impl Eq for Type {}

/// Types show up in AST dumps by name only.
impl Serialize for Type {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.name)
    }
}

pub static INT64: Type = Type::integer(true, 8, "Int64");
pub static INT32: Type = Type::integer(true, 4, "Int32");
pub static INT16: Type = Type::integer(true, 2, "Int16");
pub static INT8: Type = Type::integer(true, 1, "Int8");

pub static UINT64: Type = Type::integer(false, 8, "UInt64");
pub static UINT32: Type = Type::integer(false, 4, "UInt32");
pub static UINT16: Type = Type::integer(false, 2, "UInt16");
pub static UINT8: Type = Type::integer(false, 1, "UInt8");

// Elements of UTF-32/16/8 strings
pub static CHAR32: Type = Type::integer(false, 4, "Char32");
pub static CHAR16: Type = Type::integer(false, 2, "Char16");
pub static CHAR8: Type = Type::integer(false, 1, "Char8");

pub static FLOAT32: Type = Type::float(4, "Float32");
pub static FLOAT64: Type = Type::float(8, "Float64");

pub static VOID: Type = Type::void();

/// Every nameable primitive, in lookup order.
pub static PRIMITIVES: [&Type; 14] = [
    &INT64, &INT32, &INT16, &INT8, &UINT64, &UINT32, &UINT16, &UINT8, &CHAR32, &CHAR16, &CHAR8,
    &FLOAT32, &FLOAT64, &VOID,
];

/// Find a primitive type by the name it is written with in source.
pub fn lookup(name: &str) -> Option<&'static Type> {
    PRIMITIVES.iter().copied().find(|t| t.name == name)
}

/// An anonymous product type. Members are laid out largest first.
#[derive(Debug)]
pub struct Tuple<'a> {
    ty: Type,
    members: Vec<(String, &'a Type)>,
}

impl<'a> Tuple<'a> {
    pub fn new(mut members: Vec<(String, &'a Type)>) -> Self {
        if members.is_empty() {
            // The empty tuple is Void
            return Tuple { ty: Type::void(), members };
        }

        // Descending order, stable for equal sizes
        members.sort_by(|a, b| b.1.size.cmp(&a.1.size));
        let size = members.iter().map(|(_, t)| t.size).sum();
        let ty = Type {
            size,
            align: members[0].1.align,
            is_floating: false,
            is_void: false,
            name: "Tuple",
            kind: Kind::Tuple,
        };

        Tuple { ty, members }
    }

    /// The tuple viewed as a [Type]; its identity is this tuple's address.
    pub fn as_type(&self) -> &Type {
        &self.ty
    }

    pub fn members(&self) -> &[(String, &'a Type)] {
        &self.members
    }
}
