use serde::{Deserialize, Serialize};

use super::program::{FunctionId, StructId};

/// Integer type descriptor: bit width and signedness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntType {
    pub bits: u8,
    pub signed: bool,
}

impl IntType {
    pub const I8: IntType = IntType { bits: 8, signed: true };
    pub const I16: IntType = IntType { bits: 16, signed: true };
    pub const I32: IntType = IntType { bits: 32, signed: true };
    pub const I64: IntType = IntType { bits: 64, signed: true };
    pub const U8: IntType = IntType { bits: 8, signed: false };
    pub const U16: IntType = IntType { bits: 16, signed: false };
    pub const U32: IntType = IntType { bits: 32, signed: false };
    pub const U64: IntType = IntType { bits: 64, signed: false };

    pub fn bytes(&self) -> u64 {
        u64::from(self.bits) / 8
    }
}

/// A callable signature, used by function pointer types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: Type,
}

/// One declared parameter.
///
/// By-reference parameters occupy a pointer-sized slot holding the address
/// of the caller's place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub by_ref: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            by_ref: false,
        }
    }

    pub fn by_ref(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            by_ref: true,
        }
    }
}

/// Resolved value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Bool,
    Int(IntType),
    Pointer(Box<Type>),
    Array(Box<Type>, u64),
    Struct(StructId),
    /// Pointer to a function with the given signature.
    Function(Box<Signature>),
}

impl Type {
    pub fn pointer_to(ty: Type) -> Type {
        Type::Pointer(Box::new(ty))
    }

    pub fn array_of(ty: Type, len: u64) -> Type {
        Type::Array(Box::new(ty), len)
    }

    pub fn function(params: Vec<Param>, ret: Type) -> Type {
        Type::Function(Box::new(Signature { params, ret }))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Pointee of a pointer type, element of an array type.
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Pointer(inner) | Type::Array(inner, _) => Some(inner),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Type::Function(sig) => Some(sig),
            _ => None,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int(int) => {
                write!(f, "{}{}", if int.signed { "i" } else { "u" }, int.bits)
            }
            Type::Pointer(inner) => write!(f, "*{}", inner),
            Type::Array(inner, len) => write!(f, "[{}; {}]", inner, len),
            Type::Struct(id) => write!(f, "struct#{}", id.0),
            Type::Function(sig) => {
                write!(f, "fn(")?;
                for (i, param) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if param.by_ref {
                        write!(f, "&")?;
                    }
                    write!(f, "{}", param.ty)?;
                }
                write!(f, ") -> {}", sig.ret)
            }
        }
    }
}
