use serde::{Deserialize, Serialize};

use super::node::{Block, Span, Stmt};
use super::types::{Param, Signature, Type};
use crate::bytecode::ir::CodecError;

/// Size in bytes of pointers and of every frame-tag slot.
pub const POINTER_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
    /// Byte offset from the start of the struct.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub size: u64,
    /// Called with a pointer to the value before its storage is reclaimed.
    pub destructor: Option<FunctionId>,
    /// Called after the destructor, with the same pointer.
    pub deallocator: Option<FunctionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: Block,
    pub span: Span,
}

impl FunctionDef {
    pub fn signature(&self) -> Signature {
        Signature {
            params: self.params.clone(),
            ret: self.ret.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDef {
    pub name: String,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDef {
    pub var: VarDef,
    pub init: Option<super::node::Expr>,
}

/// A fully resolved program, as handed over by the front end.
///
/// Definitions are stored in arenas and referenced by id. Local variables of
/// every function share one arena; a `Let` statement declares its local.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub structs: Vec<StructDef>,
    pub functions: Vec<FunctionDef>,
    pub globals: Vec<GlobalDef>,
    pub locals: Vec<VarDef>,
    /// Top-level statements; `return` here sets the process exit code.
    pub main: Block,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_struct(&mut self, def: StructDef) -> StructId {
        self.structs.push(def);
        StructId(self.structs.len() as u32 - 1)
    }

    pub fn add_function(&mut self, def: FunctionDef) -> FunctionId {
        self.functions.push(def);
        FunctionId(self.functions.len() as u32 - 1)
    }

    /// Reserve a function id whose definition is supplied later with
    /// [`Program::define_function`]; lets bodies refer to functions declared
    /// after them.
    pub fn declare_function(&mut self, name: impl Into<String>, params: Vec<Param>, ret: Type) -> FunctionId {
        self.add_function(FunctionDef {
            name: name.into(),
            params,
            ret,
            body: Vec::new(),
            span: Span::default(),
        })
    }

    pub fn define_function(&mut self, id: FunctionId, body: Block) {
        self.functions[id.0 as usize].body = body;
    }

    pub fn add_global(&mut self, name: impl Into<String>, ty: Type, init: Option<super::node::Expr>) -> GlobalId {
        self.globals.push(GlobalDef {
            var: VarDef {
                name: name.into(),
                ty,
                span: Span::default(),
            },
            init,
        });
        GlobalId(self.globals.len() as u32 - 1)
    }

    pub fn add_local(&mut self, name: impl Into<String>, ty: Type) -> LocalId {
        self.locals.push(VarDef {
            name: name.into(),
            ty,
            span: Span::default(),
        });
        LocalId(self.locals.len() as u32 - 1)
    }

    pub fn push_main(&mut self, stmt: Stmt) {
        self.main.push(stmt);
    }

    pub fn function(&self, id: FunctionId) -> Option<&FunctionDef> {
        self.functions.get(id.0 as usize)
    }

    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalDef {
        &self.globals[id.0 as usize]
    }

    pub fn local(&self, id: LocalId) -> &VarDef {
        &self.locals[id.0 as usize]
    }

    /// Byte size of a value of type `ty`.
    pub fn size_of(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void => 0,
            Type::Bool => 1,
            Type::Int(int) => int.bytes(),
            Type::Pointer(_) | Type::Function(_) => POINTER_SIZE,
            Type::Array(elem, len) => self.size_of(elem) * len,
            Type::Struct(id) => self.struct_def(*id).size,
        }
    }

    /// Byte size of a parameter slot.
    pub fn param_size(&self, param: &Param) -> u64 {
        if param.by_ref {
            POINTER_SIZE
        } else {
            self.size_of(&param.ty)
        }
    }

    /// Destructor and deallocator attached to values of `ty`.
    pub fn cleanup_of(&self, ty: &Type) -> (Option<FunctionId>, Option<FunctionId>) {
        match ty {
            Type::Struct(id) => {
                let def = self.struct_def(*id);
                (def.destructor, def.deallocator)
            }
            Type::Void
            | Type::Bool
            | Type::Int(_)
            | Type::Pointer(_)
            | Type::Array(_, _)
            | Type::Function(_) => (None, None),
        }
    }

    /// Total size of the global region, including the exit-code slot.
    pub fn globals_size(&self) -> u64 {
        POINTER_SIZE + self.globals.iter().map(|g| self.size_of(&g.var.ty)).sum::<u64>()
    }

    /// Byte offset of a global from the global base.
    pub fn global_offset(&self, id: GlobalId) -> u64 {
        POINTER_SIZE
            + self.globals[..id.0 as usize]
                .iter()
                .map(|g| self.size_of(&g.var.ty))
                .sum::<u64>()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(self).map_err(CodecError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(bytes).map_err(CodecError::Decode)
    }
}
