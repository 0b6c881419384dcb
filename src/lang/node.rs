use serde::{Deserialize, Serialize};

use super::program::{FunctionId, GlobalId, LocalId};
use super::types::{IntType, Type};

/// Source position attached to statements and expressions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A resolved variable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarRef {
    Global(GlobalId),
    Local(LocalId),
    /// Parameter of the function being compiled, by position.
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Logical negation of a bool.
    Not,
    /// Bitwise complement.
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The comparison that holds exactly when `self` does not.
    pub fn negate(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Le => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Ge => CompareOp::Lt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

/// A typed expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Integer or bool literal; the value is truncated to the type's width.
    Literal(i64),
    Var(VarRef),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    AddressOf(Box<Expr>),
    Deref(Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    /// Field of a struct value, by field position in the struct definition.
    Field(Box<Expr>, usize),
    /// Integer conversion to `ty`.
    Cast(Box<Expr>),
    Call(FunctionId, Vec<Expr>),
    /// Address of a function, as a function pointer value.
    FunctionRef(FunctionId),
    CallIndirect(Box<Expr>, Vec<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type) -> Self {
        Self {
            kind,
            ty,
            span: Span::default(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn int(value: i64, int: IntType) -> Self {
        Self::new(ExprKind::Literal(value), Type::Int(int))
    }

    pub fn i64(value: i64) -> Self {
        Self::int(value, IntType::I64)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(ExprKind::Literal(value as i64), Type::Bool)
    }

    pub fn var(var: VarRef, ty: Type) -> Self {
        Self::new(ExprKind::Var(var), ty)
    }

    pub fn local(id: LocalId, ty: Type) -> Self {
        Self::var(VarRef::Local(id), ty)
    }

    pub fn global(id: GlobalId, ty: Type) -> Self {
        Self::var(VarRef::Global(id), ty)
    }

    pub fn param(index: usize, ty: Type) -> Self {
        Self::var(VarRef::Param(index), ty)
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        let ty = operand.ty.clone();
        Self::new(ExprKind::Unary(op, Box::new(operand)), ty)
    }

    /// Binary arithmetic; the result has the left operand's type.
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        let ty = lhs.ty.clone();
        Self::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), ty)
    }

    pub fn compare(op: CompareOp, lhs: Expr, rhs: Expr) -> Self {
        Self::new(ExprKind::Compare(op, Box::new(lhs), Box::new(rhs)), Type::Bool)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::new(
            ExprKind::Logical(LogicalOp::And, Box::new(lhs), Box::new(rhs)),
            Type::Bool,
        )
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Self::new(
            ExprKind::Logical(LogicalOp::Or, Box::new(lhs), Box::new(rhs)),
            Type::Bool,
        )
    }

    pub fn not(operand: Expr) -> Self {
        Self::new(ExprKind::Unary(UnaryOp::Not, Box::new(operand)), Type::Bool)
    }

    pub fn address_of(place: Expr) -> Self {
        let ty = Type::pointer_to(place.ty.clone());
        Self::new(ExprKind::AddressOf(Box::new(place)), ty)
    }

    pub fn deref(pointer: Expr) -> Self {
        let ty = pointer.ty.element().cloned().unwrap_or(Type::Void);
        Self::new(ExprKind::Deref(Box::new(pointer)), ty)
    }

    pub fn index(base: Expr, index: Expr) -> Self {
        let ty = base.ty.element().cloned().unwrap_or(Type::Void);
        Self::new(ExprKind::Index(Box::new(base), Box::new(index)), ty)
    }

    pub fn field(base: Expr, field: usize, ty: Type) -> Self {
        Self::new(ExprKind::Field(Box::new(base), field), ty)
    }

    pub fn cast(operand: Expr, to: IntType) -> Self {
        Self::new(ExprKind::Cast(Box::new(operand)), Type::Int(to))
    }

    pub fn call(function: FunctionId, args: Vec<Expr>, ret: Type) -> Self {
        Self::new(ExprKind::Call(function, args), ret)
    }

    pub fn function_ref(function: FunctionId, ty: Type) -> Self {
        Self::new(ExprKind::FunctionRef(function), ty)
    }

    pub fn call_indirect(callee: Expr, args: Vec<Expr>) -> Self {
        let ret = callee
            .ty
            .signature()
            .map(|sig| sig.ret.clone())
            .unwrap_or(Type::Void);
        Self::new(ExprKind::CallIndirect(Box::new(callee), args), ret)
    }

    /// Whether the expression denotes a memory location.
    pub fn is_place(&self) -> bool {
        match &self.kind {
            ExprKind::Var(_) | ExprKind::Deref(_) => true,
            ExprKind::Index(base, _) => {
                matches!(base.ty, Type::Pointer(_)) || base.is_place()
            }
            ExprKind::Field(base, _) => base.is_place(),
            _ => false,
        }
    }
}

pub type Block = Vec<Stmt>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

/// One `if`/`else if` arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfArm {
    pub cond: Expr,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Let {
        var: LocalId,
        init: Option<Expr>,
    },
    Assign {
        place: Expr,
        value: Expr,
    },
    Expr(Expr),
    If {
        arms: Vec<IfArm>,
        otherwise: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Block,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Block(Block),
    /// Run the destructor and deallocator of the pointee.
    Delete(Expr),
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            span: Span::default(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn let_(var: LocalId, init: Option<Expr>) -> Self {
        Self::new(StmtKind::Let { var, init })
    }

    pub fn assign(place: Expr, value: Expr) -> Self {
        Self::new(StmtKind::Assign { place, value })
    }

    pub fn expr(expr: Expr) -> Self {
        Self::new(StmtKind::Expr(expr))
    }

    pub fn if_(cond: Expr, body: Block, otherwise: Option<Block>) -> Self {
        Self::new(StmtKind::If {
            arms: vec![IfArm { cond, body }],
            otherwise,
        })
    }

    pub fn if_chain(arms: Vec<IfArm>, otherwise: Option<Block>) -> Self {
        Self::new(StmtKind::If { arms, otherwise })
    }

    pub fn while_(cond: Expr, body: Block) -> Self {
        Self::new(StmtKind::While { cond, body })
    }

    pub fn for_(init: Option<Stmt>, cond: Option<Expr>, step: Option<Stmt>, body: Block) -> Self {
        Self::new(StmtKind::For {
            init: init.map(Box::new),
            cond,
            step: step.map(Box::new),
            body,
        })
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(value))
    }

    pub fn brk() -> Self {
        Self::new(StmtKind::Break)
    }

    pub fn cont() -> Self {
        Self::new(StmtKind::Continue)
    }

    pub fn block(body: Block) -> Self {
        Self::new(StmtKind::Block(body))
    }

    pub fn delete(pointer: Expr) -> Self {
        Self::new(StmtKind::Delete(pointer))
    }
}
