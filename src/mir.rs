//! The serialized IR the interpreter walks.
//!
//! Statements, terminators, rvalues and lvalues are closed tagged unions;
//! the executor pattern-matches exhaustively and raises a fatal error for
//! node kinds this layer does not execute, rather than falling through.

use crate::ty::{BorrowKind, RawType, TypeRef};
use std::fmt;

/// An item path, treated as an opaque interned-by-string name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(pub String);

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path(s.to_owned())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type BlockId = usize;

/// A place expression: storage roots composed with projections.
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Return,
    Local(usize),
    Argument(usize),
    Static(Path),
    Field { base: Box<LValue>, index: usize },
    Downcast { base: Box<LValue>, variant: usize },
    Index { base: Box<LValue>, index: Box<LValue> },
    Deref { base: Box<LValue> },
}

impl LValue {
    pub fn field(self, index: usize) -> LValue {
        LValue::Field { base: Box::new(self), index }
    }

    pub fn downcast(self, variant: usize) -> LValue {
        LValue::Downcast { base: Box::new(self), variant }
    }

    pub fn index(self, index: LValue) -> LValue {
        LValue::Index { base: Box::new(self), index: Box::new(index) }
    }

    pub fn deref(self) -> LValue {
        LValue::Deref { base: Box::new(self) }
    }
}

/// Literal operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int { value: i64, ty: RawType },
    Uint { value: u64, ty: RawType },
    Float { value: f64, ty: RawType },
    Bool(bool),
    StaticString(String),
    ItemAddr(Path),
}

/// Either a place to read or a literal to materialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    LValue(LValue),
    Constant(Constant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniOp {
    /// Bitwise not for integers, logical not for `bool`.
    Inv,
    /// Arithmetic negation for signed integers and floats.
    Neg,
}

/// Expressions producing a fresh value.
#[derive(Debug, Clone, PartialEq)]
pub enum RValue {
    Use(LValue),
    Constant(Constant),
    Borrow { kind: BorrowKind, val: LValue },
    Cast { val: LValue, ty: TypeRef },
    BinOp { op: BinOp, lhs: Param, rhs: Param },
    UniOp { op: UniOp, val: LValue },
    DstMeta { val: LValue },
    DstPtr { val: LValue },
    MakeDst { ptr: Param, meta: Param },
    Tuple { vals: Vec<Param> },
    Array { vals: Vec<Param> },
    SizedArray { val: Param, count: usize },
    Variant { path: Path, index: usize, val: Option<Param> },
    Struct { path: Path, vals: Vec<Param> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Deep,
    Shallow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Assign { dst: LValue, src: RValue },
    Drop { slot: LValue, flag: Option<usize>, kind: DropKind },
    SetDropFlag { idx: usize, new_val: bool, other: Option<usize> },
    Asm,
    ScopeEnd,
}

/// How a call names its callee.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    Path(Path),
    Intrinsic { name: String, params: Vec<TypeRef> },
    Value(LValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Incomplete,
    Goto(BlockId),
    Return,
    Diverge,
    Panic,
    If { cond: LValue, bb_true: BlockId, bb_false: BlockId },
    Switch { val: LValue, targets: Vec<BlockId> },
    SwitchValue,
    Call { dst: LValue, target: CallTarget, args: Vec<Param>, ret_block: BlockId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub statements: Vec<Statement>,
    pub terminator: Terminator,
}

/// A function body: blocks plus per-call storage shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub blocks: Vec<BasicBlock>,
    pub locals: Vec<TypeRef>,
    /// Initial states of the drop flags.
    pub drop_flags: Vec<bool>,
}
