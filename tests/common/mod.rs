//! Shared builders for assembling module trees in tests.

use crabwalk::mir::{
    BasicBlock, Body, Constant, LValue, Param, Path, RValue, Statement, Terminator,
};
use crabwalk::module::{FunctionDef, ModuleTree};
use crabwalk::ty::{RawType, TypeRef};
use crabwalk::value::Value;

pub fn assign(dst: LValue, src: RValue) -> Statement {
    Statement::Assign { dst, src }
}

pub fn block(statements: Vec<Statement>, terminator: Terminator) -> BasicBlock {
    BasicBlock { statements, terminator }
}

pub fn ret_block(statements: Vec<Statement>) -> BasicBlock {
    block(statements, Terminator::Return)
}

pub fn uint_const(value: u64, ty: RawType) -> Param {
    Param::Constant(Constant::Uint { value, ty })
}

pub fn use_uint(dst: LValue, value: u64, ty: RawType) -> Statement {
    assign(dst, RValue::Constant(Constant::Uint { value, ty }))
}

pub fn function(
    path: &str,
    args: Vec<TypeRef>,
    ret_ty: TypeRef,
    locals: Vec<TypeRef>,
    blocks: Vec<BasicBlock>,
) -> FunctionDef {
    FunctionDef {
        path: Path::from(path),
        args,
        ret_ty,
        external: None,
        body: Body { blocks, locals, drop_flags: vec![] },
    }
}

pub fn zero_arg(path: &str, ret_ty: TypeRef, locals: Vec<TypeRef>, blocks: Vec<BasicBlock>) -> FunctionDef {
    function(path, vec![], ret_ty, locals, blocks)
}

/// Verify the tree, then invoke a zero-argument function by path.
pub fn run_fn(tree: &ModuleTree, name: &str) -> anyhow::Result<Value> {
    tree.verify()?;
    crabwalk::invoke_fn(tree, &Path::from(name), vec![])
}
