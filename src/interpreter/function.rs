//! Per-call state and the basic-block dispatch loop.

use crate::interpreter::{externs, intrinsics};
use crate::mir::{BlockId, DropKind, Path, Statement, Terminator};
use crate::module::{FunctionDef, ModuleTree};
use crate::ty::{BorrowKind, RawType, TypeRef, TypeWrapper, POINTER_SIZE};
use crate::value::{Value, ValueRef};
use anyhow::{bail, ensure, Result};
use tracing::{debug, trace};

/// Invoke a function by path with already-evaluated arguments. Externs are
/// routed to the extern handler; everything else walks the MIR.
pub fn invoke_fn(tree: &ModuleTree, path: &Path, args: Vec<Value>) -> Result<Value> {
    let fcn = tree.get_function(path)?.clone();
    debug!("invoking `{path}` with {} args", args.len());
    for (i, arg) in args.iter().enumerate() {
        trace!("- argument({i}) = {arg:?}");
    }

    if let Some(link) = &fcn.external {
        return externs::invoke_extern(&link.name, &link.abi, args);
    }

    let mut state = FrameState::new(tree, &fcn, args)?;
    state.run()
}

enum Flow {
    Goto(BlockId),
    Return,
}

/// All storage of one invocation: return slot, arguments (moved in),
/// zero-initialized locals, and drop flags.
pub(super) struct FrameState<'a> {
    pub(super) tree: &'a ModuleTree,
    pub(super) fcn: &'a FunctionDef,
    pub(super) ret: Value,
    pub(super) args: Vec<Value>,
    pub(super) locals: Vec<Value>,
    pub(super) drop_flags: Vec<bool>,
}

fn slot_value(ty: &TypeRef) -> Result<Value> {
    // Locals can be `!`, but they can never be accessed.
    if ty.wrappers.is_empty() && matches!(ty.raw, RawType::Unreachable) {
        return Ok(Value::unit());
    }
    Value::for_type(ty)
}

impl<'a> FrameState<'a> {
    pub(super) fn new(tree: &'a ModuleTree, fcn: &'a FunctionDef, args: Vec<Value>) -> Result<Self> {
        ensure!(
            args.len() == fcn.args.len(),
            "function `{}` takes {} arguments, got {}",
            fcn.path,
            fcn.args.len(),
            args.len()
        );
        let ret = slot_value(&fcn.ret_ty)?;
        let locals = fcn.body.locals.iter().map(slot_value).collect::<Result<Vec<_>>>()?;
        Ok(Self { tree, fcn, ret, args, locals, drop_flags: fcn.body.drop_flags.clone() })
    }

    pub(super) fn run(&mut self) -> Result<Value> {
        let mut bb_idx = 0;
        loop {
            let block = self
                .fcn
                .body
                .blocks
                .get(bb_idx)
                .ok_or_else(|| anyhow::anyhow!("block {bb_idx} out of range in `{}`", self.fcn.path))?
                .clone();

            for (stmt_idx, statement) in block.statements.iter().enumerate() {
                trace!("BB{bb_idx}/{stmt_idx}: {statement:?}");
                self.execute_statement(statement)?;
            }

            trace!("BB{bb_idx}/TERM: {:?}", block.terminator);
            match self.execute_terminator(&block.terminator)? {
                Flow::Goto(next) => bb_idx = next,
                Flow::Return => return Ok(std::mem::take(&mut self.ret)),
            }
        }
    }

    fn execute_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Assign { dst, src } => {
                let value = self.eval_rvalue(src, dst)?;
                trace!("- {value:?}");
                self.write_lvalue(dst, value)
            }
            Statement::SetDropFlag { idx, new_val, other } => {
                let other_val = match other {
                    Some(other) => *self
                        .drop_flags
                        .get(*other)
                        .ok_or_else(|| anyhow::anyhow!("drop flag {other} out of range"))?,
                    None => false,
                };
                let flag = self
                    .drop_flags
                    .get_mut(*idx)
                    .ok_or_else(|| anyhow::anyhow!("drop flag {idx} out of range"))?;
                *flag = other_val != *new_val;
                trace!("- flags[{idx}] = {flag}");
                Ok(())
            }
            Statement::Drop { slot, flag, kind } => {
                if let Some(flag) = flag {
                    let armed = *self
                        .drop_flags
                        .get(*flag)
                        .ok_or_else(|| anyhow::anyhow!("drop flag {flag} out of range"))?;
                    if !armed {
                        return Ok(());
                    }
                }
                let (vref, ty) = self.project(slot)?;
                self.drop_value(vref, &ty, *kind == DropKind::Shallow)
                // Validity of the slot is now cleared; the representation is
                // untouched.
            }
            Statement::Asm => bail!("inline assembly is not executable at this layer"),
            Statement::ScopeEnd => bail!("ScopeEnd statement is not executable at this layer"),
        }
    }

    fn execute_terminator(&mut self, terminator: &Terminator) -> Result<Flow> {
        match terminator {
            Terminator::Goto(bb) => Ok(Flow::Goto(*bb)),
            Terminator::Return => Ok(Flow::Return),
            Terminator::If { cond, bb_true, bb_false } => {
                let (vref, _) = self.project(cond)?;
                let byte = self.ref_bytes(&vref, 0, 1)?[0];
                ensure!(byte <= 1, "If condition is neither 0 nor 1 (read {byte})");
                Ok(Flow::Goto(if byte == 1 { *bb_true } else { *bb_false }))
            }
            Terminator::Switch { val, targets } => {
                let (vref, ty) = self.project(val)?;
                ensure!(ty.wrappers.is_empty(), "Switch on wrapped type `{ty}`");
                let RawType::Composite(composite) = &ty.raw else {
                    bail!("Switch on non-composite type `{ty}`");
                };
                let body = composite.body()?;

                let mut found = None;
                let mut default = None;
                for (vidx, variant) in body.variants.iter().enumerate() {
                    if variant.tag_data.is_empty() {
                        // Verified at load time to be unique.
                        default = Some(vidx);
                        continue;
                    }
                    let base_field = variant
                        .base_field
                        .ok_or_else(|| anyhow::anyhow!("variant {vidx} of `{ty}` has no tag location"))?;
                    let (tag_ofs, _) = ty.tag_offset(base_field, &variant.field_path)?;
                    let stored = self.ref_bytes(&vref, tag_ofs, variant.tag_data.len())?;
                    if stored == variant.tag_data {
                        found = Some(vidx);
                        break;
                    }
                }

                let vidx = found.or(default).ok_or_else(|| {
                    anyhow::anyhow!("Switch on `{ty}` matched no variant and has no default")
                })?;
                let target = targets
                    .get(vidx)
                    .ok_or_else(|| anyhow::anyhow!("Switch has no target for variant {vidx}"))?;
                Ok(Flow::Goto(*target))
            }
            Terminator::Call { dst, target, args, ret_block } => {
                let mut call_args = Vec::with_capacity(args.len());
                for arg in args {
                    let (value, _) = self.param_to_value(arg)?;
                    call_args.push(value);
                }
                let result = match target {
                    crate::mir::CallTarget::Intrinsic { name, params } => {
                        intrinsics::invoke_intrinsic(name, params, call_args)?
                    }
                    crate::mir::CallTarget::Path(path) => invoke_fn(self.tree, path, call_args)?,
                    crate::mir::CallTarget::Value(lv) => {
                        let (vref, _) = self.project(lv)?;
                        let word = self.ref_read_usize(&vref, 0)?;
                        ensure!(word == 0, "call through a function pointer with nonzero offset {word}");
                        let handle = self
                            .ref_relocation(&vref, 0)?
                            .ok_or_else(|| anyhow::anyhow!("call through a pointer with no relocation"))?;
                        let path = handle
                            .as_function()
                            .ok_or_else(|| anyhow::anyhow!("call through a non-function relocation"))?
                            .clone();
                        invoke_fn(self.tree, &path, call_args)?
                    }
                };
                self.write_lvalue(dst, result)?;
                Ok(Flow::Goto(*ret_block))
            }
            Terminator::Incomplete => bail!("Incomplete terminator reached"),
            Terminator::Diverge => bail!("Diverge terminator reached"),
            Terminator::Panic => bail!("Panic terminator reached"),
            Terminator::SwitchValue => bail!("SwitchValue terminator is not executable at this layer"),
        }
    }

    /// Run a value's destructor. Dispatch is type-directed; everything
    /// without drop glue is a no-op.
    fn drop_value(&mut self, vref: ValueRef, ty: &TypeRef, shallow: bool) -> Result<()> {
        match ty.wrappers.first() {
            None => match &ty.raw {
                RawType::Composite(composite) => {
                    let glue = composite.body()?.drop_glue.clone();
                    match glue {
                        Some(glue) if !shallow => {
                            let ptr = self.borrow_ref(&vref, BorrowKind::Move, ty)?;
                            invoke_fn(self.tree, &glue, vec![ptr])?;
                            Ok(())
                        }
                        _ => Ok(()),
                    }
                }
                RawType::TraitObject(_) => bail!("drop of a bare trait object"),
                _ => Ok(()),
            },
            Some(TypeWrapper::Borrow(BorrowKind::Move)) => {
                let pointee = ty.inner()?;
                if pointee.wrappers.is_empty() {
                    if let RawType::TraitObject(_) = &pointee.raw {
                        return self.drop_trait_object(&vref);
                    }
                }
                let handle = self
                    .ref_relocation(&vref, 0)?
                    .ok_or_else(|| anyhow::anyhow!("drop through a pointer with no relocation"))?;
                let cell = handle
                    .as_memory()
                    .ok_or_else(|| anyhow::anyhow!("drop through a function pointer"))?
                    .clone();
                let offset = self.ref_read_usize(&vref, 0)?;
                let size = pointee.size()?;
                self.drop_value(ValueRef::alloc(cell, offset, size), &pointee, shallow)
            }
            Some(_) => Ok(()),
        }
    }

    /// Drop `&move dyn T`: the destructor is the vtable's slot 0.
    fn drop_trait_object(&mut self, vref: &ValueRef) -> Result<()> {
        ensure!(vref.size == 2 * POINTER_SIZE, "trait object pointer is not fat");
        let data = self
            .ref_relocation(vref, 0)?
            .ok_or_else(|| anyhow::anyhow!("trait object data pointer has no relocation"))?;
        let data_cell = data
            .as_memory()
            .ok_or_else(|| anyhow::anyhow!("trait object data pointer targets a function"))?
            .clone();
        let data_ofs = self.ref_read_usize(vref, 0)?;

        let vtable = self
            .ref_relocation(vref, POINTER_SIZE)?
            .ok_or_else(|| anyhow::anyhow!("trait object vtable word has no relocation"))?;
        let vtable_cell = vtable
            .as_memory()
            .ok_or_else(|| anyhow::anyhow!("trait object vtable word targets a function"))?
            .clone();
        let drop_fn = vtable_cell
            .borrow()
            .relocation_at(0)
            .ok_or_else(|| anyhow::anyhow!("vtable has no drop slot relocation"))?
            .as_function()
            .ok_or_else(|| anyhow::anyhow!("vtable drop slot is not a function"))?
            .clone();

        let mut ptr = Value::zeroed(POINTER_SIZE);
        ptr.write_usize(0, data_ofs)?;
        ptr.set_relocation(0, crate::memory::AllocHandle::Memory(data_cell));
        invoke_fn(self.tree, &drop_fn, vec![ptr])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{BasicBlock, Body};

    fn flag_fn(flags: Vec<bool>, statements: Vec<Statement>) -> FunctionDef {
        FunctionDef {
            path: Path::from("t::flags"),
            args: vec![],
            ret_ty: TypeRef::unit(),
            external: None,
            body: Body {
                blocks: vec![BasicBlock { statements, terminator: Terminator::Return }],
                locals: vec![],
                drop_flags: flags,
            },
        }
    }

    #[test]
    fn set_drop_flag_algebra() {
        let tree = ModuleTree::default();
        let fcn = flag_fn(
            vec![false, true, false],
            vec![
                // No other flag: flags[0] = false != true = true
                Statement::SetDropFlag { idx: 0, new_val: true, other: None },
                // flags[2] = flags[1] != true = false
                Statement::SetDropFlag { idx: 2, new_val: true, other: Some(1) },
            ],
        );
        let mut state = FrameState::new(&tree, &fcn, vec![]).unwrap();
        state.run().unwrap();
        assert!(state.drop_flags[0]);
        assert!(!state.drop_flags[2]);
    }

    #[test]
    fn unreachable_locals_are_placeholders() {
        let tree = ModuleTree::default();
        let fcn = FunctionDef {
            path: Path::from("t::never"),
            args: vec![],
            ret_ty: TypeRef::unit(),
            external: None,
            body: Body {
                blocks: vec![BasicBlock { statements: vec![], terminator: Terminator::Return }],
                locals: vec![RawType::Unreachable.into(), RawType::U32.into()],
                drop_flags: vec![],
            },
        };
        let state = FrameState::new(&tree, &fcn, vec![]).unwrap();
        assert_eq!(state.locals[0].size(), 0);
        assert_eq!(state.locals[1].size(), 4);
    }

    #[test]
    fn argument_count_checked() {
        let tree = ModuleTree::default();
        let fcn = flag_fn(vec![], vec![]);
        assert!(FrameState::new(&tree, &fcn, vec![Value::zeroed(4)]).is_err());
    }
}
