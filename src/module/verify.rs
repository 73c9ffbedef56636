//! Load-time structural checks, run after decode and before execution.

use crate::mir::{Statement, Terminator};
use crate::module::ModuleTree;
use crate::ty::{RawType, TypeRef};
use anyhow::{ensure, Result};

pub fn verify(tree: &ModuleTree) -> Result<()> {
    for composite in tree.composites() {
        let body = composite.body()?;
        let ty: TypeRef = RawType::Composite(composite.clone()).into();

        let mut default_seen = false;
        for (vidx, variant) in body.variants.iter().enumerate() {
            if let Some(data_field) = variant.data_field {
                ensure!(
                    data_field < body.fields.len(),
                    "variant {vidx} of `{}` names payload field {data_field} of {}",
                    composite.path,
                    body.fields.len()
                );
            }
            if variant.tag_data.is_empty() {
                ensure!(
                    !default_seen,
                    "composite `{}` has two untagged variants",
                    composite.path
                );
                default_seen = true;
                continue;
            }
            let base_field = variant.base_field.ok_or_else(|| {
                anyhow::anyhow!(
                    "variant {vidx} of `{}` has tag data but no tag location",
                    composite.path
                )
            })?;
            let (_, tag_ty) = ty.tag_offset(base_field, &variant.field_path)?;
            let tag_size = tag_ty.size()?;
            ensure!(
                tag_size == variant.tag_data.len(),
                "variant {vidx} of `{}` has {} tag bytes for a {} byte tag field",
                composite.path,
                variant.tag_data.len(),
                tag_size
            );
        }
    }

    for function in tree.functions() {
        let body = &function.body;
        let n_blocks = body.blocks.len();
        let check_target = |bb: usize, what: &str| -> Result<()> {
            ensure!(
                bb < n_blocks,
                "function `{}`: {what} targets block {bb} of {n_blocks}",
                function.path
            );
            Ok(())
        };
        let check_flag = |idx: Option<usize>, what: &str| -> Result<()> {
            if let Some(idx) = idx {
                ensure!(
                    idx < body.drop_flags.len(),
                    "function `{}`: {what} names drop flag {idx} of {}",
                    function.path,
                    body.drop_flags.len()
                );
            }
            Ok(())
        };

        for block in &body.blocks {
            for statement in &block.statements {
                match statement {
                    Statement::Drop { flag, .. } => check_flag(*flag, "Drop")?,
                    Statement::SetDropFlag { idx, other, .. } => {
                        check_flag(Some(*idx), "SetDropFlag")?;
                        check_flag(*other, "SetDropFlag")?;
                    }
                    _ => {}
                }
            }
            match &block.terminator {
                Terminator::Goto(bb) => check_target(*bb, "Goto")?,
                Terminator::If { bb_true, bb_false, .. } => {
                    check_target(*bb_true, "If")?;
                    check_target(*bb_false, "If")?;
                }
                Terminator::Switch { targets, .. } => {
                    for target in targets {
                        check_target(*target, "Switch")?;
                    }
                }
                Terminator::Call { ret_block, .. } => check_target(*ret_block, "Call")?,
                _ => {}
            }
        }
    }
    Ok(())
}
