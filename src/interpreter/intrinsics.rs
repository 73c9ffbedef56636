//! The intrinsic table. This interpreter is single-threaded, so the atomic
//! intrinsics are plain loads and stores through the pointer's relocation.

use crate::ty::{TypeRef, POINTER_SIZE};
use crate::value::Value;
use anyhow::{bail, ensure, Result};
use tracing::trace;

pub(super) fn invoke_intrinsic(
    name: &str,
    ty_params: &[TypeRef],
    mut args: Vec<Value>,
) -> Result<Value> {
    trace!("intrinsic `{name}`");
    match name {
        "transmute" => {
            // Size-preserving reinterpret: bytes and relocations unchanged.
            ensure!(args.len() == 1, "transmute takes 1 argument, got {}", args.len());
            Ok(args.remove(0))
        }
        "atomic_store" => {
            ensure!(args.len() == 2, "atomic_store takes 2 arguments, got {}", args.len());
            let data = args.pop().expect("checked arity");
            let ptr = args.pop().expect("checked arity");
            let (cell, offset) = deref_pointer_arg(&ptr, "atomic_store")?;
            cell.borrow_mut().write_value(offset, &data)?;
            Ok(Value::unit())
        }
        "atomic_load" => {
            ensure!(args.len() == 1, "atomic_load takes 1 argument, got {}", args.len());
            let ty = ty_params
                .first()
                .ok_or_else(|| anyhow::anyhow!("atomic_load needs a type parameter"))?;
            let (cell, offset) = deref_pointer_arg(&args[0], "atomic_load")?;
            let loaded = cell.borrow().read_value(offset, ty.size()?)?;
            Ok(loaded)
        }
        "offset" => {
            ensure!(args.len() == 2, "offset takes 2 arguments, got {}", args.len());
            let delta = args[1].read_usize(0)?;
            let mut ptr = args.remove(0);
            let reloc = ptr
                .relocation_at(0)
                .ok_or_else(|| anyhow::anyhow!("offset of a pointer with no relocation"))?;
            let moved = ptr.read_usize(0)?.wrapping_add(delta);
            ptr.write_usize(0, moved)?;
            // The write cleared the pointer's provenance; reattach it.
            ptr.set_relocation(0, reloc);
            Ok(ptr)
        }
        "assume" => {
            ensure!(args.len() == 1, "assume takes 1 argument, got {}", args.len());
            Ok(Value::unit())
        }
        _ => bail!("unknown intrinsic `{name}`"),
    }
}

/// The (allocation, offset) a pointer-sized argument designates.
fn deref_pointer_arg(ptr: &Value, what: &str) -> Result<(crate::memory::AllocCell, usize)> {
    ensure!(
        ptr.size() == POINTER_SIZE,
        "{what} pointer argument is not pointer-sized"
    );
    let handle = ptr
        .relocation_at(0)
        .ok_or_else(|| anyhow::anyhow!("{what} pointer has no relocation"))?;
    let cell = handle
        .as_memory()
        .ok_or_else(|| anyhow::anyhow!("{what} pointer targets a function"))?
        .clone();
    Ok((cell, ptr.read_usize(0)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocHandle, Allocation};
    use crate::ty::RawType;

    fn pointer_to(cell: crate::memory::AllocCell, offset: usize) -> Value {
        let mut ptr = Value::zeroed(POINTER_SIZE);
        ptr.write_usize(0, offset).unwrap();
        ptr.set_relocation(0, AllocHandle::Memory(cell));
        ptr
    }

    #[test]
    fn transmute_is_identity() {
        let cell = Allocation::zeroed(4);
        let mut val = Value::zeroed(8);
        val.write_usize(0, 3).unwrap();
        val.set_relocation(0, AllocHandle::Memory(cell.clone()));
        let out = invoke_intrinsic("transmute", &[], vec![val.clone()]).unwrap();
        assert_eq!(out, val);
    }

    #[test]
    fn atomic_round_trip() {
        let cell = Allocation::zeroed(8);
        let mut data = Value::zeroed(4);
        data.write_uint(0, 4, 0xABCD).unwrap();

        invoke_intrinsic("atomic_store", &[RawType::U32.into()], vec![pointer_to(cell.clone(), 4), data.clone()])
            .unwrap();
        let loaded =
            invoke_intrinsic("atomic_load", &[RawType::U32.into()], vec![pointer_to(cell, 4)]).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn offset_preserves_relocation() {
        let cell = Allocation::zeroed(16);
        let mut delta = Value::zeroed(8);
        delta.write_usize(0, 12).unwrap();
        let out = invoke_intrinsic("offset", &[], vec![pointer_to(cell.clone(), 2), delta]).unwrap();
        assert_eq!(out.read_usize(0).unwrap(), 14);
        assert_eq!(out.relocation_at(0), Some(AllocHandle::Memory(cell)));
    }

    #[test]
    fn unknown_intrinsic_is_fatal() {
        let err = invoke_intrinsic("likely", &[], vec![]).unwrap_err();
        assert!(err.to_string().contains("unknown intrinsic"));
    }
}
