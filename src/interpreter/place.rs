//! Place projection: resolving an [`LValue`] to a borrowed view plus the
//! static type at that place. Projection never allocates and never writes.

use crate::interpreter::function::FrameState;
use crate::memory::{AllocCell, AllocHandle};
use crate::mir::LValue;
use crate::ty::{RawType, TypeRef, TypeWrapper, POINTER_SIZE};
use crate::value::{RefRoot, SlotId, Value, ValueRef};
use anyhow::{bail, ensure, Result};

impl FrameState<'_> {
    fn slot(&self, id: SlotId) -> Result<&Value> {
        match id {
            SlotId::Return => Ok(&self.ret),
            SlotId::Local(idx) => self
                .locals
                .get(idx)
                .ok_or_else(|| anyhow::anyhow!("local {idx} out of range")),
            SlotId::Argument(idx) => self
                .args
                .get(idx)
                .ok_or_else(|| anyhow::anyhow!("argument {idx} out of range")),
        }
    }

    fn slot_mut(&mut self, id: SlotId) -> Result<&mut Value> {
        match id {
            SlotId::Return => Ok(&mut self.ret),
            SlotId::Local(idx) => self
                .locals
                .get_mut(idx)
                .ok_or_else(|| anyhow::anyhow!("local {idx} out of range")),
            SlotId::Argument(idx) => self
                .args
                .get_mut(idx)
                .ok_or_else(|| anyhow::anyhow!("argument {idx} out of range")),
        }
    }

    /// Resolve a place to `(view, static type)`.
    pub(super) fn project(&self, lv: &LValue) -> Result<(ValueRef, TypeRef)> {
        match lv {
            LValue::Return => {
                let ty = self.fcn.ret_ty.clone();
                Ok((ValueRef::slot(SlotId::Return, self.ret.size()), ty))
            }
            LValue::Local(idx) => {
                let ty = self
                    .fcn
                    .body
                    .locals
                    .get(*idx)
                    .ok_or_else(|| anyhow::anyhow!("local {idx} out of range"))?
                    .clone();
                Ok((ValueRef::slot(SlotId::Local(*idx), self.slot(SlotId::Local(*idx))?.size()), ty))
            }
            LValue::Argument(idx) => {
                let ty = self
                    .fcn
                    .args
                    .get(*idx)
                    .ok_or_else(|| anyhow::anyhow!("argument {idx} out of range"))?
                    .clone();
                Ok((
                    ValueRef::slot(SlotId::Argument(*idx), self.slot(SlotId::Argument(*idx))?.size()),
                    ty,
                ))
            }
            LValue::Static(path) => {
                let def = self.tree.get_static(path)?;
                let size = def.cell.borrow().len();
                Ok((ValueRef::alloc(def.cell.clone(), 0, size), def.ty.clone()))
            }
            LValue::Field { base, index } => {
                let (mut vref, base_ty) = self.project(base)?;
                let (offset, field_ty) = base_ty.field(*index)?;
                vref.offset += offset;
                vref.size = field_ty.size()?;
                Ok((vref, field_ty))
            }
            LValue::Downcast { base, variant } => {
                let (mut vref, base_ty) = self.project(base)?;
                let (offset, payload_ty) = base_ty.variant_field(*variant)?;
                vref.offset += offset;
                vref.size = payload_ty.size()?;
                Ok((vref, payload_ty))
            }
            LValue::Index { base, index } => {
                let idx = self.read_lvalue(index)?.read_usize(0)?;
                let (mut vref, base_ty) = self.project(base)?;
                let elem_ty = base_ty.inner()?;
                let stride = elem_ty.size()?;
                match base_ty.wrappers.first() {
                    Some(TypeWrapper::Array(count)) => {
                        ensure!(idx < *count, "index {idx} out of bounds of `{base_ty}`");
                    }
                    Some(TypeWrapper::Slice) => {
                        // The projected view's size is the slice's full
                        // extent; bound against it.
                        let end = idx
                            .checked_add(1)
                            .and_then(|n| n.checked_mul(stride))
                            .ok_or_else(|| anyhow::anyhow!("index {idx} overflows"))?;
                        ensure!(
                            end <= vref.size,
                            "index {idx} out of bounds of `{base_ty}` ({} elements)",
                            if stride == 0 { 0 } else { vref.size / stride }
                        );
                    }
                    _ => bail!("index into non-indexable type `{base_ty}`"),
                }
                vref.offset += stride * idx;
                vref.size = stride;
                Ok((vref, elem_ty))
            }
            LValue::Deref { base } => {
                let (vref, ptr_ty) = self.project(base)?;
                ensure!(
                    matches!(
                        ptr_ty.wrappers.first(),
                        Some(TypeWrapper::Borrow(_)) | Some(TypeWrapper::Pointer(_))
                    ),
                    "deref of non-pointer type `{ptr_ty}`"
                );
                let pointee = ptr_ty.inner()?;
                if pointee.wrappers.is_empty() {
                    if let RawType::TraitObject(_) = pointee.raw {
                        bail!("deref of trait object `{ptr_ty}` outside drop dispatch");
                    }
                }

                let handle = self
                    .ref_relocation(&vref, 0)?
                    .ok_or_else(|| anyhow::anyhow!("deref of a value with no relocation"))?;
                let cell = handle
                    .as_memory()
                    .ok_or_else(|| anyhow::anyhow!("deref of a function pointer"))?
                    .clone();
                let offset = self.ref_read_usize(&vref, 0)?;

                let size = if pointee.has_slice_metadata() {
                    ensure!(
                        vref.size == 2 * POINTER_SIZE,
                        "deref of `{ptr_ty}` that is not a fat-pointer sized value"
                    );
                    let count = self.ref_read_usize(&vref, POINTER_SIZE)?;
                    count * slice_stride(&pointee)?
                } else {
                    ensure!(
                        vref.size == POINTER_SIZE,
                        "deref of `{ptr_ty}` that is not a pointer-sized value"
                    );
                    pointee.size()?
                };
                Ok((ValueRef::alloc(cell, offset, size), pointee))
            }
        }
    }

    pub(super) fn read_lvalue_with_ty(&self, lv: &LValue) -> Result<(Value, TypeRef)> {
        let (vref, ty) = self.project(lv)?;
        Ok((self.read_ref(&vref)?, ty))
    }

    pub(super) fn read_lvalue(&self, lv: &LValue) -> Result<Value> {
        Ok(self.read_lvalue_with_ty(lv)?.0)
    }

    pub(super) fn write_lvalue(&mut self, lv: &LValue, value: Value) -> Result<()> {
        let (vref, _) = self.project(lv)?;
        self.write_ref(&vref, &value)
    }

    /// Read the viewed range as a detached value.
    pub(super) fn read_ref(&self, vref: &ValueRef) -> Result<Value> {
        match &vref.root {
            RefRoot::Slot(id) => self.slot(*id)?.read_value(vref.offset, vref.size),
            RefRoot::Alloc(cell) => cell.borrow().read_value(vref.offset, vref.size),
        }
    }

    /// Write a detached value through the view.
    pub(super) fn write_ref(&mut self, vref: &ValueRef, value: &Value) -> Result<()> {
        ensure!(
            value.size() == vref.size,
            "write of a {} byte value through a {} byte place",
            value.size(),
            vref.size
        );
        match &vref.root {
            RefRoot::Slot(id) => {
                let id = *id;
                self.slot_mut(id)?.write_value(vref.offset, value)
            }
            RefRoot::Alloc(cell) => cell.borrow_mut().write_value(vref.offset, value),
        }
    }

    pub(super) fn ref_bytes(&self, vref: &ValueRef, delta: usize, size: usize) -> Result<Vec<u8>> {
        match &vref.root {
            RefRoot::Slot(id) => self.slot(*id)?.read_bytes(vref.offset + delta, size),
            RefRoot::Alloc(cell) => Ok(cell.borrow().bytes(vref.offset + delta, size)?.to_vec()),
        }
    }

    pub(super) fn ref_read_usize(&self, vref: &ValueRef, delta: usize) -> Result<usize> {
        match &vref.root {
            RefRoot::Slot(id) => self.slot(*id)?.read_usize(vref.offset + delta),
            RefRoot::Alloc(cell) => cell.borrow().read_usize(vref.offset + delta),
        }
    }

    /// The relocation under the pointer word at `vref.offset + delta`.
    pub(super) fn ref_relocation(&self, vref: &ValueRef, delta: usize) -> Result<Option<AllocHandle>> {
        Ok(match &vref.root {
            RefRoot::Slot(id) => self.slot(*id)?.relocation_at(vref.offset + delta),
            RefRoot::Alloc(cell) => cell.borrow().relocation_at(vref.offset + delta),
        })
    }

    /// The allocation backing a view, promoting a frame slot if its address
    /// has not been taken before.
    pub(super) fn ensure_backing(&mut self, vref: &ValueRef) -> Result<AllocCell> {
        match &vref.root {
            RefRoot::Slot(id) => {
                let id = *id;
                Ok(self.slot_mut(id)?.ensure_allocation())
            }
            RefRoot::Alloc(cell) => Ok(cell.clone()),
        }
    }
}

/// Element stride of a slice-like pointee (`str` counts bytes).
pub(super) fn slice_stride(pointee: &TypeRef) -> Result<usize> {
    if pointee.wrappers.is_empty() {
        ensure!(matches!(pointee.raw, RawType::Str), "`{pointee}` has no slice stride");
        return Ok(1);
    }
    pointee.inner()?.size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::function::FrameState;
    use crate::mir::{BasicBlock, Body, Path, Terminator};
    use crate::module::{FunctionDef, ModuleTree};
    use crate::ty::{Composite, CompositeBody};

    fn frame_fn(locals: Vec<TypeRef>) -> FunctionDef {
        FunctionDef {
            path: Path::from("t::frame"),
            args: vec![],
            ret_ty: RawType::U32.into(),
            external: None,
            body: Body {
                blocks: vec![BasicBlock { statements: vec![], terminator: Terminator::Return }],
                locals,
                drop_flags: vec![],
            },
        }
    }

    #[test]
    fn projection_round_trip_through_field() {
        let pair = Composite::define_new(
            Path::from("t::Pair"),
            CompositeBody {
                size: 8,
                fields: vec![(0, RawType::U32.into()), (4, RawType::U32.into())],
                variants: vec![],
                drop_glue: None,
            },
        );
        let tree = ModuleTree::default();
        let fcn = frame_fn(vec![RawType::Composite(pair).into()]);
        let mut state = FrameState::new(&tree, &fcn, vec![]).unwrap();

        let place = LValue::Local(0).field(1);
        let mut field = Value::zeroed(4);
        field.write_uint(0, 4, 0xAABB).unwrap();
        state.write_lvalue(&place, field.clone()).unwrap();

        assert_eq!(state.read_lvalue(&place).unwrap(), field);
        // The sibling field is untouched.
        assert_eq!(state.read_lvalue(&LValue::Local(0).field(0)).unwrap(), Value::zeroed(4));
    }

    #[test]
    fn index_projection_is_bounds_checked() {
        let tree = ModuleTree::default();
        let fcn = frame_fn(vec![
            TypeRef::from(RawType::U32).wrapped(TypeWrapper::Array(3)),
            RawType::USize.into(),
        ]);
        let mut state = FrameState::new(&tree, &fcn, vec![]).unwrap();

        let mut idx = Value::zeroed(8);
        idx.write_usize(0, 2).unwrap();
        state.write_lvalue(&LValue::Local(1), idx).unwrap();

        let place = LValue::Local(0).index(LValue::Local(1));
        let mut elem = Value::zeroed(4);
        elem.write_uint(0, 4, 9).unwrap();
        state.write_lvalue(&place, elem.clone()).unwrap();
        assert_eq!(state.read_lvalue(&place).unwrap(), elem);

        let mut idx = Value::zeroed(8);
        idx.write_usize(0, 3).unwrap();
        state.write_lvalue(&LValue::Local(1), idx).unwrap();
        let err = state.read_lvalue(&place).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn deref_requires_relocation() {
        let tree = ModuleTree::default();
        let fcn = frame_fn(vec![
            TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(crate::ty::BorrowKind::Shared)),
        ]);
        let mut state = FrameState::new(&tree, &fcn, vec![]).unwrap();

        // A dangling integer is not a pointer.
        let mut fake = Value::zeroed(POINTER_SIZE);
        fake.write_usize(0, 0xDEAD).unwrap();
        state.write_lvalue(&LValue::Local(0), fake).unwrap();
        let err = state.read_lvalue(&LValue::Local(0).deref()).unwrap_err();
        assert!(err.to_string().contains("no relocation"));
    }

    #[test]
    fn deref_through_relocation_reads_target() {
        let tree = ModuleTree::default();
        let fcn = frame_fn(vec![
            TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(crate::ty::BorrowKind::Shared)),
        ]);
        let mut state = FrameState::new(&tree, &fcn, vec![]).unwrap();

        let target = crate::memory::Allocation::from_bytes(&[0x44, 0x33, 0x22, 0x11]);
        let mut ptr = Value::zeroed(POINTER_SIZE);
        ptr.set_relocation(0, AllocHandle::Memory(target));
        state.write_lvalue(&LValue::Local(0), ptr).unwrap();

        let read = state.read_lvalue(&LValue::Local(0).deref()).unwrap();
        assert_eq!(read.read_uint(0, 4).unwrap(), 0x11223344);
    }
}
