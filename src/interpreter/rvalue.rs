//! RValue evaluation: every case produces a fresh, detached [`Value`]; the
//! executor performs the destination write afterwards, so no borrowed view
//! is ever held across a write that could invalidate it.

use crate::interpreter::function::FrameState;
use crate::interpreter::place::slice_stride;
use crate::memory::AllocHandle;
use crate::mir::{BinOp, Constant, LValue, Param, RValue, UniOp};
use crate::ty::{BorrowKind, RawType, TypeRef, TypeWrapper, POINTER_SIZE};
use crate::value::{Value, ValueRef};
use anyhow::{bail, ensure, Result};
use std::cmp::Ordering;

impl FrameState<'_> {
    pub(super) fn eval_rvalue(&mut self, rv: &RValue, dst: &LValue) -> Result<Value> {
        match rv {
            RValue::Use(lv) => self.read_lvalue(lv),
            RValue::Constant(c) => Ok(self.const_to_value(c)?.0),
            RValue::Borrow { kind, val } => {
                let (vref, src_ty) = self.project(val)?;
                self.borrow_ref(&vref, *kind, &src_ty)
            }
            RValue::Cast { val, ty } => self.eval_cast(val, ty),
            RValue::BinOp { op, lhs, rhs } => self.eval_binop(*op, lhs, rhs),
            RValue::UniOp { op, val } => self.eval_uniop(*op, val),
            RValue::DstPtr { val } => {
                let (v, ty) = self.read_lvalue_with_ty(val)?;
                ensure!(v.size() == 2 * POINTER_SIZE, "DstPtr of non-fat `{ty}`");
                v.read_value(0, POINTER_SIZE)
            }
            RValue::DstMeta { val } => {
                let (v, ty) = self.read_lvalue_with_ty(val)?;
                ensure!(v.size() == 2 * POINTER_SIZE, "DstMeta of non-fat `{ty}`");
                v.read_value(POINTER_SIZE, POINTER_SIZE)
            }
            RValue::MakeDst { ptr, meta } => {
                let (_, dst_ty) = self.project(dst)?;
                ensure!(dst_ty.size()? == 2 * POINTER_SIZE, "MakeDst into non-fat `{dst_ty}`");
                let (ptr_val, _) = self.param_to_value(ptr)?;
                let (meta_val, _) = self.param_to_value(meta)?;
                ensure!(ptr_val.size() == POINTER_SIZE, "MakeDst pointer word has wrong size");
                ensure!(meta_val.size() == POINTER_SIZE, "MakeDst metadata word has wrong size");
                let mut val = Value::for_type(&dst_ty)?;
                val.write_value(0, &ptr_val)?;
                val.write_value(POINTER_SIZE, &meta_val)?;
                Ok(val)
            }
            RValue::Tuple { vals } => {
                let (_, dst_ty) = self.project(dst)?;
                let mut val = Value::for_type(&dst_ty)?;
                for (i, param) in vals.iter().enumerate() {
                    let (offset, _) = dst_ty.field(i)?;
                    let (field_val, _) = self.param_to_value(param)?;
                    val.write_value(offset, &field_val)?;
                }
                Ok(val)
            }
            RValue::Struct { path, vals } => {
                let data_ty = self.tree.get_composite(path)?.clone();
                let (_, dst_ty) = self.project(dst)?;
                ensure!(
                    dst_ty.raw == RawType::Composite(data_ty),
                    "destination of Struct rvalue is `{dst_ty}`, not `{path}`"
                );
                let mut val = Value::for_type(&dst_ty)?;
                for (i, param) in vals.iter().enumerate() {
                    let (offset, _) = dst_ty.field(i)?;
                    let (field_val, _) = self.param_to_value(param)?;
                    val.write_value(offset, &field_val)?;
                }
                Ok(val)
            }
            RValue::Array { vals } => {
                let (_, dst_ty) = self.project(dst)?;
                ensure!(
                    matches!(dst_ty.wrappers.first(), Some(TypeWrapper::Array(_))),
                    "destination of Array rvalue is `{dst_ty}`"
                );
                let stride = dst_ty.inner()?.size()?;
                let mut val = Value::for_type(&dst_ty)?;
                for (i, param) in vals.iter().enumerate() {
                    let (elem, _) = self.param_to_value(param)?;
                    val.write_value(i * stride, &elem)?;
                }
                Ok(val)
            }
            RValue::SizedArray { val: elem, count } => {
                let (_, dst_ty) = self.project(dst)?;
                ensure!(
                    matches!(dst_ty.wrappers.first(), Some(TypeWrapper::Array(_))),
                    "destination of SizedArray rvalue is `{dst_ty}`"
                );
                let stride = dst_ty.inner()?.size()?;
                let (elem_val, _) = self.param_to_value(elem)?;
                let mut val = Value::for_type(&dst_ty)?;
                for i in 0..*count {
                    val.write_value(i * stride, &elem_val)?;
                }
                Ok(val)
            }
            RValue::Variant { path, index, val: payload } => {
                let composite = self.tree.get_composite(path)?.clone();
                let dst_ty: TypeRef = RawType::Composite(composite.clone()).into();
                let variant = composite
                    .body()?
                    .variants
                    .get(*index)
                    .ok_or_else(|| anyhow::anyhow!("variant {index} out of range for `{path}`"))?
                    .clone();
                let mut val = Value::for_type(&dst_ty)?;
                match (variant.data_field, payload) {
                    (Some(data_field), Some(param)) => {
                        let (offset, _) = dst_ty.field(data_field)?;
                        let (payload_val, _) = self.param_to_value(param)?;
                        val.write_value(offset, &payload_val)?;
                    }
                    (None, None) => {}
                    (Some(_), None) => bail!("variant {index} of `{path}` requires a payload"),
                    (None, Some(_)) => bail!("variant {index} of `{path}` takes no payload"),
                }
                if let Some(base_field) = variant.base_field {
                    let (tag_ofs, tag_ty) = dst_ty.tag_offset(base_field, &variant.field_path)?;
                    ensure!(
                        tag_ty.size()? == variant.tag_data.len(),
                        "tag size mismatch constructing variant {index} of `{path}`"
                    );
                    val.write_bytes(tag_ofs, &variant.tag_data)?;
                }
                Ok(val)
            }
        }
    }

    pub(super) fn const_to_value(&self, constant: &Constant) -> Result<(Value, TypeRef)> {
        match constant {
            Constant::Int { value, ty } => {
                ensure!(ty.is_signed_int(), "Int constant with type `{ty}`");
                let ty: TypeRef = ty.clone().into();
                let size = ty.size()?;
                let mut val = Value::zeroed(size);
                // Sign-extends when the target is wider than the payload,
                // truncates when it is narrower.
                val.write_uint(0, size, *value as i128 as u128)?;
                Ok((val, ty))
            }
            Constant::Uint { value, ty } => {
                ensure!(
                    ty.is_unsigned_int() || matches!(ty, RawType::Char),
                    "Uint constant with type `{ty}`"
                );
                let ty: TypeRef = ty.clone().into();
                let size = ty.size()?;
                let mut val = Value::zeroed(size);
                val.write_uint(0, size, *value as u128)?;
                Ok((val, ty))
            }
            Constant::Float { value, ty } => {
                let ty: TypeRef = ty.clone().into();
                let mut val = Value::for_type(&ty)?;
                match ty.raw {
                    RawType::F64 => val.write_f64(0, *value)?,
                    RawType::F32 => val.write_f32(0, *value as f32)?,
                    _ => bail!("Float constant with type `{ty}`"),
                }
                Ok((val, ty))
            }
            Constant::Bool(b) => {
                let mut val = Value::zeroed(1);
                val.write_u8(0, *b as u8)?;
                Ok((val, RawType::Bool.into()))
            }
            Constant::StaticString(literal) => {
                let ty = TypeRef::from(RawType::Str).wrapped(TypeWrapper::Borrow(BorrowKind::Shared));
                let mut val = Value::for_type(&ty)?;
                val.write_usize(0, 0)?;
                val.write_usize(POINTER_SIZE, literal.len())?;
                // Install the relocation after the writes (a write clears
                // relocations in its range).
                val.set_relocation(0, AllocHandle::Memory(self.tree.string_allocation(literal)));
                Ok((val, ty))
            }
            Constant::ItemAddr(path) => {
                ensure!(
                    self.tree.get_function_opt(path).is_some(),
                    "ItemAddr of `{path}`, which is not a function"
                );
                let mut val = Value::zeroed(POINTER_SIZE);
                val.set_relocation(0, AllocHandle::Function(path.clone()));
                Ok((val, RawType::Function.into()))
            }
        }
    }

    pub(super) fn param_to_value(&self, param: &Param) -> Result<(Value, TypeRef)> {
        match param {
            Param::LValue(lv) => self.read_lvalue_with_ty(lv),
            Param::Constant(c) => self.const_to_value(c),
        }
    }

    /// Build a pointer to a projected place, promoting its storage to an
    /// allocation if its address has never been taken.
    pub(super) fn borrow_ref(
        &mut self,
        vref: &ValueRef,
        kind: BorrowKind,
        src_ty: &TypeRef,
    ) -> Result<Value> {
        let cell = self.ensure_backing(vref)?;
        let ptr_ty = src_ty.clone().wrapped(TypeWrapper::Borrow(kind));
        let mut val = Value::for_type(&ptr_ty)?;
        val.write_usize(0, vref.offset)?;
        if src_ty.has_slice_metadata() {
            let stride = slice_stride(src_ty)?;
            let count = if stride == 0 { 0 } else { vref.size / stride };
            val.write_usize(POINTER_SIZE, count)?;
        }
        val.set_relocation(0, AllocHandle::Memory(cell));
        Ok(val)
    }

    fn eval_cast(&self, val: &LValue, dst_ty: &TypeRef) -> Result<Value> {
        let (src_val, src_ty) = self.read_lvalue_with_ty(val)?;

        // Identity cast: bytes and relocations unchanged.
        if *dst_ty == src_ty {
            return Ok(src_val);
        }

        if let Some(wrapper) = dst_ty.wrappers.first() {
            ensure!(
                matches!(wrapper, TypeWrapper::Pointer(_)),
                "cast to `{dst_ty}` (only raw pointers can be cast to)"
            );
            let dst_size = dst_ty.size()?;
            if !src_ty.wrappers.is_empty() {
                ensure!(
                    matches!(
                        src_ty.wrappers[0],
                        TypeWrapper::Pointer(_) | TypeWrapper::Borrow(_)
                    ),
                    "pointer cast from non-pointer `{src_ty}`"
                );
                // Fat-to-thin truncates away the metadata word; a cast
                // cannot invent metadata.
                ensure!(
                    dst_size <= src_val.size(),
                    "cast from `{src_ty}` to `{dst_ty}` would add metadata"
                );
                return src_val.read_value(0, dst_size);
            }
            ensure!(
                matches!(src_ty.raw, RawType::Function | RawType::USize),
                "cast to pointer `{dst_ty}` from invalid type `{src_ty}`"
            );
            ensure!(dst_size == src_val.size(), "cast from `{src_ty}` to fat `{dst_ty}`");
            return src_val.read_value(0, dst_size);
        }

        if !src_ty.wrappers.is_empty() {
            ensure!(
                matches!(src_ty.wrappers[0], TypeWrapper::Pointer(_) | TypeWrapper::Borrow(_)),
                "cast from `{src_ty}` to `{dst_ty}`"
            );
            ensure!(
                matches!(dst_ty.raw, RawType::USize),
                "cast from pointer `{src_ty}` to non-usize `{dst_ty}`"
            );
            return src_val.read_value(0, POINTER_SIZE);
        }

        // Scalar cross-product, collapsed into a two-stage conversion
        // through a wide integer or double.
        let dst_size = dst_ty.size()?;
        match &dst_ty.raw {
            raw if raw.is_float() => {
                let wide: f64 = match &src_ty.raw {
                    RawType::F32 => src_val.read_f32(0)? as f64,
                    RawType::F64 => src_val.read_f64(0)?,
                    s if s.is_signed_int() => src_val.read_sint(0, src_ty.size()?)? as f64,
                    s if s.is_unsigned_int() => src_val.read_uint(0, src_ty.size()?)? as f64,
                    _ => bail!("cast from `{src_ty}` to `{dst_ty}`"),
                };
                let mut out = Value::zeroed(dst_size);
                match raw {
                    RawType::F32 => out.write_f32(0, wide as f32)?,
                    _ => out.write_f64(0, wide)?,
                }
                Ok(out)
            }
            raw if raw.is_signed_int() || raw.is_unsigned_int() => {
                if matches!(src_ty.raw, RawType::Function) {
                    ensure!(
                        matches!(raw, RawType::USize),
                        "cast from `fn` to non-usize `{dst_ty}`"
                    );
                    return src_val.read_value(0, POINTER_SIZE);
                }
                let bits: u128 = match &src_ty.raw {
                    RawType::F32 => float_to_int_bits(src_val.read_f32(0)? as f64, raw)?,
                    RawType::F64 => float_to_int_bits(src_val.read_f64(0)?, raw)?,
                    s if s.is_signed_int() => src_val.read_sint(0, src_ty.size()?)? as u128,
                    s if s.is_unsigned_int() => src_val.read_uint(0, src_ty.size()?)?,
                    _ => bail!("cast from `{src_ty}` to `{dst_ty}`"),
                };
                let mut out = Value::zeroed(dst_size);
                out.write_uint(0, dst_size, bits)?;
                Ok(out)
            }
            _ => bail!("cast to `{dst_ty}` is unsupported"),
        }
    }

    fn eval_binop(&self, op: BinOp, lhs: &Param, rhs: &Param) -> Result<Value> {
        let (l, l_ty) = self.param_to_value(lhs)?;
        let (r, r_ty) = self.param_to_value(rhs)?;

        if op.is_comparison() {
            ensure!(l_ty == r_ty, "comparison type mismatch: `{l_ty}` vs `{r_ty}`");
            let ord = compare_values(&l, &r, &l_ty)?;
            let res = match (op, ord) {
                (BinOp::Eq, Some(Ordering::Equal)) => true,
                (BinOp::Eq, _) => false,
                (BinOp::Ne, Some(Ordering::Equal)) => false,
                (BinOp::Ne, _) => true,
                // Unordered (NaN) compares false for every ordering test.
                (_, None) => false,
                (BinOp::Lt, Some(ord)) => ord == Ordering::Less,
                (BinOp::Le, Some(ord)) => ord != Ordering::Greater,
                (BinOp::Gt, Some(ord)) => ord == Ordering::Greater,
                (BinOp::Ge, Some(ord)) => ord != Ordering::Less,
                _ => unreachable!("comparison op"),
            };
            let mut out = Value::zeroed(1);
            out.write_u8(0, res as u8)?;
            return Ok(out);
        }

        if matches!(op, BinOp::Shl | BinOp::Shr) {
            // Shift operands may have different types; the count is masked
            // by the width of the left-hand side.
            ensure!(l_ty.wrappers.is_empty(), "shift of wrapped type `{l_ty}`");
            ensure!(r_ty.wrappers.is_empty(), "shift count of wrapped type `{r_ty}`");
            let size = l_ty.size()?;
            let bits = 8 * size as u32;
            let count = (r.read_uint(0, r_ty.size()?)? % bits as u128) as u32;
            let mut out = Value::zeroed(size);
            let result = if matches!(op, BinOp::Shl) {
                l.read_uint(0, size)? << count
            } else if l_ty.raw.is_signed_int() {
                (l.read_sint(0, size)? >> count) as u128
            } else {
                l.read_uint(0, size)? >> count
            };
            out.write_uint(0, size, result)?;
            return Ok(out);
        }

        ensure!(l_ty == r_ty, "binary op type mismatch: `{l_ty}` vs `{r_ty}`");
        ensure!(l_ty.wrappers.is_empty(), "arithmetic on wrapped type `{l_ty}`");
        let size = l_ty.size()?;
        let mut out = Value::zeroed(size);

        if l_ty.raw.is_float() {
            let (a, b) = if matches!(l_ty.raw, RawType::F32) {
                (l.read_f32(0)? as f64, r.read_f32(0)? as f64)
            } else {
                (l.read_f64(0)?, r.read_f64(0)?)
            };
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                _ => bail!("operation {op:?} on `{l_ty}`"),
            };
            match l_ty.raw {
                RawType::F32 => out.write_f32(0, result as f32)?,
                _ => out.write_f64(0, result)?,
            }
        } else if l_ty.raw.is_signed_int() {
            let a = l.read_sint(0, size)?;
            let b = r.read_sint(0, size)?;
            let result = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => {
                    ensure!(b != 0, "division by zero");
                    a.wrapping_div(b)
                }
                BinOp::Mod => {
                    ensure!(b != 0, "remainder by zero");
                    a.wrapping_rem(b)
                }
                BinOp::BitAnd => a & b,
                BinOp::BitOr => a | b,
                BinOp::BitXor => a ^ b,
                _ => bail!("operation {op:?} on `{l_ty}`"),
            };
            out.write_uint(0, size, result as u128)?;
        } else if l_ty.raw.is_unsigned_int() {
            let a = l.read_uint(0, size)?;
            let b = r.read_uint(0, size)?;
            let result = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => {
                    ensure!(b != 0, "division by zero");
                    a / b
                }
                BinOp::Mod => {
                    ensure!(b != 0, "remainder by zero");
                    a % b
                }
                BinOp::BitAnd => a & b,
                BinOp::BitOr => a | b,
                BinOp::BitXor => a ^ b,
                _ => bail!("operation {op:?} on `{l_ty}`"),
            };
            out.write_uint(0, size, result)?;
        } else if matches!(l_ty.raw, RawType::Bool)
            && matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor)
        {
            let a = l.read_u8(0)?;
            let b = r.read_u8(0)?;
            let result = match op {
                BinOp::BitAnd => a & b,
                BinOp::BitOr => a | b,
                _ => a ^ b,
            };
            out.write_u8(0, result)?;
        } else {
            bail!("operation {op:?} on `{l_ty}`");
        }
        Ok(out)
    }

    fn eval_uniop(&self, op: UniOp, val: &LValue) -> Result<Value> {
        let (v, ty) = self.read_lvalue_with_ty(val)?;
        ensure!(ty.wrappers.is_empty(), "unary op on wrapped type `{ty}`");
        let size = ty.size()?;
        let mut out = Value::zeroed(size);
        match op {
            UniOp::Inv => {
                if matches!(ty.raw, RawType::Bool) {
                    out.write_u8(0, (v.read_u8(0)? == 0) as u8)?;
                } else if ty.raw.is_signed_int() || ty.raw.is_unsigned_int() {
                    out.write_uint(0, size, !v.read_uint(0, size)?)?;
                } else {
                    bail!("bitwise not of `{ty}`");
                }
            }
            UniOp::Neg => {
                if ty.raw.is_signed_int() {
                    out.write_uint(0, size, v.read_sint(0, size)?.wrapping_neg() as u128)?;
                } else if matches!(ty.raw, RawType::F32) {
                    out.write_f32(0, -v.read_f32(0)?)?;
                } else if matches!(ty.raw, RawType::F64) {
                    out.write_f64(0, -v.read_f64(0)?)?;
                } else {
                    bail!("negation of `{ty}`");
                }
            }
        }
        Ok(out)
    }
}

/// Truncation toward zero with saturation at the target's bounds.
fn float_to_int_bits(f: f64, dst: &RawType) -> Result<u128> {
    use RawType::*;
    Ok(match dst {
        U8 => (f as u8) as u128,
        U16 => (f as u16) as u128,
        U32 => (f as u32) as u128,
        U64 | USize => (f as u64) as u128,
        U128 => f as u128,
        I8 => (f as i8) as u8 as u128,
        I16 => (f as i16) as u16 as u128,
        I32 => (f as i32) as u32 as u128,
        I64 | ISize => (f as i64) as u64 as u128,
        I128 => (f as i128) as u128,
        _ => bail!("float cast to `{dst}`"),
    })
}

/// Three-way comparison: relocation identity first, then the bytes.
/// `None` is the unordered (NaN) outcome.
fn compare_values(l: &Value, r: &Value, ty: &TypeRef) -> Result<Option<Ordering>> {
    let by_reloc = compare_relocations(l.relocation_at(0), r.relocation_at(0));
    if by_reloc != Ordering::Equal {
        return Ok(Some(by_reloc));
    }

    if let Some(wrapper) = ty.wrappers.first() {
        ensure!(
            matches!(wrapper, TypeWrapper::Borrow(_) | TypeWrapper::Pointer(_)),
            "comparison of `{ty}`"
        );
        let mut ord = l.read_usize(0)?.cmp(&r.read_usize(0)?);
        if ord == Ordering::Equal && l.size() > POINTER_SIZE {
            ord = compare_relocations(
                l.relocation_at(POINTER_SIZE),
                r.relocation_at(POINTER_SIZE),
            );
            if ord == Ordering::Equal {
                ord = l.read_usize(POINTER_SIZE)?.cmp(&r.read_usize(POINTER_SIZE)?);
            }
        }
        return Ok(Some(ord));
    }

    let size = ty.size()?;
    Ok(match &ty.raw {
        raw if raw.is_signed_int() => Some(l.read_sint(0, size)?.cmp(&r.read_sint(0, size)?)),
        raw if raw.is_unsigned_int() => Some(l.read_uint(0, size)?.cmp(&r.read_uint(0, size)?)),
        RawType::Bool | RawType::Char => Some(l.read_uint(0, size)?.cmp(&r.read_uint(0, size)?)),
        RawType::F32 => l.read_f32(0)?.partial_cmp(&r.read_f32(0)?),
        RawType::F64 => l.read_f64(0)?.partial_cmp(&r.read_f64(0)?),
        RawType::Function => Some(Ordering::Equal),
        _ => bail!("comparison of `{ty}`"),
    })
}

fn compare_relocations(l: Option<AllocHandle>, r: Option<AllocHandle>) -> Ordering {
    match (l, r) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if a == b {
                Ordering::Equal
            } else {
                a.order(&b)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::function::FrameState;
    use crate::mir::{BasicBlock, Body, Path, Terminator};
    use crate::module::{FunctionDef, ModuleTree};

    fn frame<'a>(tree: &'a ModuleTree, fcn: &'a FunctionDef) -> FrameState<'a> {
        FrameState::new(tree, fcn, vec![]).unwrap()
    }

    fn scratch_fn(locals: Vec<TypeRef>) -> FunctionDef {
        FunctionDef {
            path: Path::from("t::scratch"),
            args: vec![],
            ret_ty: TypeRef::unit(),
            external: None,
            body: Body {
                blocks: vec![BasicBlock { statements: vec![], terminator: Terminator::Return }],
                locals,
                drop_flags: vec![],
            },
        }
    }

    #[test]
    fn cast_sign_extends_through_the_wide_stage() {
        let tree = ModuleTree::default();
        let fcn = scratch_fn(vec![RawType::I32.into()]);
        let mut state = frame(&tree, &fcn);

        let mut minus_one = Value::zeroed(4);
        minus_one.write_uint(0, 4, 0xFFFF_FFFF).unwrap();
        state.write_lvalue(&LValue::Local(0), minus_one).unwrap();

        let out = state.eval_cast(&LValue::Local(0), &RawType::U64.into()).unwrap();
        assert_eq!(out.read_uint(0, 8).unwrap(), u64::MAX as u128);
    }

    #[test]
    fn identity_cast_preserves_bytes_and_relocations() {
        let tree = ModuleTree::default();
        let ptr_ty = TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(BorrowKind::Shared));
        let fcn = scratch_fn(vec![RawType::U32.into(), ptr_ty.clone()]);
        let mut state = frame(&tree, &fcn);

        let ptr = state
            .eval_rvalue(&RValue::Borrow { kind: BorrowKind::Shared, val: LValue::Local(0) }, &LValue::Local(1))
            .unwrap();
        state.write_lvalue(&LValue::Local(1), ptr.clone()).unwrap();

        let out = state.eval_cast(&LValue::Local(1), &ptr_ty).unwrap();
        assert_eq!(out, ptr);
        assert!(out.relocation_at(0).is_some());
    }

    #[test]
    fn cast_chain_matches_direct_cast() {
        let tree = ModuleTree::default();
        let fcn = scratch_fn(vec![RawType::I8.into(), RawType::I32.into()]);
        let mut state = frame(&tree, &fcn);

        let mut val = Value::zeroed(1);
        val.write_uint(0, 1, 0x85).unwrap(); // -123 as i8
        state.write_lvalue(&LValue::Local(0), val).unwrap();

        let via_i32 = state.eval_cast(&LValue::Local(0), &RawType::I32.into()).unwrap();
        state.write_lvalue(&LValue::Local(1), via_i32).unwrap();
        let chained = state.eval_cast(&LValue::Local(1), &RawType::U16.into()).unwrap();
        let direct = state.eval_cast(&LValue::Local(0), &RawType::U16.into()).unwrap();
        assert_eq!(chained, direct);
    }

    #[test]
    fn float_to_int_truncates_toward_zero() {
        let tree = ModuleTree::default();
        let fcn = scratch_fn(vec![RawType::F64.into()]);
        let mut state = frame(&tree, &fcn);

        let mut val = Value::zeroed(8);
        val.write_f64(0, -2.75).unwrap();
        state.write_lvalue(&LValue::Local(0), val).unwrap();

        let out = state.eval_cast(&LValue::Local(0), &RawType::I32.into()).unwrap();
        assert_eq!(out.read_sint(0, 4).unwrap(), -2);
    }

    #[test]
    fn shift_count_is_masked_by_lhs_width() {
        let tree = ModuleTree::default();
        let fcn = scratch_fn(vec![]);
        let state = frame(&tree, &fcn);

        let out = state
            .eval_binop(
                BinOp::Shl,
                &Param::Constant(Constant::Uint { value: 1, ty: RawType::U8 }),
                &Param::Constant(Constant::Uint { value: 9, ty: RawType::U32 }),
            )
            .unwrap();
        assert_eq!(out.read_uint(0, 1).unwrap(), 2);
    }

    #[test]
    fn arithmetic_wraps_at_operand_width() {
        let tree = ModuleTree::default();
        let fcn = scratch_fn(vec![]);
        let state = frame(&tree, &fcn);

        let out = state
            .eval_binop(
                BinOp::Add,
                &Param::Constant(Constant::Uint { value: 0xFF, ty: RawType::U8 }),
                &Param::Constant(Constant::Uint { value: 2, ty: RawType::U8 }),
            )
            .unwrap();
        assert_eq!(out.read_uint(0, 1).unwrap(), 1);

        let err = state
            .eval_binop(
                BinOp::Div,
                &Param::Constant(Constant::Uint { value: 1, ty: RawType::U8 }),
                &Param::Constant(Constant::Uint { value: 0, ty: RawType::U8 }),
            )
            .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn nan_is_unordered() {
        let tree = ModuleTree::default();
        let fcn = scratch_fn(vec![RawType::F64.into()]);
        let mut state = frame(&tree, &fcn);

        let mut nan = Value::zeroed(8);
        nan.write_f64(0, f64::NAN).unwrap();
        state.write_lvalue(&LValue::Local(0), nan).unwrap();

        let check = |state: &FrameState, op: BinOp| {
            state
                .eval_binop(
                    op,
                    &Param::LValue(LValue::Local(0)),
                    &Param::LValue(LValue::Local(0)),
                )
                .unwrap()
                .read_u8(0)
                .unwrap()
        };
        assert_eq!(check(&state, BinOp::Eq), 0);
        assert_eq!(check(&state, BinOp::Ne), 1);
        assert_eq!(check(&state, BinOp::Lt), 0);
        assert_eq!(check(&state, BinOp::Ge), 0);
    }

    #[test]
    fn pointer_comparison_observes_provenance() {
        let tree = ModuleTree::default();
        let ptr_ty = TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(BorrowKind::Shared));
        let fcn = scratch_fn(vec![
            RawType::U32.into(),
            RawType::U32.into(),
            ptr_ty.clone(),
            ptr_ty.clone(),
            ptr_ty,
        ]);
        let mut state = frame(&tree, &fcn);

        let borrow_a =
            state.eval_rvalue(&RValue::Borrow { kind: BorrowKind::Shared, val: LValue::Local(0) }, &LValue::Local(2)).unwrap();
        let borrow_a2 =
            state.eval_rvalue(&RValue::Borrow { kind: BorrowKind::Shared, val: LValue::Local(0) }, &LValue::Local(3)).unwrap();
        let borrow_b =
            state.eval_rvalue(&RValue::Borrow { kind: BorrowKind::Shared, val: LValue::Local(1) }, &LValue::Local(4)).unwrap();
        state.write_lvalue(&LValue::Local(2), borrow_a).unwrap();
        state.write_lvalue(&LValue::Local(3), borrow_a2).unwrap();
        state.write_lvalue(&LValue::Local(4), borrow_b).unwrap();

        let eq = |state: &FrameState, a: usize, b: usize| {
            state
                .eval_binop(
                    BinOp::Eq,
                    &Param::LValue(LValue::Local(a)),
                    &Param::LValue(LValue::Local(b)),
                )
                .unwrap()
                .read_u8(0)
                .unwrap()
        };
        // Same local borrowed twice: same allocation, same offset.
        assert_eq!(eq(&state, 2, 3), 1);
        // Different locals: identical words, different provenance.
        assert_eq!(eq(&state, 2, 4), 0);
    }
}
