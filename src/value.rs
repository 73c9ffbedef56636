//! Runtime values and borrowed views into storage.
//!
//! A [`Value`] owns its bytes: small values live inline in a
//! `SmallVec<[u8; 16]>` together with their relocations, and a value is
//! promoted to a backing [`Allocation`] the first time its address is taken.
//! After promotion every handle observes the same storage.
//!
//! A [`ValueRef`] is the *borrowed* counterpart produced by place
//! projection: a root (frame slot or allocation), an offset and a size. It
//! owns nothing; the executor reads and writes through it.

use crate::memory::{
    read_le, read_sint, read_uint, write_le, write_uint, AllocCell, AllocHandle, Allocation,
    Relocation,
};
use crate::ty::{RawType, TypeRef, POINTER_SIZE};
use anyhow::{ensure, Result};
use smallvec::SmallVec;
use std::fmt;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// An owned run of bytes plus pointer relocations, sized to a type.
#[derive(Clone, Default)]
pub struct Value {
    bytes: SmallVec<[u8; 16]>,
    relocations: Vec<Relocation>,
    /// Set once the value's address has been taken; from then on the
    /// allocation is the single source of truth and `bytes`/`relocations`
    /// stay empty.
    backing: Option<AllocCell>,
}

impl Value {
    pub fn zeroed(size: usize) -> Self {
        Self { bytes: SmallVec::from_elem(0, size), relocations: Vec::new(), backing: None }
    }

    /// A fresh zeroed value sized to `ty`.
    pub fn for_type(ty: &TypeRef) -> Result<Self> {
        Ok(Self::zeroed(ty.size()?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bytes: SmallVec::from_slice(bytes), relocations: Vec::new(), backing: None }
    }

    pub(crate) fn from_parts(bytes: &[u8], relocations: Vec<Relocation>) -> Self {
        Self { bytes: SmallVec::from_slice(bytes), relocations, backing: None }
    }

    /// The zero-sized unit value.
    pub fn unit() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        match &self.backing {
            Some(cell) => cell.borrow().len(),
            None => self.bytes.len(),
        }
    }

    pub fn is_unit(&self) -> bool {
        self.size() == 0
    }

    /// Copy out bytes and relocations, regardless of representation.
    pub fn snapshot(&self) -> (Vec<u8>, Vec<Relocation>) {
        match &self.backing {
            Some(cell) => {
                let alloc = cell.borrow();
                (alloc.bytes(0, alloc.len()).expect("full range").to_vec(), alloc.relocations().to_vec())
            }
            None => (self.bytes.to_vec(), self.relocations.clone()),
        }
    }

    pub fn read_bytes(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        match &self.backing {
            Some(cell) => Ok(cell.borrow().bytes(offset, size)?.to_vec()),
            None => {
                ensure!(
                    offset.checked_add(size).is_some_and(|end| end <= self.bytes.len()),
                    "read of {size} bytes at offset {offset} is out of bounds (value is {} bytes)",
                    self.bytes.len()
                );
                Ok(self.bytes[offset..offset + size].to_vec())
            }
        }
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        match &self.backing {
            Some(cell) => cell.borrow_mut().write_bytes(offset, bytes),
            None => {
                ensure!(
                    offset.checked_add(bytes.len()).is_some_and(|end| end <= self.bytes.len()),
                    "write of {} bytes at offset {offset} is out of bounds (value is {} bytes)",
                    bytes.len(),
                    self.bytes.len()
                );
                self.clear_relocations(offset, bytes.len());
                self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Read a sub-range as a fresh inline value, relocations rebased.
    pub fn read_value(&self, offset: usize, size: usize) -> Result<Value> {
        match &self.backing {
            Some(cell) => cell.borrow().read_value(offset, size),
            None => {
                let bytes = self.read_bytes(offset, size)?;
                let relocations = self
                    .relocations
                    .iter()
                    .filter(|r| r.offset >= offset && r.offset < offset + size)
                    .map(|r| Relocation { offset: r.offset - offset, target: r.target.clone() })
                    .collect();
                Ok(Value::from_parts(&bytes, relocations))
            }
        }
    }

    /// Splice another value in at `offset`: bytes copied, overlapped
    /// relocations dropped, source relocations appended shifted.
    pub fn write_value(&mut self, offset: usize, value: &Value) -> Result<()> {
        match &self.backing {
            Some(cell) => cell.borrow_mut().write_value(offset, value),
            None => {
                let (bytes, relocations) = value.snapshot();
                self.write_bytes(offset, &bytes)?;
                for reloc in relocations {
                    self.insert_relocation(offset + reloc.offset, reloc.target);
                }
                Ok(())
            }
        }
    }

    pub fn relocation_at(&self, offset: usize) -> Option<AllocHandle> {
        match &self.backing {
            Some(cell) => cell.borrow().relocation_at(offset),
            None => self
                .relocations
                .iter()
                .find(|r| r.offset == offset)
                .map(|r| r.target.clone()),
        }
    }

    /// Install a relocation for the pointer word at `offset`.
    pub fn set_relocation(&mut self, offset: usize, target: AllocHandle) {
        match &self.backing {
            Some(cell) => cell.borrow_mut().set_relocation(offset, target),
            None => {
                self.clear_relocations(offset, POINTER_SIZE);
                self.insert_relocation(offset, target);
            }
        }
    }

    fn insert_relocation(&mut self, offset: usize, target: AllocHandle) {
        let at = self.relocations.partition_point(|r| r.offset < offset);
        self.relocations.insert(at, Relocation { offset, target });
    }

    fn clear_relocations(&mut self, offset: usize, size: usize) {
        self.relocations.retain(|r| r.offset < offset || r.offset >= offset + size);
    }

    pub fn backing(&self) -> Option<AllocCell> {
        self.backing.clone()
    }

    /// Promote to a backing allocation (the address-taken path). Repeated
    /// calls return the same allocation, so every borrow of this value
    /// shares storage.
    pub fn ensure_allocation(&mut self) -> AllocCell {
        if let Some(cell) = &self.backing {
            return cell.clone();
        }
        let cell = Allocation::from_parts(self.bytes.to_vec(), std::mem::take(&mut self.relocations));
        self.bytes.clear();
        self.backing = Some(cell.clone());
        cell
    }

    fn read_scalar<T: FromBytes>(&self, offset: usize) -> Result<T> {
        match &self.backing {
            Some(cell) => cell.borrow().read_scalar(offset),
            None => read_le(&self.bytes, offset),
        }
    }

    fn write_scalar<T: IntoBytes + Immutable>(&mut self, offset: usize, value: T) -> Result<()> {
        match &self.backing {
            Some(cell) => cell.borrow_mut().write_scalar(offset, value),
            None => {
                write_le(&mut self.bytes, offset, value)?;
                self.clear_relocations(offset, std::mem::size_of::<T>());
                Ok(())
            }
        }
    }

    /// Zero-extended integer read of arbitrary width.
    pub fn read_uint(&self, offset: usize, size: usize) -> Result<u128> {
        match &self.backing {
            Some(cell) => cell.borrow().read_wide_uint(offset, size),
            None => read_uint(&self.bytes, offset, size),
        }
    }

    /// Sign-extended integer read of arbitrary width.
    pub fn read_sint(&self, offset: usize, size: usize) -> Result<i128> {
        match &self.backing {
            Some(cell) => cell.borrow().read_wide_sint(offset, size),
            None => read_sint(&self.bytes, offset, size),
        }
    }

    /// Truncating integer write of arbitrary width.
    pub fn write_uint(&mut self, offset: usize, size: usize, value: u128) -> Result<()> {
        match &self.backing {
            Some(cell) => cell.borrow_mut().write_wide_uint(offset, size, value),
            None => {
                write_uint(&mut self.bytes, offset, size, value)?;
                self.clear_relocations(offset, size);
                Ok(())
            }
        }
    }

    pub fn read_usize(&self, offset: usize) -> Result<usize> {
        Ok(self.read_scalar::<u64>(offset)? as usize)
    }

    pub fn write_usize(&mut self, offset: usize, value: usize) -> Result<()> {
        self.write_scalar(offset, value as u64)
    }

    pub fn read_isize(&self, offset: usize) -> Result<isize> {
        Ok(self.read_scalar::<i64>(offset)? as isize)
    }

    pub fn write_isize(&mut self, offset: usize, value: isize) -> Result<()> {
        self.write_scalar(offset, value as i64)
    }
}

/// Typed accessors for the fixed-width scalars; all little-endian.
macro_rules! scalar_accessors {
    ($(($read:ident, $write:ident, $ty:ty)),* $(,)?) => {
        impl Value {
            $(
                pub fn $read(&self, offset: usize) -> Result<$ty> {
                    self.read_scalar(offset)
                }

                pub fn $write(&mut self, offset: usize, value: $ty) -> Result<()> {
                    self.write_scalar(offset, value)
                }
            )*
        }
    };
}

scalar_accessors!(
    (read_u8, write_u8, u8),
    (read_u16, write_u16, u16),
    (read_u32, write_u32, u32),
    (read_u64, write_u64, u64),
    (read_u128, write_u128, u128),
    (read_i8, write_i8, i8),
    (read_i16, write_i16, i16),
    (read_i32, write_i32, i32),
    (read_i64, write_i64, i64),
    (read_i128, write_i128, i128),
    (read_f32, write_f32, f32),
    (read_f64, write_f64, f64),
);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (bytes, relocations) = self.snapshot();
        write!(f, "Value(")?;
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        for reloc in &relocations {
            write!(f, " @{}→{:?}", reloc.offset, reloc.target)?;
        }
        write!(f, ")")
    }
}

/// Storage slot in the current call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    Return,
    Local(usize),
    Argument(usize),
}

/// Root of a borrowed view: a frame slot, or an allocation reached through
/// a pointer or a static.
#[derive(Debug, Clone)]
pub enum RefRoot {
    Slot(SlotId),
    Alloc(AllocCell),
}

/// Non-owning view into storage: the result of place projection.
#[derive(Debug, Clone)]
pub struct ValueRef {
    pub root: RefRoot,
    pub offset: usize,
    pub size: usize,
}

impl ValueRef {
    pub fn slot(id: SlotId, size: usize) -> Self {
        Self { root: RefRoot::Slot(id), offset: 0, size }
    }

    pub fn alloc(cell: AllocCell, offset: usize, size: usize) -> Self {
        Self { root: RefRoot::Alloc(cell), offset, size }
    }
}

/// A value paired with its static type, for rendering.
#[derive(Debug, Clone, Copy)]
pub struct TypedValue<'a> {
    pub ty: &'a TypeRef,
    pub bytes: &'a [u8],
}

impl fmt::Display for TypedValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let required = self.ty.size().unwrap_or(0);
        if self.bytes.len() < required {
            return write!(
                f,
                "InvalidValue({}, expected {} bytes, got {})",
                self.ty,
                required,
                self.bytes.len()
            );
        }

        if !self.ty.wrappers.is_empty() {
            // Pointers render as their address word; arrays as a summary.
            return match self.ty.wrappers[0] {
                crate::ty::TypeWrapper::Borrow(_) | crate::ty::TypeWrapper::Pointer(_) => {
                    match read_le::<u64>(self.bytes, 0) {
                        Ok(addr) => write!(f, "0x{addr:x}"),
                        Err(_) => write!(f, "InvalidValue({})", self.ty),
                    }
                }
                _ => write!(f, "{}", self.ty),
            };
        }

        match &self.ty.raw {
            RawType::Unit => write!(f, "()"),
            RawType::Bool => write!(f, "{}", self.bytes[0] != 0),
            RawType::U8 => write!(f, "{}", self.bytes[0]),
            RawType::U16 => write!(f, "{}", read_le::<u16>(self.bytes, 0).unwrap()),
            RawType::U32 | RawType::Char => write!(f, "{}", read_le::<u32>(self.bytes, 0).unwrap()),
            RawType::U64 | RawType::USize => write!(f, "{}", read_le::<u64>(self.bytes, 0).unwrap()),
            RawType::U128 => write!(f, "{}", read_le::<u128>(self.bytes, 0).unwrap()),
            RawType::I8 => write!(f, "{}", self.bytes[0] as i8),
            RawType::I16 => write!(f, "{}", read_le::<i16>(self.bytes, 0).unwrap()),
            RawType::I32 => write!(f, "{}", read_le::<i32>(self.bytes, 0).unwrap()),
            RawType::I64 | RawType::ISize => write!(f, "{}", read_le::<i64>(self.bytes, 0).unwrap()),
            RawType::I128 => write!(f, "{}", read_le::<i128>(self.bytes, 0).unwrap()),
            RawType::F32 => write!(f, "{}", read_le::<f32>(self.bytes, 0).unwrap()),
            RawType::F64 => write!(f, "{}", read_le::<f64>(self.bytes, 0).unwrap()),
            RawType::Composite(c) => {
                let Ok(body) = c.body() else {
                    return write!(f, "{}(?)", c.path);
                };
                write!(f, "(")?;
                for (i, (offset, field_ty)) in body.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let field_size = field_ty.size().unwrap_or(0);
                    match self.bytes.get(*offset..offset + field_size) {
                        Some(field_bytes) => {
                            write!(f, "{}", TypedValue { ty: field_ty, bytes: field_bytes })?
                        }
                        None => write!(f, "?")?,
                    }
                }
                write!(f, ")")
            }
            other => write!(f, "Unsupported({other})"),
        }
    }
}
