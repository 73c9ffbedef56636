//! Byte-level storage: allocations and pointer relocations.
//!
//! An [`Allocation`] is a mutable byte buffer plus a sorted list of
//! [`Relocation`]s recording which pointer-sized words carry provenance.
//! Allocations are shared and reference-counted ([`AllocCell`]); handle
//! equality is identity. Writes invalidate any relocation they span; value
//! writes splice the source's relocations in at shifted offsets.

use crate::mir::Path;
use crate::ty::POINTER_SIZE;
use crate::value::Value;
use anyhow::{ensure, Result};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Shared handle to a mutable allocation.
pub type AllocCell = Rc<RefCell<Allocation>>;

/// Target of a relocation: either another allocation or a function item.
#[derive(Clone)]
pub enum AllocHandle {
    Memory(AllocCell),
    Function(Path),
}

impl AllocHandle {
    pub fn as_memory(&self) -> Option<&AllocCell> {
        match self {
            AllocHandle::Memory(cell) => Some(cell),
            AllocHandle::Function(_) => None,
        }
    }

    pub fn as_function(&self) -> Option<&Path> {
        match self {
            AllocHandle::Memory(_) => None,
            AllocHandle::Function(path) => Some(path),
        }
    }

    /// Stable, implementation-defined total order used by pointer
    /// comparisons: memory handles (by allocation address) before function
    /// handles (by path).
    pub fn order(&self, other: &Self) -> Ordering {
        match (self, other) {
            (AllocHandle::Memory(a), AllocHandle::Memory(b)) => {
                (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize))
            }
            (AllocHandle::Memory(_), AllocHandle::Function(_)) => Ordering::Less,
            (AllocHandle::Function(_), AllocHandle::Memory(_)) => Ordering::Greater,
            (AllocHandle::Function(a), AllocHandle::Function(b)) => a.cmp(b),
        }
    }
}

impl PartialEq for AllocHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AllocHandle::Memory(a), AllocHandle::Memory(b)) => Rc::ptr_eq(a, b),
            (AllocHandle::Function(a), AllocHandle::Function(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for AllocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocHandle::Memory(cell) => write!(f, "alloc({:p})", Rc::as_ptr(cell)),
            AllocHandle::Function(path) => write!(f, "fn({path})"),
        }
    }
}

/// Provenance marker: the pointer word at `offset` targets `target`.
#[derive(Clone, Debug, PartialEq)]
pub struct Relocation {
    pub offset: usize,
    pub target: AllocHandle,
}

/// A mutable byte buffer with relocations, shared behind an [`AllocCell`].
#[derive(Debug, Default)]
pub struct Allocation {
    data: Vec<u8>,
    relocations: Vec<Relocation>,
}

impl Allocation {
    pub fn zeroed(size: usize) -> AllocCell {
        Rc::new(RefCell::new(Self { data: vec![0; size], relocations: Vec::new() }))
    }

    pub fn from_bytes(bytes: &[u8]) -> AllocCell {
        Rc::new(RefCell::new(Self { data: bytes.to_vec(), relocations: Vec::new() }))
    }

    pub(crate) fn from_parts(data: Vec<u8>, relocations: Vec<Relocation>) -> AllocCell {
        Rc::new(RefCell::new(Self { data, relocations }))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_range(&self, offset: usize, size: usize) -> Result<()> {
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.data.len()),
            "access of {size} bytes at offset {offset} is out of bounds (allocation is {} bytes)",
            self.data.len()
        );
        Ok(())
    }

    pub fn bytes(&self, offset: usize, size: usize) -> Result<&[u8]> {
        self.check_range(offset, size)?;
        Ok(&self.data[offset..offset + size])
    }

    /// Raw byte write; drops every relocation the written range overlaps.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        self.clear_relocations(offset, bytes.len());
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn relocation_at(&self, offset: usize) -> Option<AllocHandle> {
        self.relocations
            .iter()
            .find(|r| r.offset == offset)
            .map(|r| r.target.clone())
    }

    /// Install a relocation for the pointer word at `offset`, replacing any
    /// relocation that word overlapped.
    pub fn set_relocation(&mut self, offset: usize, target: AllocHandle) {
        self.clear_relocations(offset, POINTER_SIZE);
        let at = self.relocations.partition_point(|r| r.offset < offset);
        self.relocations.insert(at, Relocation { offset, target });
    }

    fn clear_relocations(&mut self, offset: usize, size: usize) {
        self.relocations.retain(|r| r.offset < offset || r.offset >= offset + size);
    }

    /// Copy a value's bytes in at `offset` and splice its relocations in at
    /// shifted offsets, replacing whatever the range previously held.
    pub fn write_value(&mut self, offset: usize, value: &Value) -> Result<()> {
        let (bytes, relocations) = value.snapshot();
        self.write_bytes(offset, &bytes)?;
        for reloc in relocations {
            let at = self.relocations.partition_point(|r| r.offset < offset + reloc.offset);
            self.relocations
                .insert(at, Relocation { offset: offset + reloc.offset, target: reloc.target });
        }
        Ok(())
    }

    /// Materialize `size` bytes at `offset` as an inline value, carrying
    /// along every relocation in range (rebased to the value).
    pub fn read_value(&self, offset: usize, size: usize) -> Result<Value> {
        let bytes = self.bytes(offset, size)?;
        let relocations = self
            .relocations
            .iter()
            .filter(|r| r.offset >= offset && r.offset < offset + size)
            .map(|r| Relocation { offset: r.offset - offset, target: r.target.clone() })
            .collect();
        Ok(Value::from_parts(bytes, relocations))
    }

    pub fn read_usize(&self, offset: usize) -> Result<usize> {
        Ok(read_le::<u64>(&self.data, offset)? as usize)
    }

    pub fn write_usize(&mut self, offset: usize, value: usize) -> Result<()> {
        self.write_scalar(offset, value as u64)
    }

    pub(crate) fn read_scalar<T: FromBytes>(&self, offset: usize) -> Result<T> {
        read_le(&self.data, offset)
    }

    pub(crate) fn write_scalar<T: IntoBytes + Immutable>(&mut self, offset: usize, value: T) -> Result<()> {
        self.check_range(offset, std::mem::size_of::<T>())?;
        self.clear_relocations(offset, std::mem::size_of::<T>());
        write_le(&mut self.data, offset, value)
    }

    pub(crate) fn read_wide_uint(&self, offset: usize, size: usize) -> Result<u128> {
        read_uint(&self.data, offset, size)
    }

    pub(crate) fn read_wide_sint(&self, offset: usize, size: usize) -> Result<i128> {
        read_sint(&self.data, offset, size)
    }

    pub(crate) fn write_wide_uint(&mut self, offset: usize, size: usize, value: u128) -> Result<()> {
        self.check_range(offset, size)?;
        self.clear_relocations(offset, size);
        write_uint(&mut self.data, offset, size, value)
    }
}

/// Little-endian scalar read out of a byte buffer.
pub(crate) fn read_le<T: FromBytes>(buf: &[u8], offset: usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        offset.checked_add(size).is_some_and(|end| end <= buf.len()),
        "read of {size} bytes at offset {offset} is out of bounds (buffer is {} bytes)",
        buf.len()
    );
    T::read_from_bytes(&buf[offset..offset + size])
        .map_err(|_| anyhow::anyhow!("scalar read of {size} bytes failed"))
}

/// Little-endian scalar write into a byte buffer.
pub(crate) fn write_le<T: IntoBytes + Immutable>(buf: &mut [u8], offset: usize, value: T) -> Result<()> {
    let bytes = value.as_bytes();
    ensure!(
        offset.checked_add(bytes.len()).is_some_and(|end| end <= buf.len()),
        "write of {} bytes at offset {offset} is out of bounds (buffer is {} bytes)",
        bytes.len(),
        buf.len()
    );
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Read an unsigned integer of arbitrary byte width, zero-extended.
pub(crate) fn read_uint(buf: &[u8], offset: usize, size: usize) -> Result<u128> {
    ensure!(size <= 16, "integer width {size} unsupported");
    ensure!(
        offset.checked_add(size).is_some_and(|end| end <= buf.len()),
        "read of {size} bytes at offset {offset} is out of bounds (buffer is {} bytes)",
        buf.len()
    );
    let mut raw = [0u8; 16];
    raw[..size].copy_from_slice(&buf[offset..offset + size]);
    Ok(u128::from_le_bytes(raw))
}

/// Read a signed integer of arbitrary byte width, sign-extended.
pub(crate) fn read_sint(buf: &[u8], offset: usize, size: usize) -> Result<i128> {
    let raw = read_uint(buf, offset, size)?;
    if size == 0 {
        return Ok(0);
    }
    let shift = 128 - 8 * size as u32;
    Ok(((raw as i128) << shift) >> shift)
}

/// Write the low `size` bytes of an integer, little-endian.
pub(crate) fn write_uint(buf: &mut [u8], offset: usize, size: usize, value: u128) -> Result<()> {
    ensure!(size <= 16, "integer width {size} unsupported");
    ensure!(
        offset.checked_add(size).is_some_and(|end| end <= buf.len()),
        "write of {size} bytes at offset {offset} is out of bounds (buffer is {} bytes)",
        buf.len()
    );
    buf[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
    Ok(())
}
