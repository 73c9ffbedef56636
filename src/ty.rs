//! The interpreter's type model.
//!
//! A [`TypeRef`] is a sequence of wrappers (outermost first) applied over a
//! primitive [`RawType`]. Composite layout lives in shared, read-only
//! [`Composite`] descriptors produced by the module loader; field offsets are
//! precomputed there, so the type model only answers lookups.

use crate::mir::Path;
use anyhow::{bail, ensure, Result};
use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

/// Width in bytes of `usize`/`isize` and of thin pointers in interpreted
/// programs. Fat pointers are two of these.
pub const POINTER_SIZE: usize = 8;

/// Borrow class carried by `Borrow` wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowKind {
    Shared,
    Unique,
    Move,
}

/// Mutability of raw pointer wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    Const,
    Mut,
}

/// A single type constructor applied over an inner type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeWrapper {
    Borrow(BorrowKind),
    Pointer(Mutability),
    Array(usize),
    Slice,
}

/// The primitive (innermost) kind of a type.
#[derive(Debug, Clone)]
pub enum RawType {
    Unreachable,
    Unit,
    Bool,
    Char,
    U8,
    U16,
    U32,
    U64,
    U128,
    I8,
    I16,
    I32,
    I64,
    I128,
    USize,
    ISize,
    F32,
    F64,
    Str,
    Composite(Rc<Composite>),
    TraitObject(Rc<Composite>),
    Function,
}

impl PartialEq for RawType {
    fn eq(&self, other: &Self) -> bool {
        use RawType::*;
        match (self, other) {
            // Descriptor identity, not structure: descriptors can be cyclic.
            (Composite(a), Composite(b)) | (TraitObject(a), TraitObject(b)) => Rc::ptr_eq(a, b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl RawType {
    pub fn size(&self) -> Result<usize> {
        use RawType::*;
        Ok(match self {
            Unit => 0,
            Bool | U8 | I8 => 1,
            U16 | I16 => 2,
            Char | U32 | I32 | F32 => 4,
            U64 | I64 | F64 => 8,
            U128 | I128 => 16,
            USize | ISize | Function => POINTER_SIZE,
            Composite(c) => c.body()?.size,
            Unreachable => bail!("type `!` has no size"),
            Str => bail!("`str` is unsized"),
            TraitObject(c) => bail!("trait object `{}` is unsized", c.path),
        })
    }

    pub fn is_signed_int(&self) -> bool {
        matches!(
            self,
            RawType::I8 | RawType::I16 | RawType::I32 | RawType::I64 | RawType::I128 | RawType::ISize
        )
    }

    pub fn is_unsigned_int(&self) -> bool {
        matches!(
            self,
            RawType::U8 | RawType::U16 | RawType::U32 | RawType::U64 | RawType::U128 | RawType::USize
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, RawType::F32 | RawType::F64)
    }
}

/// A full type: wrappers applied outermost-first over a primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeRef {
    pub wrappers: Vec<TypeWrapper>,
    pub raw: RawType,
}

impl From<RawType> for TypeRef {
    fn from(raw: RawType) -> Self {
        Self { wrappers: Vec::new(), raw }
    }
}

impl TypeRef {
    pub fn unit() -> Self {
        RawType::Unit.into()
    }

    /// Wrap `self` in an additional outermost constructor.
    pub fn wrapped(mut self, wrapper: TypeWrapper) -> Self {
        self.wrappers.insert(0, wrapper);
        self
    }

    /// Strip the outermost wrapper.
    pub fn inner(&self) -> Result<TypeRef> {
        ensure!(!self.wrappers.is_empty(), "type `{self}` has no inner type");
        Ok(TypeRef { wrappers: self.wrappers[1..].to_vec(), raw: self.raw.clone() })
    }

    /// True for types whose borrows/pointers carry a length word: `str` and
    /// slice-headed types.
    pub fn has_slice_metadata(&self) -> bool {
        match self.wrappers.first() {
            Some(TypeWrapper::Slice) => true,
            Some(_) => false,
            None => matches!(self.raw, RawType::Str),
        }
    }

    /// True when a borrow/pointer to this type needs a metadata word.
    pub fn needs_pointer_metadata(&self) -> bool {
        self.has_slice_metadata()
            || (self.wrappers.is_empty() && matches!(self.raw, RawType::TraitObject(_)))
    }

    /// Size in bytes, or an error for unsized types.
    pub fn size(&self) -> Result<usize> {
        match self.wrappers.first() {
            None => self.raw.size(),
            Some(TypeWrapper::Borrow(_)) | Some(TypeWrapper::Pointer(_)) => {
                let fat = self.inner()?.needs_pointer_metadata();
                Ok(if fat { 2 * POINTER_SIZE } else { POINTER_SIZE })
            }
            Some(TypeWrapper::Array(count)) => Ok(count * self.inner()?.size()?),
            Some(TypeWrapper::Slice) => bail!("slice type `{self}` is unsized"),
        }
    }

    fn composite(&self) -> Result<&Rc<Composite>> {
        ensure!(self.wrappers.is_empty(), "type `{self}` is not a composite");
        match &self.raw {
            RawType::Composite(c) => Ok(c),
            _ => bail!("type `{self}` is not a composite"),
        }
    }

    /// Offset and type of field `idx`.
    pub fn field(&self, idx: usize) -> Result<(usize, TypeRef)> {
        let body = self.composite()?.body()?;
        let (offset, ty) = body
            .fields
            .get(idx)
            .ok_or_else(|| anyhow::anyhow!("field {idx} out of range for `{self}`"))?;
        Ok((*offset, ty.clone()))
    }

    /// Offset and type of variant `vidx`'s payload, through the variant table.
    pub fn variant_field(&self, vidx: usize) -> Result<(usize, TypeRef)> {
        let body = self.composite()?.body()?;
        let variant = body
            .variants
            .get(vidx)
            .ok_or_else(|| anyhow::anyhow!("variant {vidx} out of range for `{self}`"))?;
        let data_field = variant
            .data_field
            .ok_or_else(|| anyhow::anyhow!("variant {vidx} of `{self}` has no payload"))?;
        self.field(data_field)
    }

    /// Resolve a variant's tag location: start at `base_field`, then project
    /// each step of `field_path` into the nested composites.
    pub fn tag_offset(&self, base_field: usize, field_path: &[usize]) -> Result<(usize, TypeRef)> {
        let (mut offset, mut ty) = self.field(base_field)?;
        for &step in field_path {
            let (step_ofs, step_ty) = ty.field(step)?;
            offset += step_ofs;
            ty = step_ty;
        }
        Ok((offset, ty))
    }
}

fn render_type(wrappers: &[TypeWrapper], raw: &RawType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match wrappers.first() {
        None => write!(f, "{raw}"),
        Some(TypeWrapper::Borrow(kind)) => {
            let prefix = match kind {
                BorrowKind::Shared => "&",
                BorrowKind::Unique => "&mut ",
                BorrowKind::Move => "&move ",
            };
            write!(f, "{prefix}")?;
            render_type(&wrappers[1..], raw, f)
        }
        Some(TypeWrapper::Pointer(mutability)) => {
            let prefix = match mutability {
                Mutability::Const => "*const ",
                Mutability::Mut => "*mut ",
            };
            write!(f, "{prefix}")?;
            render_type(&wrappers[1..], raw, f)
        }
        Some(TypeWrapper::Array(count)) => {
            write!(f, "[")?;
            render_type(&wrappers[1..], raw, f)?;
            write!(f, "; {count}]")
        }
        Some(TypeWrapper::Slice) => {
            write!(f, "[")?;
            render_type(&wrappers[1..], raw, f)?;
            write!(f, "]")
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_type(&self.wrappers, &self.raw, f)
    }
}

impl fmt::Display for RawType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use RawType::*;
        match self {
            Unreachable => write!(f, "!"),
            Unit => write!(f, "()"),
            Bool => write!(f, "bool"),
            Char => write!(f, "char"),
            U8 => write!(f, "u8"),
            U16 => write!(f, "u16"),
            U32 => write!(f, "u32"),
            U64 => write!(f, "u64"),
            U128 => write!(f, "u128"),
            I8 => write!(f, "i8"),
            I16 => write!(f, "i16"),
            I32 => write!(f, "i32"),
            I64 => write!(f, "i64"),
            I128 => write!(f, "i128"),
            USize => write!(f, "usize"),
            ISize => write!(f, "isize"),
            F32 => write!(f, "f32"),
            F64 => write!(f, "f64"),
            Str => write!(f, "str"),
            Composite(c) => write!(f, "{}", c.path),
            TraitObject(c) => write!(f, "dyn {}", c.path),
            Function => write!(f, "fn"),
        }
    }
}

/// Shared composite descriptor. Created as an empty shell so descriptors can
/// reference each other (and themselves, through pointer wrappers) before
/// their bodies are filled in by the loader.
#[derive(Debug)]
pub struct Composite {
    pub path: Path,
    body: OnceCell<CompositeBody>,
}

#[derive(Debug)]
pub struct CompositeBody {
    pub size: usize,
    /// Ordered `(offset, type)` pairs; variant payloads are fields too.
    pub fields: Vec<(usize, TypeRef)>,
    pub variants: Vec<Variant>,
    pub drop_glue: Option<Path>,
}

/// One variant of a tagged composite. `tag_data` is the byte pattern stored
/// at the location named by `base_field` + `field_path`; an empty pattern
/// marks the default (untagged) variant.
#[derive(Debug, Clone)]
pub struct Variant {
    pub data_field: Option<usize>,
    pub base_field: Option<usize>,
    pub field_path: Vec<usize>,
    pub tag_data: Vec<u8>,
}

impl Composite {
    pub fn shell(path: Path) -> Rc<Self> {
        Rc::new(Self { path, body: OnceCell::new() })
    }

    /// Construct a fully-defined descriptor in one step.
    pub fn define_new(path: Path, body: CompositeBody) -> Rc<Self> {
        let shell = Self::shell(path);
        shell.define(body).expect("fresh shell");
        shell
    }

    pub fn define(&self, body: CompositeBody) -> Result<()> {
        self.body
            .set(body)
            .map_err(|_| anyhow::anyhow!("composite `{}` defined twice", self.path))
    }

    pub fn body(&self) -> Result<&CompositeBody> {
        self.body.get().ok_or_else(|| {
            anyhow::anyhow!("composite `{}` used before its body was loaded", self.path)
        })
    }
}
