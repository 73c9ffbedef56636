//! Binary serialization of module trees.
//!
//! Design goals:
//! - Portable, explicit encoding (little-endian, fixed-width integers).
//! - Deterministic (canonical) output: tables are sorted by path, so
//!   `encode -> decode -> encode` is byte-identical.
//! - Decode failures carry the byte offset they were detected at.
//!
//! The format is versioned but treated as internal stability: no forward
//! compatibility is promised across major versions.

use crate::memory::{AllocCell, AllocHandle, Allocation};
use crate::mir::{
    BasicBlock, BinOp, Body, CallTarget, Constant, DropKind, LValue, Param, Path, RValue,
    Statement, Terminator, UniOp,
};
use crate::module::{ExternLink, FunctionDef, ModuleTree};
use crate::ty::{BorrowKind, Composite, CompositeBody, Mutability, RawType, TypeRef, TypeWrapper, Variant};
use std::collections::HashMap;
use std::rc::Rc;

const MAGIC: &[u8; 8] = b"CRABMIR\0";
const VERSION_MAJOR: u16 = 0;
const VERSION_MINOR: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError {
    pub message: String,
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encode error: {}", self.message)
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub message: String,
    pub offset: usize,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error at byte {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for DecodeError {}

pub fn to_bytes(tree: &ModuleTree) -> Result<Vec<u8>, EncodeError> {
    let mut enc = Encoder::new(tree);
    enc.write_bytes(MAGIC);
    enc.write_u16(VERSION_MAJOR);
    enc.write_u16(VERSION_MINOR);
    enc.write_module(tree)?;
    Ok(enc.finish())
}

pub fn from_bytes(bytes: &[u8]) -> Result<ModuleTree, DecodeError> {
    let mut dec = Decoder::new(bytes);
    dec.expect_bytes(MAGIC, "bad magic")?;
    let major = dec.read_u16()?;
    let minor = dec.read_u16()?;
    if major != VERSION_MAJOR {
        return Err(dec.err(format!(
            "unsupported module version {major}.{minor} (expected {VERSION_MAJOR}.{VERSION_MINOR})"
        )));
    }
    let tree = dec.read_module()?;
    if dec.remaining() != 0 {
        return Err(dec.err("trailing bytes".to_string()));
    }
    Ok(tree)
}

struct Encoder {
    buf: Vec<u8>,
    /// Descriptor identity -> table index, in canonical (path-sorted) order.
    composite_ids: HashMap<*const Composite, u32>,
    /// Allocation identity -> owning static, for relocation targets.
    static_owners: HashMap<*const std::cell::RefCell<crate::memory::Allocation>, Path>,
}

impl Encoder {
    fn new(tree: &ModuleTree) -> Self {
        let mut composites: Vec<_> = tree.composites().cloned().collect();
        composites.sort_by(|a, b| a.path.cmp(&b.path));
        let composite_ids = composites
            .iter()
            .enumerate()
            .map(|(i, c)| (Rc::as_ptr(c), i as u32))
            .collect();
        let static_owners = tree
            .statics()
            .map(|(path, def)| (Rc::as_ptr(&def.cell), path.clone()))
            .collect();
        Self { buf: Vec::new(), composite_ids, static_owners }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }

    fn write_len(&mut self, len: usize) -> Result<(), EncodeError> {
        let len: u32 = len
            .try_into()
            .map_err(|_| EncodeError { message: "length overflow".to_string() })?;
        self.write_u32(len);
        Ok(())
    }

    fn write_index(&mut self, idx: usize) -> Result<(), EncodeError> {
        self.write_len(idx)
    }

    fn write_opt_index(&mut self, idx: Option<usize>) -> Result<(), EncodeError> {
        match idx {
            None => self.write_u8(0),
            Some(idx) => {
                self.write_u8(1);
                self.write_index(idx)?;
            }
        }
        Ok(())
    }

    fn write_string(&mut self, s: &str) -> Result<(), EncodeError> {
        self.write_len(s.len())?;
        self.write_bytes(s.as_bytes());
        Ok(())
    }

    fn write_blob(&mut self, b: &[u8]) -> Result<(), EncodeError> {
        self.write_len(b.len())?;
        self.write_bytes(b);
        Ok(())
    }

    fn write_path(&mut self, path: &Path) -> Result<(), EncodeError> {
        self.write_string(&path.0)
    }

    fn write_module(&mut self, tree: &ModuleTree) -> Result<(), EncodeError> {
        // Composites: paths first so decoders can create the shells, then
        // the bodies (which may reference any shell, including their own).
        let mut composites: Vec<_> = tree.composites().cloned().collect();
        composites.sort_by(|a, b| a.path.cmp(&b.path));
        self.write_len(composites.len())?;
        for composite in &composites {
            self.write_path(&composite.path)?;
        }
        for composite in &composites {
            let body = composite.body().map_err(|e| EncodeError { message: e.to_string() })?;
            self.write_composite_body(body)?;
        }

        let mut functions: Vec<_> = tree.functions().cloned().collect();
        functions.sort_by(|a, b| a.path.cmp(&b.path));
        self.write_len(functions.len())?;
        for function in &functions {
            self.write_function(function)?;
        }

        let mut statics: Vec<_> = tree.statics().collect();
        statics.sort_by(|a, b| a.0.cmp(b.0));
        self.write_len(statics.len())?;
        for (path, def) in statics {
            self.write_path(path)?;
            self.write_type(&def.ty)?;
            let alloc = def.cell.borrow();
            self.write_blob(alloc.bytes(0, alloc.len()).expect("full range"))?;
            self.write_len(alloc.relocations().len())?;
            for reloc in alloc.relocations() {
                self.write_u64(reloc.offset as u64);
                match &reloc.target {
                    AllocHandle::Memory(cell) => {
                        let owner = self.static_owners.get(&Rc::as_ptr(cell)).cloned().ok_or_else(|| EncodeError {
                            message: format!("static `{path}` references an allocation that is not a static"),
                        })?;
                        self.write_u8(0);
                        self.write_path(&owner)?;
                    }
                    AllocHandle::Function(target) => {
                        let target = target.clone();
                        self.write_u8(1);
                        self.write_path(&target)?;
                    }
                }
            }
        }

        let mut lang_items: Vec<_> = tree.lang_items.iter().collect();
        lang_items.sort();
        self.write_len(lang_items.len())?;
        for (name, path) in lang_items {
            self.write_string(name)?;
            self.write_path(path)?;
        }
        Ok(())
    }

    fn write_composite_body(&mut self, body: &CompositeBody) -> Result<(), EncodeError> {
        self.write_u64(body.size as u64);
        self.write_len(body.fields.len())?;
        for (offset, ty) in &body.fields {
            self.write_u64(*offset as u64);
            self.write_type(ty)?;
        }
        self.write_len(body.variants.len())?;
        for variant in &body.variants {
            self.write_opt_index(variant.data_field)?;
            self.write_opt_index(variant.base_field)?;
            self.write_len(variant.field_path.len())?;
            for step in &variant.field_path {
                self.write_index(*step)?;
            }
            self.write_blob(&variant.tag_data)?;
        }
        match &body.drop_glue {
            None => self.write_u8(0),
            Some(path) => {
                self.write_u8(1);
                self.write_path(path)?;
            }
        }
        Ok(())
    }

    fn write_function(&mut self, function: &FunctionDef) -> Result<(), EncodeError> {
        self.write_path(&function.path)?;
        match &function.external {
            None => self.write_u8(0),
            Some(link) => {
                self.write_u8(1);
                self.write_string(&link.name)?;
                self.write_string(&link.abi)?;
            }
        }
        self.write_len(function.args.len())?;
        for ty in &function.args {
            self.write_type(ty)?;
        }
        self.write_type(&function.ret_ty)?;
        self.write_len(function.body.locals.len())?;
        for ty in &function.body.locals {
            self.write_type(ty)?;
        }
        self.write_len(function.body.drop_flags.len())?;
        for flag in &function.body.drop_flags {
            self.write_bool(*flag);
        }
        self.write_len(function.body.blocks.len())?;
        for block in &function.body.blocks {
            self.write_len(block.statements.len())?;
            for statement in &block.statements {
                self.write_statement(statement)?;
            }
            self.write_terminator(&block.terminator)?;
        }
        Ok(())
    }

    fn write_type(&mut self, ty: &TypeRef) -> Result<(), EncodeError> {
        self.write_len(ty.wrappers.len())?;
        for wrapper in &ty.wrappers {
            match wrapper {
                TypeWrapper::Borrow(kind) => {
                    self.write_u8(0);
                    self.write_u8(match kind {
                        BorrowKind::Shared => 0,
                        BorrowKind::Unique => 1,
                        BorrowKind::Move => 2,
                    });
                }
                TypeWrapper::Pointer(mutability) => {
                    self.write_u8(1);
                    self.write_u8(match mutability {
                        Mutability::Const => 0,
                        Mutability::Mut => 1,
                    });
                }
                TypeWrapper::Array(count) => {
                    self.write_u8(2);
                    self.write_u64(*count as u64);
                }
                TypeWrapper::Slice => self.write_u8(3),
            }
        }
        self.write_raw_type(&ty.raw)
    }

    fn write_raw_type(&mut self, raw: &RawType) -> Result<(), EncodeError> {
        use RawType::*;
        let tag: u8 = match raw {
            Unreachable => 0,
            Unit => 1,
            Bool => 2,
            Char => 3,
            U8 => 4,
            U16 => 5,
            U32 => 6,
            U64 => 7,
            U128 => 8,
            I8 => 9,
            I16 => 10,
            I32 => 11,
            I64 => 12,
            I128 => 13,
            USize => 14,
            ISize => 15,
            F32 => 16,
            F64 => 17,
            Str => 18,
            Composite(_) => 19,
            TraitObject(_) => 20,
            Function => 21,
        };
        self.write_u8(tag);
        if let Composite(c) | TraitObject(c) = raw {
            let id = self.composite_ids.get(&Rc::as_ptr(c)).copied().ok_or_else(|| EncodeError {
                message: format!("composite `{}` is not registered with the module", c.path),
            })?;
            self.write_u32(id);
        }
        Ok(())
    }

    fn write_lvalue(&mut self, lv: &LValue) -> Result<(), EncodeError> {
        match lv {
            LValue::Return => self.write_u8(0),
            LValue::Local(idx) => {
                self.write_u8(1);
                self.write_index(*idx)?;
            }
            LValue::Argument(idx) => {
                self.write_u8(2);
                self.write_index(*idx)?;
            }
            LValue::Static(path) => {
                self.write_u8(3);
                self.write_path(path)?;
            }
            LValue::Field { base, index } => {
                self.write_u8(4);
                self.write_lvalue(base)?;
                self.write_index(*index)?;
            }
            LValue::Downcast { base, variant } => {
                self.write_u8(5);
                self.write_lvalue(base)?;
                self.write_index(*variant)?;
            }
            LValue::Index { base, index } => {
                self.write_u8(6);
                self.write_lvalue(base)?;
                self.write_lvalue(index)?;
            }
            LValue::Deref { base } => {
                self.write_u8(7);
                self.write_lvalue(base)?;
            }
        }
        Ok(())
    }

    fn write_constant(&mut self, constant: &Constant) -> Result<(), EncodeError> {
        match constant {
            Constant::Int { value, ty } => {
                self.write_u8(0);
                self.write_i64(*value);
                self.write_raw_type(ty)?;
            }
            Constant::Uint { value, ty } => {
                self.write_u8(1);
                self.write_u64(*value);
                self.write_raw_type(ty)?;
            }
            Constant::Float { value, ty } => {
                self.write_u8(2);
                self.write_f64(*value);
                self.write_raw_type(ty)?;
            }
            Constant::Bool(value) => {
                self.write_u8(3);
                self.write_bool(*value);
            }
            Constant::StaticString(literal) => {
                self.write_u8(4);
                self.write_string(literal)?;
            }
            Constant::ItemAddr(path) => {
                self.write_u8(5);
                self.write_path(path)?;
            }
        }
        Ok(())
    }

    fn write_param(&mut self, param: &Param) -> Result<(), EncodeError> {
        match param {
            Param::LValue(lv) => {
                self.write_u8(0);
                self.write_lvalue(lv)
            }
            Param::Constant(c) => {
                self.write_u8(1);
                self.write_constant(c)
            }
        }
    }

    fn write_params(&mut self, params: &[Param]) -> Result<(), EncodeError> {
        self.write_len(params.len())?;
        for param in params {
            self.write_param(param)?;
        }
        Ok(())
    }

    fn write_rvalue(&mut self, rv: &RValue) -> Result<(), EncodeError> {
        match rv {
            RValue::Use(lv) => {
                self.write_u8(0);
                self.write_lvalue(lv)?;
            }
            RValue::Constant(c) => {
                self.write_u8(1);
                self.write_constant(c)?;
            }
            RValue::Borrow { kind, val } => {
                self.write_u8(2);
                self.write_u8(match kind {
                    BorrowKind::Shared => 0,
                    BorrowKind::Unique => 1,
                    BorrowKind::Move => 2,
                });
                self.write_lvalue(val)?;
            }
            RValue::Cast { val, ty } => {
                self.write_u8(3);
                self.write_lvalue(val)?;
                self.write_type(ty)?;
            }
            RValue::BinOp { op, lhs, rhs } => {
                self.write_u8(4);
                self.write_u8(binop_tag(*op));
                self.write_param(lhs)?;
                self.write_param(rhs)?;
            }
            RValue::UniOp { op, val } => {
                self.write_u8(5);
                self.write_u8(match op {
                    UniOp::Inv => 0,
                    UniOp::Neg => 1,
                });
                self.write_lvalue(val)?;
            }
            RValue::DstMeta { val } => {
                self.write_u8(6);
                self.write_lvalue(val)?;
            }
            RValue::DstPtr { val } => {
                self.write_u8(7);
                self.write_lvalue(val)?;
            }
            RValue::MakeDst { ptr, meta } => {
                self.write_u8(8);
                self.write_param(ptr)?;
                self.write_param(meta)?;
            }
            RValue::Tuple { vals } => {
                self.write_u8(9);
                self.write_params(vals)?;
            }
            RValue::Array { vals } => {
                self.write_u8(10);
                self.write_params(vals)?;
            }
            RValue::SizedArray { val, count } => {
                self.write_u8(11);
                self.write_param(val)?;
                self.write_u64(*count as u64);
            }
            RValue::Variant { path, index, val } => {
                self.write_u8(12);
                self.write_path(path)?;
                self.write_index(*index)?;
                match val {
                    None => self.write_u8(0),
                    Some(param) => {
                        self.write_u8(1);
                        self.write_param(param)?;
                    }
                }
            }
            RValue::Struct { path, vals } => {
                self.write_u8(13);
                self.write_path(path)?;
                self.write_params(vals)?;
            }
        }
        Ok(())
    }

    fn write_statement(&mut self, statement: &Statement) -> Result<(), EncodeError> {
        match statement {
            Statement::Assign { dst, src } => {
                self.write_u8(0);
                self.write_lvalue(dst)?;
                self.write_rvalue(src)?;
            }
            Statement::Drop { slot, flag, kind } => {
                self.write_u8(1);
                self.write_lvalue(slot)?;
                self.write_opt_index(*flag)?;
                self.write_u8(match kind {
                    DropKind::Deep => 0,
                    DropKind::Shallow => 1,
                });
            }
            Statement::SetDropFlag { idx, new_val, other } => {
                self.write_u8(2);
                self.write_index(*idx)?;
                self.write_bool(*new_val);
                self.write_opt_index(*other)?;
            }
            Statement::Asm => self.write_u8(3),
            Statement::ScopeEnd => self.write_u8(4),
        }
        Ok(())
    }

    fn write_terminator(&mut self, terminator: &Terminator) -> Result<(), EncodeError> {
        match terminator {
            Terminator::Incomplete => self.write_u8(0),
            Terminator::Goto(bb) => {
                self.write_u8(1);
                self.write_index(*bb)?;
            }
            Terminator::Return => self.write_u8(2),
            Terminator::Diverge => self.write_u8(3),
            Terminator::Panic => self.write_u8(4),
            Terminator::If { cond, bb_true, bb_false } => {
                self.write_u8(5);
                self.write_lvalue(cond)?;
                self.write_index(*bb_true)?;
                self.write_index(*bb_false)?;
            }
            Terminator::Switch { val, targets } => {
                self.write_u8(6);
                self.write_lvalue(val)?;
                self.write_len(targets.len())?;
                for target in targets {
                    self.write_index(*target)?;
                }
            }
            Terminator::SwitchValue => self.write_u8(7),
            Terminator::Call { dst, target, args, ret_block } => {
                self.write_u8(8);
                self.write_lvalue(dst)?;
                match target {
                    CallTarget::Path(path) => {
                        self.write_u8(0);
                        self.write_path(path)?;
                    }
                    CallTarget::Intrinsic { name, params } => {
                        self.write_u8(1);
                        self.write_string(name)?;
                        self.write_len(params.len())?;
                        for ty in params {
                            self.write_type(ty)?;
                        }
                    }
                    CallTarget::Value(lv) => {
                        self.write_u8(2);
                        self.write_lvalue(lv)?;
                    }
                }
                self.write_params(args)?;
                self.write_index(*ret_block)?;
            }
        }
        Ok(())
    }
}

fn binop_tag(op: BinOp) -> u8 {
    use BinOp::*;
    match op {
        Add => 0,
        Sub => 1,
        Mul => 2,
        Div => 3,
        Mod => 4,
        BitAnd => 5,
        BitOr => 6,
        BitXor => 7,
        Shl => 8,
        Shr => 9,
        Eq => 10,
        Ne => 11,
        Gt => 12,
        Ge => 13,
        Lt => 14,
        Le => 15,
    }
}

fn binop_from_tag(tag: u8) -> Option<BinOp> {
    use BinOp::*;
    Some(match tag {
        0 => Add,
        1 => Sub,
        2 => Mul,
        3 => Div,
        4 => Mod,
        5 => BitAnd,
        6 => BitOr,
        7 => BitXor,
        8 => Shl,
        9 => Shr,
        10 => Eq,
        11 => Ne,
        12 => Gt,
        13 => Ge,
        14 => Lt,
        15 => Le,
        _ => return None,
    })
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    composites: Vec<Rc<Composite>>,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0, composites: Vec::new() }
    }

    fn err(&self, message: String) -> DecodeError {
        DecodeError { message, offset: self.pos }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| self.err("offset overflow".to_string()))?;
        if end > self.bytes.len() {
            return Err(self.err("unexpected EOF".to_string()));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn expect_bytes(&mut self, expected: &[u8], msg: &str) -> Result<(), DecodeError> {
        let got = self.read_exact(expected.len())?;
        if got != expected {
            return Err(self.err(msg.to_string()));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_exact(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_exact(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.read_exact(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64()? as i64)
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.err(format!("invalid bool tag {other}"))),
        }
    }

    fn read_len(&mut self) -> Result<usize, DecodeError> {
        Ok(self.read_u32()? as usize)
    }

    fn read_index(&mut self) -> Result<usize, DecodeError> {
        self.read_len()
    }

    fn read_opt_index(&mut self) -> Result<Option<usize>, DecodeError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_index()?)),
            other => Err(self.err(format!("invalid option tag {other}"))),
        }
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_len()?;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.err("invalid utf-8 string".to_string()))
    }

    fn read_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len()?;
        Ok(self.read_exact(len)?.to_vec())
    }

    fn read_path(&mut self) -> Result<Path, DecodeError> {
        Ok(Path(self.read_string()?))
    }

    fn read_module(&mut self) -> Result<ModuleTree, DecodeError> {
        let mut tree = ModuleTree::default();

        // Composite shells first: bodies and function signatures may
        // reference any of them, in any order.
        let n_composites = self.read_len()?;
        for _ in 0..n_composites {
            let path = self.read_path()?;
            let shell = Composite::shell(path);
            self.composites.push(shell.clone());
            tree.register_composite(shell);
        }
        for i in 0..n_composites {
            let body = self.read_composite_body()?;
            let shell = self.composites[i].clone();
            shell.define(body).map_err(|e| self.err(e.to_string()))?;
        }

        let n_functions = self.read_len()?;
        for _ in 0..n_functions {
            let function = self.read_function()?;
            tree.register_function(function);
        }

        // Statics in two passes: create every allocation, then resolve
        // relocations (statics may reference each other cyclically).
        let n_statics = self.read_len()?;
        let mut pending: Vec<(Path, Vec<(usize, u8, Path)>, AllocCell)> = Vec::new();
        for _ in 0..n_statics {
            let path = self.read_path()?;
            let ty = self.read_type()?;
            let data = self.read_blob()?;
            let cell = Allocation::from_bytes(&data);
            let n_relocs = self.read_len()?;
            let mut relocs = Vec::with_capacity(n_relocs);
            for _ in 0..n_relocs {
                let offset = self.read_u64()? as usize;
                let kind = self.read_u8()?;
                if kind > 1 {
                    return Err(self.err(format!("invalid relocation target kind {kind}")));
                }
                relocs.push((offset, kind, self.read_path()?));
            }
            pending.push((path.clone(), relocs, cell.clone()));
            tree.register_static(path, ty, cell);
        }
        for (path, relocs, cell) in pending {
            for (offset, kind, target) in relocs {
                let handle = match kind {
                    0 => {
                        let def = tree
                            .get_static(&target)
                            .map_err(|_| self.err(format!("static `{path}` references unknown static `{target}`")))?;
                        AllocHandle::Memory(def.cell.clone())
                    }
                    _ => AllocHandle::Function(target),
                };
                cell.borrow_mut().set_relocation(offset, handle);
            }
        }

        let n_lang_items = self.read_len()?;
        for _ in 0..n_lang_items {
            let name = self.read_string()?;
            let path = self.read_path()?;
            tree.set_lang_item(&name, path);
        }

        Ok(tree)
    }

    fn read_composite_body(&mut self) -> Result<CompositeBody, DecodeError> {
        let size = self.read_u64()? as usize;
        let n_fields = self.read_len()?;
        let mut fields = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            let offset = self.read_u64()? as usize;
            let ty = self.read_type()?;
            fields.push((offset, ty));
        }
        let n_variants = self.read_len()?;
        let mut variants = Vec::with_capacity(n_variants);
        for _ in 0..n_variants {
            let data_field = self.read_opt_index()?;
            let base_field = self.read_opt_index()?;
            let n_steps = self.read_len()?;
            let mut field_path = Vec::with_capacity(n_steps);
            for _ in 0..n_steps {
                field_path.push(self.read_index()?);
            }
            let tag_data = self.read_blob()?;
            variants.push(Variant { data_field, base_field, field_path, tag_data });
        }
        let drop_glue = match self.read_u8()? {
            0 => None,
            1 => Some(self.read_path()?),
            other => return Err(self.err(format!("invalid option tag {other}"))),
        };
        Ok(CompositeBody { size, fields, variants, drop_glue })
    }

    fn read_function(&mut self) -> Result<FunctionDef, DecodeError> {
        let path = self.read_path()?;
        let external = match self.read_u8()? {
            0 => None,
            1 => Some(ExternLink { name: self.read_string()?, abi: self.read_string()? }),
            other => return Err(self.err(format!("invalid option tag {other}"))),
        };
        let n_args = self.read_len()?;
        let mut args = Vec::with_capacity(n_args);
        for _ in 0..n_args {
            args.push(self.read_type()?);
        }
        let ret_ty = self.read_type()?;
        let n_locals = self.read_len()?;
        let mut locals = Vec::with_capacity(n_locals);
        for _ in 0..n_locals {
            locals.push(self.read_type()?);
        }
        let n_flags = self.read_len()?;
        let mut drop_flags = Vec::with_capacity(n_flags);
        for _ in 0..n_flags {
            drop_flags.push(self.read_bool()?);
        }
        let n_blocks = self.read_len()?;
        let mut blocks = Vec::with_capacity(n_blocks);
        for _ in 0..n_blocks {
            let n_statements = self.read_len()?;
            let mut statements = Vec::with_capacity(n_statements);
            for _ in 0..n_statements {
                statements.push(self.read_statement()?);
            }
            let terminator = self.read_terminator()?;
            blocks.push(BasicBlock { statements, terminator });
        }
        Ok(FunctionDef { path, args, ret_ty, external, body: Body { blocks, locals, drop_flags } })
    }

    fn read_type(&mut self) -> Result<TypeRef, DecodeError> {
        let n_wrappers = self.read_len()?;
        let mut wrappers = Vec::with_capacity(n_wrappers);
        for _ in 0..n_wrappers {
            wrappers.push(match self.read_u8()? {
                0 => TypeWrapper::Borrow(match self.read_u8()? {
                    0 => BorrowKind::Shared,
                    1 => BorrowKind::Unique,
                    2 => BorrowKind::Move,
                    other => return Err(self.err(format!("invalid borrow kind {other}"))),
                }),
                1 => TypeWrapper::Pointer(match self.read_u8()? {
                    0 => Mutability::Const,
                    1 => Mutability::Mut,
                    other => return Err(self.err(format!("invalid mutability {other}"))),
                }),
                2 => TypeWrapper::Array(self.read_u64()? as usize),
                3 => TypeWrapper::Slice,
                other => return Err(self.err(format!("invalid type wrapper tag {other}"))),
            });
        }
        let raw = self.read_raw_type()?;
        Ok(TypeRef { wrappers, raw })
    }

    fn read_raw_type(&mut self) -> Result<RawType, DecodeError> {
        use RawType::*;
        Ok(match self.read_u8()? {
            0 => Unreachable,
            1 => Unit,
            2 => Bool,
            3 => Char,
            4 => U8,
            5 => U16,
            6 => U32,
            7 => U64,
            8 => U128,
            9 => I8,
            10 => I16,
            11 => I32,
            12 => I64,
            13 => I128,
            14 => USize,
            15 => ISize,
            16 => F32,
            17 => F64,
            18 => Str,
            tag @ (19 | 20) => {
                let id = self.read_u32()? as usize;
                let composite = self
                    .composites
                    .get(id)
                    .cloned()
                    .ok_or_else(|| self.err(format!("composite index {id} out of range")))?;
                if tag == 19 {
                    Composite(composite)
                } else {
                    TraitObject(composite)
                }
            }
            21 => Function,
            other => return Err(self.err(format!("invalid raw type tag {other}"))),
        })
    }

    fn read_lvalue(&mut self) -> Result<LValue, DecodeError> {
        Ok(match self.read_u8()? {
            0 => LValue::Return,
            1 => LValue::Local(self.read_index()?),
            2 => LValue::Argument(self.read_index()?),
            3 => LValue::Static(self.read_path()?),
            4 => {
                let base = Box::new(self.read_lvalue()?);
                LValue::Field { base, index: self.read_index()? }
            }
            5 => {
                let base = Box::new(self.read_lvalue()?);
                LValue::Downcast { base, variant: self.read_index()? }
            }
            6 => {
                let base = Box::new(self.read_lvalue()?);
                let index = Box::new(self.read_lvalue()?);
                LValue::Index { base, index }
            }
            7 => LValue::Deref { base: Box::new(self.read_lvalue()?) },
            other => return Err(self.err(format!("invalid lvalue tag {other}"))),
        })
    }

    fn read_constant(&mut self) -> Result<Constant, DecodeError> {
        Ok(match self.read_u8()? {
            0 => {
                let value = self.read_i64()?;
                Constant::Int { value, ty: self.read_raw_type()? }
            }
            1 => {
                let value = self.read_u64()?;
                Constant::Uint { value, ty: self.read_raw_type()? }
            }
            2 => {
                let value = self.read_f64()?;
                Constant::Float { value, ty: self.read_raw_type()? }
            }
            3 => Constant::Bool(self.read_bool()?),
            4 => Constant::StaticString(self.read_string()?),
            5 => Constant::ItemAddr(self.read_path()?),
            other => return Err(self.err(format!("invalid constant tag {other}"))),
        })
    }

    fn read_param(&mut self) -> Result<Param, DecodeError> {
        Ok(match self.read_u8()? {
            0 => Param::LValue(self.read_lvalue()?),
            1 => Param::Constant(self.read_constant()?),
            other => return Err(self.err(format!("invalid param tag {other}"))),
        })
    }

    fn read_params(&mut self) -> Result<Vec<Param>, DecodeError> {
        let n = self.read_len()?;
        let mut params = Vec::with_capacity(n);
        for _ in 0..n {
            params.push(self.read_param()?);
        }
        Ok(params)
    }

    fn read_rvalue(&mut self) -> Result<RValue, DecodeError> {
        Ok(match self.read_u8()? {
            0 => RValue::Use(self.read_lvalue()?),
            1 => RValue::Constant(self.read_constant()?),
            2 => {
                let kind = match self.read_u8()? {
                    0 => BorrowKind::Shared,
                    1 => BorrowKind::Unique,
                    2 => BorrowKind::Move,
                    other => return Err(self.err(format!("invalid borrow kind {other}"))),
                };
                RValue::Borrow { kind, val: self.read_lvalue()? }
            }
            3 => {
                let val = self.read_lvalue()?;
                RValue::Cast { val, ty: self.read_type()? }
            }
            4 => {
                let tag = self.read_u8()?;
                let op = binop_from_tag(tag)
                    .ok_or_else(|| self.err(format!("invalid binop tag {tag}")))?;
                let lhs = self.read_param()?;
                let rhs = self.read_param()?;
                RValue::BinOp { op, lhs, rhs }
            }
            5 => {
                let op = match self.read_u8()? {
                    0 => UniOp::Inv,
                    1 => UniOp::Neg,
                    other => return Err(self.err(format!("invalid uniop tag {other}"))),
                };
                RValue::UniOp { op, val: self.read_lvalue()? }
            }
            6 => RValue::DstMeta { val: self.read_lvalue()? },
            7 => RValue::DstPtr { val: self.read_lvalue()? },
            8 => {
                let ptr = self.read_param()?;
                let meta = self.read_param()?;
                RValue::MakeDst { ptr, meta }
            }
            9 => RValue::Tuple { vals: self.read_params()? },
            10 => RValue::Array { vals: self.read_params()? },
            11 => {
                let val = self.read_param()?;
                RValue::SizedArray { val, count: self.read_u64()? as usize }
            }
            12 => {
                let path = self.read_path()?;
                let index = self.read_index()?;
                let val = match self.read_u8()? {
                    0 => None,
                    1 => Some(self.read_param()?),
                    other => return Err(self.err(format!("invalid option tag {other}"))),
                };
                RValue::Variant { path, index, val }
            }
            13 => {
                let path = self.read_path()?;
                RValue::Struct { path, vals: self.read_params()? }
            }
            other => return Err(self.err(format!("invalid rvalue tag {other}"))),
        })
    }

    fn read_statement(&mut self) -> Result<Statement, DecodeError> {
        Ok(match self.read_u8()? {
            0 => {
                let dst = self.read_lvalue()?;
                Statement::Assign { dst, src: self.read_rvalue()? }
            }
            1 => {
                let slot = self.read_lvalue()?;
                let flag = self.read_opt_index()?;
                let kind = match self.read_u8()? {
                    0 => DropKind::Deep,
                    1 => DropKind::Shallow,
                    other => return Err(self.err(format!("invalid drop kind {other}"))),
                };
                Statement::Drop { slot, flag, kind }
            }
            2 => {
                let idx = self.read_index()?;
                let new_val = self.read_bool()?;
                Statement::SetDropFlag { idx, new_val, other: self.read_opt_index()? }
            }
            3 => Statement::Asm,
            4 => Statement::ScopeEnd,
            other => return Err(self.err(format!("invalid statement tag {other}"))),
        })
    }

    fn read_terminator(&mut self) -> Result<Terminator, DecodeError> {
        Ok(match self.read_u8()? {
            0 => Terminator::Incomplete,
            1 => Terminator::Goto(self.read_index()?),
            2 => Terminator::Return,
            3 => Terminator::Diverge,
            4 => Terminator::Panic,
            5 => {
                let cond = self.read_lvalue()?;
                let bb_true = self.read_index()?;
                Terminator::If { cond, bb_true, bb_false: self.read_index()? }
            }
            6 => {
                let val = self.read_lvalue()?;
                let n = self.read_len()?;
                let mut targets = Vec::with_capacity(n);
                for _ in 0..n {
                    targets.push(self.read_index()?);
                }
                Terminator::Switch { val, targets }
            }
            7 => Terminator::SwitchValue,
            8 => {
                let dst = self.read_lvalue()?;
                let target = match self.read_u8()? {
                    0 => CallTarget::Path(self.read_path()?),
                    1 => {
                        let name = self.read_string()?;
                        let n = self.read_len()?;
                        let mut params = Vec::with_capacity(n);
                        for _ in 0..n {
                            params.push(self.read_type()?);
                        }
                        CallTarget::Intrinsic { name, params }
                    }
                    2 => CallTarget::Value(self.read_lvalue()?),
                    other => return Err(self.err(format!("invalid call target tag {other}"))),
                };
                let args = self.read_params()?;
                Terminator::Call { dst, target, args, ret_block: self.read_index()? }
            }
            other => return Err(self.err(format!("invalid terminator tag {other}"))),
        })
    }
}
