//! The loaded module tree: functions, statics, composite descriptors and
//! lang items, plus the interned string-literal allocations.

pub mod format;
mod verify;

use crate::memory::{AllocCell, Allocation};
use crate::mir::{Body, Path};
use crate::ty::{Composite, TypeRef};
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::info;

/// Link descriptor of an external function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternLink {
    pub name: String,
    pub abi: String,
}

/// A function as loaded: signature, body, and an optional extern link that
/// routes calls to the extern handler instead of the MIR.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub path: Path,
    pub args: Vec<TypeRef>,
    pub ret_ty: TypeRef,
    pub external: Option<ExternLink>,
    pub body: Body,
}

/// A process-wide static: its type and backing allocation.
#[derive(Debug, Clone)]
pub struct StaticDef {
    pub ty: TypeRef,
    pub cell: AllocCell,
}

/// Everything the executor needs to resolve names at runtime.
#[derive(Default, Debug)]
pub struct ModuleTree {
    functions: HashMap<Path, Rc<FunctionDef>>,
    statics: HashMap<Path, StaticDef>,
    composites: HashMap<Path, Rc<Composite>>,
    lang_items: HashMap<String, Path>,
    /// One shared allocation per distinct string literal.
    string_literals: RefCell<HashMap<String, AllocCell>>,
}

impl ModuleTree {
    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read module `{}`", path.display()))?;
        let tree = Self::from_bytes(&bytes)?;
        info!(
            functions = tree.functions.len(),
            statics = tree.statics.len(),
            composites = tree.composites.len(),
            "loaded module `{}`",
            path.display()
        );
        Ok(tree)
    }

    /// Decode a serialized module and run the load-time checks.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tree = format::from_bytes(bytes)?;
        verify::verify(&tree)?;
        Ok(tree)
    }

    /// Run the load-time checks on a programmatically built tree.
    pub fn verify(&self) -> Result<()> {
        verify::verify(self)
    }

    pub fn register_function(&mut self, def: FunctionDef) {
        self.functions.insert(def.path.clone(), Rc::new(def));
    }

    pub fn register_static(&mut self, path: Path, ty: TypeRef, cell: AllocCell) {
        self.statics.insert(path, StaticDef { ty, cell });
    }

    pub fn register_composite(&mut self, composite: Rc<Composite>) {
        self.composites.insert(composite.path.clone(), composite);
    }

    pub fn set_lang_item(&mut self, name: &str, path: Path) {
        self.lang_items.insert(name.to_owned(), path);
    }

    pub fn get_function(&self, path: &Path) -> Result<&Rc<FunctionDef>> {
        self.functions
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("function `{path}` not found in module"))
    }

    pub fn get_function_opt(&self, path: &Path) -> Option<&Rc<FunctionDef>> {
        self.functions.get(path)
    }

    pub fn get_static(&self, path: &Path) -> Result<&StaticDef> {
        self.statics
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("static `{path}` not found in module"))
    }

    pub fn get_composite(&self, path: &Path) -> Result<&Rc<Composite>> {
        self.composites
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("composite `{path}` not found in module"))
    }

    pub fn find_lang_item(&self, name: &str) -> Result<&Path> {
        self.lang_items
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("lang item `{name}` not defined by module"))
    }

    /// The shared allocation backing a string literal.
    pub fn string_allocation(&self, literal: &str) -> AllocCell {
        self.string_literals
            .borrow_mut()
            .entry(literal.to_owned())
            .or_insert_with(|| Allocation::from_bytes(literal.as_bytes()))
            .clone()
    }

    pub(crate) fn functions(&self) -> impl Iterator<Item = &Rc<FunctionDef>> {
        self.functions.values()
    }

    pub(crate) fn composites(&self) -> impl Iterator<Item = &Rc<Composite>> {
        self.composites.values()
    }

    pub(crate) fn statics(&self) -> impl Iterator<Item = (&Path, &StaticDef)> {
        self.statics.iter()
    }
}
