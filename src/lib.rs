//! Crabwalk interpreter library.
//!
//! Loads a serialized MIR module tree and executes it by walking basic
//! blocks: values are byte buffers with pointer relocations, so pointer
//! identity and provenance survive reads, writes and casts.
//!
//! # Warning
//!
//! This library is not meant to be used outside of the crabwalk binary.
//! Semantic versioning only applies to the binary.

mod interpreter;
pub mod memory;
pub mod mir;
pub mod module;
pub mod ty;
pub mod value;

pub use interpreter::function::invoke_fn;

use crate::mir::Path;
use crate::module::ModuleTree;
use crate::ty::{Mutability, RawType, TypeRef, TypeWrapper};
use crate::value::{TypedValue, Value};
use anyhow::{bail, Result};
use tracing::info;

/// Execute a specific zero-argument function by path.
///
/// # Arguments
/// * `tree` - The loaded module
/// * `name` - Path of the function to execute
///
/// # Returns
/// * `Ok(Value)` - Function executed successfully, returns the result value
/// * `Err(anyhow::Error)` - Function not found, has arguments, or execution failed
pub fn run_function(tree: &ModuleTree, name: &str) -> Result<Value> {
    let path = Path::from(name);
    let fcn = tree.get_function(&path)?.clone();
    info!("found function: {path}");

    if !fcn.args.is_empty() {
        bail!(
            "function `{path}` takes {} arguments, only zero-argument functions are supported",
            fcn.args.len()
        );
    }

    let result = invoke_fn(tree, &path, vec![])?;
    let (bytes, _) = result.snapshot();
    info!("function `{path}` returned: {}", TypedValue { ty: &fcn.ret_ty, bytes: &bytes });
    Ok(result)
}

/// Run the module's entry point: look up the `"start"` lang item and call
/// it as `start(argc: i32 = 0, argv: **i8 = null)`.
pub fn run_entry(tree: &ModuleTree) -> Result<Value> {
    let start = tree.find_lang_item("start")?.clone();
    info!("found entry function: {start}");

    let argc = Value::for_type(&RawType::I32.into())?;
    let argv_ty = TypeRef::from(RawType::I8)
        .wrapped(TypeWrapper::Pointer(Mutability::Const))
        .wrapped(TypeWrapper::Pointer(Mutability::Const));
    let argv = Value::for_type(&argv_ty)?;

    invoke_fn(tree, &start, vec![argc, argv])
}
