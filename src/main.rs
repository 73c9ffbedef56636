//! Crabwalk interpreter.
//!
//! A standalone interpreter that loads a serialized MIR module tree,
//! locates the `"start"` lang item and executes it, printing the returned
//! value to standard output.

use anyhow::Result;
use clap::Parser;
use crabwalk::module::ModuleTree;
use crabwalk::value::TypedValue;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "crabwalk")]
#[command(about = "An interpreter that walks serialized MIR modules")]
#[command(
    long_about = "Crabwalk is a standalone MIR interpreter: it loads a serialized module tree \
(functions, composite layouts, statics), finds the designated entry function and executes it \
block by block, modeling memory as byte buffers with pointer relocations."
)]
struct Args {
    /// Alternative start function (default: the "start" lang item)
    #[arg(long, help = "Execute a specific zero-argument function instead of the entry point")]
    start_fn: Option<String>,

    /// Input module to interpret
    #[arg(help = "Path to the serialized module tree")]
    input: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = std::env::var("CRABWALK_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let tree = ModuleTree::load_file(&args.input)?;

    if let Some(name) = &args.start_fn {
        crabwalk::run_function(&tree, name)?;
        return Ok(());
    }

    let start = tree.find_lang_item("start")?;
    let ret_ty = tree.get_function(start)?.ret_ty.clone();
    let ret = crabwalk::run_entry(&tree)?;
    let (bytes, _) = ret.snapshot();
    println!("{}", TypedValue { ty: &ret_ty, bytes: &bytes });
    Ok(())
}
