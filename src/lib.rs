//! Silica: a small numeric language compiled straight to x86-64 machine code and run in-process.

/// Lex and parse source text into a typed [types::Ast], collecting diagnostics.
pub mod parser;
/// The fixed primitive types and tuple layout.
pub mod catalog;
/// The abstract syntax tree: expressions, blocks, functions and externs.
pub mod types;
/// Lowers an [types::Ast] to sections of machine code and the links between them.
pub mod compiler;
/// Places generated sections in protected host memory and runs them.
pub mod executor;
/// Host functions compiled programs can `use`, and the context they write through.
pub mod runtime;
/// User-facing command line interface to the compiler.
pub mod cmdline;

use parser::Diagnostic;
use runtime::Runtime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Compilation failed with {} diagnostics", .0.len())]
    Diagnostics(Vec<Diagnostic>),
    #[error(transparent)]
    Codegen(#[from] compiler::CodegenErr),
    #[error(transparent)]
    Load(#[from] executor::LoadErr),
    #[error("No function named {0} to run")]
    NoEntry(String),
    #[error("The entry function {0} must not take arguments")]
    EntryArguments(String),
}

/// The entry point must be a function of the program taking no arguments.
pub fn check_entry(ast: &types::Ast, entry: &str) -> Result<(), RunError> {
    match ast.functions.get(entry) {
        None => Err(RunError::NoEntry(entry.to_string())),
        Some(f) if !f.signature.args.is_empty() => Err(RunError::EntryArguments(entry.to_string())),
        Some(_) => Ok(()),
    }
}

/// Compile `source` and call its `entry` function, with intrinsics bound to `runtime`.
pub fn run(source: &str, entry: &str, runtime: &mut Runtime) -> Result<f64, RunError> {
    let ast = parser::parse(source).map_err(RunError::Diagnostics)?;
    check_entry(&ast, entry)?;

    let mut program = compiler::generate(&ast, runtime)?;
    let entry = program
        .entry(entry)
        .ok_or_else(|| RunError::NoEntry(entry.to_string()))?;
    let image = executor::load(&mut program.sections, &program.links)?;
    // Safety: the image holds code generated against `runtime`, which outlives this call
    let value = unsafe { image.execute(entry)? };
    Ok(value)
}
