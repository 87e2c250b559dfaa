//! Crate root: wires together the compilation pipeline.
//!
//! The stages are intentionally small and composable so they can be evolved
//! independently:
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `parser` owns all syntactic knowledge and returns a typed program:
//!   functions with their locals, plus globals and promoted string literals.
//! - `ty` is the closed type universe shared by the parser and the emitter.
//! - `codegen` lowers the parsed program into x86-64 AT&T assembly.
//! - `error` centralises reporting utilities shared by the other modules.

pub mod error;
pub mod parser;
pub mod tokenizer;
pub mod ty;

mod codegen;

pub use error::{CompileError, CompileResult};

/// Compile a source string into AT&T assembly.
pub fn generate_assembly(source: &str) -> CompileResult<String> {
  let tokens = tokenizer::tokenize(source)?;
  let program = parser::parse(&tokens, source)?;
  codegen::generate(&program, &tokens, source)
}
