//! Shared error utilities used across the compilation pipeline.
//!
//! Diagnostics are kept lightweight on purpose – these routines format
//! messages in a style reminiscent of chibicc, pointing at the offending
//! byte with a caret.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  #[snafu(display("{source_line}\n{marker} {message}"))]
  WithLocation {
    source_line: String,
    marker: String,
    message: String,
  },
}

impl CompileError {
  /// Construct an error anchored at a specific byte offset in the source.
  ///
  /// The diagnostic shows only the line containing the offset so the
  /// caret lands in the right column even for multi-line programs.
  pub fn at(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let safe_loc = loc.min(source.len());
    let line_start = source[..safe_loc].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = source[safe_loc..]
      .find('\n')
      .map(|i| safe_loc + i)
      .unwrap_or(source.len());
    let source_line = source[line_start..line_end].to_string();
    let column = source[line_start..safe_loc].chars().count();
    let marker = format!("{}^", " ".repeat(column));
    Self::WithLocation {
      source_line,
      marker,
      message: message.into(),
    }
  }
}
