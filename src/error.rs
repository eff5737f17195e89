//! Shared error utilities used across the compile and load pipeline.
//!
//! Diagnostics stay lightweight: source-level problems point at the offending
//! byte with a caret, scope problems name the frames involved, and runtime
//! failures carry the `function:line` of the statement that raised them.

use std::fmt;

use snafu::Snafu;

use crate::codegen::ScopeFrame;
use crate::tokenizer::InstructionKind;

pub type TemplateResult<T> = Result<T, TemplateError>;

/// Where a runtime failure happened inside the generated source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
  pub function: String,
  pub line: usize,
}

impl fmt::Display for Location {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.function, self.line)
  }
}

#[derive(Debug, Snafu)]
pub enum TemplateError {
  /// The template text itself could not be read into a tree.
  #[snafu(display("{source_line}\n{marker} {message}"))]
  Syntax {
    source_line: String,
    marker: String,
    message: String,
  },

  /// An end instruction could not be matched against the scope stack.
  #[snafu(display(
    "can't end {} scope: {}",
    closing.map_or("unnamed", InstructionKind::scope_name),
    describe_open(open.as_ref())
  ))]
  ScopeMismatch {
    closing: Option<InstructionKind>,
    open: Option<ScopeFrame>,
  },

  #[snafu(display("unclosed scopes remaining: {scopes}"))]
  UnclosedScopes { scopes: String },

  /// The generated source is not valid for the execution engine.
  #[snafu(display("{module}:{line}:{column}: {message}\n{source_line}\n{marker}"))]
  CompileFailure {
    module: String,
    line: usize,
    column: usize,
    source_line: String,
    marker: String,
    message: String,
  },

  #[snafu(display("{}{message}", origin.as_ref().map(|loc| format!("{loc}: ")).unwrap_or_default()))]
  RuntimeFailure {
    origin: Option<Location>,
    message: String,
  },
}

fn describe_open(open: Option<&ScopeFrame>) -> String {
  match open {
    Some(frame) => format!(
      "active scope is: {} {}",
      frame.kind.scope_name(),
      frame.header
    ),
    None => "no active scope".to_string(),
  }
}

impl TemplateError {
  /// Construct a template-source error anchored at a byte offset.
  pub fn at(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (line_start, line_end, _) = line_bounds(source, loc);
    let safe_loc = loc.min(source.len()).max(line_start);
    let source_line = format!("'{}'", &source[line_start..line_end]);
    let char_offset = source[line_start..safe_loc].chars().count() + 1; // account for opening quote
    let marker = format!("{}^", " ".repeat(char_offset));
    Self::Syntax {
      source_line,
      marker,
      message: message.into(),
    }
  }

  /// Construct a compile failure for generated source, anchored at a byte offset.
  pub fn compile_at(
    module: &str,
    source: &str,
    loc: usize,
    message: impl Into<String>,
  ) -> Self {
    let (line_start, line_end, line) = line_bounds(source, loc);
    let safe_loc = loc.min(source.len()).max(line_start);
    let column = source[line_start..safe_loc].chars().count() + 1;
    Self::CompileFailure {
      module: module.to_string(),
      line,
      column,
      source_line: source[line_start..line_end].to_string(),
      marker: format!("{}^", " ".repeat(column - 1)),
      message: message.into(),
    }
  }

  /// A runtime failure not yet attributed to a statement.
  pub fn runtime(message: impl Into<String>) -> Self {
    Self::RuntimeFailure {
      origin: None,
      message: message.into(),
    }
  }

  /// Attach a location to a runtime failure that does not have one yet.
  ///
  /// Failures raised inside nested calls already carry the callee's location
  /// and are passed through untouched.
  pub(crate) fn located(self, function: &str, line: usize) -> Self {
    match self {
      Self::RuntimeFailure {
        origin: None,
        message,
      } => Self::RuntimeFailure {
        origin: Some(Location {
          function: function.to_string(),
          line,
        }),
        message,
      },
      other => other,
    }
  }
}

/// Start, end and 1-based number of the line containing `loc`.
fn line_bounds(source: &str, loc: usize) -> (usize, usize, usize) {
  let loc = loc.min(source.len());
  let mut line_start = 0;
  let mut line = 1;
  for (i, c) in source.char_indices() {
    if i >= loc {
      break;
    }
    if c == '\n' {
      line_start = i + 1;
      line += 1;
    }
  }
  let line_end = source[line_start..]
    .find('\n')
    .map(|i| line_start + i)
    .unwrap_or(source.len());
  (line_start, line_end, line)
}
