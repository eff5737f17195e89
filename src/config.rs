//! Knobs for the compile pass.
//!
//! The defaults reproduce the permissive behaviour templates have always
//! relied on; the alternatives exist for callers that want stricter checks.

/// Which open frames decide whether output directives produce code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputScope {
  /// Output is kept if any frame on the stack is a `def`.
  #[default]
  AnyEnclosingDef,
  /// Output is kept only if the innermost `def`/`class` frame is a `def`,
  /// so a class body nested in a function swallows its own output.
  NearestDefinition,
}

/// How frames still open at end of stream are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeCheck {
  #[default]
  Lenient,
  /// Fail with `UnclosedScopes`.
  Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
  /// Text repeated once per nesting level.
  pub indent: String,
  pub output_scope: OutputScope,
  pub scope_check: ScopeCheck,
}

impl Default for CompileOptions {
  fn default() -> Self {
    Self {
      indent: "\t".to_string(),
      output_scope: OutputScope::default(),
      scope_check: ScopeCheck::default(),
    }
  }
}

impl CompileOptions {
  pub fn with_indent(mut self, indent: impl Into<String>) -> Self {
    self.indent = indent.into();
    self
  }

  pub fn with_output_scope(mut self, output_scope: OutputScope) -> Self {
    self.output_scope = output_scope;
    self
  }

  pub fn with_scope_check(mut self, scope_check: ScopeCheck) -> Self {
    self.scope_check = scope_check;
    self
  }

  /// Shorthand for `with_scope_check(ScopeCheck::Strict)`.
  pub fn strict(self) -> Self {
    self.with_scope_check(ScopeCheck::Strict)
  }
}
