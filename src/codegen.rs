//! Code generation: fold the token stream into indented source lines.
//!
//! Directives are siblings in the tree, so block nesting only exists in the
//! pairing of openers and ends. The emitter tracks that pairing on an explicit
//! scope stack whose length is the indentation depth of every emitted line.

use std::fmt;

use tracing::{debug, instrument, trace};

use crate::config::{CompileOptions, OutputScope, ScopeCheck};
use crate::error::{TemplateError, TemplateResult};
use crate::tokenizer::{InstructionKind, Token};

pub const ESCAPE_TEXT_NAME: &str = "__detox_escape_text__";
pub const ESCAPE_ATTR_NAME: &str = "__detox_escape_attr__";

/// One open block construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFrame {
  pub kind: InstructionKind,
  pub header: String,
}

/// An emitted line before indentation is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
  pub depth: usize,
  pub text: String,
}

/// Finished output of a compile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSource {
  lines: Vec<Line>,
  text: String,
}

impl GeneratedSource {
  pub fn as_str(&self) -> &str {
    &self.text
  }

  /// Emitted lines, preamble excluded.
  pub fn lines(&self) -> &[Line] {
    &self.lines
  }
}

impl fmt::Display for GeneratedSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.text)
  }
}

fn preamble() -> [String; 3] {
  [
    format!("# generated by detox {}", env!("CARGO_PKG_VERSION")),
    format!("from detox.escape import escape_text as {ESCAPE_TEXT_NAME}"),
    format!("from detox.escape import escape_attr as {ESCAPE_ATTR_NAME}"),
  ]
}

/// Scope stack machine plus emission buffer.
#[derive(Debug)]
pub struct Emitter {
  options: CompileOptions,
  stack: Vec<ScopeFrame>,
  lines: Vec<Line>,
}

impl Emitter {
  pub fn new(options: CompileOptions) -> Self {
    Self {
      options,
      stack: Vec::new(),
      lines: Vec::new(),
    }
  }

  pub fn stack(&self) -> &[ScopeFrame] {
    &self.stack
  }

  pub fn depth(&self) -> usize {
    self.stack.len()
  }

  /// Process one token. On error the stack and buffer are left as they were.
  pub fn process(&mut self, token: Token) -> TemplateResult<()> {
    use InstructionKind::*;

    let depth = self.depth();
    trace!(kind = ?token.kind, depth, "token");
    match token.kind {
      RawText | PrintExpr | PrintEscapedText | PrintEscapedAttr => {
        if !self.output_enabled() {
          trace!(kind = ?token.kind, "output outside of a function dropped");
          return Ok(());
        }
        let value = match token.kind {
          RawText => quote(&token.payload),
          PrintExpr => token.payload,
          PrintEscapedText => format!("{ESCAPE_TEXT_NAME}({})", token.payload),
          _ => format!("{ESCAPE_ATTR_NAME}({})", token.payload),
        };
        self.push_line(depth, format!("yield {value}"));
      }
      Code => {
        for line in token.payload.lines() {
          self.push_line(depth, line.to_string());
        }
      }
      If | Def | Class | For | While => {
        let keyword = token.kind.scope_name();
        self.push_line(depth, format!("{keyword} {}:", token.payload));
        debug!(kind = ?token.kind, header = %token.payload, depth = depth + 1, "open scope");
        self.stack.push(ScopeFrame {
          kind: token.kind,
          header: token.payload,
        });
      }
      Else => self.push_line(depth.saturating_sub(1), "else:".to_string()),
      Elif => self.push_line(depth.saturating_sub(1), format!("elif {}:", token.payload)),
      EndIf | EndDef | EndClass | EndFor | EndWhile | EndAny => {
        let closing = token.kind.closes();
        let frame = self.end_scope(closing)?;
        debug!(kind = ?frame.kind, header = %frame.header, depth = self.depth(), "close scope");
      }
    }
    Ok(())
  }

  fn end_scope(&mut self, closing: Option<InstructionKind>) -> TemplateResult<ScopeFrame> {
    match self.stack.pop() {
      None => Err(TemplateError::ScopeMismatch {
        closing,
        open: None,
      }),
      Some(top) if closing.is_some_and(|kind| kind != top.kind) => {
        let open = top.clone();
        self.stack.push(top);
        Err(TemplateError::ScopeMismatch {
          closing,
          open: Some(open),
        })
      }
      Some(top) => Ok(top),
    }
  }

  fn output_enabled(&self) -> bool {
    match self.options.output_scope {
      OutputScope::AnyEnclosingDef => self
        .stack
        .iter()
        .any(|frame| frame.kind == InstructionKind::Def),
      OutputScope::NearestDefinition => self
        .stack
        .iter()
        .rev()
        .find(|frame| matches!(frame.kind, InstructionKind::Def | InstructionKind::Class))
        .is_some_and(|frame| frame.kind == InstructionKind::Def),
    }
  }

  fn push_line(&mut self, depth: usize, text: String) {
    self.lines.push(Line { depth, text });
  }

  /// Join the buffer behind the preamble.
  pub fn finish(self) -> TemplateResult<GeneratedSource> {
    if self.options.scope_check == ScopeCheck::Strict && !self.stack.is_empty() {
      let scopes = self
        .stack
        .iter()
        .map(|frame| frame.kind.scope_name())
        .collect::<Vec<_>>()
        .join(", ");
      return Err(TemplateError::UnclosedScopes { scopes });
    }
    if !self.stack.is_empty() {
      debug!(open = self.stack.len(), "scopes left open at end of stream");
    }

    let mut text = preamble().join("\n");
    for line in &self.lines {
      text.push('\n');
      text.push_str(&self.options.indent.repeat(line.depth));
      text.push_str(&line.text);
    }
    text.push('\n');
    Ok(GeneratedSource {
      lines: self.lines,
      text,
    })
  }
}

/// Run a whole token stream through a fresh emitter.
#[instrument(skip_all)]
pub fn generate(
  tokens: impl IntoIterator<Item = Token>,
  options: &CompileOptions,
) -> TemplateResult<GeneratedSource> {
  let mut emitter = Emitter::new(options.clone());
  for token in tokens {
    emitter.process(token)?;
  }
  let source = emitter.finish()?;
  debug!(lines = source.lines().len(), "source generated");
  Ok(source)
}

/// Render `text` as a double-quoted string literal.
fn quote(text: &str) -> String {
  let mut out = String::with_capacity(text.len() + 2);
  out.push('"');
  for c in text.chars() {
    match c {
      '\\' => out.push_str("\\\\"),
      '"' => out.push_str("\\\""),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\t' => out.push_str("\\t"),
      c if (c as u32) < 0x20 || c == '\u{7f}' => out.push_str(&format!("\\x{:02x}", c as u32)),
      c => out.push(c),
    }
  }
  out.push('"');
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use InstructionKind::*;
  use proptest::prelude::*;

  fn tok(kind: InstructionKind, payload: &str) -> Token {
    Token::new(kind, payload)
  }

  fn body(tokens: Vec<Token>) -> Vec<String> {
    let source = generate(tokens, &CompileOptions::default()).expect("tokens should compile");
    source.as_str().lines().skip(3).map(str::to_string).collect()
  }

  #[test]
  fn preamble_names_both_helpers() {
    let source = generate(Vec::new(), &CompileOptions::default()).expect("empty stream compiles");
    let lines: Vec<&str> = source.as_str().lines().collect();
    assert!(lines[0].starts_with("# generated by detox"));
    assert_eq!(lines[1], "from detox.escape import escape_text as __detox_escape_text__");
    assert_eq!(lines[2], "from detox.escape import escape_attr as __detox_escape_attr__");
  }

  #[test]
  fn indentation_follows_stack_depth() {
    let lines = body(vec![
      tok(Def, "gurk(arg)"),
      tok(If, "arg>2"),
      tok(PrintExpr, "str(2*arg)"),
      tok(Else, ""),
      tok(PrintExpr, "str(3*arg)"),
      tok(EndIf, ""),
      tok(EndDef, ""),
    ]);
    assert_eq!(
      lines,
      vec![
        "def gurk(arg):",
        "\tif arg>2:",
        "\t\tyield str(2*arg)",
        "\telse:",
        "\t\tyield str(3*arg)",
      ]
    );
  }

  #[test]
  fn output_kinds_wrap_their_payload() {
    let lines = body(vec![
      tok(Def, "f(s)"),
      tok(RawText, "a \"b\"\n"),
      tok(PrintEscapedText, "s"),
      tok(PrintEscapedAttr, "s"),
      tok(Code, "x = 1\nif x: pass"),
      tok(Elif, "x"),
    ]);
    assert_eq!(
      lines,
      vec![
        "def f(s):",
        "\tyield \"a \\\"b\\\"\\n\"",
        "\tyield __detox_escape_text__(s)",
        "\tyield __detox_escape_attr__(s)",
        "\tx = 1",
        "\tif x: pass",
        "elif x:",
      ]
    );
  }

  #[test]
  fn output_outside_def_is_dropped() {
    let lines = body(vec![
      tok(RawText, "lost"),
      tok(Class, "C"),
      tok(PrintExpr, "x"),
      tok(EndClass, ""),
      tok(Code, "y = 2"),
    ]);
    assert_eq!(lines, vec!["class C:", "y = 2"]);
  }

  #[test]
  fn nearest_definition_rule_silences_class_bodies() {
    let tokens = vec![
      tok(Def, "outer()"),
      tok(Class, "Inner"),
      tok(RawText, "x"),
      tok(EndAny, ""),
      tok(RawText, "y"),
    ];
    let any = generate(tokens.clone(), &CompileOptions::default()).expect("compiles");
    assert_eq!(any.lines().len(), 4);
    let nearest = CompileOptions::default().with_output_scope(OutputScope::NearestDefinition);
    let source = generate(tokens, &nearest).expect("compiles");
    let texts: Vec<&str> = source.lines().iter().map(|line| line.text.as_str()).collect();
    assert_eq!(texts, vec!["def outer():", "class Inner:", "yield \"y\""]);
  }

  #[test]
  fn end_any_closes_whatever_is_open() {
    let mut emitter = Emitter::new(CompileOptions::default());
    emitter.process(tok(Def, "gurk()")).expect("def opens");
    emitter.process(tok(For, "i in x")).expect("for opens");
    emitter.process(tok(EndAny, "")).expect("end closes for");
    assert_eq!(emitter.stack()[0].kind, Def);
    emitter.process(tok(EndAny, "")).expect("end closes def");
    assert!(emitter.stack().is_empty());
  }

  #[test]
  fn mismatched_end_leaves_the_stack_alone() {
    let mut emitter = Emitter::new(CompileOptions::default());
    emitter.process(tok(Def, "gurk()")).expect("def opens");
    let err = emitter.process(tok(EndFor, "")).unwrap_err();
    assert_eq!(
      err.to_string(),
      "can't end for scope: active scope is: def gurk()"
    );
    assert_eq!(
      emitter.stack(),
      &[ScopeFrame {
        kind: Def,
        header: "gurk()".to_string()
      }]
    );
  }

  #[test]
  fn ending_with_empty_stack_fails() {
    let err = generate(vec![tok(EndAny, "")], &CompileOptions::default()).unwrap_err();
    assert_eq!(err.to_string(), "can't end unnamed scope: no active scope");
    let err = generate(vec![tok(EndIf, "")], &CompileOptions::default()).unwrap_err();
    assert_eq!(err.to_string(), "can't end if scope: no active scope");
  }

  #[test]
  fn strict_mode_reports_unclosed_frames() {
    let tokens = vec![tok(Def, "f()"), tok(For, "i in x")];
    assert!(generate(tokens.clone(), &CompileOptions::default()).is_ok());
    let err = generate(tokens, &CompileOptions::default().strict()).unwrap_err();
    assert_eq!(err.to_string(), "unclosed scopes remaining: def, for");
  }

  #[test]
  fn custom_indent_unit() {
    let options = CompileOptions::default().with_indent("    ");
    let source = generate(vec![tok(Def, "f()"), tok(RawText, "x")], &options).expect("compiles");
    assert!(source.as_str().ends_with("def f():\n    yield \"x\"\n"));
  }

  #[test]
  fn control_characters_are_hex_escaped() {
    assert_eq!(quote("a\u{1}b\\"), "\"a\\x01b\\\\\"");
  }

  fn opener() -> impl Strategy<Value = InstructionKind> {
    prop_oneof![Just(If), Just(Def), Just(Class), Just(For), Just(While)]
  }

  proptest! {
    #[test]
    fn balanced_streams_indent_by_nesting(kinds in prop::collection::vec(opener(), 0..8)) {
      let mut tokens: Vec<Token> = kinds.iter().map(|kind| tok(*kind, "h")).collect();
      tokens.push(tok(Code, "pass"));
      tokens.extend(kinds.iter().rev().map(|kind| tok(EndAny, kind.scope_name())));
      let source = generate(tokens, &CompileOptions::default().strict()).expect("balanced stream");
      let lines = source.lines();
      for (depth, line) in lines.iter().enumerate() {
        prop_assert_eq!(line.depth, depth);
      }
      prop_assert_eq!(lines.len(), kinds.len() + 1);
    }
  }
}
