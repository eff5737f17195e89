//! Lexical analysis for generated source.
//!
//! Besides operators, names and literals the lexer turns leading whitespace
//! into `Indent`/`Dedent` tokens and statement ends into `Newline` tokens.
//! Line breaks inside brackets join lines, comments and blank lines vanish.

use crate::error::{TemplateError, TemplateResult};

/// Kinds of tokens recognised by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
  Ident,
  Int,
  Float,
  Str,
  Punctuator,
  Newline,
  Indent,
  Dedent,
  Eof,
}

/// Thin wrapper for lexical information needed by later stages.
#[derive(Debug, Clone)]
pub struct Token {
  pub kind: TokenKind,
  pub loc: usize,
  pub len: usize,
}

impl Token {
  pub fn new(kind: TokenKind, loc: usize, len: usize) -> Self {
    Self { kind, loc, len }
  }
}

const PUNCTUATORS: [&str; 26] = [
  "==", "!=", "<=", ">=", "//", "+=", "-=", "*=", "+", "-", "*", "/", "%", "(", ")", "[", "]",
  "{", "}", ",", ":", ".", "<", ">", "=", ";",
];

struct Lexer<'a> {
  module: &'a str,
  input: &'a str,
  tokens: Vec<Token>,
  indents: Vec<usize>,
  depth: usize,
}

/// Lex generated source into a flat vector of tokens terminated by `Eof`.
pub fn tokenize(module: &str, input: &str) -> TemplateResult<Vec<Token>> {
  let mut lexer = Lexer {
    module,
    input,
    tokens: Vec::new(),
    indents: vec![0],
    depth: 0,
  };
  lexer.run()?;
  Ok(lexer.tokens)
}

impl Lexer<'_> {
  fn error(&self, loc: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::compile_at(self.module, self.input, loc, message)
  }

  fn push(&mut self, kind: TokenKind, loc: usize, len: usize) {
    self.tokens.push(Token::new(kind, loc, len));
  }

  fn run(&mut self) -> TemplateResult<()> {
    let bytes = self.input.as_bytes();
    let mut i = 0;
    let mut line_start = true;

    while i < bytes.len() {
      if line_start && self.depth == 0 {
        let start = i;
        while i < bytes.len() && matches!(bytes[i], b' ' | b'\t') {
          i += 1;
        }
        let blank = i >= bytes.len() || matches!(bytes[i], b'\n' | b'\r' | b'#');
        if !blank {
          self.indent_to(i - start, i)?;
        }
        line_start = false;
        continue;
      }

      let c = bytes[i];
      if c == b'\n' {
        if self.depth == 0 {
          if matches!(self.tokens.last().map(|t| t.kind), Some(kind) if kind != TokenKind::Newline) {
            self.push(TokenKind::Newline, i, 1);
          }
          line_start = true;
        }
        i += 1;
        continue;
      }
      if c.is_ascii_whitespace() {
        i += 1;
        continue;
      }
      if c == b'#' {
        while i < bytes.len() && bytes[i] != b'\n' {
          i += 1;
        }
        continue;
      }

      if c.is_ascii_digit() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
          i += 1;
        }
        let mut kind = TokenKind::Int;
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
          i += 1;
          while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
          }
          kind = TokenKind::Float;
        }
        self.push(kind, start, i - start);
        continue;
      }

      if c == b'"' || c == b'\'' {
        let start = i;
        i += 1;
        loop {
          match bytes.get(i) {
            None | Some(b'\n') => return Err(self.error(start, "unterminated string literal")),
            Some(b'\\') => i += 2,
            Some(&q) if q == c => break,
            Some(_) => i += 1,
          }
        }
        i += 1;
        self.push(TokenKind::Str, start, i - start);
        continue;
      }

      let rest = &self.input[i..];
      let Some(ch) = rest.chars().next() else {
        break;
      };
      if ch.is_alphabetic() || ch == '_' {
        let len = rest
          .find(|c: char| !(c.is_alphanumeric() || c == '_'))
          .unwrap_or(rest.len());
        self.push(TokenKind::Ident, i, len);
        i += len;
        continue;
      }

      if let Some(op) = PUNCTUATORS.into_iter().find(|op| rest.starts_with(op)) {
        match op {
          "(" | "[" | "{" => self.depth += 1,
          ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
          _ => {}
        }
        self.push(TokenKind::Punctuator, i, op.len());
        i += op.len();
        continue;
      }

      return Err(self.error(i, format!("invalid token: '{ch}'")));
    }

    let end = self.input.len();
    if matches!(self.tokens.last().map(|t| t.kind), Some(kind) if kind != TokenKind::Newline) {
      self.push(TokenKind::Newline, end, 0);
    }
    while self.indents.len() > 1 {
      self.indents.pop();
      self.push(TokenKind::Dedent, end, 0);
    }
    self.push(TokenKind::Eof, end, 0);
    Ok(())
  }

  fn indent_to(&mut self, width: usize, loc: usize) -> TemplateResult<()> {
    let current = self.indents.last().copied().unwrap_or(0);
    if width > current {
      self.indents.push(width);
      self.push(TokenKind::Indent, loc, 0);
      return Ok(());
    }
    while width < self.indents.last().copied().unwrap_or(0) {
      self.indents.pop();
      self.push(TokenKind::Dedent, loc, 0);
    }
    if width != self.indents.last().copied().unwrap_or(0) {
      return Err(self.error(loc, "unindent does not match any outer indentation level"));
    }
    Ok(())
  }
}

/// Return the slice from the source that produced this token.
pub fn token_text<'a>(token: &Token, source: &'a str) -> &'a str {
  let end = token.loc + token.len;
  &source[token.loc..end]
}

/// Human-friendly description used in diagnostics.
pub fn describe_token(token: Option<&Token>, source: &str) -> String {
  match token.map(|t| (t.kind, t)) {
    Some((TokenKind::Newline, _)) => "end of line".to_string(),
    Some((TokenKind::Indent, _)) => "indent".to_string(),
    Some((TokenKind::Dedent, _)) => "dedent".to_string(),
    Some((TokenKind::Eof, _)) | None => "EOF".to_string(),
    Some((_, t)) => token_text(t, source).to_string(),
  }
}

/// Decode the body of a string literal token, quotes included.
pub fn unquote(text: &str) -> Result<String, String> {
  let inner = &text[1..text.len() - 1];
  let mut out = String::with_capacity(inner.len());
  let mut chars = inner.chars();
  while let Some(c) = chars.next() {
    if c != '\\' {
      out.push(c);
      continue;
    }
    match chars.next() {
      Some('n') => out.push('\n'),
      Some('r') => out.push('\r'),
      Some('t') => out.push('\t'),
      Some('0') => out.push('\0'),
      Some(c @ ('\\' | '\'' | '"')) => out.push(c),
      Some(c @ ('x' | 'u')) => {
        let width = if c == 'x' { 2 } else { 4 };
        let digits: String = chars.by_ref().take(width).collect();
        let code = u32::from_str_radix(&digits, 16)
          .ok()
          .filter(|_| digits.len() == width)
          .and_then(char::from_u32)
          .ok_or_else(|| format!("invalid \\{c} escape"))?;
        out.push(code);
      }
      Some('\n') => {}
      Some(other) => {
        out.push('\\');
        out.push(other);
      }
      None => return Err("string ends with a backslash".to_string()),
    }
  }
  Ok(out)
}
