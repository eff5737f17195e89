//! Lexical analysis: flattens a template tree into a stream of typed tokens.
//!
//! The walk is lazy and keeps its own explicit stack, so a token stream can be
//! restarted at any time by calling `tokenize` on the same tree again. Element
//! markup is turned into literal text on the way; adjacent literal text is
//! coalesced into a single token.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::tree::Node;

/// Syntactic role of a single directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
  RawText,
  PrintExpr,
  PrintEscapedText,
  PrintEscapedAttr,
  Code,
  If,
  Elif,
  Else,
  EndIf,
  Def,
  EndDef,
  Class,
  EndClass,
  For,
  EndFor,
  While,
  EndWhile,
  EndAny,
}

impl InstructionKind {
  pub const ALL: [InstructionKind; 18] = [
    Self::RawText,
    Self::PrintExpr,
    Self::PrintEscapedText,
    Self::PrintEscapedAttr,
    Self::Code,
    Self::If,
    Self::Elif,
    Self::Else,
    Self::EndIf,
    Self::Def,
    Self::EndDef,
    Self::Class,
    Self::EndClass,
    Self::For,
    Self::EndFor,
    Self::While,
    Self::EndWhile,
    Self::EndAny,
  ];

  /// Processing-instruction target spelling; `RawText` has none.
  pub fn target(self) -> Option<&'static str> {
    let target = match self {
      Self::RawText => return None,
      Self::PrintExpr => "expr",
      Self::PrintEscapedText => "textexpr",
      Self::PrintEscapedAttr => "attrexpr",
      Self::Code => "code",
      Self::If => "if",
      Self::Elif => "elif",
      Self::Else => "else",
      Self::EndIf => "endif",
      Self::Def => "def",
      Self::EndDef => "enddef",
      Self::Class => "class",
      Self::EndClass => "endclass",
      Self::For => "for",
      Self::EndFor => "endfor",
      Self::While => "while",
      Self::EndWhile => "endwhile",
      Self::EndAny => "end",
    };
    Some(target)
  }

  /// Name of the block construct a kind belongs to, as used in diagnostics.
  pub fn scope_name(self) -> &'static str {
    match self {
      Self::RawText => "text",
      Self::PrintExpr => "expr",
      Self::PrintEscapedText => "textexpr",
      Self::PrintEscapedAttr => "attrexpr",
      Self::Code => "code",
      Self::If | Self::Elif | Self::Else | Self::EndIf => "if",
      Self::Def | Self::EndDef => "def",
      Self::Class | Self::EndClass => "class",
      Self::For | Self::EndFor => "for",
      Self::While | Self::EndWhile => "while",
      Self::EndAny => "end",
    }
  }

  /// The block-opening kind a kind-specific end closes.
  pub fn closes(self) -> Option<InstructionKind> {
    match self {
      Self::EndIf => Some(Self::If),
      Self::EndDef => Some(Self::Def),
      Self::EndClass => Some(Self::Class),
      Self::EndFor => Some(Self::For),
      Self::EndWhile => Some(Self::While),
      _ => None,
    }
  }
}

/// Target name to kind, built once from the kind descriptors.
static TARGETS: LazyLock<HashMap<&'static str, InstructionKind>> = LazyLock::new(|| {
  InstructionKind::ALL
    .into_iter()
    .filter_map(|kind| kind.target().map(|target| (target, kind)))
    .collect()
});

/// Look up the kind registered for a processing-instruction target.
pub fn lookup_target(target: &str) -> Option<InstructionKind> {
  TARGETS.get(target).copied()
}

/// Resolve the data of a bare `end` instruction (`end for`, `end`) to a kind.
pub fn lookup_end(scope: &str) -> Option<InstructionKind> {
  if scope.is_empty() {
    return Some(InstructionKind::EndAny);
  }
  lookup_target(&format!("end{scope}")).filter(|kind| kind.closes().is_some())
}

/// One directive with its payload text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
  pub kind: InstructionKind,
  pub payload: String,
}

impl Token {
  pub fn new(kind: InstructionKind, payload: impl Into<String>) -> Self {
    Self {
      kind,
      payload: payload.into(),
    }
  }
}

enum Pending<'a> {
  Node(&'a Node),
  Literal(String),
}

/// Lazy document-order walk over a tree.
pub struct Tokens<'a> {
  stack: Vec<Pending<'a>>,
  held: Option<Token>,
}

/// Walk `nodes` in document order, yielding one token per directive.
pub fn tokenize(nodes: &[Node]) -> Tokens<'_> {
  Tokens {
    stack: nodes.iter().rev().map(Pending::Node).collect(),
    held: None,
  }
}

impl<'a> Tokens<'a> {
  fn next_raw(&mut self) -> Option<Token> {
    while let Some(pending) = self.stack.pop() {
      let node = match pending {
        Pending::Literal(text) => return Some(Token::new(InstructionKind::RawText, text)),
        Pending::Node(node) => node,
      };
      match node {
        Node::Text(text) => return Some(Token::new(InstructionKind::RawText, text.as_str())),
        Node::Instruction { kind, payload } => return Some(Token::new(*kind, payload.as_str())),
        Node::Fragment(children) => self.stack.extend(children.iter().rev().map(Pending::Node)),
        Node::Element {
          name,
          attrs,
          children,
        } => {
          self.stack.push(Pending::Literal(format!("</{name}>")));
          self.stack.extend(children.iter().rev().map(Pending::Node));
          self.stack.push(Pending::Literal(">".to_string()));
          for (attr, value) in attrs.iter().rev() {
            self.stack.push(Pending::Literal("\"".to_string()));
            self.stack.extend(value.iter().rev().map(Pending::Node));
            self.stack.push(Pending::Literal(format!(" {attr}=\"")));
          }
          return Some(Token::new(InstructionKind::RawText, format!("<{name}")));
        }
      }
    }
    None
  }
}

impl Iterator for Tokens<'_> {
  type Item = Token;

  fn next(&mut self) -> Option<Token> {
    loop {
      let Some(token) = self.next_raw() else {
        return self.held.take();
      };
      if token.kind == InstructionKind::RawText {
        if token.payload.is_empty() {
          continue;
        }
        if let Some(held) = self.held.as_mut()
          && held.kind == InstructionKind::RawText
        {
          held.payload.push_str(&token.payload);
          continue;
        }
      }
      if let Some(previous) = self.held.replace(token) {
        return Some(previous);
      }
    }
  }
}
