//! Minimal template tree and the reader for `<?target data?>` template text.
//!
//! Documents handed over by a markup front end only need to be expressed as
//! text leaves, instruction leaves and grouping nodes; elements exist so that
//! attribute values can carry directives of their own.

use crate::error::{TemplateError, TemplateResult};
use crate::tokenizer::{InstructionKind, lookup_end, lookup_target};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
  /// Literal text, passed through as output.
  Text(String),
  Instruction {
    kind: InstructionKind,
    payload: String,
  },
  /// Children without markup of their own.
  Fragment(Vec<Node>),
  Element {
    name: String,
    attrs: Vec<(String, Vec<Node>)>,
    children: Vec<Node>,
  },
}

impl Node {
  pub fn text(text: impl Into<String>) -> Self {
    Self::Text(text.into())
  }

  pub fn instruction(kind: InstructionKind, payload: impl Into<String>) -> Self {
    Self::Instruction {
      kind,
      payload: payload.into(),
    }
  }

  pub fn element(name: impl Into<String>) -> Self {
    Self::Element {
      name: name.into(),
      attrs: Vec::new(),
      children: Vec::new(),
    }
  }

  /// Add an attribute to an element; other nodes are returned unchanged.
  pub fn with_attr(mut self, name: impl Into<String>, value: Vec<Node>) -> Self {
    if let Self::Element { attrs, .. } = &mut self {
      attrs.push((name.into(), value));
    }
    self
  }

  /// Append a child to an element or fragment; other nodes are returned unchanged.
  pub fn with_child(mut self, child: Node) -> Self {
    match &mut self {
      Self::Element { children, .. } | Self::Fragment(children) => children.push(child),
      Self::Text(_) | Self::Instruction { .. } => {}
    }
    self
  }
}

/// Read template text into a flat node list.
///
/// Every `<?target data?>` becomes an instruction leaf with its data trimmed;
/// text in between becomes text leaves. Instructions with an unregistered
/// target are kept verbatim as text.
pub fn parse_source(source: &str) -> TemplateResult<Vec<Node>> {
  let mut nodes = Vec::new();
  let mut pos = 0;

  while let Some(offset) = source[pos..].find("<?") {
    let start = pos + offset;
    if start > pos {
      nodes.push(Node::text(&source[pos..start]));
    }

    let body_start = start + 2;
    let Some(body_len) = source[body_start..].find("?>") else {
      return Err(TemplateError::at(
        source,
        start,
        "unterminated processing instruction",
      ));
    };
    let body = &source[body_start..body_start + body_len];
    let end = body_start + body_len + 2;

    let (target, data) = match body.find(char::is_whitespace) {
      Some(split) => (&body[..split], body[split..].trim()),
      None => (body, ""),
    };

    if target.is_empty() {
      return Err(TemplateError::at(
        source,
        body_start,
        "processing instruction has no target",
      ));
    }

    let node = if target == "end" {
      let Some(kind) = lookup_end(data) else {
        return Err(TemplateError::at(
          source,
          body_start,
          format!("can't end {data} scope: unknown block kind"),
        ));
      };
      Node::instruction(kind, "")
    } else {
      match lookup_target(target) {
        Some(kind) => Node::instruction(kind, data),
        None => Node::text(&source[start..end]),
      }
    };
    nodes.push(node);
    pos = end;
  }

  if pos < source.len() {
    nodes.push(Node::text(&source[pos..]));
  }
  Ok(nodes)
}

#[cfg(test)]
mod tests {
  use super::*;
  use InstructionKind::*;

  #[test]
  fn splits_text_and_instructions() {
    let nodes = parse_source("<?def helloworld(n=10)?>\n\t<?for i in range(n)?>Hi<?end for?><?end?>")
      .expect("template should parse");
    assert_eq!(
      nodes,
      vec![
        Node::instruction(Def, "helloworld(n=10)"),
        Node::text("\n\t"),
        Node::instruction(For, "i in range(n)"),
        Node::text("Hi"),
        Node::instruction(EndFor, ""),
        Node::instruction(EndAny, ""),
      ]
    );
  }

  #[test]
  fn fused_end_targets_are_accepted() {
    let nodes = parse_source("<?endif?><?endwhile?>").expect("template should parse");
    assert_eq!(
      nodes,
      vec![Node::instruction(EndIf, ""), Node::instruction(EndWhile, "")]
    );
  }

  #[test]
  fn unknown_targets_stay_text() {
    let nodes = parse_source("a<?xml version='1.0'?>b").expect("template should parse");
    assert_eq!(
      nodes,
      vec![
        Node::text("a"),
        Node::text("<?xml version='1.0'?>"),
        Node::text("b"),
      ]
    );
  }

  #[test]
  fn unterminated_instruction_is_reported_at_its_start() {
    let err = parse_source("ab<?expr x").unwrap_err();
    assert_eq!(
      err.to_string(),
      "'ab<?expr x'\n   ^ unterminated processing instruction"
    );
  }

  #[test]
  fn ending_an_unknown_scope_is_rejected() {
    let err = parse_source("<?end bogus?>").unwrap_err();
    assert!(err.to_string().contains("can't end bogus scope"));
  }
}
