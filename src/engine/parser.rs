//! Recursive-descent parser for generated source.
//!
//! Statements are read line by line with `Indent`/`Dedent` delimiting suites;
//! expressions use the usual precedence-climbing helpers, one per level, from
//! conditional expressions down to atoms.

use std::sync::Arc;

use crate::engine::ast::{
  BinaryOp, ClassDef, Constant, Expr, FunctionDef, Param, Stmt, StmtKind, Target, UnaryOp,
};
use crate::engine::lexer::{Token, TokenKind, describe_token, token_text, tokenize, unquote};
use crate::error::{TemplateError, TemplateResult};

/// Deepest expression or block nesting accepted before parsing gives up.
const MAX_NESTING: usize = 100;

const KEYWORDS: [&str; 24] = [
  "if", "elif", "else", "while", "for", "in", "def", "class", "return", "yield", "pass", "break",
  "continue", "and", "or", "not", "None", "True", "False", "from", "import", "as", "is", "lambda",
];

/// Parse a whole module into its top-level statements.
pub fn parse(module: &str, source: &str) -> TemplateResult<Vec<Stmt>> {
  let tokens = tokenize(module, source)?;
  let mut stream = TokenStream::new(tokens, module, source);
  let mut body = Vec::new();
  while !stream.is_eof() {
    if stream.peek_kind() == Some(TokenKind::Indent) {
      return Err(stream.error_here("unexpected indent"));
    }
    parse_statement(&mut stream, &mut body)?;
  }
  Ok(body)
}

fn parse_statement(stream: &mut TokenStream, body: &mut Vec<Stmt>) -> TemplateResult<()> {
  let loc = stream.loc();
  let line = stream.line_of(loc);
  let stmt = |kind| Stmt { line, loc, kind };

  if stream.keyword("if") {
    let kind = parse_if(stream)?;
    body.push(stmt(kind));
    return Ok(());
  }
  if stream.keyword("while") {
    let cond = parse_test(stream)?;
    let body_stmts = parse_suite(stream)?;
    let orelse = parse_loop_else(stream)?;
    body.push(stmt(StmtKind::While {
      cond,
      body: body_stmts,
      orelse,
    }));
    return Ok(());
  }
  if stream.keyword("for") {
    let target = parse_target_list(stream)?;
    stream.expect_keyword("in")?;
    let iter = parse_expr_list(stream)?;
    let body_stmts = parse_suite(stream)?;
    let orelse = parse_loop_else(stream)?;
    body.push(stmt(StmtKind::For {
      target,
      iter,
      body: body_stmts,
      orelse,
    }));
    return Ok(());
  }
  if stream.keyword("def") {
    let def = parse_def(stream)?;
    body.push(stmt(StmtKind::Def(def)));
    return Ok(());
  }
  if stream.keyword("class") {
    let (name, _) = stream.get_ident()?;
    let mut bases = Vec::new();
    if stream.equal("(") {
      while !stream.equal(")") {
        bases.push(parse_test(stream)?);
        if !stream.equal(",") {
          stream.skip(")")?;
          break;
        }
      }
    }
    let body_stmts = parse_suite(stream)?;
    body.push(stmt(StmtKind::Class(ClassDef {
      name,
      bases,
      body: body_stmts,
    })));
    return Ok(());
  }
  if matches!(stream.peek_text(), Some("elif" | "else")) {
    return Err(stream.error_here("'elif'/'else' without a matching 'if'"));
  }

  parse_simple_line(stream, body)
}

/// Small statements separated by `;` up to the end of the line.
fn parse_simple_line(stream: &mut TokenStream, body: &mut Vec<Stmt>) -> TemplateResult<()> {
  loop {
    let loc = stream.loc();
    let kind = parse_small_statement(stream)?;
    body.push(Stmt {
      line: stream.line_of(loc),
      loc,
      kind,
    });
    if !stream.equal(";") || stream.at_line_end() {
      break;
    }
  }
  stream.end_line()
}

fn parse_small_statement(stream: &mut TokenStream) -> TemplateResult<StmtKind> {
  if stream.keyword("pass") {
    return Ok(StmtKind::Pass);
  }
  if stream.keyword("break") {
    return Ok(StmtKind::Break);
  }
  if stream.keyword("continue") {
    return Ok(StmtKind::Continue);
  }
  if stream.keyword("return") {
    if stream.at_line_end() || stream.peek_is(";") {
      return Ok(StmtKind::Return(None));
    }
    return Ok(StmtKind::Return(Some(parse_expr_list(stream)?)));
  }
  if stream.keyword("yield") {
    return Ok(StmtKind::Yield(parse_expr_list(stream)?));
  }
  if stream.keyword("from") {
    let (mut module, _) = stream.get_ident()?;
    while stream.equal(".") {
      let (part, _) = stream.get_ident()?;
      module.push('.');
      module.push_str(&part);
    }
    stream.expect_keyword("import")?;
    let mut names = Vec::new();
    loop {
      let (name, _) = stream.get_ident()?;
      let alias = if stream.keyword("as") {
        stream.get_ident()?.0
      } else {
        name.clone()
      };
      names.push((name, alias));
      if !stream.equal(",") {
        break;
      }
    }
    return Ok(StmtKind::Import { module, names });
  }

  let loc = stream.loc();
  let expr = parse_expr_list(stream)?;
  if stream.equal("=") {
    let target = into_target(stream, expr, loc)?;
    let value = parse_expr_list(stream)?;
    return Ok(StmtKind::Assign(target, value));
  }
  for (symbol, op) in [("+=", BinaryOp::Add), ("-=", BinaryOp::Sub), ("*=", BinaryOp::Mul)] {
    if stream.equal(symbol) {
      let target = into_target(stream, expr, loc)?;
      if matches!(target, Target::Tuple(_)) {
        return Err(stream.error_at(loc, "illegal target for augmented assignment"));
      }
      let value = parse_expr_list(stream)?;
      return Ok(StmtKind::AugAssign(target, op, value));
    }
  }
  Ok(StmtKind::Expr(expr))
}

fn parse_if(stream: &mut TokenStream) -> TemplateResult<StmtKind> {
  let mut branches = Vec::new();
  let cond = parse_test(stream)?;
  branches.push((cond, parse_suite(stream)?));
  let mut orelse = Vec::new();
  loop {
    if stream.keyword("elif") {
      let cond = parse_test(stream)?;
      branches.push((cond, parse_suite(stream)?));
      continue;
    }
    if stream.keyword("else") {
      orelse = parse_suite(stream)?;
    }
    break;
  }
  Ok(StmtKind::If { branches, orelse })
}

fn parse_loop_else(stream: &mut TokenStream) -> TemplateResult<Vec<Stmt>> {
  if stream.keyword("else") {
    return parse_suite(stream);
  }
  Ok(Vec::new())
}

fn parse_def(stream: &mut TokenStream) -> TemplateResult<FunctionDef> {
  let (name, _) = stream.get_ident()?;
  stream.skip("(")?;
  let mut params: Vec<Param> = Vec::new();
  while !stream.equal(")") {
    let loc = stream.loc();
    let (param, _) = stream.get_ident()?;
    let default = if stream.equal("=") {
      Some(parse_test(stream)?)
    } else {
      None
    };
    if default.is_none() && params.iter().any(|p| p.default.is_some()) {
      return Err(stream.error_at(loc, "non-default argument follows default argument"));
    }
    if params.iter().any(|p| p.name == param) {
      return Err(stream.error_at(loc, format!("duplicate argument '{param}'")));
    }
    params.push(Param {
      name: param,
      default,
    });
    if !stream.equal(",") {
      stream.skip(")")?;
      break;
    }
  }
  let body = parse_suite(stream)?;
  Ok(FunctionDef { name, params, body })
}

/// `:` followed by either statements on the same line or an indented block.
///
/// A header followed by nothing indented yields an empty block.
fn parse_suite(stream: &mut TokenStream) -> TemplateResult<Vec<Stmt>> {
  stream.skip(":")?;
  if stream.blocks >= MAX_NESTING {
    return Err(stream.error_here("blocks nested too deeply"));
  }
  stream.blocks += 1;
  let body = parse_block(stream);
  stream.blocks -= 1;
  body
}

fn parse_block(stream: &mut TokenStream) -> TemplateResult<Vec<Stmt>> {
  let mut body = Vec::new();
  if !stream.at_line_end() {
    parse_simple_line(stream, &mut body)?;
    return Ok(body);
  }
  stream.end_line()?;
  if stream.peek_kind() != Some(TokenKind::Indent) {
    return Ok(body);
  }
  stream.pos += 1;
  while !matches!(stream.peek_kind(), Some(TokenKind::Dedent | TokenKind::Eof) | None) {
    parse_statement(stream, &mut body)?;
  }
  if stream.peek_kind() == Some(TokenKind::Dedent) {
    stream.pos += 1;
  }
  Ok(body)
}

fn into_target(stream: &TokenStream, expr: Expr, loc: usize) -> TemplateResult<Target> {
  match expr {
    Expr::Name(name) => Ok(Target::Name(name)),
    Expr::Attr { value, name } => Ok(Target::Attr(*value, name)),
    Expr::Index { value, index } => Ok(Target::Index(*value, *index)),
    Expr::Tuple(items) | Expr::List(items) => items
      .into_iter()
      .map(|item| into_target(stream, item, loc))
      .collect::<TemplateResult<Vec<_>>>()
      .map(Target::Tuple),
    _ => Err(stream.error_at(loc, "cannot assign to expression")),
  }
}

fn parse_target_list(stream: &mut TokenStream) -> TemplateResult<Target> {
  let loc = stream.loc();
  let first = parse_postfix(stream)?;
  if !stream.peek_is(",") {
    return into_target(stream, first, loc);
  }
  let mut items = vec![first];
  while stream.equal(",") {
    if stream.peek_text() == Some("in") {
      break;
    }
    items.push(parse_postfix(stream)?);
  }
  into_target(stream, Expr::Tuple(items), loc)
}

/// Comma-separated expressions; more than one (or a trailing comma) makes a tuple.
fn parse_expr_list(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let first = parse_test(stream)?;
  if !stream.peek_is(",") {
    return Ok(first);
  }
  let mut items = vec![first];
  while stream.equal(",") {
    if stream.at_line_end() || stream.peek_is("=") || stream.peek_is(":") || stream.peek_is(";") {
      break;
    }
    items.push(parse_test(stream)?);
  }
  Ok(Expr::Tuple(items))
}

fn parse_test(stream: &mut TokenStream) -> TemplateResult<Expr> {
  stream.nested(parse_conditional)
}

fn parse_conditional(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let node = parse_or(stream)?;
  if stream.keyword("if") {
    let cond = parse_or(stream)?;
    stream.expect_keyword("else")?;
    let orelse = parse_test(stream)?;
    return Ok(Expr::IfElse {
      cond: Box::new(cond),
      then: Box::new(node),
      orelse: Box::new(orelse),
    });
  }
  Ok(node)
}

fn parse_or(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let mut node = parse_and(stream)?;
  while stream.keyword("or") {
    let rhs = parse_and(stream)?;
    node = Expr::Or(Box::new(node), Box::new(rhs));
  }
  Ok(node)
}

fn parse_and(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let mut node = parse_not(stream)?;
  while stream.keyword("and") {
    let rhs = parse_not(stream)?;
    node = Expr::And(Box::new(node), Box::new(rhs));
  }
  Ok(node)
}

fn parse_not(stream: &mut TokenStream) -> TemplateResult<Expr> {
  if stream.keyword("not") {
    let operand = stream.nested(parse_not)?;
    return Ok(Expr::unary(UnaryOp::Not, operand));
  }
  parse_comparison(stream)
}

fn parse_comparison(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let mut node = parse_add(stream)?;

  loop {
    let op = if stream.keyword("in") {
      BinaryOp::In
    } else if stream.peek_text() == Some("not") && stream.peek_text_at(1) == Some("in") {
      stream.pos += 2;
      BinaryOp::NotIn
    } else {
      let op = match stream.peek_punctuator() {
        Some("==") => BinaryOp::Eq,
        Some("!=") => BinaryOp::Ne,
        Some("<") => BinaryOp::Lt,
        Some("<=") => BinaryOp::Le,
        Some(">") => BinaryOp::Gt,
        Some(">=") => BinaryOp::Ge,
        _ => break,
      };
      stream.pos += 1;
      op
    };
    let rhs = parse_add(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_add(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let mut node = parse_mul(stream)?;

  loop {
    let op = match stream.peek_punctuator() {
      Some("+") => BinaryOp::Add,
      Some("-") => BinaryOp::Sub,
      _ => break,
    };
    stream.pos += 1;
    let rhs = parse_mul(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_mul(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let mut node = parse_unary(stream)?;

  loop {
    let op = match stream.peek_punctuator() {
      Some("*") => BinaryOp::Mul,
      Some("/") => BinaryOp::Div,
      Some("//") => BinaryOp::FloorDiv,
      Some("%") => BinaryOp::Mod,
      _ => break,
    };
    stream.pos += 1;
    let rhs = parse_unary(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_unary(stream: &mut TokenStream) -> TemplateResult<Expr> {
  if stream.equal("+") {
    let operand = stream.nested(parse_unary)?;
    return Ok(Expr::unary(UnaryOp::Pos, operand));
  }

  if stream.equal("-") {
    let operand = stream.nested(parse_unary)?;
    return Ok(Expr::unary(UnaryOp::Neg, operand));
  }

  parse_postfix(stream)
}

fn parse_postfix(stream: &mut TokenStream) -> TemplateResult<Expr> {
  let mut node = parse_primary(stream)?;

  loop {
    if stream.equal("(") {
      let (args, kwargs) = parse_call_args(stream)?;
      node = Expr::Call {
        func: Box::new(node),
        args,
        kwargs,
      };
    } else if stream.equal("[") {
      let index = parse_expr_list(stream)?;
      stream.skip("]")?;
      node = Expr::Index {
        value: Box::new(node),
        index: Box::new(index),
      };
    } else if stream.equal(".") {
      let (name, _) = stream.get_ident()?;
      node = Expr::Attr {
        value: Box::new(node),
        name,
      };
    } else {
      break;
    }
  }

  Ok(node)
}

type CallArgs = (Vec<Expr>, Vec<(String, Expr)>);

fn parse_call_args(stream: &mut TokenStream) -> TemplateResult<CallArgs> {
  let mut args = Vec::new();
  let mut kwargs: Vec<(String, Expr)> = Vec::new();
  while !stream.equal(")") {
    let loc = stream.loc();
    let is_keyword =
      stream.peek_kind() == Some(TokenKind::Ident) && stream.peek_text_at(1) == Some("=");
    if is_keyword {
      let (name, _) = stream.get_ident()?;
      stream.skip("=")?;
      if kwargs.iter().any(|(existing, _)| *existing == name) {
        return Err(stream.error_at(loc, format!("keyword argument repeated: {name}")));
      }
      kwargs.push((name, parse_test(stream)?));
    } else {
      if !kwargs.is_empty() {
        return Err(stream.error_at(loc, "positional argument follows keyword argument"));
      }
      args.push(parse_test(stream)?);
    }
    if !stream.equal(",") {
      stream.skip(")")?;
      break;
    }
  }
  Ok((args, kwargs))
}

fn parse_primary(stream: &mut TokenStream) -> TemplateResult<Expr> {
  if stream.equal("(") {
    if stream.equal(")") {
      return Ok(Expr::Tuple(Vec::new()));
    }
    let node = parse_expr_list(stream)?;
    stream.skip(")")?;
    return Ok(node);
  }

  if stream.equal("[") {
    let mut items = Vec::new();
    while !stream.equal("]") {
      items.push(parse_test(stream)?);
      if !stream.equal(",") {
        stream.skip("]")?;
        break;
      }
    }
    return Ok(Expr::List(items));
  }

  if stream.equal("{") {
    let mut entries = Vec::new();
    while !stream.equal("}") {
      let key = parse_test(stream)?;
      stream.skip(":")?;
      let value = parse_test(stream)?;
      entries.push((key, value));
      if !stream.equal(",") {
        stream.skip("}")?;
        break;
      }
    }
    return Ok(Expr::Dict(entries));
  }

  let Some(token) = stream.peek().cloned() else {
    return Err(stream.error_here("unexpected end of input"));
  };
  let text = token_text(&token, stream.source);
  match token.kind {
    TokenKind::Int => {
      stream.pos += 1;
      let value = text
        .parse::<i64>()
        .map_err(|err| stream.error_at(token.loc, format!("invalid number: {err}")))?;
      Ok(Expr::Const(Constant::Int(value)))
    }
    TokenKind::Float => {
      stream.pos += 1;
      let value = text
        .parse::<f64>()
        .map_err(|err| stream.error_at(token.loc, format!("invalid number: {err}")))?;
      Ok(Expr::Const(Constant::Float(value)))
    }
    TokenKind::Str => {
      let mut value = String::new();
      while let Some(token) = stream.peek().filter(|t| t.kind == TokenKind::Str).cloned() {
        let part = unquote(token_text(&token, stream.source))
          .map_err(|message| stream.error_at(token.loc, message))?;
        value.push_str(&part);
        stream.pos += 1;
      }
      Ok(Expr::Const(Constant::Str(Arc::from(value))))
    }
    TokenKind::Ident => match text {
      "None" => {
        stream.pos += 1;
        Ok(Expr::Const(Constant::None))
      }
      "True" | "False" => {
        stream.pos += 1;
        Ok(Expr::Const(Constant::Bool(text == "True")))
      }
      _ => {
        let (name, _) = stream.get_ident()?;
        Ok(Expr::Name(name))
      }
    },
    _ => {
      let got = describe_token(Some(&token), stream.source);
      Err(stream.error_at(
        token.loc,
        format!("expected an expression, but got \"{got}\""),
      ))
    }
  }
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  module: &'a str,
  source: &'a str,
  line_starts: Vec<usize>,
  pos: usize,
  /// Open expression levels.
  depth: usize,
  /// Open statement suites.
  blocks: usize,
}

impl<'a> TokenStream<'a> {
  fn new(tokens: Vec<Token>, module: &'a str, source: &'a str) -> Self {
    let line_starts = std::iter::once(0)
      .chain(source.match_indices('\n').map(|(i, _)| i + 1))
      .collect();
    Self {
      tokens,
      module,
      source,
      line_starts,
      pos: 0,
      depth: 0,
      blocks: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|token| token.kind)
  }

  fn peek_text(&self) -> Option<&'a str> {
    self.peek_text_at(0)
  }

  fn peek_text_at(&self, offset: usize) -> Option<&'a str> {
    self
      .tokens
      .get(self.pos + offset)
      .filter(|token| matches!(token.kind, TokenKind::Ident | TokenKind::Punctuator))
      .map(|token| token_text(token, self.source))
  }

  fn peek_punctuator(&self) -> Option<&'a str> {
    self
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, self.source))
  }

  fn peek_is(&self, op: &str) -> bool {
    self.peek_punctuator() == Some(op)
  }

  fn loc(&self) -> usize {
    self.peek().map_or(self.source.len(), |token| token.loc)
  }

  fn line_of(&self, loc: usize) -> usize {
    self.line_starts.partition_point(|&start| start <= loc)
  }

  fn at_line_end(&self) -> bool {
    matches!(self.peek_kind(), Some(TokenKind::Newline | TokenKind::Eof) | None)
  }

  fn error_at(&self, loc: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::compile_at(self.module, self.source, loc, message)
  }

  fn error_here(&self, message: impl Into<String>) -> TemplateError {
    self.error_at(self.loc(), message)
  }

  /// Consume the current token if it matches the provided punctuator.
  fn equal(&mut self, op: &str) -> bool {
    if self.peek_is(op) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, s: &str) -> TemplateResult<()> {
    if self.equal(s) {
      Ok(())
    } else {
      let got = describe_token(self.peek(), self.source);
      Err(self.error_here(format!("expected \"{s}\", but got \"{got}\"")))
    }
  }

  /// Consume the current token if it is the given keyword.
  fn keyword(&mut self, word: &str) -> bool {
    if self.peek_kind() == Some(TokenKind::Ident) && self.peek_text() == Some(word) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn expect_keyword(&mut self, word: &str) -> TemplateResult<()> {
    if self.keyword(word) {
      return Ok(());
    }
    let got = describe_token(self.peek(), self.source);
    Err(self.error_here(format!("expected \"{word}\", but got \"{got}\"")))
  }

  fn end_line(&mut self) -> TemplateResult<()> {
    match self.peek_kind() {
      Some(TokenKind::Newline) => {
        self.pos += 1;
        Ok(())
      }
      Some(TokenKind::Eof) | None => Ok(()),
      _ => {
        let got = describe_token(self.peek(), self.source);
        Err(self.error_here(format!("expected end of line, but got \"{got}\"")))
      }
    }
  }

  /// Parse the current token as a (non-keyword) identifier.
  fn get_ident(&mut self) -> TemplateResult<(String, usize)> {
    if let Some(token) = self.tokens.get(self.pos)
      && token.kind == TokenKind::Ident
    {
      let text = token_text(token, self.source);
      if KEYWORDS.contains(&text) {
        return Err(self.error_at(token.loc, format!("'{text}' is a reserved word")));
      }
      let loc = token.loc;
      self.pos += 1;
      return Ok((text.to_string(), loc));
    }

    let got = describe_token(self.peek(), self.source);
    Err(self.error_here(format!("expected an identifier, but got \"{got}\"")))
  }

  /// Run `parse` one expression level deeper.
  fn nested(
    &mut self,
    parse: impl FnOnce(&mut Self) -> TemplateResult<Expr>,
  ) -> TemplateResult<Expr> {
    if self.depth >= MAX_NESTING {
      return Err(self.error_here("expression nested too deeply"));
    }
    self.depth += 1;
    let result = parse(self);
    self.depth -= 1;
    result
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse_one(src: &str) -> StmtKind {
    let mut body = parse("t", src).expect("source should parse");
    assert_eq!(body.len(), 1, "expected a single statement in {src:?}");
    body.remove(0).kind
  }

  fn name(n: &str) -> Expr {
    Expr::Name(n.to_string())
  }

  fn int(v: i64) -> Expr {
    Expr::Const(Constant::Int(v))
  }

  #[test]
  fn precedence_binds_multiplication_tighter() {
    assert_eq!(
      parse_one("x = 1 + 2 * y\n"),
      StmtKind::Assign(
        Target::Name("x".into()),
        Expr::binary(
          BinaryOp::Add,
          int(1),
          Expr::binary(BinaryOp::Mul, int(2), name("y"))
        )
      )
    );
  }

  #[test]
  fn def_with_defaults_and_nested_blocks() {
    let StmtKind::Def(def) = parse_one("def f(a, n=10):\n\tfor i in range(n):\n\t\tyield str(i)\n")
    else {
      panic!("expected a def");
    };
    assert_eq!(def.name, "f");
    assert_eq!(def.params.len(), 2);
    assert_eq!(def.params[1].default, Some(int(10)));
    let StmtKind::For { target, body, .. } = &def.body[0].kind else {
      panic!("expected a for loop");
    };
    assert_eq!(target, &Target::Name("i".into()));
    assert!(matches!(body[0].kind, StmtKind::Yield(_)));
    assert_eq!(body[0].line, 3);
  }

  #[test]
  fn else_at_outer_indent_attaches_to_if() {
    let StmtKind::If { branches, orelse } =
      parse_one("if a > 2:\n\tyield 1\nelif a:\n\tpass\nelse:\n\tyield 2\n")
    else {
      panic!("expected an if");
    };
    assert_eq!(branches.len(), 2);
    assert_eq!(orelse.len(), 1);
  }

  #[test]
  fn empty_blocks_and_single_line_suites() {
    let body = parse("t", "def f():\nwhile x: i += 1; break\n").expect("parses");
    assert!(matches!(&body[0].kind, StmtKind::Def(def) if def.body.is_empty()));
    let StmtKind::While { body: inner, .. } = &body[1].kind else {
      panic!("expected a while");
    };
    assert_eq!(inner.len(), 2);
  }

  #[test]
  fn loops_take_an_else_suite() {
    let StmtKind::For { body, orelse, .. } =
      parse_one("for i in x:\n\tif i:\n\t\tbreak\nelse:\n\tyield 'none'\n")
    else {
      panic!("expected a for loop");
    };
    assert_eq!(body.len(), 1);
    assert!(matches!(orelse[..], [Stmt { kind: StmtKind::Yield(_), line: 5, .. }]));

    let StmtKind::While { orelse, .. } = parse_one("while x: x -= 1\nelse: pass\n") else {
      panic!("expected a while");
    };
    assert_eq!(orelse.len(), 1);

    let err = parse("t", "x = 1\nelse:\n\tpass\n").unwrap_err();
    assert!(err.to_string().contains("'elif'/'else' without a matching 'if'"));
  }

  #[test]
  fn nesting_is_bounded() {
    fn message(src: &str) -> String {
      match parse("t", src) {
        Err(TemplateError::CompileFailure { message, .. }) => message,
        other => panic!("expected a compile failure, got {other:?}"),
      }
    }

    let depth = 20_000;
    let parens = format!("x = str({}1{})\n", "(".repeat(depth), ")".repeat(depth));
    assert_eq!(message(&parens), "expression nested too deeply");
    assert_eq!(message(&format!("x = {}1\n", "-".repeat(depth))), "expression nested too deeply");
    assert_eq!(message(&format!("x = {}y\n", "not ".repeat(depth))), "expression nested too deeply");

    let blocks: String = (0..500).map(|level| format!("{}if x:\n", "\t".repeat(level))).collect();
    let src = format!("{blocks}{}pass\n", "\t".repeat(500));
    assert_eq!(message(&src), "blocks nested too deeply");

    let shallow = format!("x = [{}1{}]\n", "(".repeat(50), ")".repeat(50));
    assert!(parse("t", &shallow).is_ok());
  }

  #[test]
  fn imports_with_aliases() {
    assert_eq!(
      parse_one("from detox.escape import escape_text as e, escape_attr\n"),
      StmtKind::Import {
        module: "detox.escape".into(),
        names: vec![
          ("escape_text".into(), "e".into()),
          ("escape_attr".into(), "escape_attr".into()),
        ],
      }
    );
  }

  #[test]
  fn conditional_and_membership_expressions() {
    let StmtKind::Expr(expr) = parse_one("a if x not in y else b\n") else {
      panic!("expected an expression");
    };
    assert!(matches!(
      expr,
      Expr::IfElse { cond, .. } if matches!(*cond, Expr::Binary { op: BinaryOp::NotIn, .. })
    ));
  }

  #[test]
  fn tuple_targets_in_for_and_assignment() {
    assert!(matches!(
      parse_one("for k, v in d.items():\n\tpass\n"),
      StmtKind::For { target: Target::Tuple(items), .. } if items.len() == 2
    ));
    assert!(matches!(
      parse_one("a, b = b, a\n"),
      StmtKind::Assign(Target::Tuple(_), Expr::Tuple(_))
    ));
  }

  #[test]
  fn malformed_payload_is_a_compile_failure() {
    let err = parse("t", "def f():\n\tyield str(\n").unwrap_err();
    assert!(matches!(err, TemplateError::CompileFailure { .. }));
    let err = parse("t", "x = (1 +)\n").unwrap_err();
    assert!(err.to_string().contains("expected an expression"));
    let err = parse("t", "1 = x\n").unwrap_err();
    assert!(err.to_string().contains("cannot assign"));
  }

  #[test]
  fn stray_else_is_rejected() {
    let err = parse("t", "else:\n\tpass\n").unwrap_err();
    assert!(err.to_string().contains("without a matching 'if'"));
  }
}
