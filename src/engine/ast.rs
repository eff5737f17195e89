//! Syntax tree for generated source.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  FloorDiv,
  Mod,
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
  In,
  NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
  Neg,
  Pos,
  Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
  None,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(Arc<str>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Const(Constant),
  Name(String),
  List(Vec<Expr>),
  Tuple(Vec<Expr>),
  Dict(Vec<(Expr, Expr)>),
  Attr {
    value: Box<Expr>,
    name: String,
  },
  Index {
    value: Box<Expr>,
    index: Box<Expr>,
  },
  Call {
    func: Box<Expr>,
    args: Vec<Expr>,
    kwargs: Vec<(String, Expr)>,
  },
  Unary {
    op: UnaryOp,
    operand: Box<Expr>,
  },
  Binary {
    op: BinaryOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
  },
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
  IfElse {
    cond: Box<Expr>,
    then: Box<Expr>,
    orelse: Box<Expr>,
  },
}

impl Expr {
  pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
    Self::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  pub fn unary(op: UnaryOp, operand: Expr) -> Self {
    Self::Unary {
      op,
      operand: Box::new(operand),
    }
  }
}

/// Left-hand side of an assignment or loop variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
  Name(String),
  Attr(Expr, String),
  Index(Expr, Expr),
  Tuple(Vec<Target>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
  pub name: String,
  pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
  pub name: String,
  pub params: Vec<Param>,
  pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
  pub name: String,
  pub bases: Vec<Expr>,
  pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
  /// 1-based line in the generated source.
  pub line: usize,
  /// Byte offset of the statement start, for compile diagnostics.
  pub loc: usize,
  pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
  Expr(Expr),
  Assign(Target, Expr),
  AugAssign(Target, BinaryOp, Expr),
  Yield(Expr),
  Return(Option<Expr>),
  Pass,
  Break,
  Continue,
  If {
    branches: Vec<(Expr, Vec<Stmt>)>,
    orelse: Vec<Stmt>,
  },
  /// `orelse` runs when the condition turns false, not after a `break`.
  While {
    cond: Expr,
    body: Vec<Stmt>,
    orelse: Vec<Stmt>,
  },
  /// `orelse` runs once the iterator is exhausted, not after a `break`.
  For {
    target: Target,
    iter: Expr,
    body: Vec<Stmt>,
    orelse: Vec<Stmt>,
  },
  Def(FunctionDef),
  Class(ClassDef),
  /// `from module import name as alias, ...`
  Import {
    module: String,
    names: Vec<(String, String)>,
  },
}
