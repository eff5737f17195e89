//! Lowering of statements into flat instruction lists.
//!
//! Every function body, class body and the module body becomes one `Code`
//! object whose control flow is expressed with jumps, so the executor can
//! suspend at any `yield` and resume from a saved program counter. Expressions
//! stay as trees; they never suspend.

use std::sync::Arc;

use crate::engine::ast::{BinaryOp, ClassDef, Expr, FunctionDef, Stmt, StmtKind, Target};
use crate::error::{TemplateError, TemplateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
  Module,
  Function,
  ClassBody,
}

#[derive(Debug)]
pub enum Op {
  Eval(Expr),
  Store(Target, Expr),
  Update(Target, BinaryOp, Expr),
  Yield(Expr),
  Return(Option<Expr>),
  Jump(usize),
  JumpUnless(Expr, usize),
  /// Push an iterator over the value of the expression.
  Iterate(Expr),
  /// Advance the innermost iterator into `target`; pop it and jump to `exit`
  /// once exhausted.
  Next {
    target: Target,
    exit: usize,
  },
  DropIter,
  MakeFunction {
    code: Arc<Code>,
    defaults: Vec<Option<Expr>>,
  },
  MakeClass {
    name: String,
    bases: Vec<Expr>,
    body: Arc<Code>,
  },
  Import {
    module: String,
    names: Vec<(String, String)>,
  },
}

#[derive(Debug)]
pub struct Instr {
  pub op: Op,
  pub line: usize,
}

#[derive(Debug)]
pub struct Code {
  pub name: String,
  pub kind: CodeKind,
  pub params: Vec<String>,
  pub ops: Vec<Instr>,
  /// Whether the body contains `yield`; calls then return a generator.
  pub is_generator: bool,
}

struct LoopContext {
  continue_to: usize,
  breaks: Vec<usize>,
  iterates: bool,
}

struct Lowering<'a> {
  module: &'a str,
  source: &'a str,
  kind: CodeKind,
  ops: Vec<Instr>,
  loops: Vec<LoopContext>,
  is_generator: bool,
}

/// Lower a parsed module body.
pub fn compile_module(module: &str, source: &str, body: Vec<Stmt>) -> TemplateResult<Arc<Code>> {
  lower(module, source, "<module>", CodeKind::Module, Vec::new(), body)
}

fn lower(
  module: &str,
  source: &str,
  name: &str,
  kind: CodeKind,
  params: Vec<String>,
  body: Vec<Stmt>,
) -> TemplateResult<Arc<Code>> {
  let mut lowering = Lowering {
    module,
    source,
    kind,
    ops: Vec::new(),
    loops: Vec::new(),
    is_generator: false,
  };
  lowering.block(body)?;
  Ok(Arc::new(Code {
    name: name.to_string(),
    kind,
    params,
    ops: lowering.ops,
    is_generator: lowering.is_generator,
  }))
}

impl Lowering<'_> {
  fn error(&self, loc: usize, message: &str) -> TemplateError {
    TemplateError::compile_at(self.module, self.source, loc, message)
  }

  fn emit(&mut self, op: Op, line: usize) -> usize {
    self.ops.push(Instr { op, line });
    self.ops.len() - 1
  }

  /// Point the jump at `at` to `target`.
  fn patch(&mut self, at: usize, target: usize) {
    match &mut self.ops[at].op {
      Op::Jump(to) | Op::JumpUnless(_, to) | Op::Next { exit: to, .. } => *to = target,
      _ => {}
    }
  }

  fn block(&mut self, body: Vec<Stmt>) -> TemplateResult<()> {
    for stmt in body {
      self.statement(stmt)?;
    }
    Ok(())
  }

  fn statement(&mut self, stmt: Stmt) -> TemplateResult<()> {
    let Stmt { line, loc, kind } = stmt;
    match kind {
      StmtKind::Expr(expr) => {
        self.emit(Op::Eval(expr), line);
      }
      StmtKind::Assign(target, value) => {
        self.emit(Op::Store(target, value), line);
      }
      StmtKind::AugAssign(target, op, value) => {
        self.emit(Op::Update(target, op, value), line);
      }
      StmtKind::Yield(value) => {
        if self.kind != CodeKind::Function {
          return Err(self.error(loc, "'yield' outside function"));
        }
        self.is_generator = true;
        self.emit(Op::Yield(value), line);
      }
      StmtKind::Return(value) => {
        if self.kind != CodeKind::Function {
          return Err(self.error(loc, "'return' outside function"));
        }
        self.emit(Op::Return(value), line);
      }
      StmtKind::Pass => {}
      StmtKind::Break => {
        let Some(iterates) = self.loops.last().map(|ctx| ctx.iterates) else {
          return Err(self.error(loc, "'break' outside loop"));
        };
        if iterates {
          self.emit(Op::DropIter, line);
        }
        let jump = self.emit(Op::Jump(usize::MAX), line);
        if let Some(ctx) = self.loops.last_mut() {
          ctx.breaks.push(jump);
        }
      }
      StmtKind::Continue => {
        let Some(target) = self.loops.last().map(|ctx| ctx.continue_to) else {
          return Err(self.error(loc, "'continue' not properly in loop"));
        };
        self.emit(Op::Jump(target), line);
      }
      StmtKind::If { branches, orelse } => {
        let mut exits = Vec::new();
        let count = branches.len();
        for (index, (cond, body)) in branches.into_iter().enumerate() {
          let skip = self.emit(Op::JumpUnless(cond, usize::MAX), line);
          self.block(body)?;
          if index + 1 < count || !orelse.is_empty() {
            exits.push(self.emit(Op::Jump(usize::MAX), line));
          }
          let next = self.ops.len();
          self.patch(skip, next);
        }
        self.block(orelse)?;
        let end = self.ops.len();
        for exit in exits {
          self.patch(exit, end);
        }
      }
      StmtKind::While { cond, body, orelse } => {
        let top = self.ops.len();
        let exit = self.emit(Op::JumpUnless(cond, usize::MAX), line);
        let breaks = self.looped(top, false, body, line)?;
        self.exhausted(exit, breaks, orelse)?;
      }
      StmtKind::For {
        target,
        iter,
        body,
        orelse,
      } => {
        self.emit(Op::Iterate(iter), line);
        let top = self.emit(
          Op::Next {
            target,
            exit: usize::MAX,
          },
          line,
        );
        let breaks = self.looped(top, true, body, line)?;
        self.exhausted(top, breaks, orelse)?;
      }
      StmtKind::Def(def) => {
        let FunctionDef { name, params, body } = def;
        let (names, defaults) = params
          .into_iter()
          .map(|param| (param.name, param.default))
          .unzip();
        let code = lower(
          self.module,
          self.source,
          &name,
          CodeKind::Function,
          names,
          body,
        )?;
        self.emit(Op::MakeFunction { code, defaults }, line);
      }
      StmtKind::Class(class) => {
        let ClassDef { name, bases, body } = class;
        let body = lower(
          self.module,
          self.source,
          &name,
          CodeKind::ClassBody,
          Vec::new(),
          body,
        )?;
        self.emit(Op::MakeClass { name, bases, body }, line);
      }
      StmtKind::Import { module, names } => {
        self.emit(Op::Import { module, names }, line);
      }
    }
    Ok(())
  }

  /// Lower a loop body that jumps back to `top`, returning its unpatched breaks.
  fn looped(
    &mut self,
    top: usize,
    iterates: bool,
    body: Vec<Stmt>,
    line: usize,
  ) -> TemplateResult<Vec<usize>> {
    self.loops.push(LoopContext {
      continue_to: top,
      breaks: Vec::new(),
      iterates,
    });
    self.block(body)?;
    self.emit(Op::Jump(top), line);
    Ok(self.loops.pop().map(|ctx| ctx.breaks).unwrap_or_default())
  }

  /// The loop's natural exit at `exit` falls into `orelse`; breaks skip it.
  fn exhausted(
    &mut self,
    exit: usize,
    breaks: Vec<usize>,
    orelse: Vec<Stmt>,
  ) -> TemplateResult<()> {
    let start = self.ops.len();
    self.patch(exit, start);
    self.block(orelse)?;
    let end = self.ops.len();
    for jump in breaks {
      self.patch(jump, end);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::parser::parse;

  fn compile(src: &str) -> TemplateResult<Arc<Code>> {
    let body = parse("t", src)?;
    compile_module("t", src, body)
  }

  fn function(src: &str) -> Arc<Code> {
    let module = compile(src).expect("source should compile");
    match &module.ops[0].op {
      Op::MakeFunction { code, .. } => Arc::clone(code),
      other => panic!("expected a function, got {other:?}"),
    }
  }

  #[test]
  fn for_loop_jumps_back_and_exits_past_the_body() {
    let code = function("def f(n):\n\tfor i in range(n):\n\t\tyield i\n");
    assert!(code.is_generator);
    assert_eq!(code.params, vec!["n".to_string()]);
    assert!(matches!(code.ops[0].op, Op::Iterate(_)));
    assert!(matches!(code.ops[1].op, Op::Next { exit: 4, .. }));
    assert!(matches!(code.ops[2].op, Op::Yield(_)));
    assert!(matches!(code.ops[3].op, Op::Jump(1)));
  }

  #[test]
  fn break_in_for_drops_the_iterator() {
    let code = function("def f(x):\n\tfor i in x:\n\t\tbreak\n\treturn 1\n");
    assert!(!code.is_generator);
    assert!(matches!(code.ops[2].op, Op::DropIter));
    assert!(matches!(code.ops[3].op, Op::Jump(5)));
    assert!(matches!(code.ops[5].op, Op::Return(Some(_))));
  }

  #[test]
  fn loop_else_runs_on_exhaustion_and_breaks_skip_it() {
    let code = function(
      "def f(x):\n\tfor i in x:\n\t\tif i:\n\t\t\tbreak\n\telse:\n\t\treturn 1\n\treturn 2\n",
    );
    assert!(matches!(code.ops[1].op, Op::Next { exit: 6, .. }));
    assert!(matches!(code.ops[2].op, Op::JumpUnless(_, 5)));
    assert!(matches!(code.ops[3].op, Op::DropIter));
    assert!(matches!(code.ops[4].op, Op::Jump(7)));
    assert!(matches!(code.ops[5].op, Op::Jump(1)));
    assert!(matches!(code.ops[6].op, Op::Return(Some(_))));
    assert!(matches!(code.ops[7].op, Op::Return(Some(_))));

    let code = function("def f(n):\n\twhile n:\n\t\tn -= 1\n\telse:\n\t\tyield 'done'\n");
    assert!(matches!(code.ops[0].op, Op::JumpUnless(_, 3)));
    assert!(matches!(code.ops[2].op, Op::Jump(0)));
    assert!(matches!(code.ops[3].op, Op::Yield(_)));
  }

  #[test]
  fn if_chain_patches_every_exit() {
    let code = function("def f(a):\n\tif a:\n\t\treturn 1\n\telif a:\n\t\treturn 2\n\telse:\n\t\treturn 3\n");
    assert!(matches!(code.ops[0].op, Op::JumpUnless(_, 3)));
    assert!(matches!(code.ops[2].op, Op::Jump(7)));
    assert!(matches!(code.ops[3].op, Op::JumpUnless(_, 6)));
    assert!(matches!(code.ops[5].op, Op::Jump(7)));
    assert_eq!(code.ops.len(), 7);
  }

  #[test]
  fn structural_misuse_is_a_compile_failure() {
    for (src, message) in [
      ("yield 1\n", "'yield' outside function"),
      ("return\n", "'return' outside function"),
      ("break\n", "'break' outside loop"),
      ("class C:\n\tyield 1\n", "'yield' outside function"),
      ("def f():\n\tcontinue\n", "'continue' not properly in loop"),
    ] {
      let err = compile(src).unwrap_err();
      assert!(
        matches!(&err, TemplateError::CompileFailure { message: m, .. } if m == message),
        "{src:?}: {err}"
      );
    }
  }
}
