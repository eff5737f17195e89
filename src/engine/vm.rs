//! Executor for lowered code.
//!
//! A `Frame` owns a program counter, its locals and the stack of live loop
//! iterators, so stopping at a `yield` is just returning from `run` and
//! resuming is calling it again. Generators wrap a suspended frame.

use std::cell::Cell;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use tracing::trace;

use crate::engine::ast::{BinaryOp, Expr, Target, UnaryOp};
use crate::engine::bytecode::{Code, CodeKind, Op};
use crate::engine::value::{
  Builtin, Class, Function, Globals, Instance, Namespace, Value, binary, compare,
  escape_module_member, lock, range_len,
};
use crate::error::{TemplateError, TemplateResult};
use crate::escape::{escape_attr, escape_text};

/// Module importable from generated source.
pub const ESCAPE_MODULE: &str = "detox.escape";

const MAX_DEPTH: usize = 64;

thread_local! {
  static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Counts nested frame executions on the current thread.
struct DepthGuard;

impl DepthGuard {
  fn enter() -> TemplateResult<Self> {
    DEPTH.with(|depth| {
      if depth.get() >= MAX_DEPTH {
        return Err(TemplateError::runtime("maximum recursion depth exceeded"));
      }
      depth.set(depth.get() + 1);
      Ok(DepthGuard)
    })
  }
}

impl Drop for DepthGuard {
  fn drop(&mut self) {
    DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
  }
}

#[derive(Debug)]
enum Scope {
  /// Names resolve to and bind in the module globals.
  Module,
  Local(Namespace),
}

/// Why `Frame::run` stopped.
#[derive(Debug)]
pub(crate) enum Step {
  Yield(Value),
  Return(Value),
}

#[derive(Debug)]
pub(crate) struct Frame {
  code: Arc<Code>,
  pc: usize,
  scope: Scope,
  iters: Vec<ValueIter>,
  globals: Globals,
}

impl Frame {
  /// Frame running a module body against `globals`.
  pub(crate) fn module(code: Arc<Code>, globals: Globals) -> Self {
    Self::new(code, Scope::Module, globals)
  }

  fn new(code: Arc<Code>, scope: Scope, globals: Globals) -> Self {
    Self {
      code,
      pc: 0,
      scope,
      iters: Vec::new(),
      globals,
    }
  }

  /// Frame for a call of `func` with its arguments already bound.
  pub(crate) fn call(
    func: &Function,
    receiver: Option<Value>,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
  ) -> TemplateResult<Self> {
    let globals = func.globals.upgrade().ok_or_else(|| {
      TemplateError::runtime(format!("{}() outlived its module", func.code.name))
    })?;
    let positional = receiver.into_iter().chain(args).collect();
    let locals = bind_arguments(func, positional, kwargs)?;
    Ok(Self::new(
      Arc::clone(&func.code),
      Scope::Local(locals),
      globals,
    ))
  }

  pub(crate) fn run(&mut self) -> TemplateResult<Step> {
    let _guard = DepthGuard::enter()?;
    let code = Arc::clone(&self.code);
    while let Some(instr) = code.ops.get(self.pc) {
      self.pc += 1;
      let step = self
        .exec(&instr.op)
        .map_err(|err| err.located(&code.name, instr.line))?;
      if let Some(step) = step {
        return Ok(step);
      }
    }
    Ok(Step::Return(Value::None))
  }

  fn exec(&mut self, op: &Op) -> TemplateResult<Option<Step>> {
    match op {
      Op::Eval(expr) => {
        self.eval(expr)?;
      }
      Op::Store(target, expr) => {
        let value = self.eval(expr)?;
        self.store(target, value)?;
      }
      Op::Update(target, op, expr) => self.update(target, *op, expr)?,
      Op::Yield(expr) => return Ok(Some(Step::Yield(self.eval(expr)?))),
      Op::Return(expr) => {
        let value = match expr {
          Some(expr) => self.eval(expr)?,
          None => Value::None,
        };
        self.iters.clear();
        return Ok(Some(Step::Return(value)));
      }
      Op::Jump(target) => self.pc = *target,
      Op::JumpUnless(cond, target) => {
        if !self.eval(cond)?.truthy() {
          self.pc = *target;
        }
      }
      Op::Iterate(expr) => {
        let value = self.eval(expr)?;
        self.iters.push(ValueIter::new(&value)?);
      }
      Op::Next { target, exit } => {
        let item = match self.iters.last_mut() {
          Some(iter) => iter.next_value()?,
          None => None,
        };
        match item {
          Some(value) => self.store(target, value)?,
          None => {
            self.iters.pop();
            self.pc = *exit;
          }
        }
      }
      Op::DropIter => {
        self.iters.pop();
      }
      Op::MakeFunction { code, defaults } => {
        let defaults = defaults
          .iter()
          .map(|default| default.as_ref().map(|expr| self.eval(expr)).transpose())
          .collect::<TemplateResult<Vec<_>>>()?;
        let captured = match (&self.scope, self.code.kind) {
          (Scope::Local(locals), CodeKind::Function) => locals.clone(),
          _ => Namespace::new(),
        };
        let func = Function {
          code: Arc::clone(code),
          defaults,
          captured,
          globals: Arc::downgrade(&self.globals),
        };
        self.store_name(&code.name, Value::Function(Arc::new(func)));
      }
      Op::MakeClass { name, bases, body } => {
        let bases = bases
          .iter()
          .map(|base| match self.eval(base)? {
            Value::Class(class) => Ok(class),
            other => Err(TemplateError::runtime(format!(
              "class {name} cannot inherit from '{}'",
              type_label(&other)
            ))),
          })
          .collect::<TemplateResult<Vec<_>>>()?;
        let mut frame = Frame::new(
          Arc::clone(body),
          Scope::Local(Namespace::new()),
          Arc::clone(&self.globals),
        );
        frame.run()?;
        let attrs = match frame.scope {
          Scope::Local(attrs) => attrs,
          Scope::Module => Namespace::new(),
        };
        let class = Class {
          name: name.clone(),
          bases,
          attrs,
        };
        self.store_name(name, Value::Class(Arc::new(class)));
      }
      Op::Import { module, names } => {
        if module != ESCAPE_MODULE {
          return Err(TemplateError::runtime(format!(
            "no module named '{module}'"
          )));
        }
        for (name, alias) in names {
          let builtin = escape_module_member(name).ok_or_else(|| {
            TemplateError::runtime(format!("cannot import name '{name}' from '{module}'"))
          })?;
          self.store_name(alias, Value::Builtin(builtin));
        }
      }
    }
    Ok(None)
  }

  fn load(&self, name: &str) -> TemplateResult<Value> {
    if let Scope::Local(locals) = &self.scope
      && let Some(value) = locals.get(name)
    {
      return Ok(value.clone());
    }
    let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
    if let Some(value) = globals.get(name) {
      return Ok(value.clone());
    }
    Builtin::lookup(name)
      .map(Value::Builtin)
      .ok_or_else(|| TemplateError::runtime(format!("name '{name}' is not defined")))
  }

  fn store_name(&mut self, name: &str, value: Value) {
    match &mut self.scope {
      Scope::Module => {
        let mut globals = self.globals.write().unwrap_or_else(PoisonError::into_inner);
        globals.insert(name.to_string(), value);
      }
      Scope::Local(locals) => {
        locals.insert(name.to_string(), value);
      }
    }
  }

  fn store(&mut self, target: &Target, value: Value) -> TemplateResult<()> {
    match target {
      Target::Name(name) => self.store_name(name, value),
      Target::Attr(object, name) => set_attr(&self.eval(object)?, name, value)?,
      Target::Index(container, index) => {
        let container = self.eval(container)?;
        let index = self.eval(index)?;
        set_item(&container, &index, value)?;
      }
      Target::Tuple(targets) => {
        let items = collect(&value)?;
        match items.len().cmp(&targets.len()) {
          Ordering::Less => {
            return Err(TemplateError::runtime(format!(
              "not enough values to unpack (expected {}, got {})",
              targets.len(),
              items.len()
            )));
          }
          Ordering::Greater => {
            return Err(TemplateError::runtime(format!(
              "too many values to unpack (expected {})",
              targets.len()
            )));
          }
          Ordering::Equal => {}
        }
        for (target, item) in targets.iter().zip(items) {
          self.store(target, item)?;
        }
      }
    }
    Ok(())
  }

  fn update(&mut self, target: &Target, op: BinaryOp, expr: &Expr) -> TemplateResult<()> {
    match target {
      Target::Name(name) => {
        let current = self.load(name)?;
        let value = augmented(op, &current, &self.eval(expr)?)?;
        self.store_name(name, value);
      }
      Target::Attr(object, name) => {
        let object = self.eval(object)?;
        let current = get_attr(&object, name)?;
        let value = augmented(op, &current, &self.eval(expr)?)?;
        set_attr(&object, name, value)?;
      }
      Target::Index(container, index) => {
        let container = self.eval(container)?;
        let index = self.eval(index)?;
        let current = get_item(&container, &index)?;
        let value = augmented(op, &current, &self.eval(expr)?)?;
        set_item(&container, &index, value)?;
      }
      Target::Tuple(_) => {
        return Err(TemplateError::runtime(
          "illegal expression for augmented assignment",
        ));
      }
    }
    Ok(())
  }

  fn eval_all(&self, exprs: &[Expr]) -> TemplateResult<Vec<Value>> {
    exprs.iter().map(|expr| self.eval(expr)).collect()
  }

  fn eval(&self, expr: &Expr) -> TemplateResult<Value> {
    match expr {
      Expr::Const(constant) => Ok(Value::from(constant)),
      Expr::Name(name) => self.load(name),
      Expr::List(items) => Ok(Value::list(self.eval_all(items)?)),
      Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items)?)),
      Expr::Dict(entries) => {
        let mut pairs = Vec::with_capacity(entries.len());
        for (key, value) in entries {
          let key = self.eval(key)?;
          let Value::Str(key) = key else {
            return Err(TemplateError::runtime(format!(
              "dict keys must be str, not '{}'",
              key.type_name()
            )));
          };
          pairs.push((key.to_string(), self.eval(value)?));
        }
        Ok(Value::dict(pairs))
      }
      Expr::Attr { value, name } => get_attr(&self.eval(value)?, name),
      Expr::Index { value, index } => get_item(&self.eval(value)?, &self.eval(index)?),
      Expr::Call { func, args, kwargs } => {
        let func = self.eval(func)?;
        let args = self.eval_all(args)?;
        let kwargs = kwargs
          .iter()
          .map(|(name, expr)| Ok((name.clone(), self.eval(expr)?)))
          .collect::<TemplateResult<Vec<_>>>()?;
        call(&func, args, kwargs)
      }
      Expr::Unary { op, operand } => unary(*op, &self.eval(operand)?),
      Expr::Binary { op, lhs, rhs } => {
        let lhs = self.eval(lhs)?;
        let rhs = self.eval(rhs)?;
        match (op, &rhs) {
          (BinaryOp::In | BinaryOp::NotIn, Value::Generator(_)) => {
            let found = collect(&rhs)?.iter().any(|item| item.equals(&lhs));
            Ok(Value::Bool(found == (*op == BinaryOp::In)))
          }
          _ => binary(*op, &lhs, &rhs),
        }
      }
      Expr::And(lhs, rhs) => {
        let lhs = self.eval(lhs)?;
        if lhs.truthy() { self.eval(rhs) } else { Ok(lhs) }
      }
      Expr::Or(lhs, rhs) => {
        let lhs = self.eval(lhs)?;
        if lhs.truthy() { Ok(lhs) } else { self.eval(rhs) }
      }
      Expr::IfElse { cond, then, orelse } => {
        if self.eval(cond)?.truthy() {
          self.eval(then)
        } else {
          self.eval(orelse)
        }
      }
    }
  }
}

#[derive(Debug)]
enum GeneratorState {
  Suspended(Box<Frame>),
  Finished,
}

/// A paused function body that produces values on demand.
#[derive(Debug)]
pub struct Generator {
  name: String,
  state: GeneratorState,
}

impl Generator {
  pub(crate) fn new(frame: Frame) -> Self {
    Self {
      name: frame.code.name.clone(),
      state: GeneratorState::Suspended(Box::new(frame)),
    }
  }

  /// Name of the function whose body is being run.
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_finished(&self) -> bool {
    matches!(self.state, GeneratorState::Finished)
  }

  /// Run until the next yielded value. `None` once the body has returned;
  /// after an error the generator is finished as well.
  pub fn resume(&mut self) -> TemplateResult<Option<Value>> {
    let GeneratorState::Suspended(mut frame) =
      std::mem::replace(&mut self.state, GeneratorState::Finished)
    else {
      return Ok(None);
    };
    match frame.run()? {
      Step::Yield(value) => {
        trace!(generator = %self.name, pc = frame.pc, "yield");
        self.state = GeneratorState::Suspended(frame);
        Ok(Some(value))
      }
      Step::Return(_) => {
        trace!(generator = %self.name, "finished");
        Ok(None)
      }
    }
  }
}

fn resume_shared(generator: &Mutex<Generator>) -> TemplateResult<Option<Value>> {
  match generator.try_lock() {
    Ok(mut generator) => generator.resume(),
    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().resume(),
    Err(TryLockError::WouldBlock) => Err(TemplateError::runtime("generator already executing")),
  }
}

/// A live `for` loop iterator.
#[derive(Debug)]
pub(crate) enum ValueIter {
  Items(std::vec::IntoIter<Value>),
  Range { next: i64, remaining: i64, step: i64 },
  Generator(Arc<Mutex<Generator>>),
}

impl ValueIter {
  /// Lists, tuples and dicts are iterated over a snapshot taken here.
  pub(crate) fn new(value: &Value) -> TemplateResult<Self> {
    let items = match value {
      Value::Str(s) => s.chars().map(|c| Value::from(c.to_string())).collect(),
      Value::List(items) => lock(items).clone(),
      Value::Tuple(items) => items.to_vec(),
      Value::Dict(entries) => lock(entries)
        .keys()
        .map(|key| Value::from(key.as_str()))
        .collect(),
      Value::Range { start, step, .. } => {
        return Ok(Self::Range {
          next: *start,
          remaining: range_len(value),
          step: *step,
        });
      }
      Value::Generator(generator) => return Ok(Self::Generator(Arc::clone(generator))),
      other => {
        return Err(TemplateError::runtime(format!(
          "'{}' object is not iterable",
          type_label(other)
        )));
      }
    };
    Ok(Self::Items(items.into_iter()))
  }

  pub(crate) fn next_value(&mut self) -> TemplateResult<Option<Value>> {
    match self {
      Self::Items(items) => Ok(items.next()),
      Self::Range {
        next,
        remaining,
        step,
      } => {
        if *remaining <= 0 {
          return Ok(None);
        }
        let value = *next;
        *remaining -= 1;
        *next = next.wrapping_add(*step);
        Ok(Some(Value::Int(value)))
      }
      Self::Generator(generator) => resume_shared(generator),
    }
  }
}

/// Drain any iterable into a vector.
pub(crate) fn collect(value: &Value) -> TemplateResult<Vec<Value>> {
  let mut iter = ValueIter::new(value)?;
  let mut items = Vec::new();
  while let Some(item) = iter.next_value()? {
    items.push(item);
  }
  Ok(items)
}

fn type_label(value: &Value) -> String {
  match value {
    Value::Instance(instance) => instance.class.name.clone(),
    other => other.type_name().to_string(),
  }
}

fn bind_arguments(
  func: &Function,
  positional: Vec<Value>,
  kwargs: Vec<(String, Value)>,
) -> TemplateResult<Namespace> {
  let code = &func.code;
  let params = &code.params;
  if positional.len() > params.len() {
    return Err(TemplateError::runtime(format!(
      "{}() takes {} positional arguments but {} were given",
      code.name,
      params.len(),
      positional.len()
    )));
  }
  let mut slots: Vec<Option<Value>> = positional.into_iter().map(Some).collect();
  slots.resize(params.len(), None);
  for (name, value) in kwargs {
    let Some(index) = params.iter().position(|param| *param == name) else {
      return Err(TemplateError::runtime(format!(
        "{}() got an unexpected keyword argument '{name}'",
        code.name
      )));
    };
    if slots[index].is_some() {
      return Err(TemplateError::runtime(format!(
        "{}() got multiple values for argument '{name}'",
        code.name
      )));
    }
    slots[index] = Some(value);
  }

  let mut locals = func.captured.clone();
  for ((param, slot), default) in params.iter().zip(slots).zip(&func.defaults) {
    let value = slot.or_else(|| default.clone()).ok_or_else(|| {
      TemplateError::runtime(format!(
        "{}() missing required argument: '{param}'",
        code.name
      ))
    })?;
    locals.insert(param.clone(), value);
  }
  Ok(locals)
}

/// Start a call of `func` without running any of its body.
pub(crate) fn start(
  func: &Value,
  args: Vec<Value>,
  kwargs: Vec<(String, Value)>,
) -> TemplateResult<Generator> {
  let frame = match func {
    Value::Function(func) => Frame::call(func, None, args, kwargs)?,
    Value::Method(receiver, func) => Frame::call(func, Some((**receiver).clone()), args, kwargs)?,
    other => {
      return Err(TemplateError::runtime(format!(
        "'{}' object is not a template function",
        type_label(other)
      )));
    }
  };
  Ok(Generator::new(frame))
}

fn invoke(
  func: &Function,
  receiver: Option<Value>,
  args: Vec<Value>,
  kwargs: Vec<(String, Value)>,
) -> TemplateResult<Value> {
  trace!(function = %func.code.name, "call");
  let mut frame = Frame::call(func, receiver, args, kwargs)?;
  if func.code.is_generator {
    let generator = Generator::new(frame);
    return Ok(Value::Generator(Arc::new(Mutex::new(generator))));
  }
  match frame.run()? {
    Step::Return(value) => Ok(value),
    Step::Yield(_) => Err(TemplateError::runtime(format!(
      "{}() yielded outside of a generator",
      func.code.name
    ))),
  }
}

/// Call any callable value.
pub(crate) fn call(
  func: &Value,
  args: Vec<Value>,
  kwargs: Vec<(String, Value)>,
) -> TemplateResult<Value> {
  match func {
    Value::Function(func) => invoke(func, None, args, kwargs),
    Value::Method(receiver, func) => invoke(func, Some((**receiver).clone()), args, kwargs),
    Value::Builtin(builtin) => {
      no_keywords(builtin.name(), &kwargs)?;
      call_builtin(*builtin, args)
    }
    Value::BuiltinMethod(receiver, name) => {
      no_keywords(name, &kwargs)?;
      call_method(receiver, name, args)
    }
    Value::Class(class) => instantiate(class, args, kwargs),
    other => Err(TemplateError::runtime(format!(
      "'{}' object is not callable",
      type_label(other)
    ))),
  }
}

fn instantiate(
  class: &Arc<Class>,
  args: Vec<Value>,
  kwargs: Vec<(String, Value)>,
) -> TemplateResult<Value> {
  let instance = Value::Instance(Arc::new(Instance {
    class: Arc::clone(class),
    attrs: Mutex::new(Namespace::new()),
  }));
  match class.lookup("__init__") {
    Some(Value::Function(init)) => {
      invoke(&init, Some(instance.clone()), args, kwargs)?;
    }
    Some(other) => {
      return Err(TemplateError::runtime(format!(
        "{}.__init__ must be a function, not '{}'",
        class.name,
        type_label(&other)
      )));
    }
    None if !args.is_empty() || !kwargs.is_empty() => {
      return Err(TemplateError::runtime(format!(
        "{}() takes no arguments",
        class.name
      )));
    }
    None => {}
  }
  Ok(instance)
}

fn get_attr(value: &Value, name: &str) -> TemplateResult<Value> {
  let found = match value {
    Value::Instance(instance) => {
      let own = lock(&instance.attrs).get(name).cloned();
      own.or_else(|| {
        instance.class.lookup(name).map(|attr| match attr {
          Value::Function(func) => Value::Method(Box::new(value.clone()), func),
          other => other,
        })
      })
    }
    Value::Class(class) => class.lookup(name),
    other => other.builtin_method(name),
  };
  found.ok_or_else(|| {
    TemplateError::runtime(format!(
      "'{}' object has no attribute '{name}'",
      type_label(value)
    ))
  })
}

fn set_attr(object: &Value, name: &str, value: Value) -> TemplateResult<()> {
  match object {
    Value::Instance(instance) => {
      lock(&instance.attrs).insert(name.to_string(), value);
      Ok(())
    }
    other => Err(TemplateError::runtime(format!(
      "cannot set attribute '{name}' on '{}' object",
      type_label(other)
    ))),
  }
}

/// Resolve a possibly negative index against `len`.
fn position(index: i64, len: usize) -> Option<usize> {
  let len = i64::try_from(len).ok()?;
  let index = if index < 0 { index + len } else { index };
  if (0..len).contains(&index) {
    usize::try_from(index).ok()
  } else {
    None
  }
}

fn get_item(container: &Value, index: &Value) -> TemplateResult<Value> {
  let out_of_range = || {
    TemplateError::runtime(format!("{} index out of range", container.type_name()))
  };
  match (container, index) {
    (Value::List(items), Value::Int(i)) => {
      let items = lock(items);
      position(*i, items.len())
        .map(|i| items[i].clone())
        .ok_or_else(out_of_range)
    }
    (Value::Tuple(items), Value::Int(i)) => position(*i, items.len())
      .map(|i| items[i].clone())
      .ok_or_else(out_of_range),
    (Value::Str(s), Value::Int(i)) => {
      let chars: Vec<char> = s.chars().collect();
      position(*i, chars.len())
        .map(|i| Value::from(chars[i].to_string()))
        .ok_or_else(out_of_range)
    }
    (Value::Range { start, step, .. }, Value::Int(i)) => {
      let len = usize::try_from(range_len(container)).unwrap_or(0);
      position(*i, len)
        .and_then(|i| i64::try_from(i).ok())
        .map(|i| Value::Int(start + i * step))
        .ok_or_else(out_of_range)
    }
    (Value::Dict(entries), key) => key
      .as_str()
      .and_then(|k| lock(entries).get(k).cloned())
      .ok_or_else(|| TemplateError::runtime(format!("KeyError: {}", key.repr()))),
    (Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range { .. }, other) => {
      Err(TemplateError::runtime(format!(
        "{} indices must be integers, not '{}'",
        container.type_name(),
        other.type_name()
      )))
    }
    (other, _) => Err(TemplateError::runtime(format!(
      "'{}' object is not subscriptable",
      type_label(other)
    ))),
  }
}

fn set_item(container: &Value, index: &Value, value: Value) -> TemplateResult<()> {
  match (container, index) {
    (Value::List(items), Value::Int(i)) => {
      let mut items = lock(items);
      let slot = position(*i, items.len())
        .ok_or_else(|| TemplateError::runtime("list assignment index out of range"))?;
      items[slot] = value;
      Ok(())
    }
    (Value::Dict(entries), Value::Str(key)) => {
      lock(entries).insert(key.to_string(), value);
      Ok(())
    }
    (Value::Dict(_), other) => Err(TemplateError::runtime(format!(
      "dict keys must be str, not '{}'",
      other.type_name()
    ))),
    (other, _) => Err(TemplateError::runtime(format!(
      "'{}' object does not support item assignment",
      type_label(other)
    ))),
  }
}

/// `lhs op= rhs`; lists are extended in place.
fn augmented(op: BinaryOp, lhs: &Value, rhs: &Value) -> TemplateResult<Value> {
  if let (BinaryOp::Add, Value::List(items)) = (op, lhs) {
    let extra = collect(rhs)?;
    lock(items).extend(extra);
    return Ok(lhs.clone());
  }
  binary(op, lhs, rhs)
}

fn unary(op: UnaryOp, operand: &Value) -> TemplateResult<Value> {
  let symbol = match op {
    UnaryOp::Not => return Ok(Value::Bool(!operand.truthy())),
    UnaryOp::Neg => "-",
    UnaryOp::Pos => "+",
  };
  match (op, operand) {
    (UnaryOp::Neg, Value::Int(i)) => i
      .checked_neg()
      .map(Value::Int)
      .ok_or_else(|| TemplateError::runtime("integer overflow")),
    (UnaryOp::Neg, Value::Bool(b)) => Ok(Value::Int(-i64::from(*b))),
    (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
    (UnaryOp::Pos, Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
    (UnaryOp::Pos, Value::Int(_) | Value::Float(_)) => Ok(operand.clone()),
    _ => Err(TemplateError::runtime(format!(
      "bad operand type for unary {symbol}: '{}'",
      type_label(operand)
    ))),
  }
}

fn no_keywords(name: &str, kwargs: &[(String, Value)]) -> TemplateResult<()> {
  if kwargs.is_empty() {
    Ok(())
  } else {
    Err(TemplateError::runtime(format!(
      "{name}() takes no keyword arguments"
    )))
  }
}

fn arity_error(name: &str, min: usize, max: usize, given: usize) -> TemplateError {
  let expected = match (min, max) {
    (1, 1) => "exactly 1 argument".to_string(),
    (min, max) if min == max => format!("exactly {min} arguments"),
    (min, usize::MAX) => format!("at least {min} arguments"),
    (min, max) => format!("from {min} to {max} arguments"),
  };
  TemplateError::runtime(format!("{name}() takes {expected} ({given} given)"))
}

fn exact<const N: usize>(name: &str, args: Vec<Value>) -> TemplateResult<[Value; N]> {
  <[Value; N]>::try_from(args).map_err(|args| arity_error(name, N, N, args.len()))
}

fn optional(name: &str, args: Vec<Value>) -> TemplateResult<Option<Value>> {
  if args.len() > 1 {
    return Err(arity_error(name, 0, 1, args.len()));
  }
  Ok(args.into_iter().next())
}

fn int_arg(value: &Value) -> TemplateResult<i64> {
  match value {
    Value::Int(i) => Ok(*i),
    Value::Bool(b) => Ok(i64::from(*b)),
    other => Err(TemplateError::runtime(format!(
      "'{}' object cannot be interpreted as an integer",
      type_label(other)
    ))),
  }
}

fn str_arg<'a>(name: &str, value: &'a Value) -> TemplateResult<&'a str> {
  value.as_str().ok_or_else(|| {
    TemplateError::runtime(format!(
      "{name}() argument must be str, not '{}'",
      type_label(value)
    ))
  })
}

fn length(value: &Value) -> TemplateResult<usize> {
  match value {
    Value::Str(s) => Ok(s.chars().count()),
    Value::List(items) => Ok(lock(items).len()),
    Value::Tuple(items) => Ok(items.len()),
    Value::Dict(entries) => Ok(lock(entries).len()),
    Value::Range { .. } => Ok(usize::try_from(range_len(value)).unwrap_or(0)),
    other => Err(TemplateError::runtime(format!(
      "object of type '{}' has no len()",
      type_label(other)
    ))),
  }
}

fn to_int(value: &Value) -> TemplateResult<Value> {
  match value {
    Value::Int(_) => Ok(value.clone()),
    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
    Value::Float(f) => {
      let truncated = f.trunc();
      if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
        Ok(Value::Int(truncated as i64))
      } else {
        Err(TemplateError::runtime(format!(
          "cannot convert float {} to integer",
          value.repr()
        )))
      }
    }
    Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
      TemplateError::runtime(format!(
        "invalid literal for int() with base 10: {}",
        value.repr()
      ))
    }),
    other => Err(TemplateError::runtime(format!(
      "int() argument must be a string or a number, not '{}'",
      type_label(other)
    ))),
  }
}

fn to_float(value: &Value) -> TemplateResult<Value> {
  match value {
    Value::Float(_) => Ok(value.clone()),
    Value::Int(i) => Ok(Value::Float(*i as f64)),
    Value::Bool(b) => Ok(Value::Float(f64::from(u8::from(*b)))),
    Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
      TemplateError::runtime(format!(
        "could not convert string to float: {}",
        value.repr()
      ))
    }),
    other => Err(TemplateError::runtime(format!(
      "float() argument must be a string or a number, not '{}'",
      type_label(other)
    ))),
  }
}

fn call_builtin(builtin: Builtin, args: Vec<Value>) -> TemplateResult<Value> {
  let name = builtin.name();
  match builtin {
    Builtin::Str => Ok(match optional(name, args)? {
      Some(value) => Value::from(value.to_string()),
      None => Value::from(""),
    }),
    Builtin::Repr => {
      let [value] = exact::<1>(name, args)?;
      Ok(Value::from(value.repr()))
    }
    Builtin::Int => match optional(name, args)? {
      Some(value) => to_int(&value),
      None => Ok(Value::Int(0)),
    },
    Builtin::Float => match optional(name, args)? {
      Some(value) => to_float(&value),
      None => Ok(Value::Float(0.0)),
    },
    Builtin::Bool => Ok(Value::Bool(
      optional(name, args)?.is_some_and(|value| value.truthy()),
    )),
    Builtin::Len => {
      let [value] = exact::<1>(name, args)?;
      let len = length(&value)?;
      Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
    }
    Builtin::Range => {
      let bounds = args.iter().map(int_arg).collect::<TemplateResult<Vec<_>>>()?;
      let (start, stop, step) = match bounds[..] {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        _ => return Err(arity_error(name, 1, 3, bounds.len())),
      };
      if step == 0 {
        return Err(TemplateError::runtime("range() arg 3 must not be zero"));
      }
      Ok(Value::Range { start, stop, step })
    }
    Builtin::List => Ok(Value::list(match optional(name, args)? {
      Some(iterable) => collect(&iterable)?,
      None => Vec::new(),
    })),
    Builtin::Enumerate => {
      let (iterable, start) = match <[Value; 2]>::try_from(args) {
        Ok([iterable, start]) => (iterable, int_arg(&start)?),
        Err(args) => {
          let given = args.len();
          let [iterable] = <[Value; 1]>::try_from(args)
            .map_err(|_| arity_error(name, 1, 2, given))?;
          (iterable, 0)
        }
      };
      let pairs = collect(&iterable)?
        .into_iter()
        .zip(start..)
        .map(|(item, index)| Value::tuple(vec![Value::Int(index), item]))
        .collect();
      Ok(Value::list(pairs))
    }
    Builtin::Abs => {
      let [value] = exact::<1>(name, args)?;
      match value {
        Value::Int(i) => i
          .checked_abs()
          .map(Value::Int)
          .ok_or_else(|| TemplateError::runtime("integer overflow")),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(TemplateError::runtime(format!(
          "bad operand type for abs(): '{}'",
          type_label(&other)
        ))),
      }
    }
    Builtin::Min | Builtin::Max => {
      let candidates = match <[Value; 1]>::try_from(args) {
        Ok([iterable]) => collect(&iterable)?,
        Err(args) => args,
      };
      let wanted = if builtin == Builtin::Min {
        Ordering::Less
      } else {
        Ordering::Greater
      };
      let mut candidates = candidates.into_iter();
      let Some(mut best) = candidates.next() else {
        return Err(TemplateError::runtime(format!(
          "{name}() arg is an empty sequence"
        )));
      };
      for candidate in candidates {
        if compare(&candidate, &best)? == wanted {
          best = candidate;
        }
      }
      Ok(best)
    }
    Builtin::EscapeText => {
      let [value] = exact::<1>(name, args)?;
      Ok(Value::from(escape_text(&value.to_string())))
    }
    Builtin::EscapeAttr => {
      let [value] = exact::<1>(name, args)?;
      Ok(Value::from(escape_attr(&value.to_string())))
    }
  }
}

fn call_method(receiver: &Value, name: &str, args: Vec<Value>) -> TemplateResult<Value> {
  match receiver {
    Value::Str(s) => str_method(s, name, args),
    Value::List(items) => match name {
      "append" => {
        let [item] = exact::<1>(name, args)?;
        lock(items).push(item);
        Ok(Value::None)
      }
      "extend" => {
        let [iterable] = exact::<1>(name, args)?;
        let extra = collect(&iterable)?;
        lock(items).extend(extra);
        Ok(Value::None)
      }
      _ => Err(no_method(receiver, name)),
    },
    Value::Dict(entries) => match name {
      "get" => {
        let (key, default) = match <[Value; 2]>::try_from(args) {
          Ok([key, default]) => (key, default),
          Err(args) => {
            let given = args.len();
            let [key] =
              <[Value; 1]>::try_from(args).map_err(|_| arity_error(name, 1, 2, given))?;
            (key, Value::None)
          }
        };
        let found = key.as_str().and_then(|key| lock(entries).get(key).cloned());
        Ok(found.unwrap_or(default))
      }
      "items" => {
        exact::<0>(name, args)?;
        let pairs = lock(entries)
          .iter()
          .map(|(key, value)| Value::tuple(vec![Value::from(key.as_str()), value.clone()]))
          .collect();
        Ok(Value::list(pairs))
      }
      "keys" => {
        exact::<0>(name, args)?;
        let keys = lock(entries)
          .keys()
          .map(|key| Value::from(key.as_str()))
          .collect();
        Ok(Value::list(keys))
      }
      "values" => {
        exact::<0>(name, args)?;
        let values = lock(entries).values().cloned().collect();
        Ok(Value::list(values))
      }
      _ => Err(no_method(receiver, name)),
    },
    other => Err(no_method(other, name)),
  }
}

fn no_method(receiver: &Value, name: &str) -> TemplateError {
  TemplateError::runtime(format!(
    "'{}' object has no attribute '{name}'",
    type_label(receiver)
  ))
}

fn str_method(s: &str, name: &str, args: Vec<Value>) -> TemplateResult<Value> {
  match name {
    "upper" => {
      exact::<0>(name, args)?;
      Ok(Value::from(s.to_uppercase()))
    }
    "lower" => {
      exact::<0>(name, args)?;
      Ok(Value::from(s.to_lowercase()))
    }
    "strip" => match optional(name, args)? {
      None | Some(Value::None) => Ok(Value::from(s.trim())),
      Some(chars) => {
        let chars = str_arg(name, &chars)?;
        Ok(Value::from(s.trim_matches(|c| chars.contains(c))))
      }
    },
    "join" => {
      let [iterable] = exact::<1>(name, args)?;
      let parts = collect(&iterable)?;
      let mut out = String::new();
      for (index, part) in parts.iter().enumerate() {
        let Some(part) = part.as_str() else {
          return Err(TemplateError::runtime(format!(
            "sequence item {index}: expected str instance, {} found",
            type_label(part)
          )));
        };
        if index > 0 {
          out.push_str(s);
        }
        out.push_str(part);
      }
      Ok(Value::from(out))
    }
    "replace" => {
      let [old, new] = exact::<2>(name, args)?;
      let (old, new) = (str_arg(name, &old)?, str_arg(name, &new)?);
      Ok(Value::from(s.replace(old, new)))
    }
    "startswith" | "endswith" => {
      let [affix] = exact::<1>(name, args)?;
      let affix = str_arg(name, &affix)?;
      let found = if name == "startswith" {
        s.starts_with(affix)
      } else {
        s.ends_with(affix)
      };
      Ok(Value::Bool(found))
    }
    "split" => {
      let parts: Vec<Value> = match optional(name, args)? {
        None | Some(Value::None) => s.split_whitespace().map(Value::from).collect(),
        Some(sep) => {
          let sep = str_arg(name, &sep)?;
          if sep.is_empty() {
            return Err(TemplateError::runtime("empty separator"));
          }
          s.split(sep).map(Value::from).collect()
        }
      };
      Ok(Value::list(parts))
    }
    _ => Err(no_method(&Value::from(s), name)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::bytecode::compile_module;
  use crate::engine::parser::parse;
  use std::sync::RwLock;

  fn run(src: &str) -> TemplateResult<Globals> {
    let body = parse("t", src)?;
    let code = compile_module("t", src, body)?;
    let globals: Globals = Arc::new(RwLock::new(Namespace::new()));
    Frame::module(code, Arc::clone(&globals)).run()?;
    Ok(globals)
  }

  fn global(src: &str, name: &str) -> Value {
    let globals = run(src).expect("source should run");
    let value = globals.read().expect("unpoisoned").get(name).cloned();
    value.unwrap_or_else(|| panic!("{name} not bound"))
  }

  fn drain(generator: &mut Generator) -> Vec<Value> {
    let mut out = Vec::new();
    while let Some(value) = generator.resume().expect("resumes") {
      out.push(value);
    }
    out
  }

  #[test]
  fn module_code_binds_globals() {
    assert_eq!(global("x = 40 + 2\n", "x"), Value::Int(42));
    assert_eq!(
      global("a, b = 'xy'\nc = b + a\n", "c"),
      Value::from("yx")
    );
  }

  #[test]
  fn generators_resume_where_they_stopped() {
    let globals = run("def f(n):\n\ti = 0\n\twhile i < n:\n\t\tyield i\n\t\ti += 1\n")
      .expect("defines f");
    let f = globals.read().expect("unpoisoned").get("f").cloned();
    let mut generator = start(&f.expect("f bound"), vec![Value::Int(3)], Vec::new())
      .expect("starts");
    assert_eq!(generator.name(), "f");
    assert_eq!(drain(&mut generator), vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
    assert!(generator.is_finished());
    assert_eq!(generator.resume().expect("stays finished"), None);
  }

  #[test]
  fn nested_generators_and_break() {
    let src = "def inner():\n\tyield 1\n\tyield 2\n\tyield 3\n\
               out = []\nfor x in inner():\n\tif x == 3:\n\t\tbreak\n\tout.append(x)\n";
    assert_eq!(
      global(src, "out"),
      Value::list(vec![Value::Int(1), Value::Int(2)])
    );
  }

  #[test]
  fn classes_bind_methods_and_inherit() {
    let src = "class Base:\n\tgreeting = 'hi'\n\tdef __init__(self, name):\n\t\tself.name = name\n\
               \tdef greet(self):\n\t\treturn self.greeting + ' ' + self.name\n\
               class Loud(Base):\n\tgreeting = 'HEY'\n\
               r = Loud('bob').greet()\n";
    assert_eq!(global(src, "r"), Value::from("HEY bob"));
  }

  #[test]
  fn closures_capture_enclosing_locals() {
    let src = "def outer(x):\n\tdef inner(y=1):\n\t\treturn x + y\n\treturn inner\n\
               r = outer(10)(y=5)\n";
    assert_eq!(global(src, "r"), Value::Int(15));
  }

  #[test]
  fn builtins_and_methods() {
    let src = "from detox.escape import escape_text\n\
               d = {'a': 1}\nd['b'] = 2\n\
               ks = ','.join(d.keys())\n\
               total = 0\n\
               for k, v in d.items():\n\ttotal += v\n\
               words = ' a  b '.split()\n\
               m = max([3, 9, 2])\n\
               e = list(enumerate('xy', 1))\n\
               esc = escape_text('<b>')\n";
    let globals = run(src).expect("runs");
    let globals = globals.read().expect("unpoisoned");
    assert_eq!(globals["ks"], Value::from("a,b"));
    assert_eq!(globals["total"], Value::Int(3));
    assert_eq!(globals["words"], Value::list(vec![Value::from("a"), Value::from("b")]));
    assert_eq!(globals["m"], Value::Int(9));
    assert_eq!(globals["e"].repr(), "[(1, 'x'), (2, 'y')]");
    assert_eq!(globals["esc"], Value::from("&lt;b&gt;"));
  }

  #[test]
  fn runtime_failures_carry_function_and_line() {
    let err = run("def f():\n\treturn 1 // 0\nx = f()\n").unwrap_err();
    assert_eq!(err.to_string(), "f:2: integer division or modulo by zero");
    let err = run("y = undefined\n").unwrap_err();
    assert_eq!(err.to_string(), "<module>:1: name 'undefined' is not defined");
  }

  #[test]
  fn unknown_imports_fail() {
    let err = run("from os import path\n").unwrap_err();
    assert!(err.to_string().contains("no module named 'os'"));
    let err = run("from detox.escape import nope\n").unwrap_err();
    assert!(err.to_string().contains("cannot import name 'nope'"));
  }

  #[test]
  fn runaway_recursion_is_reported() {
    let err = run("def f(n):\n\treturn f(n + 1)\nf(0)\n").unwrap_err();
    assert!(err.to_string().contains("maximum recursion depth exceeded"));
  }

  #[test]
  fn argument_binding_errors() {
    let err = run("def f(a, b=2):\n\treturn a\nf()\n").unwrap_err();
    assert!(err.to_string().contains("f() missing required argument: 'a'"));
    let err = run("def f(a):\n\treturn a\nf(1, a=2)\n").unwrap_err();
    assert!(err.to_string().contains("got multiple values for argument 'a'"));
    let err = run("def f(a):\n\treturn a\nf(1, 2)\n").unwrap_err();
    assert!(err.to_string().contains("takes 1 positional arguments but 2 were given"));
  }
}
