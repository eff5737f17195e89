//! Runtime values of the execution engine.
//!
//! Everything is reference counted with `Arc` and mutable containers sit
//! behind a `Mutex`, so a loaded module and the sequences it hands out can be
//! moved across threads.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use indexmap::IndexMap;

use crate::engine::ast::{BinaryOp, Constant};
use crate::engine::bytecode::Code;
use crate::engine::vm::Generator;
use crate::error::{TemplateError, TemplateResult};

pub type Namespace = IndexMap<String, Value>;
pub type Globals = Arc<RwLock<Namespace>>;

/// Lock a mutex, ignoring poisoning: values stay consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
  Str,
  Repr,
  Int,
  Float,
  Bool,
  Len,
  Range,
  List,
  Enumerate,
  Abs,
  Min,
  Max,
  EscapeText,
  EscapeAttr,
}

impl Builtin {
  pub fn lookup(name: &str) -> Option<Builtin> {
    let builtin = match name {
      "str" => Self::Str,
      "repr" => Self::Repr,
      "int" => Self::Int,
      "float" => Self::Float,
      "bool" => Self::Bool,
      "len" => Self::Len,
      "range" => Self::Range,
      "list" => Self::List,
      "enumerate" => Self::Enumerate,
      "abs" => Self::Abs,
      "min" => Self::Min,
      "max" => Self::Max,
      _ => return None,
    };
    Some(builtin)
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::Str => "str",
      Self::Repr => "repr",
      Self::Int => "int",
      Self::Float => "float",
      Self::Bool => "bool",
      Self::Len => "len",
      Self::Range => "range",
      Self::List => "list",
      Self::Enumerate => "enumerate",
      Self::Abs => "abs",
      Self::Min => "min",
      Self::Max => "max",
      Self::EscapeText => "escape_text",
      Self::EscapeAttr => "escape_attr",
    }
  }
}

/// Names importable from `detox.escape`.
pub fn escape_module_member(name: &str) -> Option<Builtin> {
  match name {
    "escape_text" => Some(Builtin::EscapeText),
    "escape_attr" => Some(Builtin::EscapeAttr),
    _ => None,
  }
}

const STR_METHODS: [&str; 8] = [
  "upper",
  "lower",
  "strip",
  "join",
  "replace",
  "startswith",
  "endswith",
  "split",
];
const LIST_METHODS: [&str; 2] = ["append", "extend"];
const DICT_METHODS: [&str; 4] = ["get", "items", "keys", "values"];

#[derive(Debug)]
pub struct Function {
  pub code: Arc<Code>,
  /// Default values aligned with `code.params`.
  pub defaults: Vec<Option<Value>>,
  /// Enclosing locals at definition time.
  pub captured: Namespace,
  pub globals: Weak<RwLock<Namespace>>,
}

#[derive(Debug)]
pub struct Class {
  pub name: String,
  pub bases: Vec<Arc<Class>>,
  pub attrs: Namespace,
}

impl Class {
  /// Attribute lookup through the class and its bases, depth first.
  pub fn lookup(&self, name: &str) -> Option<Value> {
    self
      .attrs
      .get(name)
      .cloned()
      .or_else(|| self.bases.iter().find_map(|base| base.lookup(name)))
  }
}

#[derive(Debug)]
pub struct Instance {
  pub class: Arc<Class>,
  pub attrs: Mutex<Namespace>,
}

#[derive(Debug, Clone)]
pub enum Value {
  None,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(Arc<str>),
  List(Arc<Mutex<Vec<Value>>>),
  Tuple(Arc<[Value]>),
  /// Dictionaries are keyed by strings and keep insertion order.
  Dict(Arc<Mutex<IndexMap<String, Value>>>),
  Range {
    start: i64,
    stop: i64,
    step: i64,
  },
  Function(Arc<Function>),
  Builtin(Builtin),
  /// A function bound to its receiver (`self`).
  Method(Box<Value>, Arc<Function>),
  BuiltinMethod(Box<Value>, &'static str),
  Class(Arc<Class>),
  Instance(Arc<Instance>),
  Generator(Arc<Mutex<Generator>>),
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Self::Str(Arc::from(value))
  }
}

impl From<String> for Value {
  fn from(value: String) -> Self {
    Self::Str(Arc::from(value))
  }
}

impl From<i64> for Value {
  fn from(value: i64) -> Self {
    Self::Int(value)
  }
}

impl From<f64> for Value {
  fn from(value: f64) -> Self {
    Self::Float(value)
  }
}

impl From<bool> for Value {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

impl From<Vec<Value>> for Value {
  fn from(value: Vec<Value>) -> Self {
    Self::list(value)
  }
}

impl From<&Constant> for Value {
  fn from(constant: &Constant) -> Self {
    match constant {
      Constant::None => Self::None,
      Constant::Bool(b) => Self::Bool(*b),
      Constant::Int(i) => Self::Int(*i),
      Constant::Float(f) => Self::Float(*f),
      Constant::Str(s) => Self::Str(Arc::clone(s)),
    }
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    self.equals(other)
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Str(s) => f.write_str(s),
      other => f.write_str(&other.repr()),
    }
  }
}

impl Value {
  pub fn list(items: Vec<Value>) -> Self {
    Self::List(Arc::new(Mutex::new(items)))
  }

  pub fn dict(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
    Self::Dict(Arc::new(Mutex::new(entries.into_iter().collect())))
  }

  pub fn tuple(items: Vec<Value>) -> Self {
    Self::Tuple(Arc::from(items))
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Self::None => "NoneType",
      Self::Bool(_) => "bool",
      Self::Int(_) => "int",
      Self::Float(_) => "float",
      Self::Str(_) => "str",
      Self::List(_) => "list",
      Self::Tuple(_) => "tuple",
      Self::Dict(_) => "dict",
      Self::Range { .. } => "range",
      Self::Function(_) | Self::Builtin(_) => "function",
      Self::Method(..) | Self::BuiltinMethod(..) => "method",
      Self::Class(_) => "type",
      Self::Instance(_) => "object",
      Self::Generator(_) => "generator",
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::Str(s) => Some(s),
      _ => None,
    }
  }

  pub fn truthy(&self) -> bool {
    match self {
      Self::None => false,
      Self::Bool(b) => *b,
      Self::Int(i) => *i != 0,
      Self::Float(f) => *f != 0.0,
      Self::Str(s) => !s.is_empty(),
      Self::List(items) => !lock(items).is_empty(),
      Self::Tuple(items) => !items.is_empty(),
      Self::Dict(entries) => !lock(entries).is_empty(),
      Self::Range { .. } => range_len(self) > 0,
      _ => true,
    }
  }

  pub fn repr(&self) -> String {
    self.repr_within(&mut Vec::new())
  }

  /// `open` holds the containers currently being printed; meeting one again prints `...`.
  fn repr_within(&self, open: &mut Vec<*const ()>) -> String {
    match self {
      Self::None => "None".to_string(),
      Self::Bool(true) => "True".to_string(),
      Self::Bool(false) => "False".to_string(),
      Self::Int(i) => i.to_string(),
      Self::Float(f) => format_float(*f),
      Self::Str(s) => quote_repr(s),
      Self::List(items) => {
        let id = Arc::as_ptr(items).cast::<()>();
        if open.contains(&id) {
          return "[...]".to_string();
        }
        let items = lock(items).clone();
        open.push(id);
        let body = join_reprs(&items, open);
        open.pop();
        format!("[{body}]")
      }
      Self::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr_within(open)),
      Self::Tuple(items) => format!("({})", join_reprs(items, open)),
      Self::Dict(entries) => {
        let id = Arc::as_ptr(entries).cast::<()>();
        if open.contains(&id) {
          return "{...}".to_string();
        }
        let entries = lock(entries).clone();
        open.push(id);
        let body = entries
          .iter()
          .map(|(key, value)| format!("{}: {}", quote_repr(key), value.repr_within(open)))
          .collect::<Vec<_>>()
          .join(", ");
        open.pop();
        format!("{{{body}}}")
      }
      Self::Range { start, stop, step } if *step == 1 => format!("range({start}, {stop})"),
      Self::Range { start, stop, step } => format!("range({start}, {stop}, {step})"),
      Self::Function(func) | Self::Method(_, func) => format!("<function {}>", func.code.name),
      Self::Builtin(builtin) => format!("<built-in function {}>", builtin.name()),
      Self::BuiltinMethod(_, name) => format!("<built-in method {name}>"),
      Self::Class(class) => format!("<class '{}'>", class.name),
      Self::Instance(instance) => format!("<{} object>", instance.class.name),
      Self::Generator(_) => "<generator object>".to_string(),
    }
  }

  pub fn equals(&self, other: &Value) -> bool {
    self.equals_within(other, &mut Vec::new())
  }

  /// `open` holds the container pairs already under comparison; a pair met
  /// again is assumed equal so cyclic containers terminate.
  fn equals_within(&self, other: &Value, open: &mut Vec<(*const (), *const ())>) -> bool {
    match (self, other) {
      (Self::None, Self::None) => true,
      (Self::Str(a), Self::Str(b)) => a == b,
      (Self::List(a), Self::List(b)) => {
        if Arc::ptr_eq(a, b) {
          return true;
        }
        let pair = (Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>());
        if open.contains(&pair) {
          return true;
        }
        let a = lock(a).clone();
        let b = lock(b).clone();
        open.push(pair);
        let equal = items_equal(&a, &b, open);
        open.pop();
        equal
      }
      (Self::Tuple(a), Self::Tuple(b)) => items_equal(a, b, open),
      (Self::Dict(a), Self::Dict(b)) => {
        if Arc::ptr_eq(a, b) {
          return true;
        }
        let pair = (Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>());
        if open.contains(&pair) {
          return true;
        }
        let a = lock(a).clone();
        let b = lock(b).clone();
        open.push(pair);
        let equal = a.len() == b.len()
          && a.iter().all(|(key, value)| {
            b.get(key)
              .is_some_and(|other| value.equals_within(other, open))
          });
        open.pop();
        equal
      }
      (Self::Range { .. }, Self::Range { .. }) => {
        let (a, b) = (range_items(self), range_items(other));
        a == b
      }
      (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
      (Self::Builtin(a), Self::Builtin(b)) => a == b,
      (Self::Class(a), Self::Class(b)) => Arc::ptr_eq(a, b),
      (Self::Instance(a), Self::Instance(b)) => Arc::ptr_eq(a, b),
      (Self::Generator(a), Self::Generator(b)) => Arc::ptr_eq(a, b),
      _ => match (self.number(), other.number()) {
        (Some(a), Some(b)) => a.equals(b),
        _ => false,
      },
    }
  }

  fn number(&self) -> Option<Number> {
    match self {
      Self::Bool(b) => Some(Number::Int(i64::from(*b))),
      Self::Int(i) => Some(Number::Int(*i)),
      Self::Float(f) => Some(Number::Float(*f)),
      _ => None,
    }
  }

  /// Resolve `value.name` for builtin receivers.
  pub fn builtin_method(&self, name: &str) -> Option<Value> {
    let methods: &[&'static str] = match self {
      Self::Str(_) => &STR_METHODS,
      Self::List(_) => &LIST_METHODS,
      Self::Dict(_) => &DICT_METHODS,
      _ => return None,
    };
    methods
      .iter()
      .find(|method| **method == name)
      .map(|method| Self::BuiltinMethod(Box::new(self.clone()), *method))
  }
}

fn items_equal(a: &[Value], b: &[Value], open: &mut Vec<(*const (), *const ())>) -> bool {
  a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals_within(y, open))
}

fn join_reprs(items: &[Value], open: &mut Vec<*const ()>) -> String {
  items
    .iter()
    .map(|item| item.repr_within(open))
    .collect::<Vec<_>>()
    .join(", ")
}

fn format_float(f: f64) -> String {
  if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
    format!("{f:.1}")
  } else if f.is_nan() {
    "nan".to_string()
  } else if f.is_infinite() {
    (if f > 0.0 { "inf" } else { "-inf" }).to_string()
  } else {
    f.to_string()
  }
}

fn quote_repr(s: &str) -> String {
  let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
  let mut out = String::with_capacity(s.len() + 2);
  out.push(quote);
  for c in s.chars() {
    match c {
      '\\' => out.push_str("\\\\"),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\t' => out.push_str("\\t"),
      c if c == quote => {
        out.push('\\');
        out.push(c);
      }
      c if (c as u32) < 0x20 || c == '\u{7f}' => out.push_str(&format!("\\x{:02x}", c as u32)),
      c => out.push(c),
    }
  }
  out.push(quote);
  out
}

pub(crate) fn range_len(value: &Value) -> i64 {
  let Value::Range { start, stop, step } = *value else {
    return 0;
  };
  let span = if step > 0 {
    stop.saturating_sub(start)
  } else {
    start.saturating_sub(stop)
  };
  if span <= 0 {
    return 0;
  }
  let step = step.saturating_abs();
  span / step + i64::from(span % step != 0)
}

fn range_items(value: &Value) -> Vec<i64> {
  let Value::Range { start, step, .. } = *value else {
    return Vec::new();
  };
  (0..range_len(value)).map(|i| start + i * step).collect()
}

#[derive(Debug, Clone, Copy)]
enum Number {
  Int(i64),
  Float(f64),
}

impl Number {
  fn as_f64(self) -> f64 {
    match self {
      Self::Int(i) => i as f64,
      Self::Float(f) => f,
    }
  }

  fn equals(self, other: Number) -> bool {
    match (self, other) {
      (Self::Int(a), Self::Int(b)) => a == b,
      (a, b) => a.as_f64() == b.as_f64(),
    }
  }

  fn compare(self, other: Number) -> Option<Ordering> {
    match (self, other) {
      (Self::Int(a), Self::Int(b)) => Some(a.cmp(&b)),
      (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
    }
  }
}

fn unsupported(op: &str, lhs: &Value, rhs: &Value) -> TemplateError {
  TemplateError::runtime(format!(
    "unsupported operand type(s) for {op}: '{}' and '{}'",
    lhs.type_name(),
    rhs.type_name()
  ))
}

fn overflow() -> TemplateError {
  TemplateError::runtime("integer overflow")
}

fn checked(
  op: &str,
  lhs: &Value,
  rhs: &Value,
  int: impl Fn(i64, i64) -> Option<i64>,
  float: impl Fn(f64, f64) -> f64,
) -> TemplateResult<Value> {
  match (lhs.number(), rhs.number()) {
    (Some(Number::Int(a)), Some(Number::Int(b))) => int(a, b).map(Value::Int).ok_or_else(overflow),
    (Some(a), Some(b)) => Ok(Value::Float(float(a.as_f64(), b.as_f64()))),
    _ => Err(unsupported(op, lhs, rhs)),
  }
}

/// Order two values for `<`, `min` and friends.
pub fn compare(lhs: &Value, rhs: &Value) -> TemplateResult<Ordering> {
  let ordering = match (lhs, rhs) {
    (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
    (Value::Tuple(a), Value::Tuple(b)) => {
      for (x, y) in a.iter().zip(b.iter()) {
        let ordering = compare(x, y)?;
        if ordering != Ordering::Equal {
          return Ok(ordering);
        }
      }
      Some(a.len().cmp(&b.len()))
    }
    _ => match (lhs.number(), rhs.number()) {
      (Some(a), Some(b)) => a.compare(b),
      _ => None,
    },
  };
  ordering.ok_or_else(|| {
    TemplateError::runtime(format!(
      "'<' not supported between instances of '{}' and '{}'",
      lhs.type_name(),
      rhs.type_name()
    ))
  })
}

/// Apply a binary operator other than membership.
pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> TemplateResult<Value> {
  match op {
    BinaryOp::Add => match (lhs, rhs) {
      (Value::Str(a), Value::Str(b)) => Ok(Value::from(format!("{a}{b}"))),
      (Value::List(a), Value::List(b)) => {
        let mut items = lock(a).clone();
        items.extend(lock(b).iter().cloned());
        Ok(Value::list(items))
      }
      (Value::Tuple(a), Value::Tuple(b)) => {
        Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
      }
      _ => checked("+", lhs, rhs, i64::checked_add, |a, b| a + b),
    },
    BinaryOp::Sub => checked("-", lhs, rhs, i64::checked_sub, |a, b| a - b),
    BinaryOp::Mul => match (lhs, rhs) {
      (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
        Ok(Value::from(s.repeat(usize::try_from(*n).unwrap_or(0))))
      }
      _ => checked("*", lhs, rhs, i64::checked_mul, |a, b| a * b),
    },
    BinaryOp::Div => {
      if rhs.number().is_some_and(|n| n.as_f64() == 0.0) {
        return Err(TemplateError::runtime("division by zero"));
      }
      match (lhs.number(), rhs.number()) {
        (Some(a), Some(b)) => Ok(Value::Float(a.as_f64() / b.as_f64())),
        _ => Err(unsupported("/", lhs, rhs)),
      }
    }
    BinaryOp::FloorDiv | BinaryOp::Mod => {
      if rhs.number().is_some_and(|n| n.as_f64() == 0.0) {
        return Err(TemplateError::runtime("integer division or modulo by zero"));
      }
      let symbol = if op == BinaryOp::Mod { "%" } else { "//" };
      checked(
        symbol,
        lhs,
        rhs,
        |a, b| {
          let quotient = a.checked_div_euclid(b)?;
          // floor semantics: the remainder takes the sign of the divisor
          let (quotient, remainder) = match a.checked_rem_euclid(b)? {
            r if r != 0 && b < 0 => (quotient.checked_sub(1)?, r.checked_add(b)?),
            r => (quotient, r),
          };
          Some(if op == BinaryOp::Mod { remainder } else { quotient })
        },
        |a, b| {
          let quotient = (a / b).floor();
          if op == BinaryOp::Mod { a - quotient * b } else { quotient }
        },
      )
    }
    BinaryOp::Eq => Ok(Value::Bool(lhs.equals(rhs))),
    BinaryOp::Ne => Ok(Value::Bool(!lhs.equals(rhs))),
    BinaryOp::Lt => Ok(Value::Bool(compare(lhs, rhs)? == Ordering::Less)),
    BinaryOp::Le => Ok(Value::Bool(compare(lhs, rhs)? != Ordering::Greater)),
    BinaryOp::Gt => Ok(Value::Bool(compare(lhs, rhs)? == Ordering::Greater)),
    BinaryOp::Ge => Ok(Value::Bool(compare(lhs, rhs)? != Ordering::Less)),
    BinaryOp::In | BinaryOp::NotIn => {
      let found = contains(rhs, lhs)?;
      Ok(Value::Bool(found == (op == BinaryOp::In)))
    }
  }
}

/// `needle in haystack` for containers that can answer without iterating code.
pub fn contains(haystack: &Value, needle: &Value) -> TemplateResult<bool> {
  match haystack {
    Value::Str(s) => match needle {
      Value::Str(sub) => Ok(s.contains(&**sub)),
      other => Err(TemplateError::runtime(format!(
        "'in <string>' requires string as left operand, not {}",
        other.type_name()
      ))),
    },
    Value::List(items) => {
      let items = lock(items).clone();
      Ok(items.iter().any(|item| item.equals(needle)))
    }
    Value::Tuple(items) => Ok(items.iter().any(|item| item.equals(needle))),
    Value::Dict(entries) => Ok(
      needle
        .as_str()
        .is_some_and(|key| lock(entries).contains_key(key)),
    ),
    Value::Range { .. } => Ok(match needle {
      Value::Int(i) => range_items(haystack).contains(i),
      _ => false,
    }),
    other => Err(TemplateError::runtime(format!(
      "argument of type '{}' is not iterable",
      other.type_name()
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn str_and_repr_follow_python_conventions() {
    assert_eq!(Value::Float(1.0).to_string(), "1.0");
    assert_eq!(Value::Float(0.5).to_string(), "0.5");
    assert_eq!(Value::Bool(true).to_string(), "True");
    assert_eq!(Value::from("it's").repr(), "\"it's\"");
    assert_eq!(
      Value::list(vec![Value::Int(1), Value::from("a")]).to_string(),
      "[1, 'a']"
    );
    assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
  }

  #[test]
  fn arithmetic_mixes_ints_and_floats() {
    assert_eq!(
      binary(BinaryOp::Add, &Value::Int(2), &Value::Float(0.5)).expect("adds"),
      Value::Float(2.5)
    );
    assert_eq!(
      binary(BinaryOp::Mul, &Value::Int(2), &Value::Int(3)).expect("multiplies"),
      Value::Int(6)
    );
    assert_eq!(
      binary(BinaryOp::Mul, &Value::from("ab"), &Value::Int(2)).expect("repeats"),
      Value::from("abab")
    );
  }

  #[test]
  fn floor_division_and_modulo_round_towards_negative_infinity() {
    let div = |a, b| binary(BinaryOp::FloorDiv, &Value::Int(a), &Value::Int(b)).expect("divides");
    let rem = |a, b| binary(BinaryOp::Mod, &Value::Int(a), &Value::Int(b)).expect("divides");
    assert_eq!(div(7, 2), Value::Int(3));
    assert_eq!(div(-7, 2), Value::Int(-4));
    assert_eq!(div(7, -2), Value::Int(-4));
    assert_eq!(rem(-7, 2), Value::Int(1));
    assert_eq!(rem(7, -2), Value::Int(-1));
    assert_eq!(rem(-7, -2), Value::Int(-1));
  }

  #[test]
  fn arithmetic_faults_are_runtime_failures() {
    assert!(binary(BinaryOp::Div, &Value::Int(1), &Value::Int(0)).is_err());
    assert!(binary(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1)).is_err());
    let err = binary(BinaryOp::Add, &Value::Int(1), &Value::from("a")).unwrap_err();
    assert_eq!(
      err.to_string(),
      "unsupported operand type(s) for +: 'int' and 'str'"
    );
  }

  #[test]
  fn membership_and_ordering() {
    let range = Value::Range {
      start: 0,
      stop: 10,
      step: 3,
    };
    assert!(contains(&range, &Value::Int(9)).expect("range membership"));
    assert!(!contains(&range, &Value::Int(10)).expect("range membership"));
    assert!(contains(&Value::from("abc"), &Value::from("bc")).expect("substring"));
    assert_eq!(
      compare(&Value::from("a"), &Value::from("b")).expect("comparable"),
      Ordering::Less
    );
    assert!(compare(&Value::from("a"), &Value::Int(1)).is_err());
  }

  #[test]
  fn self_containing_containers() {
    let list = Value::list(vec![Value::Int(1)]);
    let Value::List(items) = &list else {
      unreachable!();
    };
    lock(items).push(list.clone());
    assert_eq!(list.repr(), "[1, [...]]");
    assert_eq!(list.to_string(), "[1, [...]]");

    let dict = Value::dict([("a".to_string(), Value::Int(1))]);
    let Value::Dict(entries) = &dict else {
      unreachable!();
    };
    lock(entries).insert("self".to_string(), dict.clone());
    assert_eq!(dict.repr(), "{'a': 1, 'self': {...}}");

    let other = Value::list(vec![Value::Int(1)]);
    let Value::List(other_items) = &other else {
      unreachable!();
    };
    lock(other_items).push(other.clone());
    assert!(list.equals(&other));
    assert!(contains(&list, &other).expect("list membership"));
    assert!(!contains(&list, &Value::Int(2)).expect("list membership"));
    assert_eq!(Value::tuple(vec![list.clone()]).repr(), "([1, [...]],)");

    // Break the cycles.
    lock(items).clear();
    lock(entries).clear();
    lock(other_items).clear();
  }

  #[test]
  fn truthiness() {
    assert!(!Value::None.truthy());
    assert!(!Value::from("").truthy());
    assert!(Value::list(vec![Value::None]).truthy());
    assert!(
      !Value::Range {
        start: 3,
        stop: 0,
        step: 1
      }
      .truthy()
    );
  }
}
