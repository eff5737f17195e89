//! Turning generated source into callable templates.
//!
//! Loading parses and lowers the whole source up front, so any malformed
//! payload surfaces as a `CompileFailure` before anything runs. Module-level
//! statements then execute once against a fresh namespace. After that the
//! module is only read: every call gets its own frame, and the sequences it
//! returns can be driven from any thread.

use std::iter::FusedIterator;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, instrument};

use crate::codegen::GeneratedSource;
use crate::engine::bytecode::compile_module;
use crate::engine::parser::parse;
use crate::engine::value::{Globals, Namespace, Value};
use crate::engine::vm::{self, Frame, Generator};
use crate::error::{TemplateError, TemplateResult};

/// A loaded template module.
#[derive(Debug)]
pub struct Module {
  name: String,
  globals: Globals,
}

/// Compile and run generated source under the module name `name`.
pub fn load(source: &GeneratedSource, name: &str) -> TemplateResult<Module> {
  load_str(source.as_str(), name)
}

/// Same as [`load`] for source text that did not come from the emitter.
#[instrument(skip_all, fields(module = name))]
pub fn load_str(source: &str, name: &str) -> TemplateResult<Module> {
  let body = parse(name, source)?;
  let code = compile_module(name, source, body)?;
  let globals: Globals = Arc::new(RwLock::new(Namespace::new()));
  Frame::module(code, Arc::clone(&globals)).run()?;

  let module = Module {
    name: name.to_string(),
    globals,
  };
  debug!(names = ?module.names(), "module loaded");
  Ok(module)
}

impl Module {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Look up a top-level name.
  pub fn get(&self, name: &str) -> Option<Value> {
    let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
    globals.get(name).cloned()
  }

  /// Top-level names in definition order, imported helpers included.
  pub fn names(&self) -> Vec<String> {
    let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
    globals.keys().cloned().collect()
  }

  /// Invoke a template function. Nothing in its body runs until the
  /// returned sequence is pulled.
  pub fn call(
    &self,
    function: &str,
    args: impl IntoIterator<Item = Value>,
  ) -> TemplateResult<Fragments> {
    self.call_with(function, args, Vec::<(String, Value)>::new())
  }

  /// [`Module::call`] with keyword arguments.
  pub fn call_with<K: Into<String>>(
    &self,
    function: &str,
    args: impl IntoIterator<Item = Value>,
    kwargs: impl IntoIterator<Item = (K, Value)>,
  ) -> TemplateResult<Fragments> {
    let func = self.get(function).ok_or_else(|| {
      TemplateError::runtime(format!(
        "module '{}' has no function '{function}'",
        self.name
      ))
    })?;
    let kwargs = kwargs
      .into_iter()
      .map(|(name, value)| (name.into(), value))
      .collect();
    let generator = vm::start(&func, args.into_iter().collect(), kwargs)?;
    debug!(module = %self.name, function, "call");
    Ok(Fragments {
      generator,
      done: false,
    })
  }
}

/// Output of one template call, pulled a fragment at a time.
///
/// The sequence ends after the first error.
#[derive(Debug)]
pub struct Fragments {
  generator: Generator,
  done: bool,
}

impl Fragments {
  /// Concatenate every remaining fragment.
  pub fn render(self) -> TemplateResult<String> {
    let mut out = String::new();
    for fragment in self {
      out.push_str(&fragment?);
    }
    Ok(out)
  }
}

impl Iterator for Fragments {
  type Item = TemplateResult<String>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    let fragment = match self.generator.resume() {
      Ok(Some(Value::Str(s))) => return Some(Ok(s.to_string())),
      Ok(Some(other)) => Err(TemplateError::runtime(format!(
        "{}() produced a fragment of type '{}', expected str",
        self.generator.name(),
        other.type_name()
      ))),
      Ok(None) => {
        self.done = true;
        return None;
      }
      Err(err) => Err(err),
    };
    self.done = true;
    Some(fragment)
  }
}

impl FusedIterator for Fragments {}

#[cfg(test)]
mod tests {
  use super::*;

  fn assert_send_sync<T: Send + Sync>() {}
  fn assert_send<T: Send>() {}

  #[test]
  fn loaded_modules_can_be_shared_across_threads() {
    assert_send_sync::<Module>();
    assert_send::<Fragments>();
  }

  #[test]
  fn module_code_runs_once_at_load() {
    let module = load_str("x = 42\ndef f():\n\tyield str(x)\n", "m").expect("loads");
    assert_eq!(module.name(), "m");
    assert_eq!(module.get("x"), Some(Value::Int(42)));
    assert_eq!(module.names(), vec!["x".to_string(), "f".to_string()]);
  }

  #[test]
  fn calls_are_lazy_until_pulled() {
    let module = load_str("def f():\n\tyield 'a'\n\tyield 1 // 0\n", "m").expect("loads");
    let mut fragments = module.call("f", []).expect("call starts");
    assert_eq!(fragments.next().map(Result::ok), Some(Some("a".to_string())));
    let err = fragments.next().expect("second pull").unwrap_err();
    assert_eq!(err.to_string(), "f:3: integer division or modulo by zero");
    assert!(fragments.next().is_none());
  }

  #[test]
  fn keyword_arguments_bind_by_name() {
    let module = load_str("def f(a, b='-'):\n\tyield a + b\n", "m").expect("loads");
    let out = module
      .call_with("f", [Value::from("x")], [("b", Value::from("!"))])
      .and_then(Fragments::render)
      .expect("renders");
    assert_eq!(out, "x!");
  }

  #[test]
  fn non_string_fragments_fail() {
    let module = load_str("def f():\n\tyield 1\n", "m").expect("loads");
    let err = module.call("f", []).and_then(Fragments::render).unwrap_err();
    assert!(matches!(err, TemplateError::RuntimeFailure { .. }));
    assert_eq!(
      err.to_string(),
      "f() produced a fragment of type 'int', expected str"
    );
  }

  #[test]
  fn unknown_functions_and_bad_source() {
    let module = load_str("x = 1\n", "m").expect("loads");
    assert!(module.call("missing", []).is_err());
    assert!(module.call("x", []).is_err());
    let err = load_str("def f(:\n", "m").unwrap_err();
    assert!(matches!(err, TemplateError::CompileFailure { .. }));
  }
}
