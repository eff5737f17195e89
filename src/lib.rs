//! Crate root: wires together the template pipeline.
//!
//! A template is a tree of text and typed directives. Compiling it runs three
//! small stages:
//! - `tokenizer` walks the tree in document order and yields typed tokens.
//! - `codegen` folds the tokens through a scope stack into indented source.
//! - `loader` compiles that source with the `engine` and exposes each `def`
//!   as a function returning its output fragments lazily.
//!
//! `error` and `config` are shared by all stages; `tree` reads the
//! `<?target data?>` text form of a template.
//!
//! ```
//! use detox::{CompileOptions, Value, compile_str, load};
//!
//! let source = compile_str("<?def greet(name)?>Hi <?textexpr name?>!<?end?>", &CompileOptions::default())?;
//! let module = load(&source, "greeting")?;
//! let text = module.call("greet", [Value::from("<you>")])?.render()?;
//! assert_eq!(text, "Hi &lt;you&gt;!");
//! # Ok::<(), detox::TemplateError>(())
//! ```

pub mod codegen;
pub mod config;
pub mod engine;
pub mod error;
pub mod escape;
pub mod loader;
pub mod tokenizer;
pub mod tree;

use tracing::instrument;

pub use codegen::{Emitter, GeneratedSource, ScopeFrame};
pub use config::{CompileOptions, OutputScope, ScopeCheck};
pub use engine::Value;
pub use error::{Location, TemplateError, TemplateResult};
pub use loader::{Fragments, Module, load, load_str};
pub use tokenizer::{InstructionKind, Token};
pub use tree::Node;

/// Compile a template tree into generated source.
#[instrument(skip_all, fields(nodes = nodes.len()))]
pub fn compile(nodes: &[Node], options: &CompileOptions) -> TemplateResult<GeneratedSource> {
  codegen::generate(tokenizer::tokenize(nodes), options)
}

/// Read template text and compile it.
pub fn compile_str(template: &str, options: &CompileOptions) -> TemplateResult<GeneratedSource> {
  let nodes = tree::parse_source(template)?;
  compile(&nodes, options)
}

/// Compile, load and render one function of a template in a single step.
pub fn render_str(
  template: &str,
  function: &str,
  args: impl IntoIterator<Item = Value>,
) -> TemplateResult<String> {
  let source = compile_str(template, &CompileOptions::default())?;
  let module = load(&source, "template")?;
  module.call(function, args)?.render()
}
