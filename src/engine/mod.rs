//! The execution engine generated source is written for.
//!
//! `lexer` and `parser` build an `ast`, `bytecode` flattens every body into
//! jump-based instruction lists, and `vm` runs them on `value`s.

pub mod ast;
pub mod bytecode;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod vm;

pub use value::Value;
pub use vm::Generator;
