//! The query surface: a small pipeline language planned onto the engine.
//!
//! A query names an input file, a chain of units, and a terminal:
//!
//! ```text
//! file "data.txt" | $y = $1 + $2 | where $y > 4 | reduce %1 sum($y) | show
//! ```
//!
//! `$N` references a numeric file column, `%N` a string column, `$name` a
//! declared variable (or a numeric header name), `%name` a string header
//! name. Parsing builds a thin AST; column resolution walks it once to
//! find exactly which file columns to load and to reject malformed
//! queries before any graph is built; planning emits a dataflow over the
//! builder surface and runs it.

pub mod ast;
pub mod eval;
pub mod parse;
pub mod plan;
pub mod repl;
pub mod resolve;

pub use parse::parse_query;
pub use plan::run_query;
pub use repl::{Session, repl};
