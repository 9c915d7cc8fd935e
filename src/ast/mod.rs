//! Statement tree and SQL frontend for the determinism analyzer.
//!
//! ```text
//! SQL text
//!       ↓
//! Parser          (parser.rs, sqlparser / SQLite dialect)
//!       ↓
//! Statement tree  (types.rs)
//!       ↓
//! Rule passes     (crate::analyzer)
//!       ↓
//! Compiler        (compiler.rs, canonical quoted SQL)
//! ```
pub mod compiler;
pub mod parser;
pub mod types;

pub use compiler::{compile, compile_expr, quote_ident};
pub use parser::{parse_single, parse_sql};
pub use types::*;
