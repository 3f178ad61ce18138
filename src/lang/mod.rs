//! # Contract language model
//!
//! Types, syntax tree and host-facing values shared by the compiler and the
//! runtime. The syntax tree is produced by an external parser; everything
//! downstream of it lives in this crate.
//!
//! ## Conventions
//!
//! - Types print the way contracts spell them: `int`, `arr.str`, `map.money`.
//! - Every AST node carries a 1-based `line:column` position.

pub mod node;
pub mod types;
pub mod value;
