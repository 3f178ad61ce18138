//! Compiler and gas-metered bytecode VM for a small typed contract language.
//!
//! Contract trees come from an external parser as [`lang::node::Node`]s.
//! [`Vm::load`] compiles them against a shared [`namespace::Namespace`] and
//! [`Vm::call`] runs them with host-supplied parameters.

pub mod artifact;
pub mod bytecode;
pub mod lang;
pub mod namespace;
pub mod runtime;
pub mod vm;

pub use vm::{Vm, VmError, VmSettings};
