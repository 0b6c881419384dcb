//! Bytecode generation backend for a small statically typed language.
//!
//! [`bytecode::compile`] turns a resolved [`lang::program::Program`] into a
//! linked [`bytecode::CompiledProgram`]; [`runtime::Vm`] executes it.

pub mod bytecode;
pub mod config;
pub mod lang;
pub mod runtime;
