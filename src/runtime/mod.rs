pub mod runtime_error;
pub mod vm;

#[cfg(test)]
mod end_to_end;

pub use runtime_error::RuntimeError;
pub use vm::{Vm, VmConfig};
