//! Execution: the stack VM, its errors and the host function registry.

pub mod host;
pub mod runtime_error;
pub mod vm;

pub use runtime_error::RuntimeError;
pub use vm::{Vm, VmConfig};
