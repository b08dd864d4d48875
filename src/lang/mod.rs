//! Language model shared by the compiler and the VM: types, runtime values
//! with their operator semantics, and the scoped symbol table.

pub mod symbol;
pub mod types;
pub mod value;
