//! Bytecode: instruction set, program layout and the compiler producing it.

pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod operand_stack;

pub use compile::Compiler;
pub use compile_error::CompileError;
pub use ir::{Instr, Program};
pub use op::{Layout, Op};
