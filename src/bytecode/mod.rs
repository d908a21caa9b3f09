//! Translation of the AST into stack bytecode, and the bytecode container
//! the interpreter executes.

pub mod code;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod scope;
pub mod stack_check;

pub use code::{CodeObject, Insn, Operand};
pub use compile::{CompileOptions, Compiler};
pub use compile_error::CompileError;
pub use ir::{BytecodeFunction, ImageError, ProgramBc};
pub use op::Op;
pub use stack_check::StackCheckError;
