//! Cinder: a typed AST translated to stack bytecode, and the interpreter
//! that runs it.
//!
//! ```no_run
//! use cinder::bytecode::Compiler;
//! use cinder::lang::{build::*, program::Program, types::VarType};
//! use cinder::runtime::VmBc;
//!
//! let mut program = Program::new();
//! let top = program.top_scope();
//! program.declare_var(top, "i", VarType::Integer);
//! let body = program.add_scope(top);
//! program.define_top(vec![for_loop(
//!     "i",
//!     range(int(1), int(5)),
//!     block(body, vec![print(vec![load("i")])]),
//! )]);
//!
//! let compiled = Compiler::new().compile_program(&program)?;
//! VmBc::new().run_program(&compiled)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bytecode;
pub mod lang;
pub mod runtime;
