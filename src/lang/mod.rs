//! # Cinder source model
//!
//! The already-parsed input of the translator: a tree of scopes holding
//! variable and function declarations, and the statement/expression nodes
//! of each function body. Also home of the runtime [`value::Value`] and
//! the static [`types::VarType`] shared by both sides of the pipeline.
//!
//! ## Documentation conventions
//!
//! - Stack effects are written as `( before -- after )`.
//! - `<top>` names the implicit function holding top-level statements.

pub mod build;
pub mod node;
pub mod program;
pub mod types;
pub mod value;
