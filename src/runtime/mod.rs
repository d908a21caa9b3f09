//! Bytecode interpreter and the host boundary it runs against.

pub mod native;
pub mod runtime_error;
pub mod vm_bc;

pub use native::{HostValue, NativeBridge, NativeTable};
pub use runtime_error::RuntimeError;
pub use vm_bc::{HostVar, VmBc, VmBcConfig};
