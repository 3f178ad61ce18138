pub mod heap;
pub mod host;
pub mod runtime_error;
pub mod stdlib;
pub mod vm_bc;

pub use host::{EnvItem, Host, HostError, HostFunc, HostReturn};
pub use runtime_error::RuntimeError;
pub use vm_bc::{Outcome, VmBc, VmConfig};
