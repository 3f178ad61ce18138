pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;

pub use compile::compile;
pub use compile_error::{CompileError, CompileErrorKind};
pub use ir::{Contract, FuncInfo, VarInfo};
pub use op::Opcode;
