pub mod bytecode;
pub mod config;
pub mod debuginfo;
pub mod events;
pub mod objectfile;
pub mod types;
pub mod vm;

// Use specific imports rather than assuming re-exports for clarity
pub use crate::bytecode::{Builtin, CodeBuilder, Instruction, Opcode};
pub use crate::debuginfo::{DebugInfo, DebugInfoError};
pub use crate::objectfile::{EncodeError, FormatError, LookupError, ObjectFile};
pub use crate::types::{Address, OneStep, Register};
pub use crate::vm::{Termination, VMError, VirtualMachine};
