//! Register virtual machine
//!
//! This module contains the fetch-decode-execute loop together with the
//! memory, stacks and host built-ins it operates on.

mod errors;
mod execution;
mod memory;
mod stack;
mod types;

pub use errors::VMError;
pub use execution::{
    BuiltinExecution, BuiltinOutcome, FileTable, HostStreams, SharedBuffer, FIRST_FILE_DESCRIPTOR,
    OPEN_FAILED,
};
pub use memory::Memory;
pub use stack::{CalculationStack, CallStack};
pub use types::{Limits, NoopObserver, Observer, Termination};

// Main VM struct that coordinates components
#[allow(clippy::module_inception)]
mod vm;
pub use vm::VirtualMachine;
