//! Types shared by the VM and its embedders

use serde::{Deserialize, Serialize};

use crate::types::{Address, OneStep};

/// Hooks called by the execution loop.
///
/// Both methods default to doing nothing, so an observer only implements the
/// events it cares about. Observers receive copies and cannot alter VM state.
pub trait Observer {
    /// Called after a word is fetched and before it is executed.
    fn before_step(&mut self, _address: Address, _step: OneStep) {}

    /// Called once the program counter holds the next address to execute.
    fn program_counter_updated(&mut self, _address: Address) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// How a successful run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The program counter reached the end of the code
    EndOfCode,
    /// The EXIT built-in was called with this status
    Exit(i32),
}

impl Termination {
    /// Process exit status for this termination
    pub fn status(self) -> i32 {
        match self {
            Termination::EndOfCode => 0,
            Termination::Exit(code) => code,
        }
    }
}

/// Resource bounds of one VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum bytes on the calculation stack
    pub max_stack_bytes: usize,
    /// Maximum number of pending return addresses
    pub max_call_depth: usize,
    /// First dynamic address handed out by MALLOC
    pub heap_base: u64,
    /// Maximum bytes held by live MALLOC allocations
    pub max_heap_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_stack_bytes: 1 << 20,
            max_call_depth: 65536,
            heap_base: 0x1000_0000,
            max_heap_bytes: 1 << 32,
        }
    }
}
