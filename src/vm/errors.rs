//! Error types for VM operations
//!
//! This module defines every condition that stops execution early. Load-time
//! problems are reported by `objectfile::FormatError` instead.

use thiserror::Error;

use crate::types::AddressSpace;

/// Error variants that can occur during VM execution
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VMError {
    /// The high byte of the fetched word is not a defined opcode
    #[error("unknown opcode {opcode:#04x} at @{address}")]
    UnknownOpcode { address: u64, opcode: u8 },

    /// CALL targeted the static space with an identifier no built-in uses
    #[error("unknown built-in function {id} called at @{address}")]
    UnknownBuiltin { address: u64, id: u64 },

    /// A pop asked for more bytes than the calculation stack holds
    #[error("calculation stack underflow: needed {requested} bytes, {available} available")]
    StackUnderflow { requested: usize, available: usize },

    #[error("calculation stack exceeded {limit} bytes")]
    StackOverflow { limit: usize },

    /// RET with an empty call stack
    #[error("return with empty call stack at @{address}")]
    CallStackUnderflow { address: u64 },

    #[error("call depth exceeded {limit}")]
    CallDepthExceeded { limit: usize },

    /// Read of an unmapped dynamic byte or past the end of static data
    #[error("invalid {space} memory access at offset {offset:#x}")]
    MemoryAccess { space: AddressSpace, offset: u64 },

    /// A multi-byte access would run past the end of its address space
    #[error("{len}-byte {space} memory access at offset {offset:#x} crosses the end of the space")]
    CrossesAddressSpace {
        space: AddressSpace,
        offset: u64,
        len: u64,
    },

    #[error("MALLOC of {requested} bytes exceeds the {limit}-byte heap")]
    HeapExhausted { requested: u64, limit: u64 },

    #[error("attempt to write static data at offset {offset:#x}")]
    WriteToStatic { offset: u64 },

    #[error("program counter @{address} is outside the code ({code_len} words)")]
    ProgramCounterOutOfRange { address: u64, code_len: usize },

    #[error("division by zero at @{address}")]
    DivisionByZero { address: u64 },

    #[error("file descriptor {fd} is not readable")]
    NotReadable { fd: u64 },

    #[error("file descriptor {fd} is not writable")]
    NotWritable { fd: u64 },

    #[error("bad file descriptor {fd}")]
    BadDescriptor { fd: u64 },

    /// Host I/O failure inside a built-in
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VMError {
    fn from(err: std::io::Error) -> Self {
        VMError::Io(err.to_string())
    }
}
