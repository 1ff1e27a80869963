//! VM stack operations
//!
//! The calculation stack holds raw bytes. Values are pushed least-significant
//! byte first, so the most significant byte ends on top and is the first one
//! popped back. The call stack holds return addresses.

use crate::types::{Address, Register};
use crate::vm::errors::VMError;

/// Byte-granular operand stack
#[derive(Debug, Clone)]
pub struct CalculationStack {
    bytes: Vec<u8>,
    limit: usize,
}

impl CalculationStack {
    /// Create an empty stack holding at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    pub fn push_byte(&mut self, byte: u8) -> Result<(), VMError> {
        if self.bytes.len() >= self.limit {
            return Err(VMError::StackOverflow { limit: self.limit });
        }
        self.bytes.push(byte);
        Ok(())
    }

    /// Push the low `width` bytes of `value`, least significant first
    pub fn push_width(&mut self, value: u64, width: usize) -> Result<(), VMError> {
        if self.bytes.len() + width > self.limit {
            return Err(VMError::StackOverflow { limit: self.limit });
        }
        self.bytes.extend_from_slice(&value.to_le_bytes()[..width]);
        Ok(())
    }

    pub fn push_register(&mut self, register: Register, width: usize) -> Result<(), VMError> {
        self.push_width(register.value(), width)
    }

    /// Pop `width` bytes; the first byte popped is the most significant.
    pub fn pop_width(&mut self, width: usize) -> Result<u64, VMError> {
        let available = self.bytes.len();
        if available < width {
            return Err(VMError::StackUnderflow {
                requested: width,
                available,
            });
        }
        let value = self
            .bytes
            .drain(available - width..)
            .rev()
            .fold(0u64, |value, byte| (value << 8) | u64::from(byte));
        Ok(value)
    }

    pub fn pop_u64(&mut self) -> Result<u64, VMError> {
        self.pop_width(8)
    }

    /// Number of bytes on the stack
    pub fn depth(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Return addresses pushed by CALL
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<Address>,
    limit: usize,
}

impl CallStack {
    pub fn new(limit: usize) -> Self {
        Self {
            frames: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, address: Address) -> Result<(), VMError> {
        if self.frames.len() >= self.limit {
            return Err(VMError::CallDepthExceeded { limit: self.limit });
        }
        self.frames.push(address);
        Ok(())
    }

    /// Pop the most recent return address. `at` is the RET being executed.
    pub fn pop(&mut self, at: Address) -> Result<Address, VMError> {
        self.frames.pop().ok_or(VMError::CallStackUnderflow {
            address: at.value(),
        })
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
