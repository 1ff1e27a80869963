//! Instruction set of the nyulan virtual machine
//!
//! This module defines the binary layout of one instruction word and the fixed
//! enumerations the VM dispatches on:
//!
//! - `Opcode`: the high byte of every [`OneStep`]
//! - `Builtin`: host functions reachable through `CALL` on a tagged address
//! - `Instruction`: a decoded word, used for rendering and by `CodeBuilder`
//! - `CodeBuilder`: emits common instruction sequences (immediate loads,
//!   built-in calls) so programs can be assembled without a text assembler
//!
//! Word layout:
//!
//! ```text
//! [opcode:8][operand0:4][operand1:4]   most instructions
//! [opcode:8][literal:8]                PUSHL
//! ```

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display as StrumDisplay, IntoStaticStr};

use crate::types::{Address, OneStep, STATIC_BIT};

/// Version of the instruction set implemented by this VM
pub const CURRENT_INSTRUCTION_SET_VERSION: u64 = 1;

/// Number of addressable registers
pub const REGISTER_COUNT: usize = 16;

/// Opcodes of the virtual machine.
///
/// The discriminants are the on-disk encoding and must not be reordered.
#[derive(
    StrumDisplay,
    IntoStaticStr,
    TryFromPrimitive,
    IntoPrimitive,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Mov,    // dst,src
    And,    // dst,src
    Or,     // dst,src
    Xor,    // dst,src
    Not,    // dst
    Add,    // dst,src
    Sub,    // dst,src
    Mul,    // dst,src
    Div,    // dst,src
    Mod,    // dst,src
    DAdd,   // dst,src  registers read as f64
    DSub,   // dst,src
    DMul,   // dst,src
    DDiv,   // dst,src
    DMod,   // dst,src
    PushR8, // src
    PushR16,
    PushR32,
    PushR64,
    PushL, // literal
    Pop8,  // dst
    Pop16,
    Pop32,
    Pop64,
    Store8, // addr,src
    Store16,
    Store32,
    Store64,
    Load8, // dst,addr
    Load16,
    Load32,
    Load64,
    LShift, // dst,src
    RShift, // dst,src
    IfZ,    // cond,target
    IfP,    // cond,target
    IfN,    // cond,target
    Goto,   // target
    Call,   // target; bit 63 set selects a builtin
    Ret,
}

/// Shape of the low byte of an instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    None,
    One,
    Two,
    Literal,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self.into()
    }

    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    pub fn shape(self) -> OperandShape {
        use Opcode::*;
        match self {
            Nop | Ret => OperandShape::None,
            PushL => OperandShape::Literal,
            Not | PushR8 | PushR16 | PushR32 | PushR64 | Pop8 | Pop16 | Pop32 | Pop64 | Goto
            | Call => OperandShape::One,
            _ => OperandShape::Two,
        }
    }

    /// Byte width moved by the sized stack and memory instructions.
    pub fn width(self) -> Option<usize> {
        use Opcode::*;
        match self {
            PushR8 | Pop8 | Store8 | Load8 => Some(1),
            PushR16 | Pop16 | Store16 | Load16 => Some(2),
            PushR32 | Pop32 | Store32 | Load32 => Some(4),
            PushR64 | Pop64 | Store64 | Load64 => Some(8),
            _ => None,
        }
    }
}

/// Host functions. The value written into a register for `CALL` is the
/// identifier with bit 63 set.
#[derive(
    StrumDisplay,
    IntoStaticStr,
    TryFromPrimitive,
    IntoPrimitive,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u64)]
pub enum Builtin {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Exit = 60,
    Malloc = 512,
    Free = 513,
}

impl Builtin {
    pub fn id(self) -> u64 {
        self.into()
    }

    /// The tagged address a program loads into a register before `CALL`.
    pub fn call_address(self) -> Address {
        Address(self.id() | STATIC_BIT)
    }
}

impl OneStep {
    /// Encodes a register-operand instruction.
    pub fn encode(opcode: Opcode, operand0: u8, operand1: u8) -> Self {
        OneStep(
            (u16::from(opcode.code()) << 8)
                | (u16::from(operand0 & 0x0F) << 4)
                | u16::from(operand1 & 0x0F),
        )
    }

    /// Encodes an instruction carrying an 8-bit immediate.
    pub fn encode_literal(opcode: Opcode, literal: u8) -> Self {
        OneStep((u16::from(opcode.code()) << 8) | u16::from(literal))
    }

    pub fn opcode_byte(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The two 4-bit register indices of the low byte
    pub fn operands(self) -> (usize, usize) {
        (((self.0 >> 4) & 0x0F) as usize, (self.0 & 0x0F) as usize)
    }

    pub fn literal(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn opcode(self) -> Option<Opcode> {
        Opcode::try_from(self.opcode_byte()).ok()
    }
}

/// Operands of a decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    One(u8),
    Two(u8, u8),
    Literal(u8),
}

/// A decoded instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Operands,
}

impl Instruction {
    /// Decodes a word, returning the raw opcode byte if it is not defined.
    pub fn decode(step: OneStep) -> Result<Self, u8> {
        let opcode = Opcode::try_from(step.opcode_byte()).map_err(|_| step.opcode_byte())?;
        let (a, b) = step.operands();
        let operands = match opcode.shape() {
            OperandShape::None => Operands::None,
            OperandShape::One => Operands::One(a as u8),
            OperandShape::Two => Operands::Two(a as u8, b as u8),
            OperandShape::Literal => Operands::Literal(step.literal()),
        };
        Ok(Self { opcode, operands })
    }

    pub fn encode(&self) -> OneStep {
        match self.operands {
            Operands::None => OneStep::encode(self.opcode, 0, 0),
            Operands::One(a) => OneStep::encode(self.opcode, a, 0),
            Operands::Two(a, b) => OneStep::encode(self.opcode, a, b),
            Operands::Literal(literal) => OneStep::encode_literal(self.opcode, literal),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operands {
            Operands::None => write!(f, "{}", self.opcode),
            Operands::One(a) => write!(f, "{} r{}", self.opcode, a),
            Operands::Two(a, b) => write!(f, "{} r{},r{}", self.opcode, a, b),
            Operands::Literal(literal) => write!(f, "{} {:x}", self.opcode, literal),
        }
    }
}

/// Emits instruction words in order.
///
/// Registers can only be filled from the calculation stack or from memory, so
/// an immediate load is a run of eight `PUSHL` words followed by `POP64`.
/// [`CodeBuilder::load_immediate`] returns the index of that run so a forward
/// branch target can be patched in once it is known.
#[derive(Debug, Clone, Default)]
pub struct CodeBuilder {
    code: Vec<OneStep>,
}

/// Number of words emitted by [`CodeBuilder::load_immediate`]
pub const IMMEDIATE_LOAD_LEN: usize = 9;

impl CodeBuilder {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Index of the next word to be emitted
    pub fn position(&self) -> u64 {
        self.code.len() as u64
    }

    pub fn emit(&mut self, opcode: Opcode, operand0: u8, operand1: u8) -> &mut Self {
        self.code.push(OneStep::encode(opcode, operand0, operand1));
        self
    }

    pub fn push_literal(&mut self, literal: u8) -> &mut Self {
        self.code.push(OneStep::encode_literal(Opcode::PushL, literal));
        self
    }

    /// Pushes a 64-bit value least-significant byte first, matching `PUSHR64`.
    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        for byte in value.to_le_bytes() {
            self.push_literal(byte);
        }
        self
    }

    /// Loads `value` into `register`, returning the index of the first word.
    pub fn load_immediate(&mut self, register: u8, value: u64) -> usize {
        let at = self.code.len();
        self.push_u64(value);
        self.emit(Opcode::Pop64, register, 0);
        at
    }

    /// Rewrites the value of an immediate load emitted earlier.
    pub fn patch_immediate(&mut self, at: usize, value: u64) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.code[at + i] = OneStep::encode_literal(Opcode::PushL, byte);
        }
    }

    /// Loads the tagged address of `builtin` into `scratch` and calls it.
    pub fn call_builtin(&mut self, scratch: u8, builtin: Builtin) -> &mut Self {
        self.load_immediate(scratch, builtin.call_address().value());
        self.emit(Opcode::Call, scratch, 0)
    }

    pub fn finish(self) -> Vec<OneStep> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_layout() {
        let step = OneStep::encode(Opcode::Store64, 0xA, 0x3);
        assert_eq!(step.value(), 0x1CA3);
        assert_eq!(step.opcode(), Some(Opcode::Store64));
        assert_eq!(step.operands(), (0xA, 0x3));

        let literal = OneStep::encode_literal(Opcode::PushL, b'h');
        assert_eq!(literal.value(), 0x1468);
        assert_eq!(literal.literal(), b'h');
    }

    #[test]
    fn test_opcode_numbering() {
        assert_eq!(Opcode::Nop.code(), 0);
        assert_eq!(Opcode::DAdd.code(), 11);
        assert_eq!(Opcode::PushL.code(), 20);
        assert_eq!(Opcode::Load64.code(), 32);
        assert_eq!(Opcode::Call.code(), 39);
        assert_eq!(Opcode::Ret.code(), 40);
        assert!(Opcode::try_from(41u8).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        assert_eq!(Instruction::decode(OneStep(0xFF12)), Err(0xFF));
    }

    #[test]
    fn test_instruction_display() {
        let add = Instruction::decode(OneStep::encode(Opcode::Add, 1, 2)).unwrap();
        assert_eq!(add.to_string(), "ADD r1,r2");
        let push = Instruction::decode(OneStep::encode(Opcode::PushR64, 7, 0)).unwrap();
        assert_eq!(push.to_string(), "PUSHR64 r7");
        let literal = Instruction::decode(OneStep::encode_literal(Opcode::PushL, 0x2a)).unwrap();
        assert_eq!(literal.to_string(), "PUSHL 2a");
        assert_eq!(Opcode::LShift.mnemonic(), "LSHIFT");
    }

    #[test]
    fn test_builtin_call_address() {
        assert_eq!(Builtin::Write.call_address().value(), (1 << 63) | 1);
        assert!(matches!(Builtin::try_from(60u64), Ok(Builtin::Exit)));
        assert!(Builtin::try_from(4u64).is_err());
    }

    #[test]
    fn test_builder_patches_immediate() {
        let mut builder = CodeBuilder::new();
        let at = builder.load_immediate(2, 0);
        assert_eq!(builder.position(), IMMEDIATE_LOAD_LEN as u64);
        builder.patch_immediate(at, 0x0102);
        let code = builder.finish();
        assert_eq!(code[0].literal(), 0x02);
        assert_eq!(code[1].literal(), 0x01);
        assert_eq!(code[8], OneStep::encode(Opcode::Pop64, 2, 0));
    }
}
