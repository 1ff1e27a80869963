//! Object file container
//!
//! An `ObjectFile` is the parsed, immutable form of a nyulan binary: the static
//! data segment, the global label table, the code words and any optional
//! sections. It is built once by [`ObjectFile::from_bytes`] or
//! [`ObjectFile::open`] and only read afterwards, so it can be shared by
//! reference with any number of VMs and debug-info readers.
//!
//! Layout of format version 3, integers in the declared byte order:
//!
//! ```text
//! "NYU"                       magic
//! u16 0x1100                  byte-order marker
//! u64 version
//! u16 n, [u8; n]              literal (static) data
//! u16 n, n * (cstr, u64)      global labels
//! u64                         instruction set version   (version >= 2)
//! u64 n, [u16; n]             code
//! u64 n, n * (cstr, u64 m, [u8; m])  optional sections (version >= 3)
//! ```

mod decode;
mod encode;
mod errors;

pub use errors::{EncodeError, FormatError, LookupError};

use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::bytecode::{Instruction, CURRENT_INSTRUCTION_SET_VERSION};
use crate::types::{Address, OneStep};
use decode::Decoder;
use encode::Encoder;

/// Leading tag of every object file
pub const MAGIC: &[u8; 3] = b"NYU";

/// Highest format version this implementation reads and writes
pub const CURRENT_OBJECTFILE_VERSION: u64 = 3;

/// The marker value; both bytes on disk must match one byte order exactly.
pub const BYTE_ORDER_MARK: u16 = 0x1100;

/// Label conventionally marking the program entry point
pub const ENTRY_LABEL: &str = "_start";

/// Byte order of the multi-byte integers in an object file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Byte order of the host
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    /// Interprets the two marker bytes as they appear in the file.
    pub fn from_marker(marker: [u8; 2]) -> Result<Self, FormatError> {
        match marker {
            [0x00, 0x11] => Ok(Endian::Little),
            [0x11, 0x00] => Ok(Endian::Big),
            found => Err(FormatError::BadByteOrderMark { found }),
        }
    }

    pub fn decode_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        }
    }

    pub fn decode_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    }

    pub fn decode_u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        }
    }

    pub fn encode_u16(self, value: u16) -> [u8; 2] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }

    pub fn encode_u64(self, value: u64) -> [u8; 8] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }
}

impl fmt::Display for Endian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endian::Little => write!(f, "little-endian"),
            Endian::Big => write!(f, "big-endian"),
        }
    }
}

/// Names carry no encoding in the file; summaries show them lossily as UTF-8.
fn serialize_name<S: Serializer>(name: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(name))
}

/// A global label: a name bound to a code address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    /// Raw name bytes, without the terminating NUL
    #[serde(serialize_with = "serialize_name")]
    pub name: Vec<u8>,
    pub address: Address,
}

impl Label {
    pub fn display_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// A named, schema-less payload attached to an object file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionalSection {
    #[serde(serialize_with = "serialize_name")]
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

impl OptionalSection {
    pub fn display_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// A parsed object file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectFile {
    pub endian: Endian,
    pub version: u64,
    pub literal_data: Vec<u8>,
    pub labels: Vec<Label>,
    pub instruction_set_version: u64,
    pub code: Vec<OneStep>,
    pub sections: Vec<OptionalSection>,
}

impl Default for ObjectFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectFile {
    /// An empty object file of the current version in host byte order
    pub fn new() -> Self {
        Self {
            endian: Endian::native(),
            version: CURRENT_OBJECTFILE_VERSION,
            literal_data: Vec::new(),
            labels: Vec::new(),
            instruction_set_version: CURRENT_INSTRUCTION_SET_VERSION,
            code: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// Parses an object file image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        Decoder::new(bytes).decode()
    }

    /// Reads and parses the object file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| FormatError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Serializes the object file in its own byte order and format version.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        Encoder::new(self.endian).encode(self)
    }

    /// First label whose name is exactly `name`, compared byte for byte
    pub fn find_label(&self, name: impl AsRef<[u8]>) -> Result<&Label, LookupError> {
        let name = name.as_ref();
        self.labels
            .iter()
            .find(|label| label.name == name)
            .ok_or_else(|| LookupError::LabelNotFound(String::from_utf8_lossy(name).into_owned()))
    }

    pub fn find_section(&self, name: impl AsRef<[u8]>) -> Result<&OptionalSection, LookupError> {
        let name = name.as_ref();
        self.sections
            .iter()
            .find(|section| section.name == name)
            .ok_or_else(|| {
                LookupError::SectionNotFound(String::from_utf8_lossy(name).into_owned())
            })
    }

    /// Address of the `_start` label
    pub fn entry_point(&self) -> Result<Address, LookupError> {
        self.find_label(ENTRY_LABEL).map(|label| label.address)
    }

    pub fn with_label(mut self, name: impl AsRef<[u8]>, address: u64) -> Self {
        self.labels.push(Label {
            name: name.as_ref().to_vec(),
            address: Address(address),
        });
        self
    }

    pub fn with_section(mut self, name: impl AsRef<[u8]>, data: Vec<u8>) -> Self {
        self.sections.push(OptionalSection {
            name: name.as_ref().to_vec(),
            data,
        });
        self
    }
}

impl fmt::Display for ObjectFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "nyulan objectfile v{} ({})", self.version, self.endian)?;
        writeln!(f, "static data size:{}", self.literal_data.len())?;
        writeln!(f, "static data:\"{}\"", self.literal_data.escape_ascii())?;
        writeln!(f, "global labels:{{")?;
        for label in &self.labels {
            writeln!(
                f,
                "    \"{}\" => @{} ,",
                label.display_name(),
                label.address.value()
            )?;
        }
        writeln!(f, "}}")?;
        writeln!(f, "instruction set version:{}", self.instruction_set_version)?;
        match self.entry_point() {
            Ok(address) => writeln!(f, "entry point:@{}", address.value())?,
            Err(_) => writeln!(f, "entry point:none")?,
        }

        let width = self.code.len().saturating_sub(1).to_string().len();
        for (i, step) in self.code.iter().enumerate() {
            let address = format!("@{}", i);
            match Instruction::decode(*step) {
                Ok(instruction) => writeln!(f, "{:<w$}  {}", address, instruction, w = width + 1)?,
                Err(opcode) => writeln!(
                    f,
                    "{:<w$}  ?? opcode {:#04x} ({})",
                    address,
                    opcode,
                    step,
                    w = width + 1
                )?,
            }
        }

        for section in &self.sections {
            writeln!(
                f,
                "section \"{}\" datasize:{}",
                section.display_name(),
                section.data.len()
            )?;
        }
        Ok(())
    }
}
