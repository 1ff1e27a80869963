//! Readers for the debug-info sections
//!
//! Two optional sections map code addresses back to source positions:
//!
//! - `debug.addr2line`: byte 0 is the bit width of the file-index field, byte 1
//!   the bit width of the line field, followed by one packed record per code
//!   word. Fields use the object file's byte order.
//! - `debug.sourcefiles`: NUL-terminated paths; the file index selects one.

use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::objectfile::{Endian, LookupError, ObjectFile, OptionalSection};
use crate::types::{Address, OneStep};
use crate::vm::Observer;

pub const ADDR2LINE_SECTION: &str = "debug.addr2line";
pub const SOURCEFILES_SECTION: &str = "debug.sourcefiles";

/// Failure to read or query debug information
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DebugInfoError {
    #[error("expected section \"{expected}\", got \"{found}\"")]
    WrongSection {
        expected: &'static str,
        found: String,
    },

    /// Field widths must be 8, 16, 32 or 64 bits
    #[error("unsupported {field} width of {bits} bits")]
    UnsupportedWidth { field: &'static str, bits: u8 },

    #[error("section \"{0}\" is truncated")]
    Truncated(&'static str),

    #[error("no line information for address {address}")]
    AddressOutOfRange { address: u64 },

    #[error("source file index {index} out of range")]
    FileIndexOutOfRange { index: u64 },

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Position of one code word in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file_index: u64,
    pub line: u64,
}

fn field_bytes(field: &'static str, bits: u8) -> Result<usize, DebugInfoError> {
    match bits {
        8 | 16 | 32 | 64 => Ok(usize::from(bits / 8)),
        _ => Err(DebugInfoError::UnsupportedWidth { field, bits }),
    }
}

fn decode_field(endian: Endian, bytes: &[u8]) -> u64 {
    match *bytes {
        [b0] => u64::from(b0),
        [b0, b1] => u64::from(endian.decode_u16([b0, b1])),
        [b0, b1, b2, b3] => u64::from(endian.decode_u32([b0, b1, b2, b3])),
        [b0, b1, b2, b3, b4, b5, b6, b7] => endian.decode_u64([b0, b1, b2, b3, b4, b5, b6, b7]),
        _ => unreachable!("field widths are validated on construction"),
    }
}

/// Direct-indexed address to line table
#[derive(Debug, Clone)]
pub struct Addr2Line {
    endian: Endian,
    file_width: usize,
    line_width: usize,
    records: Vec<u8>,
}

impl Addr2Line {
    /// Reads the `debug.addr2line` section of `object`
    pub fn new(object: &ObjectFile) -> Result<Self, DebugInfoError> {
        let section = object.find_section(ADDR2LINE_SECTION)?;
        Self::from_section(section, object.endian)
    }

    pub fn from_section(section: &OptionalSection, endian: Endian) -> Result<Self, DebugInfoError> {
        if section.name != ADDR2LINE_SECTION.as_bytes() {
            return Err(DebugInfoError::WrongSection {
                expected: ADDR2LINE_SECTION,
                found: section.display_name().into_owned(),
            });
        }
        let (file_bits, line_bits) = match section.data.as_slice() {
            [file_bits, line_bits, ..] => (*file_bits, *line_bits),
            _ => return Err(DebugInfoError::Truncated(ADDR2LINE_SECTION)),
        };
        Ok(Self {
            endian,
            file_width: field_bytes("file index", file_bits)?,
            line_width: field_bytes("line", line_bits)?,
            records: section.data[2..].to_vec(),
        })
    }

    fn record_len(&self) -> usize {
        self.file_width + self.line_width
    }

    /// Number of code words covered by the table
    pub fn len(&self) -> usize {
        self.records.len() / self.record_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, address: Address) -> Result<SourceLocation, DebugInfoError> {
        let out_of_range = DebugInfoError::AddressOutOfRange {
            address: address.value(),
        };
        let index = usize::try_from(address.value()).map_err(|_| out_of_range.clone())?;
        let record = index
            .checked_mul(self.record_len())
            .and_then(|start| self.records.get(start..start.checked_add(self.record_len())?))
            .ok_or(out_of_range)?;
        let (file, line) = record.split_at(self.file_width);
        Ok(SourceLocation {
            file_index: decode_field(self.endian, file),
            line: decode_field(self.endian, line),
        })
    }
}

/// Paths stored in a `debug.sourcefiles` section. An unterminated tail is dropped.
pub fn source_files(section: &OptionalSection) -> Result<Vec<String>, DebugInfoError> {
    if section.name != SOURCEFILES_SECTION.as_bytes() {
        return Err(DebugInfoError::WrongSection {
            expected: SOURCEFILES_SECTION,
            found: section.display_name().into_owned(),
        });
    }
    let mut paths: Vec<String> = section
        .data
        .split(|&b| b == 0)
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .collect();
    // The piece after the final NUL is either empty or unterminated.
    paths.pop();
    Ok(paths)
}

/// Line table and file names of one object file
#[derive(Debug, Clone)]
pub struct DebugInfo {
    lines: Addr2Line,
    files: Vec<String>,
}

impl DebugInfo {
    pub fn load(object: &ObjectFile) -> Result<Self, DebugInfoError> {
        let lines = Addr2Line::new(object)?;
        let files = source_files(object.find_section(SOURCEFILES_SECTION)?)?;
        Ok(Self { lines, files })
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Source path and line of the word at `address`
    pub fn locate(&self, address: Address) -> Result<(&str, u64), DebugInfoError> {
        let location = self.lines.lookup(address)?;
        let path = usize::try_from(location.file_index)
            .ok()
            .and_then(|i| self.files.get(i))
            .ok_or(DebugInfoError::FileIndexOutOfRange {
                index: location.file_index,
            })?;
        Ok((path.as_str(), location.line))
    }
}

/// Observer that logs the source position of every executed word
#[derive(Debug, Clone)]
pub struct SourceLineTracer {
    info: DebugInfo,
}

impl SourceLineTracer {
    pub fn new(info: DebugInfo) -> Self {
        Self { info }
    }
}

impl Observer for SourceLineTracer {
    fn before_step(&mut self, address: Address, step: OneStep) {
        match self.info.locate(address) {
            Ok((path, line)) => info!("@{} line: {} ({} {})", path, line, address, step),
            Err(e) => info!("{} {}: {}", address, step, e),
        }
    }
}
