//! Error types for loading, encoding and querying object files

use thiserror::Error;

/// Failure to load an object file. Raised before any execution begins.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormatError {
    /// The file does not start with the `NYU` tag
    #[error("not a nyulan object file: bad magic {found:02x?}")]
    BadMagic { found: Vec<u8> },

    /// The byte-order marker is neither little- nor big-endian
    #[error("malformed byte-order marker {found:02x?}")]
    BadByteOrderMark { found: [u8; 2] },

    /// The format version is newer than this implementation understands
    #[error("object file version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u64 },

    /// The input ended in the middle of a field
    #[error("unexpected end of file while reading {field} at offset {offset}")]
    UnexpectedEof { field: &'static str, offset: usize },

    /// A declared length does not fit in memory on this host
    #[error("{field} length {length} is too large")]
    LengthOverflow { field: &'static str, length: u64 },

    /// The object file could not be read from disk
    #[error("couldn't read object file {path}: {message}")]
    Io { path: String, message: String },
}

/// Failure to serialize an object file
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodeError {
    #[error("cannot encode object file version {0}")]
    UnsupportedVersion(u64),

    /// Literal data and the label table use 16-bit counts
    #[error("{field} count {count} exceeds the 16-bit limit")]
    TooMany { field: &'static str, count: usize },

    #[error("object file version {0} cannot carry optional sections")]
    SectionsUnsupported(u64),

    /// Names are stored NUL-terminated
    #[error("name {0:?} contains a NUL byte")]
    NulInName(String),
}

/// A named entry missing from an object file
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LookupError {
    #[error("label \"{0}\" not found")]
    LabelNotFound(String),

    #[error("section \"{0}\" not found")]
    SectionNotFound(String),
}
