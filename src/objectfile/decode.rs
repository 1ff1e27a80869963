//! Binary decoder for object files
//!
//! Every multi-byte integer is read in the byte order declared by the file's
//! marker, so one decoder handles both little- and big-endian images.

use log::{debug, warn};

use super::errors::FormatError;
use super::{
    Endian, Label, ObjectFile, OptionalSection, BYTE_ORDER_MARK, CURRENT_OBJECTFILE_VERSION, MAGIC,
};
use crate::types::OneStep;

pub(super) struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> Decoder<'a> {
    pub(super) fn new(bytes: &'a [u8]) -> Self {
        // Until the marker is read the order is irrelevant; the magic is bytewise.
        Self {
            bytes,
            pos: 0,
            endian: Endian::Little,
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_exact(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], FormatError> {
        let eof = FormatError::UnexpectedEof {
            field,
            offset: self.pos,
        };
        let end = self.pos.checked_add(n).ok_or_else(|| eof.clone())?;
        if end > self.bytes.len() {
            return Err(eof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, FormatError> {
        let bytes = self.read_exact(2, field)?;
        Ok(self.endian.decode_u16([bytes[0], bytes[1]]))
    }

    fn read_u64(&mut self, field: &'static str) -> Result<u64, FormatError> {
        let bytes = self.read_exact(8, field)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(self.endian.decode_u64(raw))
    }

    fn read_len(&mut self, field: &'static str) -> Result<usize, FormatError> {
        let length = self.read_u64(field)?;
        usize::try_from(length).map_err(|_| FormatError::LengthOverflow { field, length })
    }

    /// Reads a NUL-terminated name as raw bytes.
    fn read_cstring(&mut self, field: &'static str) -> Result<Vec<u8>, FormatError> {
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FormatError::UnexpectedEof {
                field,
                offset: self.bytes.len(),
            })?;
        let name = rest[..nul].to_vec();
        self.pos += nul + 1;
        Ok(name)
    }

    fn read_header(&mut self) -> Result<u64, FormatError> {
        let magic = self.read_exact(MAGIC.len(), "magic")?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic {
                found: magic.to_vec(),
            });
        }

        let bom = self.read_exact(2, "byte-order marker")?;
        let bom = [bom[0], bom[1]];
        self.endian = Endian::from_marker(bom)?;
        debug!("byte order: {:?}", self.endian);
        debug_assert_eq!(self.endian.decode_u16(bom), BYTE_ORDER_MARK);

        let version = self.read_u64("format version")?;
        debug!("format version: {}", version);
        if version > CURRENT_OBJECTFILE_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: version,
                supported: CURRENT_OBJECTFILE_VERSION,
            });
        }
        Ok(version)
    }

    pub(super) fn decode(mut self) -> Result<ObjectFile, FormatError> {
        let version = self.read_header()?;

        let literal_len = self.read_u16("literal data size")? as usize;
        let literal_data = self.read_exact(literal_len, "literal data")?.to_vec();
        debug!("literal data: {} bytes", literal_data.len());

        let label_count = self.read_u16("global label count")?;
        debug!("global labels: {}", label_count);
        let mut labels = Vec::with_capacity(label_count as usize);
        for _ in 0..label_count {
            let name = self.read_cstring("label name")?;
            let address = self.read_u64("label address")?;
            labels.push(Label {
                name,
                address: address.into(),
            });
        }

        let instruction_set_version = if version >= 2 {
            self.read_u64("instruction set version")?
        } else {
            1
        };

        let code_len = self.read_len("code length")?;
        // Guard the allocation against a corrupt length before reading words.
        if code_len.saturating_mul(2) > self.remaining() {
            return Err(FormatError::UnexpectedEof {
                field: "code",
                offset: self.bytes.len(),
            });
        }
        let mut code = Vec::with_capacity(code_len);
        for _ in 0..code_len {
            code.push(OneStep(self.read_u16("code")?));
        }

        let mut sections = Vec::new();
        if version >= 3 {
            let section_count = self.read_u64("optional section count")?;
            for _ in 0..section_count {
                let name = self.read_cstring("section name")?;
                let size = self.read_len("section size")?;
                debug!(
                    "section \"{}\" with {} bytes",
                    String::from_utf8_lossy(&name),
                    size
                );
                let data = self.read_exact(size, "section data")?.to_vec();
                sections.push(OptionalSection { name, data });
            }
        }

        if self.remaining() != 0 {
            warn!("ignoring {} trailing bytes after object file", self.remaining());
        }

        Ok(ObjectFile {
            endian: self.endian,
            version,
            literal_data,
            labels,
            instruction_set_version,
            code,
            sections,
        })
    }
}
