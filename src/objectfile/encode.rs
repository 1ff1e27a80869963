//! Binary encoder for object files
//!
//! Output is canonical: decoding the bytes and encoding again is byte-identical.

use super::errors::EncodeError;
use super::{Endian, ObjectFile, BYTE_ORDER_MARK, CURRENT_OBJECTFILE_VERSION, MAGIC};

pub(super) struct Encoder {
    buf: Vec<u8>,
    endian: Endian,
}

impl Encoder {
    pub(super) fn new(endian: Endian) -> Self {
        Self {
            buf: Vec::new(),
            endian,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_u16(&mut self, v: u16) {
        let bytes = self.endian.encode_u16(v);
        self.buf.extend_from_slice(&bytes);
    }

    fn write_u64(&mut self, v: u64) {
        let bytes = self.endian.encode_u64(v);
        self.buf.extend_from_slice(&bytes);
    }

    fn write_count16(&mut self, count: usize, field: &'static str) -> Result<(), EncodeError> {
        let count16 = u16::try_from(count).map_err(|_| EncodeError::TooMany { field, count })?;
        self.write_u16(count16);
        Ok(())
    }

    fn write_cstring(&mut self, name: &[u8]) -> Result<(), EncodeError> {
        if name.contains(&0) {
            return Err(EncodeError::NulInName(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }
        self.write_bytes(name);
        self.buf.push(0);
        Ok(())
    }

    pub(super) fn encode(mut self, object: &ObjectFile) -> Result<Vec<u8>, EncodeError> {
        let version = object.version;
        if version > CURRENT_OBJECTFILE_VERSION {
            return Err(EncodeError::UnsupportedVersion(version));
        }
        if version < 3 && !object.sections.is_empty() {
            return Err(EncodeError::SectionsUnsupported(version));
        }

        self.write_bytes(MAGIC);
        self.write_u16(BYTE_ORDER_MARK);
        self.write_u64(version);

        self.write_count16(object.literal_data.len(), "literal data")?;
        self.write_bytes(&object.literal_data);

        self.write_count16(object.labels.len(), "global label")?;
        for label in &object.labels {
            self.write_cstring(&label.name)?;
            self.write_u64(label.address.value());
        }

        if version >= 2 {
            self.write_u64(object.instruction_set_version);
        }

        self.write_u64(object.code.len() as u64);
        for step in &object.code {
            self.write_u16(step.value());
        }

        if version >= 3 {
            self.write_u64(object.sections.len() as u64);
            for section in &object.sections {
                self.write_cstring(&section.name)?;
                self.write_u64(section.data.len() as u64);
                self.write_bytes(&section.data);
            }
        }

        Ok(self.buf)
    }
}
