//! Built-in function execution
//!
//! A `CALL` whose target has bit 63 set does not jump. The remaining bits name a
//! host function which pops its arguments off the calculation stack as 64-bit
//! values and may push one 64-bit result back, least-significant byte first.
//!
//! Descriptors 0, 1 and 2 are the host's standard streams. Files opened by
//! `OPEN` get descriptors from 3 upwards and live in a table owned by the VM, so
//! they are closed on `CLOSE` or when the VM is dropped, whichever comes first.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::rc::Rc;

use log::{trace, warn};

use crate::bytecode::Builtin;
use crate::types::Address;
use crate::vm::errors::VMError;
use crate::vm::memory::Memory;
use crate::vm::stack::CalculationStack;

/// Value pushed by OPEN when the file cannot be opened
pub const OPEN_FAILED: u64 = u64::MAX;

/// First descriptor handed out by OPEN
pub const FIRST_FILE_DESCRIPTOR: u64 = 3;

/// The host streams behind descriptors 0, 1 and 2
pub struct HostStreams {
    pub stdin: Box<dyn Read>,
    pub stdout: Box<dyn Write>,
    pub stderr: Box<dyn Write>,
}

impl HostStreams {
    pub fn new(stdin: Box<dyn Read>, stdout: Box<dyn Write>, stderr: Box<dyn Write>) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// The standard streams of this process
    pub fn inherit() -> Self {
        Self::new(
            Box::new(io::stdin()),
            Box::new(io::stdout()),
            Box::new(io::stderr()),
        )
    }
}

impl Default for HostStreams {
    fn default() -> Self {
        Self::inherit()
    }
}

/// A cloneable in-memory writer, for capturing program output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Open files keyed by descriptor
#[derive(Debug)]
pub struct FileTable {
    files: BTreeMap<u64, File>,
    next_fd: u64,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            next_fd: FIRST_FILE_DESCRIPTOR,
        }
    }

    /// Open `path` for reading and writing, creating it if missing.
    pub fn open(&mut self, path: &str) -> io::Result<u64> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, file);
        Ok(fd)
    }

    pub fn close(&mut self, fd: u64) -> Result<(), VMError> {
        self.files
            .remove(&fd)
            .map(drop)
            .ok_or(VMError::BadDescriptor { fd })
    }

    pub fn get_mut(&mut self, fd: u64) -> Result<&mut File, VMError> {
        self.files.get_mut(&fd).ok_or(VMError::BadDescriptor { fd })
    }

    /// Number of open files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Outcome of a built-in call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOutcome {
    Continue,
    Exit(i32),
}

/// Reads until `limit` bytes, a newline (kept) or end of input.
fn read_line_limited<R: Read + ?Sized>(reader: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while line.len() < limit {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(line)
}

/// Host side of the built-in functions: standard streams plus open files
pub struct BuiltinExecution {
    streams: HostStreams,
    files: FileTable,
}

impl BuiltinExecution {
    pub fn new(streams: HostStreams) -> Self {
        Self {
            streams,
            files: FileTable::new(),
        }
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    /// Run `builtin` against the given stack and memory.
    pub fn call(
        &mut self,
        builtin: Builtin,
        stack: &mut CalculationStack,
        memory: &mut Memory,
    ) -> Result<BuiltinOutcome, VMError> {
        match builtin {
            Builtin::Read => {
                let fd = stack.pop_u64()?;
                let buffer = Address(stack.pop_u64()?);
                let length = stack.pop_u64()?;
                let count = self.execute_read(fd, buffer, length, memory)?;
                stack.push_width(count, 8)?;
            }
            Builtin::Write => {
                let fd = stack.pop_u64()?;
                let buffer = Address(stack.pop_u64()?);
                let length = stack.pop_u64()?;
                self.execute_write(fd, buffer, length, memory)?;
            }
            Builtin::Open => {
                let name = Address(stack.pop_u64()?);
                let fd = self.execute_open(name, memory)?;
                stack.push_width(fd, 8)?;
            }
            Builtin::Close => {
                let fd = stack.pop_u64()?;
                trace!("close({})", fd);
                self.files.close(fd)?;
            }
            Builtin::Exit => {
                let status = stack.pop_u64()?;
                trace!("exit({})", status);
                return Ok(BuiltinOutcome::Exit(status as i32));
            }
            Builtin::Malloc => {
                let size = stack.pop_u64()?;
                let address = memory.malloc(size)?;
                stack.push_width(address.value(), 8)?;
            }
            Builtin::Free => {
                let address = Address(stack.pop_u64()?);
                let size = stack.pop_u64()?;
                memory.free(address, size)?;
            }
        }
        Ok(BuiltinOutcome::Continue)
    }

    fn execute_read(
        &mut self,
        fd: u64,
        buffer: Address,
        length: u64,
        memory: &mut Memory,
    ) -> Result<u64, VMError> {
        let limit = usize::try_from(length).unwrap_or(usize::MAX);
        let line = match fd {
            0 => read_line_limited(&mut *self.streams.stdin, limit)?,
            1 | 2 => return Err(VMError::NotReadable { fd }),
            _ => read_line_limited(self.files.get_mut(fd)?, limit)?,
        };
        memory.write_bytes(buffer, &line)?;
        trace!("read({}, {}, {}) = {}", fd, buffer, length, line.len());
        Ok(line.len() as u64)
    }

    fn execute_write(
        &mut self,
        fd: u64,
        buffer: Address,
        length: u64,
        memory: &Memory,
    ) -> Result<(), VMError> {
        let len = usize::try_from(length).map_err(|_| VMError::MemoryAccess {
            space: buffer.space(),
            offset: buffer.offset(),
        })?;
        let bytes = memory.read_bytes(buffer, len)?;
        trace!("write({}, {}, {})", fd, buffer, length);
        let out: &mut dyn Write = match fd {
            0 => return Err(VMError::NotWritable { fd }),
            1 => &mut *self.streams.stdout,
            2 => &mut *self.streams.stderr,
            _ => self.files.get_mut(fd)?,
        };
        out.write_all(&bytes)?;
        out.flush()?;
        Ok(())
    }

    fn execute_open(&mut self, name: Address, memory: &Memory) -> Result<u64, VMError> {
        let raw = memory.read_cstring(name)?;
        let path = String::from_utf8_lossy(&raw);
        match self.files.open(&path) {
            Ok(fd) => {
                trace!("open({:?}) = {}", path, fd);
                Ok(fd)
            }
            Err(e) => {
                warn!("couldn't open {:?}: {}", path, e);
                Ok(OPEN_FAILED)
            }
        }
    }
}
