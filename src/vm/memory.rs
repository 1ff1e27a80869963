//! VM memory
//!
//! Two address spaces share one 64-bit address. Bit 63 selects the space and
//! [`Memory::resolve`] is the only place that looks at it; every load, store and
//! built-in goes through [`Memory::read`] and [`Memory::write`]. A multi-byte
//! access never carries from one space into the other.

use std::collections::BTreeMap;

use log::trace;

use crate::types::{Address, AddressSpace, STATIC_BIT};
use crate::vm::errors::VMError;
use crate::vm::types::Limits;

/// Dynamic and static memory of one VM
#[derive(Debug, Clone)]
pub struct Memory {
    /// Sparse working memory; a byte exists once it has been written
    dynamic: BTreeMap<u64, u8>,

    /// Live MALLOC extents, base offset to size. Unwritten bytes inside read as zero.
    heap: BTreeMap<u64, u64>,

    /// Read-only data loaded from the object file
    static_data: BTreeMap<u64, u8>,

    /// Next address handed out by `malloc`
    heap_next: u64,

    /// Bytes currently covered by `heap`
    heap_in_use: u64,

    max_heap_bytes: u64,
}

impl Memory {
    pub fn new(static_data: BTreeMap<u64, u8>, heap_base: u64) -> Self {
        Self {
            dynamic: BTreeMap::new(),
            heap: BTreeMap::new(),
            static_data,
            heap_next: heap_base & !STATIC_BIT,
            heap_in_use: 0,
            max_heap_bytes: Limits::default().max_heap_bytes,
        }
    }

    /// Static data laid out contiguously from offset 0
    pub fn from_literal_data(literal_data: &[u8], heap_base: u64) -> Self {
        let static_data = literal_data
            .iter()
            .enumerate()
            .map(|(offset, &byte)| (offset as u64, byte))
            .collect();
        Self::new(static_data, heap_base)
    }

    /// Split an address into its space and offset.
    pub fn resolve(address: Address) -> (AddressSpace, u64) {
        (address.space(), address.offset())
    }

    /// Fails unless `len` bytes from `address` stay inside its space.
    fn check_span(address: Address, len: u64) -> Result<(), VMError> {
        let (space, offset) = Self::resolve(address);
        match offset.checked_add(len) {
            Some(end) if end <= STATIC_BIT => Ok(()),
            _ => Err(VMError::CrossesAddressSpace { space, offset, len }),
        }
    }

    fn in_heap(&self, offset: u64) -> bool {
        self.heap
            .range(..=offset)
            .next_back()
            .map_or(false, |(&base, &size)| offset - base < size)
    }

    pub fn read(&self, address: Address) -> Result<u8, VMError> {
        let (space, offset) = Self::resolve(address);
        let cell = match space {
            AddressSpace::Dynamic => match self.dynamic.get(&offset) {
                Some(&byte) => Some(byte),
                None if self.in_heap(offset) => Some(0),
                None => None,
            },
            AddressSpace::Static => self.static_data.get(&offset).copied(),
        };
        cell.ok_or(VMError::MemoryAccess { space, offset })
    }

    pub fn write(&mut self, address: Address, byte: u8) -> Result<(), VMError> {
        match Self::resolve(address) {
            (AddressSpace::Dynamic, offset) => {
                self.dynamic.insert(offset, byte);
                Ok(())
            }
            (AddressSpace::Static, offset) => Err(VMError::WriteToStatic { offset }),
        }
    }

    /// Read `len` consecutive bytes starting at `address`
    pub fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>, VMError> {
        Self::check_span(address, len as u64)?;
        (0..len as u64).map(|i| self.read(address + i)).collect()
    }

    pub fn write_bytes(&mut self, address: Address, bytes: &[u8]) -> Result<(), VMError> {
        Self::check_span(address, bytes.len() as u64)?;
        for (i, &byte) in bytes.iter().enumerate() {
            self.write(address + i as u64, byte)?;
        }
        Ok(())
    }

    /// Little-endian load of `width` bytes
    pub fn read_width(&self, address: Address, width: usize) -> Result<u64, VMError> {
        let bytes = self.read_bytes(address, width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |value, &byte| (value << 8) | u64::from(byte)))
    }

    /// Little-endian store of the low `width` bytes of `value`
    pub fn write_width(&mut self, address: Address, value: u64, width: usize) -> Result<(), VMError> {
        self.write_bytes(address, &value.to_le_bytes()[..width])
    }

    /// Bytes from `address` up to, not including, the first NUL
    pub fn read_cstring(&self, address: Address) -> Result<Vec<u8>, VMError> {
        let mut bytes = Vec::new();
        let mut cursor = address;
        loop {
            match self.read(cursor)? {
                0 => return Ok(bytes),
                byte => bytes.push(byte),
            }
            Self::check_span(address, bytes.len() as u64 + 1)?;
            cursor += Address(1);
        }
    }

    /// Reserve `size` zeroed dynamic bytes. Addresses are never handed out twice.
    pub fn malloc(&mut self, size: u64) -> Result<Address, VMError> {
        let exhausted = VMError::HeapExhausted {
            requested: size,
            limit: self.max_heap_bytes,
        };
        let in_use = self
            .heap_in_use
            .checked_add(size)
            .filter(|&total| total <= self.max_heap_bytes)
            .ok_or_else(|| exhausted.clone())?;
        let next = self
            .heap_next
            .checked_add(size.max(1))
            .filter(|&end| end <= STATIC_BIT)
            .ok_or(exhausted)?;

        let base = self.heap_next;
        if size > 0 {
            self.heap.insert(base, size);
        }
        self.heap_next = next;
        self.heap_in_use = in_use;
        trace!("malloc({}) = {}", size, Address::dynamic(base));
        Ok(Address::dynamic(base))
    }

    /// Drop `size` bytes at `address`; later reads of them fault.
    pub fn free(&mut self, address: Address, size: u64) -> Result<(), VMError> {
        let start = match Self::resolve(address) {
            (AddressSpace::Dynamic, offset) => offset,
            (AddressSpace::Static, offset) => return Err(VMError::WriteToStatic { offset }),
        };
        Self::check_span(address, size)?;
        let end = start + size;

        let mut tail = self.dynamic.split_off(&start);
        let mut kept = tail.split_off(&end);
        self.dynamic.append(&mut kept);

        let overlapping: Vec<(u64, u64)> = self
            .heap
            .range(..end)
            .rev()
            .take_while(|&(&base, &len)| base + len > start)
            .map(|(&base, &len)| (base, len))
            .collect();
        for (base, len) in overlapping {
            self.heap.remove(&base);
            let extent_end = base + len;
            if base < start {
                self.heap.insert(base, start - base);
            }
            if extent_end > end {
                self.heap.insert(end, extent_end - end);
            }
            let freed = extent_end.min(end) - base.max(start);
            self.heap_in_use -= freed;
        }
        trace!("free({}, {})", address, size);
        Ok(())
    }

    /// Move the allocation cursor. Only meaningful before the first `malloc`.
    pub fn set_heap_base(&mut self, heap_base: u64) {
        self.heap_next = heap_base & !STATIC_BIT;
    }

    pub fn set_heap_limit(&mut self, max_heap_bytes: u64) {
        self.max_heap_bytes = max_heap_bytes;
    }

    /// Bytes held by live allocations
    pub fn heap_in_use(&self) -> u64 {
        self.heap_in_use
    }
}
