//! Guest physical RAM.
//!
//! [`PhysicalMemory`] is a flat, bounds-checked byte array addressed by guest
//! physical address. Every accessor is fallible: an out-of-range access made by
//! the emulator itself is a bug in the caller, so it is reported as a
//! [`MemoryError`] instead of panicking. Guest-visible open-bus behaviour for
//! addresses beyond the end of RAM is layered on top by the MMU's bus adapter.

#![forbid(unsafe_code)]

use std::ops::Range;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("physical access out of range (paddr={paddr:#x}, len={len}, size={size:#x})")]
    OutOfRange { paddr: u64, len: usize, size: u64 },

    #[error("guest RAM size {size:#x} does not fit in the host address space")]
    SizeTooLarge { size: u64 },
}

/// Flat guest RAM starting at physical address 0.
#[derive(Clone, PartialEq, Eq)]
pub struct PhysicalMemory {
    data: Vec<u8>,
}

impl std::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("size", &self.data.len())
            .finish()
    }
}

impl PhysicalMemory {
    /// Allocate `size` bytes of zeroed guest RAM.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let len = usize::try_from(size).map_err(|_| MemoryError::SizeTooLarge { size })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| MemoryError::SizeTooLarge { size })?;
        data.resize(len, 0);
        Ok(Self { data })
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    fn range(&self, paddr: u64, len: usize) -> Result<Range<usize>, MemoryError> {
        let err = MemoryError::OutOfRange {
            paddr,
            len,
            size: self.size(),
        };
        let start = usize::try_from(paddr).map_err(|_| err)?;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.data.len() {
            return Err(err);
        }
        Ok(start..end)
    }

    pub fn try_read_bytes(&self, paddr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(paddr, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    pub fn try_write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(paddr, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    /// Copy a host buffer (a boot image, a test fixture) into guest RAM.
    pub fn load(&mut self, paddr: u64, image: &[u8]) -> Result<(), MemoryError> {
        self.try_write_bytes(paddr, image)
    }

    pub fn try_read_u8(&self, paddr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.try_read_bytes(paddr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn try_read_u16(&self, paddr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.try_read_bytes(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn try_read_u32(&self, paddr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.try_read_bytes(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn try_read_u64(&self, paddr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.try_read_bytes(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn try_write_u8(&mut self, paddr: u64, value: u8) -> Result<(), MemoryError> {
        self.try_write_bytes(paddr, &[value])
    }

    pub fn try_write_u16(&mut self, paddr: u64, value: u16) -> Result<(), MemoryError> {
        self.try_write_bytes(paddr, &value.to_le_bytes())
    }

    pub fn try_write_u32(&mut self, paddr: u64, value: u32) -> Result<(), MemoryError> {
        self.try_write_bytes(paddr, &value.to_le_bytes())
    }

    pub fn try_write_u64(&mut self, paddr: u64, value: u64) -> Result<(), MemoryError> {
        self.try_write_bytes(paddr, &value.to_le_bytes())
    }
}
