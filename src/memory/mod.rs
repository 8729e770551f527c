//! Memory subsystem
//!
//! The executor talks to a [`Bus`]: byte/halfword/word loads and stores on
//! guest-physical addresses plus a separate instruction fetch. Behind the bus
//! sits bulk RAM, held by a [`RamBacking`]: either an in-memory buffer
//! ([`VecRam`]) or any seekable byte store ([`SeekRam`]), e.g. a RAM file on a
//! device with little heap.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BackingError, BusFault};

/// Side effect of an MMIO store the step driver has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioEffect {
    None,
    PowerOff,
    Restart,
}

/// Bus interface for CPU memory access.
///
/// Unaligned data accesses are allowed. `fetch32` is kept apart from `load32`
/// so the executor can report instruction access faults.
pub trait Bus {
    fn load8(&mut self, addr: u32) -> Result<u8, BusFault>;
    fn load16(&mut self, addr: u32) -> Result<u16, BusFault>;
    fn load32(&mut self, addr: u32) -> Result<u32, BusFault>;

    fn store8(&mut self, addr: u32, value: u8) -> Result<MmioEffect, BusFault>;
    fn store16(&mut self, addr: u32, value: u16) -> Result<MmioEffect, BusFault>;
    fn store32(&mut self, addr: u32, value: u32) -> Result<MmioEffect, BusFault>;

    fn fetch32(&mut self, addr: u32) -> Result<u32, BusFault> {
        self.load32(addr)
    }

    /// Whether `[addr, addr + len)` lies entirely in RAM. Atomics are only
    /// performed on RAM.
    fn is_ram(&self, addr: u32, len: u32) -> bool;

    fn load8_signed(&mut self, addr: u32) -> Result<u32, BusFault> {
        Ok(self.load8(addr)? as i8 as i32 as u32)
    }

    fn load16_signed(&mut self, addr: u32) -> Result<u32, BusFault> {
        Ok(self.load16(addr)? as i16 as i32 as u32)
    }

    /// Write to a CSR the CSR file does not implement. Hosts use a few of
    /// these as debug print ports.
    fn debug_csr_write(&mut self, _csr: u32, _value: u32) {}
}

/// Storage behind guest RAM, addressed by offset from the RAM base.
///
/// Callers keep `offset + len <= size()`; the bus checks this before every
/// access.
pub trait RamBacking {
    fn size(&self) -> u32;
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), BackingError>;
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), BackingError>;

    fn read_u32(&mut self, offset: u32) -> Result<u32, BackingError> {
        let mut b = [0u8; 4];
        self.read(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }
}

/// RAM held in a heap buffer.
#[derive(Clone, Serialize, Deserialize)]
pub struct VecRam {
    bytes: Vec<u8>,
}

impl VecRam {
    pub fn new(size: u32) -> Self {
        VecRam {
            bytes: vec![0u8; size as usize],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        VecRam { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl RamBacking for VecRam {
    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    #[inline]
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), BackingError> {
        let start = offset as usize;
        match self.bytes.get(start..start + buf.len()) {
            Some(src) => {
                buf.copy_from_slice(src);
                Ok(())
            }
            None => Err(BackingError::ShortRead {
                offset,
                wanted: buf.len(),
                got: self.bytes.len().saturating_sub(start),
            }),
        }
    }

    #[inline]
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), BackingError> {
        let start = offset as usize;
        let len = self.bytes.len();
        match self.bytes.get_mut(start..start + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                Ok(())
            }
            None => Err(BackingError::ShortWrite {
                offset,
                wanted: data.len(),
                written: len.saturating_sub(start),
            }),
        }
    }
}

/// RAM kept in a seekable byte store. Every access is a positional
/// seek + read/write; nothing is cached.
pub struct SeekRam<S> {
    store: S,
    size: u32,
}

impl<S: Read + Write + Seek> SeekRam<S> {
    pub fn new(store: S, size: u32) -> Self {
        SeekRam { store, size }
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: Read + Write + Seek> RamBacking for SeekRam<S> {
    fn size(&self) -> u32 {
        self.size
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), BackingError> {
        self.store.seek(SeekFrom::Start(offset as u64))?;
        let mut got = 0;
        while got < buf.len() {
            match self.store.read(&mut buf[got..]) {
                Ok(0) => {
                    return Err(BackingError::ShortRead {
                        offset,
                        wanted: buf.len(),
                        got,
                    })
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), BackingError> {
        self.store.seek(SeekFrom::Start(offset as u64))?;
        let mut written = 0;
        while written < data.len() {
            match self.store.write(&data[written..]) {
                Ok(0) => {
                    return Err(BackingError::ShortWrite {
                        offset,
                        wanted: data.len(),
                        written,
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
