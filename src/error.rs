//! Error types
//!
//! Guest-visible problems are traps and never show up here. These types cover
//! host-side failures: a RAM backing that cannot be read, a bad configuration,
//! a snapshot that does not match, an image that does not fit.

use std::io;
use thiserror::Error;

use crate::cpu::trap::Trap;

/// Failure of the storage behind guest RAM.
#[derive(Debug, Error)]
pub enum BackingError {
    #[error("short read at offset {offset:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: u32, wanted: usize, got: usize },

    #[error("short write at offset {offset:#x}: wanted {wanted} bytes, wrote {written}")]
    ShortWrite { offset: u32, wanted: usize, written: usize },

    #[error("RAM backing I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A physical access the bus could not complete.
#[derive(Debug, Error)]
pub enum BusFault {
    /// Nothing answers at this address; the executor turns this into an
    /// access-fault trap.
    #[error("unmapped physical address {0:#010x}")]
    Unmapped(u32),

    /// The RAM store failed. This is a host problem and stops the step loop.
    #[error("RAM backing failed at {addr:#010x}: {source}")]
    Backing {
        addr: u32,
        #[source]
        source: BackingError,
    },
}

/// Why `Machine::step` returned `StepStatus::Fault`.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("guest exception {trap:?} at pc {pc:#010x} (inst {inst:#010x})")]
    Exception { trap: Trap, pc: u32, inst: u32 },

    #[error("bus error at pc {pc:#010x}: {source}")]
    Bus {
        pc: u32,
        #[source]
        source: BusFault,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("RAM size must be a non-zero multiple of 4, got {0}")]
    BadRamSize(u32),

    #[error("RAM base {0:#010x} is not word aligned")]
    BadRamBase(u32),

    #[error("RAM [{base:#010x}, +{size:#x}) runs past the end of the address space")]
    RamWraps { base: u32, size: u32 },

    #[error("MMIO window [{start:#010x}, {end:#010x}) overlaps RAM")]
    MmioOverlapsRam { start: u32, end: u32 },

    #[error("device-tree slot of {dtb_size} bytes does not fit in {ram_size} bytes of RAM")]
    DtbTooLarge { dtb_size: u32, ram_size: u32 },

    #[error("RAM backing holds {backing} bytes but the config asks for {config}")]
    RamSizeMismatch { config: u32, backing: u32 },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("snapshot decoding failed: {0}")]
    Decode(#[source] bincode::Error),

    #[error("snapshot version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("RAM image is {found} bytes, machine has {expected}")]
    RamSize { found: u64, expected: u64 },

    #[error("snapshot compression failed: {0}")]
    Compression(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Backing(#[from] BackingError),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image of {len} bytes at {addr:#010x} does not fit in RAM")]
    DoesNotFit { addr: u32, len: usize },

    #[error("device tree of {len} bytes exceeds the {slot}-byte slot")]
    DtbTooLarge { len: usize, slot: u32 },

    #[error("image decompression failed: {0}")]
    Decompress(#[source] io::Error),

    #[error(transparent)]
    Backing(#[from] BackingError),
}
