//! Machine snapshots
//!
//! The hart record is the CPU state and the CLINT followed by the host's
//! `last_time`, bincode-encoded (little-endian, fixed-width integers) behind
//! a version word. RAM is saved separately as a raw image of exactly
//! `ram_size` bytes.

use std::io::{ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};

use crate::cpu::Cpu;
use crate::devices::Clint;
use crate::error::SnapshotError;
use crate::memory::RamBacking;
use crate::system::Machine;

/// Bumped whenever the hart record layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// RAM is streamed in chunks of this size.
const RAM_CHUNK: usize = 64 * 1024;

#[derive(Serialize)]
struct HartRecordRef<'a> {
    cpu: &'a Cpu,
    clint: &'a Clint,
    last_time: u64,
}

#[derive(Deserialize)]
struct HartRecord {
    cpu: Cpu,
    clint: Clint,
    last_time: u64,
}

impl<R: RamBacking> Machine<R> {
    /// Write the hart record. `last_time` is the host pacer's clock.
    pub fn save_state<W: Write>(&self, mut w: W, last_time: u64) -> Result<(), SnapshotError> {
        let record = HartRecordRef {
            cpu: &self.cpu,
            clint: &self.clint,
            last_time,
        };
        bincode::serialize_into(&mut w, &SNAPSHOT_VERSION).map_err(SnapshotError::Encode)?;
        bincode::serialize_into(&mut w, &record).map_err(SnapshotError::Encode)?;
        log::debug!("saved hart state at pc {:#010x}", self.cpu.pc);
        Ok(())
    }

    /// Replace the hart state with a saved record; returns its `last_time`.
    pub fn load_state<Rd: Read>(&mut self, mut r: Rd) -> Result<u64, SnapshotError> {
        let version: u32 = bincode::deserialize_from(&mut r).map_err(SnapshotError::Decode)?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: version,
                expected: SNAPSHOT_VERSION,
            });
        }
        let record: HartRecord = bincode::deserialize_from(&mut r).map_err(SnapshotError::Decode)?;

        self.cpu = record.cpu;
        self.clint = record.clint;
        self.reset_host_state();
        log::info!(
            "restored hart state: pc {:#010x}, {} instructions retired",
            self.cpu.pc,
            self.cpu.cycle()
        );
        Ok(record.last_time)
    }

    /// Stream all of RAM to `w`.
    pub fn save_ram<W: Write>(&mut self, mut w: W) -> Result<(), SnapshotError> {
        let size = self.config.ram_size;
        let mut buf = vec![0u8; RAM_CHUNK];
        let mut offset = 0u32;
        while offset < size {
            let n = RAM_CHUNK.min((size - offset) as usize);
            self.ram.read(offset, &mut buf[..n])?;
            w.write_all(&buf[..n])?;
            offset += n as u32;
        }
        w.flush()?;
        Ok(())
    }

    /// Fill RAM from `r`, which must hold exactly `ram_size` bytes.
    pub fn load_ram<Rd: Read>(&mut self, mut r: Rd) -> Result<(), SnapshotError> {
        let size = self.config.ram_size;
        let mut buf = vec![0u8; RAM_CHUNK];
        let mut offset = 0u32;
        while offset < size {
            let want = RAM_CHUNK.min((size - offset) as usize);
            let got = read_full(&mut r, &mut buf[..want])?;
            if got < want {
                return Err(SnapshotError::RamSize {
                    found: offset as u64 + got as u64,
                    expected: size as u64,
                });
            }
            self.ram.write(offset, &buf[..want])?;
            offset += want as u32;
        }

        let mut extra = [0u8; 1];
        if read_full(&mut r, &mut extra)? != 0 {
            return Err(SnapshotError::RamSize {
                found: size as u64 + 1,
                expected: size as u64,
            });
        }
        log::info!("restored {} KiB RAM image", size / 1024);
        Ok(())
    }

    /// Hart record followed by RAM, zstd-compressed.
    pub fn save_compressed(&mut self, last_time: u64, level: i32) -> Result<Vec<u8>, SnapshotError> {
        let mut enc = zstd::stream::Encoder::new(Vec::new(), level).map_err(SnapshotError::Compression)?;
        self.save_state(&mut enc, last_time)?;
        self.save_ram(&mut enc)?;
        enc.finish().map_err(SnapshotError::Compression)
    }

    /// Inverse of `save_compressed`; returns the saved `last_time`.
    pub fn load_compressed(&mut self, data: &[u8]) -> Result<u64, SnapshotError> {
        let mut dec = zstd::stream::Decoder::new(data).map_err(SnapshotError::Compression)?;
        let last_time = self.load_state(&mut dec)?;
        self.load_ram(&mut dec)?;
        Ok(last_time)
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<Rd: Read>(r: &mut Rd, buf: &mut [u8]) -> Result<usize, SnapshotError> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(got)
}
