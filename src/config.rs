//! Machine configuration
//!
//! Default memory map:
//! 0x10000000 - 0x10000007: UART 8250 (data at +0, LSR at +5)
//! 0x11000000 - 0x1100FFFF: CLINT (msip +0, mtimecmp +0x4000, mtime +0xBFF8)
//! 0x11100000:              SYSCON (0x5555 power off, 0x7777 restart)
//! 0x80000000 - ...:        RAM

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const RAM_BASE: u32 = 0x8000_0000;
pub const DEFAULT_RAM_SIZE: u32 = 12 * 1024 * 1024;
pub const DEFAULT_DTB_SIZE: u32 = 1536;

/// Bytes kept free at the very end of RAM for the hart record; the device
/// tree sits right below them.
pub const HART_RECORD_SLOT: u32 = 192;

pub const UART_BASE: u32 = 0x1000_0000;
pub const CLINT_BASE: u32 = 0x1100_0000;
pub const SYSCON_ADDR: u32 = 0x1110_0000;

pub const CSR_DEBUG_DEC: u32 = 0x136;
pub const CSR_DEBUG_HEX: u32 = 0x137;
pub const CSR_DEBUG_STR: u32 = 0x138;

/// Where the MMIO devices live. Addresses inside `[window_start, window_end)`
/// that no device claims read as zero and drop writes; addresses outside both
/// RAM and the window raise access faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmioMap {
    pub uart_base: u32,
    pub clint_base: u32,
    pub syscon_addr: u32,
    pub window_start: u32,
    pub window_end: u32,
    pub debug_dec_csr: u32,
    pub debug_hex_csr: u32,
    pub debug_str_csr: u32,
}

impl Default for MmioMap {
    fn default() -> Self {
        MmioMap {
            uart_base: UART_BASE,
            clint_base: CLINT_BASE,
            syscon_addr: SYSCON_ADDR,
            window_start: 0x1000_0000,
            window_end: 0x1200_0000,
            debug_dec_csr: CSR_DEBUG_DEC,
            debug_hex_csr: CSR_DEBUG_HEX,
            debug_str_csr: CSR_DEBUG_STR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub ram_base: u32,
    pub ram_size: u32,
    /// Size of the device-tree slot below the hart record slot.
    pub dtb_size: u32,
    /// Stop with `StepStatus::Fault` on any synchronous exception instead of
    /// handing it to the guest.
    pub fail_on_all_faults: bool,
    pub mmio: MmioMap,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            ram_base: RAM_BASE,
            ram_size: DEFAULT_RAM_SIZE,
            dtb_size: DEFAULT_DTB_SIZE,
            fail_on_all_faults: false,
            mmio: MmioMap::default(),
        }
    }
}

impl MachineConfig {
    /// Config with the default map and `ram_size` bytes of RAM.
    pub fn with_ram_size(ram_size: u32) -> Self {
        MachineConfig {
            ram_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ram_size == 0 || self.ram_size % 4 != 0 {
            return Err(ConfigError::BadRamSize(self.ram_size));
        }
        if self.ram_base % 4 != 0 {
            return Err(ConfigError::BadRamBase(self.ram_base));
        }
        let ram_end = self.ram_base as u64 + self.ram_size as u64;
        if ram_end > 1 << 32 {
            return Err(ConfigError::RamWraps {
                base: self.ram_base,
                size: self.ram_size,
            });
        }
        let (start, end) = (self.mmio.window_start as u64, self.mmio.window_end as u64);
        if start < ram_end && (self.ram_base as u64) < end {
            return Err(ConfigError::MmioOverlapsRam {
                start: self.mmio.window_start,
                end: self.mmio.window_end,
            });
        }
        if self.dtb_size as u64 + HART_RECORD_SLOT as u64 > self.ram_size as u64 {
            return Err(ConfigError::DtbTooLarge {
                dtb_size: self.dtb_size,
                ram_size: self.ram_size,
            });
        }
        Ok(())
    }

    /// Guest-physical address of the device-tree slot; also the boot value of `a1`.
    pub fn dtb_addr(&self) -> u32 {
        self.ram_base + self.ram_size - HART_RECORD_SLOT - self.dtb_size
    }

    pub fn ram_end(&self) -> u64 {
        self.ram_base as u64 + self.ram_size as u64
    }
}
