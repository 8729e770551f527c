//! CLINT - Core Local Interruptor
//!
//! Timer and software interrupts for the single hart. `mtime` only moves
//! when the step driver advances it; guest writes to it are ignored.

// CLINT memory map (relative to base)
const MSIP_BASE: u32 = 0x0000;       // Machine Software Interrupt Pending
const MTIMECMP_BASE: u32 = 0x4000;   // Machine Timer Compare
const MTIME_BASE: u32 = 0xBFF8;      // Machine Timer

/// Size of the register window
pub const CLINT_SIZE: u32 = 0x1_0000;

use crate::cpu::Counter64;
use serde::{Serialize, Deserialize};

/// CLINT device
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Clint {
    /// Machine Software Interrupt Pending (bit 0)
    msip: u32,
    /// Timer compare value; 0 means disarmed
    mtimecmp: Counter64,
    /// Current timer value, in microseconds
    mtime: Counter64,

    /// Timer interrupt pending
    timer_pending: bool,
}

impl Clint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the timer by `elapsed_us` and re-evaluate the compare.
    pub fn advance(&mut self, elapsed_us: u64) {
        self.mtime.add(elapsed_us);
        self.check_timer();
    }

    fn check_timer(&mut self) {
        let cmp = self.mtimecmp.get();
        self.timer_pending = cmp != 0 && self.mtime.get() >= cmp;
    }

    pub fn mtime(&self) -> Counter64 {
        self.mtime
    }

    pub fn mtimecmp(&self) -> Counter64 {
        self.mtimecmp
    }

    pub fn set_mtimecmp(&mut self, value: u64) {
        self.mtimecmp.set(value);
        self.check_timer();
    }

    pub fn timer_pending(&self) -> bool {
        self.timer_pending
    }

    pub fn software_pending(&self) -> bool {
        self.msip & 1 != 0
    }

    pub fn read8(&self, offset: u32) -> u8 {
        let word = self.read32(offset & !3);
        (word >> ((offset & 3) * 8)) as u8
    }

    pub fn write8(&mut self, offset: u32, value: u8) {
        let shift = (offset & 3) * 8;
        let word = self.read32(offset & !3);
        let word = (word & !(0xFF << shift)) | ((value as u32) << shift);
        self.write32(offset & !3, word);
    }

    pub fn read16(&self, offset: u32) -> u16 {
        let word = self.read32(offset & !3);
        (word >> ((offset & 2) * 8)) as u16
    }

    pub fn write16(&mut self, offset: u32, value: u16) {
        let shift = (offset & 2) * 8;
        let word = self.read32(offset & !3);
        let word = (word & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write32(offset & !3, word);
    }

    pub fn read32(&self, offset: u32) -> u32 {
        match offset & !3 {
            MSIP_BASE => self.msip,
            MTIMECMP_BASE => self.mtimecmp.lo(),
            o if o == MTIMECMP_BASE + 4 => self.mtimecmp.hi(),
            MTIME_BASE => self.mtime.lo(),
            o if o == MTIME_BASE + 4 => self.mtime.hi(),
            _ => 0,
        }
    }

    pub fn write32(&mut self, offset: u32, value: u32) {
        match offset & !3 {
            MSIP_BASE => self.msip = value & 1,
            MTIMECMP_BASE => {
                // The guest is re-arming; drop the old interrupt until the
                // next advance sees the new compare.
                self.mtimecmp.set_lo(value);
                self.timer_pending = false;
            }
            o if o == MTIMECMP_BASE + 4 => {
                self.mtimecmp.set_hi(value);
                self.check_timer();
            }
            _ => {}
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
