//! Control and Status Registers
//!
//! Machine-mode CSRs the kernel touches, plus a thin supervisor shadow.
//! Unknown CSRs read as zero; writes to them are reported back to the caller
//! so the host can treat a few of them as debug ports.

use super::PrivilegeLevel;
use serde::{Serialize, Deserialize};

// Supervisor CSRs
pub const CSR_SSTATUS: u32 = 0x100;
pub const CSR_SIE: u32 = 0x104;
pub const CSR_STVEC: u32 = 0x105;
pub const CSR_SSCRATCH: u32 = 0x140;
pub const CSR_SEPC: u32 = 0x141;
pub const CSR_SCAUSE: u32 = 0x142;
pub const CSR_STVAL: u32 = 0x143;
pub const CSR_SIP: u32 = 0x144;

// Machine CSRs
pub const CSR_MSTATUS: u32 = 0x300;
pub const CSR_MISA: u32 = 0x301;
pub const CSR_MIE: u32 = 0x304;
pub const CSR_MTVEC: u32 = 0x305;
pub const CSR_MSCRATCH: u32 = 0x340;
pub const CSR_MEPC: u32 = 0x341;
pub const CSR_MCAUSE: u32 = 0x342;
pub const CSR_MTVAL: u32 = 0x343;
pub const CSR_MIP: u32 = 0x344;
pub const CSR_MVENDORID: u32 = 0xF11;
pub const CSR_MARCHID: u32 = 0xF12;
pub const CSR_MIMPID: u32 = 0xF13;
pub const CSR_MHARTID: u32 = 0xF14;

// Counters
pub const CSR_MCYCLE: u32 = 0xB00;
pub const CSR_MINSTRET: u32 = 0xB02;
pub const CSR_MCYCLEH: u32 = 0xB80;
pub const CSR_MINSTRETH: u32 = 0xB82;
pub const CSR_CYCLE: u32 = 0xC00;
pub const CSR_TIME: u32 = 0xC01;
pub const CSR_INSTRET: u32 = 0xC02;
pub const CSR_CYCLEH: u32 = 0xC80;
pub const CSR_TIMEH: u32 = 0xC81;
pub const CSR_INSTRETH: u32 = 0xC82;

// MSTATUS bits
pub const MSTATUS_SIE: u32 = 1 << 1;
pub const MSTATUS_MIE: u32 = 1 << 3;
pub const MSTATUS_SPIE: u32 = 1 << 5;
pub const MSTATUS_MPIE: u32 = 1 << 7;
pub const MSTATUS_SPP: u32 = 1 << 8;
pub const MSTATUS_MPP: u32 = 3 << 11;
pub const MSTATUS_MPP_SHIFT: u32 = 11;

const MSTATUS_WRITABLE: u32 =
    MSTATUS_SIE | MSTATUS_MIE | MSTATUS_SPIE | MSTATUS_MPIE | MSTATUS_SPP | MSTATUS_MPP;
const SSTATUS_MASK: u32 = MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP;

// MIP/MIE bits (interrupt pending/enable)
pub const MIP_SSIP: u32 = 1 << 1;  // Supervisor software interrupt
pub const MIP_MSIP: u32 = 1 << 3;  // Machine software interrupt
pub const MIP_STIP: u32 = 1 << 5;  // Supervisor timer interrupt
pub const MIP_MTIP: u32 = 1 << 7;  // Machine timer interrupt
pub const MIP_SEIP: u32 = 1 << 9;  // Supervisor external interrupt
pub const MIP_MEIP: u32 = 1 << 11; // Machine external interrupt

const MIE_WRITABLE: u32 = MIP_SSIP | MIP_MSIP | MIP_STIP | MIP_MTIP | MIP_SEIP | MIP_MEIP;
// MTIP, MSIP and MEIP follow the devices; software only owns the S bits.
const MIP_WRITABLE: u32 = MIP_SSIP | MIP_STIP | MIP_SEIP;
const S_INTERRUPTS: u32 = MIP_SSIP | MIP_STIP | MIP_SEIP;

/// RV32 with I, M, A and user mode.
pub const MISA_RV32IMAU: u32 = (1 << 30) | (1 << 0) | (1 << 8) | (1 << 12) | (1 << 20);
pub const MVENDORID: u32 = 0xff0f_f0ff;

/// A 64-bit counter that RV32 software sees as two 32-bit halves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter64(u64);

impl Counter64 {
    pub const fn new(value: u64) -> Self {
        Counter64(value)
    }

    #[inline(always)]
    pub fn get(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn set(&mut self, value: u64) {
        self.0 = value;
    }

    #[inline(always)]
    pub fn lo(self) -> u32 {
        self.0 as u32
    }

    #[inline(always)]
    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn set_lo(&mut self, value: u32) {
        self.0 = (self.0 & 0xFFFF_FFFF_0000_0000) | value as u64;
    }

    pub fn set_hi(&mut self, value: u32) {
        self.0 = (self.0 & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
    }

    #[inline(always)]
    pub fn add(&mut self, n: u64) {
        self.0 = self.0.wrapping_add(n);
    }
}

/// CSR storage
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Csr {
    /// MSTATUS register (SSTATUS is a masked view)
    pub mstatus: u32,
    /// Machine interrupt enable
    pub mie: u32,
    /// Machine interrupt pending
    pub mip: u32,
    /// Machine trap vector (direct mode only)
    pub mtvec: u32,
    pub mscratch: u32,
    pub mepc: u32,
    pub mcause: u32,
    pub mtval: u32,

    pub stvec: u32,
    pub sscratch: u32,
    pub sepc: u32,
    pub scause: u32,
    pub stval: u32,

    /// Retired instructions; also serves cycle and instret.
    pub cycle: Counter64,
    /// Read-only mirror of the CLINT's mtime, refreshed by the step driver.
    pub time: Counter64,
}

impl Csr {
    pub fn new() -> Self {
        Csr {
            mstatus: 0,
            mie: 0,
            mip: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            stvec: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            cycle: Counter64::default(),
            time: Counter64::default(),
        }
    }

    /// CSR[9:8] encodes the lowest privilege allowed to touch the register.
    pub fn accessible(addr: u32, priv_level: PrivilegeLevel) -> bool {
        let min_priv = ((addr >> 8) & 3) as u8;
        priv_level as u8 >= min_priv
    }

    /// CSR[11:10] == 0b11 marks a read-only register.
    pub fn is_read_only(addr: u32) -> bool {
        (addr >> 10) & 3 == 3
    }

    /// Registers this file implements. Privilege checks only apply to these;
    /// everything else is tolerated at any level.
    pub fn is_known(addr: u32) -> bool {
        matches!(
            addr,
            CSR_MSTATUS | CSR_MISA | CSR_MIE | CSR_MIP | CSR_MTVEC | CSR_MSCRATCH
                | CSR_MEPC | CSR_MCAUSE | CSR_MTVAL | CSR_MVENDORID | CSR_MARCHID
                | CSR_MIMPID | CSR_MHARTID | CSR_SSTATUS | CSR_SIE | CSR_SIP
                | CSR_STVEC | CSR_SSCRATCH | CSR_SEPC | CSR_SCAUSE | CSR_STVAL
                | CSR_MCYCLE | CSR_MINSTRET | CSR_MCYCLEH | CSR_MINSTRETH
                | CSR_CYCLE | CSR_TIME | CSR_INSTRET | CSR_CYCLEH | CSR_TIMEH
                | CSR_INSTRETH
        )
    }

    /// Read CSR. Unknown addresses read as zero.
    pub fn read(&self, addr: u32) -> u32 {
        match addr {
            CSR_MSTATUS => self.mstatus,
            CSR_MISA => MISA_RV32IMAU,
            CSR_MIE => self.mie,
            CSR_MIP => self.mip,
            CSR_MTVEC => self.mtvec,
            CSR_MSCRATCH => self.mscratch,
            CSR_MEPC => self.mepc,
            CSR_MCAUSE => self.mcause,
            CSR_MTVAL => self.mtval,
            CSR_MVENDORID => MVENDORID,
            CSR_MARCHID | CSR_MIMPID | CSR_MHARTID => 0,

            CSR_SSTATUS => self.mstatus & SSTATUS_MASK,
            CSR_SIE => self.mie & S_INTERRUPTS,
            CSR_SIP => self.mip & S_INTERRUPTS,
            CSR_STVEC => self.stvec,
            CSR_SSCRATCH => self.sscratch,
            CSR_SEPC => self.sepc,
            CSR_SCAUSE => self.scause,
            CSR_STVAL => self.stval,

            CSR_MCYCLE | CSR_MINSTRET | CSR_CYCLE | CSR_INSTRET => self.cycle.lo(),
            CSR_MCYCLEH | CSR_MINSTRETH | CSR_CYCLEH | CSR_INSTRETH => self.cycle.hi(),
            CSR_TIME => self.time.lo(),
            CSR_TIMEH => self.time.hi(),

            _ => 0,
        }
    }

    /// Write CSR. Returns false if the address is not one this file
    /// implements; read-only registers swallow the write and return true.
    pub fn write(&mut self, addr: u32, value: u32) -> bool {
        match addr {
            CSR_MSTATUS => self.mstatus = value & MSTATUS_WRITABLE,
            CSR_MISA => {}
            CSR_MIE => self.mie = value & MIE_WRITABLE,
            CSR_MIP => self.mip = (self.mip & !MIP_WRITABLE) | (value & MIP_WRITABLE),
            CSR_MTVEC => self.mtvec = value & !3,
            CSR_MSCRATCH => self.mscratch = value,
            CSR_MEPC => self.mepc = value & !1,
            CSR_MCAUSE => self.mcause = value,
            CSR_MTVAL => self.mtval = value,

            CSR_SSTATUS => {
                self.mstatus = (self.mstatus & !SSTATUS_MASK) | (value & SSTATUS_MASK);
            }
            CSR_SIE => self.mie = (self.mie & !S_INTERRUPTS) | (value & S_INTERRUPTS),
            CSR_SIP => self.mip = (self.mip & !MIP_SSIP) | (value & MIP_SSIP),
            CSR_STVEC => self.stvec = value & !3,
            CSR_SSCRATCH => self.sscratch = value,
            CSR_SEPC => self.sepc = value & !1,
            CSR_SCAUSE => self.scause = value,
            CSR_STVAL => self.stval = value,

            CSR_MCYCLE | CSR_MINSTRET => self.cycle.set_lo(value),
            CSR_MCYCLEH | CSR_MINSTRETH => self.cycle.set_hi(value),

            a if Self::is_read_only(a) => {}
            _ => return false,
        }
        true
    }

    /// Set or clear an interrupt pending bit driven by a device.
    pub fn set_interrupt_line(&mut self, bit: u32, level: bool) {
        if level {
            self.mip |= bit;
        } else {
            self.mip &= !bit;
        }
    }

    pub fn reset(&mut self) {
        *self = Csr::new();
    }
}

impl Default for Csr {
    fn default() -> Self {
        Self::new()
    }
}
