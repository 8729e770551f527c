//! RV32IMA CPU module
//!
//! Implements the RISC-V 32-bit base integer instruction set
//! with M (multiply/divide) and A (atomic) extensions, Zicsr, and the
//! Machine-mode trap machinery.

pub mod csr;
pub mod decode;
mod execute;
pub mod trap;

pub use csr::{Counter64, Csr};
pub use trap::Trap;

use crate::error::BusFault;
use crate::memory::{Bus, MmioEffect};
use serde::{Serialize, Deserialize};

/// Privilege levels
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl From<u8> for PrivilegeLevel {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => PrivilegeLevel::User,
            1 => PrivilegeLevel::Supervisor,
            _ => PrivilegeLevel::Machine,
        }
    }
}

/// Why an instruction did not retire.
#[derive(Debug)]
pub enum ExecError {
    /// Guest-visible exception; `pc` still points at the instruction.
    Trap(Trap),
    /// The RAM backing failed. Nothing was committed.
    Bus(BusFault),
}

impl From<Trap> for ExecError {
    fn from(trap: Trap) -> Self {
        ExecError::Trap(trap)
    }
}

impl ExecError {
    /// Classify a bus fault: unmapped addresses become the given trap, a
    /// failing RAM backing stays a host error.
    pub(crate) fn from_bus(err: BusFault, trap: Trap) -> Self {
        match err {
            BusFault::Unmapped(_) => ExecError::Trap(trap),
            other => ExecError::Bus(other),
        }
    }
}

/// CPU state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cpu {
    /// Program counter
    pub pc: u32,
    /// General purpose registers (x0-x31)
    pub regs: [u32; 32],
    /// Control and Status Registers
    pub csr: Csr,
    /// Current privilege level
    pub priv_level: PrivilegeLevel,

    /// Wait for interrupt (WFI executed)
    pub wfi: bool,

    /// LR/SC reservation: word address of the most recent LR.W
    pub reservation: Option<u32>,

    /// Last instruction word fetched, for fault reports
    #[serde(skip)]
    pub last_inst: u32,
}

impl Cpu {
    /// Boot state: Machine mode at `entry`, `a0` = hart id 0, `a1` = device tree.
    pub fn new(entry: u32, dtb_addr: u32) -> Self {
        let mut cpu = Cpu {
            pc: entry,
            regs: [0u32; 32],
            csr: Csr::new(),
            priv_level: PrivilegeLevel::Machine,
            wfi: false,
            reservation: None,
            last_inst: 0,
        };
        cpu.regs[10] = 0;
        cpu.regs[11] = dtb_addr;
        cpu
    }

    /// Read register (x0 always returns 0)
    #[inline(always)]
    pub fn read_reg(&self, reg: usize) -> u32 {
        if reg == 0 {
            0
        } else {
            self.regs[reg & 0x1F]
        }
    }

    /// Write register (x0 writes are ignored)
    #[inline(always)]
    pub fn write_reg(&mut self, reg: usize, value: u32) {
        if reg != 0 {
            self.regs[reg & 0x1F] = value;
        }
    }

    /// Fetch, decode and execute one instruction.
    ///
    /// On success the instruction has retired and `cycle` advanced by one.
    /// On a trap nothing was committed and `pc` still addresses the
    /// instruction; the caller decides whether to deliver it.
    pub fn step(&mut self, bus: &mut impl Bus) -> Result<MmioEffect, ExecError> {
        let pc = self.pc;
        self.last_inst = 0;
        if pc & 3 != 0 {
            return Err(Trap::InstructionAddressMisaligned(pc).into());
        }

        let inst = bus
            .fetch32(pc)
            .map_err(|e| ExecError::from_bus(e, Trap::InstructionAccessFault(pc)))?;
        self.last_inst = inst;

        let effect = self.execute(inst, bus)?;

        self.regs[0] = 0;
        self.csr.cycle.add(1);

        Ok(effect)
    }

    /// Back to the boot state; `csr`, privilege and reservation are cleared.
    pub fn reset(&mut self, entry: u32, dtb_addr: u32) {
        *self = Cpu::new(entry, dtb_addr);
    }

    /// Check for pending interrupts
    pub fn check_interrupts(&self) -> Option<Trap> {
        trap::check_pending_interrupts(self)
    }

    /// Handle a trap (exception or interrupt)
    pub fn handle_trap(&mut self, trap: Trap) {
        trap::handle_trap(self, trap);
    }

    /// Whether any enabled interrupt is pending, regardless of `mstatus.MIE`.
    /// This is the WFI wake-up condition.
    pub fn interrupt_pending(&self) -> bool {
        self.csr.mip & self.csr.mie != 0
    }

    /// Retired instruction count
    pub fn cycle(&self) -> u64 {
        self.csr.cycle.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_creation() {
        let cpu = Cpu::new(0x8000_0000, 0x80BF_F940);
        assert_eq!(cpu.pc, 0x8000_0000);
        assert_eq!(cpu.read_reg(0), 0);
        assert_eq!(cpu.read_reg(10), 0);
        assert_eq!(cpu.read_reg(11), 0x80BF_F940);
        assert_eq!(cpu.priv_level, PrivilegeLevel::Machine);
    }

    #[test]
    fn test_x0_always_zero() {
        let mut cpu = Cpu::new(0x8000_0000, 0);
        cpu.write_reg(0, 0xDEADBEEF);
        assert_eq!(cpu.read_reg(0), 0);

        cpu.write_reg(1, 0x12345678);
        assert_eq!(cpu.read_reg(1), 0x12345678);
    }

    #[test]
    fn test_privilege_from_mpp() {
        assert_eq!(PrivilegeLevel::from(0), PrivilegeLevel::User);
        assert_eq!(PrivilegeLevel::from(1), PrivilegeLevel::Supervisor);
        assert_eq!(PrivilegeLevel::from(3), PrivilegeLevel::Machine);
    }
}
