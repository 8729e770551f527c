//! Trap handling (exceptions and interrupts)
//!
//! Every trap enters Machine mode; there is no delegation to Supervisor.

use super::{Cpu, PrivilegeLevel};
use super::csr::*;
use serde::{Serialize, Deserialize};

/// Exception/interrupt cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trap {
    // Exceptions (synchronous)
    InstructionAddressMisaligned(u32),
    InstructionAccessFault(u32),
    IllegalInstruction(u32),
    Breakpoint,
    LoadAddressMisaligned(u32),
    LoadAccessFault(u32),
    StoreAddressMisaligned(u32),
    StoreAccessFault(u32),
    EnvironmentCallFromU,
    EnvironmentCallFromS,
    EnvironmentCallFromM,

    // Interrupts (asynchronous)
    SupervisorSoftwareInterrupt,
    MachineSoftwareInterrupt,
    SupervisorTimerInterrupt,
    MachineTimerInterrupt,
    SupervisorExternalInterrupt,
    MachineExternalInterrupt,
}

impl Trap {
    /// Get the cause code for mcause
    pub fn code(&self) -> u32 {
        match self {
            // Exceptions
            Trap::InstructionAddressMisaligned(_) => 0,
            Trap::InstructionAccessFault(_) => 1,
            Trap::IllegalInstruction(_) => 2,
            Trap::Breakpoint => 3,
            Trap::LoadAddressMisaligned(_) => 4,
            Trap::LoadAccessFault(_) => 5,
            Trap::StoreAddressMisaligned(_) => 6,
            Trap::StoreAccessFault(_) => 7,
            Trap::EnvironmentCallFromU => 8,
            Trap::EnvironmentCallFromS => 9,
            Trap::EnvironmentCallFromM => 11,

            // Interrupts (bit 31 set)
            Trap::SupervisorSoftwareInterrupt => 0x80000000 | 1,
            Trap::MachineSoftwareInterrupt => 0x80000000 | 3,
            Trap::SupervisorTimerInterrupt => 0x80000000 | 5,
            Trap::MachineTimerInterrupt => 0x80000000 | 7,
            Trap::SupervisorExternalInterrupt => 0x80000000 | 9,
            Trap::MachineExternalInterrupt => 0x80000000 | 11,
        }
    }

    /// Get the trap value (bad address, instruction word, or 0)
    pub fn value(&self) -> u32 {
        match self {
            Trap::InstructionAddressMisaligned(v) |
            Trap::InstructionAccessFault(v) |
            Trap::IllegalInstruction(v) |
            Trap::LoadAddressMisaligned(v) |
            Trap::LoadAccessFault(v) |
            Trap::StoreAddressMisaligned(v) |
            Trap::StoreAccessFault(v) => *v,
            _ => 0,
        }
    }

    /// Is this an interrupt (vs exception)?
    pub fn is_interrupt(&self) -> bool {
        (self.code() & 0x80000000) != 0
    }

    /// ECALL cause for the privilege the call was made from.
    pub fn ecall_from(priv_level: PrivilegeLevel) -> Self {
        match priv_level {
            PrivilegeLevel::User => Trap::EnvironmentCallFromU,
            PrivilegeLevel::Supervisor => Trap::EnvironmentCallFromS,
            PrivilegeLevel::Machine => Trap::EnvironmentCallFromM,
        }
    }
}

/// Pick the interrupt to take, if any.
///
/// Interrupts are enabled below Machine mode unconditionally, and in Machine
/// mode when `mstatus.MIE` is set. Priority: MEI > MSI > MTI > SEI > SSI > STI.
pub fn check_pending_interrupts(cpu: &Cpu) -> Option<Trap> {
    let pending = cpu.csr.mip & cpu.csr.mie;
    if pending == 0 {
        return None;
    }

    let enabled = cpu.priv_level < PrivilegeLevel::Machine
        || (cpu.csr.mstatus & MSTATUS_MIE) != 0;
    if !enabled {
        return None;
    }

    const ORDER: [(u32, Trap); 6] = [
        (MIP_MEIP, Trap::MachineExternalInterrupt),
        (MIP_MSIP, Trap::MachineSoftwareInterrupt),
        (MIP_MTIP, Trap::MachineTimerInterrupt),
        (MIP_SEIP, Trap::SupervisorExternalInterrupt),
        (MIP_SSIP, Trap::SupervisorSoftwareInterrupt),
        (MIP_STIP, Trap::SupervisorTimerInterrupt),
    ];
    ORDER
        .iter()
        .find(|(bit, _)| pending & bit != 0)
        .map(|&(_, trap)| trap)
}

/// Enter a trap. `cpu.pc` must hold the address to resume at: the faulting
/// instruction for exceptions, the next unexecuted one for interrupts.
pub fn handle_trap(cpu: &mut Cpu, trap: Trap) {
    cpu.csr.mepc = cpu.pc;
    cpu.csr.mcause = trap.code();
    cpu.csr.mtval = trap.value();

    let mut status = cpu.csr.mstatus;

    // Set MPIE = MIE
    if (status & MSTATUS_MIE) != 0 {
        status |= MSTATUS_MPIE;
    } else {
        status &= !MSTATUS_MPIE;
    }

    // Set MPP = current privilege
    status = (status & !MSTATUS_MPP) | ((cpu.priv_level as u32) << MSTATUS_MPP_SHIFT);

    // Clear MIE
    status &= !MSTATUS_MIE;

    cpu.csr.mstatus = status;
    cpu.priv_level = PrivilegeLevel::Machine;
    cpu.pc = cpu.csr.mtvec & !3;

    cpu.reservation = None;
    cpu.wfi = false;
}

/// Handle MRET instruction
pub fn mret(cpu: &mut Cpu) {
    let mpp = (cpu.csr.mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT;
    cpu.priv_level = PrivilegeLevel::from(mpp as u8);

    let mut status = cpu.csr.mstatus;
    if (status & MSTATUS_MPIE) != 0 {
        status |= MSTATUS_MIE;
    } else {
        status &= !MSTATUS_MIE;
    }
    status |= MSTATUS_MPIE;
    // MPP = U
    status &= !MSTATUS_MPP;
    cpu.csr.mstatus = status;

    cpu.pc = cpu.csr.mepc;
}

/// Handle SRET instruction
pub fn sret(cpu: &mut Cpu) {
    cpu.priv_level = if cpu.csr.mstatus & MSTATUS_SPP != 0 {
        PrivilegeLevel::Supervisor
    } else {
        PrivilegeLevel::User
    };

    let mut status = cpu.csr.mstatus;
    if (status & MSTATUS_SPIE) != 0 {
        status |= MSTATUS_SIE;
    } else {
        status &= !MSTATUS_SIE;
    }
    status |= MSTATUS_SPIE;
    status &= !MSTATUS_SPP;
    cpu.csr.mstatus = status;

    cpu.pc = cpu.csr.sepc;
}
