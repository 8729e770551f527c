//! Instruction execution
//!
//! Implements RV32IMA + Zicsr instruction semantics. Every path either
//! retires the instruction (registers, memory and `pc` updated) or returns
//! an error with nothing committed.

use super::{Cpu, ExecError};
use super::csr::Csr;
use super::decode::*;
use crate::cpu::PrivilegeLevel;
use crate::cpu::trap::{self, Trap};
use crate::error::BusFault;
use crate::memory::{Bus, MmioEffect};

impl Cpu {
    /// Execute a single instruction
    pub fn execute(&mut self, inst: u32, bus: &mut impl Bus) -> Result<MmioEffect, ExecError> {
        let d = DecodedInst::decode(inst);
        let next = self.pc.wrapping_add(4);

        match d.opcode {
            OP_LUI => {
                self.write_reg(d.rd, d.imm_u());
                self.pc = next;
            }

            OP_AUIPC => {
                self.write_reg(d.rd, self.pc.wrapping_add(d.imm_u()));
                self.pc = next;
            }

            OP_JAL => {
                let target = self.pc.wrapping_add(d.imm_j() as u32);
                self.jump(d.rd, target)?;
            }

            OP_JALR => {
                if d.funct3 != 0 {
                    return Err(Trap::IllegalInstruction(inst).into());
                }
                let target = self.read_reg(d.rs1).wrapping_add(d.imm_i() as u32) & !1;
                self.jump(d.rd, target)?;
            }

            OP_BRANCH => {
                let rs1 = self.read_reg(d.rs1);
                let rs2 = self.read_reg(d.rs2);

                let taken = match d.funct3 {
                    FUNCT3_BEQ => rs1 == rs2,
                    FUNCT3_BNE => rs1 != rs2,
                    FUNCT3_BLT => (rs1 as i32) < (rs2 as i32),
                    FUNCT3_BGE => (rs1 as i32) >= (rs2 as i32),
                    FUNCT3_BLTU => rs1 < rs2,
                    FUNCT3_BGEU => rs1 >= rs2,
                    _ => return Err(Trap::IllegalInstruction(inst).into()),
                };

                if taken {
                    let target = self.pc.wrapping_add(d.imm_b() as u32);
                    if target & 3 != 0 {
                        return Err(Trap::InstructionAddressMisaligned(target).into());
                    }
                    self.pc = target;
                } else {
                    self.pc = next;
                }
            }

            OP_LOAD => {
                let addr = self.read_reg(d.rs1).wrapping_add(d.imm_i() as u32);
                let fault = |e: BusFault| ExecError::from_bus(e, Trap::LoadAccessFault(addr));

                let value = match d.funct3 {
                    FUNCT3_LB => bus.load8_signed(addr).map_err(fault)?,
                    FUNCT3_LH => bus.load16_signed(addr).map_err(fault)?,
                    FUNCT3_LW => bus.load32(addr).map_err(fault)?,
                    FUNCT3_LBU => bus.load8(addr).map_err(fault)? as u32,
                    FUNCT3_LHU => bus.load16(addr).map_err(fault)? as u32,
                    _ => return Err(Trap::IllegalInstruction(inst).into()),
                };

                self.write_reg(d.rd, value);
                self.pc = next;
            }

            OP_STORE => {
                let addr = self.read_reg(d.rs1).wrapping_add(d.imm_s() as u32);
                let value = self.read_reg(d.rs2);
                let fault = |e: BusFault| ExecError::from_bus(e, Trap::StoreAccessFault(addr));

                let (effect, len) = match d.funct3 {
                    FUNCT3_SB => (bus.store8(addr, value as u8).map_err(fault)?, 1),
                    FUNCT3_SH => (bus.store16(addr, value as u16).map_err(fault)?, 2),
                    FUNCT3_SW => (bus.store32(addr, value).map_err(fault)?, 4),
                    _ => return Err(Trap::IllegalInstruction(inst).into()),
                };

                self.clear_reservation_on_store(addr, len);
                self.pc = next;
                return Ok(effect);
            }

            OP_OP_IMM => {
                let rs1 = self.read_reg(d.rs1);
                let imm = d.imm_i() as u32;
                let shamt = d.shamt();

                let result = match d.funct3 {
                    FUNCT3_ADD_SUB => rs1.wrapping_add(imm), // ADDI
                    FUNCT3_SLT => ((rs1 as i32) < (imm as i32)) as u32, // SLTI
                    FUNCT3_SLTU => (rs1 < imm) as u32, // SLTIU
                    FUNCT3_XOR => rs1 ^ imm, // XORI
                    FUNCT3_OR => rs1 | imm, // ORI
                    FUNCT3_AND => rs1 & imm, // ANDI
                    FUNCT3_SLL if d.funct7 == FUNCT7_BASE => rs1 << shamt, // SLLI
                    FUNCT3_SRL_SRA if d.funct7 == FUNCT7_BASE => rs1 >> shamt, // SRLI
                    FUNCT3_SRL_SRA if d.funct7 == FUNCT7_ALT => ((rs1 as i32) >> shamt) as u32, // SRAI
                    _ => return Err(Trap::IllegalInstruction(inst).into()),
                };

                self.write_reg(d.rd, result);
                self.pc = next;
            }

            OP_OP => {
                let rs1 = self.read_reg(d.rs1);
                let rs2 = self.read_reg(d.rs2);

                let result = if d.funct7 == FUNCT7_MULDIV {
                    execute_m_extension(d.funct3, rs1, rs2)
                } else {
                    let shamt = rs2 & 0x1F;
                    match (d.funct3, d.funct7) {
                        (FUNCT3_ADD_SUB, FUNCT7_BASE) => rs1.wrapping_add(rs2), // ADD
                        (FUNCT3_ADD_SUB, FUNCT7_ALT) => rs1.wrapping_sub(rs2), // SUB
                        (FUNCT3_SLL, FUNCT7_BASE) => rs1 << shamt, // SLL
                        (FUNCT3_SLT, FUNCT7_BASE) => ((rs1 as i32) < (rs2 as i32)) as u32, // SLT
                        (FUNCT3_SLTU, FUNCT7_BASE) => (rs1 < rs2) as u32, // SLTU
                        (FUNCT3_XOR, FUNCT7_BASE) => rs1 ^ rs2, // XOR
                        (FUNCT3_SRL_SRA, FUNCT7_BASE) => rs1 >> shamt, // SRL
                        (FUNCT3_SRL_SRA, FUNCT7_ALT) => ((rs1 as i32) >> shamt) as u32, // SRA
                        (FUNCT3_OR, FUNCT7_BASE) => rs1 | rs2, // OR
                        (FUNCT3_AND, FUNCT7_BASE) => rs1 & rs2, // AND
                        _ => return Err(Trap::IllegalInstruction(inst).into()),
                    }
                };

                self.write_reg(d.rd, result);
                self.pc = next;
            }

            OP_MISC_MEM => match d.funct3 {
                // Single hart, no caches: both fences are no-ops
                FUNCT3_FENCE | FUNCT3_FENCE_I => self.pc = next,
                _ => return Err(Trap::IllegalInstruction(inst).into()),
            },

            OP_SYSTEM => {
                self.execute_system(inst, &d, bus)?;
            }

            OP_AMO => {
                return self.execute_amo(inst, &d, bus);
            }

            _ => {
                return Err(Trap::IllegalInstruction(inst).into());
            }
        }

        Ok(MmioEffect::None)
    }

    /// JAL/JALR tail: check the target before linking.
    #[inline(always)]
    fn jump(&mut self, rd: usize, target: u32) -> Result<(), ExecError> {
        if target & 3 != 0 {
            return Err(Trap::InstructionAddressMisaligned(target).into());
        }
        self.write_reg(rd, self.pc.wrapping_add(4));
        self.pc = target;
        Ok(())
    }

    /// A store from this hart that touches the reserved word kills the reservation.
    fn clear_reservation_on_store(&mut self, addr: u32, len: u32) {
        if let Some(r) = self.reservation {
            let (start, end) = (addr as u64, addr as u64 + len as u64);
            if start < r as u64 + 4 && (r as u64) < end {
                self.reservation = None;
            }
        }
    }

    /// Execute SYSTEM instructions
    fn execute_system(&mut self, inst: u32, d: &DecodedInst, bus: &mut impl Bus) -> Result<(), ExecError> {
        match d.funct3 {
            FUNCT3_PRIV => match inst {
                INST_ECALL => return Err(Trap::ecall_from(self.priv_level).into()),
                INST_EBREAK => return Err(Trap::Breakpoint.into()),
                INST_SRET => {
                    if self.priv_level < PrivilegeLevel::Supervisor {
                        return Err(Trap::IllegalInstruction(inst).into());
                    }
                    trap::sret(self);
                }
                INST_MRET => {
                    if self.priv_level < PrivilegeLevel::Machine {
                        return Err(Trap::IllegalInstruction(inst).into());
                    }
                    trap::mret(self);
                }
                INST_WFI => {
                    self.wfi = true;
                    self.pc = self.pc.wrapping_add(4);
                }
                _ => return Err(Trap::IllegalInstruction(inst).into()),
            },

            FUNCT3_CSRRW | FUNCT3_CSRRS | FUNCT3_CSRRC |
            FUNCT3_CSRRWI | FUNCT3_CSRRSI | FUNCT3_CSRRCI => {
                let csr_addr = d.csr();
                if Csr::is_known(csr_addr) && !Csr::accessible(csr_addr, self.priv_level) {
                    return Err(Trap::IllegalInstruction(inst).into());
                }

                let is_imm = d.funct3 >= FUNCT3_CSRRWI;
                let operand = if is_imm {
                    d.rs1 as u32 // zero-extended uimm
                } else {
                    self.read_reg(d.rs1)
                };

                let old_val = self.csr.read(csr_addr);

                let (new_val, do_write) = match d.funct3 & 0x3 {
                    0b01 => (operand, true), // CSRRW(I)
                    0b10 => (old_val | operand, d.rs1 != 0), // CSRRS(I)
                    _ => (old_val & !operand, d.rs1 != 0), // CSRRC(I)
                };

                if do_write && !self.csr.write(csr_addr, new_val) {
                    bus.debug_csr_write(csr_addr, new_val);
                }

                self.write_reg(d.rd, old_val);
                self.pc = self.pc.wrapping_add(4);
            }

            _ => return Err(Trap::IllegalInstruction(inst).into()),
        }

        Ok(())
    }

    /// Execute atomic (A extension) instructions
    fn execute_amo(&mut self, inst: u32, d: &DecodedInst, bus: &mut impl Bus) -> Result<MmioEffect, ExecError> {
        if d.funct3 != FUNCT3_AMO_W {
            return Err(Trap::IllegalInstruction(inst).into());
        }

        let addr = self.read_reg(d.rs1);
        let funct5 = d.funct5();
        let is_lr = funct5 == FUNCT5_LR;

        if is_lr && d.rs2 != 0 {
            return Err(Trap::IllegalInstruction(inst).into());
        }
        if addr & 3 != 0 {
            return Err(if is_lr {
                Trap::LoadAddressMisaligned(addr)
            } else {
                Trap::StoreAddressMisaligned(addr)
            }
            .into());
        }
        let access_fault = if is_lr {
            Trap::LoadAccessFault(addr)
        } else {
            Trap::StoreAccessFault(addr)
        };
        if !bus.is_ram(addr, 4) {
            return Err(access_fault.into());
        }
        let fault = |e: BusFault| ExecError::from_bus(e, access_fault);

        match funct5 {
            FUNCT5_LR => {
                let value = bus.load32(addr).map_err(fault)?;
                self.write_reg(d.rd, value);
                self.reservation = Some(addr);
            }
            FUNCT5_SC => {
                if self.reservation == Some(addr) {
                    bus.store32(addr, self.read_reg(d.rs2)).map_err(fault)?;
                    self.write_reg(d.rd, 0); // Success
                } else {
                    self.write_reg(d.rd, 1); // Failure
                }
                self.reservation = None;
            }
            _ => {
                let rs2 = self.read_reg(d.rs2);
                let old_val = bus.load32(addr).map_err(fault)?;

                let new_val = match funct5 {
                    FUNCT5_AMOSWAP => rs2,
                    FUNCT5_AMOADD => old_val.wrapping_add(rs2),
                    FUNCT5_AMOXOR => old_val ^ rs2,
                    FUNCT5_AMOAND => old_val & rs2,
                    FUNCT5_AMOOR => old_val | rs2,
                    FUNCT5_AMOMIN => (old_val as i32).min(rs2 as i32) as u32,
                    FUNCT5_AMOMAX => (old_val as i32).max(rs2 as i32) as u32,
                    FUNCT5_AMOMINU => old_val.min(rs2),
                    FUNCT5_AMOMAXU => old_val.max(rs2),
                    _ => return Err(Trap::IllegalInstruction(inst).into()),
                };

                bus.store32(addr, new_val).map_err(fault)?;
                self.clear_reservation_on_store(addr, 4);
                self.write_reg(d.rd, old_val);
            }
        }

        self.pc = self.pc.wrapping_add(4);
        Ok(MmioEffect::None)
    }
}

/// Execute M extension instructions. Division never traps.
fn execute_m_extension(funct3: u32, rs1: u32, rs2: u32) -> u32 {
    match funct3 {
        // MUL - lower 32 bits of rs1 * rs2
        FUNCT3_MUL => rs1.wrapping_mul(rs2),
        // MULH - upper 32 bits of signed * signed
        FUNCT3_MULH => ((rs1 as i32 as i64 * rs2 as i32 as i64) >> 32) as u32,
        // MULHSU - upper 32 bits of signed * unsigned
        FUNCT3_MULHSU => ((rs1 as i32 as i64).wrapping_mul(rs2 as i64) >> 32) as u32,
        // MULHU - upper 32 bits of unsigned * unsigned
        FUNCT3_MULHU => ((rs1 as u64 * rs2 as u64) >> 32) as u32,
        FUNCT3_DIV => {
            if rs2 == 0 {
                u32::MAX
            } else {
                // i32::MIN / -1 wraps to i32::MIN
                (rs1 as i32).wrapping_div(rs2 as i32) as u32
            }
        }
        FUNCT3_DIVU => {
            if rs2 == 0 {
                u32::MAX
            } else {
                rs1 / rs2
            }
        }
        FUNCT3_REM => {
            if rs2 == 0 {
                rs1
            } else {
                // i32::MIN % -1 wraps to 0
                (rs1 as i32).wrapping_rem(rs2 as i32) as u32
            }
        }
        // REMU
        _ => {
            if rs2 == 0 {
                rs1
            } else {
                rs1 % rs2
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::csr::*;

    const BASE: u32 = 0x8000_0000;

    /// Flat RAM at BASE plus a list of debug CSR writes.
    struct TestBus {
        ram: Vec<u8>,
        debug: Vec<(u32, u32)>,
    }

    impl TestBus {
        fn new() -> Self {
            TestBus { ram: vec![0; 4096], debug: Vec::new() }
        }

        fn offset(&self, addr: u32, len: u32) -> Result<usize, BusFault> {
            if self.is_ram(addr, len) {
                Ok((addr - BASE) as usize)
            } else {
                Err(BusFault::Unmapped(addr))
            }
        }

        fn word(&self, addr: u32) -> u32 {
            let o = (addr - BASE) as usize;
            u32::from_le_bytes([self.ram[o], self.ram[o + 1], self.ram[o + 2], self.ram[o + 3]])
        }
    }

    impl Bus for TestBus {
        fn load8(&mut self, addr: u32) -> Result<u8, BusFault> {
            let o = self.offset(addr, 1)?;
            Ok(self.ram[o])
        }
        fn load16(&mut self, addr: u32) -> Result<u16, BusFault> {
            let o = self.offset(addr, 2)?;
            Ok(u16::from_le_bytes([self.ram[o], self.ram[o + 1]]))
        }
        fn load32(&mut self, addr: u32) -> Result<u32, BusFault> {
            self.offset(addr, 4)?;
            Ok(self.word(addr))
        }
        fn store8(&mut self, addr: u32, value: u8) -> Result<MmioEffect, BusFault> {
            let o = self.offset(addr, 1)?;
            self.ram[o] = value;
            Ok(MmioEffect::None)
        }
        fn store16(&mut self, addr: u32, value: u16) -> Result<MmioEffect, BusFault> {
            let o = self.offset(addr, 2)?;
            self.ram[o..o + 2].copy_from_slice(&value.to_le_bytes());
            Ok(MmioEffect::None)
        }
        fn store32(&mut self, addr: u32, value: u32) -> Result<MmioEffect, BusFault> {
            let o = self.offset(addr, 4)?;
            self.ram[o..o + 4].copy_from_slice(&value.to_le_bytes());
            Ok(MmioEffect::None)
        }
        fn is_ram(&self, addr: u32, len: u32) -> bool {
            addr >= BASE && (addr - BASE) as usize + len as usize <= self.ram.len()
        }
        fn debug_csr_write(&mut self, csr: u32, value: u32) {
            self.debug.push((csr, value));
        }
    }

    fn run(cpu: &mut Cpu, bus: &mut TestBus, inst: u32) -> Result<MmioEffect, ExecError> {
        cpu.execute(inst, bus)
    }

    fn trap_of(r: Result<MmioEffect, ExecError>) -> Trap {
        match r {
            Err(ExecError::Trap(t)) => t,
            other => panic!("expected trap, got {:?}", other),
        }
    }

    fn setup() -> (Cpu, TestBus) {
        (Cpu::new(BASE, 0), TestBus::new())
    }

    #[test]
    fn test_addi_and_lui() {
        let (mut cpu, mut bus) = setup();
        run(&mut cpu, &mut bus, 0x02A00093).unwrap(); // addi x1, x0, 42
        assert_eq!(cpu.regs[1], 42);
        assert_eq!(cpu.pc, BASE + 4);

        run(&mut cpu, &mut bus, 0x123452B7).unwrap(); // lui x5, 0x12345
        assert_eq!(cpu.regs[5], 0x1234_5000);
    }

    #[test]
    fn test_x0_write_discarded() {
        let (mut cpu, mut bus) = setup();
        run(&mut cpu, &mut bus, 0x02A00013).unwrap(); // addi x0, x0, 42
        assert_eq!(cpu.read_reg(0), 0);
    }

    #[test]
    fn test_sub_and_sra() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[1] = 5;
        cpu.regs[2] = 7;
        run(&mut cpu, &mut bus, 0x402081B3).unwrap(); // sub x3, x1, x2
        assert_eq!(cpu.regs[3] as i32, -2);

        cpu.regs[1] = 0x8000_0000;
        cpu.regs[2] = 4;
        run(&mut cpu, &mut bus, 0x4020D1B3).unwrap(); // sra x3, x1, x2
        assert_eq!(cpu.regs[3], 0xF800_0000);
        run(&mut cpu, &mut bus, 0x0020D1B3).unwrap(); // srl x3, x1, x2
        assert_eq!(cpu.regs[3], 0x0800_0000);
    }

    #[test]
    fn test_division_edge_cases() {
        assert_eq!(execute_m_extension(FUNCT3_DIVU, 123, 0), 0xFFFF_FFFF);
        assert_eq!(execute_m_extension(FUNCT3_REMU, 123, 0), 123);
        assert_eq!(execute_m_extension(FUNCT3_DIV, 7, 0), 0xFFFF_FFFF);
        assert_eq!(execute_m_extension(FUNCT3_REM, 7, 0), 7);
        assert_eq!(execute_m_extension(FUNCT3_DIV, 0x8000_0000, 0xFFFF_FFFF), 0x8000_0000);
        assert_eq!(execute_m_extension(FUNCT3_REM, 0x8000_0000, 0xFFFF_FFFF), 0);
        assert_eq!(execute_m_extension(FUNCT3_DIV, -7i32 as u32, 2), -3i32 as u32);
        assert_eq!(execute_m_extension(FUNCT3_REM, -7i32 as u32, 2), -1i32 as u32);
    }

    #[test]
    fn test_mul_high_variants() {
        assert_eq!(execute_m_extension(FUNCT3_MUL, 0xFFFF_FFFF, 0xFFFF_FFFF), 1);
        assert_eq!(execute_m_extension(FUNCT3_MULH, 0xFFFF_FFFF, 0xFFFF_FFFF), 0);
        assert_eq!(execute_m_extension(FUNCT3_MULHU, 0xFFFF_FFFF, 0xFFFF_FFFF), 0xFFFF_FFFE);
        assert_eq!(execute_m_extension(FUNCT3_MULHSU, 0xFFFF_FFFF, 0xFFFF_FFFF), 0xFFFF_FFFF);
        assert_eq!(execute_m_extension(FUNCT3_MULH, 0x8000_0000, 0x8000_0000), 0x4000_0000);
    }

    #[test]
    fn test_load_sign_extension() {
        let (mut cpu, mut bus) = setup();
        bus.ram[0x100] = 0x80;
        bus.ram[0x101] = 0xFF;
        cpu.regs[1] = BASE + 0x100;

        run(&mut cpu, &mut bus, 0x00008103).unwrap(); // lb x2, 0(x1)
        assert_eq!(cpu.regs[2], 0xFFFF_FF80);
        run(&mut cpu, &mut bus, 0x0000C103).unwrap(); // lbu x2, 0(x1)
        assert_eq!(cpu.regs[2], 0x80);
        run(&mut cpu, &mut bus, 0x00009103).unwrap(); // lh x2, 0(x1)
        assert_eq!(cpu.regs[2], 0xFFFF_FF80);
        run(&mut cpu, &mut bus, 0x0000D103).unwrap(); // lhu x2, 0(x1)
        assert_eq!(cpu.regs[2], 0xFF80);
    }

    #[test]
    fn test_unmapped_load_and_store_fault() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[1] = 0x4000_0000;
        let t = trap_of(run(&mut cpu, &mut bus, 0x0000A103)); // lw x2, 0(x1)
        assert_eq!(t, Trap::LoadAccessFault(0x4000_0000));
        let t = trap_of(run(&mut cpu, &mut bus, 0x0020A023)); // sw x2, 0(x1)
        assert_eq!(t, Trap::StoreAccessFault(0x4000_0000));
        assert_eq!(cpu.pc, BASE);
    }

    #[test]
    fn test_misaligned_jump_traps_without_link() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[2] = BASE + 2;
        let t = trap_of(run(&mut cpu, &mut bus, 0x000100E7)); // jalr x1, 0(x2)
        assert_eq!(t, Trap::InstructionAddressMisaligned(BASE + 2));
        assert_eq!(cpu.regs[1], 0);
        assert_eq!(cpu.pc, BASE);
    }

    #[test]
    fn test_jalr_clears_low_bit() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[2] = BASE + 0x41;
        run(&mut cpu, &mut bus, 0x000100E7).unwrap(); // jalr x1, 0(x2)
        assert_eq!(cpu.pc, BASE + 0x40);
        assert_eq!(cpu.regs[1], BASE + 4);
    }

    #[test]
    fn test_branch_taken_backwards() {
        let (mut cpu, mut bus) = setup();
        cpu.pc = BASE + 0x10;
        run(&mut cpu, &mut bus, 0xFE000CE3).unwrap(); // beq x0, x0, -8
        assert_eq!(cpu.pc, BASE + 0x8);
    }

    #[test]
    fn test_lr_sc_pair() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[2] = BASE + 0x200;
        cpu.regs[4] = 0xCAFE_F00D;
        run(&mut cpu, &mut bus, 0x100120AF).unwrap(); // lr.w x1, (x2)
        assert_eq!(cpu.reservation, Some(BASE + 0x200));
        run(&mut cpu, &mut bus, 0x184121AF).unwrap(); // sc.w x3, x4, (x2)
        assert_eq!(cpu.regs[3], 0);
        assert_eq!(bus.word(BASE + 0x200), 0xCAFE_F00D);
        assert_eq!(cpu.reservation, None);

        // No reservation left: second SC fails and leaves memory alone.
        cpu.regs[4] = 1;
        run(&mut cpu, &mut bus, 0x184121AF).unwrap();
        assert_eq!(cpu.regs[3], 1);
        assert_eq!(bus.word(BASE + 0x200), 0xCAFE_F00D);
    }

    #[test]
    fn test_store_to_reserved_word_breaks_reservation() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[2] = BASE + 0x200;
        run(&mut cpu, &mut bus, 0x100120AF).unwrap(); // lr.w x1, (x2)
        cpu.regs[5] = BASE + 0x202;
        run(&mut cpu, &mut bus, 0x00028023).unwrap(); // sb x0, 0(x5)
        assert_eq!(cpu.reservation, None);
    }

    #[test]
    fn test_amo_add_and_minmax() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[2] = BASE + 0x300;
        bus.store32(BASE + 0x300, 10).unwrap();

        cpu.regs[4] = 5;
        run(&mut cpu, &mut bus, 0x004121AF).unwrap(); // amoadd.w x3, x4, (x2)
        assert_eq!(cpu.regs[3], 10);
        assert_eq!(bus.word(BASE + 0x300), 15);

        cpu.regs[4] = -1i32 as u32;
        run(&mut cpu, &mut bus, 0x804121AF).unwrap(); // amomin.w x3, x4, (x2)
        assert_eq!(bus.word(BASE + 0x300), 0xFFFF_FFFF);
        cpu.regs[4] = 3;
        run(&mut cpu, &mut bus, 0xE04121AF).unwrap(); // amomaxu.w x3, x4, (x2)
        assert_eq!(bus.word(BASE + 0x300), 0xFFFF_FFFF);
    }

    #[test]
    fn test_amo_alignment_and_region() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[2] = BASE + 0x302;
        assert_eq!(trap_of(run(&mut cpu, &mut bus, 0x100120AF)), Trap::LoadAddressMisaligned(BASE + 0x302));
        assert_eq!(trap_of(run(&mut cpu, &mut bus, 0x004121AF)), Trap::StoreAddressMisaligned(BASE + 0x302));

        cpu.regs[2] = 0x1000_0000;
        assert_eq!(trap_of(run(&mut cpu, &mut bus, 0x004121AF)), Trap::StoreAccessFault(0x1000_0000));
    }

    #[test]
    fn test_csr_read_modify_write() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[6] = 0x1234;
        run(&mut cpu, &mut bus, 0x340312F3).unwrap(); // csrrw x5, mscratch, x6
        assert_eq!(cpu.regs[5], 0);
        assert_eq!(cpu.csr.mscratch, 0x1234);

        // csrrs x5, mscratch, x0 reads without writing
        run(&mut cpu, &mut bus, 0x340022F3).unwrap();
        assert_eq!(cpu.regs[5], 0x1234);

        // csrrci x5, mscratch, 4
        run(&mut cpu, &mut bus, 0x340272F3).unwrap();
        assert_eq!(cpu.regs[5], 0x1234);
        assert_eq!(cpu.csr.mscratch, 0x1230);

        // csrrsi x0, mstatus, 8 sets MIE
        run(&mut cpu, &mut bus, 0x30046073).unwrap();
        assert_ne!(cpu.csr.mstatus & MSTATUS_MIE, 0);
    }

    #[test]
    fn test_unknown_csr_goes_to_bus() {
        let (mut cpu, mut bus) = setup();
        cpu.regs[10] = 42;
        run(&mut cpu, &mut bus, 0x13651073).unwrap(); // csrw 0x136, x10
        assert_eq!(bus.debug, vec![(0x136, 42)]);

        // csrr x5, 0x137 reads zero and writes nothing
        run(&mut cpu, &mut bus, 0x137022F3).unwrap();
        assert_eq!(cpu.regs[5], 0);
        assert_eq!(bus.debug.len(), 1);
    }

    #[test]
    fn test_csr_privilege() {
        let (mut cpu, mut bus) = setup();
        cpu.priv_level = PrivilegeLevel::User;
        let inst = 0x300022F3; // csrr x5, mstatus
        assert_eq!(trap_of(run(&mut cpu, &mut bus, inst)), Trap::IllegalInstruction(inst));

        // cycle is user readable
        cpu.csr.cycle.set(77);
        run(&mut cpu, &mut bus, 0xC00022F3).unwrap(); // rdcycle x5
        assert_eq!(cpu.regs[5], 77);
    }

    #[test]
    fn test_ecall_ebreak_causes() {
        let (mut cpu, mut bus) = setup();
        assert_eq!(trap_of(run(&mut cpu, &mut bus, INST_ECALL)), Trap::EnvironmentCallFromM);
        cpu.priv_level = PrivilegeLevel::User;
        assert_eq!(trap_of(run(&mut cpu, &mut bus, INST_ECALL)), Trap::EnvironmentCallFromU);
        assert_eq!(trap_of(run(&mut cpu, &mut bus, INST_EBREAK)), Trap::Breakpoint);
        assert_eq!(
            trap_of(run(&mut cpu, &mut bus, INST_MRET)),
            Trap::IllegalInstruction(INST_MRET)
        );
        assert_eq!(cpu.pc, BASE);
    }

    #[test]
    fn test_wfi_and_fence() {
        let (mut cpu, mut bus) = setup();
        run(&mut cpu, &mut bus, INST_WFI).unwrap();
        assert!(cpu.wfi);
        assert_eq!(cpu.pc, BASE + 4);

        run(&mut cpu, &mut bus, 0x0FF0000F).unwrap(); // fence
        run(&mut cpu, &mut bus, 0x0000100F).unwrap(); // fence.i
        assert_eq!(cpu.pc, BASE + 12);
    }

    #[test]
    fn test_illegal_instruction_value() {
        let (mut cpu, mut bus) = setup();
        assert_eq!(trap_of(run(&mut cpu, &mut bus, 0)), Trap::IllegalInstruction(0));
        assert_eq!(
            trap_of(run(&mut cpu, &mut bus, 0xFFFF_FFFF)),
            Trap::IllegalInstruction(0xFFFF_FFFF)
        );
    }

    #[test]
    fn test_step_counts_retired_only() {
        let (mut cpu, mut bus) = setup();
        bus.store32(BASE, 0x02A00093).unwrap(); // addi x1, x0, 42
        bus.store32(BASE + 4, INST_ECALL).unwrap();

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.cycle(), 1);
        assert!(matches!(cpu.step(&mut bus), Err(ExecError::Trap(Trap::EnvironmentCallFromM))));
        assert_eq!(cpu.cycle(), 1);
        assert_eq!(cpu.pc, BASE + 4);

        cpu.pc = BASE + 2;
        assert!(matches!(
            cpu.step(&mut bus),
            Err(ExecError::Trap(Trap::InstructionAddressMisaligned(a))) if a == BASE + 2
        ));

        cpu.pc = 0x2000;
        assert!(matches!(
            cpu.step(&mut bus),
            Err(ExecError::Trap(Trap::InstructionAccessFault(0x2000)))
        ));
    }
}
