//! Hand encoders for RV32IMA and a small machine harness.

#![allow(dead_code)]

use mrv32::config::{MachineConfig, RAM_BASE};
use mrv32::{BufferConsole, Machine};

pub const RAM_SIZE: u32 = 64 * 1024;

pub const OP_IMM: u32 = 0x13;
pub const OP_REG: u32 = 0x33;
pub const OP_LUI: u32 = 0x37;
pub const OP_LOAD: u32 = 0x03;
pub const OP_STORE: u32 = 0x23;
pub const OP_BRANCH: u32 = 0x63;
pub const OP_JAL: u32 = 0x6F;
pub const OP_AMO: u32 = 0x2F;
pub const OP_SYSTEM: u32 = 0x73;

pub const ECALL: u32 = 0x0000_0073;
pub const MRET: u32 = 0x3020_0073;
pub const WFI: u32 = 0x1050_0073;

pub fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

pub fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

pub fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | OP_STORE
}

pub fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | OP_BRANCH
}

pub fn beq(rs1: u32, rs2: u32, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 0)
}

pub fn andi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 7, rd, OP_IMM)
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0, rd, OP_IMM)
}

pub fn lui(rd: u32, imm20: u32) -> u32 {
    ((imm20 & 0xF_FFFF) << 12) | (rd << 7) | OP_LUI
}

/// `lui` + `addi` pair loading any 32-bit constant.
pub fn li(rd: u32, value: u32) -> [u32; 2] {
    let upper = value.wrapping_add(0x800) >> 12;
    let lower = value.wrapping_sub(upper << 12) as i32;
    [lui(rd, upper), addi(rd, rd, lower)]
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 2, rd, OP_LOAD)
}

pub fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 4, rd, OP_LOAD)
}

pub fn sb(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 0)
}

pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 2)
}

pub fn jal(rd: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | OP_JAL
}

pub fn div(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 4, rd, OP_REG)
}

pub fn divu(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 5, rd, OP_REG)
}

pub fn rem(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 6, rd, OP_REG)
}

pub fn remu(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 7, rd, OP_REG)
}

pub fn lr_w(rd: u32, rs1: u32) -> u32 {
    r_type(0b00010 << 2, 0, rs1, 2, rd, OP_AMO)
}

pub fn sc_w(rd: u32, rs2: u32, rs1: u32) -> u32 {
    r_type(0b00011 << 2, rs2, rs1, 2, rd, OP_AMO)
}

pub fn csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
    i_type(csr as i32, rs1, 1, rd, OP_SYSTEM)
}

pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
    i_type(csr as i32, rs1, 2, rd, OP_SYSTEM)
}

/// Machine with `RAM_SIZE` bytes of RAM whose console is the returned buffer.
pub fn machine() -> (Machine, BufferConsole) {
    machine_with(MachineConfig::with_ram_size(RAM_SIZE))
}

pub fn machine_with(config: MachineConfig) -> (Machine, BufferConsole) {
    let console = BufferConsole::new();
    let m = Machine::in_memory(config, Box::new(console.clone())).unwrap();
    (m, console)
}

/// Write `words` into guest RAM starting at `addr`.
pub fn place<R: mrv32::RamBacking>(m: &mut Machine<R>, addr: u32, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    m.write_ram(addr, &bytes).unwrap();
}

pub fn boot(program: &[u32]) -> (Machine, BufferConsole) {
    let (mut m, console) = machine();
    place(&mut m, RAM_BASE, program);
    (m, console)
}

pub fn read_word<R: mrv32::RamBacking>(m: &mut Machine<R>, addr: u32) -> u32 {
    let mut buf = [0u8; 4];
    m.read_ram(addr, &mut buf).unwrap();
    u32::from_le_bytes(buf)
}
