//! Instruction decoder
//!
//! Field extraction for 32-bit RV32IMA encodings. Register and funct fields
//! are pulled out eagerly; immediates are computed on demand by the format
//! that needs them.

/// Decoded instruction fields
#[derive(Debug, Clone, Copy)]
pub struct DecodedInst {
    pub raw: u32,
    pub opcode: u32,
    pub rd: usize,
    pub rs1: usize,
    pub rs2: usize,
    pub funct3: u32,
    pub funct7: u32,
}

impl DecodedInst {
    #[inline(always)]
    pub fn decode(inst: u32) -> Self {
        DecodedInst {
            raw: inst,
            opcode: inst & 0x7F,
            rd: ((inst >> 7) & 0x1F) as usize,
            rs1: ((inst >> 15) & 0x1F) as usize,
            rs2: ((inst >> 20) & 0x1F) as usize,
            funct3: (inst >> 12) & 0x7,
            funct7: (inst >> 25) & 0x7F,
        }
    }

    /// I-type immediate
    #[inline(always)]
    pub fn imm_i(&self) -> i32 {
        (self.raw as i32) >> 20
    }

    /// S-type immediate
    #[inline(always)]
    pub fn imm_s(&self) -> i32 {
        ((self.raw & 0xFE00_0000) as i32 >> 20) | ((self.raw >> 7) & 0x1F) as i32
    }

    /// B-type immediate (13 bits, bit 0 always clear)
    #[inline(always)]
    pub fn imm_b(&self) -> i32 {
        let inst = self.raw;
        ((inst & 0x8000_0000) as i32 >> 19)
            | (((inst >> 7) & 1) << 11) as i32
            | (((inst >> 25) & 0x3F) << 5) as i32
            | (((inst >> 8) & 0xF) << 1) as i32
    }

    /// U-type immediate, already in bits 31:12
    #[inline(always)]
    pub fn imm_u(&self) -> u32 {
        self.raw & 0xFFFF_F000
    }

    /// J-type immediate (21 bits, bit 0 always clear)
    #[inline(always)]
    pub fn imm_j(&self) -> i32 {
        let inst = self.raw;
        ((inst & 0x8000_0000) as i32 >> 11)
            | (inst & 0xF_F000) as i32
            | (((inst >> 20) & 1) << 11) as i32
            | (((inst >> 21) & 0x3FF) << 1) as i32
    }

    /// Shift amount for SLLI/SRLI/SRAI
    #[inline(always)]
    pub fn shamt(&self) -> u32 {
        (self.raw >> 20) & 0x1F
    }

    /// CSR address of a Zicsr instruction
    #[inline(always)]
    pub fn csr(&self) -> u32 {
        self.raw >> 20
    }

    /// AMO operation
    #[inline(always)]
    pub fn funct5(&self) -> u32 {
        self.raw >> 27
    }
}

// Opcodes
pub const OP_LUI: u32 = 0b0110111;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_LOAD: u32 = 0b0000011;
pub const OP_STORE: u32 = 0b0100011;
pub const OP_OP_IMM: u32 = 0b0010011;
pub const OP_OP: u32 = 0b0110011;
pub const OP_MISC_MEM: u32 = 0b0001111;
pub const OP_SYSTEM: u32 = 0b1110011;
pub const OP_AMO: u32 = 0b0101111;

// Branch funct3
pub const FUNCT3_BEQ: u32 = 0b000;
pub const FUNCT3_BNE: u32 = 0b001;
pub const FUNCT3_BLT: u32 = 0b100;
pub const FUNCT3_BGE: u32 = 0b101;
pub const FUNCT3_BLTU: u32 = 0b110;
pub const FUNCT3_BGEU: u32 = 0b111;

// Load/Store funct3
pub const FUNCT3_LB: u32 = 0b000;
pub const FUNCT3_LH: u32 = 0b001;
pub const FUNCT3_LW: u32 = 0b010;
pub const FUNCT3_LBU: u32 = 0b100;
pub const FUNCT3_LHU: u32 = 0b101;
pub const FUNCT3_SB: u32 = 0b000;
pub const FUNCT3_SH: u32 = 0b001;
pub const FUNCT3_SW: u32 = 0b010;

// ALU funct3
pub const FUNCT3_ADD_SUB: u32 = 0b000;
pub const FUNCT3_SLL: u32 = 0b001;
pub const FUNCT3_SLT: u32 = 0b010;
pub const FUNCT3_SLTU: u32 = 0b011;
pub const FUNCT3_XOR: u32 = 0b100;
pub const FUNCT3_SRL_SRA: u32 = 0b101;
pub const FUNCT3_OR: u32 = 0b110;
pub const FUNCT3_AND: u32 = 0b111;

pub const FUNCT7_BASE: u32 = 0b0000000;
pub const FUNCT7_ALT: u32 = 0b0100000; // SUB, SRA
pub const FUNCT7_MULDIV: u32 = 0b0000001;

// M extension funct3
pub const FUNCT3_MUL: u32 = 0b000;
pub const FUNCT3_MULH: u32 = 0b001;
pub const FUNCT3_MULHSU: u32 = 0b010;
pub const FUNCT3_MULHU: u32 = 0b011;
pub const FUNCT3_DIV: u32 = 0b100;
pub const FUNCT3_DIVU: u32 = 0b101;
pub const FUNCT3_REM: u32 = 0b110;
pub const FUNCT3_REMU: u32 = 0b111;

// MISC-MEM funct3
pub const FUNCT3_FENCE: u32 = 0b000;
pub const FUNCT3_FENCE_I: u32 = 0b001;

// System funct3
pub const FUNCT3_PRIV: u32 = 0b000;
pub const FUNCT3_CSRRW: u32 = 0b001;
pub const FUNCT3_CSRRS: u32 = 0b010;
pub const FUNCT3_CSRRC: u32 = 0b011;
pub const FUNCT3_CSRRWI: u32 = 0b101;
pub const FUNCT3_CSRRSI: u32 = 0b110;
pub const FUNCT3_CSRRCI: u32 = 0b111;

// Full encodings of the privileged instructions under FUNCT3_PRIV
pub const INST_ECALL: u32 = 0x0000_0073;
pub const INST_EBREAK: u32 = 0x0010_0073;
pub const INST_SRET: u32 = 0x1020_0073;
pub const INST_MRET: u32 = 0x3020_0073;
pub const INST_WFI: u32 = 0x1050_0073;

// AMO
pub const FUNCT3_AMO_W: u32 = 0b010;
pub const FUNCT5_LR: u32 = 0b00010;
pub const FUNCT5_SC: u32 = 0b00011;
pub const FUNCT5_AMOSWAP: u32 = 0b00001;
pub const FUNCT5_AMOADD: u32 = 0b00000;
pub const FUNCT5_AMOXOR: u32 = 0b00100;
pub const FUNCT5_AMOAND: u32 = 0b01100;
pub const FUNCT5_AMOOR: u32 = 0b01000;
pub const FUNCT5_AMOMIN: u32 = 0b10000;
pub const FUNCT5_AMOMAX: u32 = 0b10100;
pub const FUNCT5_AMOMINU: u32 = 0b11000;
pub const FUNCT5_AMOMAXU: u32 = 0b11100;
