//! Device Tree Blob (DTB) Generator
//!
//! Implements a minimal FDT (Flattened Device Tree) writer and the default
//! tree describing the machine, for hosts that are not handed a DTB file.
//! Structure: Header -> Reserve Map -> Structure Block -> Strings Block

use std::collections::HashMap;

use crate::config::MachineConfig;
use crate::devices::syscon::{SYSCON_POWEROFF, SYSCON_RESTART};
use crate::devices::{CLINT_SIZE, UART_SIZE};

const FDT_MAGIC: u32 = 0xd00dfeed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

const HEADER_SIZE: u32 = 40;
/// One terminating (0, 0) entry
const RSVMAP_SIZE: u32 = 16;

const PHANDLE_CPU_INTC: u32 = 1;
const PHANDLE_SYSCON: u32 = 2;

/// `mtime` counts microseconds.
const TIMEBASE_HZ: u32 = 1_000_000;

pub const DEFAULT_BOOTARGS: &str = "earlycon=uart8250,mmio,0x10000000,1000000 console=ttyS0";

#[derive(Default)]
pub struct DtbBuilder {
    struct_buf: Vec<u8>,
    strings_buf: Vec<u8>,
    string_offsets: HashMap<String, u32>,
}

impl DtbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.struct_buf.extend_from_slice(name.as_bytes());
        self.struct_buf.push(0);
        self.align();
    }

    pub fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    pub fn property_u32(&mut self, name: &str, value: u32) {
        self.property(name, &value.to_be_bytes());
    }

    pub fn property_null(&mut self, name: &str) {
        self.property(name, &[]);
    }

    pub fn property_string(&mut self, name: &str, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.property(name, &data);
    }

    pub fn property_array_u32(&mut self, name: &str, values: &[u32]) {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.property(name, &data);
    }

    pub fn property(&mut self, name: &str, data: &[u8]) {
        self.push_u32(FDT_PROP);
        self.push_u32(data.len() as u32);
        let name_off = self.string_offset(name);
        self.push_u32(name_off);
        self.struct_buf.extend_from_slice(data);
        self.align();
    }

    fn push_u32(&mut self, v: u32) {
        self.struct_buf.extend_from_slice(&v.to_be_bytes());
    }

    fn align(&mut self) {
        while self.struct_buf.len() % 4 != 0 {
            self.struct_buf.push(0);
        }
    }

    fn string_offset(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.string_offsets.get(s) {
            return off;
        }
        let off = self.strings_buf.len() as u32;
        self.strings_buf.extend_from_slice(s.as_bytes());
        self.strings_buf.push(0);
        self.string_offsets.insert(s.to_string(), off);
        off
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.push_u32(FDT_END);

        let off_dt_struct = HEADER_SIZE + RSVMAP_SIZE;
        let size_dt_struct = self.struct_buf.len() as u32;
        let off_dt_strings = off_dt_struct + size_dt_struct;
        let size_dt_strings = self.strings_buf.len() as u32;
        let totalsize = off_dt_strings + size_dt_strings;

        let mut out = Vec::with_capacity(totalsize as usize);
        for word in [
            FDT_MAGIC,
            totalsize,
            off_dt_struct,
            off_dt_strings,
            HEADER_SIZE,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            0, // boot_cpuid_phys
            size_dt_strings,
            size_dt_struct,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; RSVMAP_SIZE as usize]);
        out.extend_from_slice(&self.struct_buf);
        out.extend_from_slice(&self.strings_buf);
        out
    }
}

/// Device tree for `config`: one nommu rv32ima hart, the UART, the CLINT and
/// the syscon power controls. The memory node stops at the DTB slot so the
/// kernel leaves the tree and the hart record alone.
pub fn generate_fdt(config: &MachineConfig, bootargs: &str) -> Vec<u8> {
    let map = &config.mmio;
    let usable = config.dtb_addr() - config.ram_base;
    let mut dtb = DtbBuilder::new();

    dtb.begin_node("");
    dtb.property_u32("#address-cells", 1);
    dtb.property_u32("#size-cells", 1);
    dtb.property_string("compatible", "riscv-minimal-nommu");

    dtb.begin_node("chosen");
    dtb.property_string("bootargs", bootargs);
    dtb.end_node();

    dtb.begin_node("cpus");
    dtb.property_u32("#address-cells", 1);
    dtb.property_u32("#size-cells", 0);
    dtb.property_u32("timebase-frequency", TIMEBASE_HZ);

    dtb.begin_node("cpu@0");
    dtb.property_string("device_type", "cpu");
    dtb.property_u32("reg", 0);
    dtb.property_string("compatible", "riscv");
    dtb.property_string("riscv,isa", "rv32ima");
    dtb.property_string("mmu-type", "riscv,none");

    dtb.begin_node("interrupt-controller");
    dtb.property_u32("#interrupt-cells", 1);
    dtb.property_null("interrupt-controller");
    dtb.property_string("compatible", "riscv,cpu-intc");
    dtb.property_u32("phandle", PHANDLE_CPU_INTC);
    dtb.end_node();
    dtb.end_node(); // cpu@0
    dtb.end_node(); // cpus

    dtb.begin_node(&format!("memory@{:x}", config.ram_base));
    dtb.property_string("device_type", "memory");
    dtb.property_array_u32("reg", &[config.ram_base, usable]);
    dtb.end_node();

    dtb.begin_node("soc");
    dtb.property_u32("#address-cells", 1);
    dtb.property_u32("#size-cells", 1);
    dtb.property_string("compatible", "simple-bus");
    dtb.property_null("ranges");

    // Polled: the UART has no interrupt line.
    dtb.begin_node(&format!("uart@{:x}", map.uart_base));
    dtb.property_u32("clock-frequency", 1_000_000);
    dtb.property_array_u32("reg", &[map.uart_base, UART_SIZE]);
    dtb.property_string("compatible", "ns16550a");
    dtb.end_node();

    // M-mode software (3) and timer (7) on the hart's local controller.
    dtb.begin_node(&format!("clint@{:x}", map.clint_base));
    dtb.property_array_u32("interrupts-extended", &[PHANDLE_CPU_INTC, 3, PHANDLE_CPU_INTC, 7]);
    dtb.property_array_u32("reg", &[map.clint_base, CLINT_SIZE]);
    dtb.property_string("compatible", "riscv,clint0");
    dtb.end_node();

    dtb.begin_node(&format!("syscon@{:x}", map.syscon_addr));
    dtb.property_string("compatible", "syscon");
    dtb.property_array_u32("reg", &[map.syscon_addr, 0x1000]);
    dtb.property_u32("phandle", PHANDLE_SYSCON);
    dtb.end_node();

    dtb.begin_node("poweroff");
    dtb.property_u32("value", SYSCON_POWEROFF);
    dtb.property_u32("offset", 0);
    dtb.property_u32("regmap", PHANDLE_SYSCON);
    dtb.property_string("compatible", "syscon-poweroff");
    dtb.end_node();

    dtb.begin_node("reboot");
    dtb.property_u32("value", SYSCON_RESTART);
    dtb.property_u32("offset", 0);
    dtb.property_u32("regmap", PHANDLE_SYSCON);
    dtb.property_string("compatible", "syscon-reboot");
    dtb.end_node();
    dtb.end_node(); // soc

    dtb.end_node(); // root

    dtb.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DTB_SIZE;

    fn be32(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
    }

    #[test]
    fn test_header() {
        let mut b = DtbBuilder::new();
        b.begin_node("");
        b.property_u32("x", 7);
        b.end_node();
        let blob = b.finish();

        assert_eq!(be32(&blob, 0), FDT_MAGIC);
        assert_eq!(be32(&blob, 4) as usize, blob.len());
        assert_eq!(be32(&blob, 8), 56);
        // begin "" (8) + prop (16) + end (4) + FDT_END (4)
        assert_eq!(be32(&blob, 36), 32);
        assert_eq!(&blob[blob.len() - 2..], b"x\0");
    }

    #[test]
    fn test_strings_are_shared() {
        let mut b = DtbBuilder::new();
        b.property_u32("reg", 1);
        b.property_u32("reg", 2);
        let blob = b.finish();
        assert_eq!(be32(&blob, 32), 4);
    }

    #[test]
    fn test_default_tree_fits_slot() {
        let config = MachineConfig::default();
        let blob = generate_fdt(&config, DEFAULT_BOOTARGS);
        assert!(blob.len() <= DEFAULT_DTB_SIZE as usize, "{} bytes", blob.len());

        // memory reg = <ram_base usable>
        let usable = config.dtb_addr() - config.ram_base;
        let reg: Vec<u8> = [config.ram_base, usable].iter().flat_map(|v| v.to_be_bytes()).collect();
        assert!(blob.windows(reg.len()).any(|w| w == reg.as_slice()));
    }
}
