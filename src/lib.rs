//! RISC-V 32-bit interpreter core
//!
//! An RV32IMA hart with a Machine-mode trap model, a handful of MMIO devices
//! (8250 UART, CLINT, syscon) and a bounded `step` entry point, so a host can
//! interleave emulation with its own I/O. `lib.rs` also carries the
//! WebAssembly facade.

use wasm_bindgen::prelude::*;

pub mod config;
pub mod cpu;
pub mod devices;
pub mod dtb;
pub mod error;
pub mod host;
pub mod image;
pub mod memory;
pub mod snapshot;
pub mod system;

pub use config::{MachineConfig, MmioMap};
pub use cpu::{Cpu, PrivilegeLevel, Trap};
pub use devices::SerialFifo;
pub use error::{BackingError, BusFault, ConfigError, Fault, LoadError, SnapshotError};
pub use host::{BufferConsole, ConsoleSink, Pacer, StdoutConsole, SystemClock, WallClock};
pub use memory::{Bus, MmioEffect, RamBacking, SeekRam, VecRam};
pub use system::{Disposition, Machine, StepStatus};

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn js_err(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Emulator interface exposed to JavaScript. The page owns the timers: it
/// calls `step` with the microseconds elapsed since the previous call and
/// drains `get_uart_output` when it redraws.
#[wasm_bindgen]
pub struct Emulator {
    machine: Machine,
    console: BufferConsole,
    serial_in: SerialFifo,
    /// Sum of every `elapsed_us` passed to `step`; saved with the state.
    clock_us: u64,
}

#[wasm_bindgen]
impl Emulator {
    #[wasm_bindgen(constructor)]
    pub fn new(ram_mib: u32) -> Result<Emulator, JsValue> {
        let config = MachineConfig::with_ram_size(ram_mib.saturating_mul(1024 * 1024));
        let console = BufferConsole::new();
        let machine = Machine::in_memory(config, Box::new(console.clone())).map_err(js_err)?;
        let serial_in = machine.serial_in();
        Ok(Emulator {
            machine,
            console,
            serial_in,
            clock_us: 0,
        })
    }

    /// Load a kernel image (raw, gzip or zstd) at the start of RAM.
    pub fn load_kernel(&mut self, data: &[u8]) -> Result<(), JsValue> {
        self.machine.load_image(data).map_err(js_err)
    }

    pub fn load_dtb(&mut self, data: &[u8]) -> Result<(), JsValue> {
        self.machine.load_dtb(data).map_err(js_err)
    }

    /// Generate and load the built-in device tree with the given bootargs.
    pub fn load_default_dtb(&mut self, bootargs: &str) -> Result<(), JsValue> {
        let blob = dtb::generate_fdt(self.machine.config(), bootargs);
        self.machine.load_dtb(&blob).map_err(js_err)
    }

    /// Run up to `budget` instructions; returns the `StepStatus` code
    /// (0 running, 1 sleep, 2 shutdown, 3 restart, 4 fault).
    pub fn step(&mut self, elapsed_us: u32, budget: u32) -> u32 {
        self.clock_us = self.clock_us.wrapping_add(elapsed_us as u64);
        self.machine.step(elapsed_us as u64, budget).code()
    }

    /// Queue one byte of keyboard input. Returns false if the FIFO is full.
    pub fn send_char(&mut self, c: u8) -> bool {
        self.serial_in.push(c)
    }

    /// Drain console output produced since the last call.
    pub fn get_uart_output(&mut self) -> Vec<u8> {
        self.console.take()
    }

    pub fn get_pc(&self) -> u32 {
        self.machine.cpu().pc
    }

    pub fn get_registers(&self) -> Vec<u32> {
        self.machine.cpu().regs.to_vec()
    }

    /// Retired instruction count (as f64 for JavaScript).
    pub fn instructions(&self) -> f64 {
        self.machine.cpu().cycle() as f64
    }

    /// Describe the last fault, if `step` returned 4.
    pub fn fault_message(&self) -> Option<String> {
        self.machine.fault().map(|f| f.to_string())
    }

    pub fn reset(&mut self) {
        self.machine.reset();
    }

    /// Serialize the whole machine (hart record + RAM), zstd-compressed.
    pub fn get_state(&mut self) -> Result<Vec<u8>, JsValue> {
        self.machine.save_compressed(self.clock_us, 0).map_err(js_err)
    }

    pub fn set_state(&mut self, state: &[u8]) -> Result<(), JsValue> {
        self.clock_us = self.machine.load_compressed(state).map_err(js_err)?;
        Ok(())
    }
}

/// Decompress zstd-compressed data
#[wasm_bindgen]
pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, JsValue> {
    image::decompress_zstd(data).map_err(js_err)
}

/// Decompress gzip-compressed data
#[wasm_bindgen]
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, JsValue> {
    image::decompress_gzip(data).map_err(js_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    // lui a0, 0x10000; li a1, 'k'; sb a1, 0(a0); jal x0, 0
    const PRINT_K: [u32; 4] = [0x1000_0537, 0x06B0_0593, 0x00B5_0023, 0x0000_006F];

    fn program() -> Vec<u8> {
        PRINT_K.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_emulator_creation() {
        let emu = Emulator::new(1).unwrap();
        assert_eq!(emu.get_pc(), 0x8000_0000);
        assert_eq!(emu.get_registers().len(), 32);
    }

    #[test]
    fn test_runs_and_prints() {
        let mut emu = Emulator::new(1).unwrap();
        emu.load_kernel(&program()).unwrap();
        assert_eq!(emu.step(0, 16), 0);
        assert_eq!(emu.get_uart_output(), b"k");
        assert_eq!(emu.get_pc(), 0x8000_000C);
        assert!(emu.send_char(b'x'));
    }

    #[test]
    fn test_default_dtb_loads() {
        let mut emu = Emulator::new(1).unwrap();
        emu.load_default_dtb(dtb::DEFAULT_BOOTARGS).unwrap();
        let a1 = emu.get_registers()[11];
        let mut magic = [0u8; 4];
        emu.machine.read_ram(a1, &mut magic).unwrap();
        assert_eq!(magic, [0xd0, 0x0d, 0xfe, 0xed]);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut emu = Emulator::new(1).unwrap();
        emu.load_kernel(&program()).unwrap();
        emu.step(250, 8);

        let state = emu.get_state().unwrap();
        assert!(!state.is_empty());

        let mut emu2 = Emulator::new(1).unwrap();
        emu2.set_state(&state).unwrap();
        assert_eq!(emu.get_registers(), emu2.get_registers());
        assert_eq!(emu.get_pc(), emu2.get_pc());
        assert_eq!(emu2.clock_us, 250);
        assert_eq!(emu2.machine.clint().mtime().get(), 250);
    }
}
