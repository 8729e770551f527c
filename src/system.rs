//! System orchestrator
//!
//! Brings together CPU, RAM and devices behind one owned `Machine`, and
//! drives them in bounded steps.

use std::borrow::Cow;

use crate::config::MachineConfig;
use crate::cpu::csr::{MIP_MEIP, MIP_MSIP, MIP_MTIP};
use crate::cpu::{Cpu, ExecError, Trap};
use crate::devices::{syscon, Clint, SerialFifo, Uart, CLINT_SIZE, UART_SIZE};
use crate::error::{BusFault, ConfigError, Fault, LoadError};
use crate::host::ConsoleSink;
use crate::image::unpack_image;
use crate::memory::{Bus, MmioEffect, RamBacking, VecRam};

/// Longest string the string debug CSR will print.
const DEBUG_STR_MAX: u32 = 4096;

/// What `step` wants the host to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Budget exhausted, or a synchronous exception was delivered; call again.
    Running,
    /// The hart is in WFI with nothing pending.
    Sleep,
    /// The guest powered off.
    Shutdown,
    /// The guest asked for a restart.
    Restart,
    /// Stopped on a fault; see `Machine::fault`.
    Fault,
}

impl StepStatus {
    /// Numeric form for hosts that cannot take Rust enums.
    pub fn code(self) -> u32 {
        match self {
            StepStatus::Running => 0,
            StepStatus::Sleep => 1,
            StepStatus::Shutdown => 2,
            StepStatus::Restart => 3,
            StepStatus::Fault => 4,
        }
    }
}

/// Verdict of the exception hook on a synchronous exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Enter the trap handler with this (possibly reclassified) trap.
    Deliver(Trap),
    /// Retire the faulting instruction as a no-op.
    Skip,
}

/// Called with the faulting instruction word and the trap.
pub type ExceptionHook = Box<dyn FnMut(u32, Trap) -> Disposition>;

/// The whole emulated machine: one hart, RAM, UART, CLINT and syscon.
pub struct Machine<R: RamBacking = VecRam> {
    pub(crate) cpu: Cpu,
    pub(crate) ram: R,
    pub(crate) uart: Uart,
    pub(crate) clint: Clint,
    pub(crate) config: MachineConfig,
    exception_hook: Option<ExceptionHook>,
    external_irq: bool,
    halted: bool,
    fault: Option<Fault>,
}

impl Machine<VecRam> {
    /// Machine with heap RAM and a fresh serial FIFO.
    pub fn in_memory(config: MachineConfig, console: Box<dyn ConsoleSink>) -> Result<Self, ConfigError> {
        let ram = VecRam::new(config.ram_size);
        Machine::new(config, ram, console, SerialFifo::new())
    }
}

impl<R: RamBacking> Machine<R> {
    pub fn new(
        config: MachineConfig,
        ram: R,
        console: Box<dyn ConsoleSink>,
        serial_in: SerialFifo,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if ram.size() != config.ram_size {
            return Err(ConfigError::RamSizeMismatch {
                config: config.ram_size,
                backing: ram.size(),
            });
        }

        log::info!(
            "machine: {} KiB RAM at {:#010x}, dtb slot at {:#010x}",
            config.ram_size / 1024,
            config.ram_base,
            config.dtb_addr()
        );

        Ok(Machine {
            cpu: Cpu::new(config.ram_base, config.dtb_addr()),
            ram,
            uart: Uart::new(serial_in, console),
            clint: Clint::new(),
            config,
            exception_hook: None,
            external_irq: false,
            halted: false,
            fault: None,
        })
    }

    /// Copy a kernel image (raw, gzip or zstd) to the start of RAM.
    pub fn load_image(&mut self, image: &[u8]) -> Result<(), LoadError> {
        let image = unpack_image(image)?;
        if image.len() as u64 > self.config.ram_size as u64 {
            return Err(LoadError::DoesNotFit {
                addr: self.config.ram_base,
                len: image.len(),
            });
        }
        self.ram.write(0, &image)?;
        log::info!("loaded {} byte image at {:#010x}", image.len(), self.config.ram_base);
        Ok(())
    }

    /// Copy a device tree (raw, gzip or zstd) into its slot near the end of RAM.
    pub fn load_dtb(&mut self, dtb: &[u8]) -> Result<(), LoadError> {
        let dtb: Cow<[u8]> = unpack_image(dtb)?;
        if dtb.len() as u64 > self.config.dtb_size as u64 {
            return Err(LoadError::DtbTooLarge {
                len: dtb.len(),
                slot: self.config.dtb_size,
            });
        }
        let offset = self.config.dtb_addr() - self.config.ram_base;
        self.ram.write(offset, &dtb)?;
        log::info!("loaded {} byte device tree at {:#010x}", dtb.len(), self.config.dtb_addr());
        Ok(())
    }

    /// Back to the boot register state. RAM is left alone so the host can
    /// reload images or reboot into what is already there.
    pub fn reset(&mut self) {
        self.cpu.reset(self.config.ram_base, self.config.dtb_addr());
        self.clint.reset();
        self.reset_host_state();
        log::debug!("machine reset");
    }

    pub(crate) fn reset_host_state(&mut self) {
        self.external_irq = false;
        self.halted = false;
        self.fault = None;
    }

    /// Run up to `budget` instructions after advancing `mtime` by `elapsed_us`.
    pub fn step(&mut self, elapsed_us: u64, budget: u32) -> StepStatus {
        if self.halted {
            return StepStatus::Shutdown;
        }

        self.clint.advance(elapsed_us);
        self.sync_interrupts();

        if self.cpu.wfi {
            if !self.cpu.interrupt_pending() {
                return StepStatus::Sleep;
            }
            self.cpu.wfi = false;
        }

        for _ in 0..budget {
            if let Some(irq) = self.cpu.check_interrupts() {
                log::trace!("interrupt {:?} at {:#010x}", irq, self.cpu.pc);
                self.cpu.handle_trap(irq);
                continue;
            }

            if self.cpu.wfi {
                if !self.cpu.interrupt_pending() {
                    return StepStatus::Sleep;
                }
                self.cpu.wfi = false;
            }

            let result = {
                let mut bus = SystemBus {
                    ram: &mut self.ram,
                    uart: &mut self.uart,
                    clint: &mut self.clint,
                    config: &self.config,
                };
                self.cpu.step(&mut bus)
            };
            // Stores to the CLINT may have changed the interrupt lines.
            self.sync_interrupts();

            match result {
                Ok(MmioEffect::None) => {}
                Ok(MmioEffect::PowerOff) => {
                    log::info!("guest powered off after {} instructions", self.cpu.cycle());
                    self.uart.console_mut().write(b"POWEROFF!\n");
                    self.halted = true;
                    return StepStatus::Shutdown;
                }
                Ok(MmioEffect::Restart) => {
                    log::info!("guest requested restart");
                    return StepStatus::Restart;
                }
                Err(ExecError::Trap(trap)) => return self.on_exception(trap),
                Err(ExecError::Bus(source)) => {
                    let fault = Fault::Bus { pc: self.cpu.pc, source };
                    log::error!("{}", fault);
                    let msg = format!("FAULT: {}\n", fault);
                    self.uart.console_mut().write(msg.as_bytes());
                    self.fault = Some(fault);
                    return StepStatus::Fault;
                }
            }
        }

        StepStatus::Running
    }

    fn on_exception(&mut self, trap: Trap) -> StepStatus {
        let pc = self.cpu.pc;
        let inst = self.cpu.last_inst;

        if self.config.fail_on_all_faults {
            log::error!("fault {:?} at {:#010x} (inst {:#010x})", trap, pc, inst);
            self.uart.console_mut().write(b"FAULT\n");
            self.fault = Some(Fault::Exception { trap, pc, inst });
            return StepStatus::Fault;
        }

        let disposition = match self.exception_hook.as_mut() {
            Some(hook) => hook(inst, trap),
            None => Disposition::Deliver(trap),
        };

        match disposition {
            Disposition::Deliver(trap) => {
                log::debug!("trap {:?} at {:#010x}", trap, pc);
                self.cpu.handle_trap(trap);
            }
            Disposition::Skip => {
                log::debug!("skipping {:#010x} at {:#010x}", inst, pc);
                self.cpu.pc = pc.wrapping_add(4);
                self.cpu.csr.cycle.add(1);
            }
        }
        StepStatus::Running
    }

    /// Mirror device interrupt lines and the timer into the CSR file.
    fn sync_interrupts(&mut self) {
        let csr = &mut self.cpu.csr;
        csr.set_interrupt_line(MIP_MTIP, self.clint.timer_pending());
        csr.set_interrupt_line(MIP_MSIP, self.clint.software_pending());
        csr.set_interrupt_line(MIP_MEIP, self.external_irq);
        csr.time = self.clint.mtime();
    }

    /// Drive the machine external interrupt line (mip.MEIP).
    pub fn set_external_interrupt(&mut self, level: bool) {
        self.external_irq = level;
        self.cpu.csr.set_interrupt_line(MIP_MEIP, level);
    }

    /// Install a hook that sees every synchronous exception before delivery.
    pub fn set_exception_hook<F>(&mut self, hook: F)
    where
        F: FnMut(u32, Trap) -> Disposition + 'static,
    {
        self.exception_hook = Some(Box::new(hook));
    }

    pub fn clear_exception_hook(&mut self) {
        self.exception_hook = None;
    }

    /// Read guest RAM directly. The range must lie entirely in RAM.
    pub fn read_ram(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BusFault> {
        let offset = ram_offset(&self.config, addr, buf.len() as u32).ok_or(BusFault::Unmapped(addr))?;
        self.ram
            .read(offset, buf)
            .map_err(|source| BusFault::Backing { addr, source })
    }

    /// Write guest RAM directly. The range must lie entirely in RAM.
    pub fn write_ram(&mut self, addr: u32, data: &[u8]) -> Result<(), BusFault> {
        let offset = ram_offset(&self.config, addr, data.len() as u32).ok_or(BusFault::Unmapped(addr))?;
        self.ram
            .write(offset, data)
            .map_err(|source| BusFault::Backing { addr, source })
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn clint(&self) -> &Clint {
        &self.clint
    }

    pub fn clint_mut(&mut self) -> &mut Clint {
        &mut self.clint
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn ram(&self) -> &R {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut R {
        &mut self.ram
    }

    pub fn into_ram(self) -> R {
        self.ram
    }

    /// Producer handle for the serial input FIFO.
    pub fn serial_in(&self) -> SerialFifo {
        self.uart.rx().clone()
    }

    pub fn console_mut(&mut self) -> &mut dyn ConsoleSink {
        self.uart.console_mut()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Why the last `step` returned `Fault`, if it did.
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn take_fault(&mut self) -> Option<Fault> {
        self.fault.take()
    }
}

/// Offset into RAM if `[addr, addr + len)` lies entirely inside it.
#[inline(always)]
fn ram_offset(config: &MachineConfig, addr: u32, len: u32) -> Option<u32> {
    let offset = addr.wrapping_sub(config.ram_base);
    if offset as u64 + len as u64 <= config.ram_size as u64 {
        Some(offset)
    } else {
        None
    }
}

/// The bus the CPU sees during one instruction: RAM first, then the MMIO
/// devices, then the quiet part of the MMIO window.
struct SystemBus<'a, R: RamBacking> {
    ram: &'a mut R,
    uart: &'a mut Uart,
    clint: &'a mut Clint,
    config: &'a MachineConfig,
}

impl<'a, R: RamBacking> SystemBus<'a, R> {
    #[inline(always)]
    fn ram_read<const N: usize>(&mut self, addr: u32) -> Option<Result<[u8; N], BusFault>> {
        let offset = ram_offset(self.config, addr, N as u32)?;
        let mut buf = [0u8; N];
        Some(
            self.ram
                .read(offset, &mut buf)
                .map(|()| buf)
                .map_err(|source| BusFault::Backing { addr, source }),
        )
    }

    #[inline(always)]
    fn ram_write(&mut self, addr: u32, data: &[u8]) -> Option<Result<MmioEffect, BusFault>> {
        let offset = ram_offset(self.config, addr, data.len() as u32)?;
        Some(
            self.ram
                .write(offset, data)
                .map(|()| MmioEffect::None)
                .map_err(|source| BusFault::Backing { addr, source }),
        )
    }

    fn in_window(&self, addr: u32) -> bool {
        addr >= self.config.mmio.window_start && addr < self.config.mmio.window_end
    }

    /// MMIO load of `width` bytes (1, 2 or 4).
    fn mmio_load(&mut self, addr: u32, width: u32) -> Result<u32, BusFault> {
        let map = &self.config.mmio;
        if addr.wrapping_sub(map.uart_base) < UART_SIZE {
            return Ok(self.uart.read8(addr - map.uart_base) as u32);
        }
        if addr.wrapping_sub(map.clint_base) < CLINT_SIZE {
            let offset = addr - map.clint_base;
            return Ok(match width {
                1 => self.clint.read8(offset) as u32,
                2 => self.clint.read16(offset) as u32,
                _ => self.clint.read32(offset),
            });
        }
        if self.in_window(addr) {
            return Ok(0);
        }
        Err(BusFault::Unmapped(addr))
    }

    /// MMIO store of `width` bytes (1, 2 or 4).
    fn mmio_store(&mut self, addr: u32, value: u32, width: u32) -> Result<MmioEffect, BusFault> {
        let map = &self.config.mmio;
        if addr.wrapping_sub(map.uart_base) < UART_SIZE {
            self.uart.write8(addr - map.uart_base, value as u8);
            return Ok(MmioEffect::None);
        }
        if addr.wrapping_sub(map.clint_base) < CLINT_SIZE {
            let offset = addr - map.clint_base;
            match width {
                1 => self.clint.write8(offset, value as u8),
                2 => self.clint.write16(offset, value as u16),
                _ => self.clint.write32(offset, value),
            }
            return Ok(MmioEffect::None);
        }
        if addr == map.syscon_addr {
            return Ok(syscon::decode(value));
        }
        if self.in_window(addr) {
            log::trace!("dropping MMIO store {:#x} to {:#010x}", value, addr);
            return Ok(MmioEffect::None);
        }
        Err(BusFault::Unmapped(addr))
    }

    /// Print the NUL-terminated string at guest address `ptr`.
    fn print_guest_str(&mut self, ptr: u32) {
        let offset = match ram_offset(self.config, ptr, 1) {
            Some(offset) => offset,
            None => {
                log::warn!("debug string CSR: invalid pointer {:#010x}", ptr);
                return;
            }
        };
        let len = DEBUG_STR_MAX.min(self.config.ram_size - offset);
        let mut buf = vec![0u8; len as usize];
        if let Err(e) = self.ram.read(offset, &mut buf) {
            log::warn!("debug string CSR: {}", e);
            return;
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        self.uart.console_mut().write(&buf[..end]);
    }
}

impl<'a, R: RamBacking> Bus for SystemBus<'a, R> {
    fn load8(&mut self, addr: u32) -> Result<u8, BusFault> {
        if let Some(r) = self.ram_read::<1>(addr) {
            return r.map(|b| b[0]);
        }
        self.mmio_load(addr, 1).map(|v| v as u8)
    }

    fn load16(&mut self, addr: u32) -> Result<u16, BusFault> {
        if let Some(r) = self.ram_read::<2>(addr) {
            return r.map(u16::from_le_bytes);
        }
        self.mmio_load(addr, 2).map(|v| v as u16)
    }

    fn load32(&mut self, addr: u32) -> Result<u32, BusFault> {
        if let Some(r) = self.ram_read::<4>(addr) {
            return r.map(u32::from_le_bytes);
        }
        self.mmio_load(addr, 4)
    }

    fn store8(&mut self, addr: u32, value: u8) -> Result<MmioEffect, BusFault> {
        if let Some(r) = self.ram_write(addr, &[value]) {
            return r;
        }
        self.mmio_store(addr, value as u32, 1)
    }

    fn store16(&mut self, addr: u32, value: u16) -> Result<MmioEffect, BusFault> {
        if let Some(r) = self.ram_write(addr, &value.to_le_bytes()) {
            return r;
        }
        self.mmio_store(addr, value as u32, 2)
    }

    fn store32(&mut self, addr: u32, value: u32) -> Result<MmioEffect, BusFault> {
        if let Some(r) = self.ram_write(addr, &value.to_le_bytes()) {
            return r;
        }
        self.mmio_store(addr, value, 4)
    }

    /// Instructions only come from RAM.
    fn fetch32(&mut self, addr: u32) -> Result<u32, BusFault> {
        match self.ram_read::<4>(addr) {
            Some(r) => r.map(u32::from_le_bytes),
            None => Err(BusFault::Unmapped(addr)),
        }
    }

    fn is_ram(&self, addr: u32, len: u32) -> bool {
        ram_offset(self.config, addr, len).is_some()
    }

    fn debug_csr_write(&mut self, csr: u32, value: u32) {
        let map = &self.config.mmio;
        if csr == map.debug_dec_csr {
            let s = format!("{}", value as i32);
            self.uart.console_mut().write(s.as_bytes());
        } else if csr == map.debug_hex_csr {
            let s = format!("{:08x}", value);
            self.uart.console_mut().write(s.as_bytes());
        } else if csr == map.debug_str_csr {
            self.print_guest_str(value);
        } else {
            log::trace!("write to unimplemented CSR {:#05x} = {:#x}", csr, value);
        }
    }
}
