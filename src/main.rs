use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use mrv32::dtb::{generate_fdt, DEFAULT_BOOTARGS};
use mrv32::{
    ConsoleSink, Machine, MachineConfig, Pacer, RamBacking, SeekRam, SerialFifo, StdoutConsole, StepStatus,
    SystemClock, VecRam,
};

/// Host-side pause when the guest idles in WFI.
const SLEEP_SLICE: Duration = Duration::from_micros(500);

#[derive(Parser, Debug)]
#[command(name = "mrv32", about = "RV32IMA emulator", version)]
struct Args {
    /// Kernel image (raw, gzip or zstd), loaded at the start of RAM
    #[arg(required_unless_present = "resume")]
    image: Option<PathBuf>,

    /// Device tree blob; a built-in tree is generated when omitted
    #[arg(long)]
    dtb: Option<PathBuf>,

    /// Do not load any device tree
    #[arg(long, conflicts_with = "dtb")]
    no_dtb: bool,

    /// Kernel command line for the built-in device tree
    #[arg(long, default_value = DEFAULT_BOOTARGS)]
    cmdline: String,

    /// RAM size in MiB
    #[arg(long, default_value_t = 12)]
    ram_mib: u32,

    /// Instructions per step
    #[arg(long, default_value_t = 1024)]
    budget: u32,

    /// Slow the guest clock down by this factor
    #[arg(long, default_value_t = 1)]
    time_divisor: u64,

    /// Derive guest time from retired instructions instead of the wall clock
    #[arg(long)]
    fixed_time: bool,

    /// Stop on any guest exception instead of delivering it
    #[arg(long)]
    fail_on_all_faults: bool,

    /// Keep guest RAM in this file instead of in memory
    #[arg(long)]
    ram_file: Option<PathBuf>,

    /// Save the hart state here on exit (RAM goes to <state>.ram unless --ram-file is used)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Resume from --state instead of booting an image
    #[arg(long, requires = "state")]
    resume: bool,

    /// Stop after this many instructions (0 = no limit)
    #[arg(long, default_value_t = 0)]
    max_instructions: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let ram_size = args
        .ram_mib
        .checked_mul(1024 * 1024)
        .ok_or("RAM size does not fit in the 32-bit address space")?;
    let config = MachineConfig {
        ram_size,
        fail_on_all_faults: args.fail_on_all_faults,
        ..MachineConfig::default()
    };

    let serial_in = SerialFifo::new();
    spawn_stdin_reader(serial_in.clone());
    let console = Box::new(StdoutConsole);

    match &args.ram_file {
        Some(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            file.set_len(ram_size as u64)?;
            log::info!("RAM backed by {}", path.display());
            let ram = SeekRam::new(file, ram_size);
            run(Machine::new(config, ram, console, serial_in)?, &args)
        }
        None => {
            let ram = VecRam::new(ram_size);
            run(Machine::new(config, ram, console, serial_in)?, &args)
        }
    }
}

fn run<R: RamBacking>(mut machine: Machine<R>, args: &Args) -> Result<(), Box<dyn Error>> {
    let mut pacer = if args.fixed_time {
        Pacer::fixed(args.time_divisor)
    } else {
        Pacer::wall(Box::new(SystemClock), args.time_divisor)
    };

    if args.resume {
        let state = args.state.as_deref().ok_or("--resume needs --state")?;
        let last_time = machine.load_state(BufReader::new(File::open(state)?))?;
        if args.ram_file.is_none() {
            machine.load_ram(BufReader::new(File::open(ram_image_path(state))?))?;
        }
        pacer.restore(last_time, machine.cpu().cycle());
    } else {
        load_images(&mut machine, args)?;
    }

    let started = Instant::now();
    // Instructions retired by earlier boots; `reset` zeroes the cycle counter.
    let mut retired_before = 0u64;
    let mut boot_cycle = machine.cpu().cycle();

    loop {
        let elapsed = pacer.elapsed_us(machine.cpu().cycle());
        match machine.step(elapsed, args.budget) {
            StepStatus::Running => {}
            StepStatus::Sleep => {
                if pacer.is_fixed() {
                    pacer.idle(args.budget);
                } else {
                    thread::sleep(SLEEP_SLICE);
                }
            }
            StepStatus::Shutdown => break,
            StepStatus::Restart => {
                retired_before += machine.cpu().cycle().saturating_sub(boot_cycle);
                boot_cycle = 0;
                machine.reset();
                pacer.reset();
                load_images(&mut machine, args)?;
            }
            StepStatus::Fault => break,
        }

        let retired = retired_before + machine.cpu().cycle().saturating_sub(boot_cycle);
        if args.max_instructions != 0 && retired >= args.max_instructions {
            log::info!("instruction limit reached");
            break;
        }
    }
    machine.console_mut().flush();

    let retired = retired_before + machine.cpu().cycle().saturating_sub(boot_cycle);
    let secs = started.elapsed().as_secs_f64();
    eprintln!(
        "\n{} instructions in {:.2}s ({:.2} MIPS)",
        retired,
        secs,
        retired as f64 / secs.max(1e-9) / 1e6
    );

    if let Some(state) = &args.state {
        save(&mut machine, state, pacer.last_time(), args.ram_file.is_none())?;
    }

    match machine.take_fault() {
        Some(fault) => Err(fault.into()),
        None => Ok(()),
    }
}

/// Load the kernel and the device tree. On a restart after `--resume` there
/// may be no image; RAM is then rebooted as it is.
fn load_images<R: RamBacking>(machine: &mut Machine<R>, args: &Args) -> Result<(), Box<dyn Error>> {
    let Some(image) = &args.image else {
        log::warn!("no kernel image to reload; rebooting RAM as is");
        return Ok(());
    };
    machine.load_image(&fs::read(image)?)?;

    if args.no_dtb {
        return Ok(());
    }
    match &args.dtb {
        Some(path) => machine.load_dtb(&fs::read(path)?)?,
        None => {
            let blob = generate_fdt(machine.config(), &args.cmdline);
            machine.load_dtb(&blob)?;
        }
    }
    Ok(())
}

fn save<R: RamBacking>(machine: &mut Machine<R>, state: &Path, last_time: u64, with_ram: bool) -> Result<(), Box<dyn Error>> {
    machine.save_state(BufWriter::new(File::create(state)?), last_time)?;
    if with_ram {
        machine.save_ram(BufWriter::new(File::create(ram_image_path(state))?))?;
    }
    log::info!("state saved to {}", state.display());
    Ok(())
}

fn ram_image_path(state: &Path) -> PathBuf {
    let mut name = state.as_os_str().to_owned();
    name.push(".ram");
    PathBuf::from(name)
}

/// Single producer for the serial FIFO. Blocks on stdin and backs off while
/// the guest has not drained the FIFO.
fn spawn_stdin_reader(fifo: SerialFifo) {
    thread::spawn(move || {
        let mut buf = [0u8; 64];
        let mut stdin = io::stdin();
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("stdin: {}", e);
                    return;
                }
            };
            for &byte in &buf[..n] {
                while !fifo.push(byte) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    });
}
