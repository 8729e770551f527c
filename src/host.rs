//! Host-facing capabilities
//!
//! What the interpreter needs from whoever embeds it: somewhere to put
//! console bytes, optionally a clock, and the pacing logic that turns that
//! clock into the `elapsed_us` argument of `Machine::step`.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Terminal output. Never blocks and never fails from the guest's view.
pub trait ConsoleSink {
    fn write(&mut self, bytes: &[u8]);

    fn flush(&mut self) {}
}

/// Console that collects output in memory. Clones share the same buffer, so
/// a host keeps one clone and hands the other to the machine.
#[derive(Clone, Default)]
pub struct BufferConsole {
    buf: Rc<RefCell<Vec<u8>>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything written so far.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConsoleSink for BufferConsole {
    fn write(&mut self, bytes: &[u8]) {
        self.buf.borrow_mut().extend_from_slice(bytes);
    }
}

/// Console on the process's stdout.
#[derive(Default)]
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn write(&mut self, bytes: &[u8]) {
        let mut out = io::stdout().lock();
        // A closed stdout is not the guest's problem.
        let _ = out.write_all(bytes);
        if bytes.contains(&b'\n') {
            let _ = out.flush();
        }
    }

    fn flush(&mut self) {
        let _ = io::stdout().flush();
    }
}

pub trait WallClock {
    fn micros(&self) -> u64;
}

/// Microseconds since the Unix epoch.
pub struct SystemClock;

impl WallClock for SystemClock {
    fn micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

pub enum TimeSource {
    /// Real time from a clock
    Wall(Box<dyn WallClock>),
    /// Virtual time derived from retired instructions; runs are reproducible.
    Cycles,
}

/// Turns a time source into per-step `elapsed_us` values.
///
/// `time_divisor` slows the guest clock down; `last_time` is the value of
/// the scaled clock at the previous call and is what snapshots persist.
pub struct Pacer {
    source: TimeSource,
    divisor: u64,
    last_time: u64,
    /// Virtual time granted while the guest idled in WFI (fixed-time only)
    idle_credit: u64,
}

impl Pacer {
    /// Pace against a wall clock, anchored at the current time.
    pub fn wall(clock: Box<dyn WallClock>, time_divisor: u64) -> Self {
        let divisor = time_divisor.max(1);
        let last_time = clock.micros() / divisor;
        Pacer {
            source: TimeSource::Wall(clock),
            divisor,
            last_time,
            idle_credit: 0,
        }
    }

    /// Pace against the retired-instruction counter.
    pub fn fixed(time_divisor: u64) -> Self {
        Pacer {
            source: TimeSource::Cycles,
            divisor: time_divisor.max(1),
            last_time: 0,
            idle_credit: 0,
        }
    }

    fn now(&self, cycle: u64) -> u64 {
        match &self.source {
            TimeSource::Wall(clock) => clock.micros() / self.divisor,
            TimeSource::Cycles => cycle.wrapping_add(self.idle_credit) / self.divisor,
        }
    }

    /// Time to pass to the next `step`, given the machine's current cycle
    /// count. Never negative: a clock that steps backwards yields 0.
    pub fn elapsed_us(&mut self, cycle: u64) -> u64 {
        let now = self.now(cycle);
        let elapsed = now.saturating_sub(self.last_time);
        self.last_time = self.last_time.max(now);
        elapsed
    }

    /// The guest returned `Sleep`. In fixed-time mode, credit one budget of
    /// virtual time so a WFI loop still sees the timer advance.
    pub fn idle(&mut self, budget: u32) {
        if let TimeSource::Cycles = self.source {
            self.idle_credit = self.idle_credit.wrapping_add(budget as u64);
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.source, TimeSource::Cycles)
    }

    pub fn last_time(&self) -> u64 {
        self.last_time
    }

    /// The machine was reset and its cycle counter restarted from 0. Start
    /// over so the rebooted guest's clock moves from the first step.
    pub fn reset(&mut self) {
        match &self.source {
            TimeSource::Cycles => {
                self.last_time = 0;
                self.idle_credit = 0;
            }
            TimeSource::Wall(clock) => self.last_time = clock.micros() / self.divisor,
        }
    }

    /// Restore `last_time` from a snapshot. In fixed-time mode the idle
    /// credit is rebuilt so the next call continues from `last_time`.
    pub fn restore(&mut self, last_time: u64, cycle: u64) {
        if self.is_fixed() {
            let target = last_time.saturating_mul(self.divisor);
            self.idle_credit = target.saturating_sub(cycle);
            self.last_time = last_time;
        } else {
            // Wall time kept running while the snapshot sat on disk;
            // re-anchor instead of replaying the gap.
            self.last_time = self.now(cycle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeClock(Rc<Cell<u64>>);

    impl WallClock for FakeClock {
        fn micros(&self) -> u64 {
            self.0.get()
        }
    }

    #[test]
    fn test_buffer_console_shared() {
        let console = BufferConsole::new();
        let mut sink = console.clone();
        sink.write(b"POWEROFF!\n");
        assert_eq!(console.len(), 10);
        assert_eq!(console.take(), b"POWEROFF!\n");
        assert!(console.is_empty());
    }

    #[test]
    fn test_fixed_pacer_follows_cycles() {
        let mut pacer = Pacer::fixed(1);
        assert_eq!(pacer.elapsed_us(100), 100);
        assert_eq!(pacer.elapsed_us(150), 50);
        assert_eq!(pacer.last_time(), 150);

        pacer.idle(1000);
        assert_eq!(pacer.elapsed_us(150), 1000);
    }

    #[test]
    fn test_time_divisor() {
        let mut pacer = Pacer::fixed(4);
        assert_eq!(pacer.elapsed_us(400), 100);
        assert_eq!(pacer.elapsed_us(403), 0);
        assert_eq!(pacer.elapsed_us(404), 1);
    }

    #[test]
    fn test_wall_pacer_never_negative() {
        let t = Rc::new(Cell::new(1_000_000));
        let mut pacer = Pacer::wall(Box::new(FakeClock(t.clone())), 1);
        assert_eq!(pacer.elapsed_us(0), 0);

        t.set(1_000_250);
        assert_eq!(pacer.elapsed_us(0), 250);

        t.set(999_000);
        assert_eq!(pacer.elapsed_us(0), 0);
        t.set(1_000_300);
        assert_eq!(pacer.elapsed_us(0), 50);
    }

    #[test]
    fn test_fixed_reset_restarts_from_zero() {
        let mut pacer = Pacer::fixed(1);
        assert_eq!(pacer.elapsed_us(10_000), 10_000);
        pacer.idle(64);

        pacer.reset();
        assert_eq!(pacer.last_time(), 0);
        assert_eq!(pacer.elapsed_us(100), 100);
    }

    #[test]
    fn test_wall_reset_reanchors() {
        let t = Rc::new(Cell::new(500));
        let mut pacer = Pacer::wall(Box::new(FakeClock(t.clone())), 1);
        t.set(900);
        pacer.reset();
        t.set(1000);
        assert_eq!(pacer.elapsed_us(0), 100);
    }

    #[test]
    fn test_fixed_restore_continues() {
        let mut pacer = Pacer::fixed(1);
        pacer.restore(5000, 3000);
        assert_eq!(pacer.elapsed_us(3000), 0);
        assert_eq!(pacer.elapsed_us(3010), 10);
    }
}
