//! The DCPU-16 machine: CPU, memory, peripherals and the clock-driven
//! scheduler that ties them together.

pub mod cpu;
pub mod keyboard;
pub mod memory;
pub mod screen;
pub mod video;

pub use self::memory::Word;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use self::cpu::{Cpu, Registers};
use self::keyboard::Keyboard;
use self::memory::Region;
use self::screen::Screen;
use self::video::{Video, VideoInner};

/// Default CPU clock: 100 kHz.
pub const DEFAULT_CLOCK_RATE: ClockRate = ClockRate(100_000);
/// Default screen refresh: 60 Hz.
pub const DEFAULT_SCREEN_REFRESH_RATE: ClockRate = ClockRate(60);

/// Where the video buffer is mapped while the machine runs.
pub const VIDEO_BASE: Word = 0x8000;
/// Where the keyboard buffer is mapped while the machine runs.
pub const KEYBOARD_BASE: Word = 0x9000;

/// Everything that can go wrong in the machine. Setup problems come back
/// synchronously; faults raised while stepping surface once on the error
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(
        "protection violation at address {address:#06x} \
         (instruction {opcode:#06x}, operands {operand_a:#x}, {operand_b:#x})"
    )]
    Protection {
        address: Word,
        opcode: Word,
        operand_a: Word,
        operand_b: Word,
    },

    #[error("cannot map or unmap {length} words at {start:#06x}")]
    MapConflict { start: Word, length: usize },

    #[error("cannot load {length} words at {base:#06x}")]
    LoadRange { base: Word, length: usize },

    #[error("invalid clock rate {0:?}")]
    InvalidClockRate(String),

    #[error("machine is already running")]
    AlreadyRunning,

    #[error("machine is not running")]
    NotRunning,

    #[error("peripheral rejected write of {value:#06x} at offset {offset:#06x}: {message}")]
    Peripheral {
        offset: Word,
        value: Word,
        message: String,
    },
}

/// A frequency in Hz. Parses from `50000`, `100kHz` or `1MHz` (suffix
/// case-insensitive) and prints back the largest exact unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockRate(pub u64);

impl fmt::Display for ClockRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 >= 1_000_000 && self.0 % 1_000_000 == 0 {
            write!(f, "{}MHz", self.0 / 1_000_000)
        } else if self.0 >= 1_000 && self.0 % 1_000 == 0 {
            write!(f, "{}kHz", self.0 / 1_000)
        } else {
            write!(f, "{}Hz", self.0)
        }
    }
}

impl FromStr for ClockRate {
    type Err = Error;

    fn from_str(s: &str) -> Result<ClockRate, Error> {
        let lower = s.trim().to_ascii_lowercase();
        let (digits, multiplier) = if let Some(d) = lower.strip_suffix("mhz") {
            (d, 1_000_000)
        } else if let Some(d) = lower.strip_suffix("khz") {
            (d, 1_000)
        } else if let Some(d) = lower.strip_suffix("hz") {
            (d, 1)
        } else {
            (lower.as_str(), 1)
        };
        digits
            .trim()
            .parse::<u64>()
            .map(|n| ClockRate(n * multiplier))
            .map_err(|_| Error::InvalidClockRate(s.to_string()))
    }
}

struct Shared {
    stop: bool,
}

struct Runner {
    shared: Arc<Mutex<Shared>>,
    execution: JoinHandle<()>,
    refresh: JoinHandle<()>,
}

struct ClockStats {
    cycles: u64,
    started: Instant,
    stopped: Option<Instant>,
}

/// A complete DCPU-16: CPU state, video, keyboard and the scheduler.
///
/// Lifecycle: construct, [`load_program`](Machine::load_program),
/// [`start`](Machine::start), then either [`stop`](Machine::stop) or react
/// to a fault from [`poll_error`](Machine::poll_error) by stopping.
pub struct Machine {
    cpu: Arc<Mutex<Cpu>>,
    pub video: Video,
    pub keyboard: Keyboard,
    stats: Arc<Mutex<ClockStats>>,
    errors: Option<Receiver<Error>>,
    runner: Option<Runner>,
}

impl Machine {
    /// Build a machine that renders to `screen`.
    pub fn new(screen: Box<dyn Screen>) -> Machine {
        let started = Instant::now();
        Machine {
            cpu: Arc::new(Mutex::new(Cpu::new())),
            video: Video::new(screen),
            keyboard: Keyboard::new(),
            stats: Arc::new(Mutex::new(ClockStats {
                cycles: 0,
                started,
                stopped: Some(started),
            })),
            errors: None,
            runner: None,
        }
    }

    /// Copy a compiled program into memory at `base`.
    pub fn load_program(&self, words: &[Word], base: Word) -> Result<(), Error> {
        self.cpu.lock().unwrap().memory.load_program(words, base)
    }

    /// Mark a region of backing storage as read-only for the program.
    pub fn protect(&self, region: Region) {
        self.cpu.lock().unwrap().memory.protect(region);
    }

    /// Map the peripherals and start executing at `rate`. Fails when the
    /// machine is already running or a peripheral cannot be mapped.
    pub fn start(&mut self, rate: ClockRate) -> Result<(), Error> {
        if self.runner.is_some() {
            return Err(Error::AlreadyRunning);
        }
        if rate.0 == 0 {
            return Err(Error::InvalidClockRate(rate.0.to_string()));
        }
        let refresh = if self.video.refresh_rate.0 == 0 {
            DEFAULT_SCREEN_REFRESH_RATE
        } else {
            self.video.refresh_rate
        };

        {
            let mut cpu = self.cpu.lock().unwrap();
            self.video.map_to(&mut cpu.memory, VIDEO_BASE)?;
            if let Err(err) = self.keyboard.map_to(&mut cpu.memory, KEYBOARD_BASE) {
                // leave no trace behind a failed start
                let _ = self.video.unmap_from(&mut cpu.memory);
                return Err(err);
            }
        }

        let stats = Arc::new(Mutex::new(ClockStats {
            cycles: 0,
            started: Instant::now(),
            stopped: None,
        }));
        self.stats = stats.clone();

        let (error_tx, error_rx) = mpsc::channel();
        self.errors = Some(error_rx);

        let shared = Arc::new(Mutex::new(Shared { stop: false }));

        // execution runs in batches of one video frame's worth of cycles,
        // sleeping off whatever real time is left in the frame
        let batch_cycles = (rate.0 / refresh.0).max(1);
        let slice = Duration::from_secs_f64(batch_cycles as f64 / rate.0 as f64);
        let execution = {
            let cpu = self.cpu.clone();
            let stats = stats.clone();
            let shared = shared.clone();
            thread::spawn(move || run_execution(cpu, stats, shared, error_tx, batch_cycles, slice))
        };

        let refresh_period = Duration::from_secs_f64(1.0 / refresh.0 as f64);
        let refresh = {
            let cpu = self.cpu.clone();
            let video = self.video.inner_handle();
            let shared = shared.clone();
            thread::spawn(move || run_refresh(cpu, video, stats, shared, refresh_period))
        };

        self.runner = Some(Runner {
            shared,
            execution,
            refresh,
        });
        log::info!("machine started at {}", rate);
        Ok(())
    }

    /// Halt the execution and refresh contexts, unmap the peripherals and
    /// return the last pending fault, if stepping died on one.
    pub fn stop(&mut self) -> Result<(), Error> {
        let runner = self.runner.take().ok_or(Error::NotRunning)?;
        runner.shared.lock().unwrap().stop = true;
        let _ = runner.execution.join();
        let _ = runner.refresh.join();

        {
            let mut cpu = self.cpu.lock().unwrap();
            self.video.unmap_from(&mut cpu.memory)?;
            self.keyboard.unmap_from(&mut cpu.memory)?;
        }
        log::info!("machine stopped");

        if let Some(errors) = &self.errors {
            if let Ok(fault) = errors.try_recv() {
                return Err(fault);
            }
        }
        Ok(())
    }

    /// Non-blocking check for a fatal fault from the execution context.
    /// A caller that sees one must still [`stop`](Machine::stop) the
    /// machine to release its threads.
    pub fn poll_error(&self) -> Option<Error> {
        self.errors.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    /// Cycles executed divided by wall time since `start`, frozen at the
    /// instant the execution context exited.
    pub fn effective_clock_rate(&self) -> ClockRate {
        let stats = self.stats.lock().unwrap();
        let end = stats.stopped.unwrap_or_else(Instant::now);
        let seconds = end.saturating_duration_since(stats.started).as_secs_f64();
        if seconds > 0.0 {
            ClockRate((stats.cycles as f64 / seconds).round() as u64)
        } else {
            ClockRate(0)
        }
    }

    /// A snapshot of the register file.
    pub fn registers(&self) -> Registers {
        self.cpu.lock().unwrap().registers
    }

    /// Dump backing memory to `sink` with the given offsets highlighted.
    pub fn dump_memory<W: io::Write>(&self, sink: &mut W, highlights: &[Word]) -> io::Result<()> {
        self.cpu.lock().unwrap().memory.dump(sink, highlights)
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.runner.is_some() {
            let _ = self.stop();
        }
    }
}

fn run_execution(
    cpu: Arc<Mutex<Cpu>>,
    stats: Arc<Mutex<ClockStats>>,
    shared: Arc<Mutex<Shared>>,
    errors: Sender<Error>,
    batch_cycles: u64,
    slice: Duration,
) {
    let mut deadline = Instant::now() + slice;
    loop {
        if shared.lock().unwrap().stop {
            break;
        }

        let mut executed = 0u64;
        let mut fault = None;
        {
            let mut cpu = cpu.lock().unwrap();
            while executed < batch_cycles {
                match cpu.step() {
                    Ok(cycles) => executed += u64::from(cycles),
                    Err(err) => {
                        fault = Some(err);
                        break;
                    }
                }
            }
        }
        stats.lock().unwrap().cycles += executed;

        if let Some(fault) = fault {
            log::error!("execution fault: {}", fault);
            let _ = errors.send(fault);
            break;
        }

        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            // running behind; don't let the schedule build up a debt
            deadline = now;
        }
        deadline += slice;
    }
    stats.lock().unwrap().stopped = Some(Instant::now());
}

fn run_refresh(
    cpu: Arc<Mutex<Cpu>>,
    video: Arc<Mutex<VideoInner>>,
    stats: Arc<Mutex<ClockStats>>,
    shared: Arc<Mutex<Shared>>,
    period: Duration,
) {
    loop {
        if shared.lock().unwrap().stop {
            break;
        }
        let registers = cpu.lock().unwrap().registers;
        let cycles = stats.lock().unwrap().cycles;
        {
            let mut video = video.lock().unwrap();
            video.draw_stats(&registers, cycles);
            video.flush_screen();
        }
        thread::sleep(period);
    }
}
