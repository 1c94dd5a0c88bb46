//! The outer execute/switch loop.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use log::{info, warn};
use muon_cpu::CpuEngine;
use muon_loader::{load_executable, load_rom, LoadError};
use muon_mm::{MemError, MemProt};
use muon_sched::THREAD_PRIORITY_NORMAL;

use crate::input::InputSender;
use crate::lcd::{LCD_REGISTER_BASE, LCD_REGISTER_SIZE};
use crate::{Clock, Kernel, MAIN_STACK_SIZE};

/// Construction-time failures.
#[derive(Debug)]
pub enum RuntimeError {
    /// Image loading failed.
    Load(LoadError),
    /// Mapping a platform region or the main stack failed.
    Mem(MemError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(e) => write!(f, "load failed: {e}"),
            Self::Mem(e) => write!(f, "memory setup failed: {e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<LoadError> for RuntimeError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<MemError> for RuntimeError {
    fn from(e: MemError) -> Self {
        Self::Mem(e)
    }
}

/// What to boot.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Guest executable (ELF32 or PE32).
    pub executable: PathBuf,
    /// Directory searched for dependency DLLs.
    pub system_dir: PathBuf,
    /// Kernel ROM blob, skipped if absent.
    pub rom: Option<PathBuf>,
}

/// One emulated machine: a CPU engine plus the [`Kernel`].
pub struct Runtime<E: CpuEngine> {
    engine: E,
    /// The machine state; public so embedders can reach the framebuffer,
    /// post input, or register extra syscalls.
    pub kernel: Kernel,
}

impl<E: CpuEngine> Runtime<E> {
    /// Boots a machine: maps the platform regions, loads the ROM and the
    /// executable, and creates the main thread at its entry point.
    pub fn new(engine: E, opts: &RuntimeOptions) -> Result<Self, RuntimeError> {
        let mut kernel = Kernel::new(Clock::monotonic());
        boot(&mut kernel, opts)?;
        Ok(Self { engine, kernel })
    }

    /// Wraps an already prepared kernel. Test entry point.
    pub fn from_parts(engine: E, kernel: Kernel) -> Self {
        Self { engine, kernel }
    }

    /// A handle for posting input events from other host threads.
    pub fn input_sender(&self) -> InputSender {
        self.kernel.input.sender()
    }

    /// Runs the guest until the main thread returns (or the fault-storm
    /// guard trips).
    ///
    /// Each iteration runs the current thread from its saved pc until a
    /// hook stops execution, then rotates the ring. When a full pass makes
    /// no progress — every thread parked — the loop naps briefly instead
    /// of spinning on the runnability predicate.
    pub fn run(&mut self) {
        let mut idle_passes = 0usize;
        while !self.kernel.exit_requested() {
            self.kernel.begin_slice();
            let pc = self.kernel.sched.current().resume_pc();
            let _ = self.engine.start(pc, &mut self.kernel);

            if self.kernel.exit_requested() {
                break;
            }
            if self.kernel.take_progress() {
                idle_passes = 0;
            } else {
                idle_passes += 1;
                if idle_passes >= self.kernel.sched.len() {
                    std::thread::sleep(Duration::from_millis(1));
                    idle_passes = 0;
                }
            }
            self.kernel.sched.switch(&mut self.engine);
        }
        info!("emulation finished");
    }
}

/// Maps platform regions and loads the guest images.
fn boot(kernel: &mut Kernel, opts: &RuntimeOptions) -> Result<(), RuntimeError> {
    kernel
        .mem
        .static_alloc(LCD_REGISTER_BASE, LCD_REGISTER_SIZE, MemProt::READ | MemProt::WRITE)?;

    if let Some(rom) = &opts.rom {
        if rom.exists() {
            load_rom(&mut kernel.mem, rom)?;
        } else {
            warn!("kernel ROM {} not found, continuing without it", rom.display());
        }
    }

    let image = load_executable(
        &mut kernel.mem,
        &mut kernel.modules,
        &opts.executable,
        &opts.system_dir,
    )?;
    let entry = kernel.modules.image(image).entry;
    kernel
        .sched
        .spawn(&mut kernel.mem, entry, 0, THREAD_PRIORITY_NORMAL, MAIN_STACK_SIZE)?;
    info!("main thread created at entry {entry}");
    Ok(())
}
