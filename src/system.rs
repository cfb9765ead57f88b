//! Emulator front end
//!
//! [`Emulator`] owns the kernel and drives the emulated cores, either one
//! slice at a time on the caller's thread ([`Emulator::step_core`]) or with
//! one OS thread per core plus a service pump thread
//! ([`Emulator::run_threaded`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::config::{ConfigError, EmulatorConfig};
use crate::cpu::{CpuContext, Dispatcher, RunExit};
use crate::image::{self, ImageError};
use crate::ipc::{pump_services, ServiceHandler};
use crate::kernel::{
    EventId, Kernel, KernelError, PortId, ProcessId, ProcessState, ThreadId, ThreadState,
};
use crate::memory::{AddressSpace, MemoryAttribute, MemoryError, MemoryPermission, MemoryState, Tlb, PAGE_SIZE};
use crate::snapshot::{ExitReason, ProcessSnapshot};

/// Where flat images are placed unless told otherwise
pub const DEFAULT_LOAD_BASE: u32 = 0x0001_0000;
/// Top of the main thread's stack
pub const STACK_TOP: u32 = 0x3FFF_0000;
pub const DEFAULT_STACK_SIZE: u32 = 0x0001_0000;
pub const DEFAULT_PRIORITY: u8 = 44;

/// How long an idle core sleeps before it looks for work again
const IDLE_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("invalid image: {0}")]
    Image(#[from] ImageError),
    #[error("image layout: {0}")]
    Layout(&'static str),
}

/// Placement of a flat image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    pub base: u32,
    /// Offset of the first writable byte; everything before it is text.
    /// `None` makes the whole image text.
    pub rw_offset: Option<u32>,
    /// Zeroed bytes appended after the image
    pub bss_size: u32,
    pub stack_size: u32,
    pub priority: u8,
    /// Core of the main thread; -2 is the process default
    pub core: i32,
    /// Initial a0 of the main thread
    pub arg: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            base: DEFAULT_LOAD_BASE,
            rw_offset: None,
            bss_size: 0,
            stack_size: DEFAULT_STACK_SIZE,
            priority: DEFAULT_PRIORITY,
            core: -2,
            arg: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    pub process: ProcessId,
    pub main_thread: ThreadId,
    pub entry: u32,
    pub stack_top: u32,
}

/// Outcome of one scheduling step on a core
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreStep {
    /// Nothing was ready
    Idle,
    Ran { thread: ThreadId, exit: RunExit },
}

/// Handle for host code that completes work asynchronously, e.g. a
/// service that signals an event from another thread
#[derive(Clone)]
pub struct KernelHandle {
    kernel: Arc<Kernel>,
}

impl KernelHandle {
    pub fn signal_event(&self, event: EventId) -> Result<(), KernelError> {
        self.kernel.lock().signal_event(event)?;
        self.kernel.notify();
        Ok(())
    }

    pub fn clear_event(&self, event: EventId) -> Result<(), KernelError> {
        self.kernel.lock().clear_event(event)
    }
}

/// Translation state a core keeps between slices
#[derive(Default)]
struct CoreState {
    tlb: Tlb,
    space: Option<Arc<AddressSpace>>,
}

pub struct Emulator {
    kernel: Arc<Kernel>,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        config.validate()?;
        info!(
            "starting emulator: {} cores, slice budget {}, {}",
            config.cores,
            config.slice_budget,
            if config.interpreter_only { "interpreter only" } else { "block translation" }
        );
        Ok(Emulator { kernel: Arc::new(Kernel::new(config)) })
    }

    pub fn config(&self) -> &EmulatorConfig {
        self.kernel.config()
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn kernel_handle(&self) -> KernelHandle {
        KernelHandle { kernel: self.kernel.clone() }
    }

    // =========================================================================
    // Setup
    // =========================================================================

    pub fn create_process(&self, name: &str) -> Result<ProcessId, EmulatorError> {
        Ok(self.kernel.lock().create_process(name)?)
    }

    fn space(&self, pid: ProcessId) -> Result<Arc<AddressSpace>, EmulatorError> {
        Ok(self.kernel.lock().process(pid)?.space.clone())
    }

    /// Map zeroed pages into `pid`
    pub fn map(
        &self,
        pid: ProcessId,
        addr: u32,
        size: u32,
        perm: MemoryPermission,
        state: MemoryState,
    ) -> Result<(), EmulatorError> {
        self.space(pid)?.map(addr, size, perm, MemoryAttribute::empty(), state)?;
        Ok(())
    }

    pub fn write_memory(&self, pid: ProcessId, addr: u32, data: &[u8]) -> Result<(), EmulatorError> {
        self.space(pid)?.write_bytes(addr, data)?;
        Ok(())
    }

    pub fn read_memory(&self, pid: ProcessId, addr: u32, len: usize) -> Result<Vec<u8>, EmulatorError> {
        let mut buf = vec![0u8; len];
        self.space(pid)?.read_bytes(addr, &mut buf)?;
        Ok(buf)
    }

    /// Create a process from a flat image and start its main thread at the
    /// image base
    pub fn load_flat_image(&self, name: &str, data: &[u8], opts: &LoadOptions) -> Result<LoadedImage, EmulatorError> {
        let bytes = image::decode(data)?;
        if opts.base % PAGE_SIZE != 0 {
            return Err(EmulatorError::Layout("base must be page aligned"));
        }
        if opts.stack_size == 0 || opts.stack_size % PAGE_SIZE != 0 || opts.stack_size >= STACK_TOP {
            return Err(EmulatorError::Layout("stack size must be a non-zero number of pages"));
        }
        let text_len = match opts.rw_offset {
            Some(offset) if offset % PAGE_SIZE != 0 => {
                return Err(EmulatorError::Layout("writable offset must be page aligned"))
            }
            Some(offset) if offset as usize > bytes.len() => {
                return Err(EmulatorError::Layout("writable offset past the end of the image"))
            }
            Some(offset) => offset as usize,
            None => bytes.len(),
        };
        let (text, data) = bytes.split_at(text_len);
        let data_size = page_align_up(data.len() as u64 + opts.bss_size as u64);
        let text_size = page_align_up(text.len() as u64);
        let end = opts.base as u64 + text_size + data_size;
        if end > (STACK_TOP - opts.stack_size) as u64 {
            return Err(EmulatorError::Layout("image overlaps the stack"));
        }

        let pid = self.create_process(name)?;
        let space = self.space(pid)?;
        if text_size > 0 {
            // Written through a writable mapping, then sealed
            space.map(opts.base, text_size as u32, MemoryPermission::READ_WRITE, MemoryAttribute::empty(), MemoryState::Code)?;
            space.write_bytes(opts.base, text)?;
            space.protect(opts.base, text_size as u32, MemoryPermission::READ_EXECUTE)?;
        }
        if data_size > 0 {
            let data_base = opts.base + text_size as u32;
            space.map(data_base, data_size as u32, MemoryPermission::READ_WRITE, MemoryAttribute::empty(), MemoryState::CodeData)?;
            space.write_bytes(data_base, data)?;
        }
        let stack_base = STACK_TOP - opts.stack_size;
        space.map(stack_base, opts.stack_size, MemoryPermission::READ_WRITE, MemoryAttribute::empty(), MemoryState::Stack)?;

        let main_thread = self.create_thread(pid, opts.base, opts.arg, STACK_TOP, opts.priority, opts.core)?;
        info!(
            "loaded \"{name}\": {:#x} bytes text, {:#x} bytes data at {:#010x}",
            text.len(),
            data_size,
            opts.base
        );
        Ok(LoadedImage { process: pid, main_thread, entry: opts.base, stack_top: STACK_TOP })
    }

    /// Create and start a thread
    pub fn create_thread(
        &self,
        pid: ProcessId,
        entry: u32,
        arg: u32,
        stack_top: u32,
        priority: u8,
        core: i32,
    ) -> Result<ThreadId, EmulatorError> {
        let tid = {
            let mut st = self.kernel.lock();
            let (tid, _) = st.create_thread(pid, entry, arg, stack_top, priority, core)?;
            st.start_thread(tid)?;
            tid
        };
        self.kernel.notify();
        Ok(tid)
    }

    /// Serve the named port `name` from the host
    pub fn register_service(&self, name: &str, handler: Arc<dyn ServiceHandler>) -> Result<PortId, EmulatorError> {
        let mut st = self.kernel.lock();
        let max_sessions = st.config().default_max_sessions;
        debug!("registering service \"{name}\" ({})", handler.name());
        Ok(st.register_host_port(name, handler, max_sessions)?)
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Run one slice on `core` on the calling thread
    pub fn step_core(&self, core: usize) -> CoreStep {
        let mut state = CoreState::default();
        self.pump();
        let step = self.run_slice(core, &mut state);
        self.pump();
        step
    }

    /// Step every core round-robin until nothing is runnable, advancing a
    /// manual clock to the next deadline when all cores are idle. Returns
    /// the number of slices run.
    pub fn run_until_idle(&self, max_slices: usize) -> usize {
        let cores = self.config().cores;
        let mut slices = 0;
        while slices < max_slices {
            let mut ran = false;
            for core in 0..cores {
                if let CoreStep::Ran { .. } = self.step_core(core) {
                    ran = true;
                    slices += 1;
                }
            }
            if ran {
                continue;
            }
            let deadline = self.kernel.lock().next_deadline();
            match deadline {
                Some(deadline) if self.kernel.time().is_manual() => {
                    let now = self.kernel.time().now();
                    trace!("all cores idle, advancing clock to {deadline}");
                    self.kernel.time().advance(deadline.saturating_sub(now));
                }
                _ => break,
            }
        }
        slices
    }

    /// Run every core and the service pump on their own threads until
    /// `stop` is raised or no process is left running
    pub fn run_threaded(&self, stop: &AtomicBool) {
        let cores = self.config().cores;
        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            for core in 0..cores {
                let done = &done;
                scope.spawn(move || {
                    let mut state = CoreState::default();
                    while !stop.load(Ordering::Acquire) && !done.load(Ordering::Acquire) {
                        if self.run_slice(core, &mut state) == CoreStep::Idle {
                            if self.is_finished() {
                                done.store(true, Ordering::Release);
                                self.kernel.notify();
                                break;
                            }
                            self.kernel.wait_for_work(IDLE_POLL);
                        }
                    }
                    debug!("core {core} stopped");
                });
            }
            while !stop.load(Ordering::Acquire) && !done.load(Ordering::Acquire) {
                if self.pump() == 0 {
                    self.kernel.wait_for_work(IDLE_POLL);
                }
            }
        });
    }

    /// Move a manual clock forward; expired waits resolve on the next step
    pub fn advance_time(&self, ns: u64) {
        self.kernel.time().advance(ns);
        self.kernel.notify();
    }

    fn run_slice(&self, core: usize, state: &mut CoreState) -> CoreStep {
        let config = self.kernel.config();
        let Some(preempt) = self.kernel.preempt_flag(core) else { return CoreStep::Idle };
        let Some(mut slice) = self.kernel.begin_slice(core) else { return CoreStep::Idle };

        // Map generations are per address space; entries from another one
        // could collide
        if !state.space.as_ref().is_some_and(|s| Arc::ptr_eq(s, &slice.space)) {
            state.tlb.flush();
            state.space = Some(slice.space.clone());
        }
        let exit = Dispatcher::new(&slice.cache, &slice.space, &mut state.tlb)
            .interpreter_only(config.interpreter_only)
            .with_ticks(slice.ticks)
            .run(&mut slice.ctx, config.slice_budget, preempt);
        let thread = slice.thread;
        trace!("core {core} ran thread {thread}: {exit:?}");
        self.kernel.end_slice(slice, exit.clone());
        CoreStep::Ran { thread, exit }
    }

    /// Serve queued host requests; returns how many were answered
    fn pump(&self) -> usize {
        let served = pump_services(&mut self.kernel.lock());
        if served > 0 {
            self.kernel.notify();
        }
        served
    }

    /// No process is running any more
    pub fn is_finished(&self) -> bool {
        let st = self.kernel.lock();
        let done = !st.processes.iter().any(|(_, p)| p.is_running());
        done
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn terminate_process(&self, pid: ProcessId) {
        self.kernel.lock().terminate_process(pid, ExitReason::Killed);
        self.kernel.notify();
    }

    pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.kernel.lock().processes.get(pid).map(|p| p.state)
    }

    pub fn exit_reason(&self, pid: ProcessId) -> Option<ExitReason> {
        self.kernel.lock().processes.get(pid).and_then(|p| p.exit_reason.clone())
    }

    /// Text the process wrote with OutputDebugString
    pub fn debug_output(&self, pid: ProcessId) -> String {
        self.kernel.lock().processes.get(pid).map(|p| p.debug_output.clone()).unwrap_or_default()
    }

    pub fn crash_report(&self, pid: ProcessId) -> Option<ProcessSnapshot> {
        self.kernel.lock().processes.get(pid).and_then(|p| p.crash_report.clone())
    }

    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.kernel.lock().threads.get(tid).map(|t| t.state)
    }

    /// Saved context of a thread that is not on a core
    pub fn thread_context(&self, tid: ThreadId) -> Option<CpuContext> {
        self.kernel.lock().threads.get(tid).and_then(|t| t.ctx.clone())
    }
}

fn page_align_up(len: u64) -> u64 {
    (len + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm::{self, reg::*};
    use crate::cpu::Trap;
    use crate::kernel::svc::nr;

    fn emulator() -> Emulator {
        Emulator::new(EmulatorConfig::deterministic(1)).unwrap()
    }

    fn program(words: &[u32]) -> Vec<u8> {
        asm::assemble(words)
    }

    fn svc(number: u32) -> [u32; 2] {
        [asm::addi(A7, ZERO, number as i32), asm::ecall()]
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EmulatorConfig { cores: 0, ..EmulatorConfig::default() };
        assert!(matches!(Emulator::new(config), Err(EmulatorError::Config(_))));
    }

    #[test]
    fn test_exit_process() {
        let emu = emulator();
        let mut words = vec![asm::addi(A0, ZERO, 7)];
        words.extend(svc(nr::EXIT_PROCESS));
        let loaded = emu.load_flat_image("exit", &program(&words), &LoadOptions::default()).unwrap();
        emu.run_until_idle(100);
        assert_eq!(emu.process_state(loaded.process), Some(ProcessState::Exited));
        assert_eq!(emu.exit_reason(loaded.process), Some(ExitReason::Exited));
        assert!(emu.is_finished());
    }

    #[test]
    fn test_fault_crashes_only_that_process() {
        let emu = emulator();
        // Load from page 0, which is never mapped
        let bad = emu.load_flat_image("bad", &program(&[asm::lw(A0, ZERO, 0)]), &LoadOptions::default()).unwrap();
        let mut spin = vec![asm::addi(A1, A1, 1)];
        spin.push(asm::jal(ZERO, -4));
        let good = emu.load_flat_image("good", &program(&spin), &LoadOptions::default()).unwrap();

        emu.run_until_idle(20);
        assert_eq!(emu.process_state(bad.process), Some(ProcessState::Crashed));
        assert_eq!(emu.process_state(good.process), Some(ProcessState::Running));

        let report = emu.crash_report(bad.process).unwrap();
        assert!(matches!(report.exit, ExitReason::Fault { trap: Trap::LoadPageFault(0), .. }));
        let restored = ProcessSnapshot::from_bytes(&report.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.name, "bad");
    }

    #[test]
    fn test_text_is_sealed_after_load() {
        let emu = emulator();
        let loaded = emu.load_flat_image("seal", &program(&[asm::ebreak()]), &LoadOptions::default()).unwrap();
        assert!(matches!(
            emu.write_memory(loaded.process, DEFAULT_LOAD_BASE, &[0]),
            Err(EmulatorError::Memory(_))
        ));
        assert_eq!(emu.read_memory(loaded.process, DEFAULT_LOAD_BASE, 4).unwrap(), program(&[asm::ebreak()]));
    }

    #[test]
    fn test_writable_data_and_bss() {
        let emu = emulator();
        let mut image = program(&[asm::ebreak()]);
        image.resize(PAGE_SIZE as usize, 0);
        image.extend_from_slice(b"data");
        let opts = LoadOptions { rw_offset: Some(PAGE_SIZE), bss_size: 0x2000, ..LoadOptions::default() };
        let loaded = emu.load_flat_image("rw", &image, &opts).unwrap();
        let data = DEFAULT_LOAD_BASE + PAGE_SIZE;
        assert_eq!(emu.read_memory(loaded.process, data, 4).unwrap(), b"data");
        emu.write_memory(loaded.process, data + 0x2000, &[1, 2, 3]).unwrap();
    }

    #[test]
    fn test_layout_errors() {
        let emu = emulator();
        let code = program(&[asm::ebreak()]);
        let opts = LoadOptions { rw_offset: Some(0x10), ..LoadOptions::default() };
        assert!(matches!(emu.load_flat_image("x", &code, &opts), Err(EmulatorError::Layout(_))));
        let opts = LoadOptions { base: 0x1234, ..LoadOptions::default() };
        assert!(matches!(emu.load_flat_image("x", &code, &opts), Err(EmulatorError::Layout(_))));
        assert!(matches!(emu.load_flat_image("x", &[], &LoadOptions::default()), Err(EmulatorError::Image(_))));
    }

    #[test]
    fn test_sleep_completes_with_manual_clock() {
        let emu = emulator();
        let mut words = Vec::new();
        words.extend(asm::li(A0, 1_000_000));
        words.push(asm::addi(A1, ZERO, 0));
        words.extend(svc(nr::SLEEP_THREAD));
        words.extend(svc(nr::EXIT_PROCESS));
        let loaded = emu.load_flat_image("sleep", &program(&words), &LoadOptions::default()).unwrap();
        emu.run_until_idle(100);
        assert_eq!(emu.process_state(loaded.process), Some(ProcessState::Exited));
        assert!(emu.kernel().time().now() >= 1_000_000);
    }

    #[test]
    fn test_kernel_handle_signals_event() {
        let emu = emulator();
        let pid = emu.create_process("events").unwrap();
        let (event, _, _) = emu.kernel().lock().create_event(pid).unwrap();
        let handle = emu.kernel_handle();
        handle.signal_event(event).unwrap();
        assert!(emu.kernel().lock().events.get(event).unwrap().signaled);
        handle.clear_event(event).unwrap();
        assert!(!emu.kernel().lock().events.get(event).unwrap().signaled);
    }

    #[test]
    fn test_threaded_run_stops_when_processes_exit() {
        let emu = Emulator::new(EmulatorConfig::deterministic(2)).unwrap();
        let words: Vec<u32> = svc(nr::EXIT_PROCESS).to_vec();
        emu.load_flat_image("a", &program(&words), &LoadOptions::default()).unwrap();
        emu.load_flat_image("b", &program(&words), &LoadOptions { core: 1, ..LoadOptions::default() }).unwrap();
        let stop = AtomicBool::new(false);
        emu.run_threaded(&stop);
        assert!(emu.is_finished());
    }
}
