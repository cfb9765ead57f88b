//! Horizon-style kernel
//!
//! All kernel objects live in [`KernelState`] behind one lock. Guest code
//! runs outside that lock: a core takes the next thread's context out of
//! the arena in [`Kernel::begin_slice`], runs it, and hands it back in
//! [`Kernel::end_slice`], where syscalls and faults are handled. A thread
//! that blocks is marked waiting in the same critical section that stores
//! its context, so whoever wakes it always finds the context in place.

pub mod arbiter;
pub mod handle_table;
pub mod object;
pub mod process;
pub mod result;
pub mod scheduler;
pub mod svc;
pub mod sync;
pub mod thread;
pub mod time;

pub use handle_table::{HandleTable, KObjectRef, CURRENT_PROCESS, CURRENT_THREAD};
pub use object::{Arena, EventId, KEvent, PortId, ProcessId, SessionId, ThreadId};
pub use process::{KProcess, ProcessState};
pub use result::{KernelError, ResultCode};
pub use scheduler::Scheduler;
pub use thread::{KThread, SyncObject, ThreadState, WaitReason};
pub use time::TimeSource;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{error, warn};

use crate::config::{EmulatorConfig, TimeSourceKind};
use crate::cpu::{CodeCache, CpuContext, RunExit, Trap};
use crate::ipc::{KPort, KSession};
use crate::lock;
use crate::memory::AddressSpace;
use crate::snapshot::ExitReason;

/// Everything the kernel lock protects
pub struct KernelState {
    pub(crate) config: EmulatorConfig,
    pub threads: Arena<ThreadId, KThread>,
    pub processes: Arena<ProcessId, KProcess>,
    pub events: Arena<EventId, KEvent>,
    pub sessions: Arena<SessionId, KSession>,
    pub ports: Arena<PortId, KPort>,
    pub named_ports: HashMap<String, PortId>,
    pub scheduler: Scheduler,
    /// Kernel time when the lock was taken
    pub now: u64,
    preempt: Arc<[AtomicBool]>,
    next_wait_id: u64,
    next_seq: u64,
    next_pid: u64,
    next_guest_tid: u64,
    /// Requests are queued on host-served sessions
    pub(crate) host_work: bool,
}

impl KernelState {
    fn new(config: EmulatorConfig, preempt: Arc<[AtomicBool]>) -> Self {
        KernelState {
            scheduler: Scheduler::new(config.cores),
            config,
            threads: Arena::new(),
            processes: Arena::new(),
            events: Arena::new(),
            sessions: Arena::new(),
            ports: Arena::new(),
            named_ports: HashMap::new(),
            now: 0,
            preempt,
            next_wait_id: 1,
            next_seq: 0,
            next_pid: 0x51,
            next_guest_tid: 1,
            host_work: false,
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn thread(&self, tid: ThreadId) -> Result<&KThread, KernelError> {
        self.threads.get(tid).ok_or(KernelError::InvalidHandle)
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut KThread, KernelError> {
        self.threads.get_mut(tid).ok_or(KernelError::InvalidHandle)
    }

    pub fn process(&self, pid: ProcessId) -> Result<&KProcess, KernelError> {
        self.processes.get(pid).ok_or(KernelError::InvalidHandle)
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Result<&mut KProcess, KernelError> {
        self.processes.get_mut(pid).ok_or(KernelError::InvalidHandle)
    }

    /// Process owning `tid`
    pub fn process_of(&self, tid: ThreadId) -> Result<ProcessId, KernelError> {
        self.thread(tid).map(|t| t.process)
    }

    /// Address space of the process owning `tid`
    pub fn space_of(&self, tid: ThreadId) -> Result<Arc<AddressSpace>, KernelError> {
        let pid = self.process_of(tid)?;
        Ok(self.process(pid)?.space.clone())
    }

    pub(crate) fn next_wait_id(&mut self) -> u64 {
        let id = self.next_wait_id;
        self.next_wait_id += 1;
        id
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn alloc_pid(&mut self) -> u64 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    pub(crate) fn alloc_guest_tid(&mut self) -> u64 {
        let tid = self.next_guest_tid;
        self.next_guest_tid += 1;
        tid
    }

    pub(crate) fn raise_preempt(&self, core: usize) {
        if let Some(flag) = self.preempt.get(core) {
            flag.store(true, Ordering::Release);
        }
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Resolve a handle of the calling thread's process, including pseudo handles
    pub fn resolve(&self, cur: ThreadId, handle: u32) -> Result<KObjectRef, KernelError> {
        let pid = self.process_of(cur)?;
        match handle {
            CURRENT_THREAD => Ok(KObjectRef::Thread(cur)),
            CURRENT_PROCESS => Ok(KObjectRef::Process(pid)),
            _ => self.process(pid)?.handles.get(handle).ok_or(KernelError::InvalidHandle),
        }
    }

    pub fn resolve_thread(&self, cur: ThreadId, handle: u32) -> Result<ThreadId, KernelError> {
        match self.resolve(cur, handle)? {
            KObjectRef::Thread(tid) if self.threads.contains(tid) => Ok(tid),
            _ => Err(KernelError::InvalidHandle),
        }
    }

    /// Open a handle to `object` in `pid`
    pub fn add_handle(&mut self, pid: ProcessId, object: KObjectRef) -> Result<u32, KernelError> {
        let handle = self.process_mut(pid)?.handles.add(object)?;
        self.retain(object);
        Ok(handle)
    }

    pub fn close_handle(&mut self, pid: ProcessId, handle: u32) -> Result<(), KernelError> {
        let object = self.process_mut(pid)?.handles.remove(handle).ok_or(KernelError::InvalidHandle)?;
        self.release(object);
        Ok(())
    }

    pub(crate) fn retain(&mut self, object: KObjectRef) {
        match object {
            KObjectRef::Thread(tid) => {
                if let Some(t) = self.threads.get_mut(tid) {
                    t.refs += 1;
                }
            }
            KObjectRef::WritableEvent(id) | KObjectRef::ReadableEvent(id) => {
                if let Some(e) = self.events.get_mut(id) {
                    e.refs += 1;
                }
            }
            KObjectRef::ClientSession(id) => {
                if let Some(s) = self.sessions.get_mut(id) {
                    s.client_refs += 1;
                }
            }
            KObjectRef::ServerSession(id) => {
                if let Some(s) = self.sessions.get_mut(id) {
                    s.server_refs += 1;
                }
            }
            KObjectRef::ServerPort(id) => {
                if let Some(p) = self.ports.get_mut(id) {
                    p.server_refs += 1;
                }
            }
            KObjectRef::ClientPort(id) => {
                if let Some(p) = self.ports.get_mut(id) {
                    p.client_refs += 1;
                }
            }
            KObjectRef::Process(_) => {}
        }
    }

    /// Drop one reference; the last one closes or frees the object
    pub(crate) fn release(&mut self, object: KObjectRef) {
        match object {
            KObjectRef::Thread(tid) => {
                let Some(t) = self.threads.get_mut(tid) else { return };
                t.refs = t.refs.saturating_sub(1);
                if t.refs == 0 && t.is_terminated() {
                    let pid = t.process;
                    self.threads.remove(tid);
                    if let Some(p) = self.processes.get_mut(pid) {
                        p.threads.retain(|&t| t != tid);
                    }
                }
            }
            KObjectRef::WritableEvent(id) | KObjectRef::ReadableEvent(id) => {
                let Some(e) = self.events.get_mut(id) else { return };
                e.refs = e.refs.saturating_sub(1);
                if e.refs == 0 {
                    self.events.remove(id);
                }
            }
            KObjectRef::ClientSession(id) => {
                let Some(s) = self.sessions.get_mut(id) else { return };
                s.client_refs = s.client_refs.saturating_sub(1);
                if s.client_refs == 0 {
                    self.close_client(id);
                }
            }
            KObjectRef::ServerSession(id) => {
                let Some(s) = self.sessions.get_mut(id) else { return };
                s.server_refs = s.server_refs.saturating_sub(1);
                if s.server_refs == 0 {
                    self.close_server(id);
                }
            }
            KObjectRef::ServerPort(id) => {
                let Some(p) = self.ports.get_mut(id) else { return };
                p.server_refs = p.server_refs.saturating_sub(1);
                if p.server_refs == 0 {
                    self.close_port(id);
                }
            }
            KObjectRef::ClientPort(id) => {
                let Some(p) = self.ports.get_mut(id) else { return };
                p.client_refs = p.client_refs.saturating_sub(1);
                if p.client_refs == 0 && !p.server_open {
                    self.ports.remove(id);
                }
            }
            KObjectRef::Process(_) => {}
        }
    }

    // =========================================================================
    // Slices
    // =========================================================================

    /// Hand the context of a thread that stopped running back to the kernel
    fn finish_slice(&mut self, tid: ThreadId, core: usize, mut ctx: CpuContext, exit: RunExit) {
        if self.scheduler.current(core) == Some(tid) {
            self.scheduler.set_current(core, None);
        }
        let Some(thread) = self.threads.get_mut(tid) else { return };
        let pid = thread.process;
        if thread.terminate_requested {
            thread.ctx = Some(ctx);
            self.finalize_thread(tid);
            return;
        }

        match exit {
            RunExit::Budget => {
                thread.ctx = Some(ctx);
                self.make_ready(tid, false);
            }
            RunExit::Preempted => {
                thread.ctx = Some(ctx);
                self.make_ready(tid, true);
            }
            RunExit::Trap(Trap::EnvironmentCall) => {
                ctx.pending_exception = None;
                ctx.pc = ctx.pc.wrapping_add(4);
                ctx.instret += 1;
                thread.ctx = Some(ctx);
                svc::dispatch(self, tid);
                if let Some(thread) = self.threads.get(tid) {
                    if thread.state == ThreadState::Running(core) {
                        self.make_ready(tid, true);
                    }
                }
            }
            RunExit::Trap(trap) => {
                let (guest_id, pc) = (thread.guest_id, ctx.pc);
                thread.ctx = Some(ctx);
                warn!("thread {guest_id} faulted: {trap} at {pc:#010x}");
                self.crash_process(pid, ExitReason::Fault { thread: guest_id, trap, pc });
            }
            RunExit::Fatal(err) => {
                let guest_id = thread.guest_id;
                thread.ctx = Some(ctx);
                error!("thread {guest_id} hit a code generation error: {err}");
                self.crash_process(pid, ExitReason::Fatal { thread: guest_id, message: err.to_string() });
            }
        }
    }

    /// Earliest pending deadline, for idle cores to sleep until
    pub fn next_deadline(&self) -> Option<u64> {
        self.threads
            .iter()
            .filter_map(|(_, t)| t.wait.as_ref().and_then(|w| w.deadline))
            .min()
    }
}

/// One thread scheduled onto a core
pub struct Slice {
    pub thread: ThreadId,
    pub core: usize,
    pub ctx: CpuContext,
    pub space: Arc<AddressSpace>,
    pub cache: Arc<CodeCache>,
    /// Guest tick counter at the start of the slice
    pub ticks: u64,
}

pub struct Kernel {
    state: Mutex<KernelState>,
    time: TimeSource,
    preempt: Arc<[AtomicBool]>,
    wakeup: Condvar,
    config: EmulatorConfig,
}

impl Kernel {
    pub fn new(config: EmulatorConfig) -> Self {
        let preempt: Arc<[AtomicBool]> = (0..config.cores).map(|_| AtomicBool::new(false)).collect();
        let time = match config.time_source {
            TimeSourceKind::Host => TimeSource::host(),
            TimeSourceKind::Manual => TimeSource::manual(),
        };
        Kernel {
            state: Mutex::new(KernelState::new(config.clone(), preempt.clone())),
            time,
            preempt,
            wakeup: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn time(&self) -> &TimeSource {
        &self.time
    }

    /// Take the kernel lock with `now` refreshed
    pub fn lock(&self) -> MutexGuard<'_, KernelState> {
        let mut state = lock::lock(&self.state);
        state.now = self.time.now();
        state
    }

    pub fn preempt_flag(&self, core: usize) -> Option<&AtomicBool> {
        self.preempt.get(core)
    }

    /// Wake idle cores and the service pump
    pub fn notify(&self) {
        self.wakeup.notify_all();
    }

    /// Pick the next thread for `core` and move its context out
    pub fn begin_slice(&self, core: usize) -> Option<Slice> {
        let mut state = self.lock();
        state.expire_timeouts();
        let tid = state.pick_next(core)?;
        let thread = state.threads.get_mut(tid)?;
        let ctx = thread.ctx.take()?;
        thread.state = ThreadState::Running(core);
        thread.active_core = core;
        let pid = thread.process;
        state.scheduler.set_current(core, Some(tid));
        if let Some(flag) = self.preempt.get(core) {
            flag.store(false, Ordering::Release);
        }
        let process = state.processes.get(pid)?;
        Some(Slice {
            thread: tid,
            core,
            ctx,
            space: process.space.clone(),
            cache: process.cache.clone(),
            ticks: self.time.ticks(),
        })
    }

    pub fn end_slice(&self, slice: Slice, exit: RunExit) {
        {
            let mut state = self.lock();
            state.finish_slice(slice.thread, slice.core, slice.ctx, exit);
        }
        self.notify();
    }

    /// Block an idle core until something changes or `max` passes
    pub fn wait_for_work(&self, max: Duration) {
        let state = self.lock();
        let timeout = match state.next_deadline() {
            Some(deadline) if !self.time.is_manual() => {
                Duration::from_nanos(deadline.saturating_sub(state.now)).min(max)
            }
            _ => max,
        };
        if !timeout.is_zero() {
            drop(lock::wait_timeout(&self.wakeup, state, timeout));
        }
    }
}
