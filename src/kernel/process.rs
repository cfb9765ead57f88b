//! Kernel processes

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::handle_table::HandleTable;
use super::object::{ProcessId, ThreadId};
use super::result::KernelError;
use super::thread::TLS_SLOT_SIZE;
use super::KernelState;
use crate::cpu::{codegen, CodeCache};
use crate::memory::{
    AddressSpace, CodeWriteObserver, MemoryAttribute, MemoryPermission, MemoryState, TLS_AREA_SIZE, TLS_BASE,
};
use crate::snapshot::{ExitReason, ProcessSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Exited,
    Crashed,
}

pub struct KProcess {
    /// Guest-visible process id
    pub pid: u64,
    pub name: String,
    pub space: Arc<AddressSpace>,
    pub cache: Arc<CodeCache>,
    pub handles: HandleTable,
    pub threads: Vec<ThreadId>,
    pub heap_size: u32,
    pub max_threads: usize,
    pub ideal_core: usize,
    pub core_mask: u64,
    pub state: ProcessState,
    pub exit_reason: Option<ExitReason>,
    /// Snapshot taken when the process crashed
    pub crash_report: Option<ProcessSnapshot>,
    /// Text passed to OutputDebugString
    pub debug_output: String,
    /// Threads in WaitProcessWideKeyAtomic
    pub condvar_waiters: Vec<ThreadId>,
    /// Threads in WaitForAddress
    pub arbiter_waiters: Vec<ThreadId>,
    tls_slots: Vec<bool>,
}

impl KProcess {
    pub fn new(
        pid: u64,
        name: &str,
        cache: Arc<CodeCache>,
        handle_capacity: usize,
        max_threads: usize,
        ideal_core: usize,
        core_mask: u64,
    ) -> Result<Self, KernelError> {
        let space = Arc::new(AddressSpace::new());
        let observer: Arc<dyn CodeWriteObserver> = cache.clone();
        space.set_code_observer(Arc::downgrade(&observer) as Weak<dyn CodeWriteObserver>);
        space.map(
            TLS_BASE,
            TLS_AREA_SIZE,
            MemoryPermission::READ_WRITE,
            MemoryAttribute::empty(),
            MemoryState::ThreadLocal,
        )?;

        Ok(KProcess {
            pid,
            name: name.to_string(),
            space,
            cache,
            handles: HandleTable::new(handle_capacity),
            threads: Vec::new(),
            heap_size: 0,
            max_threads,
            ideal_core,
            core_mask,
            state: ProcessState::Running,
            exit_reason: None,
            crash_report: None,
            debug_output: String::new(),
            condvar_waiters: Vec::new(),
            arbiter_waiters: Vec::new(),
            tls_slots: vec![false; (TLS_AREA_SIZE / TLS_SLOT_SIZE) as usize],
        })
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    /// Reserve a zeroed thread-local region
    pub fn alloc_tls(&mut self) -> Result<u32, KernelError> {
        let slot = self
            .tls_slots
            .iter()
            .position(|used| !used)
            .ok_or(KernelError::ResourceLimitExceeded)?;
        self.tls_slots[slot] = true;
        let addr = TLS_BASE + slot as u32 * TLS_SLOT_SIZE;
        self.space.write_bytes(addr, &[0u8; TLS_SLOT_SIZE as usize])?;
        Ok(addr)
    }

    pub fn free_tls(&mut self, addr: u32) {
        if let Some(slot) = addr.checked_sub(TLS_BASE).map(|off| (off / TLS_SLOT_SIZE) as usize) {
            if let Some(used) = self.tls_slots.get_mut(slot) {
                *used = false;
            }
        }
    }
}

impl KernelState {
    pub fn create_process(&mut self, name: &str) -> Result<ProcessId, KernelError> {
        let cache = Arc::new(CodeCache::new(codegen::default_backend(), self.config.max_block_insts));
        let pid = self.alloc_pid();
        let process = KProcess::new(
            pid,
            name,
            cache,
            self.config.handle_capacity,
            self.config.max_threads,
            0,
            self.config.core_mask(),
        )?;
        info!("created process {pid} \"{name}\" ({} backend)", process.cache.backend_name());
        Ok(self.processes.insert(process))
    }

    /// End every thread of `pid`; its handles are closed once the last
    /// thread is gone
    pub fn terminate_process(&mut self, pid: ProcessId, reason: ExitReason) {
        let Some(process) = self.processes.get_mut(pid) else { return };
        if !process.is_running() {
            return;
        }
        process.state = match reason {
            ExitReason::Exited | ExitReason::Killed => ProcessState::Exited,
            _ => ProcessState::Crashed,
        };
        process.exit_reason = Some(reason);
        let threads = process.threads.clone();
        for tid in threads {
            self.terminate_thread(tid);
        }
        self.reap_process(pid);
    }

    /// Terminate `pid` after a fault, keeping a snapshot for inspection
    pub fn crash_process(&mut self, pid: ProcessId, reason: ExitReason) {
        if !self.processes.get(pid).is_some_and(KProcess::is_running) {
            return;
        }
        let report = ProcessSnapshot::capture(self, pid, reason.clone());
        if let Some(process) = self.processes.get_mut(pid) {
            info!("process {} \"{}\" terminated: {reason}", process.pid, process.name);
            process.crash_report = report;
        }
        self.terminate_process(pid, reason);
    }

    /// Close the handles of a process whose threads have all finished
    pub(crate) fn reap_process(&mut self, pid: ProcessId) {
        let Some(process) = self.processes.get(pid) else { return };
        let alive = process
            .threads
            .iter()
            .any(|&t| self.threads.get(t).is_some_and(|t| !t.is_terminated()));
        if alive {
            return;
        }
        let Some(process) = self.processes.get_mut(pid) else { return };
        if process.is_running() {
            process.state = ProcessState::Exited;
            process.exit_reason = Some(ExitReason::Exited);
        }
        process.condvar_waiters.clear();
        process.arbiter_waiters.clear();
        let objects = process.handles.drain();
        if !objects.is_empty() {
            debug!("process {} exited, closing {} handles", process.pid, objects.len());
        }
        for object in objects {
            self.release(object);
        }
    }
}
