//! Kernel threads

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::handle_table::KObjectRef;
use super::object::{EventId, PortId, ProcessId, SessionId, ThreadId};
use super::result::KernelError;
use super::KernelState;
use crate::cpu::CpuContext;

pub const PRIORITY_COUNT: usize = 64;
/// Numerically largest (least urgent) priority
pub const LOWEST_PRIORITY: u8 = 63;

/// Size of a thread's local region; the IPC buffer sits at its start
pub const TLS_SLOT_SIZE: u32 = 0x200;
/// Where the thread's own handle is stored inside its local region
pub const TLS_THREAD_HANDLE_OFFSET: u32 = 0x1F8;

/// Set in a mutex word when other threads wait for it
pub const MUTEX_WAITERS_BIT: u32 = 0x4000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitReason {
    /// WaitSynchronization / ReplyAndReceive
    Synchronization,
    Sleep,
    /// Blocked on a guest mutex owned by `lock_owner`
    Mutex { addr: u32 },
    ConditionVariable { key: u32 },
    Address { addr: u32 },
    /// Client waiting for a reply on a session
    IpcReply { session: SessionId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Created but not started
    Created,
    Ready,
    Running(usize),
    Waiting(WaitReason),
    Terminated,
}

/// Object a thread can wait on with WaitSynchronization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncObject {
    Event(EventId),
    Thread(ThreadId),
    ServerSession(SessionId),
    ServerPort(PortId),
}

/// Bookkeeping for one blocking wait
#[derive(Clone, Debug)]
pub struct WaitInfo {
    /// Unique per wait; a resolution naming an older id is ignored
    pub id: u64,
    /// Absolute expiry in kernel nanoseconds
    pub deadline: Option<u64>,
    pub objects: Vec<SyncObject>,
    /// CancelSynchronization may end it
    pub cancellable: bool,
    /// Receive a request when a server session in `objects` wins
    pub receive: bool,
}

pub struct KThread {
    pub id: ThreadId,
    /// Guest-visible thread id
    pub guest_id: u64,
    pub process: ProcessId,
    /// Handle naming this thread in its own process
    pub handle: u32,
    /// Priority set by the guest
    pub base_priority: u8,
    /// Effective priority after inheritance
    pub priority: u8,
    pub ideal_core: usize,
    pub core_mask: u64,
    pub active_core: usize,
    pub state: ThreadState,
    /// Architectural state; `None` while a core is running the thread
    pub ctx: Option<CpuContext>,
    pub tls: u32,
    pub wait: Option<WaitInfo>,
    /// Arrival order in priority-ordered wait queues
    pub wait_seq: u64,
    /// Threads blocked on mutexes this thread owns, by priority then arrival
    pub waiters: Vec<ThreadId>,
    pub lock_owner: Option<ThreadId>,
    /// Mutex word the thread waits to acquire
    pub mutex_addr: u32,
    /// Tag the thread writes into a mutex word it acquires
    pub key_value: u32,
    pub sync_cancelled: bool,
    pub terminate_requested: bool,
    /// Let every other ready thread run before this one is picked again
    pub yield_to_any: bool,
    /// Position in a ready queue: (core, priority)
    pub queued: Option<(usize, u8)>,
    /// Open handles naming this thread
    pub refs: u32,
}

impl KThread {
    pub fn new(id: ThreadId, process: ProcessId, guest_id: u64, ctx: CpuContext, priority: u8, core: usize) -> Self {
        KThread {
            id,
            guest_id,
            process,
            handle: 0,
            base_priority: priority,
            priority,
            ideal_core: core,
            core_mask: 1 << core,
            active_core: core,
            state: ThreadState::Created,
            tls: ctx.tls,
            ctx: Some(ctx),
            wait: None,
            wait_seq: 0,
            waiters: Vec::new(),
            lock_owner: None,
            mutex_addr: 0,
            key_value: 0,
            sync_cancelled: false,
            terminate_requested: false,
            yield_to_any: false,
            queued: None,
            refs: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ThreadState::Terminated
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, ThreadState::Waiting(_))
    }

    pub fn running_on(&self) -> Option<usize> {
        match self.state {
            ThreadState::Running(core) => Some(core),
            _ => None,
        }
    }

    pub fn allows_core(&self, core: usize) -> bool {
        core < 64 && self.core_mask & (1 << core) != 0
    }

    /// Core a newly ready thread is queued on
    pub fn home_core(&self) -> usize {
        if self.allows_core(self.active_core) {
            self.active_core
        } else if self.allows_core(self.ideal_core) {
            self.ideal_core
        } else {
            self.core_mask.trailing_zeros() as usize
        }
    }
}

impl KernelState {
    /// Create a thread in `pid` and open a handle to it there. `core` -2
    /// selects the process's ideal core.
    pub fn create_thread(
        &mut self,
        pid: ProcessId,
        entry: u32,
        arg: u32,
        stack_top: u32,
        priority: u8,
        core: i32,
    ) -> Result<(ThreadId, u32), KernelError> {
        if priority > LOWEST_PRIORITY {
            return Err(KernelError::InvalidPriority);
        }
        let process = self.process(pid)?;
        if !process.is_running() {
            return Err(KernelError::InvalidState);
        }
        let core = match core {
            -2 => process.ideal_core,
            c if c >= 0 && (c as usize) < self.config.cores => c as usize,
            _ => return Err(KernelError::InvalidCoreId),
        };
        if process.core_mask & (1 << core) == 0 {
            return Err(KernelError::InvalidCoreId);
        }
        let live = process
            .threads
            .iter()
            .filter(|&&t| self.threads.get(t).is_some_and(|t| !t.is_terminated()))
            .count();
        if live >= process.max_threads {
            return Err(KernelError::ResourceLimitExceeded);
        }

        let tls = self.process_mut(pid)?.alloc_tls()?;
        let mut ctx = CpuContext::new(entry, stack_top, tls);
        ctx.set_ret(0, arg);
        let guest_id = self.alloc_guest_tid();
        let tid = self.threads.insert_with(|id| KThread::new(id, pid, guest_id, ctx, priority, core));
        self.process_mut(pid)?.threads.push(tid);

        let handle = match self.add_handle(pid, KObjectRef::Thread(tid)) {
            Ok(handle) => handle,
            Err(err) => {
                self.threads.remove(tid);
                let process = self.process_mut(pid)?;
                process.threads.retain(|&t| t != tid);
                process.free_tls(tls);
                return Err(err);
            }
        };
        self.thread_mut(tid)?.handle = handle;
        self.process(pid)?.space.write::<u32>(tls + TLS_THREAD_HANDLE_OFFSET, handle)?;
        debug!("created thread {guest_id} entry {entry:#010x} priority {priority} core {core}");
        Ok((tid, handle))
    }

    pub fn start_thread(&mut self, tid: ThreadId) -> Result<(), KernelError> {
        if self.thread(tid)?.state != ThreadState::Created {
            return Err(KernelError::InvalidState);
        }
        self.make_ready(tid, false);
        Ok(())
    }

    pub(crate) fn set_base_priority(&mut self, tid: ThreadId, priority: u8) {
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.base_priority = priority;
            self.update_priority(tid);
        }
    }

    /// Stop a thread. One that is on a core right now finishes when its
    /// slice ends.
    pub fn terminate_thread(&mut self, tid: ThreadId) {
        let Some(thread) = self.threads.get_mut(tid) else { return };
        if thread.is_terminated() {
            return;
        }
        match (thread.ctx.is_some(), thread.running_on()) {
            (false, Some(core)) => {
                thread.terminate_requested = true;
                self.raise_preempt(core);
            }
            _ => self.finalize_thread(tid),
        }
    }

    pub(crate) fn finalize_thread(&mut self, tid: ThreadId) {
        let Some(thread) = self.threads.get(tid) else { return };
        if thread.is_terminated() {
            return;
        }
        let (pid, guest_id) = (thread.process, thread.guest_id);
        self.abort_wait(tid);
        self.dequeue(tid);
        self.remove_lock_waiter(tid);

        // Nobody will release mutexes a dead thread owned
        let waiters = self.threads.get_mut(tid).map(|t| std::mem::take(&mut t.waiters)).unwrap_or_default();
        for waiter in waiters {
            if let Some(w) = self.threads.get_mut(waiter) {
                w.lock_owner = None;
            }
            self.end_wait(waiter, Err(KernelError::InvalidState), None);
        }

        let Some(thread) = self.threads.get_mut(tid) else { return };
        thread.state = ThreadState::Terminated;
        thread.terminate_requested = false;
        thread.priority = thread.base_priority;
        let tls = thread.tls;
        if let Some(process) = self.processes.get_mut(pid) {
            process.free_tls(tls);
        }
        debug!("thread {guest_id} terminated");
        self.wake_object(SyncObject::Thread(tid));
        self.reap_process(pid);
    }
}
