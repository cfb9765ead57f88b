//! Blocking waits, events, cancellation and timeouts
//!
//! A blocked thread carries one [`WaitInfo`]. Signals, cancellation,
//! timeouts and IPC replies all finish a wait through [`KernelState::end_wait`];
//! the first caller takes the `WaitInfo` and every later one finds it gone,
//! so each wait resolves exactly once.

use tracing::debug;

use super::handle_table::KObjectRef;
use super::object::{EventId, KEvent, ProcessId, ThreadId};
use super::result::{to_raw, KernelError};
use super::svc::Reply;
use super::thread::{SyncObject, ThreadState, WaitInfo, WaitReason};
use super::time;
use super::KernelState;

impl KernelState {
    /// Park `tid` (which must have its context stored) and return the wait id
    pub(crate) fn begin_wait(
        &mut self,
        tid: ThreadId,
        reason: WaitReason,
        deadline: Option<u64>,
        objects: Vec<SyncObject>,
        cancellable: bool,
        receive: bool,
    ) -> u64 {
        let id = self.next_wait_id();
        let seq = self.next_seq();
        self.dequeue(tid);
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.state = ThreadState::Waiting(reason);
            thread.wait_seq = seq;
            thread.wait = Some(WaitInfo { id, deadline, objects, cancellable, receive });
        }
        id
    }

    /// Finish whatever wait `tid` is in. Returns false if it was not waiting.
    pub(crate) fn end_wait(&mut self, tid: ThreadId, result: Result<(), KernelError>, index: Option<u32>) -> bool {
        self.end_wait_matching(tid, None, result, index)
    }

    fn end_wait_matching(
        &mut self,
        tid: ThreadId,
        wait_id: Option<u64>,
        mut result: Result<(), KernelError>,
        index: Option<u32>,
    ) -> bool {
        let Some(thread) = self.threads.get_mut(tid) else { return false };
        let ThreadState::Waiting(reason) = thread.state else { return false };
        if wait_id.is_some_and(|id| thread.wait.as_ref().map(|w| w.id) != Some(id)) {
            return false;
        }
        let Some(wait) = thread.wait.take() else { return false };

        self.unlink_wait(tid, reason);

        if result.is_ok() && wait.receive {
            if let Some(&SyncObject::ServerSession(session)) = index.and_then(|i| wait.objects.get(i as usize)) {
                if let Err(err) = self.receive_request(tid, session) {
                    result = Err(err);
                }
            }
        }

        if let Some(ctx) = self.threads.get_mut(tid).and_then(|t| t.ctx.as_mut()) {
            ctx.set_ret(0, to_raw(result));
            if let Some(index) = index {
                ctx.set_ret(1, index);
            }
        }
        self.make_ready(tid, false);
        true
    }

    /// Abandon a wait without touching the thread's registers
    pub(crate) fn abort_wait(&mut self, tid: ThreadId) {
        let Some(thread) = self.threads.get_mut(tid) else { return };
        if let (ThreadState::Waiting(reason), Some(_)) = (thread.state, thread.wait.take()) {
            self.unlink_wait(tid, reason);
        }
    }

    /// Remove `tid` from whichever queue its wait put it in
    fn unlink_wait(&mut self, tid: ThreadId, reason: WaitReason) {
        match reason {
            WaitReason::Mutex { .. } => self.remove_lock_waiter(tid),
            WaitReason::ConditionVariable { .. } => {
                if let Ok(pid) = self.process_of(tid) {
                    if let Some(p) = self.processes.get_mut(pid) {
                        p.condvar_waiters.retain(|&t| t != tid);
                    }
                }
            }
            WaitReason::Address { .. } => {
                if let Ok(pid) = self.process_of(tid) {
                    if let Some(p) = self.processes.get_mut(pid) {
                        p.arbiter_waiters.retain(|&t| t != tid);
                    }
                }
            }
            WaitReason::IpcReply { session } => self.unlink_ipc_client(session, tid),
            WaitReason::Synchronization | WaitReason::Sleep => {}
        }
    }

    pub fn is_signaled(&self, object: SyncObject) -> bool {
        match object {
            SyncObject::Event(id) => self.events.get(id).is_some_and(|e| e.signaled),
            SyncObject::Thread(tid) => self.threads.get(tid).map_or(true, |t| t.is_terminated()),
            SyncObject::ServerSession(id) => self
                .sessions
                .get(id)
                .map_or(true, |s| !s.client_open || (s.in_flight.is_none() && !s.queue.is_empty())),
            SyncObject::ServerPort(id) => self.ports.get(id).is_some_and(|p| !p.pending.is_empty()),
        }
    }

    /// Resolve synchronization waits on `object` while it stays signaled
    pub(crate) fn wake_object(&mut self, object: SyncObject) {
        let mut waiting: Vec<(u64, ThreadId, u32)> = self
            .threads
            .iter()
            .filter(|(_, t)| t.state == ThreadState::Waiting(WaitReason::Synchronization))
            .filter_map(|(tid, t)| {
                let wait = t.wait.as_ref()?;
                let index = wait.objects.iter().position(|&o| o == object)?;
                Some((t.wait_seq, tid, index as u32))
            })
            .collect();
        waiting.sort_unstable_by_key(|&(seq, _, _)| seq);
        for (_, tid, index) in waiting {
            if !self.is_signaled(object) {
                break;
            }
            self.end_wait(tid, Ok(()), Some(index));
        }
    }

    /// Resolve every wait whose deadline passed; returns the next deadline
    pub(crate) fn expire_timeouts(&mut self) -> Option<u64> {
        let now = self.now;
        let expired: Vec<(ThreadId, u64, bool)> = self
            .threads
            .iter()
            .filter_map(|(tid, t)| {
                let wait = t.wait.as_ref()?;
                let sleeping = t.state == ThreadState::Waiting(WaitReason::Sleep);
                wait.deadline.filter(|&d| d <= now).map(|_| (tid, wait.id, sleeping))
            })
            .collect();
        for (tid, id, sleeping) in expired {
            let result = if sleeping { Ok(()) } else { Err(KernelError::TimedOut) };
            self.end_wait_matching(tid, Some(id), result, None);
        }
        self.next_deadline()
    }

    /// WaitSynchronization and the receive half of ReplyAndReceive
    pub(crate) fn wait_synchronization(
        &mut self,
        cur: ThreadId,
        objects: Vec<SyncObject>,
        timeout: i64,
        receive: bool,
    ) -> Result<Reply, KernelError> {
        if let Some(index) = objects.iter().position(|&o| self.is_signaled(o)) {
            if receive {
                if let SyncObject::ServerSession(session) = objects[index] {
                    if let Err(err) = self.receive_request(cur, session) {
                        return Ok(Reply::Status(err, vec![index as u32]));
                    }
                }
            }
            return Ok(Reply::Done(vec![index as u32]));
        }
        if timeout == 0 {
            return Err(KernelError::TimedOut);
        }
        let thread = self.thread_mut(cur)?;
        if thread.sync_cancelled {
            thread.sync_cancelled = false;
            return Err(KernelError::Cancelled);
        }
        let deadline = time::deadline(self.now, timeout);
        self.begin_wait(cur, WaitReason::Synchronization, deadline, objects, true, receive);
        Ok(Reply::Blocked)
    }

    pub(crate) fn cancel_synchronization(&mut self, target: ThreadId) -> Result<(), KernelError> {
        let thread = self.thread_mut(target)?;
        if thread.is_terminated() {
            return Err(KernelError::InvalidState);
        }
        let cancellable = thread.state == ThreadState::Waiting(WaitReason::Synchronization)
            && thread.wait.as_ref().is_some_and(|w| w.cancellable);
        if cancellable {
            self.end_wait(target, Err(KernelError::Cancelled), None);
        } else {
            thread.sync_cancelled = true;
        }
        Ok(())
    }

    /// SleepThread. 0 yields, -1 yields and may migrate to an idle core,
    /// -2 yields to every other ready thread.
    pub(crate) fn sleep_thread(&mut self, cur: ThreadId, ns: i64) -> Result<Reply, KernelError> {
        match ns {
            n if n > 0 => {
                let deadline = time::deadline(self.now, n);
                self.begin_wait(cur, WaitReason::Sleep, deadline, Vec::new(), false, false);
                return Ok(Reply::Blocked);
            }
            -1 => {
                let thread = self.thread(cur)?;
                let here = thread.active_core;
                let idle = (0..self.scheduler.core_count())
                    .find(|&core| core != here && thread.allows_core(core) && self.scheduler.is_idle(core));
                if let Some(core) = idle {
                    debug!("thread {} migrating to idle core {core}", thread.guest_id);
                    self.thread_mut(cur)?.active_core = core;
                }
            }
            -2 => self.thread_mut(cur)?.yield_to_any = true,
            _ => {}
        }
        self.make_ready(cur, false);
        Ok(Reply::Done(Vec::new()))
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Returns (writable, readable) handles
    pub fn create_event(&mut self, pid: ProcessId) -> Result<(EventId, u32, u32), KernelError> {
        let id = self.events.insert(KEvent { owner: pid, signaled: false, refs: 0 });
        let writable = match self.add_handle(pid, KObjectRef::WritableEvent(id)) {
            Ok(h) => h,
            Err(err) => {
                self.events.remove(id);
                return Err(err);
            }
        };
        match self.add_handle(pid, KObjectRef::ReadableEvent(id)) {
            Ok(readable) => Ok((id, writable, readable)),
            Err(err) => {
                self.close_handle(pid, writable)?;
                Err(err)
            }
        }
    }

    pub fn signal_event(&mut self, id: EventId) -> Result<(), KernelError> {
        let event = self.events.get_mut(id).ok_or(KernelError::InvalidHandle)?;
        if !event.signaled {
            event.signaled = true;
            self.wake_object(SyncObject::Event(id));
        }
        Ok(())
    }

    pub fn clear_event(&mut self, id: EventId) -> Result<(), KernelError> {
        self.events.get_mut(id).ok_or(KernelError::InvalidHandle)?.signaled = false;
        Ok(())
    }

    /// Clear a signaled event; fails if it was not signaled
    pub fn reset_signal(&mut self, id: EventId) -> Result<(), KernelError> {
        let event = self.events.get_mut(id).ok_or(KernelError::InvalidHandle)?;
        if !event.signaled {
            return Err(KernelError::InvalidState);
        }
        event.signaled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;
    use crate::kernel::Kernel;

    fn setup() -> (Kernel, ProcessId, ThreadId) {
        let kernel = Kernel::new(EmulatorConfig::deterministic(1));
        let tid = {
            let mut st = kernel.lock();
            let pid = st.create_process("sync").unwrap();
            let (tid, _) = st.create_thread(pid, 0x1000, 0, 0x2000, 30, 0).unwrap();
            st.start_thread(tid).unwrap();
            st.pick_next(0);
            tid
        };
        let pid = kernel.lock().process_of(tid).unwrap();
        (kernel, pid, tid)
    }

    fn a0(st: &KernelState, tid: ThreadId) -> u32 {
        st.thread(tid).unwrap().ctx.as_ref().unwrap().arg(0)
    }

    #[test]
    fn test_signaled_event_returns_immediately() {
        let (kernel, pid, tid) = setup();
        let mut st = kernel.lock();
        let (id, _, _) = st.create_event(pid).unwrap();
        st.signal_event(id).unwrap();
        let reply = st.wait_synchronization(tid, vec![SyncObject::Event(id)], -1, false).unwrap();
        assert_eq!(reply, Reply::Done(vec![0]));
    }

    #[test]
    fn test_zero_timeout_does_not_block() {
        let (kernel, pid, tid) = setup();
        let mut st = kernel.lock();
        let (id, _, _) = st.create_event(pid).unwrap();
        let result = st.wait_synchronization(tid, vec![SyncObject::Event(id)], 0, false);
        assert_eq!(result, Err(KernelError::TimedOut));
        assert!(!st.thread(tid).unwrap().is_waiting());
    }

    #[test]
    fn test_signal_wakes_waiter_with_index() {
        let (kernel, pid, tid) = setup();
        let mut st = kernel.lock();
        let (a, _, _) = st.create_event(pid).unwrap();
        let (b, _, _) = st.create_event(pid).unwrap();
        let reply = st
            .wait_synchronization(tid, vec![SyncObject::Event(a), SyncObject::Event(b)], -1, false)
            .unwrap();
        assert_eq!(reply, Reply::Blocked);
        st.signal_event(b).unwrap();
        let thread = st.thread(tid).unwrap();
        assert_eq!(thread.state, ThreadState::Ready);
        assert_eq!(thread.ctx.as_ref().unwrap().arg(1), 1);
        assert_eq!(a0(&st, tid), 0);
    }

    #[test]
    fn test_cancel_latches_when_not_waiting() {
        let (kernel, pid, tid) = setup();
        let mut st = kernel.lock();
        let (id, _, _) = st.create_event(pid).unwrap();
        st.cancel_synchronization(tid).unwrap();
        let result = st.wait_synchronization(tid, vec![SyncObject::Event(id)], -1, false);
        assert_eq!(result, Err(KernelError::Cancelled));
        // The latch is consumed
        let reply = st.wait_synchronization(tid, vec![SyncObject::Event(id)], -1, false).unwrap();
        assert_eq!(reply, Reply::Blocked);
    }

    #[test]
    fn test_first_resolution_wins() {
        let (kernel, pid, tid) = setup();
        let mut st = kernel.lock();
        let (id, _, _) = st.create_event(pid).unwrap();
        st.wait_synchronization(tid, vec![SyncObject::Event(id)], -1, false).unwrap();
        st.cancel_synchronization(tid).unwrap();
        assert_eq!(a0(&st, tid), KernelError::Cancelled.code().raw());
        // A late signal neither overrides the result nor latches anything
        st.signal_event(id).unwrap();
        assert_eq!(a0(&st, tid), KernelError::Cancelled.code().raw());
        assert!(!st.thread(tid).unwrap().sync_cancelled);
    }

    #[test]
    fn test_timeout_expires_once() {
        let (kernel, pid, tid) = setup();
        let (id, _, _) = kernel.lock().create_event(pid).unwrap();
        kernel
            .lock()
            .wait_synchronization(tid, vec![SyncObject::Event(id)], 1_000, false)
            .unwrap();
        kernel.time().advance(999);
        assert_eq!(kernel.lock().expire_timeouts(), Some(1_000));
        assert!(kernel.lock().thread(tid).unwrap().is_waiting());
        kernel.time().advance(1);
        let mut st = kernel.lock();
        assert_eq!(st.expire_timeouts(), None);
        assert_eq!(a0(&st, tid), KernelError::TimedOut.code().raw());
        st.signal_event(id).unwrap();
        assert_eq!(a0(&st, tid), KernelError::TimedOut.code().raw());
    }

    #[test]
    fn test_sleep_resolves_successfully() {
        let (kernel, _, tid) = setup();
        assert_eq!(kernel.lock().sleep_thread(tid, 500).unwrap(), Reply::Blocked);
        kernel.time().advance(500);
        let mut st = kernel.lock();
        st.expire_timeouts();
        assert_eq!(st.thread(tid).unwrap().state, ThreadState::Ready);
        assert_eq!(a0(&st, tid), 0);
    }

    #[test]
    fn test_reset_signal_requires_signaled() {
        let (kernel, pid, _) = setup();
        let mut st = kernel.lock();
        let (id, _, _) = st.create_event(pid).unwrap();
        assert_eq!(st.reset_signal(id), Err(KernelError::InvalidState));
        st.signal_event(id).unwrap();
        assert_eq!(st.reset_signal(id), Ok(()));
    }
}
