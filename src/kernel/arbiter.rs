//! Guest-memory synchronization
//!
//! Mutexes, condition variables and address-arbiter semaphores live in
//! guest memory; the kernel only gets involved on contention. A mutex word
//! holds the owner's thread handle plus [`MUTEX_WAITERS_BIT`] once someone
//! has blocked on it, which forces the owner through ArbitrateUnlock.
//!
//! Every wait queue here is ordered by effective priority, then arrival.

use std::sync::Arc;

use tracing::debug;

use super::handle_table::KObjectRef;
use super::object::{ProcessId, ThreadId};
use super::result::KernelError;
use super::svc::Reply;
use super::thread::{ThreadState, WaitReason, MUTEX_WAITERS_BIT};
use super::time;
use super::KernelState;
use crate::memory::{AddressSpace, MemoryPermission};

/// WaitForAddress types
pub mod arbitration {
    pub const WAIT_IF_LESS_THAN: u32 = 0;
    pub const DECREMENT_AND_WAIT_IF_LESS_THAN: u32 = 1;
    pub const WAIT_IF_EQUAL: u32 = 2;
}

/// SignalToAddress types
pub mod signal {
    pub const SIGNAL: u32 = 0;
    pub const SIGNAL_AND_INCREMENT_IF_EQUAL: u32 = 1;
    pub const SIGNAL_AND_MODIFY_BY_WAITING_COUNT_IF_EQUAL: u32 = 2;
}

fn check_word(addr: u32) -> Result<(), KernelError> {
    if addr & 3 != 0 {
        Err(KernelError::InvalidAddress)
    } else {
        Ok(())
    }
}

fn check_writable(space: &AddressSpace, addr: u32) -> Result<(), KernelError> {
    match space.query_protection(addr) {
        Ok(perm) if perm.contains(MemoryPermission::WRITE) => Ok(()),
        _ => Err(KernelError::InvalidCurrentMemory),
    }
}

fn read_word(space: &AddressSpace, addr: u32) -> Result<u32, KernelError> {
    space.read::<u32>(addr).map_err(|_| KernelError::InvalidCurrentMemory)
}

impl KernelState {
    fn current_space(&self, cur: ThreadId) -> Result<(ProcessId, Arc<AddressSpace>), KernelError> {
        let pid = self.process_of(cur)?;
        Ok((pid, self.process(pid)?.space.clone()))
    }

    /// Waiters of `list` in wake order that are still parked for `reason`
    fn queued_waiters(&self, list: &[ThreadId], reason: WaitReason) -> Vec<ThreadId> {
        let mut waiters: Vec<ThreadId> = list
            .iter()
            .copied()
            .filter(|&t| self.threads.get(t).is_some_and(|t| t.state == ThreadState::Waiting(reason)))
            .collect();
        waiters.sort_by_key(|&t| self.threads.get(t).map(|t| (t.priority, t.wait_seq)));
        waiters
    }

    // =========================================================================
    // Mutex
    // =========================================================================

    pub(crate) fn arbitrate_lock(
        &mut self,
        cur: ThreadId,
        owner_handle: u32,
        addr: u32,
        tag: u32,
    ) -> Result<Reply, KernelError> {
        check_word(addr)?;
        let (_, space) = self.current_space(cur)?;
        let value = read_word(&space, addr)?;
        if value != owner_handle | MUTEX_WAITERS_BIT {
            // Released before we got here; the guest retries
            return Ok(Reply::Done(Vec::new()));
        }
        let owner = self.resolve_thread(cur, owner_handle)?;
        if owner == cur {
            return Err(KernelError::InvalidHandle);
        }

        self.begin_wait(cur, WaitReason::Mutex { addr }, None, Vec::new(), false, false);
        let thread = self.thread_mut(cur)?;
        thread.mutex_addr = addr;
        thread.key_value = tag;
        self.add_lock_waiter(owner, cur);
        debug!("thread {cur} blocked on mutex {addr:#010x} owned by {owner}");
        Ok(Reply::Blocked)
    }

    pub(crate) fn arbitrate_unlock(&mut self, cur: ThreadId, addr: u32) -> Result<Reply, KernelError> {
        check_word(addr)?;
        self.release_mutex(cur, addr)?;
        Ok(Reply::Done(Vec::new()))
    }

    /// Hand the mutex at `addr` to its most urgent waiter, or clear it
    fn release_mutex(&mut self, cur: ThreadId, addr: u32) -> Result<(), KernelError> {
        let (_, space) = self.current_space(cur)?;
        let (next, count) = self.remove_waiters_by_key(cur, addr);
        let tag = match next {
            Some(next) => {
                let key = self.thread(next)?.key_value;
                if count > 1 {
                    key | MUTEX_WAITERS_BIT
                } else {
                    key
                }
            }
            None => 0,
        };
        let written = space.write::<u32>(addr, tag).map_err(|_| KernelError::InvalidCurrentMemory);
        if let Some(next) = next {
            self.end_wait(next, written, None);
        }
        written
    }

    // =========================================================================
    // Condition variables
    // =========================================================================

    pub(crate) fn wait_process_wide_key_atomic(
        &mut self,
        cur: ThreadId,
        addr: u32,
        key: u32,
        tag: u32,
        timeout: i64,
    ) -> Result<Reply, KernelError> {
        check_word(addr)?;
        check_word(key)?;
        let (pid, space) = self.current_space(cur)?;
        // Both words must be writable before either changes
        check_writable(&space, key)?;
        check_writable(&space, addr)?;
        space.write::<u32>(key, 1).map_err(|_| KernelError::InvalidCurrentMemory)?;
        self.release_mutex(cur, addr)?;
        if timeout == 0 {
            return Err(KernelError::TimedOut);
        }

        let deadline = time::deadline(self.now, timeout);
        self.begin_wait(cur, WaitReason::ConditionVariable { key }, deadline, Vec::new(), false, false);
        let thread = self.thread_mut(cur)?;
        thread.mutex_addr = addr;
        thread.key_value = tag;
        self.process_mut(pid)?.condvar_waiters.push(cur);
        Ok(Reply::Blocked)
    }

    /// Wake up to `count` waiters on `key` (all of them if `count <= 0`).
    /// Each woken thread immediately tries to re-take its mutex.
    pub(crate) fn signal_process_wide_key(&mut self, cur: ThreadId, key: u32, count: i32) -> Result<Reply, KernelError> {
        let (pid, space) = self.current_space(cur)?;
        let reason = WaitReason::ConditionVariable { key };
        let waiters = self.queued_waiters(&self.process(pid)?.condvar_waiters, reason);
        let limit = if count <= 0 { waiters.len() } else { waiters.len().min(count as usize) };

        for &tid in &waiters[..limit] {
            self.process_mut(pid)?.condvar_waiters.retain(|&t| t != tid);
            self.reacquire_mutex(pid, &space, tid);
        }

        if limit == waiters.len() {
            // Nobody left; guest fast paths may skip the next signal
            let _ = space.write::<u32>(key, 0);
        }
        Ok(Reply::Done(Vec::new()))
    }

    /// Try to take the mutex a woken condition-variable waiter released.
    /// On contention the thread becomes a waiter of the current owner.
    fn reacquire_mutex(&mut self, pid: ProcessId, space: &AddressSpace, tid: ThreadId) {
        let Some(thread) = self.threads.get(tid) else { return };
        let (addr, tag) = (thread.mutex_addr, thread.key_value);
        let updated = space.fetch_update_u32(addr, |v| Some(if v == 0 { tag } else { v | MUTEX_WAITERS_BIT }));
        match updated {
            Ok(Ok(0)) => {
                self.end_wait(tid, Ok(()), None);
            }
            Ok(Ok(previous)) => {
                let owner_handle = previous & !MUTEX_WAITERS_BIT;
                let owner = self
                    .process(pid)
                    .ok()
                    .and_then(|p| p.handles.get(owner_handle))
                    .and_then(|o| match o {
                        KObjectRef::Thread(t) if self.threads.contains(t) && t != tid => Some(t),
                        _ => None,
                    });
                match owner {
                    Some(owner) => {
                        if let Some(t) = self.threads.get_mut(tid) {
                            t.state = ThreadState::Waiting(WaitReason::Mutex { addr });
                        }
                        self.add_lock_waiter(owner, tid);
                    }
                    None => {
                        self.end_wait(tid, Err(KernelError::InvalidState), None);
                    }
                }
            }
            Ok(Err(_)) | Err(_) => {
                self.end_wait(tid, Err(KernelError::InvalidCurrentMemory), None);
            }
        }
    }

    // =========================================================================
    // Address arbiter
    // =========================================================================

    pub(crate) fn wait_for_address(
        &mut self,
        cur: ThreadId,
        addr: u32,
        ty: u32,
        value: i32,
        timeout: i64,
    ) -> Result<Reply, KernelError> {
        check_word(addr)?;
        let (pid, space) = self.current_space(cur)?;
        match ty {
            arbitration::WAIT_IF_LESS_THAN => {
                if read_word(&space, addr)? as i32 >= value {
                    return Err(KernelError::InvalidState);
                }
            }
            arbitration::DECREMENT_AND_WAIT_IF_LESS_THAN => {
                let updated = space
                    .fetch_update_u32(addr, |v| ((v as i32) < value).then(|| (v as i32).wrapping_sub(1) as u32))
                    .map_err(|_| KernelError::InvalidCurrentMemory)?;
                if updated.is_err() {
                    return Err(KernelError::InvalidState);
                }
            }
            arbitration::WAIT_IF_EQUAL => {
                if read_word(&space, addr)? as i32 != value {
                    return Err(KernelError::InvalidState);
                }
            }
            _ => return Err(KernelError::InvalidEnumValue),
        }
        if timeout == 0 {
            return Err(KernelError::TimedOut);
        }

        let deadline = time::deadline(self.now, timeout);
        self.begin_wait(cur, WaitReason::Address { addr }, deadline, Vec::new(), false, false);
        self.process_mut(pid)?.arbiter_waiters.push(cur);
        Ok(Reply::Blocked)
    }

    pub(crate) fn signal_to_address(
        &mut self,
        cur: ThreadId,
        addr: u32,
        ty: u32,
        value: i32,
        count: i32,
    ) -> Result<Reply, KernelError> {
        check_word(addr)?;
        let (pid, space) = self.current_space(cur)?;
        let waiters = self.queued_waiters(&self.process(pid)?.arbiter_waiters, WaitReason::Address { addr });

        let new_value = match ty {
            signal::SIGNAL => None,
            signal::SIGNAL_AND_INCREMENT_IF_EQUAL => Some(value.wrapping_add(1)),
            signal::SIGNAL_AND_MODIFY_BY_WAITING_COUNT_IF_EQUAL => {
                let n = waiters.len();
                let adjusted = if count <= 0 {
                    if n > 0 {
                        value.wrapping_sub(2)
                    } else {
                        value.wrapping_add(1)
                    }
                } else if n == 0 {
                    value.wrapping_add(1)
                } else {
                    let others = (n - 1).min(count as usize + 1);
                    if others == 0 {
                        value.wrapping_add(1)
                    } else if others <= count as usize {
                        value.wrapping_sub(1)
                    } else {
                        value
                    }
                };
                Some(adjusted)
            }
            _ => return Err(KernelError::InvalidEnumValue),
        };
        if let Some(new_value) = new_value {
            let swapped = space
                .compare_exchange_u32(addr, value as u32, new_value as u32)
                .map_err(|_| KernelError::InvalidCurrentMemory)?;
            if swapped.is_err() {
                return Err(KernelError::InvalidState);
            }
        }

        let limit = if count <= 0 { waiters.len() } else { waiters.len().min(count as usize) };
        for &tid in &waiters[..limit] {
            self.end_wait(tid, Ok(()), None);
        }
        Ok(Reply::Done(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;
    use crate::kernel::Kernel;
    use crate::memory::{MemoryAttribute, MemoryPermission, MemoryState};

    const DATA: u32 = 0x0010_0000;

    struct Fixture {
        kernel: Kernel,
        space: Arc<AddressSpace>,
        threads: Vec<(ThreadId, u32)>,
    }

    fn setup(priorities: &[u8]) -> Fixture {
        let kernel = Kernel::new(EmulatorConfig::deterministic(1));
        let (space, threads) = {
            let mut st = kernel.lock();
            let pid = st.create_process("arbiter").unwrap();
            let space = st.process(pid).unwrap().space.clone();
            space
                .map(DATA, 0x1000, MemoryPermission::READ_WRITE, MemoryAttribute::empty(), MemoryState::Normal)
                .unwrap();
            let threads = priorities
                .iter()
                .map(|&p| st.create_thread(pid, 0x1000, 0, 0x2000, p, 0).unwrap())
                .collect();
            (space, threads)
        };
        Fixture { kernel, space, threads }
    }

    fn result(st: &KernelState, tid: ThreadId) -> u32 {
        st.thread(tid).unwrap().ctx.as_ref().unwrap().arg(0)
    }

    #[test]
    fn test_lock_blocks_and_unlock_hands_over() {
        let f = setup(&[40, 20, 10]);
        let (owner, owner_handle) = f.threads[0];
        let (low, low_handle) = f.threads[1];
        let (high, high_handle) = f.threads[2];
        let mut st = f.kernel.lock();

        f.space.write::<u32>(DATA, owner_handle | MUTEX_WAITERS_BIT).unwrap();
        assert_eq!(st.arbitrate_lock(low, owner_handle, DATA, low_handle).unwrap(), Reply::Blocked);
        assert_eq!(st.arbitrate_lock(high, owner_handle, DATA, high_handle).unwrap(), Reply::Blocked);
        assert_eq!(st.thread(owner).unwrap().priority, 10);

        st.arbitrate_unlock(owner, DATA).unwrap();
        // The most urgent waiter owns it; one more is still waiting
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), high_handle | MUTEX_WAITERS_BIT);
        assert_eq!(st.thread(high).unwrap().state, ThreadState::Ready);
        assert_eq!(st.thread(low).unwrap().lock_owner, Some(high));
        assert_eq!(st.thread(owner).unwrap().priority, 40);
        assert_eq!(st.thread(high).unwrap().priority, 10);

        st.arbitrate_unlock(high, DATA).unwrap();
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), low_handle);
        assert_eq!(result(&st, low), 0);
    }

    #[test]
    fn test_lock_on_changed_word_returns_at_once() {
        let f = setup(&[30, 30]);
        let (_, owner_handle) = f.threads[0];
        let (waiter, tag) = f.threads[1];
        let mut st = f.kernel.lock();
        f.space.write::<u32>(DATA, 0).unwrap();
        assert_eq!(st.arbitrate_lock(waiter, owner_handle, DATA, tag).unwrap(), Reply::Done(vec![]));
        assert_eq!(st.arbitrate_lock(waiter, owner_handle, DATA + 2, tag), Err(KernelError::InvalidAddress));
    }

    #[test]
    fn test_condvar_signal_reacquires_mutex() {
        let f = setup(&[30, 30]);
        let (a, a_handle) = f.threads[0];
        let (b, b_handle) = f.threads[1];
        let key = DATA + 0x10;
        let mut st = f.kernel.lock();

        // a holds the mutex and waits on the condition variable
        f.space.write::<u32>(DATA, a_handle).unwrap();
        assert_eq!(st.wait_process_wide_key_atomic(a, DATA, key, a_handle, -1).unwrap(), Reply::Blocked);
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), 0);
        assert_eq!(f.space.read::<u32>(key).unwrap(), 1);

        // b takes the mutex, then signals while holding it
        f.space.write::<u32>(DATA, b_handle).unwrap();
        st.signal_process_wide_key(b, key, 1).unwrap();
        assert_eq!(st.thread(a).unwrap().state, ThreadState::Waiting(WaitReason::Mutex { addr: DATA }));
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), b_handle | MUTEX_WAITERS_BIT);
        assert_eq!(f.space.read::<u32>(key).unwrap(), 0);

        st.arbitrate_unlock(b, DATA).unwrap();
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), a_handle);
        assert_eq!(st.thread(a).unwrap().state, ThreadState::Ready);
        assert_eq!(result(&st, a), 0);
    }

    #[test]
    fn test_condvar_zero_timeout_releases_mutex() {
        let f = setup(&[30]);
        let (a, a_handle) = f.threads[0];
        let mut st = f.kernel.lock();
        f.space.write::<u32>(DATA, a_handle).unwrap();
        let result = st.wait_process_wide_key_atomic(a, DATA, DATA + 0x10, a_handle, 0);
        assert_eq!(result, Err(KernelError::TimedOut));
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), 0);
    }

    #[test]
    fn test_condvar_wait_on_bad_mutex_has_no_effect() {
        let f = setup(&[30]);
        let (a, a_handle) = f.threads[0];
        let mut st = f.kernel.lock();
        let key = DATA + 0x10;
        f.space.write::<u32>(key, 0).unwrap();
        // Mutex word outside the mapped page
        let result = st.wait_process_wide_key_atomic(a, DATA + 0x2000, key, a_handle, -1);
        assert_eq!(result, Err(KernelError::InvalidCurrentMemory));
        assert_eq!(f.space.read::<u32>(key).unwrap(), 0);
        assert!(st.process(st.process_of(a).unwrap()).unwrap().condvar_waiters.is_empty());
    }

    #[test]
    fn test_wait_for_address_conditions() {
        let f = setup(&[30]);
        let (t, _) = f.threads[0];
        let mut st = f.kernel.lock();
        f.space.write::<u32>(DATA, 5).unwrap();
        assert_eq!(
            st.wait_for_address(t, DATA, arbitration::WAIT_IF_LESS_THAN, 5, -1),
            Err(KernelError::InvalidState)
        );
        assert_eq!(st.wait_for_address(t, DATA, arbitration::WAIT_IF_EQUAL, 5, 0), Err(KernelError::TimedOut));
        assert_eq!(st.wait_for_address(t, DATA, 7, 5, -1), Err(KernelError::InvalidEnumValue));
        assert_eq!(
            st.wait_for_address(t, DATA, arbitration::DECREMENT_AND_WAIT_IF_LESS_THAN, 6, -1).unwrap(),
            Reply::Blocked
        );
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), 4);
    }

    #[test]
    fn test_signal_to_address_wakes_in_priority_order() {
        let f = setup(&[40, 10, 20, 30]);
        let waiters: Vec<ThreadId> = f.threads[..3].iter().map(|&(t, _)| t).collect();
        let (signaller, _) = f.threads[3];
        let mut st = f.kernel.lock();
        f.space.write::<u32>(DATA, 0).unwrap();
        for &t in &waiters {
            st.wait_for_address(t, DATA, arbitration::WAIT_IF_EQUAL, 0, -1).unwrap();
        }
        st.signal_to_address(signaller, DATA, signal::SIGNAL_AND_INCREMENT_IF_EQUAL, 0, 2).unwrap();
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), 1);
        // Priorities 10 and 20 woke; 40 still waits
        assert_eq!(st.thread(waiters[1]).unwrap().state, ThreadState::Ready);
        assert_eq!(st.thread(waiters[2]).unwrap().state, ThreadState::Ready);
        assert!(st.thread(waiters[0]).unwrap().is_waiting());

        assert_eq!(
            st.signal_to_address(signaller, DATA, signal::SIGNAL_AND_INCREMENT_IF_EQUAL, 0, 1),
            Err(KernelError::InvalidState)
        );
    }

    #[test]
    fn test_signal_modify_by_waiting_count() {
        let f = setup(&[30, 30, 30]);
        let (a, _) = f.threads[0];
        let (b, _) = f.threads[1];
        let (signaller, _) = f.threads[2];
        let mut st = f.kernel.lock();
        f.space.write::<u32>(DATA, 3).unwrap();
        st.wait_for_address(a, DATA, arbitration::WAIT_IF_EQUAL, 3, -1).unwrap();
        st.wait_for_address(b, DATA, arbitration::WAIT_IF_EQUAL, 3, -1).unwrap();
        // Two waiters, waking one: one other remains, so the value drops by one
        st.signal_to_address(signaller, DATA, signal::SIGNAL_AND_MODIFY_BY_WAITING_COUNT_IF_EQUAL, 3, 1)
            .unwrap();
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), 2);
        // One waiter left, waking all of them
        st.signal_to_address(signaller, DATA, signal::SIGNAL_AND_MODIFY_BY_WAITING_COUNT_IF_EQUAL, 2, 0)
            .unwrap();
        assert_eq!(f.space.read::<u32>(DATA).unwrap(), 0);
        assert!(!st.thread(a).unwrap().is_waiting());
        assert!(!st.thread(b).unwrap().is_waiting());
    }
}
