//! Multi-core priority scheduler
//!
//! Every core owns 64 FIFO ready queues, one per priority (0 is the most
//! urgent). A thread is queued on exactly one core. A core prefers its own
//! queues and only migrates a thread from another core when it has nothing
//! ready, taking the most urgent thread whose core mask allows it.
//!
//! Threads that exhaust their slice or yield go to the back of their level;
//! a preempted thread goes back to the front so it resumes first.
//!
//! Effective priority is the base priority lowered (made more urgent) by
//! the priorities of threads waiting on mutexes the thread owns, followed
//! transitively through lock-owner chains.

use std::collections::VecDeque;

use tracing::trace;

use super::object::{Arena, ThreadId};
use super::thread::{KThread, ThreadState, PRIORITY_COUNT};
use super::KernelState;

struct CoreQueue {
    levels: Vec<VecDeque<ThreadId>>,
    /// Bit n set when level n is non-empty
    present: u64,
    current: Option<ThreadId>,
}

impl CoreQueue {
    fn new() -> Self {
        CoreQueue {
            levels: (0..PRIORITY_COUNT).map(|_| VecDeque::new()).collect(),
            present: 0,
            current: None,
        }
    }

    fn best_priority(&self) -> Option<u8> {
        (self.present != 0).then(|| self.present.trailing_zeros() as u8)
    }
}

pub struct Scheduler {
    cores: Vec<CoreQueue>,
}

impl Scheduler {
    pub fn new(cores: usize) -> Self {
        Scheduler { cores: (0..cores).map(|_| CoreQueue::new()).collect() }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Thread running on `core`
    pub fn current(&self, core: usize) -> Option<ThreadId> {
        self.cores.get(core).and_then(|c| c.current)
    }

    pub fn set_current(&mut self, core: usize, tid: Option<ThreadId>) {
        if let Some(c) = self.cores.get_mut(core) {
            c.current = tid;
        }
    }

    pub fn push(&mut self, core: usize, priority: u8, tid: ThreadId, front: bool) {
        let Some(c) = self.cores.get_mut(core) else { return };
        let level = &mut c.levels[priority as usize];
        if front {
            level.push_front(tid);
        } else {
            level.push_back(tid);
        }
        c.present |= 1 << priority;
    }

    pub fn remove(&mut self, core: usize, priority: u8, tid: ThreadId) -> bool {
        let Some(c) = self.cores.get_mut(core) else { return false };
        let level = &mut c.levels[priority as usize];
        let Some(pos) = level.iter().position(|&t| t == tid) else { return false };
        level.remove(pos);
        if level.is_empty() {
            c.present &= !(1 << priority);
        }
        true
    }

    pub fn best_priority(&self, core: usize) -> Option<u8> {
        self.cores.get(core).and_then(CoreQueue::best_priority)
    }

    fn pop_best(&mut self, core: usize) -> Option<ThreadId> {
        let c = self.cores.get_mut(core)?;
        let priority = c.best_priority()?;
        let level = &mut c.levels[priority as usize];
        let tid = level.pop_front();
        if level.is_empty() {
            c.present &= !(1 << priority);
        }
        tid
    }

    /// Most urgent thread queued on another core that may run on `core`
    fn find_migratable(&self, core: usize, threads: &Arena<ThreadId, KThread>) -> Option<(usize, u8, ThreadId)> {
        let mut best: Option<(usize, u8, ThreadId)> = None;
        for (other, c) in self.cores.iter().enumerate() {
            if other == core {
                continue;
            }
            let mut present = c.present;
            while present != 0 {
                let priority = present.trailing_zeros() as u8;
                present &= present - 1;
                if best.is_some_and(|(_, p, _)| p <= priority) {
                    break;
                }
                let found = c.levels[priority as usize]
                    .iter()
                    .find(|&&t| threads.get(t).is_some_and(|t| t.allows_core(core)));
                if let Some(&tid) = found {
                    best = Some((other, priority, tid));
                    break;
                }
            }
        }
        best
    }

    pub fn ready_count(&self) -> usize {
        self.cores.iter().flat_map(|c| c.levels.iter()).map(VecDeque::len).sum()
    }

    pub fn is_idle(&self, core: usize) -> bool {
        self.cores.get(core).is_some_and(|c| c.current.is_none() && c.present == 0)
    }
}

impl KernelState {
    /// Queue a thread that can run
    pub(crate) fn make_ready(&mut self, tid: ThreadId, front: bool) {
        let Some(thread) = self.threads.get_mut(tid) else { return };
        if thread.is_terminated() {
            return;
        }
        let core = thread.home_core();
        let priority = thread.priority;
        let previous = thread.queued.replace((core, priority));
        thread.state = ThreadState::Ready;
        thread.active_core = core;
        if let Some((old_core, old_priority)) = previous {
            self.scheduler.remove(old_core, old_priority, tid);
        }
        self.scheduler.push(core, priority, tid, front);
        self.check_preemption(core, priority);
    }

    /// Take a ready thread off its queue
    pub(crate) fn dequeue(&mut self, tid: ThreadId) {
        if let Some(thread) = self.threads.get_mut(tid) {
            if let Some((core, priority)) = thread.queued.take() {
                self.scheduler.remove(core, priority, tid);
            }
        }
    }

    /// Ask `core` to switch if its running thread is less urgent than `priority`
    fn check_preemption(&self, core: usize, priority: u8) {
        if let Some(current) = self.scheduler.current(core) {
            if self.threads.get(current).is_some_and(|t| t.priority > priority) {
                self.raise_preempt(core);
            }
        }
    }

    /// Choose the next thread for `core`; its queue entry is consumed
    pub(crate) fn pick_next(&mut self, core: usize) -> Option<ThreadId> {
        let mut skipped: Option<ThreadId> = None;
        loop {
            let candidate = match self.scheduler.pop_best(core) {
                Some(tid) => Some(tid),
                None => self.scheduler.find_migratable(core, &self.threads).map(|(other, priority, tid)| {
                    self.scheduler.remove(other, priority, tid);
                    trace!("core {core} took thread {tid} from core {other}");
                    tid
                }),
            };
            let Some(tid) = candidate else { return skipped };
            self.clear_queued(tid);

            let yields = self.threads.get(tid).is_some_and(|t| t.yield_to_any);
            if yields && skipped.is_none() {
                if let Some(t) = self.threads.get_mut(tid) {
                    t.yield_to_any = false;
                }
                skipped = Some(tid);
                continue;
            }
            if let Some(skipped) = skipped {
                self.make_ready(skipped, false);
            }
            return Some(tid);
        }
    }

    fn clear_queued(&mut self, tid: ThreadId) {
        if let Some(t) = self.threads.get_mut(tid) {
            t.queued = None;
        }
    }

    /// Re-evaluate placement after a priority or affinity change
    pub(crate) fn reschedule(&mut self, tid: ThreadId) {
        let Some(thread) = self.threads.get(tid) else { return };
        match thread.state {
            ThreadState::Ready => self.make_ready(tid, false),
            ThreadState::Running(core) => {
                let priority = thread.priority;
                let outside_mask = !thread.allows_core(core);
                let beaten = self.scheduler.best_priority(core).is_some_and(|best| best < priority);
                if outside_mask || beaten {
                    self.raise_preempt(core);
                }
            }
            _ => {}
        }
    }

    /// Recompute effective priority from the base and current waiters,
    /// walking up the lock-owner chain while anything changes
    pub(crate) fn update_priority(&mut self, start: ThreadId) {
        let mut tid = start;
        // A deadlocked chain can loop; it converges, but bound the walk anyway
        for _ in 0..=self.threads.len() {
            let Some(thread) = self.threads.get(tid) else { return };
            let inherited = thread
                .waiters
                .iter()
                .filter_map(|&w| self.threads.get(w))
                .map(|w| w.priority)
                .min();
            let priority = inherited.map_or(thread.base_priority, |p| p.min(thread.base_priority));
            if priority == thread.priority {
                return;
            }
            let owner = thread.lock_owner;
            if let Some(thread) = self.threads.get_mut(tid) {
                thread.priority = priority;
            }
            self.reschedule(tid);
            match owner {
                Some(owner) => {
                    self.sort_waiter(owner, tid);
                    tid = owner;
                }
                None => return,
            }
        }
    }

    /// Insert `waiter` into `owner`'s waiter list, ordered by priority then arrival
    pub(crate) fn add_lock_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        if let Some(w) = self.threads.get_mut(waiter) {
            w.lock_owner = Some(owner);
        }
        self.sort_waiter(owner, waiter);
        self.update_priority(owner);
    }

    /// Detach `waiter` from the thread it waits on
    pub(crate) fn remove_lock_waiter(&mut self, waiter: ThreadId) {
        let Some(owner) = self.threads.get_mut(waiter).and_then(|w| w.lock_owner.take()) else { return };
        if let Some(o) = self.threads.get_mut(owner) {
            o.waiters.retain(|&t| t != waiter);
        }
        self.update_priority(owner);
    }

    fn sort_waiter(&mut self, owner: ThreadId, waiter: ThreadId) {
        let Some(key) = self.threads.get(waiter).map(|w| (w.priority, w.wait_seq)) else { return };
        let Some(owner_thread) = self.threads.get(owner) else { return };
        let mut waiters: Vec<ThreadId> = owner_thread.waiters.iter().copied().filter(|&t| t != waiter).collect();
        let pos = waiters
            .iter()
            .position(|&t| self.threads.get(t).is_some_and(|t| (t.priority, t.wait_seq) > key))
            .unwrap_or(waiters.len());
        waiters.insert(pos, waiter);
        if let Some(o) = self.threads.get_mut(owner) {
            o.waiters = waiters;
        }
    }

    /// Remove every waiter of `owner` blocked on `addr`. The most urgent one
    /// becomes the new owner and inherits the rest. Returns it with the
    /// number of waiters that were found.
    pub(crate) fn remove_waiters_by_key(&mut self, owner: ThreadId, addr: u32) -> (Option<ThreadId>, usize) {
        let Some(o) = self.threads.get(owner) else { return (None, 0) };
        let (matching, rest): (Vec<ThreadId>, Vec<ThreadId>) = o
            .waiters
            .iter()
            .copied()
            .partition(|&w| self.threads.get(w).is_some_and(|w| w.mutex_addr == addr));
        if let Some(o) = self.threads.get_mut(owner) {
            o.waiters = rest;
        }
        let count = matching.len();
        let mut iter = matching.into_iter();
        let Some(next) = iter.next() else { return (None, 0) };
        if let Some(n) = self.threads.get_mut(next) {
            n.lock_owner = None;
        }
        for waiter in iter {
            if let Some(w) = self.threads.get_mut(waiter) {
                w.lock_owner = Some(next);
            }
            self.sort_waiter(next, waiter);
        }
        self.update_priority(owner);
        self.update_priority(next);
        (Some(next), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;
    use crate::kernel::Kernel;
    use crate::kernel::ProcessId;

    fn state_with(cores: usize) -> (Kernel, ProcessId) {
        let kernel = Kernel::new(EmulatorConfig::deterministic(cores));
        let pid = kernel.lock().create_process("test").unwrap();
        (kernel, pid)
    }

    fn spawn(state: &mut KernelState, pid: ProcessId, priority: u8, core: usize) -> ThreadId {
        let (tid, _) = state.create_thread(pid, 0x1000, 0, 0x2000, priority, core as i32).unwrap();
        state.start_thread(tid).unwrap();
        tid
    }

    #[test]
    fn test_priority_order_and_fifo() {
        let (kernel, pid) = state_with(1);
        let mut st = kernel.lock();
        let low = spawn(&mut st, pid, 40, 0);
        let high_a = spawn(&mut st, pid, 10, 0);
        let high_b = spawn(&mut st, pid, 10, 0);
        assert_eq!(st.pick_next(0), Some(high_a));
        assert_eq!(st.pick_next(0), Some(high_b));
        assert_eq!(st.pick_next(0), Some(low));
        assert_eq!(st.pick_next(0), None);
    }

    #[test]
    fn test_preempted_thread_resumes_first() {
        let (kernel, pid) = state_with(1);
        let mut st = kernel.lock();
        let a = spawn(&mut st, pid, 20, 0);
        let b = spawn(&mut st, pid, 20, 0);
        assert_eq!(st.pick_next(0), Some(a));
        st.make_ready(a, true);
        assert_eq!(st.pick_next(0), Some(a));
        st.make_ready(a, false);
        assert_eq!(st.pick_next(0), Some(b));
    }

    #[test]
    fn test_migration_respects_core_mask() {
        let (kernel, pid) = state_with(2);
        let mut st = kernel.lock();
        let pinned = spawn(&mut st, pid, 10, 0);
        let roaming = spawn(&mut st, pid, 30, 0);
        st.thread_mut(roaming).unwrap().core_mask = 0b11;
        // Core 1 has nothing of its own; the pinned thread is not eligible
        assert_eq!(st.pick_next(1), Some(roaming));
        assert_eq!(st.thread(roaming).unwrap().queued, None);
        assert_eq!(st.pick_next(1), None);
        assert_eq!(st.pick_next(0), Some(pinned));
    }

    #[test]
    fn test_yield_to_any_lets_lower_priority_run() {
        let (kernel, pid) = state_with(1);
        let mut st = kernel.lock();
        let high = spawn(&mut st, pid, 10, 0);
        let low = spawn(&mut st, pid, 50, 0);
        st.thread_mut(high).unwrap().yield_to_any = true;
        assert_eq!(st.pick_next(0), Some(low));
        assert_eq!(st.pick_next(0), Some(high));
    }

    #[test]
    fn test_preemption_flag_raised_for_urgent_thread() {
        let (kernel, pid) = state_with(1);
        let mut st = kernel.lock();
        let low = spawn(&mut st, pid, 50, 0);
        assert_eq!(st.pick_next(0), Some(low));
        st.scheduler.set_current(0, Some(low));
        spawn(&mut st, pid, 5, 0);
        assert!(kernel.preempt_flag(0).unwrap().load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn test_priority_inheritance_direct_and_transitive() {
        let (kernel, pid) = state_with(1);
        let mut st = kernel.lock();
        let a = spawn(&mut st, pid, 40, 0);
        let b = spawn(&mut st, pid, 30, 0);
        let c = spawn(&mut st, pid, 5, 0);

        // b waits on a mutex a owns
        st.add_lock_waiter(a, b);
        assert_eq!(st.thread(a).unwrap().priority, 30);

        // c waits on a mutex b owns; boost flows through b to a
        st.add_lock_waiter(b, c);
        assert_eq!(st.thread(b).unwrap().priority, 5);
        assert_eq!(st.thread(a).unwrap().priority, 5);

        // c gives up: both revert
        st.remove_lock_waiter(c);
        assert_eq!(st.thread(b).unwrap().priority, 30);
        assert_eq!(st.thread(a).unwrap().priority, 30);
        st.remove_lock_waiter(b);
        assert_eq!(st.thread(a).unwrap().priority, 40);
    }

    #[test]
    fn test_remove_waiters_by_key_transfers_ownership() {
        let (kernel, pid) = state_with(1);
        let mut st = kernel.lock();
        let owner = spawn(&mut st, pid, 40, 0);
        let w1 = spawn(&mut st, pid, 20, 0);
        let w2 = spawn(&mut st, pid, 10, 0);
        let other = spawn(&mut st, pid, 30, 0);
        for (w, addr) in [(w1, 0x100), (w2, 0x100), (other, 0x200)] {
            st.thread_mut(w).unwrap().mutex_addr = addr;
            st.add_lock_waiter(owner, w);
        }
        assert_eq!(st.thread(owner).unwrap().priority, 10);

        let (next, count) = st.remove_waiters_by_key(owner, 0x100);
        assert_eq!((next, count), (Some(w2), 2));
        assert_eq!(st.thread(w1).unwrap().lock_owner, Some(w2));
        assert_eq!(st.thread(w2).unwrap().waiters, vec![w1]);
        assert_eq!(st.thread(owner).unwrap().waiters, vec![other]);
        assert_eq!(st.thread(owner).unwrap().priority, 30);
    }
}
