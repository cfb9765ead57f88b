//! Supervisor call table
//!
//! `ecall` with the call number in a7. Arguments come in a0..a5, 64-bit
//! values as lo/hi register pairs. The result code goes back in a0 and
//! outputs in a1 onwards. A call that blocks leaves the registers alone;
//! whoever ends the wait writes a0 (and a1 for an index).

use tracing::{debug, info, warn};

use super::handle_table::KObjectRef;
use super::object::{ProcessId, ThreadId};
use super::result::KernelError;
use super::thread::{SyncObject, LOWEST_PRIORITY};
use super::time;
use super::KernelState;
use crate::memory::{
    is_page_aligned, MemoryAttribute, MemoryPermission, MemoryState, ALIAS_BASE, ALIAS_SIZE, HEAP_BASE,
    HEAP_MAX_SIZE,
};
use crate::snapshot::ExitReason;

/// Most handles one WaitSynchronization accepts
pub const MAX_WAIT_OBJECTS: u32 = 64;
/// Longest port name, not counting the terminator
pub const MAX_PORT_NAME: usize = 12;
/// OutputDebugString reads at most this many bytes per call
pub const MAX_DEBUG_STRING: u32 = 0x1000;

/// Core id meaning "use the process default"
const CORE_PROCESS_DEFAULT: i32 = -2;
/// Core id meaning "keep the current ideal core"
const CORE_NO_UPDATE: i32 = -3;

/// Break reasons with this bit set only notify a debugger
const BREAK_NOTIFICATION_ONLY: u32 = 0x8000_0000;

pub mod nr {
    pub const SET_HEAP_SIZE: u32 = 0x01;
    pub const SET_MEMORY_PERMISSION: u32 = 0x02;
    pub const SET_MEMORY_ATTRIBUTE: u32 = 0x03;
    pub const MAP_MEMORY: u32 = 0x04;
    pub const UNMAP_MEMORY: u32 = 0x05;
    pub const QUERY_MEMORY: u32 = 0x06;
    pub const EXIT_PROCESS: u32 = 0x07;
    pub const CREATE_THREAD: u32 = 0x08;
    pub const START_THREAD: u32 = 0x09;
    pub const EXIT_THREAD: u32 = 0x0A;
    pub const SLEEP_THREAD: u32 = 0x0B;
    pub const GET_THREAD_PRIORITY: u32 = 0x0C;
    pub const SET_THREAD_PRIORITY: u32 = 0x0D;
    pub const GET_THREAD_CORE_MASK: u32 = 0x0E;
    pub const SET_THREAD_CORE_MASK: u32 = 0x0F;
    pub const GET_CURRENT_PROCESSOR_NUMBER: u32 = 0x10;
    pub const SIGNAL_EVENT: u32 = 0x11;
    pub const CLEAR_EVENT: u32 = 0x12;
    pub const CLOSE_HANDLE: u32 = 0x16;
    pub const RESET_SIGNAL: u32 = 0x17;
    pub const WAIT_SYNCHRONIZATION: u32 = 0x18;
    pub const CANCEL_SYNCHRONIZATION: u32 = 0x19;
    pub const ARBITRATE_LOCK: u32 = 0x1A;
    pub const ARBITRATE_UNLOCK: u32 = 0x1B;
    pub const WAIT_PROCESS_WIDE_KEY_ATOMIC: u32 = 0x1C;
    pub const SIGNAL_PROCESS_WIDE_KEY: u32 = 0x1D;
    pub const GET_SYSTEM_TICK: u32 = 0x1E;
    pub const CONNECT_TO_NAMED_PORT: u32 = 0x1F;
    pub const SEND_SYNC_REQUEST: u32 = 0x21;
    pub const GET_PROCESS_ID: u32 = 0x24;
    pub const GET_THREAD_ID: u32 = 0x25;
    pub const BREAK: u32 = 0x26;
    pub const OUTPUT_DEBUG_STRING: u32 = 0x27;
    pub const WAIT_FOR_ADDRESS: u32 = 0x34;
    pub const SIGNAL_TO_ADDRESS: u32 = 0x35;
    pub const CREATE_SESSION: u32 = 0x40;
    pub const ACCEPT_SESSION: u32 = 0x41;
    pub const REPLY_AND_RECEIVE: u32 = 0x43;
    pub const CREATE_EVENT: u32 = 0x45;
    pub const CREATE_PORT: u32 = 0x70;
    pub const MANAGE_NAMED_PORT: u32 = 0x71;
    pub const CONNECT_TO_PORT: u32 = 0x72;
}

/// How a call finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Success with outputs for a1..
    Done(Vec<u32>),
    /// Failure that still returns outputs
    Status(KernelError, Vec<u32>),
    /// The thread is waiting; the wait's resolution sets the result
    Blocked,
    /// The thread (or its process) is gone
    Exited,
}

/// Arguments of the call being serviced
struct Args([u32; 6]);

impl Args {
    fn u(&self, n: usize) -> u32 {
        self.0[n]
    }

    fn i(&self, n: usize) -> i32 {
        self.0[n] as i32
    }

    fn i64(&self, n: usize) -> i64 {
        (self.0[n] as u64 | (self.0[n + 1] as u64) << 32) as i64
    }
}

fn split(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

/// Run the call the thread `tid` just trapped into
pub(crate) fn dispatch(state: &mut KernelState, tid: ThreadId) {
    let Some(ctx) = state.threads.get(tid).and_then(|t| t.ctx.as_ref()) else { return };
    let number = ctx.read_reg(17);
    let args = Args(std::array::from_fn(|n| ctx.arg(n)));
    debug!("svc {number:#04x} from thread {tid} args {:x?}", args.0);

    let reply = match call(state, tid, number, &args) {
        Ok(reply) => reply,
        Err(err) => Reply::Status(err, Vec::new()),
    };
    let (code, outputs) = match reply {
        Reply::Done(outputs) => (0, outputs),
        Reply::Status(err, outputs) => {
            debug!("svc {number:#04x} failed: {err}");
            (err.code().raw(), outputs)
        }
        Reply::Blocked | Reply::Exited => return,
    };
    if let Some(ctx) = state.threads.get_mut(tid).and_then(|t| t.ctx.as_mut()) {
        ctx.set_ret(0, code);
        for (n, value) in outputs.into_iter().enumerate().take(7) {
            ctx.set_ret(n + 1, value);
        }
    }
}

fn call(st: &mut KernelState, cur: ThreadId, number: u32, a: &Args) -> Result<Reply, KernelError> {
    let done = |outputs: Vec<u32>| Ok(Reply::Done(outputs));
    let pid = st.process_of(cur)?;
    match number {
        nr::SET_HEAP_SIZE => {
            let base = set_heap_size(st, pid, a.u(0))?;
            done(vec![base])
        }
        nr::SET_MEMORY_PERMISSION => {
            set_memory_permission(st, pid, a.u(0), a.u(1), a.u(2))?;
            done(vec![])
        }
        nr::SET_MEMORY_ATTRIBUTE => {
            set_memory_attribute(st, pid, a.u(0), a.u(1), a.u(2), a.u(3))?;
            done(vec![])
        }
        nr::MAP_MEMORY => {
            let (dst, src, size) = (a.u(0), a.u(1), a.u(2));
            check_alias_args(dst, src, size)?;
            st.process(pid)?.space.map_alias(dst, src, size)?;
            done(vec![])
        }
        nr::UNMAP_MEMORY => {
            let (dst, src, size) = (a.u(0), a.u(1), a.u(2));
            check_alias_args(dst, src, size)?;
            st.process(pid)?.space.unmap_alias(dst, src, size)?;
            done(vec![])
        }
        nr::QUERY_MEMORY => {
            query_memory(st, pid, a.u(0), a.u(1))?;
            done(vec![0])
        }
        nr::EXIT_PROCESS => {
            st.terminate_process(pid, ExitReason::Exited);
            Ok(Reply::Exited)
        }
        nr::CREATE_THREAD => {
            let priority = u8::try_from(a.u(3)).map_err(|_| KernelError::InvalidPriority)?;
            let (_, handle) = st.create_thread(pid, a.u(0), a.u(1), a.u(2), priority, a.i(4))?;
            done(vec![handle])
        }
        nr::START_THREAD => {
            let tid = st.resolve_thread(cur, a.u(0))?;
            st.start_thread(tid)?;
            done(vec![])
        }
        nr::EXIT_THREAD => {
            st.terminate_thread(cur);
            Ok(Reply::Exited)
        }
        nr::SLEEP_THREAD => st.sleep_thread(cur, a.i64(0)),
        nr::GET_THREAD_PRIORITY => {
            let tid = st.resolve_thread(cur, a.u(0))?;
            done(vec![st.thread(tid)?.priority as u32])
        }
        nr::SET_THREAD_PRIORITY => {
            let tid = st.resolve_thread(cur, a.u(0))?;
            let priority = u8::try_from(a.u(1))
                .ok()
                .filter(|&p| p <= LOWEST_PRIORITY)
                .ok_or(KernelError::InvalidPriority)?;
            st.set_base_priority(tid, priority);
            done(vec![])
        }
        nr::GET_THREAD_CORE_MASK => {
            let tid = st.resolve_thread(cur, a.u(0))?;
            let thread = st.thread(tid)?;
            let [lo, hi] = split(thread.core_mask);
            done(vec![thread.ideal_core as u32, lo, hi])
        }
        nr::SET_THREAD_CORE_MASK => {
            let tid = st.resolve_thread(cur, a.u(0))?;
            let mask = a.u(2) as u64 | (a.u(3) as u64) << 32;
            set_thread_core_mask(st, pid, tid, a.i(1), mask)?;
            done(vec![])
        }
        nr::GET_CURRENT_PROCESSOR_NUMBER => done(vec![st.thread(cur)?.active_core as u32]),
        nr::SIGNAL_EVENT => match st.resolve(cur, a.u(0))? {
            KObjectRef::WritableEvent(id) => {
                st.signal_event(id)?;
                done(vec![])
            }
            _ => Err(KernelError::InvalidHandle),
        },
        nr::CLEAR_EVENT => match st.resolve(cur, a.u(0))? {
            KObjectRef::WritableEvent(id) | KObjectRef::ReadableEvent(id) => {
                st.clear_event(id)?;
                done(vec![])
            }
            _ => Err(KernelError::InvalidHandle),
        },
        nr::CLOSE_HANDLE => {
            st.close_handle(pid, a.u(0))?;
            done(vec![])
        }
        nr::RESET_SIGNAL => match st.resolve(cur, a.u(0))? {
            KObjectRef::ReadableEvent(id) => {
                st.reset_signal(id)?;
                done(vec![])
            }
            _ => Err(KernelError::InvalidHandle),
        },
        nr::WAIT_SYNCHRONIZATION => {
            let objects = read_sync_objects(st, cur, a.u(0), a.u(1))?;
            st.wait_synchronization(cur, objects, a.i64(2), false)
        }
        nr::CANCEL_SYNCHRONIZATION => {
            let tid = st.resolve_thread(cur, a.u(0))?;
            st.cancel_synchronization(tid)?;
            done(vec![])
        }
        nr::ARBITRATE_LOCK => st.arbitrate_lock(cur, a.u(0), a.u(1), a.u(2)),
        nr::ARBITRATE_UNLOCK => st.arbitrate_unlock(cur, a.u(0)),
        nr::WAIT_PROCESS_WIDE_KEY_ATOMIC => {
            st.wait_process_wide_key_atomic(cur, a.u(0), a.u(1), a.u(2), a.i64(3))
        }
        nr::SIGNAL_PROCESS_WIDE_KEY => st.signal_process_wide_key(cur, a.u(0), a.i(1)),
        nr::GET_SYSTEM_TICK => done(split(time::ns_to_ticks(st.now)).to_vec()),
        nr::CONNECT_TO_NAMED_PORT => {
            let name = read_port_name(st, pid, a.u(0))?;
            let port = *st.named_ports.get(&name).ok_or(KernelError::NotFound)?;
            let handle = st.connect(pid, port)?;
            done(vec![handle])
        }
        nr::SEND_SYNC_REQUEST => match st.resolve(cur, a.u(0))? {
            KObjectRef::ClientSession(session) => st.send_request(cur, session),
            _ => Err(KernelError::InvalidHandle),
        },
        nr::GET_PROCESS_ID => {
            let owner = match st.resolve(cur, a.u(0))? {
                KObjectRef::Process(p) => p,
                KObjectRef::Thread(t) => st.process_of(t)?,
                _ => return Err(KernelError::InvalidHandle),
            };
            done(split(st.process(owner)?.pid).to_vec())
        }
        nr::GET_THREAD_ID => {
            let tid = st.resolve_thread(cur, a.u(0))?;
            done(split(st.thread(tid)?.guest_id).to_vec())
        }
        nr::BREAK => {
            let reason = a.u(0);
            if reason & BREAK_NOTIFICATION_ONLY != 0 {
                info!("break notification {reason:#x} from thread {cur}");
                return done(vec![]);
            }
            warn!("thread {cur} called Break({reason:#x})");
            st.crash_process(pid, ExitReason::Break { reason });
            Ok(Reply::Exited)
        }
        nr::OUTPUT_DEBUG_STRING => {
            output_debug_string(st, pid, a.u(0), a.u(1))?;
            done(vec![])
        }
        nr::WAIT_FOR_ADDRESS => st.wait_for_address(cur, a.u(0), a.u(1), a.i(2), a.i64(3)),
        nr::SIGNAL_TO_ADDRESS => st.signal_to_address(cur, a.u(0), a.u(1), a.i(2), a.i(3)),
        nr::CREATE_SESSION => {
            let (server, client) = st.create_session_pair(pid)?;
            done(vec![server, client])
        }
        nr::ACCEPT_SESSION => match st.resolve(cur, a.u(0))? {
            KObjectRef::ServerPort(port) => done(vec![st.accept(pid, port)?]),
            _ => Err(KernelError::InvalidHandle),
        },
        nr::REPLY_AND_RECEIVE => {
            let reply_target = a.u(2);
            if reply_target != 0 {
                match st.resolve(cur, reply_target)? {
                    KObjectRef::ServerSession(session) => st.reply(cur, session)?,
                    _ => return Err(KernelError::InvalidHandle),
                }
            }
            let objects = read_sync_objects(st, cur, a.u(0), a.u(1))?;
            st.wait_synchronization(cur, objects, a.i64(3), true)
        }
        nr::CREATE_EVENT => {
            let (_, writable, readable) = st.create_event(pid)?;
            done(vec![writable, readable])
        }
        nr::CREATE_PORT => {
            let max = a.i(0);
            if max <= 0 {
                return Err(KernelError::OutOfRange);
            }
            let (server, client) = st.create_port(pid, max as usize, None)?;
            done(vec![server, client])
        }
        nr::MANAGE_NAMED_PORT => {
            let name = read_port_name(st, pid, a.u(0))?;
            let max = a.i(1);
            if max < 0 {
                return Err(KernelError::OutOfRange);
            }
            if max == 0 {
                st.unregister_named_port(&name)?;
                return done(vec![0]);
            }
            let (server, client) = st.create_port(pid, max as usize, Some(name))?;
            // The client end is held by the name table, not by this process
            st.close_handle(pid, client)?;
            done(vec![server])
        }
        nr::CONNECT_TO_PORT => match st.resolve(cur, a.u(0))? {
            KObjectRef::ClientPort(port) => done(vec![st.connect(pid, port)?]),
            _ => Err(KernelError::InvalidHandle),
        },
        _ => {
            warn!("unimplemented svc {number:#04x} from thread {cur}");
            Err(KernelError::NotImplemented)
        }
    }
}

fn set_heap_size(st: &mut KernelState, pid: ProcessId, size: u32) -> Result<u32, KernelError> {
    if !is_page_aligned(size) || size > HEAP_MAX_SIZE {
        return Err(KernelError::InvalidSize);
    }
    let process = st.process_mut(pid)?;
    let current = process.heap_size;
    if size > current {
        process.space.map(
            HEAP_BASE + current,
            size - current,
            MemoryPermission::READ_WRITE,
            MemoryAttribute::empty(),
            MemoryState::Heap,
        )?;
    } else if size < current {
        process.space.unmap(HEAP_BASE + size, current - size)?;
    }
    process.heap_size = size;
    Ok(HEAP_BASE)
}

fn check_range(addr: u32, size: u32) -> Result<(), KernelError> {
    if !is_page_aligned(addr) {
        return Err(KernelError::InvalidAddress);
    }
    if size == 0 || !is_page_aligned(size) {
        return Err(KernelError::InvalidSize);
    }
    if addr.checked_add(size).is_none() {
        return Err(KernelError::InvalidCurrentMemory);
    }
    Ok(())
}

fn set_memory_permission(st: &KernelState, pid: ProcessId, addr: u32, size: u32, perm: u32) -> Result<(), KernelError> {
    check_range(addr, size)?;
    let perm = MemoryPermission::from_bits(perm).ok_or(KernelError::InvalidNewMemoryPermission)?;
    if perm != MemoryPermission::NONE && perm != MemoryPermission::READ && perm != MemoryPermission::READ_WRITE {
        return Err(KernelError::InvalidNewMemoryPermission);
    }
    st.process(pid)?.space.protect(addr, size, perm)?;
    Ok(())
}

fn set_memory_attribute(
    st: &KernelState,
    pid: ProcessId,
    addr: u32,
    size: u32,
    mask: u32,
    value: u32,
) -> Result<(), KernelError> {
    check_range(addr, size)?;
    let combined = mask | value;
    if combined != mask || combined & !MemoryAttribute::UNCACHED.bits() != 0 {
        return Err(KernelError::InvalidCombination);
    }
    st.process(pid)?.space.set_attribute(
        addr,
        size,
        MemoryAttribute::from_bits_truncate(mask),
        MemoryAttribute::from_bits_truncate(value),
    )?;
    Ok(())
}

fn check_alias_args(dst: u32, src: u32, size: u32) -> Result<(), KernelError> {
    check_range(dst, size)?;
    check_range(src, size)?;
    let end = dst as u64 + size as u64;
    if dst < ALIAS_BASE || end > ALIAS_BASE as u64 + ALIAS_SIZE as u64 {
        return Err(KernelError::InvalidMemoryRegion);
    }
    Ok(())
}

fn query_memory(st: &KernelState, pid: ProcessId, info_ptr: u32, addr: u32) -> Result<(), KernelError> {
    let space = &st.process(pid)?.space;
    let info = space.query(addr);
    let words = [info.base, info.size, info.state as u32, info.attr.bits(), info.perm.bits(), 0, 0, 0];
    let mut bytes = [0u8; 32];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    space.write_bytes(info_ptr, &bytes).map_err(|_| KernelError::InvalidPointer)
}

fn set_thread_core_mask(
    st: &mut KernelState,
    pid: ProcessId,
    tid: ThreadId,
    core: i32,
    mask: u64,
) -> Result<(), KernelError> {
    let process = st.process(pid)?;
    let (ideal, mask) = match core {
        CORE_PROCESS_DEFAULT => (process.ideal_core, 1u64 << process.ideal_core),
        CORE_NO_UPDATE => {
            let ideal = st.thread(tid)?.ideal_core;
            if mask & (1 << ideal) == 0 {
                return Err(KernelError::InvalidCombination);
            }
            (ideal, mask)
        }
        c if c >= 0 && (c as usize) < st.config.cores => {
            if mask & (1 << c) == 0 {
                return Err(KernelError::InvalidCombination);
            }
            (c as usize, mask)
        }
        _ => return Err(KernelError::InvalidCoreId),
    };
    if mask == 0 {
        return Err(KernelError::InvalidCombination);
    }
    if mask & !process.core_mask != 0 {
        return Err(KernelError::InvalidCoreId);
    }
    let thread = st.thread_mut(tid)?;
    thread.ideal_core = ideal;
    thread.core_mask = mask;
    st.reschedule(tid);
    Ok(())
}

fn read_sync_objects(st: &KernelState, cur: ThreadId, ptr: u32, count: u32) -> Result<Vec<SyncObject>, KernelError> {
    if count > MAX_WAIT_OBJECTS {
        return Err(KernelError::OutOfRange);
    }
    let space = st.space_of(cur)?;
    (0..count)
        .map(|i| {
            let handle = space
                .read::<u32>(ptr.wrapping_add(i * 4))
                .map_err(|_| KernelError::InvalidPointer)?;
            match st.resolve(cur, handle)? {
                KObjectRef::ReadableEvent(id) => Ok(SyncObject::Event(id)),
                KObjectRef::Thread(tid) => Ok(SyncObject::Thread(tid)),
                KObjectRef::ServerSession(id) => Ok(SyncObject::ServerSession(id)),
                KObjectRef::ServerPort(id) => Ok(SyncObject::ServerPort(id)),
                _ => Err(KernelError::InvalidHandle),
            }
        })
        .collect()
}

/// NUL-terminated port name of at most [`MAX_PORT_NAME`] bytes
fn read_port_name(st: &KernelState, pid: ProcessId, ptr: u32) -> Result<String, KernelError> {
    let space = &st.process(pid)?.space;
    let mut name = Vec::with_capacity(MAX_PORT_NAME);
    for i in 0..=MAX_PORT_NAME as u32 {
        let byte = space.read::<u8>(ptr.wrapping_add(i)).map_err(|_| KernelError::InvalidPointer)?;
        if byte == 0 {
            return String::from_utf8(name).map_err(|_| KernelError::NotFound);
        }
        name.push(byte);
    }
    Err(KernelError::OutOfRange)
}

fn output_debug_string(st: &mut KernelState, pid: ProcessId, ptr: u32, len: u32) -> Result<(), KernelError> {
    let process = st.process_mut(pid)?;
    if len > MAX_DEBUG_STRING {
        warn!("[{}] debug string of {len} bytes cut to {MAX_DEBUG_STRING}", process.name);
    }
    let mut bytes = vec![0u8; len.min(MAX_DEBUG_STRING) as usize];
    process.space.read_bytes(ptr, &mut bytes).map_err(|_| KernelError::InvalidPointer)?;
    let text = String::from_utf8_lossy(&bytes);
    info!("[{}] {}", process.name, text.trim_end());
    process.debug_output.push_str(&text);
    Ok(())
}
