//! Process crash reports
//!
//! When a process dies on a fault the kernel captures every thread's
//! context and the memory map. Reports are bincode-serialized and zstd
//! compressed; they are only meant to be read back by the same build.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::{CpuContext, Trap};
use crate::kernel::{KernelState, ProcessId, ThreadState};
use crate::memory::MemoryInfo;

/// Why a process stopped
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// ExitProcess, or the last thread exited
    Exited,
    /// Unhandled guest exception
    Fault { thread: u64, trap: Trap, pc: u32 },
    /// The block backend failed; an emulator bug rather than a guest one
    Fatal { thread: u64, message: String },
    /// Guest called Break
    Break { reason: u32 },
    /// Terminated from the host
    Killed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Exited => write!(f, "exited"),
            ExitReason::Fault { thread, trap, pc } => write!(f, "thread {thread} faulted: {trap} at {pc:#010x}"),
            ExitReason::Fatal { thread, message } => write!(f, "thread {thread} hit an internal error: {message}"),
            ExitReason::Break { reason } => write!(f, "break {reason:#x}"),
            ExitReason::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub guest_id: u64,
    pub state: ThreadState,
    pub priority: u8,
    /// `None` when the thread was on another core at capture time
    pub ctx: Option<CpuContext>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    /// Snapshot format version
    pub version: u32,
    pub pid: u64,
    pub name: String,
    pub exit: ExitReason,
    pub threads: Vec<ThreadSnapshot>,
    pub regions: Vec<MemoryInfo>,
    pub debug_output: String,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("serialization failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error("deserialization failed: {0}")]
    Decode(#[source] bincode::Error),
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
}

impl ProcessSnapshot {
    pub const VERSION: u32 = 1;

    pub fn capture(state: &KernelState, pid: ProcessId, exit: ExitReason) -> Option<Self> {
        let process = state.processes.get(pid)?;
        let threads = process
            .threads
            .iter()
            .filter_map(|&tid| state.threads.get(tid))
            .map(|t| ThreadSnapshot { guest_id: t.guest_id, state: t.state, priority: t.priority, ctx: t.ctx.clone() })
            .collect();
        Some(ProcessSnapshot {
            version: Self::VERSION,
            pid: process.pid,
            name: process.name.clone(),
            exit,
            threads,
            regions: process.space.regions(),
            debug_output: process.debug_output.clone(),
        })
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let serialized = bincode::serialize(self).map_err(SnapshotError::Encode)?;
        zstd::stream::encode_all(&serialized[..], 3).map_err(SnapshotError::Compress)
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        let decompressed = zstd::stream::decode_all(data).map_err(SnapshotError::Decompress)?;
        let snapshot: ProcessSnapshot = bincode::deserialize(&decompressed).map_err(SnapshotError::Decode)?;
        if snapshot.version != Self::VERSION {
            return Err(SnapshotError::Version(snapshot.version));
        }
        Ok(snapshot)
    }

    /// Thread that caused the exit, if any
    pub fn faulting_thread(&self) -> Option<&ThreadSnapshot> {
        let id = match self.exit {
            ExitReason::Fault { thread, .. } | ExitReason::Fatal { thread, .. } => thread,
            _ => return None,
        };
        self.threads.iter().find(|t| t.guest_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAttribute, MemoryPermission, MemoryState};

    fn sample() -> ProcessSnapshot {
        let mut ctx = CpuContext::new(0x1000, 0x8000, 0x7000_0000);
        ctx.write_reg(10, 42);
        ProcessSnapshot {
            version: ProcessSnapshot::VERSION,
            pid: 0x51,
            name: "guest".into(),
            exit: ExitReason::Fault { thread: 1, trap: Trap::LoadAccessFault(0x10), pc: 0x1004 },
            threads: vec![
                ThreadSnapshot { guest_id: 1, state: ThreadState::Running(0), priority: 44, ctx: Some(ctx) },
                ThreadSnapshot { guest_id: 2, state: ThreadState::Running(1), priority: 44, ctx: None },
            ],
            regions: vec![MemoryInfo {
                base: 0x1000,
                size: 0x1000,
                perm: MemoryPermission::READ_EXECUTE,
                attr: MemoryAttribute::empty(),
                state: MemoryState::Code,
            }],
            debug_output: String::new(),
        }
    }

    #[test]
    fn test_snapshot_bytes_are_compressed_and_restorable() {
        let snapshot = sample();
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x28, 0xB5, 0x2F, 0xFD]);
        assert_eq!(ProcessSnapshot::from_bytes(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_faulting_thread() {
        let snapshot = sample();
        let thread = snapshot.faulting_thread().unwrap();
        assert_eq!(thread.ctx.as_ref().unwrap().read_reg(10), 42);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(ProcessSnapshot::from_bytes(b"nope"), Err(SnapshotError::Decompress(_))));
    }
}
