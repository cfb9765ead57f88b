//! Guest-visible result codes
//!
//! A result is a packed u32: module in bits 0-8, description in bits 9-21.
//! Every kernel failure a guest can trigger is reported this way, never as a
//! host error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::MemoryError;

/// Module number of kernel results
pub const MODULE_KERNEL: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);

    pub const fn new(module: u32, description: u32) -> Self {
        ResultCode((module & 0x1FF) | ((description & 0x1FFF) << 9))
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn module(self) -> u32 {
        self.0 & 0x1FF
    }

    pub fn description(self) -> u32 {
        (self.0 >> 9) & 0x1FFF
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x} ({}-{})", self.0, 2000 + self.module(), self.description())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum KernelError {
    #[error("session count exceeded")]
    SessionCountExceeded,
    #[error("invalid size")]
    InvalidSize,
    #[error("invalid address")]
    InvalidAddress,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of handles")]
    OutOfHandles,
    #[error("invalid current memory state")]
    InvalidCurrentMemory,
    #[error("invalid new memory permission")]
    InvalidNewMemoryPermission,
    #[error("invalid memory region")]
    InvalidMemoryRegion,
    #[error("invalid priority")]
    InvalidPriority,
    #[error("invalid core id")]
    InvalidCoreId,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid pointer")]
    InvalidPointer,
    #[error("invalid combination")]
    InvalidCombination,
    #[error("timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
    #[error("out of range")]
    OutOfRange,
    #[error("invalid enum value")]
    InvalidEnumValue,
    #[error("not found")]
    NotFound,
    #[error("busy")]
    Busy,
    #[error("session closed")]
    SessionClosed,
    #[error("invalid state")]
    InvalidState,
    #[error("not implemented")]
    NotImplemented,
    #[error("resource limit exceeded")]
    ResourceLimitExceeded,
    #[error("message too large")]
    MessageTooLarge,
}

impl KernelError {
    pub fn description(self) -> u32 {
        match self {
            KernelError::SessionCountExceeded => 7,
            KernelError::InvalidSize => 101,
            KernelError::InvalidAddress => 102,
            KernelError::OutOfMemory => 104,
            KernelError::OutOfHandles => 105,
            KernelError::InvalidCurrentMemory => 106,
            KernelError::InvalidNewMemoryPermission => 108,
            KernelError::InvalidMemoryRegion => 110,
            KernelError::InvalidPriority => 112,
            KernelError::InvalidCoreId => 113,
            KernelError::InvalidHandle => 114,
            KernelError::InvalidPointer => 115,
            KernelError::InvalidCombination => 116,
            KernelError::TimedOut => 117,
            KernelError::Cancelled => 118,
            KernelError::OutOfRange => 119,
            KernelError::InvalidEnumValue => 120,
            KernelError::NotFound => 121,
            KernelError::Busy => 122,
            KernelError::SessionClosed => 123,
            KernelError::InvalidState => 125,
            KernelError::NotImplemented => 127,
            KernelError::ResourceLimitExceeded => 132,
            KernelError::MessageTooLarge => 260,
        }
    }

    pub fn code(self) -> ResultCode {
        ResultCode::new(MODULE_KERNEL, self.description())
    }
}

impl From<KernelError> for ResultCode {
    fn from(err: KernelError) -> Self {
        err.code()
    }
}

/// Memory manager failures caused by SVC arguments
impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::InvalidAccess(_) => KernelError::InvalidCurrentMemory,
            MemoryError::InvalidPermission(_) => KernelError::InvalidNewMemoryPermission,
            MemoryError::InvalidMemoryState => KernelError::InvalidMemoryRegion,
            MemoryError::InvalidAddress(_) => KernelError::InvalidAddress,
            MemoryError::InvalidSize => KernelError::InvalidSize,
            MemoryError::OutOfMemory => KernelError::OutOfMemory,
        }
    }
}

/// Result register value for an SVC outcome
pub fn to_raw(result: Result<(), KernelError>) -> u32 {
    match result {
        Ok(()) => ResultCode::SUCCESS.raw(),
        Err(err) => err.code().raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing() {
        let rc = KernelError::InvalidHandle.code();
        assert_eq!(rc.raw(), 0xE401);
        assert_eq!(rc.module(), 1);
        assert_eq!(rc.description(), 114);
        assert_eq!(KernelError::TimedOut.code().raw(), 0xEA01);
        assert_eq!(KernelError::SessionCountExceeded.code().raw(), 0xE01);
        assert!(ResultCode::SUCCESS.is_success());
    }

    #[test]
    fn test_memory_errors_become_results() {
        assert_eq!(KernelError::from(MemoryError::InvalidAccess(0x1000)), KernelError::InvalidCurrentMemory);
        assert_eq!(KernelError::from(MemoryError::InvalidMemoryState), KernelError::InvalidMemoryRegion);
        assert_eq!(to_raw(Err(KernelError::Cancelled)), 0xEC01);
    }
}
