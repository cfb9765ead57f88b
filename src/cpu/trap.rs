//! Guest exceptions
//!
//! Raised as values from the compiled path and the interpreter alike and
//! parked in `CpuContext::pending_exception` for the kernel to handle.

use serde::{Deserialize, Serialize};

use crate::memory::{AccessKind, MemoryError};

/// Synchronous exception cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trap {
    InstructionAddressMisaligned(u32),
    InstructionAccessFault(u32),
    IllegalInstruction(u32),
    Breakpoint(u32),
    LoadAddressMisaligned(u32),
    LoadAccessFault(u32),
    StoreAddressMisaligned(u32),
    StoreAccessFault(u32),
    EnvironmentCall,
    InstructionPageFault(u32),
    LoadPageFault(u32),
    StorePageFault(u32),
}

impl Trap {
    /// Cause code as it would appear in `ucause`
    pub fn code(&self) -> u32 {
        match self {
            Trap::InstructionAddressMisaligned(_) => 0,
            Trap::InstructionAccessFault(_) => 1,
            Trap::IllegalInstruction(_) => 2,
            Trap::Breakpoint(_) => 3,
            Trap::LoadAddressMisaligned(_) => 4,
            Trap::LoadAccessFault(_) => 5,
            Trap::StoreAddressMisaligned(_) => 6,
            Trap::StoreAccessFault(_) => 7,
            Trap::EnvironmentCall => 8,
            Trap::InstructionPageFault(_) => 12,
            Trap::LoadPageFault(_) => 13,
            Trap::StorePageFault(_) => 15,
        }
    }

    /// Trap value (bad address or instruction bits)
    pub fn value(&self) -> u32 {
        match self {
            Trap::InstructionAddressMisaligned(v)
            | Trap::InstructionAccessFault(v)
            | Trap::IllegalInstruction(v)
            | Trap::Breakpoint(v)
            | Trap::LoadAddressMisaligned(v)
            | Trap::LoadAccessFault(v)
            | Trap::StoreAddressMisaligned(v)
            | Trap::StoreAccessFault(v)
            | Trap::InstructionPageFault(v)
            | Trap::LoadPageFault(v)
            | Trap::StorePageFault(v) => *v,
            Trap::EnvironmentCall => 0,
        }
    }

    /// Map a failed guest memory access onto the exception it raises.
    /// Unmapped addresses page-fault, permission violations access-fault.
    pub fn from_memory(err: MemoryError, kind: AccessKind, addr: u32) -> Self {
        match (err, kind) {
            (MemoryError::InvalidAccess(a), AccessKind::Fetch) => Trap::InstructionPageFault(a),
            (MemoryError::InvalidAccess(a), AccessKind::Load) => Trap::LoadPageFault(a),
            (MemoryError::InvalidAccess(a), AccessKind::Store) => Trap::StorePageFault(a),
            (MemoryError::InvalidAddress(a), AccessKind::Fetch) => Trap::InstructionAddressMisaligned(a),
            (MemoryError::InvalidAddress(a), AccessKind::Load) => Trap::LoadAddressMisaligned(a),
            (MemoryError::InvalidAddress(a), AccessKind::Store) => Trap::StoreAddressMisaligned(a),
            (MemoryError::InvalidPermission(a), kind) => Self::access_fault(kind, a),
            (_, kind) => Self::access_fault(kind, addr),
        }
    }

    fn access_fault(kind: AccessKind, addr: u32) -> Self {
        match kind {
            AccessKind::Fetch => Trap::InstructionAccessFault(addr),
            AccessKind::Load => Trap::LoadAccessFault(addr),
            AccessKind::Store => Trap::StoreAccessFault(addr),
        }
    }

    /// Faults the kernel cannot resolve on the guest's behalf
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Trap::EnvironmentCall)
    }
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (cause {}, tval {:#010x})", self, self.code(), self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_errors_map_to_faults() {
        assert_eq!(
            Trap::from_memory(MemoryError::InvalidAccess(0x40), AccessKind::Load, 0x40),
            Trap::LoadPageFault(0x40)
        );
        assert_eq!(
            Trap::from_memory(MemoryError::InvalidPermission(0x80), AccessKind::Store, 0x80),
            Trap::StoreAccessFault(0x80)
        );
        assert_eq!(
            Trap::from_memory(MemoryError::InvalidAddress(0x3), AccessKind::Fetch, 0x3),
            Trap::InstructionAddressMisaligned(0x3)
        );
        assert_eq!(Trap::StorePageFault(0).code(), 15);
    }
}
