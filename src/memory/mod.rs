//! Guest virtual memory
//!
//! Page-granular address spaces with per-region permission, attribute and
//! state tracking. Every guest load/store, instruction fetch and kernel
//! marshalling copy goes through here.
//!
//! Layout of a guest process (all 4 KiB pages):
//! 0x0000_1000 - 0x3FFF_FFFF: code, data and stacks placed by the loader
//! 0x4000_0000 - 0x4FFF_FFFF: heap (SetHeapSize)
//! 0x5000_0000 - 0x5FFF_FFFF: alias region (MapMemory)
//! 0x7000_0000 - 0x7001_FFFF: thread-local regions (0x200 bytes per thread)

mod address_space;
mod backing;
mod span;
mod tlb;

pub use address_space::{AddressSpace, CodeWriteObserver, MemoryInfo};
pub use backing::Backing;
pub use span::Span;
pub use tlb::{MemoryAccessor, Tlb};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Lowest mappable guest address (page 0 stays unmapped to catch null derefs)
pub const ADDRESS_SPACE_START: u32 = 0x0000_1000;
/// Exclusive end of the mappable guest range
pub const ADDRESS_SPACE_END: u32 = 0xFFFF_F000;

pub const HEAP_BASE: u32 = 0x4000_0000;
pub const HEAP_MAX_SIZE: u32 = 0x1000_0000;
pub const ALIAS_BASE: u32 = 0x5000_0000;
pub const ALIAS_SIZE: u32 = 0x1000_0000;
pub const TLS_BASE: u32 = 0x7000_0000;
pub const TLS_AREA_SIZE: u32 = 0x0002_0000;

bitflags! {
    /// Guest page permission
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryPermission: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl MemoryPermission {
    pub const NONE: MemoryPermission = MemoryPermission::empty();
}

bitflags! {
    /// Guest page attribute flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryAttribute: u32 {
        const LOCKED = 1 << 0;
        const IPC_LOCKED = 1 << 1;
        const DEVICE_SHARED = 1 << 2;
        const UNCACHED = 1 << 3;
    }
}

/// What a mapped range is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MemoryState {
    Free = 0x00,
    Io = 0x01,
    Static = 0x02,
    Code = 0x03,
    CodeData = 0x04,
    Normal = 0x05,
    Shared = 0x06,
    Alias = 0x07,
    Heap = 0x08,
    Ipc = 0x0A,
    Stack = 0x0B,
    ThreadLocal = 0x0C,
    Inaccessible = 0x10,
}

/// Kind of guest access, used for permission checks and fault reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

impl AccessKind {
    #[inline(always)]
    pub fn required(self) -> MemoryPermission {
        match self {
            AccessKind::Fetch => MemoryPermission::EXECUTE,
            AccessKind::Load => MemoryPermission::READ,
            AccessKind::Store => MemoryPermission::WRITE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("invalid access at {0:#010x}")]
    InvalidAccess(u32),
    #[error("permission violation at {0:#010x}")]
    InvalidPermission(u32),
    #[error("invalid memory state")]
    InvalidMemoryState,
    #[error("misaligned address {0:#010x}")]
    InvalidAddress(u32),
    #[error("invalid size")]
    InvalidSize,
    #[error("address range exhausted")]
    OutOfMemory,
}

/// Memory interface the CPU core executes against
///
/// Implemented by [`MemoryAccessor`]; the translator, the compiled block
/// runtime and the interpreter are generic over it.
pub trait Bus {
    fn fetch16(&mut self, addr: u32) -> Result<u16, MemoryError>;
    fn read8(&mut self, addr: u32) -> Result<u8, MemoryError>;
    fn read16(&mut self, addr: u32) -> Result<u16, MemoryError>;
    fn read32(&mut self, addr: u32) -> Result<u32, MemoryError>;
    fn write8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError>;
    fn write16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError>;
    fn write32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError>;

    /// Atomically replace the aligned word at `addr` if it still holds
    /// `expected`. Returns the previous value either way.
    fn compare_exchange32(&mut self, addr: u32, expected: u32, new: u32)
        -> Result<Result<u32, u32>, MemoryError>;

    fn fetch32(&mut self, addr: u32) -> Result<u32, MemoryError> {
        let lo = self.fetch16(addr)? as u32;
        let hi = self.fetch16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    /// Guest-visible time counter (the `time` CSR)
    fn ticks(&self) -> u64 {
        0
    }
}

/// Values that can be read or written as a unit
pub trait GuestValue: Copy {
    const SIZE: usize;
    fn from_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! guest_value {
    ($($t:ty),*) => {$(
        impl GuestValue for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline(always)]
            fn from_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$t>::from_le_bytes(raw)
            }

            #[inline(always)]
            fn write_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

guest_value!(u8, u16, u32, u64, i8, i16, i32, i64);

#[inline(always)]
pub fn page_align_down(addr: u32) -> u32 {
    addr & !PAGE_MASK
}

#[inline(always)]
pub fn is_page_aligned(value: u32) -> bool {
    value & PAGE_MASK == 0
}
