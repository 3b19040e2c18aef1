pub mod aperture;
pub mod manager;
pub mod residency;

use crate::error::UmdResult;
use crate::umd::DeviceId;
use crate::umd::context::Context;

/// Where an allocation lives and who may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Host,
    Device,
    Shared,
}

impl MemoryKind {
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Host => 0,
            Self::Device => 1,
            Self::Shared => 2,
        }
    }

    pub(crate) const fn to_wire(self) -> u8 {
        self.index() as u8 + 1
    }

    pub(crate) const fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Host),
            2 => Some(Self::Device),
            3 => Some(Self::Shared),
            _ => None,
        }
    }

    /// Device memory is not host-accessible.
    #[must_use]
    pub const fn host_accessible(self) -> bool {
        !matches!(self, Self::Device)
    }
}

/// Opaque allocation id, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// A client-visible description of one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub base: u64,
    pub size: u64,
    pub alignment: u64,
    pub kind: MemoryKind,
    pub id: AllocationId,
    pub device: Option<DeviceId>,
    pub context: u64,
    /// Opened from another process' (or context's) export.
    pub imported: bool,
}

impl Allocation {
    #[must_use]
    pub const fn ptr(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub const fn contains(&self, ptr: u64) -> bool {
        ptr >= self.base && ptr < self.base + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProperties {
    pub kind: MemoryKind,
    pub id: AllocationId,
    pub page_size: u64,
    pub device: Option<DeviceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
}

/// Per-kind pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapUsage {
    pub capacity: u64,
    pub used: u64,
    pub allocations: u64,
}

/// Trait for virtual address range allocators.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64>;

    /// Free a previously reserved virtual address range.
    fn free_va(&mut self, addr: u64);

    /// Get the aperture's base and limit.
    fn bounds(&self) -> (u64, u64);
}

pub use manager::MemoryManager;

// ===============================================================================================
// Public API
// ===============================================================================================

impl Context {
    /// Allocates `size` bytes of `kind` memory. An alignment of 0 selects the page size.
    pub fn alloc(
        &self,
        kind: MemoryKind,
        size: u64,
        alignment: u64,
        device: Option<DeviceId>,
    ) -> UmdResult<Allocation> {
        self.api("zeMemAlloc", || self.inner.memory.allocate(kind, size, alignment, device))
    }

    pub fn alloc_host(&self, size: u64, alignment: u64) -> UmdResult<Allocation> {
        self.api("zeMemAllocHost", || {
            self.inner.memory.allocate(MemoryKind::Host, size, alignment, None)
        })
    }

    pub fn alloc_device(&self, device: DeviceId, size: u64, alignment: u64) -> UmdResult<Allocation> {
        self.api("zeMemAllocDevice", || {
            self.inner
                .memory
                .allocate(MemoryKind::Device, size, alignment, Some(device))
        })
    }

    /// Shared memory; without a device hint it is resident everywhere.
    pub fn alloc_shared(
        &self,
        device: Option<DeviceId>,
        size: u64,
        alignment: u64,
    ) -> UmdResult<Allocation> {
        self.api("zeMemAllocShared", || {
            self.inner
                .memory
                .allocate(MemoryKind::Shared, size, alignment, device)
        })
    }

    /// Releases the allocation whose base is `ptr`.
    ///
    /// # Errors
    /// `HandleInUse` while an outstanding batch references it.
    pub fn free(&self, ptr: u64) -> UmdResult<()> {
        self.api("zeMemFree", || self.inner.memory.free(ptr))
    }

    pub fn memory_properties(&self, ptr: u64) -> UmdResult<MemoryProperties> {
        self.api("zeMemGetAllocProperties", || self.inner.memory.properties(ptr))
    }

    pub fn address_range(&self, ptr: u64) -> UmdResult<AddressRange> {
        self.api("zeMemGetAddressRange", || self.inner.memory.address_range(ptr))
    }

    pub fn make_resident(&self, device: DeviceId, ptr: u64) -> UmdResult<()> {
        self.api("zeContextMakeMemoryResident", || {
            self.inner.memory.make_resident(device, ptr)
        })
    }

    pub fn evict(&self, device: DeviceId, ptr: u64) -> UmdResult<()> {
        self.api("zeContextEvictMemory", || self.inner.memory.evict(device, ptr))
    }

    pub fn is_resident(&self, device: DeviceId, ptr: u64) -> UmdResult<bool> {
        self.inner.memory.is_resident(device, ptr)
    }

    /// Copies `len` bytes out of host-accessible memory.
    pub fn read_memory(&self, ptr: u64, len: u64) -> UmdResult<Vec<u8>> {
        self.inner.memory.read(ptr, len)
    }

    pub fn write_memory(&self, ptr: u64, data: &[u8]) -> UmdResult<()> {
        self.inner.memory.write(ptr, data)
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.inner.memory.live_allocations()
    }

    #[must_use]
    pub fn memory_usage(&self, kind: MemoryKind) -> HeapUsage {
        self.inner.memory.usage(kind)
    }
}
