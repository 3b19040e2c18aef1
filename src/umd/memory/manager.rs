//! Allocation bookkeeping.
//!
//! The reserved address window is cut into equally sized shards. Each shard
//! owns an [`Aperture`] for placement and a `base -> record` index for lookup,
//! each behind its own lock, so threads working on different shards never
//! contend. A pointer finds its shard by arithmetic and its allocation with a
//! `range(..=ptr)` probe.
//!
//! Every record carries an in-flight counter. It is only incremented under the
//! shard's read lock and `free` only removes under the write lock after
//! observing zero, so a batch can never be submitted against freed memory.

#![allow(clippy::cast_possible_truncation)]

use super::aperture::Aperture;
use super::residency::ResidencyMask;
use super::{
    AddressRange, Allocation, AllocationId, ApertureAllocator, HeapUsage, MemoryKind,
    MemoryProperties,
};
use crate::config::DriverConfig;
use crate::error::{UmdError, UmdResult};
use crate::handle::ScopedHandle;
use crate::kmd::shm::{self, Mapping, Reservation, SharedMemory};
use crate::umd::DeviceId;
use crate::utils::{align_up, page_size};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// Names an exported object in the exporting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ImportKey {
    pub pid: u32,
    pub object_id: u64,
}

/// Everything an IPC handle needs to describe an exported allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExportedMemory {
    pub fd: RawFd,
    pub inode: u64,
    pub id: AllocationId,
    pub size: u64,
    pub alignment: u64,
    pub kind: MemoryKind,
}

/// A recorded reference to an allocation, checked again at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct AllocRef {
    pub base: u64,
    pub id: AllocationId,
}

#[derive(Debug)]
pub(crate) struct AllocationRecord {
    pub info: Allocation,
    pub mapping: ScopedHandle<Mapping>,
    pub residency: ResidencyMask,
    in_flight: AtomicU32,
    exports: AtomicU32,
    imports: AtomicU32,
    origin: Option<ImportKey>,
}

impl AllocationRecord {
    pub fn alloc_ref(&self) -> AllocRef {
        AllocRef {
            base: self.info.base,
            id: self.info.id,
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Shard {
    reservation: Arc<Reservation>,
    aperture: Mutex<Aperture>,
    index: RwLock<BTreeMap<u64, Arc<AllocationRecord>>>,
}

#[derive(Debug)]
struct Heap {
    capacity: u64,
    used: AtomicU64,
    count: AtomicU64,
}

impl Heap {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn reserve(&self, size: u64) -> bool {
        let ok = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|n| *n <= self.capacity)
            })
            .is_ok();
        if ok {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    fn release(&self, size: u64) {
        self.used.fetch_sub(size, Ordering::AcqRel);
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct MemoryManager {
    context: u64,
    window_base: u64,
    shard_span: u64,
    shards: Vec<Arc<Shard>>,
    cursor: AtomicUsize,
    heaps: [Heap; 3],
    max_alignment: u64,
    device_count: usize,
    page: u64,
    // object id -> base of the exported allocation
    exported: Mutex<HashMap<u64, u64>>,
    // exporter object -> base of the local mapping; also serializes imports
    imported: Mutex<HashMap<ImportKey, u64>>,
}

impl MemoryManager {
    pub fn new(config: &DriverConfig, device_count: usize, context: u64) -> UmdResult<Self> {
        let page = page_size() as u64;
        let shard_count = config.allocation_shards.max(1);
        let shard_span = (config.va_window_size / shard_count as u64) & !(page - 1);
        if shard_span < 2 * page {
            return Err(UmdError::invalid_arg(format!(
                "VA window of {} bytes is too small for {shard_count} shards",
                config.va_window_size
            )));
        }

        let reservation = Arc::new(Reservation::new((shard_span * shard_count as u64) as usize)?);
        let window_base = reservation.base();

        let shards = (0..shard_count as u64)
            .map(|i| {
                let base = window_base + i * shard_span;
                Arc::new(Shard {
                    reservation: reservation.clone(),
                    aperture: Mutex::new(Aperture::new(base, base + shard_span, page, page)),
                    index: RwLock::new(BTreeMap::new()),
                })
            })
            .collect();

        debug!(
            context,
            window = format_args!("0x{window_base:x}"),
            shards = shard_count,
            span = shard_span,
            "memory manager ready"
        );

        Ok(Self {
            context,
            window_base,
            shard_span,
            shards,
            cursor: AtomicUsize::new(0),
            heaps: [
                Heap::new(config.host_heap_size),
                Heap::new(config.device_heap_size),
                Heap::new(config.shared_heap_size),
            ],
            max_alignment: config.max_alignment,
            device_count,
            page,
            exported: Mutex::new(HashMap::new()),
            imported: Mutex::new(HashMap::new()),
        })
    }

    fn shard_of(&self, ptr: u64) -> Option<&Arc<Shard>> {
        let offset = ptr.checked_sub(self.window_base)?;
        self.shards.get((offset / self.shard_span) as usize)
    }

    fn check_device(&self, device: DeviceId) -> UmdResult<()> {
        if device.index() < self.device_count {
            Ok(())
        } else {
            Err(UmdError::invalid_arg(format!("unknown device {device:?}")))
        }
    }

    // ===========================================================================================
    // Allocate / free
    // ===========================================================================================

    pub fn allocate(
        &self,
        kind: MemoryKind,
        size: u64,
        alignment: u64,
        device: Option<DeviceId>,
    ) -> UmdResult<Allocation> {
        if size == 0 {
            return Err(UmdError::invalid_arg("allocation size must be non-zero"));
        }
        let alignment = if alignment == 0 { self.page } else { alignment };
        if !alignment.is_power_of_two() || alignment > self.max_alignment {
            return Err(UmdError::invalid_arg(format!(
                "alignment {alignment} must be a power of two no larger than {}",
                self.max_alignment
            )));
        }
        if let Some(d) = device {
            self.check_device(d)?;
        }
        let device = match kind {
            MemoryKind::Device => Some(device.unwrap_or(DeviceId(0))),
            _ => device,
        };

        let heap = &self.heaps[kind.index()];
        if !heap.reserve(size) {
            debug!(?kind, size, "heap exhausted");
            return Err(UmdError::OutOfMemory);
        }

        let map_len = align_up(size, self.page);
        let placed = SharedMemory::create(memfd_name(kind), map_len as usize)
            .map_err(|e| {
                warn!(?kind, size, "backing object creation failed: {e}");
                UmdError::OutOfMemory
            })
            .and_then(|memory| {
                self.insert_mapping(memory, kind, size, alignment, device, None)
            });

        match placed {
            Ok(record) => {
                debug!(
                    id = record.info.id.0,
                    ?kind,
                    size,
                    base = format_args!("0x{:x}", record.info.base),
                    "allocated"
                );
                Ok(record.info.clone())
            }
            Err(e) => {
                heap.release(size);
                Err(e)
            }
        }
    }

    /// Places `memory` in the window and indexes it.
    fn insert_mapping(
        &self,
        memory: SharedMemory,
        kind: MemoryKind,
        size: u64,
        alignment: u64,
        device: Option<DeviceId>,
        origin: Option<ImportKey>,
    ) -> UmdResult<Arc<AllocationRecord>> {
        let map_len = align_up(size, self.page);
        let (shard, addr) = self.reserve_va(map_len, alignment).ok_or_else(|| {
            debug!(size, alignment, "VA window exhausted");
            UmdError::OutOfMemory
        })?;

        if let Err(e) = memory.map_fixed(addr, map_len as usize) {
            shard.aperture.lock().free_va(addr);
            warn!(addr = format_args!("0x{addr:x}"), "mapping backing object failed: {e}");
            return Err(UmdError::OutOfMemory);
        }

        let mapping = {
            let shard = shard.clone();
            ScopedHandle::new(
                Mapping {
                    addr,
                    len: map_len as usize,
                    memory,
                },
                move |m| match shard.reservation.release(m.addr, m.len) {
                    Ok(()) => shard.aperture.lock().free_va(m.addr),
                    // Leave the range out of the aperture rather than hand out a live mapping again.
                    Err(e) => warn!(addr = format_args!("0x{:x}", m.addr), "unmapping allocation failed: {e}"),
                },
            )
        };

        let record = Arc::new(AllocationRecord {
            info: Allocation {
                base: addr,
                size,
                alignment,
                kind,
                id: AllocationId(NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed)),
                device,
                context: self.context,
                imported: origin.is_some(),
            },
            mapping,
            residency: ResidencyMask::for_kind(kind, device, self.device_count),
            in_flight: AtomicU32::new(0),
            exports: AtomicU32::new(0),
            imports: AtomicU32::new(u32::from(origin.is_some())),
            origin,
        });

        shard.index.write().insert(addr, record.clone());
        Ok(record)
    }

    fn reserve_va(&self, len: u64, alignment: u64) -> Option<(Arc<Shard>, u64)> {
        let n = self.shards.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..n).find_map(|i| {
            let shard = &self.shards[(start + i) % n];
            let addr = shard.aperture.lock().allocate_va(len, alignment)?;
            Some((shard.clone(), addr))
        })
    }

    pub fn free(&self, ptr: u64) -> UmdResult<()> {
        let shard = self
            .shard_of(ptr)
            .ok_or_else(|| UmdError::invalid_arg(format!("0x{ptr:x} is not a driver allocation")))?;

        let record = {
            let mut index = shard.index.write();
            let record = index
                .get(&ptr)
                .ok_or_else(|| UmdError::invalid_arg(format!("0x{ptr:x} is not the base of a live allocation")))?;
            if record.info.imported {
                return Err(UmdError::invalid_arg(
                    "imported allocations are released by closing the IPC handle",
                ));
            }
            let in_flight = record.in_flight();
            if in_flight > 0 {
                return Err(UmdError::in_use(format!(
                    "allocation 0x{ptr:x} is referenced by {in_flight} outstanding batch(es)"
                )));
            }
            index.remove(&ptr)
        };

        if let Some(record) = record {
            self.exported.lock().remove(&record.info.id.0);
            self.heaps[record.info.kind.index()].release(record.info.size);
            debug!(id = record.info.id.0, base = format_args!("0x{ptr:x}"), "freed");
        }
        Ok(())
    }

    // ===========================================================================================
    // Lookup
    // ===========================================================================================

    pub(crate) fn resolve(&self, ptr: u64) -> UmdResult<Arc<AllocationRecord>> {
        self.shard_of(ptr)
            .and_then(|shard| {
                shard
                    .index
                    .read()
                    .range(..=ptr)
                    .next_back()
                    .filter(|(_, r)| r.info.contains(ptr))
                    .map(|(_, r)| r.clone())
            })
            .ok_or_else(|| UmdError::invalid_arg(format!("0x{ptr:x} is not inside a live allocation")))
    }

    /// Resolves `[ptr, ptr + len)`, which must lie inside one allocation.
    pub(crate) fn resolve_range(&self, ptr: u64, len: u64) -> UmdResult<Arc<AllocationRecord>> {
        if len == 0 {
            return Err(UmdError::invalid_arg("range length must be non-zero"));
        }
        let record = self.resolve(ptr)?;
        let end = ptr
            .checked_add(len)
            .ok_or_else(|| UmdError::invalid_arg("range overflows the address space"))?;
        if end > record.info.base + record.info.size {
            return Err(UmdError::invalid_arg(format!(
                "range 0x{ptr:x}+{len} overruns allocation 0x{:x}+{}",
                record.info.base, record.info.size
            )));
        }
        Ok(record)
    }

    fn lookup_base(&self, base: u64) -> Option<Arc<AllocationRecord>> {
        self.shard_of(base)?.index.read().get(&base).cloned()
    }

    pub fn properties(&self, ptr: u64) -> UmdResult<MemoryProperties> {
        let record = self.resolve(ptr)?;
        Ok(MemoryProperties {
            kind: record.info.kind,
            id: record.info.id,
            page_size: self.page,
            device: record.info.device,
        })
    }

    pub fn address_range(&self, ptr: u64) -> UmdResult<AddressRange> {
        let record = self.resolve(ptr)?;
        Ok(AddressRange {
            base: record.info.base,
            size: record.info.size,
        })
    }

    // ===========================================================================================
    // Residency
    // ===========================================================================================

    pub fn make_resident(&self, device: DeviceId, ptr: u64) -> UmdResult<()> {
        self.check_device(device)?;
        self.resolve(ptr)?.residency.make_resident(device);
        Ok(())
    }

    pub fn evict(&self, device: DeviceId, ptr: u64) -> UmdResult<()> {
        self.check_device(device)?;
        self.resolve(ptr)?.residency.evict(device);
        Ok(())
    }

    pub fn is_resident(&self, device: DeviceId, ptr: u64) -> UmdResult<bool> {
        self.check_device(device)?;
        Ok(self.resolve(ptr)?.residency.is_resident(device))
    }

    // ===========================================================================================
    // Submission references
    // ===========================================================================================

    /// Pins every referenced allocation for a batch running on `device`.
    ///
    /// Fails without pinning anything if a reference went stale or is not
    /// resident on `device`.
    pub(crate) fn acquire(
        &self,
        refs: &[AllocRef],
        device: DeviceId,
    ) -> UmdResult<Vec<Arc<AllocationRecord>>> {
        let mut pinned: Vec<Arc<AllocationRecord>> = Vec::with_capacity(refs.len());

        let result = refs.iter().try_for_each(|r| {
            let shard = self
                .shard_of(r.base)
                .ok_or_else(|| UmdError::invalid_arg(format!("0x{:x} is not a driver allocation", r.base)))?;
            let index = shard.index.read();
            let record = index
                .get(&r.base)
                .filter(|rec| rec.info.id == r.id)
                .ok_or_else(|| UmdError::stale("allocation", format_args!("0x{:x}", r.base)))?;
            if !record.residency.is_resident(device) {
                return Err(UmdError::invalid_state(format!(
                    "allocation 0x{:x} is not resident on {device:?}",
                    r.base
                )));
            }
            record.in_flight.fetch_add(1, Ordering::AcqRel);
            pinned.push(record.clone());
            Ok(())
        });

        match result {
            Ok(()) => Ok(pinned),
            Err(e) => {
                for record in &pinned {
                    record.release();
                }
                Err(e)
            }
        }
    }

    // ===========================================================================================
    // Host access
    // ===========================================================================================

    fn host_range(&self, ptr: u64, len: u64) -> UmdResult<Arc<AllocationRecord>> {
        let record = self.resolve_range(ptr, len)?;
        if !record.info.kind.host_accessible() {
            return Err(UmdError::invalid_arg("device memory is not host-accessible"));
        }
        Ok(record)
    }

    pub fn read(&self, ptr: u64, len: u64) -> UmdResult<Vec<u8>> {
        let _record = self.host_range(ptr, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: the range was validated against a live mapping held by `_record`.
        unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(out)
    }

    pub fn write(&self, ptr: u64, data: &[u8]) -> UmdResult<()> {
        let _record = self.host_range(ptr, data.len() as u64)?;
        // SAFETY: as in `read`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len()) };
        Ok(())
    }

    // ===========================================================================================
    // Statistics
    // ===========================================================================================

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.shards.iter().map(|s| s.index.read().len()).sum()
    }

    #[must_use]
    pub fn usage(&self, kind: MemoryKind) -> HeapUsage {
        let heap = &self.heaps[kind.index()];
        HeapUsage {
            capacity: heap.capacity,
            used: heap.used.load(Ordering::Acquire),
            allocations: heap.count.load(Ordering::Relaxed),
        }
    }

    // ===========================================================================================
    // Sharing
    // ===========================================================================================

    pub(crate) fn export(&self, ptr: u64) -> UmdResult<ExportedMemory> {
        let record = self
            .lookup_base(ptr)
            .ok_or_else(|| UmdError::invalid_arg(format!("0x{ptr:x} is not the base of a live allocation")))?;
        if record.info.imported {
            return Err(UmdError::invalid_arg("imported allocations cannot be re-exported"));
        }

        record.exports.fetch_add(1, Ordering::AcqRel);
        self.exported.lock().insert(record.info.id.0, ptr);

        let memory = &record.mapping.memory;
        Ok(ExportedMemory {
            fd: memory.raw_fd(),
            inode: memory.inode(),
            id: record.info.id,
            size: record.info.size,
            alignment: record.info.alignment,
            kind: record.info.kind,
        })
    }

    pub(crate) fn put_export(&self, object_id: u64) -> UmdResult<()> {
        let mut exported = self.exported.lock();
        let base = *exported
            .get(&object_id)
            .ok_or_else(|| UmdError::invalid_arg(format!("allocation {object_id} has no outstanding export")))?;
        let Some(record) = self.lookup_base(base) else {
            exported.remove(&object_id);
            return Err(UmdError::stale("allocation", format_args!("0x{base:x}")));
        };
        if record.exports.fetch_sub(1, Ordering::AcqRel) <= 1 {
            record.exports.store(0, Ordering::Release);
            exported.remove(&object_id);
        }
        Ok(())
    }

    #[must_use]
    pub(crate) fn export_count(&self, ptr: u64) -> u32 {
        self.lookup_base(ptr)
            .map_or(0, |r| r.exports.load(Ordering::Acquire))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn import(
        &self,
        key: ImportKey,
        fd: RawFd,
        inode: u64,
        kind: MemoryKind,
        size: u64,
        alignment: u64,
        device: Option<DeviceId>,
    ) -> UmdResult<Allocation> {
        if let Some(d) = device {
            self.check_device(d)?;
        }
        let mut imported = self.imported.lock();

        if let Some(record) = imported.get(&key).and_then(|base| self.lookup_base(*base)) {
            record.imports.fetch_add(1, Ordering::AcqRel);
            return Ok(record.info.clone());
        }

        let fd = shm::duplicate_fd(key.pid, fd).map_err(|e| {
            UmdError::NotAvailable(format!("cannot duplicate descriptor from pid {}: {e}", key.pid))
        })?;
        let memory = SharedMemory::adopt(fd, inode)
            .map_err(|e| UmdError::NotAvailable(format!("exported object is gone: {e}")))?;
        if (memory.len() as u64) < size {
            return Err(UmdError::NotAvailable("exported object is smaller than advertised".into()));
        }

        let alignment = if alignment.is_power_of_two() && alignment <= self.max_alignment {
            alignment
        } else {
            self.page
        };
        let device = match kind {
            MemoryKind::Device => Some(device.unwrap_or(DeviceId(0))),
            _ => device,
        };

        let record = self.insert_mapping(memory, kind, size, alignment, device, Some(key))?;
        imported.insert(key, record.info.base);
        debug!(
            pid = key.pid,
            object = key.object_id,
            base = format_args!("0x{:x}", record.info.base),
            "imported allocation"
        );
        Ok(record.info.clone())
    }

    pub(crate) fn close_import(&self, ptr: u64) -> UmdResult<()> {
        let mut imported = self.imported.lock();
        let shard = self
            .shard_of(ptr)
            .ok_or_else(|| UmdError::invalid_arg(format!("0x{ptr:x} is not a driver allocation")))?;

        let mut index = shard.index.write();
        let record = index
            .get(&ptr)
            .filter(|r| r.info.imported)
            .ok_or_else(|| UmdError::invalid_arg(format!("0x{ptr:x} is not an imported allocation")))?;

        if record.imports.load(Ordering::Acquire) > 1 {
            record.imports.fetch_sub(1, Ordering::AcqRel);
            return Ok(());
        }
        if record.in_flight() > 0 {
            return Err(UmdError::in_use(format!(
                "imported allocation 0x{ptr:x} is referenced by an outstanding batch"
            )));
        }

        if let Some(record) = index.remove(&ptr) {
            if let Some(key) = record.origin {
                imported.remove(&key);
            }
            debug!(base = format_args!("0x{ptr:x}"), "closed imported allocation");
        }
        Ok(())
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        // Records hold their shard through the unmap callback; break the cycle.
        for shard in &self.shards {
            shard.index.write().clear();
        }
    }
}

const fn memfd_name(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::Host => "npu-umd-host",
        MemoryKind::Device => "npu-umd-device",
        MemoryKind::Shared => "npu-umd-shared",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MemoryManager {
        MemoryManager::new(&DriverConfig::compact(), 2, 1).unwrap()
    }

    #[test]
    fn rejects_bad_arguments() {
        let mm = manager();
        assert!(matches!(
            mm.allocate(MemoryKind::Host, 0, 0, None),
            Err(UmdError::InvalidArgument(_))
        ));
        assert!(matches!(
            mm.allocate(MemoryKind::Host, 64, 48, None),
            Err(UmdError::InvalidArgument(_))
        ));
        assert!(matches!(
            mm.allocate(MemoryKind::Host, 64, 1 << 30, None),
            Err(UmdError::InvalidArgument(_))
        ));
        assert!(matches!(
            mm.allocate(MemoryKind::Device, 64, 0, Some(DeviceId(9))),
            Err(UmdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn heap_capacity_is_enforced() {
        let cfg = DriverConfig::compact().with_device_heap(16 * 1024);
        let mm = MemoryManager::new(&cfg, 1, 1).unwrap();
        let a = mm.allocate(MemoryKind::Device, 12 * 1024, 0, None).unwrap();
        assert!(matches!(
            mm.allocate(MemoryKind::Device, 8 * 1024, 0, None),
            Err(UmdError::OutOfMemory)
        ));
        mm.free(a.base).unwrap();
        mm.allocate(MemoryKind::Device, 8 * 1024, 0, None).unwrap();
        assert_eq!(mm.usage(MemoryKind::Device).used, 8 * 1024);
    }

    #[test]
    fn alignment_is_honoured() {
        let mm = manager();
        let a = mm.allocate(MemoryKind::Shared, 100, 1 << 21, None).unwrap();
        assert_eq!(a.base % (1 << 21), 0);
        assert_eq!(a.alignment, 1 << 21);
    }

    #[test]
    fn interior_pointers_resolve() {
        let mm = manager();
        let a = mm.allocate(MemoryKind::Host, 3000, 0, None).unwrap();
        for off in [0, 1, 1500, 2999] {
            let range = mm.address_range(a.base + off).unwrap();
            assert_eq!(range, AddressRange { base: a.base, size: 3000 });
        }
        assert!(mm.properties(a.base + 3000).is_err());
        assert!(mm.properties(a.base - 1).is_err());
    }

    #[test]
    fn free_requires_base_pointer() {
        let mm = manager();
        let a = mm.allocate(MemoryKind::Host, 4096, 0, None).unwrap();
        assert!(matches!(mm.free(a.base + 8), Err(UmdError::InvalidArgument(_))));
        mm.free(a.base).unwrap();
        assert!(matches!(mm.free(a.base), Err(UmdError::InvalidArgument(_))));
        assert_eq!(mm.live_allocations(), 0);
    }

    #[test]
    fn pinned_allocation_cannot_be_freed() {
        let mm = manager();
        let a = mm.allocate(MemoryKind::Device, 8192, 0, Some(DeviceId(0))).unwrap();
        let r = mm.resolve(a.base).unwrap().alloc_ref();

        let pinned = mm.acquire(&[r], DeviceId(0)).unwrap();
        assert!(matches!(mm.free(a.base), Err(UmdError::HandleInUse(_))));
        for rec in &pinned {
            rec.release();
        }
        mm.free(a.base).unwrap();
        assert!(matches!(mm.acquire(&[r], DeviceId(0)), Err(UmdError::InvalidArgument(_))));
    }

    #[test]
    fn acquire_checks_residency_and_rolls_back() {
        let mm = manager();
        let ok = mm.allocate(MemoryKind::Device, 4096, 0, Some(DeviceId(1))).unwrap();
        let other = mm.allocate(MemoryKind::Device, 4096, 0, Some(DeviceId(0))).unwrap();
        let refs = [
            mm.resolve(other.base).unwrap().alloc_ref(),
            mm.resolve(ok.base).unwrap().alloc_ref(),
        ];

        assert!(matches!(mm.acquire(&refs, DeviceId(0)), Err(UmdError::InvalidState(_))));
        assert_eq!(mm.resolve(other.base).unwrap().in_flight(), 0);

        mm.make_resident(DeviceId(0), ok.base).unwrap();
        let pinned = mm.acquire(&refs, DeviceId(0)).unwrap();
        assert_eq!(pinned.len(), 2);
        pinned.iter().for_each(|r| r.release());
    }

    #[test]
    fn host_access_round_trips() {
        let mm = manager();
        let a = mm.allocate(MemoryKind::Shared, 64, 0, None).unwrap();
        mm.write(a.base + 4, &[1, 2, 3]).unwrap();
        assert_eq!(mm.read(a.base + 4, 3).unwrap(), vec![1, 2, 3]);
        assert!(mm.read(a.base + 60, 8).is_err());

        let d = mm.allocate(MemoryKind::Device, 64, 0, None).unwrap();
        assert!(matches!(mm.read(d.base, 1), Err(UmdError::InvalidArgument(_))));
    }

    #[test]
    fn freed_va_is_reused() {
        let cfg = DriverConfig::compact().with_shards(1);
        let mm = MemoryManager::new(&cfg, 1, 1).unwrap();
        let a = mm.allocate(MemoryKind::Host, 4096, 0, None).unwrap();
        mm.free(a.base).unwrap();
        let b = mm.allocate(MemoryKind::Host, 4096, 0, None).unwrap();
        assert_eq!(a.base, b.base);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn import_in_process_shares_bytes() {
        let exporter = manager();
        let importer = MemoryManager::new(&DriverConfig::compact(), 2, 2).unwrap();

        let a = exporter.allocate(MemoryKind::Shared, 256, 0, None).unwrap();
        exporter.write(a.base, b"hello").unwrap();
        let exp = exporter.export(a.base).unwrap();
        let key = ImportKey {
            pid: std::process::id(),
            object_id: exp.id.0,
        };

        let b = importer
            .import(key, exp.fd, exp.inode, exp.kind, exp.size, exp.alignment, None)
            .unwrap();
        assert!(b.imported);
        assert_eq!(b.size, 256);
        assert_eq!(importer.read(b.base, 5).unwrap(), b"hello");

        let again = importer
            .import(key, exp.fd, exp.inode, exp.kind, exp.size, exp.alignment, None)
            .unwrap();
        assert_eq!(again.base, b.base);

        assert!(matches!(importer.free(b.base), Err(UmdError::InvalidArgument(_))));
        importer.close_import(b.base).unwrap();
        importer.close_import(b.base).unwrap();
        assert_eq!(importer.live_allocations(), 0);

        exporter.put_export(exp.id.0).unwrap();
        assert_eq!(exporter.export_count(a.base), 0);
        assert_eq!(exporter.read(a.base, 5).unwrap(), b"hello");
    }

    #[test]
    fn import_of_wrong_inode_is_not_available() {
        let exporter = manager();
        let importer = manager();
        let a = exporter.allocate(MemoryKind::Host, 64, 0, None).unwrap();
        let exp = exporter.export(a.base).unwrap();
        let key = ImportKey {
            pid: std::process::id(),
            object_id: exp.id.0,
        };
        assert!(matches!(
            importer.import(key, exp.fd, exp.inode ^ 1, exp.kind, exp.size, exp.alignment, None),
            Err(UmdError::NotAvailable(_))
        ));
    }
}
