//! Event pools and events.
//!
//! A pool is one shareable memory object holding `capacity` 64-byte
//! [`EventSlot`]s. An event binds one slot. Both the host and the device
//! signal by writing slot memory; host waiters spin briefly and then sleep on
//! the pool's [`SignalNotifier`] in bounded slices, re-reading the slot on
//! every wakeup, so signals written through another process' mapping of the
//! same pool are observed as well.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{UmdError, UmdResult};
use crate::handle::{Arena, Handle, ScopedHandle};
use crate::kmd::shm::{self, Mapping, SharedMemory};
use crate::kmd::{EventSlot, SignalNotifier, SlotRef};
use crate::umd::context::Context;
use crate::umd::memory::manager::ImportKey;
use crate::utils::{align_up, deadline_from_ns, page_size};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Largest pool a client may create.
pub const MAX_POOL_CAPACITY: u32 = 1 << 16;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventPoolFlags: u32 {
        const HOST_VISIBLE = 1 << 0;
        const IPC = 1 << 1;
        const KERNEL_TIMESTAMP = 1 << 2;
        const ALLOW_ALIASING = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPoolDesc {
    pub capacity: u32,
    pub flags: EventPoolFlags,
}

/// Non-blocking state of an event or fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Signaled,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampPair {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelTimestampResult {
    pub global: TimestampPair,
    pub context: TimestampPair,
}

pub type EventPoolHandle = Handle<EventPool>;
pub type EventHandle = Handle<Event>;

// ===============================================================================================
// Pool
// ===============================================================================================

#[derive(Debug)]
pub struct EventPool {
    id: u64,
    capacity: u32,
    flags: EventPoolFlags,
    storage: ScopedHandle<Mapping>,
    notifier: Arc<SignalNotifier>,
    bindings: Mutex<Vec<u32>>,
    live_events: AtomicU32,
    // Set under `bindings` once the pool leaves its arena.
    retired: AtomicBool,
    exports: AtomicU32,
    imports: AtomicU32,
    origin: Option<ImportKey>,
}

impl EventPool {
    fn new(
        memory: SharedMemory,
        capacity: u32,
        flags: EventPoolFlags,
        origin: Option<ImportKey>,
    ) -> UmdResult<Self> {
        let addr = memory.map()?;
        let len = memory.len();
        let storage = ScopedHandle::new(Mapping { addr, len, memory }, |m| shm::unmap(m.addr, m.len));

        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            flags,
            storage,
            notifier: Arc::new(SignalNotifier::default()),
            bindings: Mutex::new(vec![0; capacity as usize]),
            live_events: AtomicU32::new(0),
            retired: AtomicBool::new(false),
            exports: AtomicU32::new(0),
            imports: AtomicU32::new(u32::from(origin.is_some())),
            origin,
        })
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub const fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    #[must_use]
    pub fn live_events(&self) -> u32 {
        self.live_events.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn is_imported(&self) -> bool {
        self.origin.is_some()
    }

    fn slot(&self, index: u32) -> &EventSlot {
        debug_assert!(index < self.capacity);
        let addr = self.storage.addr as usize + index as usize * mem::size_of::<EventSlot>();
        // SAFETY: `storage` maps at least `capacity` slots and lives as long as `self`.
        unsafe { &*(addr as *const EventSlot) }
    }

    pub(crate) fn storage(&self) -> &ScopedHandle<Mapping> {
        &self.storage
    }

    /// Binds slot `index` for a new event.
    fn bind(&self, handle: EventPoolHandle, index: u32) -> UmdResult<()> {
        let mut bindings = self.bindings.lock();
        if self.retired.load(Ordering::Acquire) {
            return Err(UmdError::stale("event pool", handle));
        }
        let bound = &mut bindings[index as usize];
        if *bound > 0 && !self.flags.contains(EventPoolFlags::ALLOW_ALIASING) {
            return Err(UmdError::invalid_arg(format!("slot {index} is already bound")));
        }
        *bound += 1;
        self.live_events.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unbind(&self, index: u32) {
        let mut bindings = self.bindings.lock();
        bindings[index as usize] -= 1;
        self.live_events.fetch_sub(1, Ordering::AcqRel);
    }

    /// Retires the pool unless an event is still bound. Runs as the arena's
    /// removal check, so a retired pool is always removed.
    fn retire_unbound(&self, what: &str) -> UmdResult<()> {
        let _bindings = self.bindings.lock();
        let live = self.live_events();
        if live > 0 {
            return Err(UmdError::in_use(format!("{what} still has {live} live event(s)")));
        }
        self.retired.store(true, Ordering::Release);
        Ok(())
    }
}

fn storage_len(capacity: u32) -> usize {
    align_up(
        u64::from(capacity) * mem::size_of::<EventSlot>() as u64,
        page_size() as u64,
    ) as usize
}

// ===============================================================================================
// Event
// ===============================================================================================

#[derive(Debug)]
pub struct Event {
    handle: EventHandle,
    pool: Arc<EventPool>,
    index: u32,
    pending_signals: AtomicU32,
    in_flight: AtomicU32,
    lost: AtomicBool,
}

impl Event {
    #[must_use]
    pub const fn handle(&self) -> EventHandle {
        self.handle
    }

    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn slot(&self) -> &EventSlot {
        self.pool.slot(self.index)
    }

    pub(crate) fn slot_ref(&self) -> SlotRef {
        // SAFETY: jobs carrying this reference keep `pool.storage` alive.
        unsafe { SlotRef::new(self.slot(), self.pool.notifier.clone()) }
    }

    pub(crate) fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    pub(crate) fn timestamped(&self) -> bool {
        self.pool.flags.contains(EventPoolFlags::KERNEL_TIMESTAMP)
    }

    pub(crate) fn add_in_flight(&self, signals: bool) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if signals {
            self.pending_signals.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Called at batch retirement.
    pub(crate) fn retire(&self, signals: bool, lost: bool) {
        if signals {
            if lost {
                self.lost.store(true, Ordering::Release);
            }
            self.pending_signals.fetch_sub(1, Ordering::AcqRel);
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if lost {
            self.pool.notifier.notify();
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

/// Everything an IPC handle needs to describe an exported pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExportedPool {
    pub fd: RawFd,
    pub inode: u64,
    pub id: u64,
    pub capacity: u32,
    pub flags: EventPoolFlags,
}

#[derive(Debug)]
pub(crate) struct EventRegistry {
    pools: Arena<EventPool>,
    events: Arena<Event>,
    wait_spin: Duration,
    wait_slice: Duration,
    // pool id -> exported pool
    exported: Mutex<HashMap<u64, EventPoolHandle>>,
    // exporter object -> local pool; also serializes imports
    imported: Mutex<HashMap<ImportKey, EventPoolHandle>>,
}

impl EventRegistry {
    pub fn new(wait_spin: Duration, wait_slice: Duration) -> Self {
        Self {
            pools: Arena::new("event pool"),
            events: Arena::new("event"),
            wait_spin,
            wait_slice,
            exported: Mutex::new(HashMap::new()),
            imported: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self, handle: EventPoolHandle) -> UmdResult<Arc<EventPool>> {
        self.pools.get(handle)
    }

    pub fn event(&self, handle: EventHandle) -> UmdResult<Arc<Event>> {
        self.events.get(handle)
    }

    /// Whether `event` is still the live object its handle names.
    pub fn is_live(&self, event: &Arc<Event>) -> bool {
        self.events
            .get(event.handle)
            .is_ok_and(|e| Arc::ptr_eq(&e, event))
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn create_pool(&self, desc: EventPoolDesc) -> UmdResult<EventPoolHandle> {
        if desc.capacity == 0 || desc.capacity > MAX_POOL_CAPACITY {
            return Err(UmdError::invalid_arg(format!(
                "pool capacity {} must be within 1..={MAX_POOL_CAPACITY}",
                desc.capacity
            )));
        }

        let memory = SharedMemory::create("npu-umd-events", storage_len(desc.capacity))
            .map_err(|e| {
                debug!("event pool backing failed: {e}");
                UmdError::OutOfMemory
            })?;
        let pool = EventPool::new(memory, desc.capacity, desc.flags, None)?;
        let id = pool.id;
        let (handle, _) = self.pools.insert_with(|_| pool)?;
        debug!(pool = id, capacity = desc.capacity, flags = ?desc.flags, "event pool created");
        Ok(handle)
    }

    pub fn destroy_pool(&self, handle: EventPoolHandle) -> UmdResult<()> {
        let pool = self.pools.remove_if(handle, |pool| {
            if pool.is_imported() {
                return Err(UmdError::invalid_arg(
                    "imported pools are released by closing the IPC handle",
                ));
            }
            pool.retire_unbound("event pool")
        })?;
        self.exported.lock().remove(&pool.id);
        debug!(pool = pool.id, "event pool destroyed");
        Ok(())
    }

    pub fn create_event(&self, pool_handle: EventPoolHandle, index: u32) -> UmdResult<EventHandle> {
        let pool = self.pools.get(pool_handle)?;
        if index >= pool.capacity {
            return Err(UmdError::invalid_arg(format!(
                "slot {index} is outside a pool of {}",
                pool.capacity
            )));
        }

        pool.bind(pool_handle, index)?;

        // An importer must not clobber state the exporter owns.
        if !pool.is_imported() {
            pool.slot(index).clear();
        }

        let inserted = self.events.insert_with(|handle| Event {
            handle,
            pool: pool.clone(),
            index,
            pending_signals: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            lost: AtomicBool::new(false),
        });
        match inserted {
            Ok((handle, _)) => Ok(handle),
            Err(e) => {
                pool.unbind(index);
                Err(e)
            }
        }
    }

    pub fn destroy_event(&self, handle: EventHandle) -> UmdResult<()> {
        let event = self.events.remove_if(handle, |event| {
            if event.in_flight.load(Ordering::Acquire) > 0 {
                return Err(UmdError::in_use("event is referenced by an outstanding batch"));
            }
            Ok(())
        })?;

        event.pool.unbind(event.index);
        Ok(())
    }

    pub fn host_signal(&self, handle: EventHandle) -> UmdResult<()> {
        let event = self.events.get(handle)?;
        event.slot().signal();
        event.pool.notifier.notify();
        Ok(())
    }

    pub fn host_synchronize(&self, handle: EventHandle, timeout_ns: u64) -> UmdResult<()> {
        let event = self.events.get(handle)?;
        event.pool.notifier.wait_until(
            || event.slot().is_signaled() || event.is_lost(),
            deadline_from_ns(timeout_ns),
            self.wait_spin,
            self.wait_slice,
        );

        if event.slot().is_signaled() {
            Ok(())
        } else if event.is_lost() {
            Err(UmdError::DeviceLost)
        } else {
            Err(UmdError::NotReady)
        }
    }

    pub fn host_reset(&self, handle: EventHandle) -> UmdResult<()> {
        let event = self.events.get(handle)?;
        let pending = event.pending_signals.load(Ordering::Acquire);
        if pending > 0 {
            return Err(UmdError::in_use(format!(
                "{pending} outstanding batch(es) will still signal this event"
            )));
        }
        event.slot().clear();
        event.lost.store(false, Ordering::Release);
        Ok(())
    }

    pub fn query_status(&self, handle: EventHandle) -> UmdResult<SyncStatus> {
        let event = self.events.get(handle)?;
        if event.slot().is_signaled() {
            Ok(SyncStatus::Signaled)
        } else if event.is_lost() {
            Err(UmdError::DeviceLost)
        } else {
            Ok(SyncStatus::Pending)
        }
    }

    pub fn query_kernel_timestamp(&self, handle: EventHandle) -> UmdResult<KernelTimestampResult> {
        let event = self.events.get(handle)?;
        if !event.timestamped() {
            return Err(UmdError::invalid_arg(
                "event pool was not created with KERNEL_TIMESTAMP",
            ));
        }
        let slot = event.slot();
        if !slot.is_signaled() {
            return Err(UmdError::NotReady);
        }
        Ok(KernelTimestampResult {
            global: TimestampPair {
                start: slot.global_start.load(Ordering::Relaxed),
                end: slot.global_end.load(Ordering::Relaxed),
            },
            context: TimestampPair {
                start: slot.context_start.load(Ordering::Relaxed),
                end: slot.context_end.load(Ordering::Relaxed),
            },
        })
    }

    // ===========================================================================================
    // Sharing
    // ===========================================================================================

    pub fn export_pool(&self, handle: EventPoolHandle) -> UmdResult<ExportedPool> {
        let pool = self.pools.get(handle)?;
        if !pool.flags.contains(EventPoolFlags::IPC) {
            return Err(UmdError::invalid_arg("event pool was not created with IPC"));
        }
        if pool.is_imported() {
            return Err(UmdError::invalid_arg("imported pools cannot be re-exported"));
        }
        pool.exports.fetch_add(1, Ordering::AcqRel);
        self.exported.lock().insert(pool.id, handle);

        let memory = &pool.storage.memory;
        Ok(ExportedPool {
            fd: memory.raw_fd(),
            inode: memory.inode(),
            id: pool.id,
            capacity: pool.capacity,
            flags: pool.flags,
        })
    }

    pub fn put_pool_export(&self, pool_id: u64) -> UmdResult<()> {
        let mut exported = self.exported.lock();
        let handle = *exported
            .get(&pool_id)
            .ok_or_else(|| UmdError::invalid_arg(format!("pool {pool_id} has no outstanding export")))?;
        let Ok(pool) = self.pools.get(handle) else {
            exported.remove(&pool_id);
            return Err(UmdError::stale("event pool", handle));
        };
        if pool.exports.fetch_sub(1, Ordering::AcqRel) <= 1 {
            pool.exports.store(0, Ordering::Release);
            exported.remove(&pool_id);
        }
        Ok(())
    }

    pub fn export_count(&self, handle: EventPoolHandle) -> UmdResult<u32> {
        Ok(self.pools.get(handle)?.exports.load(Ordering::Acquire))
    }

    pub fn import_pool(
        &self,
        key: ImportKey,
        fd: RawFd,
        inode: u64,
        capacity: u32,
        flags: EventPoolFlags,
    ) -> UmdResult<EventPoolHandle> {
        if capacity == 0 || capacity > MAX_POOL_CAPACITY {
            return Err(UmdError::invalid_arg(format!("pool capacity {capacity} is out of range")));
        }
        let mut imported = self.imported.lock();

        if let Some(&handle) = imported.get(&key) {
            if let Ok(pool) = self.pools.get(handle) {
                pool.imports.fetch_add(1, Ordering::AcqRel);
                return Ok(handle);
            }
        }

        let fd = shm::duplicate_fd(key.pid, fd).map_err(|e| {
            UmdError::NotAvailable(format!("cannot duplicate descriptor from pid {}: {e}", key.pid))
        })?;
        let memory = SharedMemory::adopt(fd, inode)
            .map_err(|e| UmdError::NotAvailable(format!("exported pool is gone: {e}")))?;
        if memory.len() < storage_len(capacity) {
            return Err(UmdError::NotAvailable("exported pool is smaller than advertised".into()));
        }

        let pool = EventPool::new(memory, capacity, flags, Some(key))?;
        let (handle, _) = self.pools.insert_with(|_| pool)?;
        imported.insert(key, handle);
        debug!(pid = key.pid, object = key.object_id, capacity, "imported event pool");
        Ok(handle)
    }

    pub fn close_import(&self, handle: EventPoolHandle) -> UmdResult<()> {
        let mut imported = self.imported.lock();
        let pool = self.pools.get(handle)?;
        let Some(key) = pool.origin else {
            return Err(UmdError::invalid_arg("event pool was not opened from an IPC handle"));
        };

        if pool.imports.load(Ordering::Acquire) > 1 {
            pool.imports.fetch_sub(1, Ordering::AcqRel);
            return Ok(());
        }

        self.pools
            .remove_if(handle, |pool| pool.retire_unbound("imported pool"))?;
        imported.remove(&key);
        Ok(())
    }
}

// ===============================================================================================
// Public API
// ===============================================================================================

impl Context {
    pub fn create_event_pool(&self, desc: EventPoolDesc) -> UmdResult<EventPoolHandle> {
        self.api("zeEventPoolCreate", || self.inner.events.create_pool(desc))
    }

    pub fn destroy_event_pool(&self, pool: EventPoolHandle) -> UmdResult<()> {
        self.api("zeEventPoolDestroy", || self.inner.events.destroy_pool(pool))
    }

    pub fn create_event(&self, pool: EventPoolHandle, index: u32) -> UmdResult<EventHandle> {
        self.api("zeEventCreate", || self.inner.events.create_event(pool, index))
    }

    pub fn destroy_event(&self, event: EventHandle) -> UmdResult<()> {
        self.api("zeEventDestroy", || self.inner.events.destroy_event(event))
    }

    pub fn event_host_signal(&self, event: EventHandle) -> UmdResult<()> {
        self.api("zeEventHostSignal", || self.inner.events.host_signal(event))
    }

    /// Waits for `event`. `u64::MAX` waits forever; `NotReady` on timeout.
    pub fn event_host_synchronize(&self, event: EventHandle, timeout_ns: u64) -> UmdResult<()> {
        self.api("zeEventHostSynchronize", || {
            self.inner.events.host_synchronize(event, timeout_ns)
        })
    }

    pub fn event_host_reset(&self, event: EventHandle) -> UmdResult<()> {
        self.api("zeEventHostReset", || self.inner.events.host_reset(event))
    }

    pub fn event_query_status(&self, event: EventHandle) -> UmdResult<SyncStatus> {
        self.api("zeEventQueryStatus", || self.inner.events.query_status(event))
    }

    pub fn event_query_kernel_timestamp(
        &self,
        event: EventHandle,
    ) -> UmdResult<KernelTimestampResult> {
        self.api("zeEventQueryKernelTimestamp", || {
            self.inner.events.query_kernel_timestamp(event)
        })
    }

    #[must_use]
    pub fn event_pool_info(&self, pool: EventPoolHandle) -> Option<(u32, EventPoolFlags)> {
        self.inner
            .events
            .pool(pool)
            .ok()
            .map(|p| (p.capacity(), p.flags()))
    }
}
