//! Kernel-mode driver boundary.
//!
//! The engine never talks to hardware directly. It hands fully resolved jobs
//! to a [`SubmissionChannel`] and learns about completion through a callback.
//! This module defines that contract, the device-visible event slot ABI shared
//! by both sides, and the OS primitives (`shm`) used to back memory.

pub mod shm;
pub mod sim;

use crate::error::UmdResult;
use crate::handle::ScopedHandle;
use parking_lot::{Condvar, Mutex};
use shm::Mapping;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const KMD_MAJOR_VERSION: u32 = 1;
pub const KMD_MINOR_VERSION: u32 = 4;

pub const EVENT_STATE_CLEAR: u64 = 0;
pub const EVENT_STATE_SIGNALED: u64 = 1;

/// Size of one kernel timestamp record written by a timestamp query.
pub const KERNEL_TIMESTAMP_RECORD_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmdVersion {
    pub major: u32,
    pub minor: u32,
}

// ===============================================================================================
// Device description
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    Compute,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineGroup {
    pub engine: EngineType,
    pub queue_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    pub device_id: u32,
    /// Engine groups, indexed by queue ordinal.
    pub engine_groups: Vec<EngineGroup>,
    /// Device timer ticks per second.
    pub timer_frequency: u64,
    pub max_fill_pattern_size: usize,
}

// ===============================================================================================
// Event slot ABI
// ===============================================================================================

/// Device-visible backing record of one event.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct EventSlot {
    pub state: AtomicU64,
    pub global_start: AtomicU64,
    pub global_end: AtomicU64,
    pub context_start: AtomicU64,
    pub context_end: AtomicU64,
    pub reserved: [u64; 3],
}

const _: () = assert!(mem::size_of::<EventSlot>() == 64);
const _: () = assert!(mem::align_of::<EventSlot>() == 64);

impl EventSlot {
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == EVENT_STATE_SIGNALED
    }

    #[inline]
    pub fn signal(&self) {
        self.state.store(EVENT_STATE_SIGNALED, Ordering::Release);
    }

    pub fn clear(&self) {
        self.global_start.store(0, Ordering::Relaxed);
        self.global_end.store(0, Ordering::Relaxed);
        self.context_start.store(0, Ordering::Relaxed);
        self.context_end.store(0, Ordering::Relaxed);
        self.state.store(EVENT_STATE_CLEAR, Ordering::Release);
    }

    pub fn record_timestamps(&self, start: u64, end: u64) {
        self.global_start.store(start, Ordering::Relaxed);
        self.global_end.store(end, Ordering::Relaxed);
        self.context_start.store(start, Ordering::Relaxed);
        self.context_end.store(end, Ordering::Relaxed);
    }
}

/// Wakes host threads sleeping on slots of one pool.
///
/// Signallers only touch the lock when `waiting` is non-zero.
#[derive(Debug, Default)]
pub struct SignalNotifier {
    waiting: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

struct WaitGuard<'a>(&'a SignalNotifier);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

impl SignalNotifier {
    pub fn notify(&self) {
        std::sync::atomic::fence(Ordering::SeqCst);
        if self.waiting.load(Ordering::Relaxed) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Spins for `spin`, then sleeps in slices of at most `slice` until `ready`
    /// holds or `deadline` passes. Returns the final value of `ready`.
    ///
    /// Slices bound the latency of signals written through another mapping of
    /// the same slot memory, which cannot reach this notifier.
    pub fn wait_until(
        &self,
        ready: impl Fn() -> bool,
        deadline: Option<Instant>,
        spin: Duration,
        slice: Duration,
    ) -> bool {
        if ready() {
            return true;
        }

        let spin_end = Instant::now() + spin;
        while Instant::now() < spin_end {
            if ready() {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            std::hint::spin_loop();
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::SeqCst);
        let _guard = WaitGuard(self);

        let mut lock = self.lock.lock();
        loop {
            if ready() {
                return true;
            }
            let now = Instant::now();
            let wake = match deadline {
                Some(d) if now >= d => return false,
                Some(d) => d.min(now + slice),
                None => now + slice,
            };
            let _ = self.cond.wait_until(&mut lock, wake);
        }
    }
}

/// A reference to an event slot inside a mapping the job keeps alive.
#[derive(Clone)]
pub struct SlotRef {
    addr: usize,
    notifier: Arc<SignalNotifier>,
}

impl SlotRef {
    /// # Safety
    /// `slot` must point into a mapping that outlives every use of this
    /// reference (jobs hold the mapping in [`Job::keepalive`]).
    pub unsafe fn new(slot: *const EventSlot, notifier: Arc<SignalNotifier>) -> Self {
        Self {
            addr: slot as usize,
            notifier,
        }
    }

    #[inline]
    pub fn slot(&self) -> &EventSlot {
        // SAFETY: upheld by the constructor contract.
        unsafe { &*(self.addr as *const EventSlot) }
    }

    pub fn notifier(&self) -> &SignalNotifier {
        &self.notifier
    }
}

impl fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotRef(0x{:x})", self.addr)
    }
}

// ===============================================================================================
// Jobs
// ===============================================================================================

/// Identifies one submission ring (one per command queue).
pub type RingId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    Kernel,
    Graph,
}

/// Device work for one command, with every address already resolved.
#[derive(Debug, Clone)]
pub enum Action {
    None,
    Copy {
        dst: u64,
        src: u64,
        len: u64,
    },
    Fill {
        dst: u64,
        len: u64,
        pattern: Vec<u8>,
    },
    CopyRegion {
        dst: u64,
        dst_pitch: u64,
        dst_slice_pitch: u64,
        src: u64,
        src_pitch: u64,
        src_slice_pitch: u64,
        width: u64,
        height: u64,
        depth: u64,
    },
    Barrier,
    Prefetch {
        addr: u64,
        len: u64,
    },
    WriteTimestamp {
        dst: u64,
    },
    Launch {
        kind: LaunchKind,
        id: u64,
        group_count: [u32; 3],
    },
    ResetEvent {
        slot: SlotRef,
    },
    QueryTimestamps {
        slots: Vec<SlotRef>,
        dst: u64,
    },
}

#[derive(Debug, Clone)]
pub struct SignalTarget {
    pub slot: SlotRef,
    /// Record start/end timestamps into the slot before signalling.
    pub timestamped: bool,
}

#[derive(Debug, Clone)]
pub struct JobCommand {
    pub waits: Vec<SlotRef>,
    pub action: Action,
    pub signal: Option<SignalTarget>,
}

/// An ordered batch handed to the transport.
#[derive(Debug)]
pub struct Job {
    pub ring: RingId,
    pub seq: u64,
    pub commands: Vec<JobCommand>,
    /// Mappings touched by the job, held until the job is dropped.
    pub keepalive: Vec<ScopedHandle<Mapping>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    DeviceLost,
}

pub type CompletionCallback = Box<dyn FnOnce(JobStatus) + Send>;

/// The transport contract: `submit` returns immediately and `on_complete`
/// fires exactly once, later, from a transport-owned thread.
pub trait SubmissionChannel: Send + Sync + fmt::Debug {
    fn properties(&self) -> &DeviceProperties;

    fn version(&self) -> KmdVersion;

    fn is_lost(&self) -> bool;

    /// Current device timer value in ticks.
    fn timestamp(&self) -> u64;

    fn submit(&self, job: Job, on_complete: CompletionCallback) -> UmdResult<()>;

    /// Called when the queue owning `ring` is destroyed.
    fn release_ring(&self, ring: RingId);
}
