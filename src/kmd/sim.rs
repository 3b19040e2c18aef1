//! Software device.
//!
//! Implements [`SubmissionChannel`] by executing jobs on host threads, one
//! worker per ring. Commands within a job, and jobs within a ring, run in
//! order. Device memory is ordinary host memory, so every action is a plain
//! memory operation on already-resolved addresses.

#![allow(clippy::cast_possible_truncation)]

use super::{
    Action, CompletionCallback, DeviceProperties, EngineGroup, EngineType, Job, JobCommand,
    JobStatus, KERNEL_TIMESTAMP_RECORD_SIZE, KMD_MAJOR_VERSION, KMD_MINOR_VERSION, KmdVersion,
    RingId, SlotRef, SubmissionChannel,
};
use crate::error::{UmdError, UmdResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long a worker blocked on an event wait sleeps between checks for loss.
const WAIT_POLL: Duration = Duration::from_millis(2);

type Work = (Job, CompletionCallback);

#[derive(Debug)]
struct SimState {
    epoch: Instant,
    lost: AtomicBool,
    shutdown: AtomicBool,
    jobs_completed: AtomicU64,
}

impl SimState {
    /// Nanosecond ticks since the device came up.
    fn ticks(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn halted(&self) -> bool {
        self.lost.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Ring {
    tx: Sender<Work>,
}

#[derive(Debug)]
pub struct SoftwareDevice {
    props: DeviceProperties,
    version: KmdVersion,
    state: Arc<SimState>,
    rings: Mutex<HashMap<RingId, Ring>>,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SoftwareDevice {
    /// A device with one compute group of four queues and one copy group of two.
    #[must_use]
    pub fn new(device_id: u32) -> Self {
        Self::with_properties(DeviceProperties {
            name: format!("Software NPU {device_id}"),
            device_id,
            engine_groups: vec![
                EngineGroup {
                    engine: EngineType::Compute,
                    queue_count: 4,
                },
                EngineGroup {
                    engine: EngineType::Copy,
                    queue_count: 2,
                },
            ],
            timer_frequency: 1_000_000_000,
            max_fill_pattern_size: 128,
        })
    }

    #[must_use]
    pub fn with_properties(props: DeviceProperties) -> Self {
        Self {
            props,
            version: KmdVersion {
                major: KMD_MAJOR_VERSION,
                minor: KMD_MINOR_VERSION,
            },
            state: Arc::new(SimState {
                epoch: Instant::now(),
                lost: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                jobs_completed: AtomicU64::new(0),
            }),
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the reported transport version, for negotiation tests.
    #[must_use]
    pub const fn with_version(mut self, version: KmdVersion) -> Self {
        self.version = version;
        self
    }

    /// Marks the device lost. Running and queued jobs complete with
    /// [`JobStatus::DeviceLost`]; further submissions are refused.
    pub fn inject_device_lost(&self) {
        error!(device = self.props.device_id, "device lost (injected)");
        self.state.lost.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn jobs_completed(&self) -> u64 {
        self.state.jobs_completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_rings(&self) -> usize {
        self.rings.lock().len()
    }

    fn spawn_ring(&self, ring: RingId) -> UmdResult<Ring> {
        let (tx, rx) = mpsc::channel::<Work>();
        let state = self.state.clone();
        thread::Builder::new()
            .name(format!("npu-sim-ring-{ring}"))
            .spawn(move || {
                while let Ok((job, done)) = rx.recv() {
                    let status = execute(&state, &job);
                    if status == JobStatus::Completed {
                        state.jobs_completed.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(job);
                    done(status);
                }
            })?;
        debug!(device = self.props.device_id, ring, "ring worker started");
        Ok(Ring { tx })
    }
}

impl SubmissionChannel for SoftwareDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    fn version(&self) -> KmdVersion {
        self.version
    }

    fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::Acquire)
    }

    fn timestamp(&self) -> u64 {
        self.state.ticks()
    }

    fn submit(&self, job: Job, on_complete: CompletionCallback) -> UmdResult<()> {
        if self.is_lost() {
            return Err(UmdError::DeviceLost);
        }

        let mut rings = self.rings.lock();
        let ring = match rings.entry(job.ring) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let ring = self.spawn_ring(job.ring)?;
                e.insert(ring)
            }
        };

        let ring_id = job.ring;
        ring.tx.send((job, on_complete)).map_err(|_| {
            warn!(ring = ring_id, "ring worker is gone");
            UmdError::DeviceLost
        })
    }

    fn release_ring(&self, ring: RingId) {
        // Dropping the sender lets the worker drain and exit.
        if self.rings.lock().remove(&ring).is_some() {
            debug!(device = self.props.device_id, ring, "ring released");
        }
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.rings.get_mut().clear();
    }
}

// ===============================================================================================
// Execution
// ===============================================================================================

fn execute(state: &SimState, job: &Job) -> JobStatus {
    for cmd in &job.commands {
        if state.lost.load(Ordering::Acquire) {
            return JobStatus::DeviceLost;
        }
        if !wait_all(state, &cmd.waits) {
            return JobStatus::DeviceLost;
        }

        let start = state.ticks();
        run_action(state, cmd);
        let end = state.ticks();

        if let Some(signal) = &cmd.signal {
            let slot = signal.slot.slot();
            if signal.timestamped {
                slot.record_timestamps(start, end.max(start + 1));
            }
            slot.signal();
            signal.slot.notifier().notify();
        }
    }
    JobStatus::Completed
}

/// Blocks until every slot is signalled. Returns `false` if the device halts first.
fn wait_all(state: &SimState, waits: &[SlotRef]) -> bool {
    for w in waits {
        loop {
            let ready = w.notifier().wait_until(
                || w.slot().is_signaled() || state.halted(),
                Some(Instant::now() + WAIT_POLL),
                Duration::ZERO,
                WAIT_POLL,
            );
            if state.halted() {
                return false;
            }
            if ready {
                break;
            }
        }
    }
    true
}

fn run_action(state: &SimState, cmd: &JobCommand) {
    // SAFETY (all arms): addresses were validated against live allocations at
    // append time and the job's keepalive mappings cover every one of them.
    match &cmd.action {
        Action::None | Action::Barrier | Action::Prefetch { .. } | Action::Launch { .. } => {}
        Action::Copy { dst, src, len } => unsafe {
            ptr::copy(*src as *const u8, *dst as *mut u8, *len as usize);
        },
        Action::Fill { dst, len, pattern } => unsafe {
            fill(*dst as *mut u8, *len as usize, pattern);
        },
        Action::CopyRegion {
            dst,
            dst_pitch,
            dst_slice_pitch,
            src,
            src_pitch,
            src_slice_pitch,
            width,
            height,
            depth,
        } => {
            for z in 0..*depth {
                for y in 0..*height {
                    let s = src + z * src_slice_pitch + y * src_pitch;
                    let d = dst + z * dst_slice_pitch + y * dst_pitch;
                    unsafe { ptr::copy(s as *const u8, d as *mut u8, *width as usize) };
                }
            }
        }
        Action::WriteTimestamp { dst } => unsafe {
            ptr::write_unaligned(*dst as *mut u64, state.ticks());
        },
        Action::ResetEvent { slot } => slot.slot().clear(),
        Action::QueryTimestamps { slots, dst } => {
            for (i, s) in slots.iter().enumerate() {
                let slot = s.slot();
                let record = [
                    slot.global_start.load(Ordering::Relaxed),
                    slot.global_end.load(Ordering::Relaxed),
                    slot.context_start.load(Ordering::Relaxed),
                    slot.context_end.load(Ordering::Relaxed),
                ];
                let at = *dst as usize + i * KERNEL_TIMESTAMP_RECORD_SIZE;
                unsafe { ptr::write_unaligned(at as *mut [u64; 4], record) };
            }
        }
    }
}

unsafe fn fill(dst: *mut u8, len: usize, pattern: &[u8]) {
    if pattern.len() == 1 {
        unsafe { ptr::write_bytes(dst, pattern[0], len) };
        return;
    }
    let mut off = 0;
    while off < len {
        let n = pattern.len().min(len - off);
        unsafe { ptr::copy_nonoverlapping(pattern.as_ptr(), dst.add(off), n) };
        off += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmd::{EventSlot, SignalNotifier, SignalTarget};
    use std::sync::mpsc::channel;

    fn job(ring: RingId, seq: u64, commands: Vec<JobCommand>) -> Job {
        Job {
            ring,
            seq,
            commands,
            keepalive: Vec::new(),
        }
    }

    #[test]
    fn executes_fill_and_copy_in_order() {
        let dev = SoftwareDevice::default();
        let mut src = vec![0u8; 64];
        let mut dst = vec![0u8; 64];
        let (src_ptr, dst_ptr) = (src.as_mut_ptr() as u64, dst.as_mut_ptr() as u64);
        let slot = Box::new(EventSlot::default());
        let notifier = Arc::new(SignalNotifier::default());
        let slot_ref = unsafe { SlotRef::new(&raw const *slot, notifier) };

        let commands = vec![
            JobCommand {
                waits: vec![],
                action: Action::Fill {
                    dst: src_ptr,
                    len: 64,
                    pattern: vec![1, 2, 3, 4],
                },
                signal: None,
            },
            JobCommand {
                waits: vec![],
                action: Action::Copy {
                    dst: dst_ptr,
                    src: src_ptr,
                    len: 64,
                },
                signal: Some(SignalTarget {
                    slot: slot_ref,
                    timestamped: true,
                }),
            },
        ];

        let (tx, rx) = channel();
        dev.submit(job(1, 1, commands), Box::new(move |s| tx.send(s).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), JobStatus::Completed);

        assert_eq!(&dst[..8], &[1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(src, dst);
        assert!(slot.is_signaled());
        assert!(slot.global_end.load(Ordering::Relaxed) > slot.global_start.load(Ordering::Relaxed));
        assert_eq!(dev.jobs_completed(), 1);
    }

    #[test]
    fn device_loss_aborts_blocked_job() {
        let dev = SoftwareDevice::default();
        let gate = Box::new(EventSlot::default());
        let notifier = Arc::new(SignalNotifier::default());
        let gate_ref = unsafe { SlotRef::new(&raw const *gate, notifier) };

        let (tx, rx) = channel();
        let commands = vec![JobCommand {
            waits: vec![gate_ref],
            action: Action::Barrier,
            signal: None,
        }];
        dev.submit(job(7, 1, commands), Box::new(move |s| tx.send(s).unwrap()))
            .unwrap();

        dev.inject_device_lost();
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), JobStatus::DeviceLost);
        assert!(matches!(
            dev.submit(job(7, 2, vec![]), Box::new(|_| {})),
            Err(UmdError::DeviceLost)
        ));
    }

    #[test]
    fn released_ring_is_forgotten() {
        let dev = SoftwareDevice::default();
        let (tx, rx) = channel();
        dev.submit(job(3, 1, vec![]), Box::new(move |s| tx.send(s).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(dev.active_rings(), 1);
        dev.release_ring(3);
        assert_eq!(dev.active_rings(), 0);
    }
}
