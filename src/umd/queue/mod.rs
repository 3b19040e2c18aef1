//! Command queues.
//!
//! A queue is one ring on one engine of one device. Lists executed together
//! form a single batch; batches reach the transport in sequence order (the
//! submit lock serializes sequence assignment with the hand-off) and retire in
//! the same order through the queue's [`Timeline`].

pub mod timeline;

use crate::error::{UmdError, UmdResult};
use crate::handle::{Handle, ScopedHandle};
use crate::kmd::shm::Mapping;
use crate::kmd::{Job, JobStatus, RingId, SubmissionChannel};
use crate::umd::DeviceId;
use crate::umd::cmdlist::command::Command;
use crate::umd::cmdlist::{CommandList, CommandListHandle};
use crate::umd::context::{Context, Device};
use crate::umd::event::{Event, EventHandle, EventRegistry};
use crate::umd::fence::{Fence, FenceHandle};
use crate::umd::memory::MemoryManager;
use crate::umd::memory::manager::{AllocRef, AllocationRecord};
use crate::utils::deadline_from_ns;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use timeline::{Batch, Timeline};
use tracing::{debug, warn};

static NEXT_RING: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    #[default]
    Default,
    /// `execute` returns only after the batch has retired.
    Synchronous,
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    #[default]
    Normal,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDesc {
    pub ordinal: u32,
    pub index: u32,
    pub mode: QueueMode,
    pub priority: QueuePriority,
}

pub type QueueHandle = Handle<CommandQueue>;

/// Commands and lists making up one batch.
#[derive(Debug)]
pub(crate) struct Submission {
    pub commands: Vec<Command>,
    /// Lists already marked in flight; released when the batch retires or is abandoned.
    pub lists: Vec<Arc<CommandList>>,
}

struct Pinned {
    seq: u64,
    allocations: Vec<Arc<AllocationRecord>>,
    events: Vec<(Arc<Event>, bool)>,
}

#[derive(Debug)]
pub struct CommandQueue {
    device: DeviceId,
    desc: QueueDesc,
    ring: RingId,
    channel: Arc<dyn SubmissionChannel>,
    timeline: Arc<Timeline>,
    submit_lock: Mutex<()>,
    fences: AtomicU32,
}

impl CommandQueue {
    pub(crate) fn new(device: &Device, desc: QueueDesc) -> UmdResult<Self> {
        device.check_queue(desc.ordinal, desc.index)?;
        let ring = NEXT_RING.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            device: device.id,
            desc,
            ring,
            channel: device.channel.clone(),
            timeline: Arc::new(Timeline::new(ring)),
            submit_lock: Mutex::new(()),
            fences: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub const fn desc(&self) -> QueueDesc {
        self.desc
    }

    #[must_use]
    pub const fn mode(&self) -> QueueMode {
        self.desc.mode
    }

    pub(crate) fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub(crate) fn bind_fence(&self) {
        self.fences.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unbind_fence(&self) {
        self.fences.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_lost(&self) -> bool {
        self.timeline.is_lost() || self.channel.is_lost()
    }

    /// Pins everything `submission` references, arms `fence` and hands the
    /// batch to the transport. Returns the batch sequence number.
    ///
    /// On failure nothing stays pinned and the submission's lists are released.
    pub(crate) fn submit(
        &self,
        memory: &MemoryManager,
        events: &EventRegistry,
        submission: Submission,
        fence: Option<&Fence>,
    ) -> UmdResult<u64> {
        let _guard = self.submit_lock.lock();
        let Submission { commands, lists } = submission;

        let pinned = match self.pin(memory, events, &commands, fence) {
            Ok(pinned) => pinned,
            Err(e) => {
                for list in &lists {
                    list.retire();
                }
                return Err(e);
            }
        };
        let Pinned {
            seq,
            allocations,
            events,
        } = pinned;

        let mut keepalive: Vec<ScopedHandle<Mapping>> =
            allocations.iter().map(|r| r.mapping.clone()).collect();
        let mut pools = HashSet::new();
        for (event, _) in &events {
            if pools.insert(Arc::as_ptr(event.pool())) {
                keepalive.push(event.pool().storage().clone());
            }
        }

        let job = Job {
            ring: self.ring,
            seq,
            commands: commands.into_iter().map(|c| c.job).collect(),
            keepalive,
        };
        let commands = job.commands.len();

        self.timeline.push(Batch {
            seq,
            allocations,
            events,
            lists,
        });

        let timeline = self.timeline.clone();
        let on_complete = Box::new(move |status| timeline.complete(seq, status));
        if let Err(e) = self.channel.submit(job, on_complete) {
            warn!(ring = self.ring, seq, "transport refused batch: {e}");
            self.timeline.complete(seq, JobStatus::DeviceLost);
            return Err(e);
        }

        debug!(ring = self.ring, seq, commands, "batch submitted");
        Ok(seq)
    }

    fn pin(
        &self,
        memory: &MemoryManager,
        registry: &EventRegistry,
        commands: &[Command],
        fence: Option<&Fence>,
    ) -> UmdResult<Pinned> {
        if self.is_lost() {
            return Err(UmdError::DeviceLost);
        }

        let mut events: Vec<(Arc<Event>, bool)> = Vec::new();
        let mut seen: HashMap<EventHandle, usize> = HashMap::new();
        for cmd in commands {
            for event in &cmd.events {
                let signals = cmd.signal.as_ref().is_some_and(|s| Arc::ptr_eq(s, event));
                match seen.get(&event.handle()) {
                    Some(&i) => events[i].1 |= signals,
                    None => {
                        seen.insert(event.handle(), events.len());
                        events.push((event.clone(), signals));
                    }
                }
            }
        }

        // Counted before the liveness check: a concurrent destroy either
        // observes the count or has already removed the event.
        for (event, signals) in &events {
            event.add_in_flight(*signals);
        }
        match self.pin_rest(memory, registry, commands, &events, fence) {
            Ok((seq, allocations)) => Ok(Pinned {
                seq,
                allocations,
                events,
            }),
            Err(e) => {
                for (event, signals) in &events {
                    event.retire(*signals, false);
                }
                Err(e)
            }
        }
    }

    fn pin_rest(
        &self,
        memory: &MemoryManager,
        registry: &EventRegistry,
        commands: &[Command],
        events: &[(Arc<Event>, bool)],
        fence: Option<&Fence>,
    ) -> UmdResult<(u64, Vec<Arc<AllocationRecord>>)> {
        if let Some((event, _)) = events.iter().find(|(e, _)| !registry.is_live(e)) {
            return Err(UmdError::stale("event", event.handle()));
        }

        let refs: Vec<AllocRef> = commands
            .iter()
            .flat_map(|c| c.allocations.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let seq = self.timeline.next_seq();
        if let Some(fence) = fence {
            fence.arm(seq)?;
        }

        match memory.acquire(&refs, self.device) {
            Ok(allocations) => Ok((seq, allocations)),
            Err(e) => {
                if let Some(fence) = fence {
                    fence.disarm(seq);
                }
                Err(e)
            }
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.channel.release_ring(self.ring);
    }
}

// ===============================================================================================
// Public API
// ===============================================================================================

impl Context {
    pub fn create_command_queue(&self, device: DeviceId, desc: QueueDesc) -> UmdResult<QueueHandle> {
        self.api("zeCommandQueueCreate", || {
            let dev = self.device(device)?;
            let queue = CommandQueue::new(&dev, desc)?;
            let ring = queue.ring;
            let (handle, _) = self.inner.queues.insert_with(|_| queue)?;
            debug!(?handle, ring, ordinal = desc.ordinal, index = desc.index, "queue created");
            Ok(handle)
        })
    }

    pub fn destroy_command_queue(&self, queue: QueueHandle) -> UmdResult<()> {
        self.api("zeCommandQueueDestroy", || {
            self.inner.queues.remove_if(queue, |q| {
                let outstanding = q.timeline.outstanding();
                if outstanding > 0 {
                    return Err(UmdError::in_use(format!("{outstanding} batch(es) still outstanding")));
                }
                let fences = q.fences.load(Ordering::Acquire);
                if fences > 0 {
                    return Err(UmdError::in_use(format!("{fences} fence(s) still bound to the queue")));
                }
                Ok(())
            })?;
            Ok(())
        })
    }

    /// Submits `lists` as one batch, optionally arming `fence` for it.
    pub fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[CommandListHandle],
        fence: Option<FenceHandle>,
    ) -> UmdResult<()> {
        self.api("zeCommandQueueExecuteCommandLists", || {
            let queue = self.inner.queues.get(queue)?;
            if lists.is_empty() {
                return Err(UmdError::invalid_arg("no command lists to execute"));
            }
            let fence = fence.map(|f| self.inner.fences.get(f)).transpose()?;
            if let Some(fence) = &fence {
                if !fence.belongs_to(&queue) {
                    return Err(UmdError::invalid_arg("fence was created for another queue"));
                }
            }

            let lists = lists
                .iter()
                .map(|&h| self.inner.lists.get(h))
                .collect::<UmdResult<Vec<_>>>()?;
            for list in &lists {
                if list.is_immediate() {
                    return Err(UmdError::invalid_arg("immediate command lists cannot be executed"));
                }
                if list.device() != queue.device || list.ordinal() != queue.desc.ordinal {
                    return Err(UmdError::invalid_arg(
                        "command list was created for another device or engine group",
                    ));
                }
            }

            let mut commands = Vec::new();
            let mut begun: Vec<Arc<CommandList>> = Vec::with_capacity(lists.len());
            for list in &lists {
                match list.begin_submit(queue.ring) {
                    Ok(snapshot) => {
                        commands.extend(snapshot);
                        begun.push(list.clone());
                    }
                    Err(e) => {
                        for list in &begun {
                            list.retire();
                        }
                        return Err(e);
                    }
                }
            }

            let seq = queue.submit(
                &self.inner.memory,
                &self.inner.events,
                Submission {
                    commands,
                    lists: begun,
                },
                fence.as_deref(),
            )?;

            if queue.mode() == QueueMode::Synchronous {
                queue.timeline.wait(|| seq, None)?;
            }
            Ok(())
        })
    }

    /// Waits for every batch submitted to `queue` before the call.
    pub fn synchronize_command_queue(&self, queue: QueueHandle, timeout_ns: u64) -> UmdResult<()> {
        self.api("zeCommandQueueSynchronize", || {
            let queue = self.inner.queues.get(queue)?;
            queue.timeline.wait_idle(deadline_from_ns(timeout_ns))
        })
    }
}
