//! Command lists.
//!
//! A regular list moves Open -> Closed -> (submitted)* and back to Open via
//! reset. Appends validate every pointer and event up front, so a closed list
//! only fails at submission if something it references was destroyed since.
//! An immediate list owns a private queue and submits each append as its own
//! batch.

pub mod command;

pub use command::{BufferArg, CopyRegion, GraphLaunch, KernelLaunch, PitchedBuffer};

use crate::error::{UmdError, UmdResult};
use crate::handle::Handle;
use crate::kmd::{Action, RingId};
use crate::umd::DeviceId;
use crate::umd::context::Context;
use crate::umd::event::EventHandle;
use crate::umd::queue::{CommandQueue, QueueDesc, QueueMode, Submission};
use crate::utils::deadline_from_ns;
use command::{Command, Recorder};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

pub type CommandListHandle = Handle<CommandList>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandListDesc {
    /// Engine group the list will be submitted to.
    pub ordinal: u32,
}

#[derive(Debug, Default)]
struct ListState {
    closed: bool,
    commands: Vec<Command>,
}

#[derive(Debug)]
pub struct CommandList {
    device: DeviceId,
    ordinal: u32,
    immediate: Option<Arc<CommandQueue>>,
    state: Mutex<ListState>,
    in_flight: AtomicU32,
    active_ring: AtomicU64,
}

impl CommandList {
    fn new(device: DeviceId, ordinal: u32, immediate: Option<Arc<CommandQueue>>) -> Self {
        Self {
            device,
            ordinal,
            immediate,
            state: Mutex::new(ListState::default()),
            in_flight: AtomicU32::new(0),
            active_ring: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    #[must_use]
    pub const fn is_immediate(&self) -> bool {
        self.immediate.is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> UmdResult<()> {
        if self.immediate.is_none() && self.state.lock().closed {
            return Err(UmdError::invalid_state("command list is closed"));
        }
        Ok(())
    }

    fn close(&self) -> UmdResult<()> {
        if self.immediate.is_some() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(UmdError::invalid_state("command list is already closed"));
        }
        state.closed = true;
        Ok(())
    }

    fn reset(&self) -> UmdResult<()> {
        let mut state = self.state.lock();
        let in_flight = self.in_flight();
        if in_flight > 0 {
            return Err(UmdError::in_use(format!(
                "command list is part of {in_flight} outstanding batch(es)"
            )));
        }
        state.commands.clear();
        state.closed = false;
        Ok(())
    }

    fn record(&self, command: Command) -> UmdResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(UmdError::invalid_state("command list is closed"));
        }
        state.commands.push(command);
        Ok(())
    }

    /// Marks the list in flight on `ring` and snapshots its commands.
    pub(crate) fn begin_submit(&self, ring: RingId) -> UmdResult<Vec<Command>> {
        let state = self.state.lock();
        if !state.closed {
            return Err(UmdError::invalid_state("only closed command lists can be executed"));
        }
        if self.in_flight() > 0 && self.active_ring.load(Ordering::Acquire) != ring {
            return Err(UmdError::invalid_state(
                "command list is still executing on another queue",
            ));
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.active_ring.store(ring, Ordering::Release);
        Ok(state.commands.clone())
    }

    /// Drops one in-flight reference, at retirement or when a submission is abandoned.
    pub(crate) fn retire(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn mark_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }
}

// ===============================================================================================
// Public API
// ===============================================================================================

impl Context {
    pub fn create_command_list(
        &self,
        device: DeviceId,
        desc: CommandListDesc,
    ) -> UmdResult<CommandListHandle> {
        self.api("zeCommandListCreate", || {
            let dev = self.device(device)?;
            dev.check_ordinal(desc.ordinal)?;
            let (handle, _) = self
                .inner
                .lists
                .insert_with(|_| CommandList::new(device, desc.ordinal, None))?;
            debug!(?handle, ordinal = desc.ordinal, "command list created");
            Ok(handle)
        })
    }

    pub fn create_immediate_command_list(
        &self,
        device: DeviceId,
        desc: QueueDesc,
    ) -> UmdResult<CommandListHandle> {
        self.api("zeCommandListCreateImmediate", || {
            let dev = self.device(device)?;
            let queue = Arc::new(CommandQueue::new(&dev, desc)?);
            let (handle, _) = self
                .inner
                .lists
                .insert_with(|_| CommandList::new(device, desc.ordinal, Some(queue)))?;
            debug!(?handle, ordinal = desc.ordinal, mode = ?desc.mode, "immediate command list created");
            Ok(handle)
        })
    }

    pub fn destroy_command_list(&self, list: CommandListHandle) -> UmdResult<()> {
        self.api("zeCommandListDestroy", || {
            self.inner.lists.remove_if(list, |l| {
                let in_flight = l.in_flight();
                if in_flight > 0 {
                    return Err(UmdError::in_use(format!(
                        "command list is part of {in_flight} outstanding batch(es)"
                    )));
                }
                Ok(())
            })?;
            Ok(())
        })
    }

    pub fn command_list_close(&self, list: CommandListHandle) -> UmdResult<()> {
        self.api("zeCommandListClose", || self.inner.lists.get(list)?.close())
    }

    pub fn command_list_reset(&self, list: CommandListHandle) -> UmdResult<()> {
        self.api("zeCommandListReset", || self.inner.lists.get(list)?.reset())
    }

    /// Waits until every append made so far on an immediate list has completed.
    pub fn command_list_host_synchronize(
        &self,
        list: CommandListHandle,
        timeout_ns: u64,
    ) -> UmdResult<()> {
        self.api("zeCommandListHostSynchronize", || {
            let list = self.inner.lists.get(list)?;
            let queue = list
                .immediate
                .as_ref()
                .ok_or_else(|| UmdError::invalid_arg("only immediate command lists can be synchronized"))?;
            queue.timeline().wait_idle(deadline_from_ns(timeout_ns))
        })
    }

    /// Shared append path: validate, build, then record or submit.
    fn append(
        &self,
        name: &'static str,
        list: CommandListHandle,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
        build: impl FnOnce(&mut Recorder<'_>) -> UmdResult<Action>,
    ) -> UmdResult<()> {
        self.api(name, || {
            let list = self.inner.lists.get(list)?;
            list.ensure_open()?;

            let max_pattern = self.device(list.device)?.channel.properties().max_fill_pattern_size;
            let mut recorder = Recorder::new(&self.inner.memory, &self.inner.events, max_pattern);
            let action = build(&mut recorder)?;
            let command = recorder.finish(action, signal, waits)?;

            let Some(queue) = list.immediate.clone() else {
                return list.record(command);
            };

            list.mark_in_flight();
            let seq = queue.submit(
                &self.inner.memory,
                &self.inner.events,
                Submission {
                    commands: vec![command],
                    lists: vec![list.clone()],
                },
                None,
            )?;
            if queue.mode() == QueueMode::Synchronous {
                queue.timeline().wait(|| seq, None)?;
            }
            Ok(())
        })
    }

    pub fn append_memory_copy(
        &self,
        list: CommandListHandle,
        dst: u64,
        src: u64,
        size: u64,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendMemoryCopy", list, signal, waits, |r| {
            r.copy(dst, src, size)
        })
    }

    pub fn append_memory_fill(
        &self,
        list: CommandListHandle,
        dst: u64,
        pattern: &[u8],
        size: u64,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendMemoryFill", list, signal, waits, |r| {
            r.fill(dst, pattern, size)
        })
    }

    pub fn append_memory_copy_region(
        &self,
        list: CommandListHandle,
        dst: &PitchedBuffer,
        src: &PitchedBuffer,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendMemoryCopyRegion", list, signal, waits, |r| {
            r.copy_region(dst, src)
        })
    }

    pub fn append_barrier(
        &self,
        list: CommandListHandle,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendBarrier", list, signal, waits, |_| Ok(Action::Barrier))
    }

    pub fn append_memory_ranges_barrier(
        &self,
        list: CommandListHandle,
        ranges: &[(u64, u64)],
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendMemoryRangesBarrier", list, signal, waits, |r| {
            r.ranges_barrier(ranges)
        })
    }

    pub fn append_memory_prefetch(
        &self,
        list: CommandListHandle,
        ptr: u64,
        size: u64,
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendMemoryPrefetch", list, None, &[], |r| {
            r.prefetch(ptr, size)
        })
    }

    pub fn append_write_global_timestamp(
        &self,
        list: CommandListHandle,
        dst: u64,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendWriteGlobalTimestamp", list, signal, waits, |r| {
            r.global_timestamp(dst)
        })
    }

    pub fn append_launch_kernel(
        &self,
        list: CommandListHandle,
        launch: &KernelLaunch,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendLaunchKernel", list, signal, waits, |r| r.launch(launch))
    }

    pub fn append_graph_execute(
        &self,
        list: CommandListHandle,
        graph: &GraphLaunch,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeGraphAppendExecute", list, signal, waits, |r| r.graph(graph))
    }

    pub fn append_signal_event(&self, list: CommandListHandle, event: EventHandle) -> UmdResult<()> {
        self.append("zeCommandListAppendSignalEvent", list, Some(event), &[], |_| {
            Ok(Action::None)
        })
    }

    pub fn append_wait_on_events(
        &self,
        list: CommandListHandle,
        events: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendWaitOnEvents", list, None, events, |_| {
            if events.is_empty() {
                return Err(UmdError::invalid_arg("wait list is empty"));
            }
            Ok(Action::None)
        })
    }

    pub fn append_event_reset(&self, list: CommandListHandle, event: EventHandle) -> UmdResult<()> {
        self.append("zeCommandListAppendEventReset", list, None, &[], |r| r.event_reset(event))
    }

    pub fn append_query_kernel_timestamps(
        &self,
        list: CommandListHandle,
        events: &[EventHandle],
        dst: u64,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<()> {
        self.append("zeCommandListAppendQueryKernelTimestamps", list, signal, waits, |r| {
            r.query_timestamps(events, dst)
        })
    }
}
