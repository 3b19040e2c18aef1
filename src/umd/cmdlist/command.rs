//! Command records and the validation that produces them.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{UmdError, UmdResult};
use crate::kmd::{Action, JobCommand, KERNEL_TIMESTAMP_RECORD_SIZE, LaunchKind, SignalTarget};
use crate::umd::event::{Event, EventHandle, EventRegistry};
use crate::umd::memory::MemoryManager;
use crate::umd::memory::manager::AllocRef;
use std::sync::Arc;

/// A 3-D box inside a pitched buffer, in bytes / rows / slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyRegion {
    pub origin_x: u32,
    pub origin_y: u32,
    pub origin_z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A pitched buffer view used by region copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedBuffer {
    pub ptr: u64,
    pub region: CopyRegion,
    pub pitch: u32,
    pub slice_pitch: u32,
}

/// A device buffer passed to a kernel or graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferArg {
    pub ptr: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub kernel_id: u64,
    pub group_count: [u32; 3],
    pub arguments: Vec<BufferArg>,
}

/// Execution of a compiled model. The blob itself is opaque to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphLaunch {
    pub graph_id: u64,
    pub arguments: Vec<BufferArg>,
}

/// One recorded command: what the device runs plus what it pins.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub job: JobCommand,
    /// Every event the command touches, the signal event included.
    pub events: Vec<Arc<Event>>,
    pub signal: Option<Arc<Event>>,
    pub allocations: Vec<AllocRef>,
}

/// Collects and validates the references of one append.
pub(crate) struct Recorder<'a> {
    memory: &'a MemoryManager,
    events: &'a EventRegistry,
    max_pattern: usize,
    allocations: Vec<AllocRef>,
    touched: Vec<Arc<Event>>,
}

impl<'a> Recorder<'a> {
    pub fn new(memory: &'a MemoryManager, events: &'a EventRegistry, max_pattern: usize) -> Self {
        Self {
            memory,
            events,
            max_pattern,
            allocations: Vec::new(),
            touched: Vec::new(),
        }
    }

    /// `[ptr, ptr + len)` must lie inside one live allocation.
    pub fn range(&mut self, ptr: u64, len: u64) -> UmdResult<()> {
        let record = self.memory.resolve_range(ptr, len)?;
        self.allocations.push(record.alloc_ref());
        Ok(())
    }

    pub fn event(&mut self, handle: EventHandle) -> UmdResult<Arc<Event>> {
        let event = self.events.event(handle)?;
        self.touched.push(event.clone());
        Ok(event)
    }

    pub fn finish(
        mut self,
        action: Action,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> UmdResult<Command> {
        let waits = waits
            .iter()
            .map(|&h| self.event(h))
            .collect::<UmdResult<Vec<_>>>()?;
        let signal = signal.map(|h| self.event(h)).transpose()?;

        let job = JobCommand {
            waits: waits.iter().map(|e| e.slot_ref()).collect(),
            action,
            signal: signal.as_ref().map(|e| SignalTarget {
                slot: e.slot_ref(),
                timestamped: e.timestamped(),
            }),
        };

        self.allocations.sort_unstable();
        self.allocations.dedup();

        Ok(Command {
            job,
            events: self.touched,
            signal,
            allocations: self.allocations,
        })
    }

    // ===========================================================================================
    // Operations
    // ===========================================================================================

    pub fn copy(&mut self, dst: u64, src: u64, size: u64) -> UmdResult<Action> {
        self.range(dst, size)?;
        self.range(src, size)?;
        Ok(Action::Copy { dst, src, len: size })
    }

    pub fn fill(&mut self, dst: u64, pattern: &[u8], size: u64) -> UmdResult<Action> {
        if pattern.is_empty() || pattern.len() > self.max_pattern || !pattern.len().is_power_of_two() {
            return Err(UmdError::invalid_arg(format!(
                "fill pattern of {} bytes must be a power of two within 1..={}",
                pattern.len(),
                self.max_pattern
            )));
        }
        self.range(dst, size)?;
        Ok(Action::Fill {
            dst,
            len: size,
            pattern: pattern.to_vec(),
        })
    }

    pub fn copy_region(&mut self, dst: &PitchedBuffer, src: &PitchedBuffer) -> UmdResult<Action> {
        let (d, s) = (dst.region, src.region);
        if (d.width, d.height, d.depth) != (s.width, s.height, s.depth) {
            return Err(UmdError::invalid_arg("source and destination regions differ in extent"));
        }
        if d.width == 0 || d.height == 0 || d.depth == 0 {
            return Err(UmdError::invalid_arg("copy region must be non-empty"));
        }
        let dst_addr = self.pitched(dst)?;
        let src_addr = self.pitched(src)?;

        Ok(Action::CopyRegion {
            dst: dst_addr,
            dst_pitch: u64::from(dst.pitch),
            dst_slice_pitch: u64::from(dst.slice_pitch),
            src: src_addr,
            src_pitch: u64::from(src.pitch),
            src_slice_pitch: u64::from(src.slice_pitch),
            width: u64::from(d.width),
            height: u64::from(d.height),
            depth: u64::from(d.depth),
        })
    }

    /// Validates a pitched view and returns the address of its first byte.
    /// The region must be non-empty.
    fn pitched(&mut self, buf: &PitchedBuffer) -> UmdResult<u64> {
        let r = buf.region;
        let pitch = u64::from(buf.pitch);
        let slice = u64::from(buf.slice_pitch);
        let overflow = || UmdError::invalid_arg("copy region overflows the address space");

        let row_end = u64::from(r.origin_x) + u64::from(r.width);
        if row_end > pitch {
            return Err(UmdError::invalid_arg("row extends past the pitch"));
        }
        let rows = u64::from(r.origin_y) + u64::from(r.height);
        let slices = u64::from(r.origin_z) + u64::from(r.depth);
        if slices > 1 && rows.checked_mul(pitch).is_none_or(|n| n > slice) {
            return Err(UmdError::invalid_arg("slice extends past the slice pitch"));
        }

        let first = (u64::from(r.origin_z) * slice)
            .checked_add(u64::from(r.origin_y) * pitch)
            .and_then(|n| n.checked_add(u64::from(r.origin_x)))
            .ok_or_else(overflow)?;
        let end = (slices - 1)
            .checked_mul(slice)
            .and_then(|n| n.checked_add((rows - 1).checked_mul(pitch)?))
            .and_then(|n| n.checked_add(row_end))
            .ok_or_else(overflow)?;
        let start = buf.ptr.checked_add(first).ok_or_else(overflow)?;
        self.range(start, end - first)?;
        Ok(start)
    }

    pub fn ranges_barrier(&mut self, ranges: &[(u64, u64)]) -> UmdResult<Action> {
        for &(ptr, len) in ranges {
            self.range(ptr, len)?;
        }
        Ok(Action::Barrier)
    }

    pub fn prefetch(&mut self, ptr: u64, size: u64) -> UmdResult<Action> {
        self.range(ptr, size)?;
        Ok(Action::Prefetch { addr: ptr, len: size })
    }

    pub fn global_timestamp(&mut self, dst: u64) -> UmdResult<Action> {
        if dst % 8 != 0 {
            return Err(UmdError::invalid_arg("timestamp destination must be 8-byte aligned"));
        }
        self.range(dst, 8)?;
        Ok(Action::WriteTimestamp { dst })
    }

    pub fn launch(&mut self, launch: &KernelLaunch) -> UmdResult<Action> {
        if launch.group_count.contains(&0) {
            return Err(UmdError::invalid_arg("group counts must be non-zero"));
        }
        self.arguments(&launch.arguments)?;
        Ok(Action::Launch {
            kind: LaunchKind::Kernel,
            id: launch.kernel_id,
            group_count: launch.group_count,
        })
    }

    pub fn graph(&mut self, graph: &GraphLaunch) -> UmdResult<Action> {
        self.arguments(&graph.arguments)?;
        Ok(Action::Launch {
            kind: LaunchKind::Graph,
            id: graph.graph_id,
            group_count: [1, 1, 1],
        })
    }

    fn arguments(&mut self, args: &[BufferArg]) -> UmdResult<()> {
        args.iter().try_for_each(|a| self.range(a.ptr, a.size))
    }

    pub fn event_reset(&mut self, handle: EventHandle) -> UmdResult<Action> {
        let event = self.event(handle)?;
        Ok(Action::ResetEvent {
            slot: event.slot_ref(),
        })
    }

    pub fn query_timestamps(&mut self, handles: &[EventHandle], dst: u64) -> UmdResult<Action> {
        if handles.is_empty() {
            return Err(UmdError::invalid_arg("timestamp query needs at least one event"));
        }
        let mut slots = Vec::with_capacity(handles.len());
        for &h in handles {
            let event = self.event(h)?;
            if !event.timestamped() {
                return Err(UmdError::invalid_arg(
                    "event pool was not created with KERNEL_TIMESTAMP",
                ));
            }
            slots.push(event.slot_ref());
        }
        self.range(dst, (handles.len() * KERNEL_TIMESTAMP_RECORD_SIZE) as u64)?;
        Ok(Action::QueryTimestamps { slots, dst })
    }
}
