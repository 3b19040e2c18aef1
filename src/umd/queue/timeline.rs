//! Per-queue batch sequence.
//!
//! Batches get consecutive sequence numbers at submission. Completion
//! callbacks may arrive in any order; the timeline parks early arrivals and
//! only advances the retired watermark over an unbroken prefix, releasing each
//! batch's references as it retires.

use crate::error::{UmdError, UmdResult};
use crate::kmd::{JobStatus, RingId};
use crate::umd::cmdlist::CommandList;
use crate::umd::event::Event;
use crate::umd::memory::manager::AllocationRecord;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// References a submitted batch pins until it retires.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub seq: u64,
    pub allocations: Vec<Arc<AllocationRecord>>,
    /// Each event once, with whether the batch signals it.
    pub events: Vec<(Arc<Event>, bool)>,
    pub lists: Vec<Arc<CommandList>>,
}

impl Batch {
    /// Drops the batch's in-flight counts. The `Arc`s themselves stay held.
    fn release(&self, lost: bool) {
        for record in &self.allocations {
            record.release();
        }
        for (event, signals) in &self.events {
            event.retire(*signals, lost);
        }
        for list in &self.lists {
            list.retire();
        }
    }
}

#[derive(Debug)]
struct Pending {
    batch: Batch,
    status: Option<JobStatus>,
}

#[derive(Debug, Default)]
struct TimelineState {
    submitted: u64,
    retired: u64,
    lost_at: Option<u64>,
    pending: VecDeque<Pending>,
}

#[derive(Debug)]
pub(crate) struct Timeline {
    ring: RingId,
    state: Mutex<TimelineState>,
    cond: Condvar,
}

impl Timeline {
    pub fn new(ring: RingId) -> Self {
        Self {
            ring,
            state: Mutex::new(TimelineState::default()),
            cond: Condvar::new(),
        }
    }

    /// Sequence number the next pushed batch will get.
    pub fn next_seq(&self) -> u64 {
        self.state.lock().submitted + 1
    }

    pub fn push(&self, batch: Batch) {
        let mut st = self.state.lock();
        debug_assert_eq!(batch.seq, st.submitted + 1);
        st.submitted = batch.seq;
        st.pending.push_back(Pending {
            batch,
            status: None,
        });
        drop(st);
        self.cond.notify_all();
    }

    /// Records the outcome of batch `seq` and retires every batch now at the head.
    pub fn complete(&self, seq: u64, status: JobStatus) {
        let mut retired = Vec::new();
        {
            let mut st = self.state.lock();
            if status == JobStatus::DeviceLost && st.lost_at.is_none_or(|l| seq < l) {
                error!(ring = self.ring, seq, "batch completed with device loss");
                st.lost_at = Some(seq);
            }

            let head = st.retired + 1;
            let Some(slot) = seq
                .checked_sub(head)
                .and_then(|i| st.pending.get_mut(usize::try_from(i).ok()?))
            else {
                error!(ring = self.ring, seq, "completion for unknown batch");
                return;
            };
            slot.status = Some(status);

            // Counts drop before the watermark moves, so a waiter that sees the
            // batch retired can immediately free what it referenced.
            while st.pending.front().is_some_and(|p| p.status.is_some()) {
                if let Some(p) = st.pending.pop_front() {
                    let lost = p.status == Some(JobStatus::DeviceLost);
                    p.batch.release(lost);
                    st.retired = p.batch.seq;
                    debug!(ring = self.ring, seq = p.batch.seq, lost, "batch retired");
                    retired.push(p.batch);
                }
            }
        }

        self.cond.notify_all();
        // Dropping the last reference to a list or pool can cascade into other
        // objects, so it happens outside the lock.
        drop(retired);
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().lost_at.is_some()
    }

    pub fn retired(&self) -> u64 {
        self.state.lock().retired
    }

    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    pub fn outstanding(&self) -> u64 {
        let st = self.state.lock();
        st.submitted - st.retired
    }

    /// Non-blocking check of batch `seq`: `Ok(true)` once retired.
    pub fn query(&self, seq: u64) -> UmdResult<bool> {
        let st = self.state.lock();
        if st.lost_at.is_some() {
            return Err(UmdError::DeviceLost);
        }
        Ok(seq != 0 && st.retired >= seq)
    }

    /// Blocks until the batch named by `target` retires.
    ///
    /// `target` is re-read on every wakeup and `0` means "nothing submitted
    /// yet", which lets a fence be waited on before it is armed. Once the
    /// queue is lost every wait reports `DeviceLost`.
    pub fn wait(&self, target: impl Fn() -> u64, deadline: Option<Instant>) -> UmdResult<()> {
        let mut st = self.state.lock();
        loop {
            if st.lost_at.is_some() {
                return Err(UmdError::DeviceLost);
            }
            let seq = target();
            if seq != 0 && st.retired >= seq {
                return Ok(());
            }
            match deadline {
                None => self.cond.wait(&mut st),
                Some(d) => {
                    if Instant::now() >= d {
                        return Err(UmdError::NotReady);
                    }
                    let _ = self.cond.wait_until(&mut st, d);
                }
            }
        }
    }

    /// Blocks until everything submitted before the call has retired.
    pub fn wait_idle(&self, deadline: Option<Instant>) -> UmdResult<()> {
        let target = self.submitted();
        if target == 0 {
            return if self.is_lost() {
                Err(UmdError::DeviceLost)
            } else {
                Ok(())
            };
        }
        self.wait(|| target, deadline)
    }
}
