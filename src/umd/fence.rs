//! Fences: one-shot completion markers on a queue's timeline.
//!
//! A fence is armed with the sequence number of the batch it was submitted
//! with and reads as signalled once the timeline has retired that batch.

use crate::error::{UmdError, UmdResult};
use crate::handle::Handle;
use crate::umd::context::Context;
use crate::umd::event::SyncStatus;
use crate::umd::queue::{CommandQueue, QueueHandle};
use crate::utils::deadline_from_ns;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type FenceHandle = Handle<Fence>;

#[derive(Debug)]
pub struct Fence {
    queue: Arc<CommandQueue>,
    // 0 while unarmed
    seq: AtomicU64,
}

impl Fence {
    pub(crate) fn belongs_to(&self, queue: &Arc<CommandQueue>) -> bool {
        Arc::ptr_eq(&self.queue, queue)
    }

    pub(crate) fn arm(&self, seq: u64) -> UmdResult<()> {
        self.seq
            .compare_exchange(0, seq, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| UmdError::invalid_state("fence is already armed; reset it before reuse"))
    }

    pub(crate) fn disarm(&self, seq: u64) {
        let _ = self
            .seq
            .compare_exchange(seq, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn armed(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Armed with a batch that has not retired yet.
    fn outstanding(&self) -> bool {
        let seq = self.armed();
        seq != 0 && self.queue.timeline().retired() < seq
    }

    fn check_idle(&self) -> UmdResult<()> {
        if self.outstanding() {
            return Err(UmdError::in_use("fence submission is still outstanding"));
        }
        Ok(())
    }
}

impl Context {
    pub fn create_fence(&self, queue: QueueHandle) -> UmdResult<FenceHandle> {
        self.api("zeFenceCreate", || {
            let queue = self.inner.queues.get(queue)?;
            queue.bind_fence();
            let result = self.inner.fences.insert_with(|_| Fence {
                queue: queue.clone(),
                seq: AtomicU64::new(0),
            });
            match result {
                Ok((handle, _)) => Ok(handle),
                Err(e) => {
                    queue.unbind_fence();
                    Err(e)
                }
            }
        })
    }

    pub fn destroy_fence(&self, fence: FenceHandle) -> UmdResult<()> {
        self.api("zeFenceDestroy", || {
            let fence = self.inner.fences.remove_if(fence, Fence::check_idle)?;
            fence.queue.unbind_fence();
            Ok(())
        })
    }

    /// Waits for the fence's batch. An unarmed fence is waited on until it is
    /// armed and retires, or until the timeout.
    pub fn fence_host_synchronize(&self, fence: FenceHandle, timeout_ns: u64) -> UmdResult<()> {
        self.api("zeFenceHostSynchronize", || {
            let fence = self.inner.fences.get(fence)?;
            fence
                .queue
                .timeline()
                .wait(|| fence.armed(), deadline_from_ns(timeout_ns))
        })
    }

    pub fn fence_query_status(&self, fence: FenceHandle) -> UmdResult<SyncStatus> {
        self.api("zeFenceQueryStatus", || {
            let fence = self.inner.fences.get(fence)?;
            let done = fence.queue.timeline().query(fence.armed())?;
            Ok(if done {
                SyncStatus::Signaled
            } else {
                SyncStatus::Pending
            })
        })
    }

    pub fn fence_reset(&self, fence: FenceHandle) -> UmdResult<()> {
        self.api("zeFenceReset", || {
            let fence = self.inner.fences.get(fence)?;
            fence.check_idle()?;
            fence.seq.store(0, Ordering::Release);
            Ok(())
        })
    }
}
