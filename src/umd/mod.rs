//! User-mode driver objects: contexts, memory, events, fences, command lists,
//! queues and IPC sharing. Every public operation is a method on
//! [`Context`](context::Context), grouped by the module that implements it.

pub mod cmdlist;
pub mod context;
pub mod event;
pub mod fence;
pub mod ipc;
pub mod memory;
pub mod queue;

/// Index of a device within its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn bit(self) -> u64 {
        1u64 << (self.0 & 63)
    }
}
