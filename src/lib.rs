//! User-mode driver for a Level-Zero style compute accelerator.
//!
//! [`Driver`] is the entry point: it negotiates versions with one
//! [`SubmissionChannel`](kmd::SubmissionChannel) per device and hands out
//! [`Context`]s, on which every memory, event, fence, command list, queue and
//! IPC operation is a method.

pub mod config;
pub mod error;
pub mod handle;
pub mod kmd;
pub mod trace;
pub mod umd;
pub mod utils;

pub use config::DriverConfig;
pub use error::{ResultCode, UmdError, UmdResult};
pub use umd::DeviceId;
pub use umd::cmdlist::command::{BufferArg, CopyRegion, GraphLaunch, KernelLaunch, PitchedBuffer};
pub use umd::cmdlist::{CommandListDesc, CommandListHandle};
pub use umd::context::{ApiVersion, Context, Driver};
pub use umd::event::{
    EventHandle, EventPoolDesc, EventPoolFlags, EventPoolHandle, KernelTimestampResult, SyncStatus,
};
pub use umd::fence::FenceHandle;
pub use umd::ipc::IpcHandle;
pub use umd::memory::{Allocation, MemoryKind};
pub use umd::queue::{QueueDesc, QueueHandle, QueueMode, QueuePriority};
