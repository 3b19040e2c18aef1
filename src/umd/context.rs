use crate::config::DriverConfig;
use crate::error::{UmdError, UmdResult};
use crate::handle::Arena;
use crate::kmd::{DeviceProperties, KMD_MAJOR_VERSION, SubmissionChannel};
use crate::trace::api_call;
use crate::umd::DeviceId;
use crate::umd::cmdlist::CommandList;
use crate::umd::event::EventRegistry;
use crate::umd::fence::Fence;
use crate::umd::memory::MemoryManager;
use crate::umd::memory::residency::MAX_DEVICES;
use crate::umd::queue::CommandQueue;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// ===============================================================================================
// Versioning
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// The API version this driver implements.
    pub const CURRENT: Self = Self { major: 1, minor: 6 };

    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ===============================================================================================
// Driver & Devices
// ===============================================================================================

/// One accelerator and the channel its work is submitted through.
#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub channel: Arc<dyn SubmissionChannel>,
}

impl Device {
    pub(crate) fn check_ordinal(&self, ordinal: u32) -> UmdResult<()> {
        let groups = self.channel.properties().engine_groups.len();
        if ordinal as usize >= groups {
            return Err(UmdError::invalid_arg(format!(
                "engine group ordinal {ordinal} out of range ({groups} groups)"
            )));
        }
        Ok(())
    }

    pub(crate) fn check_queue(&self, ordinal: u32, index: u32) -> UmdResult<()> {
        self.check_ordinal(ordinal)?;
        let count = self.channel.properties().engine_groups[ordinal as usize].queue_count;
        if index >= count {
            return Err(UmdError::invalid_arg(format!(
                "queue index {index} out of range ({count} queues in group {ordinal})"
            )));
        }
        Ok(())
    }
}

/// Entry point: the set of devices this process drives.
#[derive(Debug)]
pub struct Driver {
    api_version: ApiVersion,
    config: DriverConfig,
    devices: Vec<Arc<Device>>,
}

impl Driver {
    /// Negotiates versions and takes ownership of the device channels.
    ///
    /// # Errors
    /// `UnsupportedVersion` if the requested API major differs from
    /// [`ApiVersion::CURRENT`] or a channel speaks another transport major.
    /// `InvalidArgument` for an empty or oversized device list.
    pub fn init(
        requested: ApiVersion,
        config: DriverConfig,
        channels: Vec<Arc<dyn SubmissionChannel>>,
    ) -> UmdResult<Self> {
        api_call("zeInit", || {
            if requested.major != ApiVersion::CURRENT.major {
                return Err(UmdError::UnsupportedVersion {
                    requested_major: requested.major,
                    requested_minor: requested.minor,
                    supported_major: ApiVersion::CURRENT.major,
                });
            }
            if channels.is_empty() || channels.len() > MAX_DEVICES {
                return Err(UmdError::invalid_arg(format!(
                    "driver needs 1..={MAX_DEVICES} devices, got {}",
                    channels.len()
                )));
            }
            for channel in &channels {
                let v = channel.version();
                if v.major != KMD_MAJOR_VERSION {
                    return Err(UmdError::UnsupportedVersion {
                        requested_major: v.major,
                        requested_minor: v.minor,
                        supported_major: KMD_MAJOR_VERSION,
                    });
                }
            }

            let devices: Vec<Arc<Device>> = channels
                .into_iter()
                .enumerate()
                .map(|(i, channel)| {
                    Arc::new(Device {
                        id: DeviceId(i as u32),
                        channel,
                    })
                })
                .collect();

            info!(
                api = %requested,
                devices = devices.len(),
                "driver initialized"
            );
            Ok(Self {
                api_version: ApiVersion::new(requested.major, requested.minor.min(ApiVersion::CURRENT.minor)),
                config,
                devices,
            })
        })
    }

    /// The negotiated API version.
    #[must_use]
    pub const fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    #[must_use]
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id).collect()
    }

    pub fn device_properties(&self, device: DeviceId) -> UmdResult<DeviceProperties> {
        self.devices
            .get(device.index())
            .map(|d| d.channel.properties().clone())
            .ok_or_else(|| UmdError::invalid_arg(format!("unknown device {device:?}")))
    }

    pub fn create_context(&self) -> UmdResult<Context> {
        api_call("zeContextCreate", || {
            let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
            let inner = ContextInner {
                id,
                memory: MemoryManager::new(&self.config, self.devices.len(), id)?,
                events: EventRegistry::new(self.config.wait_spin, self.config.wait_slice),
                fences: Arena::new("fence"),
                queues: Arena::new("command queue"),
                lists: Arena::new("command list"),
                devices: self.devices.clone(),
                destroyed: RwLock::new(false),
            };
            debug!(context = id, "context created");
            Ok(Context {
                inner: Arc::new(inner),
            })
        })
    }
}

// ===============================================================================================
// Context
// ===============================================================================================

#[derive(Debug)]
pub(crate) struct ContextInner {
    pub id: u64,
    pub devices: Vec<Arc<Device>>,
    pub memory: MemoryManager,
    pub events: EventRegistry,
    pub fences: Arena<Fence>,
    pub queues: Arena<CommandQueue>,
    pub lists: Arena<CommandList>,
    // Every entry point holds this shared for its duration.
    pub destroyed: RwLock<bool>,
}

/// Owner of every driver object. Cheap to clone and usable from any thread.
///
/// Clones name the same context: once [`Context::destroy`] succeeds through
/// any of them, every entry point on every clone fails with `InvalidArgument`.
#[derive(Debug, Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn device(&self, device: DeviceId) -> UmdResult<Arc<Device>> {
        self.inner
            .devices
            .get(device.index())
            .cloned()
            .ok_or_else(|| UmdError::invalid_arg(format!("unknown device {device:?}")))
    }

    /// Runs the API entry `name` against a live context.
    pub(crate) fn api<T>(&self, name: &'static str, f: impl FnOnce() -> UmdResult<T>) -> UmdResult<T> {
        api_call(name, || {
            let destroyed = self.inner.destroyed.read_recursive();
            if *destroyed {
                return Err(UmdError::stale("context", self.inner.id));
            }
            f()
        })
    }

    /// Tears the context down.
    ///
    /// # Errors
    /// `HandleInUse` while any allocation, event pool, fence, queue or command
    /// list created from it is still alive, or while another thread is inside
    /// an entry point. The context is untouched then.
    /// `InvalidArgument` if it was already destroyed.
    pub fn destroy(&self) -> UmdResult<()> {
        api_call("zeContextDestroy", || {
            let inner = &self.inner;
            let Some(mut destroyed) = inner.destroyed.try_write() else {
                return Err(UmdError::in_use("context has calls in progress"));
            };
            if *destroyed {
                return Err(UmdError::stale("context", inner.id));
            }
            let outstanding = [
                ("allocation", inner.memory.live_allocations()),
                ("event pool", inner.events.pool_count()),
                ("fence", inner.fences.len()),
                ("command queue", inner.queues.len()),
                ("command list", inner.lists.len()),
            ];
            if let Some((kind, n)) = outstanding.iter().find(|(_, n)| *n > 0) {
                return Err(UmdError::in_use(format!("context still owns {n} {kind}(s)")));
            }
            *destroyed = true;
            debug!(context = inner.id, "context destroyed");
            Ok(())
        })
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        *self.inner.destroyed.read()
    }
}
