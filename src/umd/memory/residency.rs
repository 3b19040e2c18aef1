//! Per-allocation residency, one bit per device.

use super::MemoryKind;
use crate::umd::DeviceId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Most devices a driver instance can address.
pub const MAX_DEVICES: usize = 64;

#[derive(Debug, Default)]
pub struct ResidencyMask(AtomicU64);

impl ResidencyMask {
    /// Initial residency for a fresh allocation.
    #[must_use]
    pub fn for_kind(kind: MemoryKind, device: Option<DeviceId>, device_count: usize) -> Self {
        let all = if device_count >= MAX_DEVICES {
            u64::MAX
        } else {
            (1u64 << device_count) - 1
        };
        let bits = match (kind, device) {
            (MemoryKind::Host, _) | (MemoryKind::Shared, None) => all,
            (MemoryKind::Device | MemoryKind::Shared, Some(d)) => d.bit(),
            (MemoryKind::Device, None) => 1,
        };
        Self(AtomicU64::new(bits))
    }

    pub fn make_resident(&self, device: DeviceId) {
        self.0.fetch_or(device.bit(), Ordering::AcqRel);
    }

    pub fn evict(&self, device: DeviceId) {
        self.0.fetch_and(!device.bit(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_resident(&self, device: DeviceId) -> bool {
        self.0.load(Ordering::Acquire) & device.bit() != 0
    }

    #[must_use]
    pub fn bits(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}
