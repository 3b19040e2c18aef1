//! Driver tunables.
//!
//! Defaults are sized for a single accelerator; every field can be overridden
//! through `NPU_UMD_*` environment variables via [`DriverConfig::from_env`].

use std::time::Duration;
use tracing::warn;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Capacity of the host-memory pool in bytes.
    pub host_heap_size: u64,
    /// Capacity of the device-memory pool in bytes.
    pub device_heap_size: u64,
    /// Capacity of the shared-memory pool in bytes.
    pub shared_heap_size: u64,
    /// Size of the reserved virtual address window all allocations live in.
    pub va_window_size: u64,
    /// Number of independently locked address-range shards.
    pub allocation_shards: usize,
    /// Largest alignment `allocate` accepts.
    pub max_alignment: u64,
    /// Busy-wait budget before a host wait goes to sleep.
    pub wait_spin: Duration,
    /// Upper bound on a single sleep while waiting on slot memory.
    pub wait_slice: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host_heap_size: 4 * GIB,
            device_heap_size: 4 * GIB,
            shared_heap_size: 4 * GIB,
            va_window_size: 64 * GIB,
            allocation_shards: 16,
            max_alignment: 2 * MIB,
            wait_spin: Duration::from_micros(20),
            wait_slice: Duration::from_millis(1),
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A small footprint used by tests and demos.
    #[must_use]
    pub fn compact() -> Self {
        Self {
            host_heap_size: 64 * MIB,
            device_heap_size: 64 * MIB,
            shared_heap_size: 64 * MIB,
            va_window_size: GIB,
            allocation_shards: 4,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_host_heap(mut self, bytes: u64) -> Self {
        self.host_heap_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_device_heap(mut self, bytes: u64) -> Self {
        self.device_heap_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_shared_heap(mut self, bytes: u64) -> Self {
        self.shared_heap_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_va_window(mut self, bytes: u64) -> Self {
        self.va_window_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_shards(mut self, shards: usize) -> Self {
        self.allocation_shards = shards;
        self
    }

    #[must_use]
    pub const fn with_max_alignment(mut self, align: u64) -> Self {
        self.max_alignment = align;
        self
    }

    /// Applies `NPU_UMD_*` overrides on top of the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read_u64 = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match parse_size(&raw) {
                Some(v) => Some(v),
                None => {
                    warn!(key, value = %raw, "ignoring malformed configuration override");
                    None
                }
            }
        };

        if let Some(v) = read_u64("NPU_UMD_HOST_HEAP") {
            self.host_heap_size = v;
        }
        if let Some(v) = read_u64("NPU_UMD_DEVICE_HEAP") {
            self.device_heap_size = v;
        }
        if let Some(v) = read_u64("NPU_UMD_SHARED_HEAP") {
            self.shared_heap_size = v;
        }
        if let Some(v) = read_u64("NPU_UMD_VA_WINDOW") {
            self.va_window_size = v;
        }
        if let Some(v) = read_u64("NPU_UMD_SHARDS") {
            if v == 0 {
                warn!("NPU_UMD_SHARDS must be non-zero; keeping {}", self.allocation_shards);
            } else {
                self.allocation_shards = usize::try_from(v).unwrap_or(self.allocation_shards);
            }
        }
        if let Some(v) = read_u64("NPU_UMD_MAX_ALIGNMENT") {
            if v.is_power_of_two() {
                self.max_alignment = v;
            } else {
                warn!(value = v, "NPU_UMD_MAX_ALIGNMENT must be a power of two");
            }
        }
        if let Some(v) = read_u64("NPU_UMD_WAIT_SPIN_US") {
            self.wait_spin = Duration::from_micros(v);
        }
        if let Some(v) = read_u64("NPU_UMD_WAIT_SLICE_US") {
            self.wait_slice = Duration::from_micros(v.max(1));
        }
        self
    }
}

/// Parses plain integers and `K`/`M`/`G` suffixed sizes (binary multiples).
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, mult) = match raw.char_indices().last()? {
        (i, 'k' | 'K') => (&raw[..i], 1024),
        (i, 'm' | 'M') => (&raw[..i], MIB),
        (i, 'g' | 'G') => (&raw[..i], GIB),
        _ => (raw, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size(" 2m "), Some(2 * MIB));
        assert_eq!(parse_size("1G"), Some(GIB));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("NPU_UMD_DEVICE_HEAP", "128M"),
            ("NPU_UMD_SHARDS", "0"),
            ("NPU_UMD_MAX_ALIGNMENT", "3000"),
            ("NPU_UMD_HOST_HEAP", "garbage"),
        ]
        .into_iter()
        .collect();

        let cfg = DriverConfig::default()
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(cfg.device_heap_size, 128 * MIB);
        assert_eq!(cfg.allocation_shards, DriverConfig::default().allocation_shards);
        assert_eq!(cfg.max_alignment, DriverConfig::default().max_alignment);
        assert_eq!(cfg.host_heap_size, DriverConfig::default().host_heap_size);
    }
}
