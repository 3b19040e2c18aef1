#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::sync::OnceLock;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Host page size, queried once from `sysconf`.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret <= 0 {
            FALLBACK_PAGE_SIZE
        } else {
            ret as usize
        }
    })
}

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// FNV-1a over a byte slice. Used as the IPC handle checksum.
#[must_use]
pub const fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

/// Converts a Level-Zero style nanosecond timeout into an optional deadline.
/// `u64::MAX` means "wait forever".
pub fn deadline_from_ns(timeout_ns: u64) -> Option<std::time::Instant> {
    if timeout_ns == u64::MAX {
        None
    } else {
        std::time::Instant::now().checked_add(std::time::Duration::from_nanos(timeout_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 64), 4160);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8193, 2));
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn fnv_known_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn infinite_timeout_has_no_deadline() {
        assert!(deadline_from_ns(u64::MAX).is_none());
        assert!(deadline_from_ns(0).is_some());
    }
}
