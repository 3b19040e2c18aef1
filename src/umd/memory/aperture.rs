use super::ApertureAllocator;
use crate::utils::align_up;
use std::collections::BTreeMap;
use tracing::warn;

/// A managed range of virtual address space inside the reserved window.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_size: u64,

    // Occupied blocks, guard pages included: block start -> (block size, user address)
    allocations: BTreeMap<u64, (u64, u64)>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_size: u64) -> Self {
        Self {
            base,
            limit,
            align,
            guard_size,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Tries to place `[guard][size][guard]` with the user range aligned, at `candidate`.
    fn fit_at(&self, candidate: u64, size: u64, align: u64) -> (u64, u64) {
        let user = align_up(candidate + self.guard_size, align);
        let end = user + size + self.guard_size;
        (user, end)
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// First fit over the holes between tracked blocks.
    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(self.align);
        let mut candidate = self.base;

        for (&block_start, &(block_size, _)) in &self.allocations {
            let (user, end) = self.fit_at(candidate, size, align);
            if end <= block_start {
                self.allocations.insert(candidate, (end - candidate, user));
                return Some(user);
            }
            candidate = candidate.max(block_start + block_size);
        }

        let (user, end) = self.fit_at(candidate, size, align);
        if end <= self.limit {
            self.allocations.insert(candidate, (end - candidate, user));
            return Some(user);
        }

        None
    }

    fn free_va(&mut self, addr: u64) {
        let tracked = self
            .allocations
            .range(..=addr)
            .next_back()
            .filter(|(_, (_, user))| *user == addr)
            .map(|(&start, _)| start);

        match tracked {
            Some(start) => {
                self.allocations.remove(&start);
            }
            None => warn!(addr = format_args!("0x{addr:x}"), "freeing untracked VA"),
        }
    }
}
