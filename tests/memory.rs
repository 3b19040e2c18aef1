mod common;

use common::{Harness, SECOND};
use npu_umd::{DeviceId, MemoryKind, UmdError};
use proptest::prelude::*;
use std::sync::OnceLock;
use std::thread;

#[test]
fn concurrent_allocate_and_free() {
    let h = Harness::new(1);

    thread::scope(|s| {
        for _ in 0..2 {
            let ctx = h.ctx.clone();
            s.spawn(move || {
                let ptrs: Vec<u64> = (0..32)
                    .map(|_| ctx.alloc_device(DeviceId(0), 8192, 0).unwrap().ptr())
                    .collect();
                for p in ptrs {
                    ctx.free(p).unwrap();
                }
            });
        }
    });

    assert_eq!(h.ctx.live_allocations(), 0);
    assert_eq!(h.ctx.memory_usage(MemoryKind::Device).used, 0);
    h.ctx.destroy().unwrap();
}

#[test]
fn allocation_arguments_are_validated() {
    let h = Harness::new(1);
    let ctx = &h.ctx;

    assert!(matches!(ctx.alloc_host(0, 0), Err(UmdError::InvalidArgument(_))));
    assert!(matches!(ctx.alloc_host(64, 3), Err(UmdError::InvalidArgument(_))));
    assert!(matches!(
        ctx.alloc_host(64, 1 << 30),
        Err(UmdError::InvalidArgument(_))
    ));
    assert!(matches!(
        ctx.alloc_device(DeviceId(5), 64, 0),
        Err(UmdError::InvalidArgument(_))
    ));

    let cap = ctx.memory_usage(MemoryKind::Host).capacity;
    assert!(matches!(ctx.alloc_host(cap + 1, 0), Err(UmdError::OutOfMemory)));

    let a = ctx.alloc_host(100, 64 * 1024).unwrap();
    assert_eq!(a.ptr() % (64 * 1024), 0);
    assert!(matches!(ctx.free(a.ptr() + 1), Err(UmdError::InvalidArgument(_))));
    ctx.free(a.ptr()).unwrap();
    assert!(matches!(ctx.free(a.ptr()), Err(UmdError::InvalidArgument(_))));
}

#[test]
fn device_memory_is_not_host_accessible() {
    let h = Harness::new(1);
    let ctx = &h.ctx;
    let dev = ctx.alloc_device(DeviceId(0), 4096, 0).unwrap();
    assert!(matches!(
        ctx.read_memory(dev.ptr(), 16),
        Err(UmdError::InvalidArgument(_))
    ));
    let shared = ctx.alloc_shared(None, 4096, 0).unwrap();
    ctx.write_memory(shared.ptr() + 100, b"hello").unwrap();
    assert_eq!(ctx.read_memory(shared.ptr() + 100, 5).unwrap(), b"hello");
    ctx.free(dev.ptr()).unwrap();
    ctx.free(shared.ptr()).unwrap();
}

#[test]
fn evict_is_idempotent() {
    let h = Harness::new(2);
    let ctx = &h.ctx;
    let (d0, d1) = (DeviceId(0), DeviceId(1));

    let a = ctx.alloc_device(d0, 4096, 0).unwrap();
    assert!(ctx.is_resident(d0, a.ptr()).unwrap());
    assert!(!ctx.is_resident(d1, a.ptr()).unwrap());

    ctx.make_resident(d1, a.ptr()).unwrap();
    ctx.make_resident(d1, a.ptr()).unwrap();
    assert!(ctx.is_resident(d1, a.ptr()).unwrap());

    ctx.evict(d1, a.ptr()).unwrap();
    ctx.evict(d1, a.ptr()).unwrap();
    assert!(!ctx.is_resident(d1, a.ptr()).unwrap());
    assert!(ctx.is_resident(d0, a.ptr()).unwrap());

    ctx.free(a.ptr()).unwrap();
}

#[test]
fn non_resident_memory_is_rejected_at_submission() {
    let h = Harness::new(2);
    let ctx = &h.ctx;
    let (d0, d1) = (DeviceId(0), DeviceId(1));

    let a = ctx.alloc_device(d0, 4096, 0).unwrap();
    let queue = h.queue(d1);
    let list = h.list(d1);
    ctx.append_memory_fill(list, a.ptr(), &[1], 4096, None, &[]).unwrap();
    ctx.command_list_close(list).unwrap();

    assert!(matches!(
        ctx.execute_command_lists(queue, &[list], None),
        Err(UmdError::InvalidState(_))
    ));

    ctx.make_resident(d1, a.ptr()).unwrap();
    ctx.execute_command_lists(queue, &[list], None).unwrap();
    ctx.synchronize_command_queue(queue, 30 * SECOND).unwrap();

    ctx.destroy_command_list(list).unwrap();
    ctx.destroy_command_queue(queue).unwrap();
    ctx.free(a.ptr()).unwrap();
}

#[test]
fn context_teardown_requires_empty_context() {
    let h = Harness::new(1);
    let a = h.ctx.alloc_host(64, 0).unwrap();
    assert!(matches!(h.ctx.destroy(), Err(UmdError::HandleInUse(_))));

    // A refused destroy leaves the context and its allocation usable.
    assert!(!h.ctx.is_destroyed());
    h.ctx.write_memory(a.ptr(), &[7; 64]).unwrap();
    assert_eq!(h.ctx.live_allocations(), 1);
    h.ctx.free(a.ptr()).unwrap();

    let other = h.ctx.clone();
    h.ctx.destroy().unwrap();
    assert!(other.is_destroyed());
    assert!(matches!(
        other.alloc_device(DeviceId(0), 4096, 0),
        Err(UmdError::InvalidArgument(_))
    ));
    assert!(matches!(
        other.create_event_pool(npu_umd::EventPoolDesc {
            capacity: 1,
            flags: npu_umd::EventPoolFlags::HOST_VISIBLE,
        }),
        Err(UmdError::InvalidArgument(_))
    ));
    assert!(matches!(h.ctx.destroy(), Err(UmdError::InvalidArgument(_))));
    assert_eq!(other.live_allocations(), 0);
}

fn shared_harness() -> &'static Harness {
    static H: OnceLock<Harness> = OnceLock::new();
    H.get_or_init(|| Harness::new(1))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_interior_pointer_resolves(size in 1u64..=256 * 1024, probes in proptest::collection::vec(any::<u64>(), 1..16)) {
        let ctx = &shared_harness().ctx;
        let a = ctx.alloc_shared(None, size, 0).unwrap();

        for p in probes {
            let ptr = a.ptr() + p % size;
            let props = ctx.memory_properties(ptr).unwrap();
            prop_assert_eq!(props.id, a.id);
            prop_assert_eq!(props.kind, MemoryKind::Shared);
            let range = ctx.address_range(ptr).unwrap();
            prop_assert_eq!((range.base, range.size), (a.ptr(), size));
        }
        prop_assert!(ctx.memory_properties(a.ptr() + size).map_or(true, |p| p.id != a.id));
        prop_assert!(ctx.memory_properties(a.ptr().wrapping_sub(1)).map_or(true, |p| p.id != a.id));

        ctx.free(a.ptr()).unwrap();
        prop_assert!(ctx.memory_properties(a.ptr()).is_err());
    }
}
