mod common;

use common::{Harness, SECOND};
use npu_umd::{DeviceId, EventPoolDesc, EventPoolFlags, IpcHandle, MemoryKind, SyncStatus, UmdError};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

const DEV: DeviceId = DeviceId(0);

#[test]
fn memory_round_trip_between_contexts() {
    let h = Harness::new(1);
    let exporter = &h.ctx;
    let importer = h.driver.create_context().unwrap();

    let a = exporter.alloc_shared(None, 4096, 0).unwrap();
    exporter.write_memory(a.ptr(), b"shared bytes").unwrap();

    let handle = exporter.get_memory_ipc_handle(a.ptr()).unwrap();
    let b = importer.open_memory_ipc_handle(DEV, handle).unwrap();
    assert_eq!(b.size, a.size);
    assert_eq!(b.kind, MemoryKind::Shared);
    assert!(b.imported);
    assert_eq!(importer.read_memory(b.ptr(), 12).unwrap(), b"shared bytes");

    importer.write_memory(b.ptr() + 100, &[0xEE; 4]).unwrap();
    assert_eq!(exporter.read_memory(a.ptr() + 100, 4).unwrap(), vec![0xEE; 4]);

    // Reopening yields the same local mapping; each open needs its own close.
    let again = importer.open_memory_ipc_handle(DEV, handle).unwrap();
    assert_eq!(again.ptr(), b.ptr());
    assert!(matches!(importer.free(b.ptr()), Err(UmdError::InvalidArgument(_))));
    importer.close_memory_ipc_handle(b.ptr()).unwrap();
    assert!(importer.memory_properties(b.ptr()).is_ok());
    importer.close_memory_ipc_handle(b.ptr()).unwrap();
    assert!(importer.memory_properties(b.ptr()).is_err());

    // The exporter is untouched by the importer's close.
    assert_eq!(exporter.read_memory(a.ptr(), 12).unwrap(), b"shared bytes");
    exporter.put_memory_ipc_handle(handle).unwrap();
    assert!(matches!(
        exporter.put_memory_ipc_handle(handle),
        Err(UmdError::InvalidArgument(_))
    ));
    exporter.free(a.ptr()).unwrap();
    importer.destroy().unwrap();
}

#[test]
fn device_work_is_visible_through_an_import() {
    let h = Harness::new(1);
    let importer = h.driver.create_context().unwrap();

    let a = h.ctx.alloc_shared(None, 1024, 0).unwrap();
    let handle = h.ctx.get_memory_ipc_handle(a.ptr()).unwrap();
    let b = importer.open_memory_ipc_handle(DEV, handle).unwrap();

    let queue = importer.create_command_queue(DEV, npu_umd::QueueDesc::default()).unwrap();
    let list = importer
        .create_command_list(DEV, npu_umd::CommandListDesc::default())
        .unwrap();
    importer.append_memory_fill(list, b.ptr(), &[0x3C], 1024, None, &[]).unwrap();
    importer.command_list_close(list).unwrap();
    importer.execute_command_lists(queue, &[list], None).unwrap();
    importer.synchronize_command_queue(queue, 30 * SECOND).unwrap();

    assert!(h.ctx.read_memory(a.ptr(), 1024).unwrap().iter().all(|&x| x == 0x3C));

    importer.destroy_command_list(list).unwrap();
    importer.destroy_command_queue(queue).unwrap();
    importer.close_memory_ipc_handle(b.ptr()).unwrap();
    h.ctx.put_memory_ipc_handle(handle).unwrap();
    h.ctx.free(a.ptr()).unwrap();
}

#[test]
fn event_pool_round_trip() {
    let h = Harness::new(1);
    let importer = h.driver.create_context().unwrap();

    let plain = h
        .ctx
        .create_event_pool(EventPoolDesc {
            capacity: 2,
            flags: EventPoolFlags::HOST_VISIBLE,
        })
        .unwrap();
    assert!(matches!(
        h.ctx.get_event_pool_ipc_handle(plain),
        Err(UmdError::InvalidArgument(_))
    ));

    let pool = h
        .ctx
        .create_event_pool(EventPoolDesc {
            capacity: 8,
            flags: EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC,
        })
        .unwrap();
    let ev = h.ctx.create_event(pool, 5).unwrap();
    let handle = h.ctx.get_event_pool_ipc_handle(pool).unwrap();

    let local = importer.open_event_pool_ipc_handle(handle).unwrap();
    assert_eq!(
        importer.event_pool_info(local),
        Some((8, EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC))
    );
    let mirror = importer.create_event(local, 5).unwrap();
    assert_eq!(importer.event_query_status(mirror).unwrap(), SyncStatus::Pending);

    let waiter = {
        let importer = importer.clone();
        std::thread::spawn(move || importer.event_host_synchronize(mirror, 30 * SECOND))
    };
    h.ctx.event_host_signal(ev).unwrap();
    waiter.join().unwrap().unwrap();

    assert!(matches!(
        importer.close_event_pool_ipc_handle(local),
        Err(UmdError::HandleInUse(_))
    ));
    importer.destroy_event(mirror).unwrap();
    importer.close_event_pool_ipc_handle(local).unwrap();

    h.ctx.put_event_pool_ipc_handle(handle).unwrap();
    h.ctx.destroy_event(ev).unwrap();
    h.ctx.destroy_event_pool(pool).unwrap();
    h.ctx.destroy_event_pool(plain).unwrap();
}

#[test]
fn malformed_and_mismatched_handles_are_rejected() {
    let h = Harness::new(1);
    let a = h.ctx.alloc_host(64, 0).unwrap();
    let handle = h.ctx.get_memory_ipc_handle(a.ptr()).unwrap();

    let mut bytes = *handle.as_bytes();
    bytes[20] ^= 0x40;
    assert!(matches!(
        h.ctx.open_memory_ipc_handle(DEV, IpcHandle::from_bytes(bytes)),
        Err(UmdError::InvalidArgument(_))
    ));
    assert!(matches!(
        h.ctx.open_memory_ipc_handle(DEV, IpcHandle::from_bytes([0; 64])),
        Err(UmdError::InvalidArgument(_))
    ));
    assert!(matches!(
        h.ctx.open_event_pool_ipc_handle(handle),
        Err(UmdError::InvalidArgument(_))
    ));

    h.ctx.put_memory_ipc_handle(handle).unwrap();
    h.ctx.free(a.ptr()).unwrap();
}

#[test]
fn vanished_exporter_object_is_not_available() {
    let h = Harness::new(1);
    let importer = h.driver.create_context().unwrap();

    let a = h.ctx.alloc_shared(None, 4096, 0).unwrap();
    let handle = h.ctx.get_memory_ipc_handle(a.ptr()).unwrap();
    h.ctx.free(a.ptr()).unwrap();

    assert!(matches!(
        importer.open_memory_ipc_handle(DEV, handle),
        Err(UmdError::NotAvailable(_))
    ));
}

// ===============================================================================================
// Across processes
// ===============================================================================================

const EXPORTER_ENV: &str = "NPU_UMD_IPC_EXPORTER";
const GREETING: &[u8] = b"from the exporter";

fn to_hex(handle: &IpcHandle) -> String {
    handle.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(hex: &str) -> IpcHandle {
    let mut bytes = [0u8; 64];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).unwrap();
    }
    IpcHandle::from_bytes(bytes)
}

/// Exporter side of `handles_cross_a_process_boundary`. Does nothing unless
/// that test spawned this binary.
#[test]
fn exporter_process() {
    if std::env::var_os(EXPORTER_ENV).is_none() {
        return;
    }
    let h = Harness::new(1);
    let a = h.ctx.alloc_shared(None, 4096, 0).unwrap();
    h.ctx.write_memory(a.ptr(), GREETING).unwrap();
    let pool = h
        .ctx
        .create_event_pool(EventPoolDesc {
            capacity: 1,
            flags: EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC,
        })
        .unwrap();
    let ev = h.ctx.create_event(pool, 0).unwrap();

    let mem = h.ctx.get_memory_ipc_handle(a.ptr()).unwrap();
    let shared = h.ctx.get_event_pool_ipc_handle(pool).unwrap();
    println!("npu-umd-ipc {} {}", to_hex(&mem), to_hex(&shared));

    // The importer signals through its own mapping once it has written its reply.
    h.ctx.event_host_synchronize(ev, 60 * SECOND).unwrap();
    assert_eq!(h.ctx.read_memory(a.ptr() + 1024, 5).unwrap(), b"reply");

    h.ctx.put_event_pool_ipc_handle(shared).unwrap();
    h.ctx.put_memory_ipc_handle(mem).unwrap();
    h.ctx.destroy_event(ev).unwrap();
    h.ctx.destroy_event_pool(pool).unwrap();
    h.ctx.free(a.ptr()).unwrap();
}

#[test]
fn handles_cross_a_process_boundary() {
    let mut child = Command::new(std::env::current_exe().unwrap())
        .args(["exporter_process", "--exact", "--nocapture", "--test-threads=1", "--quiet"])
        .env(EXPORTER_ENV, "1")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
    let announced = lines
        .by_ref()
        .map(Result::unwrap)
        .find(|l| l.starts_with("npu-umd-ipc "))
        .expect("exporter never announced its handles");
    let mut fields = announced.split_whitespace().skip(1);
    let mem = from_hex(fields.next().unwrap());
    let shared = from_hex(fields.next().unwrap());

    let h = Harness::new(1);
    let b = match h.ctx.open_memory_ipc_handle(DEV, mem) {
        Ok(b) => b,
        Err(UmdError::NotAvailable(e)) => {
            // pidfd_getfd needs ptrace access to the exporter, which some sandboxes deny.
            eprintln!("skipping cross-process import: {e}");
            let _ = child.kill();
            let _ = child.wait();
            return;
        }
        Err(e) => panic!("open failed: {e}"),
    };
    assert!(b.imported);
    assert_eq!(h.ctx.read_memory(b.ptr(), GREETING.len() as u64).unwrap(), GREETING);
    h.ctx.write_memory(b.ptr() + 1024, b"reply").unwrap();

    let local = h.ctx.open_event_pool_ipc_handle(shared).unwrap();
    let mirror = h.ctx.create_event(local, 0).unwrap();
    h.ctx.event_host_signal(mirror).unwrap();

    for line in lines {
        line.unwrap();
    }
    assert!(child.wait().unwrap().success(), "exporter process failed");

    h.ctx.destroy_event(mirror).unwrap();
    h.ctx.close_event_pool_ipc_handle(local).unwrap();
    h.ctx.close_memory_ipc_handle(b.ptr()).unwrap();
}
