use npu_umd::kmd::SubmissionChannel;
use npu_umd::kmd::sim::SoftwareDevice;
use npu_umd::{
    ApiVersion, CommandListDesc, DeviceId, Driver, DriverConfig, EventPoolDesc, EventPoolFlags,
    QueueDesc, SyncStatus, UmdError,
};
use std::sync::Arc;

const SIZE: u64 = 2048;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Fill, Signal and Fence ===");

    let device: Arc<dyn SubmissionChannel> = Arc::new(SoftwareDevice::new(0));
    let driver = Driver::init(ApiVersion::CURRENT, DriverConfig::compact(), vec![device])?;
    let ctx = driver.create_context()?;
    let dev = DeviceId(0);
    println!("[+] Context ready");

    let buf = ctx.alloc_shared(None, SIZE, 0)?;
    println!("[+] Shared allocation at 0x{:x} ({} bytes)", buf.ptr(), buf.size);

    let pool = ctx.create_event_pool(EventPoolDesc {
        capacity: 2,
        flags: EventPoolFlags::HOST_VISIBLE,
    })?;
    let gate = ctx.create_event(pool, 0)?;
    let done = ctx.create_event(pool, 1)?;

    let list = ctx.create_command_list(dev, CommandListDesc::default())?;
    ctx.append_wait_on_events(list, &[gate])?;
    ctx.append_memory_fill(list, buf.ptr(), &[0xAB], SIZE, Some(done), &[])?;
    ctx.command_list_close(list)?;
    println!("[+] Recorded wait + fill + signal");

    let queue = ctx.create_command_queue(dev, QueueDesc::default())?;
    let fence = ctx.create_fence(queue)?;
    ctx.execute_command_lists(queue, &[list], Some(fence))?;
    println!("[+] Submitted; batch is held by the gate event");

    println!("\n[TEST 1] Freeing memory referenced by the running batch...");
    match ctx.free(buf.ptr()) {
        Err(UmdError::HandleInUse(msg)) => println!("    SUCCESS: refused ({msg})"),
        other => panic!("    FAILURE: unexpected result {other:?}"),
    }

    println!("\n[TEST 2] Waiting on the fence with a 10ms timeout...");
    match ctx.fence_host_synchronize(fence, 10_000_000) {
        Err(UmdError::NotReady) => println!("    SUCCESS: timed out as expected"),
        other => panic!("    FAILURE: unexpected result {other:?}"),
    }

    println!("\n[TEST 3] Opening the gate from the host...");
    ctx.event_host_signal(gate)?;
    ctx.fence_host_synchronize(fence, u64::MAX)?;
    let bytes = ctx.read_memory(buf.ptr(), SIZE)?;
    assert!(bytes.iter().all(|&b| b == 0xAB));
    assert_eq!(ctx.event_query_status(done)?, SyncStatus::Signaled);
    println!("    SUCCESS: {SIZE} bytes filled with 0xAB, completion event signaled");

    ctx.destroy_fence(fence)?;
    ctx.destroy_command_queue(queue)?;
    ctx.destroy_command_list(list)?;
    ctx.destroy_event(gate)?;
    ctx.destroy_event(done)?;
    ctx.destroy_event_pool(pool)?;
    ctx.free(buf.ptr())?;
    ctx.destroy()?;
    println!("\n=== Done ===");
    Ok(())
}
