use npu_umd::kmd::SubmissionChannel;
use npu_umd::kmd::sim::SoftwareDevice;
use npu_umd::{ApiVersion, DeviceId, Driver, DriverConfig, EventPoolDesc, EventPoolFlags};
use std::sync::Arc;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== IPC Handle Sharing ===");

    let device: Arc<dyn SubmissionChannel> = Arc::new(SoftwareDevice::new(0));
    let driver = Driver::init(ApiVersion::CURRENT, DriverConfig::compact(), vec![device])?;
    let exporter = driver.create_context()?;
    let importer = driver.create_context()?;
    println!("[+] Exporter context {}, importer context {}", exporter.id(), importer.id());

    // Memory
    let a = exporter.alloc_shared(None, 4096, 0)?;
    exporter.write_memory(a.ptr(), b"hello from the exporter")?;
    let handle = exporter.get_memory_ipc_handle(a.ptr())?;
    println!("[+] Memory handle: {}", hex(handle.as_bytes()));

    let b = importer.open_memory_ipc_handle(DeviceId(0), handle)?;
    let text = importer.read_memory(b.ptr(), 23)?;
    println!(
        "    Imported at 0x{:x}, size {}, reads \"{}\"",
        b.ptr(),
        b.size,
        String::from_utf8_lossy(&text)
    );

    // Event pool
    let pool = exporter.create_event_pool(EventPoolDesc {
        capacity: 4,
        flags: EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC,
    })?;
    let ev = exporter.create_event(pool, 2)?;
    let pool_handle = exporter.get_event_pool_ipc_handle(pool)?;
    let local = importer.open_event_pool_ipc_handle(pool_handle)?;
    let mirror = importer.create_event(local, 2)?;

    exporter.event_host_signal(ev)?;
    importer.event_host_synchronize(mirror, 1_000_000_000)?;
    println!("[+] Signal crossed the shared event pool");

    importer.destroy_event(mirror)?;
    importer.close_event_pool_ipc_handle(local)?;
    importer.close_memory_ipc_handle(b.ptr())?;
    exporter.put_event_pool_ipc_handle(pool_handle)?;
    exporter.put_memory_ipc_handle(handle)?;
    exporter.destroy_event(ev)?;
    exporter.destroy_event_pool(pool)?;
    exporter.free(a.ptr())?;

    importer.destroy()?;
    exporter.destroy()?;
    println!("=== Done ===");
    Ok(())
}
