use npu_umd::kmd::SubmissionChannel;
use npu_umd::kmd::sim::SoftwareDevice;
use npu_umd::{ApiVersion, Driver, DriverConfig, MemoryKind};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("                 npu-umd - Device Listing                   ");
    println!("============================================================");

    let config = DriverConfig::from_env();
    let channels: Vec<Arc<dyn SubmissionChannel>> = (0..2)
        .map(|i| Arc::new(SoftwareDevice::new(i)) as Arc<dyn SubmissionChannel>)
        .collect();
    let driver = Driver::init(ApiVersion::CURRENT, config.clone(), channels)?;
    println!("[+] Driver initialized, API {}", driver.api_version());

    for id in driver.devices() {
        let props = driver.device_properties(id)?;
        println!("\n[Device {}] {}", id.0, props.name);
        println!("    Timer frequency:   {} Hz", props.timer_frequency);
        println!("    Max fill pattern:  {} bytes", props.max_fill_pattern_size);
        for (ordinal, group) in props.engine_groups.iter().enumerate() {
            println!(
                "    Engine group {ordinal}:    {:?} x{}",
                group.engine, group.queue_count
            );
        }
    }

    let ctx = driver.create_context()?;
    println!("\n[+] Context {} created", ctx.id());
    for kind in [MemoryKind::Host, MemoryKind::Device, MemoryKind::Shared] {
        let usage = ctx.memory_usage(kind);
        println!(
            "    {kind:?} heap: {} MiB capacity, {} bytes in use",
            usage.capacity >> 20,
            usage.used
        );
    }
    println!("    VA window: {} GiB in {} shards", config.va_window_size >> 30, config.allocation_shards);

    ctx.destroy()?;
    println!("\n[+] Done");
    Ok(())
}
