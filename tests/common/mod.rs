#![allow(dead_code)]

use npu_umd::kmd::SubmissionChannel;
use npu_umd::kmd::sim::SoftwareDevice;
use npu_umd::{
    ApiVersion, CommandListDesc, CommandListHandle, Context, DeviceId, Driver, DriverConfig,
    EventHandle, EventPoolDesc, EventPoolFlags, EventPoolHandle, QueueDesc, QueueHandle,
};
use std::sync::{Arc, Once};

pub const SECOND: u64 = 1_000_000_000;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub driver: Driver,
    pub ctx: Context,
    pub devices: Vec<Arc<SoftwareDevice>>,
}

impl Harness {
    pub fn new(device_count: u32) -> Self {
        init_tracing();
        let devices: Vec<Arc<SoftwareDevice>> = (0..device_count)
            .map(|i| Arc::new(SoftwareDevice::new(i)))
            .collect();
        let channels: Vec<Arc<dyn SubmissionChannel>> = devices
            .iter()
            .map(|d| d.clone() as Arc<dyn SubmissionChannel>)
            .collect();
        let driver = Driver::init(ApiVersion::CURRENT, DriverConfig::compact(), channels)
            .expect("driver init");
        let ctx = driver.create_context().expect("context");
        Self {
            driver,
            ctx,
            devices,
        }
    }

    pub fn queue(&self, device: DeviceId) -> QueueHandle {
        self.ctx
            .create_command_queue(device, QueueDesc::default())
            .expect("queue")
    }

    pub fn list(&self, device: DeviceId) -> CommandListHandle {
        self.ctx
            .create_command_list(device, CommandListDesc::default())
            .expect("list")
    }

    /// A host-visible pool of `capacity` slots with one event per slot.
    pub fn events(&self, capacity: u32) -> (EventPoolHandle, Vec<EventHandle>) {
        let pool = self
            .ctx
            .create_event_pool(EventPoolDesc {
                capacity,
                flags: EventPoolFlags::HOST_VISIBLE,
            })
            .expect("pool");
        let events = (0..capacity)
            .map(|i| self.ctx.create_event(pool, i).expect("event"))
            .collect();
        (pool, events)
    }

    pub fn release_events(&self, pool: EventPoolHandle, events: Vec<EventHandle>) {
        for e in events {
            self.ctx.destroy_event(e).expect("destroy event");
        }
        self.ctx.destroy_event_pool(pool).expect("destroy pool");
    }
}

/// Retries `f` until it succeeds or five seconds pass.
pub fn eventually<T, E: std::fmt::Debug>(mut f: impl FnMut() -> Result<T, E>) -> T {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        match f() {
            Ok(v) => return v,
            Err(e) if std::time::Instant::now() >= deadline => panic!("gave up: {e:?}"),
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
        }
    }
}
