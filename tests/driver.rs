mod common;

use common::Harness;
use npu_umd::kmd::sim::SoftwareDevice;
use npu_umd::kmd::{EngineType, KMD_MAJOR_VERSION, KmdVersion, SubmissionChannel};
use npu_umd::{ApiVersion, DeviceId, Driver, DriverConfig, QueueDesc, UmdError};
use std::sync::Arc;

fn channel() -> Arc<dyn SubmissionChannel> {
    Arc::new(SoftwareDevice::new(0))
}

#[test]
fn version_negotiation() {
    common::init_tracing();

    let err = Driver::init(ApiVersion::new(2, 0), DriverConfig::compact(), vec![channel()]).unwrap_err();
    assert!(matches!(err, UmdError::UnsupportedVersion { requested_major: 2, .. }));

    let old_kmd: Arc<dyn SubmissionChannel> = Arc::new(SoftwareDevice::new(0).with_version(KmdVersion {
        major: KMD_MAJOR_VERSION + 1,
        minor: 0,
    }));
    assert!(matches!(
        Driver::init(ApiVersion::CURRENT, DriverConfig::compact(), vec![old_kmd]),
        Err(UmdError::UnsupportedVersion { .. })
    ));

    assert!(matches!(
        Driver::init(ApiVersion::CURRENT, DriverConfig::compact(), Vec::new()),
        Err(UmdError::InvalidArgument(_))
    ));

    let newer_minor = ApiVersion::new(ApiVersion::CURRENT.major, ApiVersion::CURRENT.minor + 5);
    let driver = Driver::init(newer_minor, DriverConfig::compact(), vec![channel()]).unwrap();
    assert_eq!(driver.api_version(), ApiVersion::CURRENT);
}

#[test]
fn devices_and_queue_selection() {
    let h = Harness::new(2);
    assert_eq!(h.driver.devices(), vec![DeviceId(0), DeviceId(1)]);

    let props = h.driver.device_properties(DeviceId(1)).unwrap();
    assert_eq!(props.device_id, 1);
    assert_eq!(props.engine_groups[0].engine, EngineType::Compute);
    assert!(h.driver.device_properties(DeviceId(2)).is_err());

    let bad_ordinal = QueueDesc {
        ordinal: 9,
        ..QueueDesc::default()
    };
    assert!(matches!(
        h.ctx.create_command_queue(DeviceId(0), bad_ordinal),
        Err(UmdError::InvalidArgument(_))
    ));
    let bad_index = QueueDesc {
        ordinal: 1,
        index: props.engine_groups[1].queue_count,
        ..QueueDesc::default()
    };
    assert!(matches!(
        h.ctx.create_command_queue(DeviceId(0), bad_index),
        Err(UmdError::InvalidArgument(_))
    ));

    // A compute list cannot go to a copy queue.
    let copy = h
        .ctx
        .create_command_queue(
            DeviceId(0),
            QueueDesc {
                ordinal: 1,
                ..QueueDesc::default()
            },
        )
        .unwrap();
    let list = h.list(DeviceId(0));
    h.ctx.append_barrier(list, None, &[]).unwrap();
    h.ctx.command_list_close(list).unwrap();
    assert!(matches!(
        h.ctx.execute_command_lists(copy, &[list], None),
        Err(UmdError::InvalidArgument(_))
    ));

    assert!(h.ctx.destroy().is_err());
    h.ctx.destroy_command_list(list).unwrap();
    h.ctx.destroy_command_queue(copy).unwrap();
    h.ctx.destroy().unwrap();
    assert_eq!(h.devices[0].active_rings(), 0);
}
