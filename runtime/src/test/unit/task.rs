use std::sync::Arc;

use conduit_device::{DeviceKind, ExecParams, HostArray};
use conduit_dtype::ScalarValue;
use test_case::test_case;

use crate::test::support::{Fill, Increment, cpu_device};
use crate::{Access, Argument, DefaultDevice, DeviceRequest, EngineConfig, Error, Task};

#[test]
fn test_builder_keeps_argument_order() {
    let a = HostArray::zeroed::<f32>(4);
    let b = HostArray::zeroed::<f32>(4);
    let task = Task::builder("t0", Arc::new(Fill))
        .write(&a)
        .scalar(3i32)
        .read(&b)
        .arg(&a, Access::ReadWrite)
        .params(ExecParams::new_1d(4, 1))
        .build();

    assert_eq!(task.id(), "t0");
    assert_eq!(task.program().name(), "fill");
    assert_eq!(task.accesses(), &[Access::Write, Access::Read, Access::Read, Access::ReadWrite]);
    assert!(matches!(&task.arguments()[0], Argument::Object(object) if object.ptr_eq(&a)));
    assert!(matches!(task.arguments()[1], Argument::Scalar(ScalarValue::Int32(3))));
    assert!(matches!(&task.arguments()[2], Argument::Object(object) if object.ptr_eq(&b)));
    assert_eq!(task.params().work_items(), 4);
}

#[test_case(Access::Read, true, false)]
#[test_case(Access::Write, false, true)]
#[test_case(Access::ReadWrite, true, true)]
fn test_access_modes(access: Access, reads: bool, writes: bool) {
    assert_eq!(access.reads(), reads);
    assert_eq!(access.writes(), writes);
}

#[test]
fn test_device_mapping() {
    let device = cpu_device("d0");
    let task = Task::builder("t0", Arc::new(Increment)).build();
    assert!(task.device_request().is_none());

    task.map_to_selector("cpu:0");
    assert!(matches!(task.device_request(), Some(DeviceRequest::Selector(selector)) if selector == "cpu:0"));
    assert!(task.device().is_none());

    task.map_to(device.clone());
    assert_eq!(task.device(), Some(device.clone()));

    let alias = task.clone();
    assert!(alias.ptr_eq(&task));
    assert_eq!(alias.device(), Some(device));
    assert!(!Task::builder("t0", Arc::new(Increment)).build().ptr_eq(&task));
}

#[test_case("first", DefaultDevice::First)]
#[test_case("STRICT", DefaultDevice::Strict)]
fn test_default_device_parse(input: &str, expected: DefaultDevice) {
    assert_eq!(input.parse::<DefaultDevice>().unwrap(), expected);
}

#[test]
fn test_engine_config_defaults() {
    let config = EngineConfig::default();
    assert_eq!(config.default_device, DefaultDevice::First);
    assert!(config.use_transfer_queue);
}

#[test]
fn test_device_errors_keep_their_category() {
    use conduit_device::error::{OutOfDeviceMemorySnafu, QueueClosedSnafu};

    let oom: Error = OutOfDeviceMemorySnafu { device: "d0", requested: 8usize, available: 4usize }.build().into();
    assert!(matches!(oom, Error::OutOfDeviceMemory { requested: 8, available: 4, .. }));

    let closed: Error = QueueClosedSnafu { queue: "d0/compute" }.build().into();
    assert!(matches!(closed, Error::Device { .. }));
    assert!(closed.to_string().contains("d0/compute"));

    let unsupported = Error::UnsupportedDeviceKind { device: "host".into(), kind: DeviceKind::Host };
    assert_eq!(unsupported.to_string(), "device 'host' of kind host cannot run kernels");
}
