use test_case::test_case;

use crate::test::support::{cpu_device, cpu_device_with};
use crate::{CpuDeviceConfig, DeviceKind, DeviceRegistry, DeviceSelector};

#[test_case("2", DeviceSelector::Index(2) ; "index")]
#[test_case("cpu", DeviceSelector::Kind { kind: DeviceKind::Cpu, ordinal: 0 } ; "kind defaults to first")]
#[test_case("GPU:1", DeviceSelector::Kind { kind: DeviceKind::Gpu, ordinal: 1 } ; "kind is case insensitive")]
#[test_case(" fpga:3 ", DeviceSelector::Kind { kind: DeviceKind::Fpga, ordinal: 3 } ; "whitespace")]
fn test_parse_selector(input: &str, expected: DeviceSelector) {
    assert_eq!(input.parse::<DeviceSelector>().unwrap(), expected);
}

#[test_case("tpu" ; "unknown kind")]
#[test_case("cpu:x" ; "bad ordinal")]
#[test_case("" ; "empty")]
fn test_parse_selector_invalid(input: &str) {
    assert!(input.parse::<DeviceSelector>().is_err());
}

#[test]
fn test_register_and_lookup() {
    let registry = DeviceRegistry::new();
    assert!(registry.default_device().is_none());

    let first = cpu_device("first");
    let gpu = cpu_device_with(CpuDeviceConfig::builder().name("Accel").kind(DeviceKind::Gpu).compute_units(1).build());
    assert_eq!(registry.register(first.clone()), 0);
    assert_eq!(registry.register(gpu.clone()), 1);
    assert_eq!(registry.register(first.clone()), 0);

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.default_device(), Some(first.clone()));
    assert_eq!(registry.index_of(&gpu), Some(1));
    assert_eq!(registry.find("accel"), Some(gpu.clone()));
    assert_eq!(registry.resolve("gpu").unwrap(), gpu);
    assert_eq!(registry.resolve("1").unwrap(), gpu);
    assert_eq!(registry.resolve("FIRST").unwrap(), first);
    assert!(registry.resolve("gpu:1").is_err());
    assert!(registry.resolve("7").is_err());
}

#[test]
fn test_factory_creates_on_demand() {
    let registry = DeviceRegistry::with_cpu_driver();
    assert!(registry.is_empty());

    let first = registry.resolve("cpu").unwrap();
    assert_eq!(first.name(), "cpu:0");
    assert_eq!(registry.resolve("cpu:0").unwrap(), first);

    let second = registry.resolve("cpu:1").unwrap();
    assert_eq!(second.name(), "cpu:1");
    assert_eq!(registry.len(), 2);

    assert!(registry.resolve("cpu:5").is_err());
    assert!(registry.resolve("gpu").is_err());
}

#[test]
fn test_default_device_falls_back_to_factory() {
    let registry = DeviceRegistry::with_cpu_driver();

    let device = registry.default_device().unwrap();
    assert_eq!(device.name(), "cpu:0");
    assert_eq!(device.kind(), DeviceKind::Cpu);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.default_device(), Some(device.clone()));
    assert_eq!(registry.resolve("cpu:0").unwrap(), device);
    assert_eq!(registry.len(), 1);
}
