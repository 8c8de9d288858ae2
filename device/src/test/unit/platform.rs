use test_case::test_case;

use crate::{DeviceKind, PlatformId};

#[test_case("CPU", DeviceKind::Cpu; "cpu")]
#[test_case("gpu", DeviceKind::Gpu; "gpu lowercase")]
#[test_case("jit_gpu", DeviceKind::Accelerator("JIT_GPU".into()); "accelerator")]
fn test_parse_device_kind(input: &str, expected: DeviceKind) {
    assert_eq!(DeviceKind::parse(input).unwrap(), expected);
}

#[test]
fn test_parse_empty_device_kind() {
    assert!(DeviceKind::parse("  ").is_err());
}

#[test]
fn test_type_name_matches_display() {
    for kind in [DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Accelerator("TPU".into())] {
        assert_eq!(kind.type_name(), kind.to_string());
    }
}

#[test]
fn test_platform_id() {
    assert!(PlatformId::HOST.is_host());
    assert!(!PlatformId::CUDA.is_host());
    assert_eq!(PlatformId::CUDA.to_string(), "CUDA");
}
