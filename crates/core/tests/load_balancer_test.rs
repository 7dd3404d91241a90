use std::sync::Arc;
use std::time::Duration;

use grid_core::load_balancer::{BundlerSlot, InMemoryBundlerPersistence, LoadBalancerFactory};
use grid_core::models::SystemInformation;
use grid_core::traits::{BundlerFactory, LoadBalancingInfo};

fn adaptive_info() -> LoadBalancingInfo {
    LoadBalancingInfo::new("adaptive")
        .with_parameter("initial_size", 4u64)
        .with_parameter("target_millis", 100u64)
}

#[test]
fn test_adaptive_state_survives_slot_rebuild() {
    let persistence = Arc::new(InMemoryBundlerPersistence::new());
    let factory = LoadBalancerFactory::new(adaptive_info())
        .unwrap()
        .with_persistence(persistence.clone());

    let first = BundlerSlot::new();
    first.check(&factory, "channel-1", &SystemInformation::new());
    assert_eq!(first.bundle_size(), Some(4));

    // 每任务 10ms
    first.feedback(Some(&factory as &dyn BundlerFactory), "channel-1", 4, Duration::from_millis(40));
    assert_eq!(first.bundle_size(), Some(10));
    assert_eq!(persistence.len(), 1);

    let second = BundlerSlot::new();
    second.check(&factory, "channel-1", &SystemInformation::new());
    assert_eq!(second.bundle_size(), Some(10));

    let other = BundlerSlot::new();
    other.check(&factory, "channel-2", &SystemInformation::new());
    assert_eq!(other.bundle_size(), Some(4));
}

#[test]
fn test_configuration_update_replaces_installed_bundler() {
    let factory = LoadBalancerFactory::new(adaptive_info()).unwrap();
    let slot = BundlerSlot::new();
    slot.check(&factory, "channel-1", &SystemInformation::new());
    assert_eq!(slot.algorithm().as_deref(), Some("adaptive"));
    let installed_at = slot.timestamp().unwrap();

    // 版本戳未变，不重建
    slot.check(&factory, "channel-1", &SystemInformation::new());
    assert_eq!(slot.timestamp(), Some(installed_at));

    factory
        .update_configuration(LoadBalancingInfo::new("manual").with_parameter("size", 7u64))
        .unwrap();
    assert!(factory.last_update_time() > installed_at);
    slot.check(&factory, "channel-1", &SystemInformation::new());
    assert_eq!(slot.algorithm().as_deref(), Some("manual"));
    assert_eq!(slot.bundle_size(), Some(7));
}

#[test]
fn test_processor_count_raises_initial_size() {
    let factory = LoadBalancerFactory::new(adaptive_info()).unwrap();
    let slot = BundlerSlot::new();
    let info = SystemInformation::new().with_property("available_processors", "12");
    slot.check(&factory, "channel-1", &info);
    assert_eq!(slot.bundle_size(), Some(12));
}

#[test]
fn test_empty_slot_has_no_size() {
    let slot = BundlerSlot::new();
    assert_eq!(slot.bundle_size(), None);
    slot.feedback(None, "channel-1", 3, Duration::from_millis(5));
    assert_eq!(slot.algorithm(), None);
}
