use applier::{ApplierConfig, ConfigError, SchedulingPolicyKind, MIN_GAQ_CAPACITY};
use std::time::Duration;

#[test]
fn json_document_overrides_defaults() {
    let config = ApplierConfig::from_json_str(
        r#"{
            "worker_count": 8,
            "scheduling_policy": "partition_affinity",
            "preserve_commit_order": true,
            "channel": "primary"
        }"#,
    )
    .unwrap();
    assert_eq!(config.worker_count, 8);
    assert_eq!(config.scheduling_policy, SchedulingPolicyKind::PartitionAffinity);
    assert!(config.preserve_commit_order);
    assert_eq!(config.gaq_capacity, ApplierConfig::default().gaq_capacity);
}

#[test]
fn undersized_gaq_is_rejected() {
    let config = ApplierConfig {
        gaq_capacity: 1,
        ..ApplierConfig::default()
    };
    assert_eq!(
        config.validate().unwrap_err(),
        ConfigError::GaqTooSmall {
            capacity: 1,
            minimum: MIN_GAQ_CAPACITY,
        }
    );
}

#[test]
fn unknown_fields_are_rejected() {
    let err = ApplierConfig::from_json_str(r#"{"workers": 4}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn invalid_values_name_their_field() {
    let zero_workers = ApplierConfig {
        worker_count: 0,
        ..ApplierConfig::default()
    };
    assert!(matches!(
        zero_workers.validate().unwrap_err(),
        ConfigError::Invalid { field: "worker_count", .. }
    ));
    let inverted = ApplierConfig {
        overrun_level: 20,
        underrun_level: 40,
        ..ApplierConfig::default()
    };
    assert!(matches!(
        inverted.validate().unwrap_err(),
        ConfigError::Invalid { field: "underrun_level", .. }
    ));
}

#[test]
fn retry_backoff_doubles_up_to_the_ceiling() {
    let config = ApplierConfig {
        retry_backoff: 10,
        ..ApplierConfig::default()
    };
    assert_eq!(config.retry_backoff(1), Duration::from_millis(10));
    assert_eq!(config.retry_backoff(2), Duration::from_millis(20));
    assert_eq!(config.retry_backoff(4), Duration::from_millis(80));
    assert_eq!(config.retry_backoff(30), Duration::from_millis(1_000));
}

#[test]
fn occupancy_thresholds_follow_the_levels() {
    let config = ApplierConfig {
        queue_capacity: 200,
        overrun_level: 90,
        underrun_level: 10,
        ..ApplierConfig::default()
    };
    assert_eq!(config.overrun_threshold(), 180);
    assert_eq!(config.underrun_threshold(), 20);
}
