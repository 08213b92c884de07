//! Layered configuration loading from TOML files and override variables

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use dlq_reprocessor::config::{ConfigManager, ConfigurationError, QuarantineBackend};
use dlq_reprocessor::BackoffPolicy;

const BASE: &str = r#"
[broker]
subscription = "orders-dlq-sub"
pull_batch_size = 25

[consumer]
max_in_flight = 64
worker_count = 8

[scheduler]
max_attempts = 7
unknown_max_attempts = 2

[scheduler.backoff]
base_delay_ms = 500
max_delay_ms = 60000
multiplier = 3.0
jitter_factor = 0.2

[classifier]
required_fields = ["order_id"]
transient_signatures = ["timeout", "gateway"]

[[redelivery.delay_tiers]]
delay_ms = 10000
topic = "orders-retry-10s"

[[redelivery.delay_tiers]]
delay_ms = 60000
topic = "orders-retry-60s"
"#;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_base_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "reprocessor.toml", BASE);

    let manager =
        ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", HashMap::new())
            .unwrap();
    let config = manager.config();

    assert_eq!(config.broker.subscription, "orders-dlq-sub");
    assert_eq!(config.broker.pull_batch_size, 25);
    assert_eq!(config.consumer.max_in_flight, 64);
    assert_eq!(config.scheduler.max_attempts, 7);
    assert_eq!(config.classifier.required_fields, vec!["order_id".to_string()]);
    assert_eq!(config.redelivery.delay_tiers.len(), 2);
    assert_eq!(config.redelivery.delay_tiers[1].topic, "orders-retry-60s");
    assert_eq!(manager.config_directory(), dir.path());

    // Unset fields keep their defaults
    assert_eq!(config.consumer.shutdown_grace_ms, 10_000);
    assert_eq!(config.quarantine.backend, QuarantineBackend::Memory);

    let backoff = BackoffPolicy::from_config(&config.scheduler.backoff).without_jitter();
    assert_eq!(backoff.delay_for(1).as_millis(), 500);
    assert_eq!(backoff.delay_for(2).as_millis(), 1_500);
    assert_eq!(backoff.delay_for(10).as_millis(), 60_000);
}

#[test]
fn test_environment_file_overlays_base() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "reprocessor.toml", BASE);
    write(
        dir.path(),
        "reprocessor.production.toml",
        r#"
[consumer]
worker_count = 32

[quarantine]
backend = "file"
directory = "/var/lib/dlq/quarantine"
"#,
    );

    let manager = ConfigManager::load_with_overrides(
        Some(dir.path().to_path_buf()),
        "production",
        HashMap::new(),
    )
    .unwrap();
    let config = manager.config();

    assert_eq!(manager.environment(), "production");
    assert_eq!(config.consumer.worker_count, 32);
    assert_eq!(config.consumer.max_in_flight, 64);
    assert_eq!(config.quarantine.backend, QuarantineBackend::File);
    assert_eq!(
        config.quarantine.directory.as_deref(),
        Some(Path::new("/var/lib/dlq/quarantine"))
    );
}

#[test]
fn test_override_variables_win_over_files() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "reprocessor.toml", BASE);

    let manager = ConfigManager::load_with_overrides(
        Some(dir.path().to_path_buf()),
        "test",
        overrides(&[
            ("DLQ_REPROCESSOR__SCHEDULER__MAX_ATTEMPTS", "3"),
            ("DLQ_REPROCESSOR__BROKER__SUBSCRIPTION", "override-sub"),
            ("DLQ_REPROCESSOR__LOGGING__JSON", "true"),
        ]),
    )
    .unwrap();
    let config = manager.config();

    assert_eq!(config.scheduler.max_attempts, 3);
    assert_eq!(config.broker.subscription, "override-sub");
    assert!(config.logging.json);
    assert_eq!(config.scheduler.unknown_max_attempts, 2);
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "reprocessor.toml",
        r#"
[scheduler.backoff]
jitter_factor = 1.5
"#,
    );

    let error =
        ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", HashMap::new())
            .unwrap_err();
    match error {
        ConfigurationError::InvalidValue { field, .. } => {
            assert_eq!(field, "scheduler.backoff.jitter_factor");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unsorted_delay_tiers_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "reprocessor.toml",
        r#"
[[redelivery.delay_tiers]]
delay_ms = 60000
topic = "retry-60s"

[[redelivery.delay_tiers]]
delay_ms = 10000
topic = "retry-10s"
"#,
    );

    let error =
        ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", HashMap::new())
            .unwrap_err();
    assert!(matches!(error, ConfigurationError::ValidationError { .. }));
}

#[test]
fn test_processing_timeout_must_fit_in_ack_deadline() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "reprocessor.toml",
        r#"
[broker]
ack_deadline_ms = 10000

[consumer]
processing_timeout_ms = 20000
"#,
    );

    let error =
        ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", HashMap::new())
            .unwrap_err();
    match error {
        ConfigurationError::InvalidValue { field, .. } => {
            assert_eq!(field, "consumer.processing_timeout_ms");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_record_ttl_is_configurable_and_non_zero() {
    let dir = tempfile::tempdir().unwrap();

    let manager = ConfigManager::load_with_overrides(
        Some(dir.path().to_path_buf()),
        "test",
        overrides(&[("DLQ_REPROCESSOR__SCHEDULER__RECORD_TTL_SECS", "600")]),
    )
    .unwrap();
    assert_eq!(
        manager.config().scheduler.record_ttl(),
        std::time::Duration::from_secs(600)
    );

    let error = ConfigManager::load_with_overrides(
        Some(dir.path().to_path_buf()),
        "test",
        overrides(&[("DLQ_REPROCESSOR__SCHEDULER__RECORD_TTL_SECS", "0")]),
    )
    .unwrap_err();
    match error {
        ConfigurationError::InvalidValue { field, .. } => {
            assert_eq!(field, "scheduler.record_ttl_secs");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_postgres_backend_requires_database_url() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "reprocessor.toml",
        r#"
[quarantine]
backend = "postgres"
"#,
    );

    let error =
        ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", HashMap::new())
            .unwrap_err();
    match error {
        ConfigurationError::MissingRequiredField { field, .. } => {
            assert_eq!(field, "quarantine.database_url");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "reprocessor.toml", "[broker\nsubscription = ");

    let error =
        ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", HashMap::new())
            .unwrap_err();
    assert!(matches!(error, ConfigurationError::ParseError { .. }));
}

#[test]
fn test_shipped_configuration_files_validate() {
    let shipped = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");

    let test = ConfigManager::load_with_overrides(Some(shipped.clone()), "test", HashMap::new())
        .unwrap();
    assert_eq!(test.config().scheduler.backoff.jitter_factor, 0.0);
    assert_eq!(test.config().redelivery.delay_tiers.len(), 3);

    let production = ConfigManager::load_with_overrides(
        Some(shipped),
        "production",
        overrides(&[(
            "DLQ_REPROCESSOR__QUARANTINE__DATABASE_URL",
            "postgres://reprocessor@localhost/dlq",
        )]),
    )
    .unwrap();
    assert_eq!(production.config().quarantine.backend, QuarantineBackend::Postgres);
    assert!(production.config().logging.json);
}
