//! Building the layer from TOML configuration.

use resilience_guard::infrastructure::mocks::MockClock;
use resilience_guard::{
    BuildError, ConfigError, DegradationCategory, DimensionKind, ErrorClass, InMemoryStore,
    OperationSpec, Outcome, ResilienceConfig, ResilienceError, ResilienceLayer,
    RevocationFailureMode, RetryProfile,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
enabled = true

[rate_limit]
key_prefix = "svc:rl:"

[rate_limit.global]
enabled = false

[rate_limit.endpoint]
capacity = 2
requests_per_interval = 2
interval_seconds = 10

[retry.generic]
max_attempts = 2
initial_delay_ms = 10

[retry.backpressure]
pre_delay_ms = 0
retry_on = ["backpressure", "transient"]

[revocation]
key_prefix = "svc:revoked:"
failure_mode = "fail_closed"
"#;

#[test]
fn test_full_config_parses() {
    let config = ResilienceConfig::from_toml_str(CONFIG).unwrap();

    assert!(config.enabled);
    assert_eq!(config.rate_limit.key_prefix, "svc:rl:");
    assert!(!config.rate_limit.global.enabled);
    assert_eq!(config.rate_limit.endpoint.capacity, 2.0);
    // Untouched dimensions keep their defaults
    assert_eq!(config.rate_limit.ip.capacity, 100.0);
    assert_eq!(config.rate_limit.user.capacity, 1000.0);
    assert_eq!(
        config.revocation.failure_mode,
        Some(RevocationFailureMode::FailClosed)
    );

    let policies = config.retry.policies().unwrap();
    assert_eq!(policies.generic.max_attempts, 2);
    assert_eq!(policies.generic.initial_delay, Duration::from_millis(10));
    // Unset fields keep the profile default
    assert_eq!(policies.generic.max_delay, Duration::from_secs(2));
    assert_eq!(policies.backpressure.pre_delay, Duration::ZERO);
    assert!(policies
        .for_profile(RetryProfile::Backpressure)
        .is_retryable(ErrorClass::Transient));
}

#[test]
fn test_unknown_retry_field_is_rejected() {
    let result = ResilienceConfig::from_toml_str(
        r#"
        [retry.streaming]
        max_attempt = 4
        "#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_inconsistent_retry_policy_is_rejected() {
    let result = ResilienceConfig::from_toml_str(
        r#"
        [retry.generic]
        max_attempts = 0
        "#,
    );
    assert!(matches!(
        result,
        Err(ConfigError::Retry {
            profile: RetryProfile::Generic,
            ..
        })
    ));
}

#[test]
fn test_missing_failure_mode_fails_build() {
    let config = ResilienceConfig::from_toml_str("enabled = true").unwrap();
    let result = ResilienceLayer::builder(InMemoryStore::new())
        .with_config(config)
        .build();
    assert!(matches!(
        result,
        Err(BuildError::MissingRevocationFailureMode)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_layer_follows_config() {
    let clock = MockClock::at_unix(1_700_000_000);
    let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
    let config = ResilienceConfig::from_toml_str(CONFIG).unwrap();
    let layer = ResilienceLayer::builder_shared(Arc::clone(&store))
        .with_config(config)
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    // Endpoint bucket holds two tokens; Global is off
    assert!(layer.check_all_dimensions("10.1.1.1", None, "/export").await);
    assert!(layer.check_all_dimensions("10.1.1.2", None, "/export").await);
    assert!(!layer.check_all_dimensions("10.1.1.3", None, "/export").await);
    assert_eq!(layer.counters().admission(DimensionKind::Global).total, 0);
    assert!(!store.is_empty());

    // Generic profile capped at two attempts
    let calls = &AtomicU32::new(0);
    let spec = OperationSpec::generic("report", DegradationCategory::Data);
    let outcome: Outcome<()> = layer
        .wrap(&spec, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::transient("timeout"))
        })
        .await
        .unwrap();
    assert!(outcome.is_degraded());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Blacklist keys use the configured prefix
    assert!(layer.add_to_blacklist("refresh-token-0001", "rotated", 30).await);
    let listed: Vec<String> = futures::StreamExt::collect(layer.revocations().list_all()).await;
    assert_eq!(listed, vec!["refresh-token-0001".to_string()]);
}
