use serial_test::serial;
use temp_env::with_vars;

use super::*;

fn cleanup_all_apistore_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("APISTORE__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = ApiStoreConfig::default();

    assert_eq!(config.storage.backend, BackendKind::Memory);
    assert_eq!(config.storage.path_prefix, "/registry");
    assert_eq!(config.watch_cache.capacity, 100);
    assert_eq!(config.watch_cache.block_timeout_ms, 3000);
    assert_eq!(config.encryption.dek_cache_size, 1000);
    assert!(!config.encryption.enabled);
    assert_eq!(config.retry.guaranteed_update.max_retries, 16);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_apistore_env_vars();
    with_vars(
        vec![
            ("APISTORE__WATCH_CACHE__CAPACITY", Some("512")),
            ("APISTORE__STORAGE__BACKEND", Some("sled")),
        ],
        || {
            let config = ApiStoreConfig::new().unwrap();

            assert_eq!(config.watch_cache.capacity, 512);
            assert_eq!(config.storage.backend, BackendKind::Sled);
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_apistore_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("override.toml");

    std::fs::write(
        &config_path,
        r#"
        [storage]
        path_prefix = "/custom"

        [encryption]
        enabled = true
        dek_cache_size = 64

        [retry.guaranteed_update]
        max_retries = 3
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = ApiStoreConfig::new().expect("success");
        let config = base_config.with_override_config(config_path.to_str().unwrap()).unwrap();

        assert_eq!(config.storage.path_prefix, "/custom");
        assert!(config.encryption.enabled);
        assert_eq!(config.encryption.dek_cache_size, 64);
        assert_eq!(config.retry.guaranteed_update.max_retries, 3);
        // Untouched sections keep their defaults
        assert_eq!(config.watch_cache.capacity, 100);
        assert!(config.validate().is_ok());
    });
}

#[test]
#[serial]
fn environment_variables_should_have_highest_priority() {
    cleanup_all_apistore_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("base.toml");
    std::fs::write(
        &config_path,
        r#"
        [watch_cache]
        capacity = 10
        block_timeout_ms = 500
        "#,
    )
    .unwrap();

    with_vars(
        vec![
            ("CONFIG_PATH", Some(config_path.to_str().unwrap())),
            ("APISTORE__WATCH_CACHE__CAPACITY", Some("20")),
        ],
        || {
            let config = ApiStoreConfig::new().unwrap();
            assert_eq!(config.watch_cache.capacity, 20);
            assert_eq!(config.watch_cache.block_timeout_ms, 500);
        },
    );
}

#[test]
fn validation_should_reject_zero_capacity() {
    let mut config = ApiStoreConfig::default();
    config.watch_cache.capacity = 0;

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_bad_path_prefix() {
    let mut config = ApiStoreConfig::default();
    config.storage.path_prefix = "registry".to_string();
    assert!(config.clone().validate().is_err());

    config.storage.path_prefix = "/registry/".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn encryption_validation_only_applies_when_enabled() {
    let mut config = EncryptionConfig {
        enabled: false,
        provider_name: String::new(),
        dek_cache_size: 0,
        kms_timeout_ms: 0,
    };
    assert!(config.validate().is_ok());

    config.enabled = true;
    assert!(config.validate().is_err());

    config.provider_name = "vault".to_string();
    config.dek_cache_size = 10;
    config.kms_timeout_ms = 100;
    assert!(config.validate().is_ok());

    config.provider_name = "va:ult".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn lease_validation_interval_range() {
    let mut config = LeaseConfig {
        enabled: true,
        ..Default::default()
    };

    config.interval_ms = 99;
    assert!(config.validate().is_err());

    config.interval_ms = 3_600_001;
    assert!(config.validate().is_err());

    config.interval_ms = 100;
    assert!(config.validate().is_ok());
}

#[test]
fn retry_policy_rejects_inverted_delays() {
    let mut policies = RetryPolicies::default();
    policies.relist.base_delay_ms = 10_000;
    policies.relist.max_delay_ms = 10;

    assert!(policies.validate().is_err());
}

#[test]
fn monitoring_rejects_privileged_port() {
    let mut config = MonitoringConfig {
        enabled: true,
        listen_addr: "0.0.0.0:80".to_string(),
    };
    assert!(config.validate().is_err());

    config.listen_addr = "127.0.0.1:0".to_string();
    assert!(config.validate().is_ok());

    config.listen_addr = "localhost".to_string();
    assert!(config.validate().is_err());

    // Not checked while disabled
    config.enabled = false;
    assert!(config.validate().is_ok());
}
