use serial_test::serial;
use temp_env::with_vars;

use super::*;

fn cleanup_all_cacher_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("CACHER__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = CacherConfig::default();

    assert_eq!(config.resource_prefix, "/registry");
    assert!(!config.consistent_reads_from_cache);
    assert_eq!(config.watch_cache.lower_bound_capacity, 100);
    assert_eq!(config.watch_cache.upper_bound_capacity, 102400);
    assert_eq!(config.dispatch.watcher_channel_size, 10);
    assert_eq!(config.dispatch.timeout_budget_max_ms, 100);
    assert_eq!(config.bookmark.frequency_ms, 60_000);
    assert_eq!(config.reflector.backoff.max_retries, 0);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_cacher_env_vars();
    with_vars(
        vec![
            ("CACHER__WATCH_CACHE__LOWER_BOUND_CAPACITY", Some("256")),
            ("CACHER__CONSISTENT_READS_FROM_CACHE", Some("true")),
        ],
        || {
            let config = CacherConfig::new().unwrap();

            assert_eq!(config.watch_cache.lower_bound_capacity, 256);
            assert!(config.consistent_reads_from_cache);
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_cacher_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("dynamic_config.toml");

    std::fs::write(
        &config_path,
        r#"
        resource_prefix = "/registry/pods"

        [dispatch]
        watcher_channel_size = 32

        [reflector.backoff]
        base_delay_ms = 10
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = CacherConfig::new().expect("success");
        let config = base_config.with_override_config(config_path.to_str().unwrap()).unwrap();

        assert_eq!(config.resource_prefix, "/registry/pods");
        assert_eq!(config.dispatch.watcher_channel_size, 32);
        assert_eq!(config.reflector.backoff.base_delay_ms, 10);
        // untouched fields keep their defaults
        assert_eq!(config.reflector.backoff.max_delay_ms, 30_000);
        assert_eq!(config.dispatch.incoming_buffer_size, 100);
    });
}

#[test]
#[serial]
fn environment_variables_should_have_highest_priority() {
    cleanup_all_cacher_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("test_config.toml");
    std::fs::write(
        &config_path,
        r#"
        [bookmark]
        frequency_ms = 5000
        "#,
    )
    .unwrap();

    with_vars(
        vec![
            ("CONFIG_PATH", Some(config_path.to_str().unwrap())),
            ("CACHER__BOOKMARK__FREQUENCY_MS", Some("7000")),
        ],
        || {
            let config = CacherConfig::new().unwrap();
            assert_eq!(config.bookmark.frequency_ms, 7000);
        },
    );
}

#[test]
#[serial]
fn invalid_config_file_should_return_error() {
    cleanup_all_cacher_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("invalid.toml");
    std::fs::write(
        &config_path,
        r#"
        invalid_toml = [ should_fail
        "#,
    )
    .unwrap();

    with_vars(
        vec![("CONFIG_PATH", Some(config_path.to_str().unwrap()))],
        || {
            assert!(CacherConfig::new().is_err());
        },
    );
}

#[test]
fn validation_should_reject_relative_prefix() {
    let config = CacherConfig {
        resource_prefix: "registry".to_string(),
        ..Default::default()
    };
    assert!(matches!(config.validate(), Err(Error::Config(_))));
}

#[test]
fn validation_should_reject_inverted_capacity_bounds() {
    let mut config = CacherConfig::default();
    config.watch_cache.lower_bound_capacity = 1000;
    config.watch_cache.upper_bound_capacity = 10;
    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_zero_channel_size() {
    let mut config = CacherConfig::default();
    config.dispatch.watcher_channel_size = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_sub_second_bookmark_frequency() {
    let mut config = CacherConfig::default();
    config.bookmark.frequency_ms = 500;
    assert!(config.validate().is_err());

    let mut config = CacherConfig::default();
    config.bookmark.tick_jitter_factor = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_inverted_backoff() {
    let mut config = CacherConfig::default();
    config.reflector.backoff.base_delay_ms = 60_000;
    assert!(config.validate().is_err());
}

#[test]
fn backoff_delay_doubles_and_caps() {
    let policy = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 100,
        base_delay_ms: 100,
        max_delay_ms: 1000,
    };
    assert_eq!(policy.delay_for_attempt(0).as_millis(), 100);
    assert_eq!(policy.delay_for_attempt(1).as_millis(), 200);
    assert_eq!(policy.delay_for_attempt(3).as_millis(), 800);
    assert_eq!(policy.delay_for_attempt(4).as_millis(), 1000);
    assert_eq!(policy.delay_for_attempt(200).as_millis(), 1000);
}
