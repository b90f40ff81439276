use std::env;
use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::load_config;
use super::settings::Settings;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.node.data_path, "data");
    assert_eq!(settings.queue.mem_queue_size, 10_000);
    assert_eq!(settings.queue.msg_timeout().as_secs(), 60);
    assert_eq!(settings.queue.max_msg_timeout().as_secs(), 900);
    assert_eq!(settings.scanner.selection_count, 20);
    assert_eq!(settings.scanner.worker_pool_max, 4);
    assert!(!settings.latency.enabled());
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_rejects_out_of_range_values() {
    let mut settings = Settings::default();
    settings.node.node_id = 1024;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.scanner.dirty_percent = 1.5;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.latency.percentiles = vec![0.5, 0.0];
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.scanner.worker_pool_max = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.queue.msg_timeout_ms = settings.queue.max_msg_timeout_ms + 1;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.queue.msg_timeout_ms = 0;
    assert!(settings.validate().is_err());
}

#[test]
#[serial]
fn test_load_config_without_sources_gives_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    let loaded = load_config();

    env::set_current_dir(orig).expect("restore cwd");
    assert_eq!(loaded.expect("load_config failed"), Settings::default());
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    // Run from a temp dir so load_config picks up config/default.toml there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [node]
        data_path = "/var/lib/popsubd"
        node_id = 7

        [queue]
        mem_queue_size = 0
        max_channel_consumers = 3

        [scanner]
        dirty_percent = 0.5

        [latency]
        percentiles = [0.5, 0.99]
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let loaded = load_config();

    env::set_current_dir(orig).expect("restore cwd");

    let cfg = loaded.expect("load_config failed");
    assert_eq!(cfg.node.data_path, "/var/lib/popsubd");
    assert_eq!(cfg.node.node_id, 7);
    assert_eq!(cfg.queue.mem_queue_size, 0);
    assert_eq!(cfg.queue.max_channel_consumers, 3);
    assert_eq!(cfg.scanner.dirty_percent, 0.5);
    assert_eq!(cfg.latency.percentiles, vec![0.5, 0.99]);
    // untouched groups keep their defaults
    assert_eq!(cfg.scanner.interval_ms, 100);
    assert_eq!(cfg.log.level, "info");
}

#[test]
#[serial]
fn test_environment_overrides() {
    temp_env::with_vars(
        [
            ("POPSUBD__QUEUE__MEM_QUEUE_SIZE", Some("42")),
            ("POPSUBD__LOG__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.queue.mem_queue_size, 42);
            assert_eq!(cfg.log.level, "debug");
        },
    );
}
