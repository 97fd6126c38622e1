use daq_config::{AppConfig, ConfigError};

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("DAQ_CONFIG_FILE", "/etc/daq/channels.json");
        std::env::set_var("DAQ_SHUTDOWN_GRACE_MS", "2500");
        std::env::set_var("DAQ_DEMO_DRIVER", "off");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.config_file, "/etc/daq/channels.json");
    assert_eq!(config.shutdown_grace_ms, 2500);
    assert_eq!(config.listener_timeout_ms, 1000);
    assert!(!config.demo_driver);

    unsafe {
        std::env::set_var("DAQ_CONNECT_TIMEOUT_MS", "soon");
    }
    let err = AppConfig::from_env().expect_err("invalid");
    assert!(matches!(err, ConfigError::Invalid(key, _) if key == "DAQ_CONNECT_TIMEOUT_MS"));
    unsafe {
        std::env::remove_var("DAQ_CONNECT_TIMEOUT_MS");
    }
}
