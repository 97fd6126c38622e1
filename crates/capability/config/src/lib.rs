//! 运行配置加载：环境变量应用配置 + 通道配置注册表。

mod model;
mod registry;
mod time;

pub use model::{
    ChannelConfig, DeviceConfig, DriverConfig, RawChannelConfig, RawDeviceConfig,
    RawDriverConfig, RawRootConfig, RawServerMapping, RawTime, ServerMapping,
};
pub use registry::{
    ChannelRegistry, DEFAULT_CONNECT_RETRY_INTERVAL_MS, DEFAULT_SAMPLING_TIMEOUT_MS,
    DEFAULT_VALUE_TYPE_LENGTH, check_id_syntax, load, load_file,
};
pub use time::{TimeParseError, duration_to_time_string, time_string_to_duration};

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },
    #[error("{kind} {id}: invalid {field}: {reason}")]
    Field {
        kind: &'static str,
        id: String,
        field: &'static str,
        reason: String,
    },
}

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_file: String,
    pub shutdown_grace_ms: u64,
    pub listener_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_concurrent_io: usize,
    pub log_file: Option<String>,
    pub demo_driver: bool,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_file = env::var("DAQ_CONFIG_FILE")
            .map_err(|_| ConfigError::Missing("DAQ_CONFIG_FILE".to_string()))?;
        let shutdown_grace_ms = read_u64_with_default("DAQ_SHUTDOWN_GRACE_MS", 5_000)?;
        let listener_timeout_ms = read_u64_with_default("DAQ_LISTENER_TIMEOUT_MS", 1_000)?;
        let connect_timeout_ms = read_u64_with_default("DAQ_CONNECT_TIMEOUT_MS", 10_000)?;
        let max_concurrent_io = read_u64_with_default("DAQ_MAX_CONCURRENT_IO", 64)?.max(1) as usize;
        let log_file = read_optional("DAQ_LOG_FILE");
        let demo_driver = read_bool_with_default("DAQ_DEMO_DRIVER", true);

        Ok(Self {
            config_file,
            shutdown_grace_ms,
            listener_timeout_ms,
            connect_timeout_ms,
            max_concurrent_io,
            log_file,
            demo_driver,
        })
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
