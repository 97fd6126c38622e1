//! 配置树：原始 JSON 结构与校验后的驱动/设备/通道配置。

use domain::ValueType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 时间字段：既可写成时间字符串（`"1s"`），也可写成毫秒数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTime {
    Millis(i64),
    Text(String),
}

/// 原始配置根节点。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawRootConfig {
    pub drivers: Vec<RawDriverConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDriverConfig {
    pub id: String,
    pub sampling_timeout: Option<RawTime>,
    pub connect_retry_interval: Option<RawTime>,
    pub disabled: bool,
    pub devices: Vec<RawDeviceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDeviceConfig {
    pub id: String,
    pub description: String,
    pub device_address: String,
    pub settings: String,
    pub sampling_timeout: Option<RawTime>,
    pub connect_retry_interval: Option<RawTime>,
    pub disabled: bool,
    pub channels: Vec<RawChannelConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawChannelConfig {
    pub id: String,
    pub description: String,
    pub channel_address: String,
    pub value_type: Option<String>,
    pub value_type_length: Option<usize>,
    pub unit: String,
    pub scaling_factor: Option<f64>,
    pub value_offset: Option<f64>,
    pub listening: bool,
    pub sampling_interval: Option<RawTime>,
    pub sampling_time_offset: Option<RawTime>,
    pub sampling_group: String,
    pub logging_interval: Option<RawTime>,
    pub logging_time_offset: Option<RawTime>,
    pub logging_settings: String,
    pub disabled: bool,
    pub server_mappings: Vec<RawServerMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawServerMapping {
    pub id: String,
    pub server_address: String,
}

/// 驱动配置（设备未配置时的默认值来源）。
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub id: String,
    pub sampling_timeout_ms: i64,
    pub connect_retry_interval_ms: i64,
    pub disabled: bool,
}

/// 设备配置。
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub driver_id: String,
    pub description: String,
    pub device_address: String,
    pub settings: String,
    /// 0 表示不限时
    pub sampling_timeout_ms: i64,
    pub connect_retry_interval_ms: i64,
    pub disabled: bool,
}

impl DeviceConfig {
    pub fn sampling_timeout(&self) -> Option<Duration> {
        (self.sampling_timeout_ms > 0).then(|| Duration::from_millis(self.sampling_timeout_ms as u64))
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms.max(0) as u64)
    }
}

/// 通道到外部服务的映射。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerMapping {
    pub server_id: String,
    pub server_address: String,
}

/// 校验后的通道配置。
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub id: String,
    pub device_id: String,
    pub driver_id: String,
    pub description: String,
    pub channel_address: String,
    pub value_type: ValueType,
    pub value_type_length: Option<usize>,
    pub unit: String,
    pub scaling_factor: Option<f64>,
    pub value_offset: Option<f64>,
    pub listening: bool,
    /// None 表示不采样
    pub sampling_interval_ms: Option<i64>,
    pub sampling_time_offset_ms: i64,
    pub sampling_group: String,
    /// None 表示不记录；负值表示每次更新即记录
    pub logging_interval_ms: Option<i64>,
    pub logging_time_offset_ms: i64,
    pub logging_settings: String,
    pub disabled: bool,
    pub server_mappings: Vec<ServerMapping>,
}

impl ChannelConfig {
    /// 最小可用配置（其余字段取默认值）。
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        driver_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            driver_id: driver_id.into(),
            description: String::new(),
            channel_address: String::new(),
            value_type: ValueType::Double,
            value_type_length: None,
            unit: String::new(),
            scaling_factor: None,
            value_offset: None,
            listening: false,
            sampling_interval_ms: None,
            sampling_time_offset_ms: 0,
            sampling_group: String::new(),
            logging_interval_ms: None,
            logging_time_offset_ms: 0,
            logging_settings: String::new(),
            disabled: false,
            server_mappings: Vec::new(),
        }
    }

    pub fn is_sampling(&self) -> bool {
        !self.disabled && !self.listening && self.sampling_interval_ms.is_some_and(|v| v > 0)
    }

    pub fn is_listening(&self) -> bool {
        !self.disabled && self.listening
    }

    pub fn is_interval_logging(&self) -> bool {
        !self.disabled && self.logging_interval_ms.is_some_and(|v| v > 0)
    }

    pub fn is_event_logging(&self) -> bool {
        !self.disabled && self.logging_interval_ms.is_some_and(|v| v < 0)
    }

    /// 解析 `loggerId:options;loggerId2` 形式的记录器选择；空表示全部记录器。
    pub fn logger_ids(&self) -> Vec<&str> {
        self.logging_settings
            .split(';')
            .map(|part| part.split(':').next().unwrap_or_default().trim())
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// 指定记录器的附加参数（冒号之后部分）。
    pub fn logger_options(&self, logger_id: &str) -> Option<&str> {
        self.logging_settings.split(';').find_map(|part| {
            let (id, options) = part.split_once(':')?;
            (id.trim() == logger_id).then(|| options.trim())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_selection_parses_ids_and_options() {
        let mut config = ChannelConfig::new("ch1", "dev1", "drv");
        config.logging_settings = "memory:retention=10; file ;".to_string();
        assert_eq!(config.logger_ids(), vec!["memory", "file"]);
        assert_eq!(config.logger_options("memory"), Some("retention=10"));
        assert_eq!(config.logger_options("file"), None);
    }

    #[test]
    fn listening_channel_is_not_sampled() {
        let mut config = ChannelConfig::new("ch1", "dev1", "drv");
        config.sampling_interval_ms = Some(1000);
        assert!(config.is_sampling());
        config.listening = true;
        assert!(!config.is_sampling());
        assert!(config.is_listening());
    }
}
