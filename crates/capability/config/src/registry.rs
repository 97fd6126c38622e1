//! 通道配置注册表：加载、默认值继承与校验。
//!
//! 驱动/设备级错误使整体加载失败；通道级错误只剔除该通道，
//! 错误保留在 [`ChannelRegistry::rejected`] 中。

use crate::ConfigError;
use crate::model::{
    ChannelConfig, DeviceConfig, DriverConfig, RawChannelConfig, RawRootConfig, RawTime,
    ServerMapping,
};
use crate::time::time_string_to_duration;
use domain::ValueType;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

pub const DEFAULT_SAMPLING_TIMEOUT_MS: i64 = 0;
pub const DEFAULT_CONNECT_RETRY_INTERVAL_MS: i64 = 60_000;
pub const DEFAULT_VALUE_TYPE_LENGTH: usize = 10;

static ID_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").ok());

/// 校验 ID 语法：非空，仅含 ASCII 字母、数字、连字符和下划线。
pub fn check_id_syntax(kind: &'static str, id: &str) -> Result<(), ConfigError> {
    let valid = ID_PATTERN
        .as_ref()
        .map(|pattern| pattern.is_match(id))
        .unwrap_or(false);
    if valid {
        return Ok(());
    }
    Err(ConfigError::Field {
        kind,
        id: id.to_string(),
        field: "id",
        reason: "must contain only ASCII letters, digits, hyphens and underscores".to_string(),
    })
}

/// 解析 JSON 配置文本。
pub fn load(raw: &str) -> Result<ChannelRegistry, ConfigError> {
    let root: RawRootConfig =
        serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
    ChannelRegistry::from_raw(root)
}

/// 读取并解析配置文件。
pub fn load_file(path: impl AsRef<Path>) -> Result<ChannelRegistry, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let registry = load(&raw)?;
    info!(
        target: "daq.config",
        path = %path.display(),
        drivers = registry.drivers().len(),
        devices = registry.devices().len(),
        channels = registry.channels().len(),
        rejected = registry.rejected().len(),
        "channel_config_loaded"
    );
    Ok(registry)
}

/// 校验后的完整配置集合（重载时整体替换）。
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    drivers: Vec<DriverConfig>,
    devices: Vec<Arc<DeviceConfig>>,
    channels: Vec<Arc<ChannelConfig>>,
    channel_index: HashMap<String, usize>,
    rejected: Vec<ConfigError>,
}

impl ChannelRegistry {
    pub fn from_raw(root: RawRootConfig) -> Result<Self, ConfigError> {
        let mut registry = ChannelRegistry::default();
        let mut driver_ids = HashSet::new();
        let mut device_ids = HashSet::new();

        for raw_driver in root.drivers {
            check_id_syntax("driver", &raw_driver.id)?;
            if !driver_ids.insert(raw_driver.id.clone()) {
                return Err(ConfigError::DuplicateId {
                    kind: "driver",
                    id: raw_driver.id,
                });
            }
            let driver = DriverConfig {
                sampling_timeout_ms: non_negative(
                    "driver",
                    &raw_driver.id,
                    "samplingTimeout",
                    resolve_time("driver", &raw_driver.id, "samplingTimeout", raw_driver.sampling_timeout.as_ref())?
                        .unwrap_or(DEFAULT_SAMPLING_TIMEOUT_MS),
                )?,
                connect_retry_interval_ms: non_negative(
                    "driver",
                    &raw_driver.id,
                    "connectRetryInterval",
                    resolve_time(
                        "driver",
                        &raw_driver.id,
                        "connectRetryInterval",
                        raw_driver.connect_retry_interval.as_ref(),
                    )?
                    .unwrap_or(DEFAULT_CONNECT_RETRY_INTERVAL_MS),
                )?,
                id: raw_driver.id,
                disabled: raw_driver.disabled,
            };

            for raw_device in raw_driver.devices {
                check_id_syntax("device", &raw_device.id)?;
                if !device_ids.insert(raw_device.id.clone()) {
                    return Err(ConfigError::DuplicateId {
                        kind: "device",
                        id: raw_device.id,
                    });
                }
                let sampling_timeout_ms = resolve_time(
                    "device",
                    &raw_device.id,
                    "samplingTimeout",
                    raw_device.sampling_timeout.as_ref(),
                )?
                .unwrap_or(driver.sampling_timeout_ms);
                let connect_retry_interval_ms = resolve_time(
                    "device",
                    &raw_device.id,
                    "connectRetryInterval",
                    raw_device.connect_retry_interval.as_ref(),
                )?
                .unwrap_or(driver.connect_retry_interval_ms);
                let device = Arc::new(DeviceConfig {
                    sampling_timeout_ms: non_negative(
                        "device",
                        &raw_device.id,
                        "samplingTimeout",
                        sampling_timeout_ms,
                    )?,
                    connect_retry_interval_ms: non_negative(
                        "device",
                        &raw_device.id,
                        "connectRetryInterval",
                        connect_retry_interval_ms,
                    )?,
                    id: raw_device.id,
                    driver_id: driver.id.clone(),
                    description: raw_device.description,
                    device_address: raw_device.device_address,
                    settings: raw_device.settings,
                    disabled: raw_device.disabled || driver.disabled,
                });

                for raw_channel in raw_device.channels {
                    match build_channel(raw_channel, &device) {
                        Ok(channel) => registry.insert_channel(channel),
                        Err(err) => registry.reject(err),
                    }
                }
                registry.devices.push(device);
            }
            registry.drivers.push(driver);
        }
        Ok(registry)
    }

    fn insert_channel(&mut self, channel: ChannelConfig) {
        if self.channel_index.contains_key(&channel.id) {
            self.reject(ConfigError::DuplicateId {
                kind: "channel",
                id: channel.id,
            });
            return;
        }
        self.channel_index
            .insert(channel.id.clone(), self.channels.len());
        self.channels.push(Arc::new(channel));
    }

    fn reject(&mut self, err: ConfigError) {
        warn!(target: "daq.config", error = %err, "channel_config_rejected");
        self.rejected.push(err);
    }

    pub fn drivers(&self) -> &[DriverConfig] {
        &self.drivers
    }

    pub fn devices(&self) -> &[Arc<DeviceConfig>] {
        &self.devices
    }

    pub fn device(&self, id: &str) -> Option<&Arc<DeviceConfig>> {
        self.devices.iter().find(|device| device.id == id)
    }

    pub fn channels(&self) -> &[Arc<ChannelConfig>] {
        &self.channels
    }

    pub fn channel(&self, id: &str) -> Option<&Arc<ChannelConfig>> {
        self.channel_index
            .get(id)
            .and_then(|index| self.channels.get(*index))
    }

    pub fn channels_of_device<'a>(
        &'a self,
        device_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<ChannelConfig>> + 'a {
        self.channels
            .iter()
            .filter(move |channel| channel.device_id == device_id)
    }

    /// 全部 (通道, 映射) 对。
    pub fn server_mappings(&self) -> Vec<(String, ServerMapping)> {
        self.channels
            .iter()
            .flat_map(|channel| {
                channel
                    .server_mappings
                    .iter()
                    .map(|mapping| (channel.id.clone(), mapping.clone()))
            })
            .collect()
    }

    /// 被剔除通道的配置错误。
    pub fn rejected(&self) -> &[ConfigError] {
        &self.rejected
    }
}

fn resolve_time(
    kind: &'static str,
    id: &str,
    field: &'static str,
    raw: Option<&RawTime>,
) -> Result<Option<i64>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(RawTime::Millis(ms)) => Ok(Some(*ms)),
        Some(RawTime::Text(text)) => {
            time_string_to_duration(text).map_err(|err| ConfigError::Field {
                kind,
                id: id.to_string(),
                field,
                reason: err.to_string(),
            })
        }
    }
}

fn non_negative(
    kind: &'static str,
    id: &str,
    field: &'static str,
    value: i64,
) -> Result<i64, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Field {
            kind,
            id: id.to_string(),
            field,
            reason: "may not be negative".to_string(),
        });
    }
    Ok(value)
}

fn build_channel(raw: RawChannelConfig, device: &DeviceConfig) -> Result<ChannelConfig, ConfigError> {
    check_id_syntax("channel", &raw.id)?;
    let id = raw.id.as_str();

    let value_type = match raw.value_type.as_deref() {
        None | Some("") => ValueType::Double,
        Some(text) => text.parse::<ValueType>().map_err(|reason| ConfigError::Field {
            kind: "channel",
            id: id.to_string(),
            field: "valueType",
            reason,
        })?,
    };
    let value_type_length = value_type
        .has_length()
        .then(|| raw.value_type_length.unwrap_or(DEFAULT_VALUE_TYPE_LENGTH));

    let sampling_interval_ms = resolve_time(
        "channel",
        id,
        "samplingInterval",
        raw.sampling_interval.as_ref(),
    )?;
    if let Some(interval) = sampling_interval_ms {
        non_negative("channel", id, "samplingInterval", interval)?;
    }
    let sampling_time_offset_ms = non_negative(
        "channel",
        id,
        "samplingTimeOffset",
        resolve_time(
            "channel",
            id,
            "samplingTimeOffset",
            raw.sampling_time_offset.as_ref(),
        )?
        .unwrap_or(0),
    )?;
    let logging_interval_ms =
        resolve_time("channel", id, "loggingInterval", raw.logging_interval.as_ref())?;
    let logging_time_offset_ms = non_negative(
        "channel",
        id,
        "loggingTimeOffset",
        resolve_time(
            "channel",
            id,
            "loggingTimeOffset",
            raw.logging_time_offset.as_ref(),
        )?
        .unwrap_or(0),
    )?;

    if raw.listening && sampling_interval_ms.is_some_and(|interval| interval > 0) {
        return Err(ConfigError::Field {
            kind: "channel",
            id: id.to_string(),
            field: "listening",
            reason: "listening may not be enabled while sampling is enabled".to_string(),
        });
    }

    let mut server_mappings = Vec::with_capacity(raw.server_mappings.len());
    for mapping in raw.server_mappings {
        check_id_syntax("serverMapping", &mapping.id)?;
        server_mappings.push(ServerMapping {
            server_id: mapping.id,
            server_address: mapping.server_address,
        });
    }

    Ok(ChannelConfig {
        device_id: device.id.clone(),
        driver_id: device.driver_id.clone(),
        description: raw.description,
        channel_address: raw.channel_address,
        value_type,
        value_type_length,
        unit: raw.unit,
        scaling_factor: raw.scaling_factor,
        value_offset: raw.value_offset,
        listening: raw.listening,
        sampling_interval_ms,
        sampling_time_offset_ms,
        sampling_group: raw.sampling_group,
        logging_interval_ms,
        logging_time_offset_ms,
        logging_settings: raw.logging_settings,
        disabled: raw.disabled || device.disabled,
        server_mappings,
        id: raw.id,
    })
}
