//! Driver SPI：驱动与连接的接口契约。

use crate::error::DriverError;
use crate::scan::ScanProgress;
use async_trait::async_trait;
use domain::{Flag, Record, Value, ValueType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 驱动描述信息。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverInfo {
    pub id: String,
    pub description: String,
    pub device_address_syntax: String,
    pub settings_syntax: String,
    pub channel_address_syntax: String,
    pub device_scan_settings_syntax: String,
}

/// 扫描发现的设备。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceScanInfo {
    pub device_address: String,
    pub settings: String,
    pub description: String,
}

/// 扫描发现的通道。
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelScanInfo {
    pub channel_address: String,
    pub description: String,
    pub value_type: ValueType,
    pub value_type_length: Option<usize>,
    pub readable: bool,
    pub writable: bool,
}

/// 读容器：驱动按地址填充记录。
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecordContainer {
    pub channel_id: String,
    pub channel_address: String,
    pub value_type: ValueType,
    /// 字符串/字节数组通道的最大长度
    pub value_type_length: Option<usize>,
    pub record: Record,
}

impl ChannelRecordContainer {
    pub fn new(
        channel_id: impl Into<String>,
        channel_address: impl Into<String>,
        value_type: ValueType,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_address: channel_address.into(),
            value_type,
            value_type_length: None,
            record: Record::with_flag(Flag::NoValueReceivedYet, 0),
        }
    }

    pub fn with_value_type_length(mut self, length: Option<usize>) -> Self {
        self.value_type_length = length;
        self
    }

    pub fn set_record(&mut self, record: Record) {
        self.record = record;
    }

    /// 驱动是否未填充结果。
    pub fn is_unfilled(&self) -> bool {
        self.record.flag() == Flag::NoValueReceivedYet
    }
}

/// 写容器：驱动写入后回填标志。
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelValueContainer {
    pub channel_id: String,
    pub channel_address: String,
    pub value: Option<Value>,
    /// None 表示驱动未回报结果
    pub flag: Option<Flag>,
}

impl ChannelValueContainer {
    pub fn new(
        channel_id: impl Into<String>,
        channel_address: impl Into<String>,
        value: Option<Value>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_address: channel_address.into(),
            value,
            flag: None,
        }
    }

    pub fn result_flag(&self) -> Flag {
        self.flag.unwrap_or(Flag::DriverError)
    }
}

/// 驱动主动推送（监听模式）的回调。
#[async_trait]
pub trait RecordsListener: Send + Sync {
    async fn new_records(&self, records: Vec<ChannelRecordContainer>);

    /// 连接中断，连接池将丢弃连接并重连。
    async fn connection_interrupted(&self);
}

/// 协议驱动抽象。
#[async_trait]
pub trait Driver: Send + Sync {
    fn info(&self) -> DriverInfo;

    async fn connect(
        &self,
        device_address: &str,
        settings: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, DriverError>;

    /// 扫描设备；应在 `cancel` 触发后尽快返回。
    async fn scan_for_devices(
        &self,
        _settings: &str,
        _progress: ScanProgress,
        _cancel: CancellationToken,
    ) -> Result<(), DriverError> {
        Err(DriverError::UnsupportedOperation(
            "scan for devices".to_string(),
        ))
    }
}

/// 设备连接；连接池保证同一时刻只有一个调用方。
#[async_trait]
pub trait Connection: Send {
    /// 读取一组通道；每个容器单独标志。
    async fn read(
        &mut self,
        containers: &mut [ChannelRecordContainer],
        sampling_group: &str,
    ) -> Result<(), DriverError>;

    async fn write(&mut self, _containers: &mut [ChannelValueContainer]) -> Result<(), DriverError> {
        Err(DriverError::UnsupportedOperation("write".to_string()))
    }

    async fn start_listening(
        &mut self,
        _containers: Vec<ChannelRecordContainer>,
        _listener: Arc<dyn RecordsListener>,
    ) -> Result<(), DriverError> {
        Err(DriverError::UnsupportedOperation("listening".to_string()))
    }

    async fn scan_for_channels(&mut self, _settings: &str) -> Result<Vec<ChannelScanInfo>, DriverError> {
        Err(DriverError::UnsupportedOperation(
            "scan for channels".to_string(),
        ))
    }

    async fn disconnect(&mut self);
}
