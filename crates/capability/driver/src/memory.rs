//! 内存驱动：通道地址即键，值保存在进程内。
//!
//! 用于演示节点与测试；支持读写、监听推送、设备扫描，
//! 以及注入连接失败/读延迟等故障。

use crate::error::DriverError;
use crate::scan::ScanProgress;
use crate::spi::{
    ChannelRecordContainer, ChannelScanInfo, ChannelValueContainer, Connection, DeviceScanInfo,
    Driver, DriverInfo, RecordsListener,
};
use async_trait::async_trait;
use domain::{Flag, Record, Value, now_epoch_ms};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MEMORY_DRIVER_ID: &str = "memory";

type ListenerEntry = (u64, Vec<ChannelRecordContainer>, Arc<dyn RecordsListener>);

#[derive(Default)]
struct MemoryState {
    values: Mutex<HashMap<String, Value>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    fail_connects: AtomicU32,
    fail_reads: AtomicU32,
    io_delay_ms: AtomicU64,
    scan_step_ms: AtomicU64,
    connects: AtomicU64,
    reads: AtomicU64,
    next_connection: AtomicU64,
}

/// 内存驱动（克隆共享同一份状态）。
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&self, address: &str, value: Value) {
        if let Ok(mut values) = self.state.values.lock() {
            values.insert(address.to_string(), value);
        }
    }

    pub fn value(&self, address: &str) -> Option<Value> {
        self.state
            .values
            .lock()
            .ok()
            .and_then(|values| values.get(address).cloned())
    }

    /// 更新值并推送给监听该地址的连接。
    pub async fn push(&self, address: &str, value: Value) {
        self.set_value(address, value.clone());
        let listeners: Vec<ListenerEntry> = match self.state.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        let now = now_epoch_ms();
        for (_, containers, listener) in listeners {
            let records: Vec<ChannelRecordContainer> = containers
                .iter()
                .filter(|container| container.channel_address == address)
                .map(|container| {
                    let mut container = container.clone();
                    container.set_record(coerce(&value, &container, now));
                    container
                })
                .collect();
            if !records.is_empty() {
                listener.new_records(records).await;
            }
        }
    }

    /// 通知所有监听连接：连接已中断。
    pub async fn interrupt(&self) {
        let listeners: Vec<ListenerEntry> = match self.state.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for (_, _, listener) in listeners {
            listener.connection_interrupted().await;
        }
    }

    /// 接下来的 n 次连接失败。
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// 接下来的 n 次读取返回连接错误。
    pub fn fail_next_reads(&self, n: u32) {
        self.state.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn set_io_delay(&self, delay: Duration) {
        self.state
            .io_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_scan_step(&self, step: Duration) {
        self.state
            .scan_step_ms
            .store(step.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.state.reads.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.state
            .listeners
            .lock()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn coerce(value: &Value, container: &ChannelRecordContainer, now: i64) -> Record {
    match value.convert_to(container.value_type) {
        Ok(value) => Record::valid(truncate(value, container.value_type_length), now),
        Err(_) => Record::with_flag(Flag::DriverError, now),
    }
}

/// 按通道配置的长度截断字符串/字节数组。
fn truncate(value: Value, length: Option<usize>) -> Value {
    match (value, length) {
        (Value::String(text), Some(length)) => Value::String(text.chars().take(length).collect()),
        (Value::ByteArray(mut bytes), Some(length)) => {
            bytes.truncate(length);
            Value::ByteArray(bytes)
        }
        (value, _) => value,
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            id: MEMORY_DRIVER_ID.to_string(),
            description: "in-process value store".to_string(),
            device_address_syntax: "any".to_string(),
            settings_syntax: "none".to_string(),
            channel_address_syntax: "value key".to_string(),
            device_scan_settings_syntax: "comma separated device addresses".to_string(),
        }
    }

    async fn connect(
        &self,
        device_address: &str,
        _settings: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn Connection>, DriverError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.fail_connects) {
            return Err(DriverError::Connection(format!(
                "device {} unreachable",
                device_address
            )));
        }
        Ok(Box::new(MemoryConnection {
            id: self.state.next_connection.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
        }))
    }

    async fn scan_for_devices(
        &self,
        settings: &str,
        progress: ScanProgress,
        cancel: CancellationToken,
    ) -> Result<(), DriverError> {
        let addresses: Vec<&str> = settings
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .collect();
        let step = Duration::from_millis(self.state.scan_step_ms.load(Ordering::SeqCst));
        let total = addresses.len().max(1);
        for (index, address) in addresses.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(DriverError::ScanInterrupted);
            }
            if !step.is_zero() {
                tokio::time::sleep(step).await;
            }
            progress.device_found(DeviceScanInfo {
                device_address: address.to_string(),
                settings: String::new(),
                description: format!("memory device {}", address),
            });
            progress.progress((((index + 1) * 100) / total) as u8);
        }
        Ok(())
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<MemoryState>,
}

impl MemoryConnection {
    async fn io_delay(&self) {
        let delay = self.state.io_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read(
        &mut self,
        containers: &mut [ChannelRecordContainer],
        _sampling_group: &str,
    ) -> Result<(), DriverError> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        self.io_delay().await;
        if take_one(&self.state.fail_reads) {
            return Err(DriverError::Connection("link dropped".to_string()));
        }
        let values = self
            .state
            .values
            .lock()
            .map_err(|_| DriverError::Driver("value store poisoned".to_string()))?;
        let now = now_epoch_ms();
        for container in containers.iter_mut() {
            let record = match values.get(&container.channel_address) {
                Some(value) => coerce(value, container, now),
                None => Record::with_flag(Flag::ValueNotAvailable, now),
            };
            container.set_record(record);
        }
        Ok(())
    }

    async fn write(&mut self, containers: &mut [ChannelValueContainer]) -> Result<(), DriverError> {
        self.io_delay().await;
        let mut values = self
            .state
            .values
            .lock()
            .map_err(|_| DriverError::Driver("value store poisoned".to_string()))?;
        for container in containers.iter_mut() {
            match &container.value {
                Some(value) => {
                    values.insert(container.channel_address.clone(), value.clone());
                    container.flag = Some(Flag::Valid);
                }
                None => container.flag = Some(Flag::CannotWriteNullValue),
            }
        }
        Ok(())
    }

    async fn start_listening(
        &mut self,
        containers: Vec<ChannelRecordContainer>,
        listener: Arc<dyn RecordsListener>,
    ) -> Result<(), DriverError> {
        let mut listeners = self
            .state
            .listeners
            .lock()
            .map_err(|_| DriverError::Driver("listener store poisoned".to_string()))?;
        listeners.retain(|(id, _, _)| *id != self.id);
        listeners.push((self.id, containers, listener));
        Ok(())
    }

    async fn scan_for_channels(&mut self, _settings: &str) -> Result<Vec<ChannelScanInfo>, DriverError> {
        let values = self
            .state
            .values
            .lock()
            .map_err(|_| DriverError::Driver("value store poisoned".to_string()))?;
        let mut channels: Vec<ChannelScanInfo> = values
            .iter()
            .map(|(address, value)| ChannelScanInfo {
                channel_address: address.clone(),
                description: String::new(),
                value_type: value.value_type(),
                value_type_length: value.value_type().has_length().then(|| match value {
                    Value::ByteArray(bytes) => bytes.len(),
                    Value::String(text) => text.len(),
                    _ => 0,
                }),
                readable: true,
                writable: true,
            })
            .collect();
        channels.sort_by(|a, b| a.channel_address.cmp(&b.channel_address));
        Ok(channels)
    }

    async fn disconnect(&mut self) {
        if let Ok(mut listeners) = self.state.listeners.lock() {
            listeners.retain(|(id, _, _)| *id != self.id);
        }
    }
}
