//! 设备连接池
//!
//! 每个设备持有一个连接（互斥访问），由独立的监督任务负责连接与按
//! `connectRetryInterval` 重试。未连接的设备读取立即返回
//! DEVICE_NOT_CONNECTED，不会阻塞其他设备的节拍。

use crate::error::DriverError;
use crate::scan::{DeviceScan, ScanEvent, ScanProgress};
use crate::spi::{
    ChannelRecordContainer, ChannelScanInfo, ChannelValueContainer, Connection, Driver,
    RecordsListener,
};
use crate::registry::DriverRegistry;
use async_trait::async_trait;
use daq_config::{ChannelRegistry, DeviceConfig};
use daq_telemetry::TelemetryMetrics;
use domain::{Flag, Record, now_epoch_ms};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// 设备连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Connecting,
    Connected,
    WaitingForConnectionRetry,
    Disconnecting,
    Disabled,
    DriverUnavailable,
    Deleted,
}

impl DeviceState {
    /// 设备不可用时读写返回的标志。
    pub fn unavailable_flag(&self) -> Flag {
        match self {
            DeviceState::Disabled => Flag::Disabled,
            DeviceState::DriverUnavailable => Flag::DriverUnavailable,
            _ => Flag::DeviceNotConnected,
        }
    }
}

/// 连接池事件回调（状态变化、监听推送）。
#[async_trait]
pub trait DeviceEventHandler: Send + Sync {
    async fn device_state_changed(&self, device_id: &str, state: DeviceState);

    async fn listened_records(&self, device_id: &str, records: Vec<ChannelRecordContainer>);
}

/// 空回调（用于占位与测试）。
#[derive(Debug, Default)]
pub struct NoopDeviceEventHandler;

#[async_trait]
impl DeviceEventHandler for NoopDeviceEventHandler {
    async fn device_state_changed(&self, _device_id: &str, _state: DeviceState) {}

    async fn listened_records(&self, _device_id: &str, _records: Vec<ChannelRecordContainer>) {}
}

/// 连接池参数。
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct DeviceHandle {
    config: Arc<DeviceConfig>,
    driver: Option<Arc<dyn Driver>>,
    connection: Mutex<Option<Box<dyn Connection>>>,
    state: std::sync::Mutex<DeviceState>,
    reconnect: Notify,
    listening: Vec<ChannelRecordContainer>,
}

impl DeviceHandle {
    fn state(&self) -> DeviceState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(DeviceState::Deleted)
    }

    fn store_state(&self, state: DeviceState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }
}

struct PoolInner {
    devices: HashMap<String, Arc<DeviceHandle>>,
    drivers: DriverRegistry,
    handler: Arc<dyn DeviceEventHandler>,
    metrics: Arc<TelemetryMetrics>,
    config: PoolConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PoolInner {
    async fn set_state(&self, device: &DeviceHandle, state: DeviceState) {
        if device.state() == state {
            return;
        }
        device.store_state(state);
        debug!(target: "daq.driver", device_id = %device.config.id, state = ?state, "device_state_changed");
        self.handler
            .device_state_changed(&device.config.id, state)
            .await;
    }

    async fn drop_connection(&self, device: &DeviceHandle) {
        let taken = device.connection.lock().await.take();
        if let Some(mut connection) = taken {
            connection.disconnect().await;
            device.reconnect.notify_one();
        }
    }

    async fn start_listening(self: &Arc<Self>, device: &Arc<DeviceHandle>) {
        if device.listening.is_empty() {
            return;
        }
        let bridge: Arc<dyn RecordsListener> = Arc::new(ListenBridge {
            pool: Arc::downgrade(self),
            device: Arc::downgrade(device),
        });
        let mut guard = device.connection.lock().await;
        let Some(connection) = guard.as_mut() else {
            return;
        };
        match connection
            .start_listening(device.listening.clone(), bridge)
            .await
        {
            Ok(()) => info!(
                target: "daq.driver",
                device_id = %device.config.id,
                channels = device.listening.len(),
                "device_listening_started"
            ),
            Err(err) => warn!(
                target: "daq.driver",
                device_id = %device.config.id,
                error = %err,
                "device_listening_failed"
            ),
        }
    }
}

struct ListenBridge {
    pool: Weak<PoolInner>,
    device: Weak<DeviceHandle>,
}

#[async_trait]
impl RecordsListener for ListenBridge {
    async fn new_records(&self, records: Vec<ChannelRecordContainer>) {
        let (Some(pool), Some(device)) = (self.pool.upgrade(), self.device.upgrade()) else {
            return;
        };
        pool.metrics.record_listened(records.len() as u64);
        pool.handler
            .listened_records(&device.config.id, records)
            .await;
    }

    async fn connection_interrupted(&self) {
        let (Some(pool), Some(device)) = (self.pool.upgrade(), self.device.upgrade()) else {
            return;
        };
        warn!(target: "daq.driver", device_id = %device.config.id, "device_connection_interrupted");
        // 驱动可能在持有连接的调用中回调，放到独立任务里释放连接
        tokio::spawn(async move {
            pool.drop_connection(&device).await;
        });
    }
}

/// 设备连接池。
#[derive(Clone)]
pub struct DevicePool {
    inner: Arc<PoolInner>,
}

impl DevicePool {
    pub fn new(
        registry: &ChannelRegistry,
        drivers: DriverRegistry,
        handler: Arc<dyn DeviceEventHandler>,
        metrics: Arc<TelemetryMetrics>,
        config: PoolConfig,
    ) -> Self {
        let mut devices = HashMap::new();
        for device in registry.devices() {
            let driver = drivers.get(&device.driver_id);
            let state = if device.disabled {
                DeviceState::Disabled
            } else if driver.is_none() {
                DeviceState::DriverUnavailable
            } else {
                DeviceState::Connecting
            };
            let listening = registry
                .channels_of_device(&device.id)
                .filter(|channel| channel.is_listening())
                .map(|channel| {
                    ChannelRecordContainer::new(
                        &channel.id,
                        &channel.channel_address,
                        channel.value_type,
                    )
                    .with_value_type_length(channel.value_type_length)
                })
                .collect();
            devices.insert(
                device.id.clone(),
                Arc::new(DeviceHandle {
                    config: device.clone(),
                    driver,
                    connection: Mutex::new(None),
                    state: std::sync::Mutex::new(state),
                    reconnect: Notify::new(),
                    listening,
                }),
            );
        }
        Self {
            inner: Arc::new(PoolInner {
                devices,
                drivers,
                handler,
                metrics,
                config,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// 启动每个可用设备的连接监督任务。
    pub async fn start(&self) {
        for device in self.inner.devices.values() {
            match device.state() {
                DeviceState::Disabled => {
                    self.inner
                        .handler
                        .device_state_changed(&device.config.id, DeviceState::Disabled)
                        .await;
                }
                DeviceState::DriverUnavailable => {
                    warn!(
                        target: "daq.driver",
                        device_id = %device.config.id,
                        driver_id = %device.config.driver_id,
                        "driver_unavailable"
                    );
                    self.inner
                        .handler
                        .device_state_changed(&device.config.id, DeviceState::DriverUnavailable)
                        .await;
                }
                _ => {
                    let inner = self.inner.clone();
                    let device = device.clone();
                    self.inner.tracker.spawn(supervise(inner, device));
                }
            }
        }
    }

    pub fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.inner.devices.get(device_id).map(|device| device.state())
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner.devices.keys().cloned().collect()
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.inner.drivers
    }

    /// 读取一组通道（同一采样组一次批量读取）。
    ///
    /// 配置了 `samplingTimeout` 时整个读取（含等待设备锁）受限：
    /// 驱动调用已开始则为 TIMEOUT，仍在排队则为 DEVICE_OR_INTERFACE_BUSY。
    pub async fn read(
        &self,
        device_id: &str,
        containers: Vec<ChannelRecordContainer>,
        sampling_group: &str,
    ) -> Vec<ChannelRecordContainer> {
        let Some(device) = self.inner.devices.get(device_id).cloned() else {
            return fill_records(containers, Flag::DeviceNotConnected);
        };
        let state = device.state();
        if state != DeviceState::Connected {
            return fill_records(containers, state.unavailable_flag());
        }
        let Some(limit) = device.config.sampling_timeout() else {
            let started = AtomicBool::new(false);
            return read_connected(&device, containers, sampling_group, &started).await;
        };

        let template = containers.clone();
        let started = AtomicBool::new(false);
        match tokio::time::timeout(
            limit,
            read_connected(&device, containers, sampling_group, &started),
        )
        .await
        {
            Ok(containers) => containers,
            Err(_) => {
                let flag = if started.load(Ordering::Acquire) {
                    Flag::Timeout
                } else {
                    Flag::DeviceOrInterfaceBusy
                };
                self.inner.metrics.record_sampling_timeout();
                warn!(
                    target: "daq.driver",
                    device_id = %device_id,
                    timeout_ms = limit.as_millis() as u64,
                    flag = %flag,
                    "device_read_timeout"
                );
                fill_records(template, flag)
            }
        }
    }

    /// 写入一组通道；空值直接返回 CANNOT_WRITE_NULL_VALUE，不下发驱动。
    ///
    /// 返回顺序：下发驱动的容器在前，被拒绝的空值容器在后。
    pub async fn write(
        &self,
        device_id: &str,
        containers: Vec<ChannelValueContainer>,
        timeout: Option<Duration>,
    ) -> Vec<ChannelValueContainer> {
        let (writable, mut rejected): (Vec<_>, Vec<_>) = containers
            .into_iter()
            .partition(|container| container.value.is_some());
        for container in &mut rejected {
            container.flag = Some(Flag::CannotWriteNullValue);
        }

        let mut written = self.write_values(device_id, writable, timeout).await;
        for container in &written {
            self.inner
                .metrics
                .record_write(container.result_flag() == Flag::Valid);
        }
        written.append(&mut rejected);
        written
    }

    async fn write_values(
        &self,
        device_id: &str,
        containers: Vec<ChannelValueContainer>,
        timeout: Option<Duration>,
    ) -> Vec<ChannelValueContainer> {
        if containers.is_empty() {
            return containers;
        }
        let Some(device) = self.inner.devices.get(device_id).cloned() else {
            return fill_flags(containers, Flag::DeviceNotConnected);
        };
        let state = device.state();
        if state != DeviceState::Connected {
            return fill_flags(containers, state.unavailable_flag());
        }
        let started = AtomicBool::new(false);
        let Some(limit) = timeout else {
            return write_connected(&device, containers, &started).await;
        };
        let template = containers.clone();
        match tokio::time::timeout(limit, write_connected(&device, containers, &started)).await {
            Ok(containers) => containers,
            Err(_) => {
                let flag = if started.load(Ordering::Acquire) {
                    Flag::Timeout
                } else {
                    Flag::DeviceOrInterfaceBusy
                };
                warn!(
                    target: "daq.driver",
                    device_id = %device_id,
                    timeout_ms = limit.as_millis() as u64,
                    flag = %flag,
                    "device_write_timeout"
                );
                fill_flags(template, flag)
            }
        }
    }

    /// 在已连接设备上扫描通道。
    pub async fn scan_for_channels(
        &self,
        device_id: &str,
        settings: &str,
    ) -> Result<Vec<ChannelScanInfo>, DriverError> {
        let device = self
            .inner
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| DriverError::ArgumentSyntax(format!("unknown device: {}", device_id)))?;
        let mut guard = device.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| DriverError::Connection("device not connected".to_string()))?;
        connection.scan_for_channels(settings).await
    }

    /// 启动设备扫描；返回事件流句柄，可随时取消。
    pub fn scan_for_devices(
        &self,
        driver_id: &str,
        settings: &str,
    ) -> Result<DeviceScan, DriverError> {
        let driver = self.inner.drivers.get(driver_id).ok_or_else(|| {
            DriverError::UnsupportedOperation(format!("driver unavailable: {}", driver_id))
        })?;
        let cancel = self.inner.cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let progress = ScanProgress::new(tx.clone(), cancel.clone());
        let scan = DeviceScan::new(rx, cancel.clone());
        let scan_id = scan.id;
        let driver_id = driver_id.to_string();
        let settings = settings.to_string();

        info!(target: "daq.driver", driver_id = %driver_id, scan_id = %scan_id, "device_scan_started");
        self.inner.tracker.spawn(async move {
            let result = tokio::select! {
                result = driver.scan_for_devices(&settings, progress, cancel.clone()) => result,
                _ = cancel.cancelled() => Err(DriverError::ScanInterrupted),
            };
            let event = match result {
                Ok(()) if cancel.is_cancelled() => ScanEvent::Cancelled,
                Ok(()) => ScanEvent::Finished,
                Err(DriverError::ScanInterrupted) => ScanEvent::Cancelled,
                Err(err) => {
                    warn!(target: "daq.driver", driver_id = %driver_id, error = %err, "device_scan_failed");
                    ScanEvent::Failed(err.to_string())
                }
            };
            info!(target: "daq.driver", driver_id = %driver_id, scan_id = %scan_id, outcome = ?event, "device_scan_finished");
            let _ = tx.send(event);
        });
        Ok(scan)
    }

    /// 停止监督任务并释放所有连接。
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        for device in self.inner.devices.values() {
            let guard =
                tokio::time::timeout(self.inner.config.connect_timeout, device.connection.lock())
                    .await;
            match guard {
                Ok(mut guard) => {
                    if let Some(mut connection) = guard.take() {
                        device.store_state(DeviceState::Disconnecting);
                        connection.disconnect().await;
                        info!(target: "daq.driver", device_id = %device.config.id, "device_disconnected");
                    }
                }
                Err(_) => warn!(
                    target: "daq.driver",
                    device_id = %device.config.id,
                    "device_disconnect_skipped_busy"
                ),
            }
            device.store_state(DeviceState::Deleted);
        }
    }
}

async fn supervise(inner: Arc<PoolInner>, device: Arc<DeviceHandle>) {
    let Some(driver) = device.driver.clone() else {
        return;
    };
    let device_id = device.config.id.clone();
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        inner.set_state(&device, DeviceState::Connecting).await;
        inner.metrics.record_connect_attempt();
        let connect_timeout = inner.config.connect_timeout;
        let attempt = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            result = tokio::time::timeout(
                connect_timeout,
                driver.connect(&device.config.device_address, &device.config.settings, connect_timeout),
            ) => result,
        };
        let result = attempt.unwrap_or_else(|_| Err(DriverError::Timeout("connect".to_string())));

        match result {
            Ok(connection) => {
                *device.connection.lock().await = Some(connection);
                info!(target: "daq.driver", device_id = %device_id, "device_connected");
                inner.set_state(&device, DeviceState::Connected).await;
                inner.start_listening(&device).await;
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = device.reconnect.notified() => {
                        inner.metrics.record_connection_lost();
                        warn!(target: "daq.driver", device_id = %device_id, "device_connection_lost");
                    }
                }
            }
            Err(err) => {
                inner.metrics.record_connect_failure();
                let retry = device.config.connect_retry_interval();
                warn!(
                    target: "daq.driver",
                    device_id = %device_id,
                    error = %err,
                    retry_in_ms = retry.as_millis() as u64,
                    "device_connect_failed"
                );
                inner
                    .set_state(&device, DeviceState::WaitingForConnectionRetry)
                    .await;
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
        }
    }
}

async fn read_connected(
    device: &DeviceHandle,
    mut containers: Vec<ChannelRecordContainer>,
    sampling_group: &str,
    started: &AtomicBool,
) -> Vec<ChannelRecordContainer> {
    let mut guard = device.connection.lock().await;
    let Some(connection) = guard.as_mut() else {
        return fill_records(containers, Flag::DeviceNotConnected);
    };
    started.store(true, Ordering::Release);
    let result = connection.read(&mut containers, sampling_group).await;
    let now = now_epoch_ms();
    match result {
        Ok(()) => {
            for container in containers.iter_mut().filter(|c| c.is_unfilled()) {
                container.set_record(Record::with_flag(Flag::DriverError, now));
            }
        }
        Err(err) => {
            warn!(
                target: "daq.driver",
                device_id = %device.config.id,
                sampling_group = %sampling_group,
                error = %err,
                "device_read_failed"
            );
            let flag = err.to_flag();
            for container in containers.iter_mut() {
                container.set_record(Record::with_flag(flag, now));
            }
            if err.is_connection_lost() {
                if let Some(mut connection) = guard.take() {
                    connection.disconnect().await;
                }
                device.reconnect.notify_one();
            }
        }
    }
    containers
}

async fn write_connected(
    device: &DeviceHandle,
    mut containers: Vec<ChannelValueContainer>,
    started: &AtomicBool,
) -> Vec<ChannelValueContainer> {
    let mut guard = device.connection.lock().await;
    let Some(connection) = guard.as_mut() else {
        return fill_flags(containers, Flag::DeviceNotConnected);
    };
    started.store(true, Ordering::Release);
    match connection.write(&mut containers).await {
        Ok(()) => {
            for container in containers.iter_mut().filter(|c| c.flag.is_none()) {
                container.flag = Some(Flag::Valid);
            }
        }
        Err(err) => {
            warn!(
                target: "daq.driver",
                device_id = %device.config.id,
                error = %err,
                "device_write_failed"
            );
            let flag = err.to_flag();
            for container in containers.iter_mut() {
                container.flag = Some(flag);
            }
            if err.is_connection_lost() {
                if let Some(mut connection) = guard.take() {
                    connection.disconnect().await;
                }
                device.reconnect.notify_one();
            }
        }
    }
    containers
}

fn fill_records(mut containers: Vec<ChannelRecordContainer>, flag: Flag) -> Vec<ChannelRecordContainer> {
    let now = now_epoch_ms();
    for container in containers.iter_mut() {
        container.set_record(Record::with_flag(flag, now));
    }
    containers
}

fn fill_flags(mut containers: Vec<ChannelValueContainer>, flag: Flag) -> Vec<ChannelValueContainer> {
    for container in containers.iter_mut() {
        container.flag = Some(flag);
    }
    containers
}
