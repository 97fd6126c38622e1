//! 通道状态机
//!
//! ```text
//! driver record ──scale──► set_latest_record ──► listeners (按注册顺序, 单个超时)
//!                                │
//!                                └──► get_latest_record (只读缓存, 不做 I/O)
//! ```
//!
//! 最新记录只整体替换，不原地修改；通知串行化，同一通道的
//! 监听器按记录产生顺序收到通知。
//!
//! 未来写入：一组带时间戳的记录按时间排序后逐个在到期时写入设备，
//! 新的一组会取消尚未执行的旧计划。

use crate::listener::{RecordListener, Subscription};
use crate::scaling;
use daq_config::ChannelConfig;
use daq_driver::{ChannelRecordContainer, ChannelValueContainer, DevicePool};
use daq_telemetry::TelemetryMetrics;
use domain::{Flag, Record, Value, now_epoch_ms};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ListenerEntry = (u64, Arc<dyn RecordListener>);

/// 通道运行参数。
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// 单个监听器的通知超时
    pub listener_timeout: Duration,
    /// 计划写入到期时单次写入的超时
    pub future_write_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            listener_timeout: Duration::from_secs(1),
            future_write_timeout: Duration::from_secs(5),
        }
    }
}

struct ChannelState {
    latest: Record,
    listeners: Vec<ListenerEntry>,
}

/// 已计划的未来写入（按时间戳升序）。
#[derive(Default)]
struct FutureWrites {
    records: Vec<Record>,
    cancel: CancellationToken,
}

/// 单个通道：最新记录 + 监听器 + 读写入口。
pub struct Channel {
    config: Arc<ChannelConfig>,
    pool: DevicePool,
    settings: ChannelSettings,
    metrics: Arc<TelemetryMetrics>,
    state: Mutex<ChannelState>,
    notify: tokio::sync::Mutex<()>,
    next_listener: AtomicU64,
    future: Mutex<FutureWrites>,
}

impl Channel {
    pub fn new(
        config: Arc<ChannelConfig>,
        pool: DevicePool,
        settings: ChannelSettings,
        metrics: Arc<TelemetryMetrics>,
    ) -> Self {
        let initial = if config.disabled {
            Flag::Disabled
        } else if !config.is_sampling() && !config.is_listening() {
            Flag::SamplingAndListeningDisabled
        } else {
            Flag::NoValueReceivedYet
        };
        Self {
            config,
            pool,
            settings,
            metrics,
            state: Mutex::new(ChannelState {
                latest: Record::with_flag(initial, now_epoch_ms()),
                listeners: Vec::new(),
            }),
            notify: tokio::sync::Mutex::new(()),
            next_listener: AtomicU64::new(1),
            future: Mutex::new(FutureWrites::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &Arc<ChannelConfig> {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 缓存的最新记录（不触发 I/O）。
    pub fn get_latest_record(&self) -> Record {
        self.state().latest.clone()
    }

    /// 注册监听器；注册后至少能收到下一条记录。
    pub fn add_listener(&self, listener: Arc<dyn RecordListener>) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.state().listeners.push((id, listener));
        Subscription::new(&self.config.id, id)
    }

    pub fn remove_listener(&self, subscription: &Subscription) -> bool {
        if subscription.channel_id() != self.config.id {
            return false;
        }
        let mut state = self.state();
        let before = state.listeners.len();
        state.listeners.retain(|(id, _)| *id != subscription.id());
        state.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// 接管旧通道的监听器（配置重载后同 id 通道）。
    ///
    /// 订阅句柄保持有效。
    pub fn adopt_listeners(&self, previous: &Channel) {
        let carried = previous.state().listeners.clone();
        let max_id = carried.iter().map(|(id, _)| *id).max().unwrap_or(0);
        self.next_listener.fetch_max(max_id + 1, Ordering::Relaxed);
        let mut state = self.state();
        let mut listeners = carried;
        listeners.append(&mut state.listeners);
        state.listeners = listeners;
    }

    /// 替换最新记录，然后按注册顺序通知监听器。
    pub async fn set_latest_record(&self, record: Record) {
        let _ordered = self.notify.lock().await;
        let listeners = {
            let mut state = self.state();
            state.latest = record.clone();
            state.listeners.clone()
        };
        self.notify_listeners(listeners, &record).await;
    }

    /// 驱动记录经换算后写入（非 VALID 保留陈旧值）。
    pub async fn apply_driver_record(&self, record: Record) -> Record {
        let previous = self.state().latest.clone().into_value();
        let record = scaling::apply(&self.config, record, previous.as_ref());
        self.metrics.record_sample(record.is_valid());
        self.set_latest_record(record.clone()).await;
        record
    }

    /// 以错误标志更新（保留陈旧值）。
    pub async fn set_flag(&self, flag: Flag) -> Record {
        let previous = self.state().latest.clone().into_value();
        let record = Record::new(previous, now_epoch_ms(), flag);
        self.set_latest_record(record.clone()).await;
        record
    }

    /// 配置删除后的最终记录；未执行的计划写入一并取消。
    pub async fn delete(&self) {
        self.cancel_future_writes();
        self.set_latest_record(Record::with_flag(Flag::ChannelDeleted, now_epoch_ms()))
            .await;
    }

    /// 读容器（驱动地址 + 值类型）。
    pub fn record_container(&self) -> ChannelRecordContainer {
        ChannelRecordContainer::new(
            &self.config.id,
            &self.config.channel_address,
            self.config.value_type,
        )
        .with_value_type_length(self.config.value_type_length)
    }

    /// 立即通过连接池读取并更新最新记录。
    pub async fn read(&self, timeout: Duration) -> Record {
        if self.config.disabled {
            return Record::with_flag(Flag::Disabled, now_epoch_ms());
        }
        let read = self
            .pool
            .read(&self.config.device_id, vec![self.record_container()], "");
        let record = match tokio::time::timeout(timeout, read).await {
            Ok(mut containers) => containers
                .pop()
                .map(|container| container.record)
                .unwrap_or_else(|| Record::with_flag(Flag::DriverError, now_epoch_ms())),
            Err(_) => Record::with_flag(Flag::Timeout, now_epoch_ms()),
        };
        self.apply_driver_record(record).await
    }

    /// 写入设备；值按通道换算反算后下发。
    ///
    /// 写入结果作为最新记录保存并通知监听器：成功时为写入值，
    /// 失败时保留陈旧值。
    pub async fn write(&self, value: Option<Value>, timeout: Duration) -> Flag {
        if self.config.disabled {
            return Flag::Disabled;
        }
        let Some(value) = value else {
            return Flag::CannotWriteNullValue;
        };
        let raw = match scaling::unscale_value(&self.config, &value) {
            Some(Ok(raw)) => raw,
            Some(Err(err)) => {
                warn!(target: "daq.channel", channel_id = %self.config.id, error = %err, "channel_write_rejected");
                return Flag::DriverError;
            }
            None => {
                warn!(target: "daq.channel", channel_id = %self.config.id, "channel_write_zero_scaling");
                return Flag::DriverError;
            }
        };
        let container =
            ChannelValueContainer::new(&self.config.id, &self.config.channel_address, Some(raw));
        let flag = self
            .pool
            .write(&self.config.device_id, vec![container], Some(timeout))
            .await
            .first()
            .map(|container| container.result_flag())
            .unwrap_or(Flag::DriverError);
        debug!(target: "daq.channel", channel_id = %self.config.id, flag = %flag, "channel_written");

        let stored = if flag == Flag::Valid {
            Some(value.convert_to(self.config.value_type).unwrap_or(value))
        } else {
            self.state().latest.clone().into_value()
        };
        self.set_latest_record(Record::new(stored, now_epoch_ms(), flag))
            .await;
        flag
    }

    /// 计划在各记录的时间戳写入其值，替换此前尚未执行的计划。
    ///
    /// 需在 tokio 运行时内调用；时间戳已过的记录立即写入。
    pub fn write_future(self: &Arc<Self>, mut records: Vec<Record>) {
        records.sort_by_key(Record::timestamp);
        let cancel = CancellationToken::new();
        {
            let mut future = self.future();
            future.cancel.cancel();
            future.cancel = cancel.clone();
            future.records = records.clone();
        }
        if records.is_empty() {
            return;
        }
        debug!(target: "daq.channel", channel_id = %self.config.id, records = records.len(), "future_writes_scheduled");
        tokio::spawn(run_future_writes(
            Arc::downgrade(self),
            records,
            cancel,
            self.settings.future_write_timeout,
        ));
    }

    /// `[start, end]` 内尚未到期的计划写入记录。
    pub fn future_records(&self, start: i64, end: i64) -> Vec<Record> {
        let from = start.max(now_epoch_ms());
        self.future()
            .records
            .iter()
            .filter(|record| record.timestamp() >= from && record.timestamp() <= end)
            .cloned()
            .collect()
    }

    /// 取消计划写入，返回尚未到期的记录。
    pub fn cancel_future_writes(&self) -> Vec<Record> {
        let now = now_epoch_ms();
        let mut future = self.future();
        future.cancel.cancel();
        std::mem::take(&mut future.records)
            .into_iter()
            .filter(|record| record.timestamp() >= now)
            .collect()
    }

    fn future(&self) -> MutexGuard<'_, FutureWrites> {
        self.future.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn notify_listeners(&self, listeners: Vec<ListenerEntry>, record: &Record) {
        for (id, listener) in listeners {
            let delivery = AssertUnwindSafe(listener.new_record(&self.config.id, record)).catch_unwind();
            match tokio::time::timeout(self.settings.listener_timeout, delivery).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    self.metrics.record_listener_failure();
                    warn!(target: "daq.channel", channel_id = %self.config.id, listener = id, error = %err, "listener_failed");
                }
                Ok(Err(_)) => {
                    self.metrics.record_listener_failure();
                    warn!(target: "daq.channel", channel_id = %self.config.id, listener = id, "listener_panicked");
                }
                Err(_) => {
                    self.metrics.record_listener_timeout();
                    warn!(
                        target: "daq.channel",
                        channel_id = %self.config.id,
                        listener = id,
                        timeout_ms = self.settings.listener_timeout.as_millis() as u64,
                        "listener_timed_out"
                    );
                }
            }
        }
    }
}

async fn run_future_writes(
    channel: Weak<Channel>,
    records: Vec<Record>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let base_epoch_ms = now_epoch_ms();
    let base = Instant::now();
    for record in records {
        let delay = (record.timestamp() - base_epoch_ms).max(0) as u64;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(base + Duration::from_millis(delay)) => {}
        }
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let timestamp = record.timestamp();
        let flag = channel.write(record.into_value(), timeout).await;
        if flag != Flag::Valid {
            warn!(target: "daq.channel", channel_id = %channel.id(), timestamp, flag = %flag, "future_write_failed");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.config.id)
            .field("latest", &self.get_latest_record())
            .finish()
    }
}
