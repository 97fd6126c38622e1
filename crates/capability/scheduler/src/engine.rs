//! 采集引擎
//!
//! 一个"代"（generation）对应一次加载的通道配置：连接池、通道、
//! 采样/记录单元和协调任务。重载时停止旧代、构建新代并迁移监听器。
//!
//! 监听器迁移与当前代切换在同一把登记锁内完成，`add_listener` /
//! `remove_listener` 也持有该锁，重载期间注册的监听器不会留在旧代。

use crate::timing::{Clock, TimingWheel, first_fire, next_fire};
use crate::units::{LoggingUnit, SamplingUnit, logging_units, sampling_units};
use crate::SchedulerError;
use async_trait::async_trait;
use daq_channel::{Channel, ChannelSettings, RecordListener, Subscription};
use daq_config::{AppConfig, ChannelConfig, ChannelRegistry};
use daq_datalog::DataLoggerRegistry;
use daq_dispatch::ServerDispatcher;
use daq_driver::{
    ChannelRecordContainer, ChannelScanInfo, DeviceEventHandler, DevicePool, DeviceScan,
    DeviceState, DriverRegistry, PoolConfig,
};
use daq_parser::LoggingRecord;
use daq_telemetry::{MetricsSnapshot, TelemetryMetrics};
use domain::{Flag, Record, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// 引擎运行参数。
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// 停止时等待在途操作的宽限期
    pub shutdown_grace: Duration,
    pub listener_timeout: Duration,
    pub connect_timeout: Duration,
    /// 同时进行的设备读取上限
    pub max_concurrent_io: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            listener_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            max_concurrent_io: 64,
        }
    }
}

impl SchedulerSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            listener_timeout: Duration::from_millis(config.listener_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_concurrent_io: config.max_concurrent_io.max(1),
        }
    }
}

/// 各代共享的服务。
struct Shared {
    drivers: DriverRegistry,
    loggers: DataLoggerRegistry,
    dispatcher: ServerDispatcher,
    metrics: Arc<TelemetryMetrics>,
    settings: SchedulerSettings,
    clock: Clock,
    io_permits: Arc<Semaphore>,
}

impl Shared {
    /// 按通道的记录器选择分批写入；单个记录器失败不影响其他记录器。
    async fn log_records(&self, entries: &[(Arc<Channel>, Record)], timestamp: i64) {
        if entries.is_empty() || self.loggers.is_empty() {
            return;
        }
        let mut batches: BTreeMap<String, (Arc<dyn daq_datalog::DataLogger>, Vec<LoggingRecord>)> =
            BTreeMap::new();
        for (channel, record) in entries {
            for logger in self.loggers.select(&channel.config().logger_ids()) {
                batches
                    .entry(logger.id().to_string())
                    .or_insert_with(|| (logger.clone(), Vec::new()))
                    .1
                    .push(LoggingRecord::new(channel.id(), record.clone()));
            }
        }
        for (logger_id, (logger, batch)) in batches {
            match logger.log(&batch, timestamp).await {
                Ok(()) => self.metrics.record_logged(batch.len() as u64),
                Err(err) => {
                    self.metrics.record_logger_failure();
                    warn!(target: "daq.scheduler", logger_id = %logger_id, records = batch.len(), error = %err, "logger_failed");
                }
            }
        }
    }

    /// 事件记录：负记录周期的通道每次更新都写入。
    async fn log_event(&self, channel: &Arc<Channel>, record: &Record) {
        if channel.config().is_event_logging() {
            self.log_records(&[(channel.clone(), record.clone())], record.timestamp())
                .await;
        }
    }
}

/// 把设备状态变化与监听记录转交给本代的通道。
struct GenerationHandler {
    shared: Arc<Shared>,
    channels: OnceLock<HashMap<String, Weak<Channel>>>,
}

impl GenerationHandler {
    fn channel(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels.get()?.get(channel_id)?.upgrade()
    }

    fn channels_of_device(&self, device_id: &str) -> Vec<Arc<Channel>> {
        let Some(channels) = self.channels.get() else {
            return Vec::new();
        };
        let mut matched: Vec<Arc<Channel>> = channels
            .values()
            .filter_map(Weak::upgrade)
            .filter(|channel| channel.config().device_id == device_id)
            .collect();
        matched.sort_by(|a, b| a.id().cmp(b.id()));
        matched
    }
}

#[async_trait]
impl DeviceEventHandler for GenerationHandler {
    async fn device_state_changed(&self, device_id: &str, state: DeviceState) {
        let flag = match state {
            DeviceState::WaitingForConnectionRetry => Flag::DeviceNotConnected,
            DeviceState::DriverUnavailable => Flag::DriverUnavailable,
            DeviceState::Disabled => Flag::Disabled,
            _ => return,
        };
        for channel in self.channels_of_device(device_id) {
            if channel.config().disabled && flag != Flag::Disabled {
                continue;
            }
            let record = channel.set_flag(flag).await;
            self.shared.log_event(&channel, &record).await;
        }
    }

    async fn listened_records(&self, device_id: &str, records: Vec<ChannelRecordContainer>) {
        debug!(target: "daq.scheduler", device_id = %device_id, records = records.len(), "listened_records_received");
        for container in records {
            let Some(channel) = self.channel(&container.channel_id) else {
                continue;
            };
            let record = channel.apply_driver_record(container.record).await;
            self.shared.log_event(&channel, &record).await;
        }
    }
}

/// 一次加载的通道配置及其运行态。
struct Generation {
    registry: Arc<ChannelRegistry>,
    pool: DevicePool,
    channels: HashMap<String, Arc<Channel>>,
    sampling: Vec<SamplingUnit>,
    logging: Vec<LoggingUnit>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct SchedulerInner {
    shared: Arc<Shared>,
    active: RwLock<Option<Arc<Generation>>>,
    lifecycle: Mutex<()>,
    /// 监听器登记与代切换互斥
    registration: std::sync::Mutex<()>,
}

/// 采集引擎：配置生命周期、定时采样、记录与对外 API。
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        drivers: DriverRegistry,
        loggers: DataLoggerRegistry,
        dispatcher: ServerDispatcher,
        metrics: Arc<TelemetryMetrics>,
        settings: SchedulerSettings,
    ) -> Self {
        let io_permits = Arc::new(Semaphore::new(settings.max_concurrent_io.max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                shared: Arc::new(Shared {
                    drivers,
                    loggers,
                    dispatcher,
                    metrics,
                    settings,
                    clock: Clock::new(),
                    io_permits,
                }),
                active: RwLock::new(None),
                lifecycle: Mutex::new(()),
                registration: std::sync::Mutex::new(()),
            }),
        }
    }

    fn generation(&self) -> Option<Arc<Generation>> {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn running(&self) -> Result<Arc<Generation>, SchedulerError> {
        self.generation().ok_or(SchedulerError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.generation().is_some()
    }

    /// 加载配置并开始采集。
    pub async fn start(&self, registry: ChannelRegistry) -> Result<(), SchedulerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.generation().is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let generation = self.build(Arc::new(registry), None);
        self.install(&generation, None);
        info!(
            target: "daq.scheduler",
            channels = generation.channels.len(),
            sampling_units = generation.sampling.len(),
            logging_units = generation.logging.len(),
            "scheduler_starting"
        );
        self.activate(generation).await;
        Ok(())
    }

    /// 以新配置替换运行中的配置。
    ///
    /// 同 id 通道保留监听器与未到期的计划写入；被移除的通道最后收到
    /// 一条 `CHANNEL_DELETED` 记录。
    pub async fn reload(&self, registry: ChannelRegistry) -> Result<(), SchedulerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let previous = self.running()?;
        let pending: Vec<(String, Vec<Record>)> = previous
            .channels
            .iter()
            .map(|(id, channel)| (id.clone(), channel.cancel_future_writes()))
            .filter(|(_, records)| !records.is_empty())
            .collect();
        self.stop(&previous).await;

        let generation = self.build(Arc::new(registry), Some(previous.as_ref()));
        self.install(&generation, Some(previous.as_ref()));
        for (id, records) in pending {
            if let Some(channel) = generation.channels.get(&id) {
                channel.write_future(records);
            }
        }
        let mut removed: Vec<&Arc<Channel>> = previous
            .channels
            .iter()
            .filter(|(id, _)| !generation.channels.contains_key(*id))
            .map(|(_, channel)| channel)
            .collect();
        removed.sort_by(|a, b| a.id().cmp(b.id()));
        for channel in &removed {
            channel.delete().await;
        }
        info!(
            target: "daq.scheduler",
            channels = generation.channels.len(),
            removed = removed.len(),
            "configuration_reloaded"
        );
        self.activate(generation).await;
        Ok(())
    }

    /// 停止采集并释放所有连接；可重复调用。
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let taken = self
            .inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(generation) = taken else {
            return;
        };
        self.stop(&generation).await;
        info!(target: "daq.scheduler", "scheduler_shutdown");
    }

    fn build(&self, registry: Arc<ChannelRegistry>, previous: Option<&Generation>) -> Arc<Generation> {
        let shared = &self.inner.shared;
        let handler = Arc::new(GenerationHandler {
            shared: shared.clone(),
            channels: OnceLock::new(),
        });
        let pool = DevicePool::new(
            &registry,
            shared.drivers.clone(),
            handler.clone(),
            shared.metrics.clone(),
            PoolConfig {
                connect_timeout: shared.settings.connect_timeout,
            },
        );
        let channel_settings = ChannelSettings {
            listener_timeout: shared.settings.listener_timeout,
            ..ChannelSettings::default()
        };

        let ordered: Vec<Arc<Channel>> = registry
            .channels()
            .iter()
            .map(|config| {
                Arc::new(Channel::new(
                    config.clone(),
                    pool.clone(),
                    channel_settings.clone(),
                    shared.metrics.clone(),
                ))
            })
            .collect();
        for channel in &ordered {
            let survives = previous.is_some_and(|generation| generation.channels.contains_key(channel.id()));
            if !survives {
                channel.add_listener(Arc::new(shared.dispatcher.clone()));
            }
        }

        let channels: HashMap<String, Arc<Channel>> = ordered
            .iter()
            .map(|channel| (channel.id().to_string(), channel.clone()))
            .collect();
        let weak = channels
            .iter()
            .map(|(id, channel)| (id.clone(), Arc::downgrade(channel)))
            .collect();
        let _ = handler.channels.set(weak);

        Arc::new(Generation {
            sampling: sampling_units(&ordered),
            logging: logging_units(&ordered),
            registry,
            pool,
            channels,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// 迁移同 id 通道的监听器并切换当前代。
    fn install(&self, generation: &Arc<Generation>, previous: Option<&Generation>) {
        let _registration = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = previous {
            for (id, channel) in &generation.channels {
                if let Some(old) = previous.channels.get(id) {
                    channel.adopt_listeners(old);
                }
            }
        }
        *self
            .inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(generation.clone());
    }

    async fn activate(&self, generation: Arc<Generation>) {
        let shared = &self.inner.shared;
        let logged: Vec<Arc<ChannelConfig>> = generation
            .registry
            .channels()
            .iter()
            .filter(|config| config.is_interval_logging() || config.is_event_logging())
            .cloned()
            .collect();
        for logger in shared.loggers.all() {
            logger.set_channels_to_log(&logged).await;
        }
        shared
            .dispatcher
            .apply_configuration(generation.registry.server_mappings())
            .await;

        generation.pool.start().await;
        generation
            .tracker
            .spawn(coordinate(generation.clone(), shared.clone()));
    }

    async fn stop(&self, generation: &Generation) {
        for channel in generation.channels.values() {
            channel.cancel_future_writes();
        }
        generation.cancel.cancel();
        generation.tracker.close();
        let grace = self.inner.shared.settings.shutdown_grace;
        if tokio::time::timeout(grace, generation.tracker.wait())
            .await
            .is_err()
        {
            warn!(target: "daq.scheduler", grace_ms = grace.as_millis() as u64, "shutdown_grace_expired");
        }
        generation.pool.shutdown().await;
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.generation()?.channels.get(channel_id).cloned()
    }

    fn require_channel(&self, channel_id: &str) -> Result<Arc<Channel>, SchedulerError> {
        self.running()?
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownChannel(channel_id.to_string()))
    }

    /// 按 id 排序的通道列表。
    pub fn channel_ids(&self) -> Vec<String> {
        let Some(generation) = self.generation() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = generation.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.generation()?.pool.device_state(device_id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.shared.metrics.snapshot()
    }

    pub fn add_listener(
        &self,
        channel_id: &str,
        listener: Arc<dyn RecordListener>,
    ) -> Result<Subscription, SchedulerError> {
        let _registration = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(self.require_channel(channel_id)?.add_listener(listener))
    }

    pub fn remove_listener(&self, subscription: &Subscription) -> bool {
        let _registration = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.channel(subscription.channel_id())
            .is_some_and(|channel| channel.remove_listener(subscription))
    }

    /// 立即读取通道（不等待节拍）。
    pub async fn read(&self, channel_id: &str, timeout: Duration) -> Result<Record, SchedulerError> {
        let channel = self.require_channel(channel_id)?;
        let record = channel.read(timeout).await;
        self.inner.shared.log_event(&channel, &record).await;
        Ok(record)
    }

    /// 写入通道；返回结果标志。
    pub async fn write(
        &self,
        channel_id: &str,
        value: Option<Value>,
        timeout: Duration,
    ) -> Result<Flag, SchedulerError> {
        let channel = self.require_channel(channel_id)?;
        Ok(channel.write(value, timeout).await)
    }

    /// 计划在各记录时间戳写入；替换该通道此前的计划。
    pub fn write_future(&self, channel_id: &str, records: Vec<Record>) -> Result<(), SchedulerError> {
        self.require_channel(channel_id)?.write_future(records);
        Ok(())
    }

    pub fn scan_for_devices(&self, driver_id: &str, settings: &str) -> Result<DeviceScan, SchedulerError> {
        Ok(self.running()?.pool.scan_for_devices(driver_id, settings)?)
    }

    pub async fn scan_for_channels(
        &self,
        device_id: &str,
        settings: &str,
    ) -> Result<Vec<ChannelScanInfo>, SchedulerError> {
        let generation = self.running()?;
        Ok(generation.pool.scan_for_channels(device_id, settings).await?)
    }

    /// 从指定记录器查询历史记录（闭区间），并附上区间内尚未到期的计划写入。
    pub async fn get_logged_records(
        &self,
        logger_id: &str,
        channel_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Record>, SchedulerError> {
        let logger = self
            .inner
            .shared
            .loggers
            .get(logger_id)
            .ok_or_else(|| SchedulerError::UnknownLogger(logger_id.to_string()))?;
        let mut records = logger.get_records(channel_id, start, end).await?;
        if let Some(channel) = self.channel(channel_id) {
            records.extend(channel.future_records(start, end));
        }
        Ok(records)
    }
}

/// 协调任务：两个时间轮驱动采样与周期记录。
async fn coordinate(generation: Arc<Generation>, shared: Arc<Shared>) {
    let clock = shared.clock;
    let now = clock.now_ms();
    let mut sampling = TimingWheel::default();
    for (index, unit) in generation.sampling.iter().enumerate() {
        sampling.schedule(first_fire(now, unit.interval_ms, unit.offset_ms), index);
    }
    let mut logging = TimingWheel::default();
    for (index, unit) in generation.logging.iter().enumerate() {
        logging.schedule(first_fire(now, unit.interval_ms, unit.offset_ms), index);
    }
    debug!(target: "daq.scheduler", sampling = sampling.len(), logging = logging.len(), "coordinator_started");

    loop {
        let next = match (sampling.next_fire(), logging.next_fire()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(fire_at) = next else {
            generation.cancel.cancelled().await;
            break;
        };
        tokio::select! {
            _ = generation.cancel.cancelled() => break,
            _ = tokio::time::sleep_until(clock.instant_at(fire_at)) => {}
        }

        let now = clock.now_ms();
        while let Some((tick, index)) = sampling.pop_due(now) {
            let unit = &generation.sampling[index];
            if unit.try_claim() {
                let tracker = generation.tracker.clone();
                tracker.spawn(sample(generation.clone(), shared.clone(), index));
            } else {
                shared.metrics.record_tick_overrun();
                warn!(
                    target: "daq.scheduler",
                    device_id = %unit.device_id,
                    sampling_group = %unit.sampling_group,
                    tick,
                    "sampling_tick_overrun"
                );
            }
            let (next, skipped) = next_fire(tick, unit.interval_ms, now);
            if skipped > 0 {
                shared.metrics.record_ticks_coalesced(skipped);
                warn!(target: "daq.scheduler", device_id = %unit.device_id, skipped, "sampling_ticks_coalesced");
            }
            sampling.schedule(next, index);
        }
        while let Some((tick, index)) = logging.pop_due(now) {
            let unit = &generation.logging[index];
            if unit.try_claim() {
                let tracker = generation.tracker.clone();
                tracker.spawn(log_tick(generation.clone(), shared.clone(), index, tick));
            } else {
                shared.metrics.record_tick_overrun();
                warn!(target: "daq.scheduler", interval_ms = unit.interval_ms, tick, "logging_tick_overrun");
            }
            let (next, skipped) = next_fire(tick, unit.interval_ms, now);
            if skipped > 0 {
                shared.metrics.record_ticks_coalesced(skipped);
                warn!(target: "daq.scheduler", interval_ms = unit.interval_ms, skipped, "logging_ticks_coalesced");
            }
            logging.schedule(next, index);
        }
    }
    debug!(target: "daq.scheduler", "coordinator_stopped");
}

async fn sample(generation: Arc<Generation>, shared: Arc<Shared>, index: usize) {
    let unit = &generation.sampling[index];
    let _release = unit.release_on_drop();
    let permit = tokio::select! {
        _ = generation.cancel.cancelled() => return,
        permit = shared.io_permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };
    let containers = unit
        .channels
        .iter()
        .map(|channel| channel.record_container())
        .collect();
    let results = generation
        .pool
        .read(&unit.device_id, containers, &unit.sampling_group)
        .await;
    drop(permit);

    for container in results {
        let Some(channel) = unit
            .channels
            .iter()
            .find(|channel| channel.id() == container.channel_id)
        else {
            continue;
        };
        let record = channel.apply_driver_record(container.record).await;
        shared.log_event(channel, &record).await;
    }
}

/// 周期记录：以节拍时间为记录时间戳。
async fn log_tick(generation: Arc<Generation>, shared: Arc<Shared>, index: usize, tick: i64) {
    let unit = &generation.logging[index];
    let _release = unit.release_on_drop();
    let entries: Vec<(Arc<Channel>, Record)> = unit
        .channels
        .iter()
        .map(|channel| (channel.clone(), channel.get_latest_record()))
        .collect();
    shared.log_records(&entries, tick).await;
}
