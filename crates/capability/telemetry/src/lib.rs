//! 追踪初始化与采集计数指标。
//!
//! 指标实例由装配层创建并以 `Arc<TelemetryMetrics>` 注入各组件。

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub samples_valid: u64,
    pub samples_failed: u64,
    pub sampling_timeouts: u64,
    pub ticks_overrun: u64,
    pub ticks_coalesced: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub connections_lost: u64,
    pub listened_records: u64,
    pub listener_failures: u64,
    pub listener_timeouts: u64,
    pub records_logged: u64,
    pub logger_failures: u64,
    pub dispatch_failures: u64,
    pub writes: u64,
    pub write_failures: u64,
}

/// 采集计数指标。
#[derive(Debug, Default)]
pub struct TelemetryMetrics {
    samples_valid: AtomicU64,
    samples_failed: AtomicU64,
    sampling_timeouts: AtomicU64,
    ticks_overrun: AtomicU64,
    ticks_coalesced: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    connections_lost: AtomicU64,
    listened_records: AtomicU64,
    listener_failures: AtomicU64,
    listener_timeouts: AtomicU64,
    records_logged: AtomicU64,
    logger_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_valid: self.samples_valid.load(Ordering::Relaxed),
            samples_failed: self.samples_failed.load(Ordering::Relaxed),
            sampling_timeouts: self.sampling_timeouts.load(Ordering::Relaxed),
            ticks_overrun: self.ticks_overrun.load(Ordering::Relaxed),
            ticks_coalesced: self.ticks_coalesced.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
            listened_records: self.listened_records.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            listener_timeouts: self.listener_timeouts.load(Ordering::Relaxed),
            records_logged: self.records_logged.load(Ordering::Relaxed),
            logger_failures: self.logger_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    /// 记录采样结果（按质量标志区分成功/失败）。
    pub fn record_sample(&self, valid: bool) {
        if valid {
            self.samples_valid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.samples_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 记录采样超时次数。
    pub fn record_sampling_timeout(&self) {
        self.sampling_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录因上次操作未完成而丢弃的节拍。
    pub fn record_tick_overrun(&self) {
        self.ticks_overrun.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录被合并跳过的节拍数。
    pub fn record_ticks_coalesced(&self, skipped: u64) {
        self.ticks_coalesced.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录驱动主动推送的记录数。
    pub fn record_listened(&self, count: u64) {
        self.listened_records.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_timeout(&self) {
        self.listener_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_logged(&self, count: u64) {
        self.records_logged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_logger_failure(&self) {
        self.logger_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录写请求（按结果区分）。
    pub fn record_write(&self, success: bool) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
