//! 调度单元：同一单元的通道共享一个节拍与一次在途操作。

use daq_channel::Channel;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    /// 同设备同采样组，批量读取
    Shared(String),
    /// 未分组的通道单独成单元
    Single(String),
}

/// 采样单元：`(device, interval, offset, samplingGroup)`。
pub(crate) struct SamplingUnit {
    pub(crate) device_id: String,
    pub(crate) interval_ms: i64,
    pub(crate) offset_ms: i64,
    pub(crate) sampling_group: String,
    pub(crate) channels: Vec<Arc<Channel>>,
    in_flight: AtomicBool,
}

/// 记录单元：`(interval, offset)`。
pub(crate) struct LoggingUnit {
    pub(crate) interval_ms: i64,
    pub(crate) offset_ms: i64,
    pub(crate) channels: Vec<Arc<Channel>>,
    in_flight: AtomicBool,
}

/// 在途标记释放器；drop 时释放（包括任务 panic）。
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

impl SamplingUnit {
    /// 占用在途标记；已有在途操作时返回 false。
    pub(crate) fn try_claim(&self) -> bool {
        claim(&self.in_flight)
    }

    pub(crate) fn release_on_drop(&self) -> InFlight<'_> {
        InFlight(&self.in_flight)
    }
}

impl LoggingUnit {
    pub(crate) fn try_claim(&self) -> bool {
        claim(&self.in_flight)
    }

    pub(crate) fn release_on_drop(&self) -> InFlight<'_> {
        InFlight(&self.in_flight)
    }
}

/// 按 id 排序的通道构建采样单元；监听、禁用、未配置采样的通道不参与。
pub(crate) fn sampling_units(channels: &[Arc<Channel>]) -> Vec<SamplingUnit> {
    let mut grouped: BTreeMap<(String, i64, i64, GroupKey), Vec<Arc<Channel>>> = BTreeMap::new();
    for channel in channels {
        let config = channel.config();
        if !config.is_sampling() {
            continue;
        }
        let Some(interval) = config.sampling_interval_ms else {
            continue;
        };
        let group = if config.sampling_group.is_empty() {
            GroupKey::Single(config.id.clone())
        } else {
            GroupKey::Shared(config.sampling_group.clone())
        };
        grouped
            .entry((
                config.device_id.clone(),
                interval,
                config.sampling_time_offset_ms,
                group,
            ))
            .or_default()
            .push(channel.clone());
    }
    grouped
        .into_iter()
        .map(|((device_id, interval_ms, offset_ms, group), channels)| SamplingUnit {
            device_id,
            interval_ms,
            offset_ms,
            sampling_group: match group {
                GroupKey::Shared(group) => group,
                GroupKey::Single(_) => String::new(),
            },
            channels,
            in_flight: AtomicBool::new(false),
        })
        .collect()
}

/// 周期记录单元；事件记录（负周期）的通道不进入时间轮。
pub(crate) fn logging_units(channels: &[Arc<Channel>]) -> Vec<LoggingUnit> {
    let mut grouped: BTreeMap<(i64, i64), Vec<Arc<Channel>>> = BTreeMap::new();
    for channel in channels {
        let config = channel.config();
        if !config.is_interval_logging() {
            continue;
        }
        let Some(interval) = config.logging_interval_ms else {
            continue;
        };
        grouped
            .entry((interval, config.logging_time_offset_ms))
            .or_default()
            .push(channel.clone());
    }
    grouped
        .into_iter()
        .map(|((interval_ms, offset_ms), channels)| LoggingUnit {
            interval_ms,
            offset_ms,
            channels,
            in_flight: AtomicBool::new(false),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_channel::ChannelSettings;
    use daq_config::{ChannelConfig, ChannelRegistry};
    use daq_driver::{DevicePool, DriverRegistry, NoopDeviceEventHandler, PoolConfig};
    use daq_telemetry::TelemetryMetrics;

    fn channel(id: &str, interval: Option<i64>, group: &str, logging: Option<i64>) -> Arc<Channel> {
        let mut config = ChannelConfig::new(id, "dev-1", "memory");
        config.sampling_interval_ms = interval;
        config.sampling_group = group.to_string();
        config.logging_interval_ms = logging;
        let pool = DevicePool::new(
            &ChannelRegistry::default(),
            DriverRegistry::new(),
            Arc::new(NoopDeviceEventHandler),
            Arc::new(TelemetryMetrics::default()),
            PoolConfig::default(),
        );
        Arc::new(Channel::new(
            Arc::new(config),
            pool,
            ChannelSettings::default(),
            Arc::new(TelemetryMetrics::default()),
        ))
    }

    #[test]
    fn grouped_channels_share_a_unit() {
        let channels = vec![
            channel("a", Some(1000), "g1", Some(60_000)),
            channel("b", Some(1000), "g1", Some(60_000)),
            channel("c", Some(1000), "", Some(-1)),
            channel("d", Some(1000), "", None),
            channel("e", None, "g1", None),
        ];
        let units = sampling_units(&channels);
        assert_eq!(units.len(), 3);
        let shared = units
            .iter()
            .find(|unit| unit.sampling_group == "g1")
            .expect("group unit");
        assert_eq!(shared.channels.len(), 2);

        let logging = logging_units(&channels);
        assert_eq!(logging.len(), 1);
        assert_eq!(logging[0].channels.len(), 2);
    }

    #[test]
    fn unit_allows_one_claim_at_a_time() {
        let units = sampling_units(&[channel("a", Some(100), "", None)]);
        let unit = &units[0];
        assert!(unit.try_claim());
        assert!(!unit.try_claim());
        drop(unit.release_on_drop());
        assert!(unit.try_claim());
    }
}
