//! 记录能力模块：DataLogger SPI 与内置实现。
//!
//! 记录器收到的是某个记录节拍下各通道的最新记录；记录时间统一为节拍时间戳。

mod file;
mod memory;

pub use file::ParserDataLogger;
pub use memory::InMemoryDataLogger;

use async_trait::async_trait;
use daq_config::ChannelConfig;
use daq_parser::{LoggingRecord, ParseError};
use domain::Record;
use std::collections::HashMap;
use std::sync::Arc;

/// 记录器错误。
#[derive(Debug, thiserror::Error)]
pub enum DataLoggerError {
    #[error("logger io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("logger error: {0}")]
    Logger(String),
}

/// 数据记录器抽象。
#[async_trait]
pub trait DataLogger: Send + Sync {
    fn id(&self) -> &str;

    /// 启动或配置重载后，需要记录的通道全集。
    async fn set_channels_to_log(&self, _channels: &[Arc<ChannelConfig>]) {}

    async fn log(&self, records: &[LoggingRecord], timestamp: i64) -> Result<(), DataLoggerError>;

    /// 查询 `[start, end]`（闭区间）内的记录。
    async fn get_records(
        &self,
        _channel_id: &str,
        _start: i64,
        _end: i64,
    ) -> Result<Vec<Record>, DataLoggerError> {
        Err(DataLoggerError::Unsupported(format!(
            "logger {} does not support queries",
            self.id()
        )))
    }
}

/// 以节拍时间戳重新标记记录。
pub(crate) fn stamped(record: &Record, timestamp: i64) -> Record {
    Record::new(record.value().cloned(), timestamp, record.flag())
}

/// 记录器注册表：logger id → 实现。
#[derive(Clone, Default)]
pub struct DataLoggerRegistry {
    loggers: HashMap<String, Arc<dyn DataLogger>>,
}

impl DataLoggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, logger: Arc<dyn DataLogger>) -> Option<Arc<dyn DataLogger>> {
        self.loggers.insert(logger.id().to_string(), logger)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DataLogger>> {
        self.loggers.get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }

    /// 按 id 排序的全部记录器。
    pub fn all(&self) -> Vec<Arc<dyn DataLogger>> {
        let mut loggers: Vec<Arc<dyn DataLogger>> = self.loggers.values().cloned().collect();
        loggers.sort_by(|a, b| a.id().cmp(b.id()));
        loggers
    }

    /// 按 id 列表选择记录器；空列表表示全部。未知 id 被忽略。
    pub fn select(&self, ids: &[&str]) -> Vec<Arc<dyn DataLogger>> {
        if ids.is_empty() {
            return self.all();
        }
        ids.iter().filter_map(|id| self.get(id)).collect()
    }
}
