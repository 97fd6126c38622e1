//! 内存记录器
//!
//! 每通道保留最近 `retention` 条记录，可按时间范围查询。

use crate::{DataLogger, DataLoggerError, stamped};
use async_trait::async_trait;
use daq_parser::LoggingRecord;
use domain::Record;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

pub struct InMemoryDataLogger {
    id: String,
    retention: usize,
    records: RwLock<HashMap<String, VecDeque<Record>>>,
}

impl InMemoryDataLogger {
    pub fn new(id: impl Into<String>, retention: usize) -> Self {
        Self {
            id: id.into(),
            retention: retention.max(1),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// 某通道当前保留的记录数（用于测试）。
    pub fn len(&self, channel_id: &str) -> usize {
        self.records
            .read()
            .map(|records| records.get(channel_id).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl DataLogger for InMemoryDataLogger {
    fn id(&self) -> &str {
        &self.id
    }

    async fn log(&self, records: &[LoggingRecord], timestamp: i64) -> Result<(), DataLoggerError> {
        let mut store = self
            .records
            .write()
            .map_err(|_| DataLoggerError::Logger("lock failed".to_string()))?;
        for logged in records {
            let queue = store.entry(logged.channel_id.clone()).or_default();
            if queue.len() == self.retention {
                queue.pop_front();
            }
            queue.push_back(stamped(&logged.record, timestamp));
        }
        Ok(())
    }

    async fn get_records(
        &self,
        channel_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Record>, DataLoggerError> {
        let store = self
            .records
            .read()
            .map_err(|_| DataLoggerError::Logger("lock failed".to_string()))?;
        Ok(store
            .get(channel_id)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|record| (start..=end).contains(&record.timestamp()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
