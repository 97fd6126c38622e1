//! 解析器文件记录器
//!
//! 每个通道一个文件 `<dir>/<channel_id>.<parser_id>`，按行追加序列化记录。

use crate::{DataLogger, DataLoggerError, stamped};
use async_trait::async_trait;
use daq_config::ChannelConfig;
use daq_parser::{LoggingRecord, ParserService};
use domain::{Record, ValueType};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct ParserDataLogger {
    id: String,
    directory: PathBuf,
    parser: Arc<dyn ParserService>,
    value_types: RwLock<HashMap<String, ValueType>>,
    append: Mutex<()>,
}

impl ParserDataLogger {
    pub fn new(id: impl Into<String>, directory: impl AsRef<Path>, parser: Arc<dyn ParserService>) -> Self {
        Self {
            id: id.into(),
            directory: directory.as_ref().to_path_buf(),
            parser,
            value_types: RwLock::new(HashMap::new()),
            append: Mutex::new(()),
        }
    }

    fn path(&self, channel_id: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", channel_id, self.parser.id()))
    }

    fn value_type(&self, channel_id: &str) -> Option<ValueType> {
        self.value_types
            .read()
            .ok()
            .and_then(|types| types.get(channel_id).copied())
    }
}

#[async_trait]
impl DataLogger for ParserDataLogger {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_channels_to_log(&self, channels: &[Arc<ChannelConfig>]) {
        if let Ok(mut types) = self.value_types.write() {
            *types = channels
                .iter()
                .map(|channel| (channel.id.clone(), channel.value_type))
                .collect();
        }
    }

    async fn log(&self, records: &[LoggingRecord], timestamp: i64) -> Result<(), DataLoggerError> {
        let mut by_channel: BTreeMap<&str, Vec<LoggingRecord>> = BTreeMap::new();
        for logged in records {
            by_channel
                .entry(logged.channel_id.as_str())
                .or_default()
                .push(LoggingRecord::new(
                    &logged.channel_id,
                    stamped(&logged.record, timestamp),
                ));
        }

        let _guard = self.append.lock().await;
        tokio::fs::create_dir_all(&self.directory).await?;
        for (channel_id, batch) in by_channel {
            let bytes = self.parser.serialize_many(&batch)?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(channel_id))
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
        }
        debug!(target: "daq.datalog", logger_id = %self.id, records = records.len(), timestamp, "records_appended");
        Ok(())
    }

    async fn get_records(
        &self,
        channel_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Record>, DataLoggerError> {
        let value_type = self.value_type(channel_id).ok_or_else(|| {
            DataLoggerError::Logger(format!("channel {} is not logged", channel_id))
        })?;
        let text = match tokio::fs::read_to_string(self.path(channel_id)).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            match self.parser.deserialize(line.as_bytes(), value_type) {
                Ok(record) if (start..=end).contains(&record.timestamp()) => records.push(record),
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "daq.datalog", logger_id = %self.id, channel_id = %channel_id, error = %err, "logged_line_skipped");
                }
            }
        }
        Ok(records)
    }
}
