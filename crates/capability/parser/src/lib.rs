//! 解析能力模块：记录的序列化/反序列化（持久化与网络交换）。

mod json;

pub use json::{JSON_PARSER_ID, JsonRecordParser};

use domain::{Record, ValueType};
use std::collections::HashMap;
use std::sync::Arc;

/// 解析错误。
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("deserialize error: {0}")]
    Deserialize(String),
    #[error("invalid {value_type} value: {reason}")]
    Value { value_type: ValueType, reason: String },
}

/// 带通道 id 的记录。
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingRecord {
    pub channel_id: String,
    pub record: Record,
}

impl LoggingRecord {
    pub fn new(channel_id: impl Into<String>, record: Record) -> Self {
        Self {
            channel_id: channel_id.into(),
            record,
        }
    }
}

/// 解析服务抽象。
pub trait ParserService: Send + Sync {
    fn id(&self) -> &str;

    fn serialize(&self, record: &LoggingRecord) -> Result<Vec<u8>, ParseError>;

    /// 逐条序列化，每条以换行结尾。
    fn serialize_many(&self, records: &[LoggingRecord]) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        for record in records {
            out.extend(self.serialize(record)?);
            out.push(b'\n');
        }
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8], value_type: ValueType) -> Result<Record, ParseError>;
}

/// 解析器注册表：parser id → 实现。
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn ParserService>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置 JSON 解析器。
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonRecordParser::new()));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn ParserService>) -> Option<Arc<dyn ParserService>> {
        self.parsers.insert(parser.id().to_string(), parser)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ParserService>> {
        self.parsers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.parsers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
