use crate::flag::Flag;
use crate::value::Value;

/// 通道记录：值 + 时间戳（毫秒）+ 质量标志。
///
/// 构造后不可变；通道的最新记录只会整体替换。
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    value: Option<Value>,
    timestamp: i64,
    flag: Flag,
}

impl Record {
    /// 空值不能携带 VALID，会降级为 VALUE_NOT_AVAILABLE。
    pub fn new(value: Option<Value>, timestamp: i64, flag: Flag) -> Self {
        let flag = if value.is_none() && flag == Flag::Valid {
            Flag::ValueNotAvailable
        } else {
            flag
        };
        Self {
            value,
            timestamp,
            flag,
        }
    }

    pub fn valid(value: Value, timestamp: i64) -> Self {
        Self::new(Some(value), timestamp, Flag::Valid)
    }

    /// 无值记录（错误或占位）。
    pub fn with_flag(flag: Flag, timestamp: i64) -> Self {
        Self::new(None, timestamp, flag)
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn flag(&self) -> Flag {
        self.flag
    }

    pub fn is_valid(&self) -> bool {
        self.flag.is_valid()
    }

    pub fn into_value(self) -> Option<Value> {
        self.value
    }
}

pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
