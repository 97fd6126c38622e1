//! JSON 行格式：`{"timestamp":<ms>,"flag":"VALID","value":<v>}`。
//!
//! 字节数组按 base64 编码；无值时省略 `value` 字段。

use crate::{LoggingRecord, ParseError, ParserService};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use domain::{Flag, Record, Value, ValueType};
use serde::{Deserialize, Serialize};
use serde_json::Number;

pub const JSON_PARSER_ID: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    timestamp: i64,
    flag: Flag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
}

/// JSON 行解析器。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordParser;

impl JsonRecordParser {
    pub fn new() -> Self {
        Self
    }
}

fn number(value: f64) -> Result<serde_json::Value, ParseError> {
    Number::from_f64(value)
        .map(serde_json::Value::Number)
        .ok_or_else(|| ParseError::Serialize(format!("non-finite value: {}", value)))
}

fn encode_value(value: &Value) -> Result<serde_json::Value, ParseError> {
    let encoded = match value {
        Value::Boolean(v) => serde_json::Value::Bool(*v),
        Value::Byte(v) => serde_json::Value::from(*v),
        Value::Short(v) => serde_json::Value::from(*v),
        Value::Integer(v) => serde_json::Value::from(*v),
        Value::Long(v) => serde_json::Value::from(*v),
        Value::Float(v) => number(f64::from(*v))?,
        Value::Double(v) => number(*v)?,
        Value::ByteArray(v) => serde_json::Value::String(BASE64_STANDARD.encode(v)),
        Value::String(v) => serde_json::Value::String(v.clone()),
    };
    Ok(encoded)
}

fn decode_value(json: &serde_json::Value, value_type: ValueType) -> Result<Value, ParseError> {
    let invalid = |reason: &str| ParseError::Value {
        value_type,
        reason: reason.to_string(),
    };
    let integer = || json.as_i64().ok_or_else(|| invalid("expected integer"));
    let value = match value_type {
        ValueType::Boolean => Value::Boolean(json.as_bool().ok_or_else(|| invalid("expected boolean"))?),
        ValueType::Byte => Value::Byte(i8::try_from(integer()?).map_err(|_| invalid("out of range"))?),
        ValueType::Short => Value::Short(i16::try_from(integer()?).map_err(|_| invalid("out of range"))?),
        ValueType::Integer => {
            Value::Integer(i32::try_from(integer()?).map_err(|_| invalid("out of range"))?)
        }
        ValueType::Long => Value::Long(integer()?),
        ValueType::Float => Value::Float(json.as_f64().ok_or_else(|| invalid("expected number"))? as f32),
        ValueType::Double => Value::Double(json.as_f64().ok_or_else(|| invalid("expected number"))?),
        ValueType::ByteArray => {
            let text = json.as_str().ok_or_else(|| invalid("expected base64 string"))?;
            Value::ByteArray(
                BASE64_STANDARD
                    .decode(text)
                    .map_err(|err| invalid(&err.to_string()))?,
            )
        }
        ValueType::String => Value::String(
            json.as_str()
                .ok_or_else(|| invalid("expected string"))?
                .to_string(),
        ),
    };
    Ok(value)
}

impl ParserService for JsonRecordParser {
    fn id(&self) -> &str {
        JSON_PARSER_ID
    }

    fn serialize(&self, record: &LoggingRecord) -> Result<Vec<u8>, ParseError> {
        let wire = WireRecord {
            timestamp: record.record.timestamp(),
            flag: record.record.flag(),
            value: record.record.value().map(encode_value).transpose()?,
        };
        serde_json::to_vec(&wire).map_err(|err| ParseError::Serialize(err.to_string()))
    }

    fn deserialize(&self, bytes: &[u8], value_type: ValueType) -> Result<Record, ParseError> {
        let wire: WireRecord =
            serde_json::from_slice(bytes).map_err(|err| ParseError::Deserialize(err.to_string()))?;
        let value = match wire.value {
            Some(serde_json::Value::Null) | None => None,
            Some(json) => Some(decode_value(&json, value_type)?),
        };
        Ok(Record::new(value, wire.timestamp, wire.flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(record: Record) -> LoggingRecord {
        LoggingRecord::new("ch-1", record)
    }

    #[test]
    fn valid_record_line_layout() {
        let bytes = JsonRecordParser
            .serialize(&logging(Record::valid(Value::Double(3.0), 1_700_000_000_000)))
            .expect("serialize");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            r#"{"timestamp":1700000000000,"flag":"VALID","value":3.0}"#
        );
    }

    #[test]
    fn absent_value_is_omitted() {
        let bytes = JsonRecordParser
            .serialize(&logging(Record::with_flag(Flag::DeviceNotConnected, 5)))
            .expect("serialize");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            r#"{"timestamp":5,"flag":"DEVICE_NOT_CONNECTED"}"#
        );
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let err = JsonRecordParser
            .serialize(&logging(Record::valid(Value::Double(f64::NAN), 1)))
            .expect_err("nan");
        assert!(matches!(err, ParseError::Serialize(_)));
    }

    #[test]
    fn wrong_json_type_is_a_value_error() {
        let err = JsonRecordParser
            .deserialize(br#"{"timestamp":1,"flag":"VALID","value":"abc"}"#, ValueType::Integer)
            .expect_err("type mismatch");
        assert!(matches!(err, ParseError::Value { value_type: ValueType::Integer, .. }));
        let err = JsonRecordParser
            .deserialize(br#"{"timestamp":1,"flag":"VALID","value":300}"#, ValueType::Byte)
            .expect_err("range");
        assert!(matches!(err, ParseError::Value { .. }));
    }
}
