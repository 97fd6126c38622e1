//! 通道值（带类型的标签联合）及其类型转换。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 通道值的数据类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    Float,
    Double,
    ByteArray,
    String,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Boolean => "BOOLEAN",
            ValueType::Byte => "BYTE",
            ValueType::Short => "SHORT",
            ValueType::Integer => "INTEGER",
            ValueType::Long => "LONG",
            ValueType::Float => "FLOAT",
            ValueType::Double => "DOUBLE",
            ValueType::ByteArray => "BYTE_ARRAY",
            ValueType::String => "STRING",
        }
    }

    /// 整数类型的位宽；非整数返回 None。
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            ValueType::Byte => Some(8),
            ValueType::Short => Some(16),
            ValueType::Integer => Some(32),
            ValueType::Long => Some(64),
            _ => None,
        }
    }

    /// 是否需要长度配置（字符串与字节数组）。
    pub fn has_length(&self) -> bool {
        matches!(self, ValueType::ByteArray | ValueType::String)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    /// 大小写不敏感；兼容 `INT`/`BYTEARRAY` 等常见写法。
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        let value_type = match normalized.as_str() {
            "BOOLEAN" | "BOOL" => ValueType::Boolean,
            "BYTE" => ValueType::Byte,
            "SHORT" => ValueType::Short,
            "INTEGER" | "INT" => ValueType::Integer,
            "LONG" => ValueType::Long,
            "FLOAT" => ValueType::Float,
            "DOUBLE" => ValueType::Double,
            "BYTE_ARRAY" | "BYTEARRAY" => ValueType::ByteArray,
            "STRING" => ValueType::String,
            _ => return Err(format!("unknown value type: {}", s)),
        };
        Ok(value_type)
    }
}

/// 类型转换失败（请求的类型与存储值不兼容）。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {from} value to {to}")]
pub struct ValueConversionError {
    pub from: ValueType,
    pub to: ValueType,
}

/// 通道值。
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<u8>),
    String(String),
}

macro_rules! numeric_accessor {
    ($name:ident, $ty:ty, $target:expr) => {
        pub fn $name(&self) -> Result<$ty, ValueConversionError> {
            match self {
                Value::Boolean(v) => Ok(if *v { 1 as $ty } else { 0 as $ty }),
                Value::Byte(v) => Ok(*v as $ty),
                Value::Short(v) => Ok(*v as $ty),
                Value::Integer(v) => Ok(*v as $ty),
                Value::Long(v) => Ok(*v as $ty),
                Value::Float(v) => Ok(*v as $ty),
                Value::Double(v) => Ok(*v as $ty),
                Value::String(v) => v.trim().parse::<$ty>().map_err(|_| self.conversion_error($target)),
                Value::ByteArray(_) => Err(self.conversion_error($target)),
            }
        }
    };
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Byte(_) => ValueType::Byte,
            Value::Short(_) => ValueType::Short,
            Value::Integer(_) => ValueType::Integer,
            Value::Long(_) => ValueType::Long,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::ByteArray(_) => ValueType::ByteArray,
            Value::String(_) => ValueType::String,
        }
    }

    fn conversion_error(&self, to: ValueType) -> ValueConversionError {
        ValueConversionError {
            from: self.value_type(),
            to,
        }
    }

    numeric_accessor!(as_byte, i8, ValueType::Byte);
    numeric_accessor!(as_short, i16, ValueType::Short);
    numeric_accessor!(as_int, i32, ValueType::Integer);
    numeric_accessor!(as_long, i64, ValueType::Long);
    numeric_accessor!(as_float, f32, ValueType::Float);
    numeric_accessor!(as_double, f64, ValueType::Double);

    pub fn as_bool(&self) -> Result<bool, ValueConversionError> {
        match self {
            Value::Boolean(v) => Ok(*v),
            Value::Byte(v) => Ok(*v != 0),
            Value::Short(v) => Ok(*v != 0),
            Value::Integer(v) => Ok(*v != 0),
            Value::Long(v) => Ok(*v != 0),
            Value::Float(v) => Ok(*v != 0.0),
            Value::Double(v) => Ok(*v != 0.0),
            Value::String(v) => Ok(v.trim().eq_ignore_ascii_case("true")),
            Value::ByteArray(_) => Err(self.conversion_error(ValueType::Boolean)),
        }
    }

    /// 数值按原生位宽输出大端字节。
    pub fn as_byte_array(&self) -> Vec<u8> {
        match self {
            Value::Boolean(v) => vec![u8::from(*v)],
            Value::Byte(v) => v.to_be_bytes().to_vec(),
            Value::Short(v) => v.to_be_bytes().to_vec(),
            Value::Integer(v) => v.to_be_bytes().to_vec(),
            Value::Long(v) => v.to_be_bytes().to_vec(),
            Value::Float(v) => v.to_be_bytes().to_vec(),
            Value::Double(v) => v.to_be_bytes().to_vec(),
            Value::ByteArray(v) => v.clone(),
            Value::String(v) => v.as_bytes().to_vec(),
        }
    }

    pub fn as_string(&self) -> String {
        self.to_string()
    }

    /// 按目标类型转换。
    pub fn convert_to(&self, target: ValueType) -> Result<Value, ValueConversionError> {
        if self.value_type() == target {
            return Ok(self.clone());
        }
        let converted = match target {
            ValueType::Boolean => Value::Boolean(self.as_bool()?),
            ValueType::Byte => Value::Byte(self.as_byte()?),
            ValueType::Short => Value::Short(self.as_short()?),
            ValueType::Integer => Value::Integer(self.as_int()?),
            ValueType::Long => Value::Long(self.as_long()?),
            ValueType::Float => Value::Float(self.as_float()?),
            ValueType::Double => Value::Double(self.as_double()?),
            ValueType::ByteArray => Value::ByteArray(self.as_byte_array()),
            ValueType::String => Value::String(self.as_string()),
        };
        Ok(converted)
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Value::ByteArray(_) | Value::String(_) | Value::Boolean(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::ByteArray(v) => write!(f, "{:?}", v),
            Value::String(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::ByteArray(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_narrowing_is_lossy_not_failing() {
        let value = Value::Double(300.7);
        assert_eq!(value.as_long().expect("long"), 300);
        assert_eq!(value.as_byte().expect("byte"), 127);
        assert!(value.as_bool().expect("bool"));
    }

    #[test]
    fn string_parse_failure_is_typed_error() {
        let err = Value::from("abc").as_double().expect_err("not a number");
        assert_eq!(err.from, ValueType::String);
        assert_eq!(err.to, ValueType::Double);
        assert_eq!(err.to_string(), "cannot convert STRING value to DOUBLE");
    }

    #[test]
    fn byte_array_rejects_numeric_access() {
        let value = Value::ByteArray(vec![1, 2]);
        assert!(value.as_int().is_err());
        assert!(value.as_bool().is_err());
        assert_eq!(value.as_string(), "[1, 2]");
    }

    #[test]
    fn value_type_parses_case_insensitive() {
        assert_eq!("double".parse::<ValueType>(), Ok(ValueType::Double));
        assert_eq!("byte_array".parse::<ValueType>(), Ok(ValueType::ByteArray));
        assert!("decimal".parse::<ValueType>().is_err());
    }
}
