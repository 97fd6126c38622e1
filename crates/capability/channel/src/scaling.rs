//! 线性换算：`v * scalingFactor + valueOffset`。

use daq_config::ChannelConfig;
use domain::{Flag, Record, Value, ValueConversionError};

fn is_scaled(config: &ChannelConfig) -> bool {
    config.scaling_factor.is_some() || config.value_offset.is_some()
}

/// 驱动原始值 → 通道值（换算后按通道类型强制转换）。
pub fn scale_value(config: &ChannelConfig, raw: &Value) -> Result<Value, ValueConversionError> {
    if !is_scaled(config) || !raw.is_numeric() {
        return raw.convert_to(config.value_type);
    }
    let factor = config.scaling_factor.unwrap_or(1.0);
    let offset = config.value_offset.unwrap_or(0.0);
    Value::Double(raw.as_double()? * factor + offset).convert_to(config.value_type)
}

/// 通道值 → 驱动写入值；换算系数为 0 时无法反算。
pub fn unscale_value(config: &ChannelConfig, value: &Value) -> Option<Result<Value, ValueConversionError>> {
    if !is_scaled(config) || !value.is_numeric() {
        return Some(value.convert_to(config.value_type));
    }
    let factor = config.scaling_factor.unwrap_or(1.0);
    if factor == 0.0 {
        return None;
    }
    let offset = config.value_offset.unwrap_or(0.0);
    let raw = match value.as_double() {
        Ok(v) => (v - offset) / factor,
        Err(err) => return Some(Err(err)),
    };
    Some(Value::Double(raw).convert_to(config.value_type))
}

/// 驱动记录 → 通道记录。
///
/// 非 VALID 记录保留上一次的值（陈旧值），带新的标志和时间戳。
pub fn apply(config: &ChannelConfig, record: Record, previous: Option<&Value>) -> Record {
    let timestamp = record.timestamp();
    match (record.flag(), record.value()) {
        (Flag::Valid, Some(raw)) => match scale_value(config, raw) {
            Ok(value) => Record::valid(value, timestamp),
            Err(_) => Record::new(previous.cloned(), timestamp, Flag::DriverError),
        },
        (flag, _) => Record::new(previous.cloned(), timestamp, flag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ValueType;

    fn config(factor: Option<f64>, offset: Option<f64>, value_type: ValueType) -> ChannelConfig {
        let mut config = ChannelConfig::new("ch", "dev", "drv");
        config.scaling_factor = factor;
        config.value_offset = offset;
        config.value_type = value_type;
        config
    }

    #[test]
    fn valid_record_is_scaled_and_coerced() {
        let config = config(Some(0.1), Some(-2.0), ValueType::Double);
        let record = apply(&config, Record::valid(Value::Integer(500), 10), None);
        assert_eq!(record.flag(), Flag::Valid);
        assert_eq!(record.value(), Some(&Value::Double(48.0)));

        let config = self::config(Some(2.0), None, ValueType::Integer);
        let record = apply(&config, Record::valid(Value::Double(1.3), 10), None);
        assert_eq!(record.value(), Some(&Value::Integer(2)));
    }

    #[test]
    fn error_record_keeps_stale_value() {
        let config = config(None, None, ValueType::Double);
        let record = apply(
            &config,
            Record::with_flag(Flag::Timeout, 20),
            Some(&Value::Double(3.0)),
        );
        assert_eq!(record.flag(), Flag::Timeout);
        assert_eq!(record.timestamp(), 20);
        assert_eq!(record.value(), Some(&Value::Double(3.0)));
    }

    #[test]
    fn unconvertible_value_becomes_driver_error() {
        let config = config(None, None, ValueType::Double);
        let record = apply(&config, Record::valid(Value::from("n/a"), 30), None);
        assert_eq!(record.flag(), Flag::DriverError);
        assert!(record.value().is_none());
    }

    #[test]
    fn write_value_is_unscaled() {
        let config = config(Some(0.5), Some(10.0), ValueType::Long);
        let raw = unscale_value(&config, &Value::Double(20.0))
            .expect("invertible")
            .expect("convertible");
        assert_eq!(raw, Value::Long(20));
        assert_eq!(scale_value(&config, &raw), Ok(Value::Long(20)));

        let config = self::config(Some(0.0), None, ValueType::Double);
        assert!(unscale_value(&config, &Value::Double(1.0)).is_none());
    }
}
