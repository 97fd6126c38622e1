//! 时间字符串解析与格式化。
//!
//! 语法：`^(\d+)(ms|s|m|h)?$`，空字符串表示“未配置”；无单位按毫秒。

use regex::Regex;
use std::sync::LazyLock;

static TIME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)(ms|s|m|h)?$").ok());

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;

/// 时间字符串解析错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    #[error("unknown time string: '{0}'")]
    Syntax(String),
    #[error("time value out of range: '{0}'")]
    Overflow(String),
}

/// 时间字符串转毫秒；空字符串返回 `Ok(None)`。
pub fn time_string_to_duration(s: &str) -> Result<Option<i64>, TimeParseError> {
    if s.is_empty() {
        return Ok(None);
    }
    let Some(pattern) = TIME_PATTERN.as_ref() else {
        return Err(TimeParseError::Syntax(s.to_string()));
    };
    let captures = pattern
        .captures(s)
        .ok_or_else(|| TimeParseError::Syntax(s.to_string()))?;
    let number = captures
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse::<i64>()
        .map_err(|_| TimeParseError::Overflow(s.to_string()))?;
    let factor = match captures.get(2).map(|m| m.as_str()) {
        None | Some("ms") => 1,
        Some("s") => MS_PER_SECOND,
        Some("m") => MS_PER_MINUTE,
        Some("h") => MS_PER_HOUR,
        Some(_) => return Err(TimeParseError::Syntax(s.to_string())),
    };
    number
        .checked_mul(factor)
        .map(Some)
        .ok_or_else(|| TimeParseError::Overflow(s.to_string()))
}

/// 毫秒转时间字符串：优先使用能整除的最大单位，`<= 0` 输出 `"0"`。
pub fn duration_to_time_string(ms: i64) -> String {
    if ms <= 0 {
        return "0".to_string();
    }
    if ms % MS_PER_HOUR == 0 {
        return format!("{}h", ms / MS_PER_HOUR);
    }
    if ms % MS_PER_MINUTE == 0 {
        return format!("{}m", ms / MS_PER_MINUTE);
    }
    if ms % MS_PER_SECOND == 0 {
        return format!("{}s", ms / MS_PER_SECOND);
    }
    format!("{}ms", ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_table() {
        let cases = [
            ("99ms", 99),
            ("100", 100),
            ("1s", 1_000),
            ("1m", 60_000),
            ("0h", 0),
            ("5h", 18_000_000),
            ("24h", 86_400_000),
        ];
        for (input, expected) in cases {
            assert_eq!(
                time_string_to_duration(input).expect(input),
                Some(expected),
                "{}",
                input
            );
        }
    }

    #[test]
    fn empty_is_unset() {
        assert_eq!(time_string_to_duration("").expect("empty"), None);
    }

    #[test]
    fn rejects_bad_syntax() {
        for input in ["99w", "1y", "a77", "ms", "-5s", " 1s", "1.5s"] {
            assert!(
                matches!(
                    time_string_to_duration(input),
                    Err(TimeParseError::Syntax(_))
                ),
                "{}",
                input
            );
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(matches!(
            time_string_to_duration("99999999999999999999h"),
            Err(TimeParseError::Overflow(_))
        ));
        assert!(matches!(
            time_string_to_duration("9223372036854775807h"),
            Err(TimeParseError::Overflow(_))
        ));
    }

    #[test]
    fn formats_with_largest_unit() {
        assert_eq!(duration_to_time_string(5), "5ms");
        assert_eq!(duration_to_time_string(59_000), "59s");
        assert_eq!(duration_to_time_string(59_001), "59001ms");
        assert_eq!(duration_to_time_string(0), "0");
        assert_eq!(duration_to_time_string(-20), "0");
        assert_eq!(duration_to_time_string(3_600_000), "1h");
        assert_eq!(duration_to_time_string(86_400_000), "24h");
        assert_eq!(duration_to_time_string(120_000), "2m");
    }

    #[test]
    fn parse_format_parse_is_stable() {
        for input in ["99ms", "100", "1s", "60s", "90m", "0h", "5h", "3600000", "1001"] {
            let first = time_string_to_duration(input).expect("parse");
            let formatted = duration_to_time_string(first.unwrap_or_default());
            let second = time_string_to_duration(&formatted).expect("reparse");
            assert_eq!(first, second, "{} -> {}", input, formatted);
        }
    }
}
