//! 数据质量标志。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 每条记录恰好携带一个质量标志。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Flag {
    Valid,
    Timeout,
    UnknownError,
    DeviceOrInterfaceBusy,
    AccessMethodNotSupported,
    NoValueReceivedYet,
    Connecting,
    WaitingForConnectionRetry,
    Disconnecting,
    DriverUnavailable,
    SamplingAndListeningDisabled,
    Disabled,
    ChannelDeleted,
    StartedLateAndTimedOut,
    DriverThrewUnknownException,
    DeviceNotConnected,
    DriverError,
    ValueNotAvailable,
    CannotWriteNullValue,
    ConnectionException,
}

const FLAGS: &[(Flag, u8, &str)] = &[
    (Flag::Valid, 1, "VALID"),
    (Flag::Timeout, 2, "TIMEOUT"),
    (Flag::UnknownError, 3, "UNKNOWN_ERROR"),
    (Flag::DeviceOrInterfaceBusy, 5, "DEVICE_OR_INTERFACE_BUSY"),
    (Flag::AccessMethodNotSupported, 6, "ACCESS_METHOD_NOT_SUPPORTED"),
    (Flag::NoValueReceivedYet, 7, "NO_VALUE_RECEIVED_YET"),
    (Flag::Connecting, 8, "CONNECTING"),
    (Flag::WaitingForConnectionRetry, 9, "WAITING_FOR_CONNECTION_RETRY"),
    (Flag::Disconnecting, 10, "DISCONNECTING"),
    (Flag::DriverUnavailable, 11, "DRIVER_UNAVAILABLE"),
    (Flag::SamplingAndListeningDisabled, 12, "SAMPLING_AND_LISTENING_DISABLED"),
    (Flag::Disabled, 13, "DISABLED"),
    (Flag::ChannelDeleted, 14, "CHANNEL_DELETED"),
    (Flag::StartedLateAndTimedOut, 15, "STARTED_LATE_AND_TIMED_OUT"),
    (Flag::DriverThrewUnknownException, 16, "DRIVER_THREW_UNKNOWN_EXCEPTION"),
    (Flag::DeviceNotConnected, 17, "DEVICE_NOT_CONNECTED"),
    (Flag::DriverError, 18, "DRIVER_ERROR"),
    (Flag::ValueNotAvailable, 19, "VALUE_NOT_AVAILABLE"),
    (Flag::CannotWriteNullValue, 27, "CANNOT_WRITE_NULL_VALUE"),
    (Flag::ConnectionException, 29, "CONNECTION_EXCEPTION"),
];

impl Flag {
    /// 稳定的数字编码（用于持久化与外部协议）。
    pub fn code(&self) -> u8 {
        FLAGS
            .iter()
            .find(|(flag, _, _)| flag == self)
            .map(|(_, code, _)| *code)
            .unwrap_or(0)
    }

    pub fn from_code(code: u8) -> Option<Flag> {
        FLAGS
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(flag, _, _)| *flag)
    }

    pub fn as_str(&self) -> &'static str {
        FLAGS
            .iter()
            .find(|(flag, _, _)| flag == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("UNKNOWN_ERROR")
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Flag::Valid)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FLAGS
            .iter()
            .find(|(_, _, name)| name.eq_ignore_ascii_case(s.trim()))
            .map(|(flag, _, _)| *flag)
            .ok_or_else(|| format!("unknown flag: {}", s))
    }
}
