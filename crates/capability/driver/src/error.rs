//! 驱动错误类型定义

use domain::Flag;

/// 驱动通信错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// 连接错误（连接不可用或中断，需要重连）
    #[error("connection error: {0}")]
    Connection(String),

    /// 地址/参数语法错误
    #[error("argument syntax error: {0}")]
    ArgumentSyntax(String),

    /// 驱动不支持该操作
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// 扫描被中断
    #[error("scan interrupted")]
    ScanInterrupted,

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 协议级错误
    #[error("driver error: {0}")]
    Driver(String),
}

impl DriverError {
    /// 是否需要丢弃当前连接并重连。
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DriverError::Connection(_))
    }

    /// 映射到记录的质量标志。
    pub fn to_flag(&self) -> Flag {
        match self {
            DriverError::Connection(_) => Flag::ConnectionException,
            DriverError::ArgumentSyntax(_) => Flag::DriverError,
            DriverError::UnsupportedOperation(_) => Flag::AccessMethodNotSupported,
            DriverError::ScanInterrupted => Flag::DriverError,
            DriverError::Timeout(_) => Flag::Timeout,
            DriverError::Driver(_) => Flag::DriverError,
        }
    }
}
