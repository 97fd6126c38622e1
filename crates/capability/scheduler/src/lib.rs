//! 调度能力模块
//!
//! ```text
//!            ┌──────────── coordinator (单任务) ────────────┐
//!            │ sampling wheel            logging wheel      │
//!            └─────┬──────────────────────────┬─────────────┘
//!                  │ 每单元至多一个在途操作    │
//!        DevicePool::read ──► Channel ──► listeners / dispatcher
//!                                          │
//!                                          └──► DataLogger (周期/事件)
//! ```
//!
//! 节拍对齐到 `k * interval + offset`；滞后超过一个周期时跳到下一个未来边界，
//! 在途操作未结束时到来的节拍被丢弃并计入 `ticks_overrun`。

mod engine;
mod timing;
mod units;

pub use engine::{Scheduler, SchedulerSettings};
pub use timing::{Clock, first_fire, next_fire};

use daq_datalog::DataLoggerError;
use daq_driver::DriverError;

/// 引擎 API 错误。
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    NotRunning,
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("unknown data logger: {0}")]
    UnknownLogger(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    DataLogger(#[from] DataLoggerError),
}
