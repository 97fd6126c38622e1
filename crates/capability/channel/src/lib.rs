//! 通道能力模块：最新记录缓存、监听器订阅、换算与读写入口。

mod channel;
mod listener;
pub mod scaling;

pub use channel::{Channel, ChannelSettings};
pub use listener::{FnListener, RecordListener, Subscription};

use domain::ValueConversionError;

/// 通道错误。
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("listener error: {0}")]
    Listener(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error(transparent)]
    Conversion(#[from] ValueConversionError),
}
