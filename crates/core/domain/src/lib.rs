//! 采集核心领域模型：值、记录与质量标志。

pub mod flag;
pub mod record;
pub mod value;

pub use flag::Flag;
pub use record::{Record, now_epoch_ms};
pub use value::{Value, ValueConversionError, ValueType};
