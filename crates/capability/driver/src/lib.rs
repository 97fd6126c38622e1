//! # 驱动能力模块
//!
//! 定义协议驱动的接口契约（Driver SPI），并提供设备连接池：
//! - **Driver / Connection**：连接、批量读、写、监听、扫描
//! - **DevicePool**：每设备一个连接，失败按 `connectRetryInterval` 重试
//! - **MemoryDriver**：进程内驱动，用于演示与测试
//!
//! ## 架构设计
//!
//! ```text
//! DriverRegistry (driver id → Driver)
//!       │
//!       ▼
//! DevicePool ──supervise──► Driver::connect ──► Box<dyn Connection>
//!       │                                          │
//!       ├── read / write (samplingTimeout)         │
//!       └── listening ◄── RecordsListener ◄────────┘
//!       │
//!       ▼
//! DeviceEventHandler (调度引擎)
//! ```

mod error;
mod memory;
mod pool;
mod registry;
mod scan;
mod spi;

pub use error::DriverError;
pub use memory::{MEMORY_DRIVER_ID, MemoryDriver};
pub use pool::{DeviceEventHandler, DevicePool, DeviceState, NoopDeviceEventHandler, PoolConfig};
pub use registry::DriverRegistry;
pub use scan::{DeviceScan, ScanEvent, ScanProgress};
pub use spi::{
    ChannelRecordContainer, ChannelScanInfo, ChannelValueContainer, Connection, DeviceScanInfo,
    Driver, DriverInfo, RecordsListener,
};
