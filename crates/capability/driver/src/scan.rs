//! 设备扫描：进度事件流 + 取消。
//!
//! 取消后不再转发新的发现结果，已送出的事件保持有效。

use crate::spi::DeviceScanInfo;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 扫描事件。
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// 进度百分比（0-100）
    Progress(u8),
    DeviceFound(DeviceScanInfo),
    Finished,
    Cancelled,
    Failed(String),
}

impl ScanEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanEvent::Finished | ScanEvent::Cancelled | ScanEvent::Failed(_)
        )
    }
}

/// 驱动侧进度上报句柄。
#[derive(Debug, Clone)]
pub struct ScanProgress {
    tx: mpsc::UnboundedSender<ScanEvent>,
    cancel: CancellationToken,
}

impl ScanProgress {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ScanEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    pub fn progress(&self, percent: u8) {
        if !self.cancel.is_cancelled() {
            let _ = self.tx.send(ScanEvent::Progress(percent.min(100)));
        }
    }

    /// 上报发现的设备；已取消时返回 false。
    pub fn device_found(&self, info: DeviceScanInfo) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(ScanEvent::DeviceFound(info)).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 调用方持有的扫描句柄。
#[derive(Debug)]
pub struct DeviceScan {
    pub id: uuid::Uuid,
    events: mpsc::UnboundedReceiver<ScanEvent>,
    cancel: CancellationToken,
}

impl DeviceScan {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<ScanEvent>, cancel: CancellationToken) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            events,
            cancel,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 下一个事件；扫描任务结束后返回 None。
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// 收集事件直到终止事件。
    pub async fn collect(mut self) -> (Vec<DeviceScanInfo>, ScanEvent) {
        let mut devices = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                ScanEvent::DeviceFound(info) => devices.push(info),
                ScanEvent::Progress(_) => {}
                terminal => return (devices, terminal),
            }
        }
        (devices, ScanEvent::Cancelled)
    }
}
