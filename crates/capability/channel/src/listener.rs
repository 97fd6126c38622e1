use crate::ChannelError;
use async_trait::async_trait;
use domain::Record;
use std::sync::Arc;

/// 通道记录监听器。
#[async_trait]
pub trait RecordListener: Send + Sync {
    async fn new_record(&self, channel_id: &str, record: &Record) -> Result<(), ChannelError>;
}

/// 同步闭包监听器。
pub struct FnListener<F> {
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&str, &Record) + Send + Sync,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F> RecordListener for FnListener<F>
where
    F: Fn(&str, &Record) + Send + Sync,
{
    async fn new_record(&self, channel_id: &str, record: &Record) -> Result<(), ChannelError> {
        (self.f)(channel_id, record);
        Ok(())
    }
}

/// 订阅句柄；用于显式取消订阅。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    channel_id: String,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(channel_id: &str, id: u64) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            id,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}
