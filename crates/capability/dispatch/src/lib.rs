//! # 服务映射分发
//!
//! 维护 `channel → [ServerMappingContainer]` 映射表，把通道的每次更新
//! 转发给已绑定的外部服务（Server）。
//!
//! ```text
//! Channel::set_latest_record
//!       │ (RecordListener)
//!       ▼
//! ServerDispatcher ──映射表快照──► Server::record_updated (单服务超时)
//!       ▲
//!       └── apply_configuration：整表替换 + updated_configuration(完整列表)
//! ```

use async_trait::async_trait;
use daq_channel::{ChannelError, RecordListener};
use daq_config::ServerMapping;
use daq_telemetry::TelemetryMetrics;
use domain::Record;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 分发错误。
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("server error: {0}")]
    Server(String),
    #[error("server {0} timed out")]
    Timeout(String),
}

/// 通道与其服务映射。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMappingContainer {
    pub channel_id: String,
    pub server_mapping: ServerMapping,
}

/// 外部服务抽象（REST、socket 等）。
#[async_trait]
pub trait Server: Send + Sync {
    fn id(&self) -> &str;

    /// 配置重载后的完整映射列表（可能为空）。
    async fn updated_configuration(
        &self,
        mappings: Vec<ServerMappingContainer>,
    ) -> Result<(), DispatchError>;

    /// 绑定时的初始映射列表。
    async fn server_mappings(&self, mappings: Vec<ServerMappingContainer>) -> Result<(), DispatchError>;

    async fn record_updated(
        &self,
        container: &ServerMappingContainer,
        record: &Record,
    ) -> Result<(), DispatchError>;
}

type MappingTable = HashMap<String, Vec<ServerMappingContainer>>;

struct DispatchInner {
    servers: RwLock<HashMap<String, Arc<dyn Server>>>,
    mappings: RwLock<Arc<MappingTable>>,
    timeout: Duration,
    metrics: Arc<TelemetryMetrics>,
}

/// 服务映射分发器（克隆共享状态）。
#[derive(Clone)]
pub struct ServerDispatcher {
    inner: Arc<DispatchInner>,
}

impl ServerDispatcher {
    pub fn new(timeout: Duration, metrics: Arc<TelemetryMetrics>) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                servers: RwLock::new(HashMap::new()),
                mappings: RwLock::new(Arc::new(HashMap::new())),
                timeout,
                metrics,
            }),
        }
    }

    fn table(&self) -> Arc<MappingTable> {
        self.inner
            .mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn server(&self, server_id: &str) -> Option<Arc<dyn Server>> {
        self.inner
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
    }

    /// 某服务当前的完整映射列表。
    pub fn mappings_for_server(&self, server_id: &str) -> Vec<ServerMappingContainer> {
        let mut containers: Vec<ServerMappingContainer> = self
            .table()
            .values()
            .flatten()
            .filter(|container| container.server_mapping.server_id == server_id)
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        containers
    }

    /// 绑定服务并立即下发其当前映射。
    pub async fn bind_server(&self, server: Arc<dyn Server>) {
        let server_id = server.id().to_string();
        self.inner
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id.clone(), server.clone());
        let mappings = self.mappings_for_server(&server_id);
        info!(target: "daq.dispatch", server_id = %server_id, mappings = mappings.len(), "server_bound");
        self.call(&server_id, server.server_mappings(mappings)).await;
    }

    pub fn unbind_server(&self, server_id: &str) -> bool {
        let removed = self
            .inner
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id)
            .is_some();
        if removed {
            info!(target: "daq.dispatch", server_id = %server_id, "server_unbound");
        }
        removed
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// 整表替换映射，并向每个已绑定服务下发其完整新列表。
    pub async fn apply_configuration(&self, mappings: Vec<(String, ServerMapping)>) {
        let mut table: MappingTable = HashMap::new();
        for (channel_id, server_mapping) in mappings {
            table
                .entry(channel_id.clone())
                .or_default()
                .push(ServerMappingContainer {
                    channel_id,
                    server_mapping,
                });
        }
        let channels = table.len();
        *self
            .inner
            .mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(table);

        let mut servers: Vec<(String, Arc<dyn Server>)> = self
            .inner
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, server)| (id.clone(), server.clone()))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        info!(target: "daq.dispatch", channels, servers = servers.len(), "server_mappings_applied");
        for (server_id, server) in servers {
            let mappings = self.mappings_for_server(&server_id);
            self.call(&server_id, server.updated_configuration(mappings))
                .await;
        }
    }

    /// 把通道更新转发给所有映射且已绑定的服务；错误只记录。
    pub async fn dispatch(&self, channel_id: &str, record: &Record) {
        let table = self.table();
        let Some(containers) = table.get(channel_id) else {
            return;
        };
        for container in containers {
            let server_id = &container.server_mapping.server_id;
            let Some(server) = self.server(server_id) else {
                debug!(target: "daq.dispatch", server_id = %server_id, channel_id = %channel_id, "server_not_bound");
                continue;
            };
            self.call(server_id, server.record_updated(container, record))
                .await;
        }
    }

    async fn call<F>(&self, server_id: &str, call: F)
    where
        F: Future<Output = Result<(), DispatchError>>,
    {
        let result = match tokio::time::timeout(self.inner.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(server_id.to_string())),
        };
        if let Err(err) = result {
            self.inner.metrics.record_dispatch_failure();
            warn!(target: "daq.dispatch", server_id = %server_id, error = %err, "server_call_failed");
        }
    }
}

#[async_trait]
impl RecordListener for ServerDispatcher {
    async fn new_record(&self, channel_id: &str, record: &Record) -> Result<(), ChannelError> {
        self.dispatch(channel_id, record).await;
        Ok(())
    }
}
