//! 采集节点：装配驱动、记录器、分发器与调度引擎。
//!
//! Ctrl-C 优雅退出；Unix 下 SIGHUP 重新加载通道配置文件。

use daq_config::{AppConfig, load_file};
use daq_datalog::{DataLoggerRegistry, InMemoryDataLogger, ParserDataLogger};
use daq_dispatch::ServerDispatcher;
use daq_driver::{DriverRegistry, MemoryDriver};
use daq_parser::{JSON_PARSER_ID, ParserRegistry};
use daq_scheduler::{Scheduler, SchedulerSettings};
use daq_telemetry::{TelemetryMetrics, init_tracing};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 内存记录器保留条数（每通道）
const MEMORY_LOG_RETENTION: usize = 10_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing();

    let registry = load_file(&config.config_file)?;
    for rejected in registry.rejected() {
        warn!(target: "daq.node", error = %rejected, "channel_rejected");
    }

    let metrics = Arc::new(TelemetryMetrics::new());
    let mut drivers = DriverRegistry::new();
    if config.demo_driver {
        drivers.register(Arc::new(MemoryDriver::new()));
    }

    let mut loggers = DataLoggerRegistry::new();
    loggers.register(Arc::new(InMemoryDataLogger::new("memory", MEMORY_LOG_RETENTION)));
    if let Some(directory) = &config.log_file {
        let parser = ParserRegistry::with_defaults()
            .get(JSON_PARSER_ID)
            .ok_or("json parser not registered")?;
        loggers.register(Arc::new(ParserDataLogger::new("file", directory, parser)));
    }

    let settings = SchedulerSettings::from_app_config(&config);
    let dispatcher = ServerDispatcher::new(settings.listener_timeout, metrics.clone());
    let scheduler = Scheduler::new(drivers, loggers, dispatcher, metrics.clone(), settings);
    scheduler.start(registry).await?;
    info!(
        target: "daq.node",
        config_file = %config.config_file,
        channels = scheduler.channel_ids().len(),
        "daq_node_started"
    );

    let mut reload = ReloadSignal::new();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(target: "daq.node", error = %err, "ctrl_c_listener_failed");
                }
                break;
            }
            _ = reload.recv() => match load_file(&config.config_file) {
                Ok(registry) => {
                    if let Err(err) = scheduler.reload(registry).await {
                        warn!(target: "daq.node", error = %err, "reload_failed");
                    }
                }
                Err(err) => warn!(target: "daq.node", error = %err, "reload_config_invalid"),
            },
            _ = tokio::time::sleep(Duration::from_secs(60)) => {
                let snapshot = scheduler.metrics();
                info!(
                    target: "daq.node",
                    samples_valid = snapshot.samples_valid,
                    samples_failed = snapshot.samples_failed,
                    ticks_overrun = snapshot.ticks_overrun,
                    records_logged = snapshot.records_logged,
                    "daq_node_metrics"
                );
            }
        }
    }

    info!(target: "daq.node", "daq_node_stopping");
    scheduler.shutdown().await;
    Ok(())
}

/// SIGHUP 触发配置重载；非 Unix 平台永不触发。
struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .map_err(|err| warn!(target: "daq.node", error = %err, "sighup_unavailable"))
                .ok();
            Self { hangup }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(hangup) = self.hangup.as_mut() {
            if hangup.recv().await.is_some() {
                return;
            }
            self.hangup = None;
        }
        std::future::pending::<()>().await
    }
}
