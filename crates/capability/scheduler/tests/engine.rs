use async_trait::async_trait;
use daq_channel::{ChannelError, FnListener, RecordListener};
use daq_config::{ChannelRegistry, load};
use daq_datalog::{DataLoggerRegistry, InMemoryDataLogger};
use daq_dispatch::{DispatchError, Server, ServerDispatcher, ServerMappingContainer};
use daq_driver::{DeviceState, DriverRegistry, MemoryDriver, ScanEvent};
use daq_scheduler::{Scheduler, SchedulerError, SchedulerSettings};
use daq_telemetry::TelemetryMetrics;
use domain::{Flag, Record, Value, now_epoch_ms};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const FULL: &str = r#"{
  "drivers": [
    {
      "id": "memory",
      "connectRetryInterval": "200ms",
      "devices": [
        {
          "id": "dev-1",
          "deviceAddress": "local",
          "channels": [
            { "id": "temp", "channelAddress": "t", "samplingInterval": "100ms",
              "loggingInterval": "200ms", "loggingTimeOffset": "50ms",
              "serverMappings": [ { "id": "modbus", "serverAddress": "40001" } ] },
            { "id": "door", "channelAddress": "d", "valueType": "BOOLEAN",
              "listening": true, "loggingInterval": -1 }
          ]
        }
      ]
    }
  ]
}"#;

const REDUCED: &str = r#"{
  "drivers": [
    {
      "id": "memory",
      "devices": [
        {
          "id": "dev-1",
          "channels": [
            { "id": "temp", "channelAddress": "t", "samplingInterval": "100ms",
              "serverMappings": [ { "id": "modbus", "serverAddress": "40002" } ] }
          ]
        }
      ]
    }
  ]
}"#;

fn registry(raw: &str) -> ChannelRegistry {
    load(raw).expect("load config")
}

struct Harness {
    scheduler: Scheduler,
    driver: MemoryDriver,
    dispatcher: ServerDispatcher,
    metrics: Arc<TelemetryMetrics>,
}

fn harness() -> Harness {
    let driver = MemoryDriver::new();
    driver.set_value("t", Value::Double(3.0));
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(driver.clone()));
    let mut loggers = DataLoggerRegistry::new();
    loggers.register(Arc::new(InMemoryDataLogger::new("memory", 1_000)));
    let metrics = Arc::new(TelemetryMetrics::default());
    let dispatcher = ServerDispatcher::new(Duration::from_secs(1), metrics.clone());
    let scheduler = Scheduler::new(
        drivers,
        loggers,
        dispatcher.clone(),
        metrics.clone(),
        SchedulerSettings::default(),
    );
    Harness {
        scheduler,
        driver,
        dispatcher,
        metrics,
    }
}

type Seen = Arc<Mutex<Vec<(Instant, Record)>>>;

fn recorder() -> (Seen, Arc<dyn RecordListener>) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Arc<dyn RecordListener> = FnListener::new(move |_: &str, record: &Record| {
        sink.lock().expect("lock").push((Instant::now(), record.clone()));
    });
    (seen, listener)
}

async fn wait_connected(scheduler: &Scheduler) {
    for _ in 0..100 {
        if scheduler.device_state("dev-1") == Some(DeviceState::Connected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device never connected");
}

/// 每次通知都耗时的监听器。
struct SlowListener(Duration);

#[async_trait]
impl RecordListener for SlowListener {
    async fn new_record(&self, _channel_id: &str, _record: &Record) -> Result<(), ChannelError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

#[derive(Default)]
struct CountingServer {
    updates: tokio::sync::Mutex<Vec<Vec<ServerMappingContainer>>>,
}

#[async_trait]
impl Server for CountingServer {
    fn id(&self) -> &str {
        "modbus"
    }

    async fn updated_configuration(
        &self,
        mappings: Vec<ServerMappingContainer>,
    ) -> Result<(), DispatchError> {
        self.updates.lock().await.push(mappings);
        Ok(())
    }

    async fn server_mappings(&self, _mappings: Vec<ServerMappingContainer>) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn record_updated(
        &self,
        _container: &ServerMappingContainer,
        _record: &Record,
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn periodic_sampling_updates_listeners() {
    let h = harness();
    h.scheduler.start(registry(REDUCED)).await.expect("start");
    let (seen, listener) = recorder();
    h.scheduler.add_listener("temp", listener).expect("listen");

    tokio::time::sleep(Duration::from_millis(1050)).await;

    let count = seen.lock().expect("lock").len();
    assert!((10..=11).contains(&count), "unexpected notification count {count}");
    let latest = h.scheduler.channel("temp").expect("channel").get_latest_record();
    assert_eq!(latest.flag(), Flag::Valid);
    assert_eq!(latest.value(), Some(&Value::Double(3.0)));
    assert!(h.metrics.snapshot().samples_valid >= 10);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn samples_report_not_connected_until_retry_succeeds() {
    let h = harness();
    h.driver.fail_next_connects(2);
    let started = Instant::now();
    h.scheduler.start(registry(FULL)).await.expect("start");
    let (seen, listener) = recorder();
    h.scheduler.add_listener("temp", listener).expect("listen");

    tokio::time::sleep(Duration::from_millis(800)).await;

    let seen = seen.lock().expect("lock").clone();
    let first_valid = seen
        .iter()
        .position(|(_, record)| record.is_valid())
        .expect("a valid sample");
    assert!(first_valid > 0);
    assert!(
        seen[..first_valid]
            .iter()
            .all(|(_, record)| record.flag() == Flag::DeviceNotConnected)
    );
    assert!(seen[first_valid].0 - started >= Duration::from_millis(400));
    assert_eq!(h.driver.connect_count(), 3);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_reads_drop_overlapping_ticks() {
    let h = harness();
    h.driver.set_io_delay(Duration::from_millis(250));
    h.scheduler.start(registry(REDUCED)).await.expect("start");

    tokio::time::sleep(Duration::from_millis(1000)).await;

    let snapshot = h.metrics.snapshot();
    assert!(snapshot.ticks_overrun > 0);
    assert!(snapshot.samples_valid >= 2);
    assert!(h.driver.read_count() < 10);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn interval_logging_stamps_aligned_ticks() {
    let h = harness();
    h.scheduler.start(registry(FULL)).await.expect("start");

    tokio::time::sleep(Duration::from_millis(1000)).await;

    let records = h
        .scheduler
        .get_logged_records("memory", "temp", 0, i64::MAX)
        .await
        .expect("query");
    assert!(records.len() >= 4);
    assert!(records.iter().all(|record| record.timestamp().rem_euclid(200) == 50));

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn listened_records_are_event_logged() {
    let h = harness();
    h.scheduler.start(registry(FULL)).await.expect("start");
    wait_connected(&h.scheduler).await;
    let (seen, listener) = recorder();
    h.scheduler.add_listener("door", listener).expect("listen");

    h.driver.push("d", Value::Boolean(true)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let seen = seen.lock().expect("lock").clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1.value(), Some(&Value::Boolean(true)));
    let logged = h
        .scheduler
        .get_logged_records("memory", "door", 0, i64::MAX)
        .await
        .expect("query");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].value(), Some(&Value::Boolean(true)));

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reload_keeps_listeners_and_deletes_removed_channels() {
    let h = harness();
    let server = Arc::new(CountingServer::default());
    h.dispatcher.bind_server(server.clone()).await;
    h.scheduler.start(registry(FULL)).await.expect("start");
    let (seen, listener) = recorder();
    let subscription = h.scheduler.add_listener("temp", listener).expect("listen");
    let door = h.scheduler.channel("door").expect("door");

    tokio::time::sleep(Duration::from_millis(300)).await;
    h.scheduler.reload(registry(REDUCED)).await.expect("reload");
    let before = seen.lock().expect("lock").len();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(door.get_latest_record().flag(), Flag::ChannelDeleted);
    assert!(h.scheduler.channel("door").is_none());
    assert_eq!(h.scheduler.channel_ids(), vec!["temp".to_string()]);
    let temp = h.scheduler.channel("temp").expect("temp");
    assert_eq!(temp.listener_count(), 2);
    assert!(seen.lock().expect("lock").len() > before);

    let updates = server.updates.lock().await.clone();
    // 启动与重载各一次
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0][0].server_mapping.server_address, "40001");
    let last = updates.last().expect("reload update");
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].server_mapping.server_address, "40002");

    assert!(h.scheduler.remove_listener(&subscription));
    assert_eq!(temp.listener_count(), 1);
    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn listener_added_while_reload_is_busy_follows_the_new_configuration() {
    let h = harness();
    h.scheduler.start(registry(FULL)).await.expect("start");
    wait_connected(&h.scheduler).await;
    // door 在重载中被删除，慢监听器让删除通知占用 500ms
    h.scheduler
        .add_listener("door", Arc::new(SlowListener(Duration::from_millis(500))))
        .expect("listen door");

    let reload = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.reload(registry(REDUCED)).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (seen, listener) = recorder();
    h.scheduler.add_listener("temp", listener).expect("listen temp");
    reload.await.expect("join").expect("reload");

    let before = seen.lock().expect("lock").len();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let temp = h.scheduler.channel("temp").expect("temp");
    assert_eq!(temp.listener_count(), 2);
    assert!(seen.lock().expect("lock").len() >= before + 5);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_coordinator_coalesces_ticks_without_overlap() {
    let h = harness();
    h.scheduler.start(registry(FULL)).await.expect("start");
    wait_connected(&h.scheduler).await;
    let (seen, listener) = recorder();
    h.scheduler.add_listener("temp", listener).expect("listen");
    tokio::time::sleep(Duration::from_millis(120)).await;

    // 时钟一次跳过多个周期，协调任务醒来时已滞后
    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(450)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = h.metrics.snapshot();
    assert!(snapshot.ticks_coalesced > 0);
    assert_eq!(snapshot.ticks_overrun, 0);

    let seen = seen.lock().expect("lock").clone();
    assert!(seen.len() >= 5);
    assert!(
        seen.windows(2).all(|pair| pair[0].0 < pair[1].0),
        "a burst of catch-up samples was delivered"
    );

    let logged = h
        .scheduler
        .get_logged_records("memory", "temp", 0, i64::MAX)
        .await
        .expect("query");
    assert!(logged.len() >= 3);
    assert!(
        logged
            .windows(2)
            .all(|pair| pair[1].timestamp() - pair[0].timestamp() >= 200)
    );

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_sample_notifies_listeners_exactly_once() {
    let h = harness();
    h.scheduler.start(registry(REDUCED)).await.expect("start");
    wait_connected(&h.scheduler).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    let (seen, listener) = recorder();
    h.scheduler.add_listener("temp", listener).expect("listen");

    h.driver.fail_next_reads(1);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let seen = seen.lock().expect("lock").clone();
    let failed: Vec<&Record> = seen
        .iter()
        .map(|(_, record)| record)
        .filter(|record| record.flag() == Flag::ConnectionException)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].value(), Some(&Value::Double(3.0)));
    assert!(h.metrics.snapshot().samples_failed >= 1);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pending_future_writes_appear_in_logged_records() {
    let h = harness();
    h.scheduler.start(registry(FULL)).await.expect("start");
    wait_connected(&h.scheduler).await;

    let now = now_epoch_ms();
    let soon = Record::valid(Value::Double(5.0), now + 60_000);
    let later = Record::valid(Value::Double(6.0), now + 120_000);
    h.scheduler
        .write_future("temp", vec![later.clone(), soon.clone()])
        .expect("schedule");
    assert!(matches!(
        h.scheduler.write_future("missing", Vec::new()),
        Err(SchedulerError::UnknownChannel(_))
    ));

    let records = h
        .scheduler
        .get_logged_records("memory", "temp", 0, now + 90_000)
        .await
        .expect("query");
    assert_eq!(records.last(), Some(&soon));
    assert!(!records.contains(&later));

    h.scheduler.reload(registry(REDUCED)).await.expect("reload");
    let records = h
        .scheduler
        .get_logged_records("memory", "temp", now + 30_000, i64::MAX)
        .await
        .expect("query");
    assert_eq!(records, vec![soon, later]);

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn api_reports_lifecycle_and_lookup_errors() {
    let h = harness();
    assert!(matches!(
        h.scheduler.read("temp", Duration::from_secs(1)).await,
        Err(SchedulerError::NotRunning)
    ));

    h.scheduler.start(registry(FULL)).await.expect("start");
    assert!(matches!(
        h.scheduler.start(registry(FULL)).await,
        Err(SchedulerError::AlreadyRunning)
    ));
    assert!(matches!(
        h.scheduler.write("missing", None, Duration::from_secs(1)).await,
        Err(SchedulerError::UnknownChannel(_))
    ));
    assert!(matches!(
        h.scheduler.get_logged_records("archive", "temp", 0, 1).await,
        Err(SchedulerError::UnknownLogger(_))
    ));
    assert!(matches!(
        h.scheduler.scan_for_devices("opcua", ""),
        Err(SchedulerError::Driver(_))
    ));

    wait_connected(&h.scheduler).await;
    let flag = h
        .scheduler
        .write("temp", None, Duration::from_secs(1))
        .await
        .expect("write");
    assert_eq!(flag, Flag::CannotWriteNullValue);
    let flag = h
        .scheduler
        .write("temp", Some(Value::Double(7.5)), Duration::from_secs(1))
        .await
        .expect("write");
    assert_eq!(flag, Flag::Valid);
    assert_eq!(h.driver.value("t"), Some(Value::Double(7.5)));

    let record = h
        .scheduler
        .read("temp", Duration::from_secs(1))
        .await
        .expect("read");
    assert_eq!(record.value(), Some(&Value::Double(7.5)));

    let (found, outcome) = h
        .scheduler
        .scan_for_devices("memory", "a, b")
        .expect("scan")
        .collect()
        .await;
    assert_eq!(found.len(), 2);
    assert_eq!(outcome, ScanEvent::Finished);

    let channels = h
        .scheduler
        .scan_for_channels("dev-1", "")
        .await
        .expect("channel scan");
    assert!(!channels.is_empty());

    h.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_sampling() {
    let h = harness();
    h.scheduler.start(registry(REDUCED)).await.expect("start");
    let (seen, listener) = recorder();
    h.scheduler.add_listener("temp", listener).expect("listen");
    tokio::time::sleep(Duration::from_millis(350)).await;

    h.scheduler.shutdown().await;
    h.scheduler.shutdown().await;
    assert!(!h.scheduler.is_running());
    assert!(h.scheduler.channel("temp").is_none());
    assert_eq!(h.scheduler.device_state("dev-1"), None);

    let after = seen.lock().expect("lock").len();
    let reads = h.driver.read_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(seen.lock().expect("lock").len(), after);
    assert_eq!(h.driver.read_count(), reads);
    assert_eq!(h.driver.listener_count(), 0);
}
