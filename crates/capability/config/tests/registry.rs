use daq_config::{
    ConfigError, DEFAULT_CONNECT_RETRY_INTERVAL_MS, DEFAULT_VALUE_TYPE_LENGTH, load,
};
use domain::ValueType;

const CONFIG: &str = r#"{
  "drivers": [
    {
      "id": "modbus",
      "samplingTimeout": "500ms",
      "devices": [
        {
          "id": "meter-1",
          "deviceAddress": "10.0.0.2:502",
          "connectRetryInterval": "2s",
          "channels": [
            { "id": "power", "channelAddress": "holding:100", "samplingInterval": "1s",
              "samplingTimeOffset": "100", "loggingInterval": "1m", "scalingFactor": 0.1,
              "serverMappings": [ { "id": "rest", "serverAddress": "power" } ] },
            { "id": "name", "valueType": "string", "listening": true },
            { "id": "power", "samplingInterval": "2s" },
            { "id": "bad interval", "samplingInterval": "2w" },
            { "id": "both", "listening": true, "samplingInterval": 100 },
            { "id": "negative", "samplingTimeOffset": -5 }
          ]
        },
        {
          "id": "meter-2",
          "disabled": true,
          "samplingTimeout": 0,
          "channels": [ { "id": "energy", "valueType": "LONG", "samplingInterval": "5s" } ]
        }
      ]
    }
  ]
}"#;

#[test]
fn registry_applies_defaults_and_inheritance() {
    let registry = load(CONFIG).expect("load");
    assert_eq!(registry.drivers().len(), 1);
    assert_eq!(
        registry.drivers()[0].connect_retry_interval_ms,
        DEFAULT_CONNECT_RETRY_INTERVAL_MS
    );

    let meter_1 = registry.device("meter-1").expect("meter-1");
    assert_eq!(meter_1.sampling_timeout_ms, 500);
    assert_eq!(meter_1.connect_retry_interval_ms, 2_000);
    let meter_2 = registry.device("meter-2").expect("meter-2");
    assert_eq!(meter_2.sampling_timeout_ms, 0);
    assert!(meter_2.sampling_timeout().is_none());

    let power = registry.channel("power").expect("power");
    assert_eq!(power.value_type, ValueType::Double);
    assert_eq!(power.sampling_interval_ms, Some(1_000));
    assert_eq!(power.sampling_time_offset_ms, 100);
    assert_eq!(power.logging_interval_ms, Some(60_000));
    assert_eq!(power.scaling_factor, Some(0.1));
    assert_eq!(power.driver_id, "modbus");
    assert!(power.is_sampling());

    let name = registry.channel("name").expect("name");
    assert_eq!(name.value_type, ValueType::String);
    assert_eq!(name.value_type_length, Some(DEFAULT_VALUE_TYPE_LENGTH));
    assert!(name.is_listening());

    let energy = registry.channel("energy").expect("energy");
    assert!(energy.disabled);
    assert!(!energy.is_sampling());

    assert_eq!(registry.channels_of_device("meter-1").count(), 2);
    let mappings = registry.server_mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].0, "power");
    assert_eq!(mappings[0].1.server_id, "rest");
}

#[test]
fn bad_channels_are_excluded_not_fatal() {
    let registry = load(CONFIG).expect("load");
    assert_eq!(registry.channels().len(), 3);
    assert!(registry.channel("both").is_none());
    assert!(registry.channel("negative").is_none());

    let rejected = registry.rejected();
    assert_eq!(rejected.len(), 4);
    assert!(rejected.iter().any(|err| matches!(
        err,
        ConfigError::DuplicateId { kind: "channel", id } if id == "power"
    )));
    assert!(rejected.iter().any(|err| matches!(
        err,
        ConfigError::Field { field: "listening", id, .. } if id == "both"
    )));
    assert!(rejected.iter().any(|err| matches!(
        err,
        ConfigError::Field { field: "samplingTimeOffset", id, .. } if id == "negative"
    )));
    assert!(rejected.iter().any(|err| matches!(
        err,
        ConfigError::Field { kind: "channel", field: "id", .. }
    )));
}

#[test]
fn duplicate_device_fails_whole_load() {
    let raw = r#"{ "drivers": [ { "id": "d", "devices": [ { "id": "x" }, { "id": "x" } ] } ] }"#;
    let err = load(raw).expect_err("duplicate");
    assert_eq!(err.to_string(), "duplicate device id: x");
}

#[test]
fn negative_device_timeout_fails_load() {
    let raw = r#"{ "drivers": [ { "id": "d", "devices": [ { "id": "x", "samplingTimeout": -1 } ] } ] }"#;
    let err = load(raw).expect_err("negative");
    assert!(matches!(
        err,
        ConfigError::Field { kind: "device", field: "samplingTimeout", .. }
    ));
}

#[test]
fn malformed_json_is_parse_error() {
    assert!(matches!(load("{ drivers"), Err(ConfigError::Parse(_))));
}
