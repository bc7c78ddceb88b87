use crate::config::Config;
use crate::registry::{Reading, StationRegistry};
use crate::variables::WeatherVariable;
use anyhow::Result;
use chrono::{TimeZone, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Telemetry payload as stations publish it. Forwarders add more fields
/// (seq, quality, ...); only these two matter here.
#[derive(Debug, Deserialize)]
struct TelemetrySample {
    #[serde(default)]
    timestamp: Option<i64>,
    value: JsonValue,
}

/// Subscribes to all station telemetry under the configured prefix and keeps
/// the registry current. Reconnects forever until cancelled.
pub async fn run_mqtt_ingest(
    config: Config,
    registry: Arc<StationRegistry>,
    cancel: CancellationToken,
) -> Result<()> {
    let topic_filter = format!("{}/+/+/telemetry", config.mqtt_topic_prefix);

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut options = mqtt_options(&config);
        options.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(options, 256);

        if let Err(err) = client
            .subscribe(topic_filter.clone(), QoS::AtLeastOnce)
            .await
        {
            tracing::warn!(error=%err, "failed to subscribe to telemetry topics; retrying");
            sleep(Duration::from_secs(2)).await;
            continue;
        }

        tracing::info!(filter = %topic_filter, "MQTT connected; tracking station telemetry");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        handle_publish(&config.mqtt_topic_prefix, &registry, &publish);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error=%err, "MQTT connection lost; reconnecting");
                        break;
                    }
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

fn handle_publish(prefix: &str, registry: &StationRegistry, publish: &Publish) {
    let Some((station_id, sensor_id)) = parse_telemetry_topic(prefix, &publish.topic) else {
        return;
    };
    let Some(kind) = WeatherVariable::from_sensor_id(sensor_id) else {
        tracing::trace!(sensor = sensor_id, "ignoring untracked sensor");
        return;
    };
    let sample: TelemetrySample = match serde_json::from_slice(&publish.payload) {
        Ok(sample) => sample,
        Err(err) => {
            tracing::debug!(topic = %publish.topic, error = %err, "undecodable telemetry payload");
            return;
        }
    };
    let Some(value) = render_value(&sample.value) else {
        tracing::debug!(topic = %publish.topic, "telemetry payload carries no usable value");
        return;
    };
    let updated_at = sample
        .timestamp
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    registry.record(station_id, kind, Reading { value, updated_at });
    tracing::trace!(station = station_id, sensor = sensor_id, "reading recorded");
}

fn parse_telemetry_topic<'a>(prefix: &str, topic: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let station_id = parts.next()?;
    let sensor_id = parts.next()?;
    match (parts.next(), parts.next()) {
        (Some("telemetry"), None) if !station_id.is_empty() && !sensor_id.is_empty() => {
            Some((station_id, sensor_id))
        }
        _ => None,
    }
}

/// Stations report numbers; strings and bools show up from hand-rolled
/// firmware. Anything else is dropped.
fn render_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn publish(topic: &str, payload: &str) -> Publish {
        Publish::new(topic, QoS::AtLeastOnce, payload.as_bytes().to_vec())
    }

    #[test]
    fn telemetry_topic_parses_station_and_sensor() {
        assert_eq!(
            parse_telemetry_topic("iot", "iot/ws1/outdoor_temp_f/telemetry"),
            Some(("ws1", "outdoor_temp_f"))
        );
        assert_eq!(parse_telemetry_topic("iot", "iot/ws1/outdoor_temp_f/ack"), None);
        assert_eq!(parse_telemetry_topic("iot", "iot/ws1/telemetry"), None);
        assert_eq!(
            parse_telemetry_topic("iot", "iot/ws1/a/b/telemetry"),
            None
        );
        assert_eq!(parse_telemetry_topic("farm", "iot/ws1/outdoor_temp_f/telemetry"), None);
    }

    #[test]
    fn values_render_as_strings() {
        assert_eq!(render_value(&json!(72.5)), Some("72.5".to_string()));
        assert_eq!(render_value(&json!(5)), Some("5".to_string()));
        assert_eq!(render_value(&json!(" NNE ")), Some("NNE".to_string()));
        assert_eq!(render_value(&json!(true)), Some("true".to_string()));
        assert_eq!(render_value(&json!("")), None);
        assert_eq!(render_value(&json!(null)), None);
        assert_eq!(render_value(&json!({"nested": 1})), None);
    }

    #[test]
    fn publish_records_reading_with_timestamp() {
        let registry = StationRegistry::new();
        handle_publish(
            "iot",
            &registry,
            &publish(
                "iot/ws1/outdoor_temp_f/telemetry",
                r#"{"timestamp":1000,"value":72.5,"quality":0,"seq":7}"#,
            ),
        );

        let reading = registry
            .reading("ws1", WeatherVariable::OutdoorTemperature)
            .unwrap();
        assert_eq!(reading.value, "72.5");
        assert_eq!(reading.updated_at, Utc.timestamp_millis_opt(1000).single());
    }

    #[test]
    fn publish_without_timestamp_leaves_it_unset() {
        let registry = StationRegistry::new();
        handle_publish(
            "iot",
            &registry,
            &publish("iot/ws1/wind_direction_deg/telemetry", r#"{"value":"270"}"#),
        );

        let reading = registry
            .reading("ws1", WeatherVariable::WindDirection)
            .unwrap();
        assert_eq!(reading.value, "270");
        assert_eq!(reading.updated_at, None);
    }

    #[test]
    fn untracked_sensors_and_bad_payloads_are_ignored() {
        let registry = StationRegistry::new();
        handle_publish(
            "iot",
            &registry,
            &publish("iot/ws1/soil_moisture_pct/telemetry", r#"{"value":1}"#),
        );
        handle_publish(
            "iot",
            &registry,
            &publish("iot/ws1/outdoor_temp_f/telemetry", "not json"),
        );
        handle_publish(
            "iot",
            &registry,
            &publish("iot/ws1/outdoor_temp_f/telemetry", r#"{"value":null}"#),
        );

        assert!(registry
            .reading("ws1", WeatherVariable::OutdoorTemperature)
            .is_none());
    }
}
