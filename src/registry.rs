use crate::variables::WeatherVariable;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// One observed measurement. `updated_at` is whatever timestamp the station
/// reported; a station that reports none leaves it unset.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Latest reading per (station, kind). The MQTT ingest writes every station it
/// hears; the uploader queries only the configured one.
#[derive(Debug, Default)]
pub struct StationRegistry {
    stations: RwLock<HashMap<String, HashMap<WeatherVariable, Reading>>>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, station_id: &str, kind: WeatherVariable, reading: Reading) {
        if let Ok(mut stations) = self.stations.write() {
            stations
                .entry(station_id.to_string())
                .or_default()
                .insert(kind, reading);
        }
    }

    pub fn reading(&self, station_id: &str, kind: WeatherVariable) -> Option<Reading> {
        match self.stations.read() {
            Ok(stations) => stations
                .get(station_id)
                .and_then(|vars| vars.get(&kind))
                .cloned(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(value: &str, updated_ms: Option<i64>) -> Reading {
        Reading {
            value: value.to_string(),
            updated_at: updated_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        }
    }

    #[test]
    fn record_overwrites_previous_reading() {
        let registry = StationRegistry::new();
        registry.record("ws1", WeatherVariable::OutdoorTemperature, reading("72.5", Some(1_000)));
        registry.record("ws1", WeatherVariable::OutdoorTemperature, reading("74.5", Some(2_000)));

        let current = registry
            .reading("ws1", WeatherVariable::OutdoorTemperature)
            .unwrap();
        assert_eq!(current.value, "74.5");
        assert_eq!(current.updated_at, Utc.timestamp_millis_opt(2_000).single());
    }

    #[test]
    fn stations_are_isolated() {
        let registry = StationRegistry::new();
        registry.record("ws1", WeatherVariable::WindSpeed, reading("10", Some(1_000)));

        assert!(registry.reading("ws1", WeatherVariable::WindSpeed).is_some());
        assert!(registry.reading("ws2", WeatherVariable::WindSpeed).is_none());
    }

    #[test]
    fn missing_kind_has_no_reading() {
        let registry = StationRegistry::new();
        registry.record("ws1", WeatherVariable::WindSpeed, reading("10", None));

        assert!(registry.reading("ws1", WeatherVariable::DewPoint).is_none());
    }
}
