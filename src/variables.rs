/// Measurement kinds a station can report upstream. The PWS update protocol
/// accepts more, but these are the ones we track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeatherVariable {
    BarometricPressure,
    DewPoint,
    OutdoorTemperature,
    OutdoorHumidity,
    WindDirection,
    WindSpeed,
}

/// Kind to query-parameter key, in upload order. The refresh loop walks this
/// table top to bottom, so the outbound field order is fixed.
pub const UPLOAD_FIELDS: [(WeatherVariable, &str); 6] = [
    (WeatherVariable::BarometricPressure, "baromin"),
    (WeatherVariable::DewPoint, "dewptf"),
    (WeatherVariable::OutdoorTemperature, "tempf"),
    (WeatherVariable::OutdoorHumidity, "humidity"),
    (WeatherVariable::WindDirection, "winddir"),
    (WeatherVariable::WindSpeed, "windspeedmph"),
];

impl WeatherVariable {
    /// Sensor id under which stations publish this quantity.
    pub fn sensor_id(self) -> &'static str {
        match self {
            WeatherVariable::BarometricPressure => "barometric_pressure_inhg",
            WeatherVariable::DewPoint => "dew_point_f",
            WeatherVariable::OutdoorTemperature => "outdoor_temp_f",
            WeatherVariable::OutdoorHumidity => "outdoor_humidity_pct",
            WeatherVariable::WindDirection => "wind_direction_deg",
            WeatherVariable::WindSpeed => "wind_speed_mph",
        }
    }

    pub fn from_sensor_id(sensor_id: &str) -> Option<Self> {
        UPLOAD_FIELDS
            .iter()
            .map(|(kind, _)| *kind)
            .find(|kind| kind.sensor_id() == sensor_id)
    }
}
