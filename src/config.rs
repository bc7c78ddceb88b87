use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_UPDATE_URL: &str =
    "http://weatherstation.wunderground.com/weatherstation/updateweatherstation.php";

#[derive(Debug, Clone)]
pub struct Config {
    pub station_id: Option<String>,
    pub pws_id: Option<String>,
    pub pws_password: Option<String>,

    pub update_url: String,
    pub refresh_interval: Duration,
    pub http_timeout: Duration,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,

    pub http_bind: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let station_id = env_optional("PWS_UPLINK_STATION_ID");
        let pws_id = env_optional("PWS_UPLINK_PWS_ID");
        let pws_password = env_optional("PWS_UPLINK_PWS_PASSWORD");

        // Query parameters are appended at dispatch time, so the base URL must
        // not carry any of its own.
        let update_url =
            env_string("PWS_UPLINK_UPDATE_URL", Some(DEFAULT_UPDATE_URL.to_string()))?;
        let parsed = Url::parse(&update_url).context("invalid PWS_UPLINK_UPDATE_URL")?;
        if parsed.query().is_some() {
            return Err(anyhow!("PWS_UPLINK_UPDATE_URL must not contain a query string"));
        }

        let refresh_interval =
            Duration::from_secs(env_u64("PWS_UPLINK_REFRESH_SECONDS", Some(300))?);
        let http_timeout =
            Duration::from_secs(env_u64("PWS_UPLINK_HTTP_TIMEOUT_SECONDS", Some(20))?);

        let mqtt_url =
            env_string("PWS_UPLINK_MQTT_URL", Some("mqtt://127.0.0.1:1883".to_string()))?;
        let mqtt_username = env_optional("PWS_UPLINK_MQTT_USERNAME");
        let mqtt_password = env_optional("PWS_UPLINK_MQTT_PASSWORD");

        let url = Url::parse(&mqtt_url).context("invalid PWS_UPLINK_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("PWS_UPLINK_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);

        let mqtt_topic_prefix = env_string("PWS_UPLINK_MQTT_TOPIC_PREFIX", Some("iot".to_string()))?;
        let mqtt_client_id = env_string("PWS_UPLINK_MQTT_CLIENT_ID", Some("pws-uplink".to_string()))?;

        let http_bind = env_string("PWS_UPLINK_HTTP_BIND", Some("127.0.0.1:9102".to_string()))?;

        Ok(Self {
            station_id,
            pws_id,
            pws_password,
            update_url,
            refresh_interval,
            http_timeout,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_client_id,
            http_bind,
        })
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
