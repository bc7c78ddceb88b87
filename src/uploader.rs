use crate::config::Config;
use crate::dispatch::{DispatchChannel, DispatchOutcome};
use crate::registry::StationRegistry;
use crate::variables::{WeatherVariable, UPLOAD_FIELDS};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Readings older than this at tick time are never uploaded.
const READING_EXPIRE_MS: i64 = 600_000;

/// The PWS endpoint answers an accepted update with a body starting here.
const SUCCESS_BODY_PREFIX: &str = "success";

#[derive(Debug, Clone, Default)]
pub struct UploadSettings {
    pub station_id: Option<String>,
    pub pws_id: Option<String>,
    pub pws_password: Option<String>,
}

impl UploadSettings {
    /// Trims all three values; empty-after-trim counts as absent.
    fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            station_id: clean(self.station_id),
            pws_id: clean(self.pws_id),
            pws_password: clean(self.pws_password),
        }
    }

    fn complete(&self) -> Option<(&str, &str, &str)> {
        match (&self.station_id, &self.pws_id, &self.pws_password) {
            (Some(station), Some(id), Some(password)) => {
                Some((station.as_str(), id.as_str(), password.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkStatus {
    Running,
    NotConfigured,
}

impl UplinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UplinkStatus::Running => "running",
            UplinkStatus::NotConfigured => "not configured",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UplinkStatusReport {
    pub status: String,
    pub station_id: Option<String>,
    pub pws_id: Option<String>,
    pub in_flight: bool,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_sent: BTreeMap<String, DateTime<Utc>>,
}

/// The upload engine. All state lives here and is only touched by the task
/// inside `run_uploader`, so ticks, outcomes, and configuration changes are
/// serialized by construction.
pub struct Uploader {
    update_url: String,
    settings: UploadSettings,
    last_sent: HashMap<WeatherVariable, DateTime<Utc>>,
    in_flight: bool,
    last_dispatch_at: Option<DateTime<Utc>>,
    last_outcome: Option<String>,
    registry: Arc<StationRegistry>,
    channel: Arc<dyn DispatchChannel>,
}

impl Uploader {
    pub fn new(
        update_url: String,
        settings: UploadSettings,
        registry: Arc<StationRegistry>,
        channel: Arc<dyn DispatchChannel>,
    ) -> Self {
        Self {
            update_url,
            settings: settings.normalized(),
            last_sent: HashMap::new(),
            in_flight: false,
            last_dispatch_at: None,
            last_outcome: None,
            registry,
            channel,
        }
    }

    pub fn status(&self) -> UplinkStatus {
        if self.settings.complete().is_some() {
            UplinkStatus::Running
        } else {
            UplinkStatus::NotConfigured
        }
    }

    /// Replaces the three configurable values. Dedup bookkeeping and any
    /// outstanding request survive a reconfiguration.
    pub fn apply_settings(&mut self, settings: UploadSettings) {
        self.settings = settings.normalized();
        tracing::info!(status = self.status().as_str(), "uplink configuration applied");
    }

    /// One scheduling tick: picks every reading that is present, not stale,
    /// and newer than whatever was last uploaded for its kind, then sends
    /// them all in a single GET. At most one request is outstanding; while
    /// one is, ticks do nothing at all.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if self.in_flight {
            tracing::debug!("update still in flight; skipping tick");
            return;
        }
        let Some((station_id, pws_id, pws_password)) = self.settings.complete() else {
            tracing::trace!("uplink not configured; skipping tick");
            return;
        };

        let mut url = format!(
            "{}?ID={}&PASSWORD={}&dateutc=now",
            self.update_url,
            pws_id,
            encode(pws_password)
        );
        let mut fields = 0usize;

        for (kind, key) in UPLOAD_FIELDS {
            let Some(reading) = self.registry.reading(station_id, kind) else {
                continue;
            };
            // A reading without a timestamp is treated as always new: it
            // bypasses the stale check and is never recorded in last_sent.
            if let Some(updated_at) = reading.updated_at {
                let age_ms = now.signed_duration_since(updated_at).num_milliseconds();
                if age_ms >= READING_EXPIRE_MS {
                    tracing::warn!(
                        sensor = kind.sensor_id(),
                        age_ms,
                        "stale reading excluded from upload"
                    );
                    continue;
                }
                if let Some(sent_at) = self.last_sent.get(&kind) {
                    if updated_at <= *sent_at {
                        tracing::debug!(sensor = kind.sensor_id(), "reading already uploaded");
                        continue;
                    }
                }
                self.last_sent.insert(kind, updated_at);
            }
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&encode(&reading.value));
            fields += 1;
        }

        if fields == 0 {
            tracing::debug!("no fresh readings; nothing to upload");
            return;
        }

        let url = match Url::parse(&url) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(error = %err, "assembled update URL is invalid; dropping tick");
                return;
            }
        };

        tracing::debug!(fields, "dispatching PWS update");
        self.channel.dispatch(url);
        self.in_flight = true;
        self.last_dispatch_at = Some(now);
    }

    /// Consumes the single outcome of a dispatched request. The gate reopens
    /// before the outcome is inspected, whatever it says.
    pub fn handle_outcome(&mut self, outcome: DispatchOutcome) {
        self.in_flight = false;
        match outcome {
            DispatchOutcome::Response { status, body }
                if status == 200 && body.starts_with(SUCCESS_BODY_PREFIX) =>
            {
                tracing::debug!("PWS update accepted");
                self.last_outcome = Some("accepted".to_string());
            }
            DispatchOutcome::Response { status, body } => {
                tracing::error!(status, body = %body.trim(), "PWS update rejected");
                self.last_outcome = Some(format!("rejected (status {status})"));
            }
            DispatchOutcome::Failed { error } => {
                tracing::error!("PWS update failed: {error:#}");
                self.last_outcome = Some(format!("failed: {error:#}"));
            }
        }
    }

    pub fn status_report(&self) -> UplinkStatusReport {
        let mut last_sent = BTreeMap::new();
        for (kind, key) in UPLOAD_FIELDS {
            if let Some(sent_at) = self.last_sent.get(&kind) {
                last_sent.insert(key.to_string(), *sent_at);
            }
        }
        UplinkStatusReport {
            status: self.status().as_str().to_string(),
            station_id: self.settings.station_id.clone(),
            pws_id: self.settings.pws_id.clone(),
            in_flight: self.in_flight,
            last_dispatch_at: self.last_dispatch_at,
            last_outcome: self.last_outcome.clone(),
            last_sent,
        }
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[derive(Debug)]
pub enum UplinkCommand {
    Configure {
        settings: UploadSettings,
        respond_to: oneshot::Sender<UplinkStatusReport>,
    },
    GetStatus {
        respond_to: oneshot::Sender<UplinkStatusReport>,
    },
}

#[derive(Clone)]
pub struct UplinkHandle {
    tx: mpsc::UnboundedSender<UplinkCommand>,
}

impl UplinkHandle {
    pub fn new(tx: mpsc::UnboundedSender<UplinkCommand>) -> Self {
        Self { tx }
    }

    pub async fn configure(&self, settings: UploadSettings) -> Result<UplinkStatusReport> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(UplinkCommand::Configure {
                settings,
                respond_to: tx,
            })
            .map_err(|_| anyhow!("uploader task stopped"))?;
        Ok(rx.await.context("uploader task dropped response")?)
    }

    pub async fn status(&self) -> Result<UplinkStatusReport> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(UplinkCommand::GetStatus { respond_to: tx })
            .map_err(|_| anyhow!("uploader task stopped"))?;
        Ok(rx.await.context("uploader task dropped response")?)
    }
}

pub fn spawn_uploader(
    config: &Config,
    registry: Arc<StationRegistry>,
    channel: Arc<dyn DispatchChannel>,
    outcome_rx: mpsc::UnboundedReceiver<DispatchOutcome>,
    cancel: CancellationToken,
) -> UplinkHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let uploader = Uploader::new(
        config.update_url.clone(),
        UploadSettings {
            station_id: config.station_id.clone(),
            pws_id: config.pws_id.clone(),
            pws_password: config.pws_password.clone(),
        },
        registry,
        channel,
    );
    tracing::info!(
        status = uploader.status().as_str(),
        interval_secs = config.refresh_interval.as_secs(),
        "uplink engine starting"
    );
    tokio::spawn(run_uploader(
        uploader,
        rx,
        outcome_rx,
        config.refresh_interval,
        cancel,
    ));
    UplinkHandle::new(tx)
}

/// Owns the engine. Ticks, dispatch outcomes, and commands all arrive on this
/// task, so none of them ever observes the state mid-mutation.
async fn run_uploader(
    mut uploader: Uploader,
    mut command_rx: mpsc::UnboundedReceiver<UplinkCommand>,
    mut outcome_rx: mpsc::UnboundedReceiver<DispatchOutcome>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut outcomes_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => uploader.refresh(Utc::now()),
            maybe = outcome_rx.recv(), if outcomes_open => {
                // A closed outcome channel means no outcome will ever arrive;
                // ticks and commands still run.
                match maybe {
                    Some(outcome) => uploader.handle_outcome(outcome),
                    None => outcomes_open = false,
                }
            }
            maybe = command_rx.recv() => {
                let Some(cmd) = maybe else { break; };
                match cmd {
                    UplinkCommand::Configure { settings, respond_to } => {
                        uploader.apply_settings(settings);
                        let _ = respond_to.send(uploader.status_report());
                    }
                    UplinkCommand::GetStatus { respond_to } => {
                        let _ = respond_to.send(uploader.status_report());
                    }
                }
            }
        }
    }
}
