use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Result of one dispatched update, delivered exactly once per request.
#[derive(Debug)]
pub enum DispatchOutcome {
    Response { status: u16, body: String },
    Failed { error: anyhow::Error },
}

/// Outbound side of the upload engine. The uploader is constructed with one of
/// these; the real implementation performs the GET on a spawned task, tests
/// swap in a recorder.
pub trait DispatchChannel: Send + Sync {
    fn dispatch(&self, url: Url);
}

/// reqwest-backed channel. Every dispatch yields exactly one outcome on
/// `outcome_tx`; a hung server surfaces as a `Failed` outcome once the
/// per-request timeout fires.
pub struct HttpDispatcher {
    http: reqwest::Client,
    timeout: Duration,
    outcome_tx: mpsc::UnboundedSender<DispatchOutcome>,
}

impl HttpDispatcher {
    pub fn new(
        http: reqwest::Client,
        timeout: Duration,
        outcome_tx: mpsc::UnboundedSender<DispatchOutcome>,
    ) -> Self {
        Self {
            http,
            timeout,
            outcome_tx,
        }
    }
}

impl DispatchChannel for HttpDispatcher {
    fn dispatch(&self, url: Url) {
        let http = self.http.clone();
        let timeout = self.timeout;
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let outcome = match send_update(http, url, timeout).await {
                Ok(outcome) => outcome,
                Err(error) => DispatchOutcome::Failed { error },
            };
            if outcome_tx.send(outcome).is_err() {
                tracing::debug!("uploader stopped before outcome delivery");
            }
        });
    }
}

async fn send_update(http: reqwest::Client, url: Url, timeout: Duration) -> Result<DispatchOutcome> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .context("send PWS update")?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .context("read PWS update response")?;
    Ok(DispatchOutcome::Response { status, body })
}
