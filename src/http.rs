use crate::uploader::{UploadSettings, UplinkHandle, UplinkStatusReport};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;

#[derive(Clone)]
pub struct HttpState {
    pub uplink: UplinkHandle,
}

#[derive(Debug, Deserialize)]
struct ConfigRequest {
    station_id: Option<String>,
    pws_id: Option<String>,
    pws_password: Option<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(
    State(state): State<HttpState>,
) -> Result<Json<UplinkStatusReport>, (StatusCode, String)> {
    let report = state
        .uplink
        .status()
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    Ok(Json(report))
}

async fn put_config(
    State(state): State<HttpState>,
    Json(payload): Json<ConfigRequest>,
) -> Result<Json<UplinkStatusReport>, (StatusCode, String)> {
    let settings = UploadSettings {
        station_id: payload.station_id,
        pws_id: payload.pws_id,
        pws_password: payload.pws_password,
    };
    let report = state
        .uplink
        .configure(settings)
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    Ok(Json(report))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/config", put(put_config))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::DispatchChannel;
    use crate::registry::StationRegistry;
    use crate::uploader::spawn_uploader;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use url::Url;

    struct NullChannel;

    impl DispatchChannel for NullChannel {
        fn dispatch(&self, _url: Url) {}
    }

    fn test_config() -> Config {
        Config {
            station_id: Some("ws1".to_string()),
            pws_id: Some("foo".to_string()),
            pws_password: Some("bar".to_string()),
            update_url:
                "http://weatherstation.wunderground.com/weatherstation/updateweatherstation.php"
                    .to_string(),
            refresh_interval: Duration::from_secs(3600),
            http_timeout: Duration::from_secs(5),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_prefix: "iot".to_string(),
            mqtt_client_id: "pws-uplink-test".to_string(),
            http_bind: "127.0.0.1:0".to_string(),
        }
    }

    fn test_app(config: &Config) -> Router {
        let (_outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let uplink = spawn_uploader(
            config,
            Arc::new(StationRegistry::new()),
            Arc::new(NullChannel),
            outcome_rx,
            CancellationToken::new(),
        );
        router(HttpState { uplink })
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = test_app(&test_config());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_route_reports_engine_state() {
        let app = test_app(&test_config());
        let resp = app
            .oneshot(Request::builder().uri("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let report = body_json(resp).await;
        assert_eq!(report["status"], "running");
        assert_eq!(report["in_flight"], false);
        assert_eq!(report["pws_id"], "foo");
    }

    #[tokio::test]
    async fn config_route_applies_settings() {
        let mut config = test_config();
        config.pws_id = None;
        config.pws_password = None;
        let app = test_app(&config);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["status"], "not configured");

        let resp = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/config")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"station_id":"ws1","pws_id":"foo","pws_password":"bar"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "running");
    }
}
