//! HTTP anomaly-detection server.
//!
//! Scores readings synchronously against the loaded models. The server keeps
//! its own live feature windows, so `/detect` uses per-device history just
//! like the queue path does, but nothing here is persisted or retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamsense_core::reading::parse_timestamp;
use streamsense_core::{
    Alert, AnomalyResult, AnomalyScorer, Dimension, FeatureWindows, MessageQueue, PipelineStats,
    Reading, Severity,
};

/// Device id used when a request names none.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Shared server state.
pub struct AppState {
    scorer: Option<AnomalyScorer>,
    windows: FeatureWindows,
    stats: Arc<PipelineStats>,
    queue: Option<Arc<dyn MessageQueue>>,
}

impl AppState {
    /// `scorer` is `None` when models failed to load; scoring endpoints then
    /// answer 503 and `/health` reports degraded.
    pub fn new(scorer: Option<AnomalyScorer>, windows: FeatureWindows) -> Self {
        Self {
            scorer,
            windows,
            stats: Arc::new(PipelineStats::new()),
            queue: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Attach a queue whose liveness `/health` should report.
    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    fn scorer(&self) -> Result<&AnomalyScorer, ApiError> {
        self.scorer
            .as_ref()
            .ok_or_else(|| ApiError::Unavailable("models not loaded".into()))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn request_reading(
    device_id: Option<String>,
    timestamp: Option<&str>,
    temperature: f64,
    vibration: f64,
) -> Result<Reading, ApiError> {
    let timestamp = match timestamp {
        Some(ts) => parse_timestamp(ts).map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => Utc::now(),
    };
    let device_id = device_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
    Ok(Reading::new(device_id, timestamp, temperature, vibration))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DetectRequest {
    device_id: Option<String>,
    timestamp: Option<String>,
    temperature: f64,
    vibration: f64,
}

#[derive(Serialize)]
struct DetectResponse {
    #[serde(flatten)]
    result: AnomalyResult,
    temperature: f64,
    vibration: f64,
}

async fn handle_detect(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<DetectResponse>, ApiError> {
    let req: DetectRequest = parse_body(&body)?;
    let scorer = state.scorer()?;
    let reading = request_reading(
        req.device_id,
        req.timestamp.as_deref(),
        req.temperature,
        req.vibration,
    )?;

    let started = Instant::now();
    let features = state.windows.observe(&reading.device_id, &reading);
    let result = scorer.score(&features);
    state.stats.record_scoring(started.elapsed());
    state.stats.record_result(&result);
    if let Some(alert) = Alert::from_result(&result, reading.temperature, reading.vibration) {
        alert.log();
    }
    Ok(Json(DetectResponse {
        result,
        temperature: reading.temperature,
        vibration: reading.vibration,
    }))
}

#[derive(Deserialize)]
struct DimensionRequest {
    device_id: Option<String>,
    timestamp: Option<String>,
    value: f64,
}

async fn detect_dimension(
    state: &AppState,
    body: &[u8],
    dimension: Dimension,
) -> Result<Json<streamsense_core::DimensionResult>, ApiError> {
    let req: DimensionRequest = parse_body(body)?;
    let scorer = state.scorer()?;
    // The other dimension is unknown; its slot is ignored by this model.
    let (temperature, vibration) = match dimension {
        Dimension::Temperature => (req.value, 0.0),
        Dimension::Vibration => (0.0, req.value),
    };
    let reading = request_reading(req.device_id, req.timestamp.as_deref(), temperature, vibration)?;
    let features = state.windows.peek(&reading.device_id, &reading);
    Ok(Json(scorer.score_dimension(&features, dimension)))
}

async fn handle_detect_temperature(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<streamsense_core::DimensionResult>, ApiError> {
    detect_dimension(&state, &body, Dimension::Temperature).await
}

async fn handle_detect_vibration(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<streamsense_core::DimensionResult>, ApiError> {
    detect_dimension(&state, &body, Dimension::Vibration).await
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    models_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_alive: Option<bool>,
    devices_tracked: usize,
    timestamp: DateTime<Utc>,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let models_loaded = state.scorer.is_some();
    let queue_alive = state.queue.as_ref().map(|q| q.is_alive());
    let healthy = models_loaded && queue_alive.unwrap_or(true);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" },
            models_loaded,
            model_version: state.scorer.as_ref().map(|s| s.version().to_string()),
            queue_alive,
            devices_tracked: state.windows.device_count(),
            timestamp: Utc::now(),
        }),
    )
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let counters = state.stats.snapshot();
    Json(serde_json::json!({
        "counters": counters,
        "mean_scoring_micros": counters.mean_scoring_micros(),
        "devices_tracked": state.windows.device_count(),
        "window_capacity": state.windows.capacity(),
        "model_version": state.scorer.as_ref().map(|s| s.version()),
    }))
}

#[derive(Deserialize)]
struct AlertRequest {
    device_id: String,
    alert_type: Option<String>,
    severity: Option<Severity>,
    message: Option<String>,
    temperature: Option<f64>,
    vibration: Option<f64>,
}

async fn handle_alert(body: Bytes) -> Result<Json<serde_json::Value>, ApiError> {
    let req: AlertRequest = parse_body(&body)?;
    let alert_type = req.alert_type.unwrap_or_else(|| "manual".to_string());
    let alert = Alert {
        message: req
            .message
            .unwrap_or_else(|| format!("{alert_type} alert on {}", req.device_id)),
        device_id: req.device_id,
        alert_type,
        severity: req.severity.unwrap_or_default(),
        temperature: req.temperature,
        vibration: req.vibration,
        raised_at: Utc::now(),
    };
    alert.log();
    Ok(Json(serde_json::json!({
        "status": "alert created",
        "alert": alert,
    })))
}

async fn handle_index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "StreamSense Server",
        "version": streamsense_core::VERSION,
        "endpoints": {
            "/": "This API index",
            "/detect": {
                "method": "POST",
                "description": "Score a reading on both models",
                "body": "{device_id?, timestamp?, temperature, vibration}",
            },
            "/detect/temperature": {
                "method": "POST",
                "description": "Score temperature only",
                "body": "{device_id?, timestamp?, value}",
            },
            "/detect/vibration": {
                "method": "POST",
                "description": "Score vibration only",
                "body": "{device_id?, timestamp?, value}",
            },
            "/alert": {
                "method": "POST",
                "description": "Raise an operator alert",
                "body": "{device_id, alert_type?, severity?, message?, temperature?, vibration?}",
            },
            "/stats": "Prediction and delivery counters",
            "/health": "Health check",
        },
    }))
}

/// Build the axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/detect", post(handle_detect))
        .route("/detect/temperature", post(handle_detect_temperature))
        .route("/detect/vibration", post(handle_detect_vibration))
        .route("/alert", post(handle_alert))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .with_state(Arc::new(state))
}

/// Run the HTTP server until `shutdown` resolves.
pub async fn run_server(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use streamsense_core::{Bound, EnvelopeModel, InMemoryQueue};
    use tower::ServiceExt;

    fn ceiling(max: f64) -> Arc<EnvelopeModel> {
        let mut bounds = vec![Bound::default(); 5];
        bounds[0].upper = Some(max);
        Arc::new(EnvelopeModel { bounds })
    }

    fn state() -> AppState {
        let scorer = AnomalyScorer::new(ceiling(30.0), ceiling(3.0), "srv-test");
        AppState::new(Some(scorer), FeatureWindows::default())
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn detect_flags_hot_reading() {
        let app = build_router(state());
        let (status, json) = call(
            app.clone(),
            "POST",
            "/detect",
            r#"{"device_id":"d1","timestamp":"2024-01-01T12:00:00Z","temperature":35.0,"vibration":1.5}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["is_temp_anomaly"], true);
        assert_eq!(json["overall_anomaly"], true);
        assert_eq!(json["temperature"], 35.0);
        assert_eq!(json["model_version"], "srv-test");

        let (_, json) = call(
            app,
            "POST",
            "/detect",
            r#"{"device_id":"d1","temperature":22.0,"vibration":1.5}"#,
        )
        .await;
        assert_eq!(json["is_temp_anomaly"], false);
    }

    #[tokio::test]
    async fn detect_defaults_device_id() {
        let (status, json) = call(
            build_router(state()),
            "POST",
            "/detect",
            r#"{"temperature":20.0,"vibration":1.0}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["device_id"], UNKNOWN_DEVICE);
    }

    #[tokio::test]
    async fn detect_rejects_bad_body() {
        let app = build_router(state());
        let (status, json) = call(app.clone(), "POST", "/detect", r#"{"device_id":"d1"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("temperature"));

        let (status, _) = call(
            app,
            "POST",
            "/detect",
            r#"{"timestamp":"noon","temperature":1.0,"vibration":1.0}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn single_dimension_endpoints() {
        let app = build_router(state());
        let (status, json) = call(
            app.clone(),
            "POST",
            "/detect/vibration",
            r#"{"device_id":"d3","value":4.5}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["dimension"], "vibration");
        assert_eq!(json["value"], 4.5);
        assert_eq!(json["is_anomaly"], true);

        let (_, json) = call(app, "POST", "/detect/temperature", r#"{"value":25.0}"#).await;
        assert_eq!(json["is_anomaly"], false);
    }

    #[tokio::test]
    async fn missing_models_degrade_service() {
        let app = build_router(AppState::new(None, FeatureWindows::default()));
        let (status, json) = call(app.clone(), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "degraded");

        let (status, _) = call(app, "POST", "/detect", r#"{"temperature":1.0,"vibration":1.0}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_tracks_queue_liveness() {
        let queue = Arc::new(InMemoryQueue::default());
        let app = build_router(state().with_queue(queue.clone()));
        let (status, json) = call(app.clone(), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["queue_alive"], true);

        queue.close();
        let (status, _) = call(app, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stats_count_detections() {
        let app = build_router(state());
        call(
            app.clone(),
            "POST",
            "/detect",
            r#"{"device_id":"d1","temperature":40.0,"vibration":9.0}"#,
        )
        .await;
        let (status, json) = call(app, "GET", "/stats", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["counters"]["anomalies"], 1);
        assert_eq!(json["counters"]["temp_anomalies"], 1);
        assert_eq!(json["counters"]["vibration_anomalies"], 1);
        assert_eq!(json["devices_tracked"], 1);
        assert_eq!(json["counters"]["scored"], 1);
        assert!(json["mean_scoring_micros"].is_number());
    }

    #[tokio::test]
    async fn alert_endpoint_echoes_alert() {
        let (status, json) = call(
            build_router(state()),
            "POST",
            "/alert",
            r#"{"device_id":"d7","alert_type":"overheat","severity":"critical"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "alert created");
        assert_eq!(json["alert"]["severity"], "critical");
        assert_eq!(json["alert"]["message"], "overheat alert on d7");
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let (status, json) = call(build_router(state()), "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["endpoints"]["/detect"].is_object());
    }
}
