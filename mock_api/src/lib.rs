//! Stand-in for the smart meter API, serving synthetic telemetry.

pub mod telemetry;

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use telemetry::{base_power, generate_readings, Reading};

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub devices: usize,
    /// When set, every request must carry `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            devices: 3,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone)]
struct MockDevice {
    device_id: String,
    base_power_w: f64,
}

#[derive(Debug, Clone)]
struct AppState {
    devices: Arc<Vec<MockDevice>>,
    api_key: Option<Arc<str>>,
}

impl AppState {
    fn device(&self, device_id: &str) -> Option<&MockDevice> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    pub location: String,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    device_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: usize,
    pub data: Vec<Reading>,
}

/// `device_001`, `device_002`, ...
pub fn device_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("device_{:03}", i)).collect()
}

pub fn create_router(config: MockConfig) -> Router {
    let devices = device_ids(config.devices)
        .into_iter()
        .enumerate()
        .map(|(index, device_id)| MockDevice {
            device_id,
            base_power_w: base_power(index),
        })
        .collect();

    let state = AppState {
        devices: Arc::new(devices),
        api_key: config.api_key.map(Arc::from),
    };

    Router::new()
        .route("/health", get(health))
        .route("/devices", get(get_devices))
        .route("/readings", get(get_readings))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(key) = &state.api_key {
        let expected = format!("Bearer {}", key);
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        if presented != Some(expected.as_str()) {
            warn!("Rejected request to {} without valid credentials", request.uri().path());
            return ApiError::Unauthorized.into_response();
        }
    }

    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
}

async fn get_devices(State(state): State<AppState>) -> Json<DevicesResponse> {
    let devices = state
        .devices
        .iter()
        .map(|device| DeviceEntry {
            device_id: device.device_id.clone(),
            name: format!(
                "Smart Meter {}",
                device.device_id.rsplit('_').next().unwrap_or(&device.device_id)
            ),
            location: "Home".to_string(),
        })
        .collect();

    Json(DevicesResponse { devices })
}

async fn get_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, ApiError> {
    let device = params
        .device_id
        .as_deref()
        .and_then(|id| state.device(id))
        .ok_or_else(|| ApiError::BadRequest("Invalid device_id".to_string()))?;

    let now = Utc::now();
    let start = params.start.unwrap_or(now - Duration::days(1));
    let end = params.end.unwrap_or(now);

    let data = {
        let mut rng = rand::thread_rng();
        generate_readings(&mut rng, &device.device_id, device.base_power_w, start, end)
    };

    debug!("Serving {} readings for {}", data.len(), device.device_id);

    Ok(Json(ReadingsResponse {
        device_id: device.device_id.clone(),
        start,
        end,
        count: data.len(),
        data,
    }))
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
