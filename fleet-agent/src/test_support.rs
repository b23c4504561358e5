//! In-process authority used by unit tests.
//!
//! Binds to 127.0.0.2, which the standard guard allows (only the literal
//! 127.0.0.1 is blocked) and which Linux routes over loopback.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

const BIND_ADDR: &str = "127.0.0.2:0";

pub fn valid_policy_json() -> String {
    r#"{
        "schedule": {"daily_at": "02:00"},
        "include": ["/srv/data"],
        "exclude": ["*.tmp"],
        "restic": {"repository": "rest:https://backup.example.com/device-1/"},
        "retention": {"keep_daily": 7, "prune": true},
        "enabled": true
    }"#
    .to_string()
}

pub struct MockState {
    pub config_status: u16,
    pub config_body: String,
    pub config_delay: Option<Duration>,
    pub report_status: u16,
    pub report_body: String,
    /// Reports whose raw body contains any of these strings get a 500
    pub reject_containing: Vec<String>,
    /// Every report body received, in arrival order
    pub report_attempts: Vec<serde_json::Value>,
    /// Reports answered with 200
    pub reports: Vec<serde_json::Value>,
    pub auth_headers: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            config_status: 200,
            config_body: valid_policy_json(),
            config_delay: None,
            report_status: 200,
            report_body: "ok".to_string(),
            reject_containing: Vec::new(),
            report_attempts: Vec::new(),
            reports: Vec::new(),
            auth_headers: Vec::new(),
        }
    }
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockAuthority {
    pub url: String,
    state: Shared,
    handle: JoinHandle<()>,
}

impl MockAuthority {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));
        let app = Router::new()
            .route("/v1/config", get(get_config))
            .route("/v1/report", post(post_report))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind(BIND_ADDR).await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { url, state, handle }
    }

    pub fn with(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state());
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Drop for MockAuthority {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// URL of a port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind(BIND_ADDR).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn record_auth(state: &mut MockState, headers: &HeaderMap) {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.auth_headers.push(value);
}

async fn get_config(State(state): State<Shared>, headers: HeaderMap) -> (StatusCode, String) {
    let (delay, status, body) = {
        let mut s = state.lock().unwrap();
        record_auth(&mut s, &headers);
        (s.config_delay, s.config_status, s.config_body.clone())
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    (StatusCode::from_u16(status).unwrap(), body)
}

async fn post_report(State(state): State<Shared>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    let mut s = state.lock().unwrap();
    record_auth(&mut s, &headers);

    let value: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    s.report_attempts.push(value.clone());

    if s.reject_containing.iter().any(|marker| body.contains(marker.as_str())) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "rejected".to_string());
    }
    if s.report_status != 200 {
        return (StatusCode::from_u16(s.report_status).unwrap(), s.report_body.clone());
    }

    s.reports.push(value);
    (StatusCode::OK, "ok".to_string())
}
