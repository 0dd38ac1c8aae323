//! Plain-HTTP liveness endpoint for process supervisors and load balancers.
//!
//! `GET /health` answers while the relay task is alive; `GET /metrics`
//! adds the admission ceiling. Anything else is a 404.

use axum::{extract::State, routing::get, Json, Router};
use morph_proto::security::unix_time_secs;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

pub struct HealthState {
    started: Instant,
    sessions: Arc<AtomicUsize>,
    max_sessions: usize,
}

impl HealthState {
    /// `sessions` is the relay's live session gauge.
    pub fn new(sessions: Arc<AtomicUsize>, max_sessions: usize) -> Self {
        Self {
            started: Instant::now(),
            sessions,
            max_sessions,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    sessions: usize,
    timestamp: u32,
}

#[derive(Serialize)]
struct MetricsResponse {
    uptime_secs: u64,
    sessions: usize,
    max_sessions: usize,
    timestamp: u32,
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime_secs: state.started.elapsed().as_secs(),
        sessions: state.sessions.load(Ordering::Relaxed),
        timestamp: unix_time_secs(),
    })
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        uptime_secs: state.started.elapsed().as_secs(),
        sessions: state.sessions.load(Ordering::Relaxed),
        max_sessions: state.max_sessions,
        timestamp: unix_time_secs(),
    })
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve until the task is dropped or the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<HealthState>) -> io::Result<()> {
    tracing::info!("Health endpoint on http://{}/health", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(sessions: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(HealthState::new(sessions, 8))));
        addr
    }

    /// Returns the status line and the body.
    async fn fetch(addr: SocketAddr, path: &str) -> (String, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        let status = head.lines().next().unwrap().to_string();
        (status, body.to_string())
    }

    #[tokio::test]
    async fn test_health_reports_live_sessions() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let addr = start(sessions.clone()).await;

        let (status, body) = fetch(addr, "/health").await;
        assert!(status.contains("200"), "{}", status);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions"], 0);

        sessions.store(3, Ordering::Relaxed);
        let (_, body) = fetch(addr, "/health").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["sessions"], 3);
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_metrics_and_unknown_path() {
        let addr = start(Arc::new(AtomicUsize::new(1))).await;

        let (status, body) = fetch(addr, "/metrics").await;
        assert!(status.contains("200"), "{}", status);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["sessions"], 1);
        assert_eq!(json["max_sessions"], 8);

        let (status, _) = fetch(addr, "/nope").await;
        assert!(status.contains("404"), "{}", status);
    }
}
