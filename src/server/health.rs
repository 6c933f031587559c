//! HTTP health and readiness endpoints for operational monitoring.
//!
//! A minimal HTTP/1.1 responder for load balancers, Kubernetes liveness checks and
//! Prometheus scrapes. Every connection gets one response and is closed.
//!
//! # Endpoints
//!
//! - `GET /live` - Liveness check (always 200 while the server runs)
//! - `GET /health` - JSON [`HealthReport`]; 503 when the engine is down
//! - `GET /ready` - 200 only when every component is up
//! - `GET /metrics` - Prometheus metrics in text format
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardhold::server::health::{HealthServer, HealthSource};
//!
//! async fn serve(engine: Arc<dyn HealthSource>) -> std::io::Result<()> {
//!     let server = HealthServer::new("0.0.0.0:8080", engine).await?;
//!     server.run().await
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::engine::{Aggregate, Engine, HealthReport, HealthState, metrics};

/// Anything that can produce a health report on demand.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn health_report(&self) -> HealthReport;
}

#[async_trait]
impl<A: Aggregate> HealthSource for Engine<A> {
    async fn health_report(&self) -> HealthReport {
        self.health(self.config().health_check_timeout).await
    }
}

/// HTTP status for a health state.
fn status_line(state: HealthState, strict: bool) -> &'static str {
    match state {
        HealthState::Up => "200 OK",
        HealthState::Degraded if !strict => "200 OK",
        HealthState::Degraded | HealthState::Down => "503 Service Unavailable",
    }
}

/// Lightweight HTTP server for health endpoints.
pub struct HealthServer {
    listener: TcpListener,
    source: Arc<dyn HealthSource>,
    shutdown_tx: broadcast::Sender<()>,
    /// Upper bound on reading one request.
    read_timeout: Duration,
}

impl HealthServer {
    /// Bind to `addr` (e.g. "0.0.0.0:8080").
    pub async fn new(addr: &str, source: Arc<dyn HealthSource>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(addr = %addr, "Health server listening");

        Ok(Self {
            listener,
            source,
            shutdown_tx,
            read_timeout: Duration::from_secs(5),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Initiate graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Health server shutdown signal sent");
    }

    /// Serve requests until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Health server shutting down");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((mut stream, addr)) => {
                            debug!(client_addr = %addr, "Health check connection");

                            let source = Arc::clone(&self.source);
                            let read_timeout = self.read_timeout;

                            tokio::spawn(async move {
                                let mut buf = [0u8; 1024];
                                match tokio::time::timeout(read_timeout, stream.read(&mut buf)).await {
                                    Ok(Ok(n)) if n > 0 => {
                                        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                                        let response = handle_request(&request, source.as_ref()).await;
                                        if let Err(e) = stream.write_all(response.as_bytes()).await {
                                            debug!(error = ?e, "Failed to write health response");
                                        }
                                    }
                                    Ok(Ok(_)) => debug!("Empty request received"),
                                    Ok(Err(e)) => debug!(error = ?e, "Failed to read health request"),
                                    Err(_) => debug!("Timed out reading health request"),
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = ?e, "Failed to accept health check connection");
                        }
                    }
                }
            }
        }
    }
}

/// Route one HTTP request and render the response.
async fn handle_request(request: &str, source: &dyn HealthSource) -> String {
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    let path = if parts.len() >= 2 { parts[1] } else { "/" };

    match path {
        "/live" | "/livez" | "/live/" => liveness_response(),
        "/health" | "/healthz" | "/health/" => {
            let report = source.health_report().await;
            json_response(status_line(report.state, false), &report.to_json())
        }
        "/ready" | "/readyz" | "/ready/" => {
            let report = source.health_report().await;
            json_response(status_line(report.state, true), &report.to_json())
        }
        "/metrics" => metrics_response(),
        _ => not_found_response(),
    }
}

fn liveness_response() -> String {
    "HTTP/1.1 200 OK\r\n\
     Content-Type: text/plain\r\n\
     Connection: close\r\n\
     \r\n\
     status: alive\n"
        .to_string()
}

fn json_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        body.len(),
        body
    )
}

fn metrics_response() -> String {
    match metrics::encode_metrics() {
        Ok(body) => format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            body
        ),
        Err(e) => {
            error!(error = ?e, "Failed to encode metrics");
            "HTTP/1.1 500 Internal Server Error\r\n\
             Content-Type: text/plain\r\n\
             Connection: close\r\n\
             \r\n\
             error: failed to encode metrics\n"
                .to_string()
        }
    }
}

fn not_found_response() -> String {
    "HTTP/1.1 404 Not Found\r\n\
     Content-Type: text/plain\r\n\
     Connection: close\r\n\
     \r\n\
     Available endpoints:\n\
     - /live - Liveness check\n\
     - /health - Engine health report\n\
     - /ready - Readiness check (fails unless every component is up)\n\
     - /metrics - Prometheus metrics\n"
        .to_string()
}
