//! HTTP keep-alive responder.
//!
//! Hosting platforms that idle a service without inbound traffic get a
//! status page, a health endpoint and, when an external URL is known, a
//! periodic self-ping. None of this takes part in the instance lock
//! protocol.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Local};
use serde::Serialize;
use sysinfo::System;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub addr: SocketAddr,
    /// Base URL pinged at `<url>/health`; no self-ping when unset.
    pub external_url: Option<String>,
    /// URL shown on the dashboard and in `/health`.
    pub public_url: String,
    pub ping_interval: Duration,
    pub ping_retry: Duration,
}

impl KeepAliveConfig {
    pub const DEFAULT_PORT: u16 = 8080;

    pub fn on_port(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            external_url: None,
            public_url: public_url(None, None),
            ping_interval: Duration::from_secs(600),
            ping_retry: Duration::from_secs(30),
        }
    }
}

/// Public URL built from the hosting slug and owner.
pub fn public_url(slug: Option<&str>, owner: Option<&str>) -> String {
    format!(
        "https://{}.{}.replit.co",
        slug.unwrap_or("unknown"),
        owner.unwrap_or("unknown")
    )
}

struct DashboardState {
    started: DateTime<Local>,
    port: u16,
    public_url: String,
    system: Mutex<System>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    message: &'static str,
    timestamp: String,
    uptime: String,
    url: String,
}

pub struct KeepAliveServer {
    config: KeepAliveConfig,
    local_addr: Option<SocketAddr>,
    pings: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    ping_handle: Option<JoinHandle<()>>,
}

impl KeepAliveServer {
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            local_addr: None,
            pings: Arc::new(AtomicU64::new(0)),
            shutdown_tx: None,
            handle: None,
            ping_handle: None,
        }
    }

    fn router(&self, port: u16) -> Router {
        let state = Arc::new(DashboardState {
            started: Local::now(),
            port,
            public_url: self.config.public_url.clone(),
            system: Mutex::new(System::new()),
        });
        Router::new()
            .route("/", get(dashboard))
            .route("/health", get(health))
            .with_state(state)
    }

    /// Bind the listener and spawn the server, plus the self-ping task
    /// when an external URL is configured. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, Error> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| {
                Error::KeepAlive(format!("Failed to bind to {}: {}", self.config.addr, e))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::KeepAlive(e.to_string()))?;
        let app = self.router(local_addr.port());

        tracing::info!("Keep-alive server listening on {}", local_addr);
        tracing::info!("Health endpoint: http://{}/health", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Keep-alive server shutting down");
                })
                .await
            {
                tracing::error!("Keep-alive server error: {}", e);
            }
        }));

        if let Some(url) = self.config.external_url.clone() {
            tracing::info!(url = %url, "Self-ping service started");
            self.ping_handle = Some(tokio::spawn(self_ping(
                url,
                self.config.ping_interval,
                self.config.ping_retry,
                Arc::clone(&self.pings),
            )));
        }

        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of successful self-pings so far.
    pub fn successful_pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(ping) = self.ping_handle.take() {
            ping.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.local_addr = None;
    }
}

async fn self_ping(url: String, interval: Duration, retry: Duration, pings: Arc<AtomicU64>) {
    let client = reqwest::Client::new();
    let target = format!("{}/health", url.trim_end_matches('/'));
    loop {
        let result = client
            .get(&target)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let pause = match result {
            Ok(_) => {
                pings.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Self-ping successful");
                interval
            }
            Err(e) => {
                tracing::error!(error = %e, "Self-ping failed");
                retry
            }
        };
        tokio::time::sleep(pause).await;
    }
}

async fn health(State(state): State<Arc<DashboardState>>) -> Json<Health> {
    let now = Local::now();
    Json(Health {
        status: "healthy",
        message: "Bot is running",
        timestamp: now.naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        uptime: format_uptime(now - state.started, true),
        url: state.public_url.clone(),
    })
}

async fn dashboard(State(state): State<Arc<DashboardState>>) -> Html<String> {
    let (cpu, memory) = {
        let mut system = state.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        (system.global_cpu_usage(), memory)
    };
    let now = Local::now();

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Bot Status Dashboard</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 0; padding: 20px; background-color: #f0f2f5; }}
        .container {{ max-width: 800px; margin: 0 auto; background-color: white; padding: 20px; border-radius: 10px; }}
        .online {{ background-color: #e6ffe6; color: #006600; padding: 10px; border-radius: 5px; }}
        .stat-grid {{ display: grid; grid-template-columns: repeat(auto-fit, minmax(200px, 1fr)); gap: 20px; margin-top: 20px; }}
        .stat-card {{ background-color: #f8f9fa; padding: 15px; border-radius: 5px; }}
        h1 {{ color: #1a73e8; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>🤖 Bot Status Dashboard</h1>
        <div class="online">
            <h2>✅ Bot Status: Online</h2>
            <p>Last checked: {time}</p>
        </div>
        <div class="stat-grid">
            <div class="stat-card">
                <h2>💻 System Stats</h2>
                <p>CPU Usage: {cpu:.1}%</p>
                <p>Memory Usage: {memory:.1}%</p>
                <p>Uptime: {uptime}</p>
            </div>
            <div class="stat-card">
                <h2>🌐 Server Info</h2>
                <p>Port: {port}</p>
                <p>Public URL: <span id="public-url">{url}</span></p>
            </div>
        </div>
        <a href="/">🔄 Refresh Status</a>
    </div>
</body>
</html>
"#,
        time = now.format("%Y-%m-%d %H:%M:%S"),
        uptime = format_uptime(now - state.started, false),
        port = state.port,
        url = state.public_url,
    ))
}

/// `H:MM:SS`, prefixed with `N day(s), ` past a day, with microseconds
/// appended when requested and non-zero.
fn format_uptime(elapsed: chrono::Duration, with_micros: bool) -> String {
    let elapsed = elapsed.max(chrono::Duration::zero());
    let days = elapsed.num_days();
    let secs = elapsed.num_seconds() % 86_400;
    let mut out = String::new();
    if days > 0 {
        let unit = if days == 1 { "day" } else { "days" };
        out.push_str(&format!("{days} {unit}, "));
    }
    out.push_str(&format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60));
    let micros = elapsed.subsec_nanos() / 1_000;
    if with_micros && micros > 0 {
        out.push_str(&format!(".{micros:06}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn local_config() -> KeepAliveConfig {
        KeepAliveConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            ..KeepAliveConfig::on_port(0)
        }
    }

    #[tokio::test]
    async fn start_and_shutdown_lifecycle() {
        let mut server = KeepAliveServer::new(local_config());
        let addr = server.start().await.expect("server should start on port 0");
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.handle.is_some());
        server.shutdown().await;
        assert!(server.handle.is_none());
        assert!(server.shutdown_tx.is_none());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn health_reports_status_and_url() {
        let mut config = local_config();
        config.public_url = public_url(Some("decistrip"), Some("ops"));
        let mut server = KeepAliveServer::new(config);
        let addr = server.start().await.unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        server.shutdown().await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["message"], "Bot is running");
        assert_eq!(body["url"], "https://decistrip.ops.replit.co");
        assert!(body["uptime"].as_str().unwrap().starts_with("0:00:0"));
    }

    #[tokio::test]
    async fn dashboard_renders_port_and_stats() {
        let mut server = KeepAliveServer::new(local_config());
        let addr = server.start().await.unwrap();

        let page = reqwest::get(format!("http://{addr}/"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        server.shutdown().await;

        assert!(page.contains("Bot Status: Online"));
        assert!(page.contains(&format!("Port: {}", addr.port())));
        assert!(page.contains("CPU Usage:"));
        assert!(page.contains("https://unknown.unknown.replit.co"));
    }

    #[tokio::test]
    async fn start_on_occupied_port_returns_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = KeepAliveConfig {
            addr: listener.local_addr().unwrap(),
            ..local_config()
        };
        let mut server = KeepAliveServer::new(config);
        match server.start().await {
            Err(Error::KeepAlive(reason)) => assert!(reason.contains("Failed to bind")),
            other => panic!("expected bind failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_without_start_is_noop() {
        let mut server = KeepAliveServer::new(local_config());
        server.shutdown().await;
        assert!(server.handle.is_none());
    }

    #[tokio::test]
    async fn self_ping_hits_own_health_endpoint() {
        let mut target = KeepAliveServer::new(local_config());
        let target_addr = target.start().await.unwrap();

        let mut pinger = KeepAliveServer::new(KeepAliveConfig {
            external_url: Some(format!("http://{target_addr}/")),
            ping_interval: Duration::from_millis(20),
            ..local_config()
        });
        pinger.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pinger.successful_pings() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "self-ping never succeeded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pinger.shutdown().await;
        target.shutdown().await;
    }

    #[test]
    fn uptime_formatting() {
        let d = chrono::Duration::seconds(3 * 86_400 + 3_725) + chrono::Duration::microseconds(42);
        assert_eq!(format_uptime(d, false), "3 days, 1:02:05");
        assert_eq!(format_uptime(d, true), "3 days, 1:02:05.000042");
        assert_eq!(format_uptime(chrono::Duration::seconds(86_400), true), "1 day, 0:00:00");
        assert_eq!(format_uptime(chrono::Duration::seconds(59), false), "0:00:59");
    }
}
