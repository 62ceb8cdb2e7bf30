use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::mtcp::{telemetry, tunnel::relay::RelayContext};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub mode: &'static str,
    /// Present only when this process runs the relay.
    pub relay: Option<Arc<RelayContext>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .route("/pool", get(pool))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await
        .context("admin: serve")?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    mode: &'static str,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            mode: st.mode,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

fn relay_only() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "not running as relay",
        }),
    )
        .into_response()
}

async fn sessions(State(st): State<Arc<AdminState>>) -> Response {
    match &st.relay {
        Some(ctx) => (StatusCode::OK, Json(ctx.sessions.snapshot().await)).into_response(),
        None => relay_only(),
    }
}

async fn pool(State(st): State<Arc<AdminState>>) -> Response {
    match &st.relay {
        Some(ctx) => (StatusCode::OK, Json(ctx.status().await)).into_response(),
        None => relay_only(),
    }
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::mtcp::tunnel::relay::RelayOptions;

    async fn start(state: AdminState) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(ln, router(state)).await });
        addr
    }

    async fn get_raw(addr: SocketAddr, path: &str) -> String {
        let mut s = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
        s.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        s.read_to_string(&mut out).await.unwrap();
        out
    }

    fn json_body(resp: &str) -> serde_json::Value {
        let (_, body) = resp.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    fn state(relay: Option<Arc<RelayContext>>) -> AdminState {
        AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            mode: if relay.is_some() { "relay" } else { "agent" },
            relay,
        }
    }

    #[tokio::test]
    async fn relay_endpoints_report_pool_and_sessions() {
        let ctx = Arc::new(RelayContext::new(&RelayOptions {
            pool_size: 7,
            ..RelayOptions::default()
        }));
        let addr = start(state(Some(ctx))).await;

        let health = get_raw(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#""mode":"relay""#));

        let pool = get_raw(addr, "/pool").await;
        assert!(pool.starts_with("HTTP/1.1 200"));
        let pool = json_body(&pool);
        assert_eq!(pool["capacity"], 7);
        assert_eq!(pool["available"], 0);
        assert_eq!(pool["live_connectors"], 0);

        let sessions = get_raw(addr, "/sessions").await;
        assert!(sessions.starts_with("HTTP/1.1 200"));
        assert_eq!(json_body(&sessions), serde_json::json!([]));

        let metrics = get_raw(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("text/plain"));
    }

    #[tokio::test]
    async fn relay_endpoints_are_absent_in_agent_mode() {
        let addr = start(state(None)).await;
        assert!(get_raw(addr, "/pool").await.starts_with("HTTP/1.1 404"));
        assert!(get_raw(addr, "/sessions").await.starts_with("HTTP/1.1 404"));
        assert!(get_raw(addr, "/health").await.contains(r#""mode":"agent""#));
    }
}
