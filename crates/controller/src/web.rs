use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tracing::info;

use crate::state::SharedState;

const INDEX_HTML: &str = include_str!("ui/index.html");

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

#[cfg(not(feature = "tls"))]
pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

/// HTTPS using the PEM pair named by `TLS_CERT` and `TLS_KEY`.
#[cfg(feature = "tls")]
pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let cert = std::env::var("TLS_CERT").context("TLS_CERT not set")?;
    let key = std::env::var("TLS_KEY").context("TLS_KEY not set")?;
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .with_context(|| format!("failed to load tls pair {cert} / {key}"))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("web ui listening on https://{addr}");

    axum_server::bind_rustls(addr, tls)
        .serve(router(state).into_make_service())
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
