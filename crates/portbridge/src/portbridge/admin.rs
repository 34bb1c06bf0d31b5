use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::portbridge::{
    agent::AgentEndpoint,
    telemetry,
    tunnel::{
        handle::TunnelDescription,
        provider::{ProviderError, TunnelProvider, TunnelRequest},
        supervisor::StreamSupervisor,
    },
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub supervisor: Arc<StreamSupervisor>,
    pub provider: Arc<TunnelProvider>,
    /// Where `POST /connect` points the supervisor when no port is given.
    pub agent: AgentEndpoint,
    pub config_path: PathBuf,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/config", get(config))
        .route("/tunnels", get(list_tunnels).post(open_tunnel))
        .route("/tunnels/{port}", axum::routing::delete(close_tunnel))
        .route("/tunnels/{port}/url", get(tunnel_url))
        .route("/resolve", get(resolve_uri))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn status(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.supervisor.status()))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}

async fn list_tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.provider.tunnels()))
}

#[derive(Debug, Serialize)]
struct TunnelView {
    #[serde(flatten)]
    tunnel: TunnelDescription,
    /// Set for hosts that cannot be tunneled; the handle was never live.
    closed: bool,
}

async fn open_tunnel(
    State(st): State<Arc<AdminState>>,
    Json(req): Json<TunnelRequest>,
) -> Response {
    match st.provider.request(req).await {
        Ok(h) => (
            StatusCode::OK,
            Json(TunnelView {
                tunnel: h.describe(),
                closed: h.is_disposed(),
            }),
        )
            .into_response(),
        Err(err @ ProviderError::NotConnected) => {
            error(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        Err(err) => error(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

async fn close_tunnel(State(st): State<Arc<AdminState>>, Path(port): Path<u16>) -> Response {
    if st.provider.close(port).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error(StatusCode::NOT_FOUND, format!("no tunnel for port {port}"))
    }
}

#[derive(Debug, Serialize)]
struct UrlResponse {
    url: String,
}

async fn tunnel_url(State(st): State<Arc<AdminState>>, Path(port): Path<u16>) -> Response {
    match st.provider.local_url(port) {
        Some(url) => (StatusCode::OK, Json(UrlResponse { url })).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no tunnel for port {port}")),
    }
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    uri: String,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    uri: String,
}

async fn resolve_uri(
    State(st): State<Arc<AdminState>>,
    Query(q): Query<ResolveQuery>,
) -> impl IntoResponse {
    let uri = st.provider.resolve_external_uri(&q.uri);
    (StatusCode::OK, Json(ResolveResponse { uri }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectRequest {
    port: Option<u16>,
}

async fn connect(State(st): State<Arc<AdminState>>, body: Bytes) -> Response {
    let req: ConnectRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ConnectRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return error(StatusCode::BAD_REQUEST, format!("admin: bad body: {err}")),
        }
    };

    let endpoint = match req.port {
        Some(0) => return error(StatusCode::BAD_REQUEST, "admin: port must be non-zero"),
        Some(port) => AgentEndpoint::new(st.agent.host.clone(), port),
        None => st.agent.clone(),
    };
    tracing::info!(endpoint = %endpoint, "admin: reconnect requested");
    st.supervisor.start(endpoint).await;
    (StatusCode::OK, Json(st.supervisor.status())).into_response()
}

async fn disconnect(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    tracing::info!("admin: disconnect requested");
    st.supervisor.stop().await;
    (StatusCode::OK, Json(st.supervisor.status()))
}
