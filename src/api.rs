use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::{Html, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use crate::error::ApiError;
use crate::models::{CheckKind, CheckResult};
use crate::report::Reporter;
use crate::store::StatusCache;

#[derive(Clone)]
pub struct AppState {
    pub cache: StatusCache,
    pub reporter: Arc<dyn Reporter>,
    pub index_html: Arc<str>,
}

#[derive(Debug, Deserialize)]
pub struct ServerParams {
    ip: Option<String>,
    port: Option<String>,
}

impl ServerParams {
    fn address(&self) -> Result<String, ApiError> {
        let ip = self
            .ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .ok_or(ApiError::MissingAddress)?;
        match self.port.as_deref().map(str::trim).filter(|port| !port.is_empty()) {
            Some(port) => Ok(format!("{}:{}", ip, port)),
            None => Ok(ip.to_string()),
        }
    }
}

/// Counts every request. A store failure is reported and the request is
/// served anyway.
async fn count_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Err(e) = state.cache.bump_requests().await {
        state.reporter.report("incrementing request counter", &e);
    }
    next.run(request).await
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(state.index_html.to_string())
}

async fn hi() -> &'static str {
    "Hello :3"
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let stats = match state.cache.requests().await {
        Ok(stats) => stats,
        Err(e) => {
            state.reporter.report("reading request counter", &e);
            0
        }
    };

    Json(json!({
        "stats": stats,
        "time": Utc::now().timestamp_nanos_opt().unwrap_or_default(),
    }))
}

async fn server_status(
    State(state): State<AppState>,
    Query(params): Query<ServerParams>,
) -> Result<Json<Value>, ApiError> {
    cached_response(&state, CheckKind::Ping, &params).await
}

async fn server_query(
    State(state): State<AppState>,
    Query(params): Query<ServerParams>,
) -> Result<Json<Value>, ApiError> {
    cached_response(&state, CheckKind::Query, &params).await
}

async fn cached_response(
    state: &AppState,
    kind: CheckKind,
    params: &ServerParams,
) -> Result<Json<Value>, ApiError> {
    let address = params.address()?;
    match state.cache.get_result(kind, &address).await {
        Ok(Some(result)) => Ok(Json(render_result(result))),
        Ok(None) => Ok(Json(json!({ "address": address, "status": "unknown" }))),
        Err(e) => {
            state
                .reporter
                .report(&format!("reading {} result for {}", kind, address), &e);
            Err(e.into())
        }
    }
}

/// Flattens an object payload into the response; anything else goes under
/// `payload`. The bookkeeping fields always win.
fn render_result(result: CheckResult) -> Value {
    let mut body = match result.payload {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".into(), other);
            map
        }
    };
    body.insert("address".into(), Value::String(result.address));
    body.insert("status".into(), json!(result.status));
    body.insert("last_updated".into(), json!(result.timestamp.timestamp()));
    if let Some(error) = result.error {
        body.insert("error".into(), Value::String(error));
        body.insert("fatal".into(), Value::Bool(result.fatal));
    }
    Value::Object(body)
}

pub fn create_router(state: AppState, static_files: &str, cache_max_age_secs: u64) -> Router {
    let cache_control = HeaderValue::from_str(&format!(
        "max-age={0}, public, s-maxage={0}",
        cache_max_age_secs
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("max-age=300, public, s-maxage=300"));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/", get(index))
        .route("/hi", get(hi))
        .route("/stats", get(stats))
        .route("/server/status", get(server_status))
        .route("/minecraft/1.3/server/status", get(server_status))
        .route("/server/query", get(server_query))
        .route("/minecraft/1.3/server/query", get(server_query))
        .nest_service("/scripts", ServeDir::new(static_files))
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(header::CACHE_CONTROL, cache_control))
        .layer(middleware::from_fn_with_state(state.clone(), count_request))
        .with_state(state)
}

pub async fn start_server(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckStatus;

    #[test]
    fn address_joins_optional_port() {
        let params = ServerParams {
            ip: Some("play.example.com".into()),
            port: Some("25570".into()),
        };
        assert_eq!(params.address().unwrap(), "play.example.com:25570");

        let params = ServerParams {
            ip: Some("  ".into()),
            port: None,
        };
        assert!(matches!(params.address(), Err(ApiError::MissingAddress)));
    }

    #[test]
    fn rendered_result_keeps_payload_and_status() {
        let result = CheckResult::success(
            "play.example.com",
            CheckKind::Ping,
            json!({ "online": true, "status": "spoofed" }),
        );
        let body = render_result(result);
        assert_eq!(body["online"], true);
        assert_eq!(body["status"], json!(CheckStatus::Success));
        assert!(body.get("error").is_none());
    }

    #[test]
    fn rendered_failure_carries_error() {
        let result = CheckResult::failure("a.example", CheckKind::Query, "dial: i/o timeout".into(), false);
        let body = render_result(result);
        assert_eq!(body["status"], "failure");
        assert_eq!(body["error"], "dial: i/o timeout");
        assert_eq!(body["fatal"], false);
    }
}
