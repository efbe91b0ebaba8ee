use crate::render::render_product_html;
use afd_cache_core::{
    api_types::{CachedProduct, RefreshOutcome},
    office::{OfficeCode, PAYLOAD_PREFIX},
    refresh::Refresher,
};
use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::typed_header::TypedHeader;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, span, warn, Instrument, Level};

#[derive(Debug)]
pub struct AppError(StatusCode, anyhow::Error);
impl std::error::Error for AppError {}
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            error!(
                event = "app_error",
                status_code = %self.0,
                error = %self.1,
                error_debug = ?self.1,
            );
        }
        (self.0, self.1.to_string()).into_response()
    }
}
impl<E> From<(StatusCode, E)> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from((status_code, err): (StatusCode, E)) -> Self {
        Self(status_code, err.into())
    }
}
impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Status code: {} {}", self.0, self.1)?;
        Ok(())
    }
}

pub struct Server {
    refresher: Arc<Refresher>,
    refresh_token: Option<String>,
    refresh_interval: Option<Duration>,
    worker_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl Server {
    pub fn new(
        refresher: Arc<Refresher>,
        refresh_token: Option<String>,
        refresh_interval: Option<Duration>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            refresher,
            refresh_token,
            refresh_interval,
            worker_tracker: TaskTracker::new(),
            cancellation_token,
        }
    }

    /// Runs a full refresh batch now and then every `interval`, until cancelled.
    async fn refresh_worker(
        refresher: Arc<Refresher>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) {
        loop {
            let outcomes = tokio::select! {
                outcomes = refresher.run_refresh(None, false) => outcomes,
                _ = cancellation_token.cancelled() => break,
            };

            let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
            let updated = outcomes.iter().filter(|o| o.updated).count();
            info!(
                event = "scheduled_refresh_completed",
                offices = outcomes.len(),
                updated,
                failed,
                next_in_seconds = interval.as_secs(),
            );

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::debug!(event = "refresh_worker_terminated");
    }

    pub fn check_auth(
        &self,
        auth_header: Option<TypedHeader<headers::Authorization<headers::authorization::Bearer>>>,
    ) -> Result<(), AppError> {
        if let Some(expected) = &self.refresh_token {
            if let Some(TypedHeader(headers::Authorization(bearer))) = auth_header {
                if bearer.token() == expected {
                    return Ok(());
                }
            }
            Err((StatusCode::UNAUTHORIZED, anyhow!("Unauthorized.")))?
        } else {
            Ok(())
        }
    }

    pub async fn logging_middleware(req: Request, next: Next) -> impl IntoResponse {
        let start = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();
        let user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let span = span!(Level::INFO, "http_request", method = %method, uri = %uri);
        let response = next.run(req).instrument(span).await;
        let status = response.status();
        let duration_ms = start.elapsed().as_millis();

        if status.is_server_error() {
            error!(
                event = "request_failed",
                method = %method,
                uri = %uri,
                status = %status,
                duration_ms = %duration_ms,
                error_type = "server_error",
                user_agent = %user_agent,
                "Request failed with server error: {} {} - {}ms",
                method,
                uri,
                duration_ms
            );
        } else if status.is_client_error() {
            warn!(
                event = "request_failed",
                method = %method,
                uri = %uri,
                status = %status,
                duration_ms = %duration_ms,
                error_type = "client_error",
                user_agent = %user_agent,
                "Request failed with client error: {} {} - {}ms",
                method,
                uri,
                duration_ms
            );
        } else {
            info!(
                event = "request_completed",
                method = %method,
                uri = %uri,
                status = %status,
                duration_ms = %duration_ms,
                user_agent = %user_agent,
                "Request completed: {} {} - {}ms",
                method,
                uri,
                duration_ms
            );
        }

        response
    }

    pub async fn redact_error_middleware(req: Request, next: Next) -> impl IntoResponse {
        let resp = next.run(req).await;
        if resp.status().is_server_error() || resp.status().is_client_error() {
            // Copy over only the status code, not the response body.
            return resp.status().into_response();
        }
        resp
    }

    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ready", get(ready))
            .route("/offices", get(list_offices))
            .route("/afd/:office", get(get_afd_html))
            .route("/afd/:office/json", get(get_afd_json))
            .route("/refresh", post(refresh))
            .route("/debug/store", get(debug_store))
            .layer(middleware::from_fn(Self::logging_middleware))
            .with_state(self.clone())
    }

    pub async fn serve(self, listener: TcpListener, redact_errors: bool) -> Result<()> {
        let s = Arc::new(self);
        let token = s.cancellation_token.clone();

        if let Some(interval) = s.refresh_interval {
            s.worker_tracker.spawn(Self::refresh_worker(
                s.refresher.clone(),
                interval,
                token.clone(),
            ));
        }

        let routes = s.routes();
        let app = if redact_errors {
            routes.layer(middleware::from_fn(Self::redact_error_middleware))
        } else {
            routes
        };

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;

        s.worker_tracker.close();
        s.worker_tracker.wait().await;

        Ok(())
    }
}

fn parse_office(raw: &str) -> Result<OfficeCode, AppError> {
    OfficeCode::parse(raw).map_err(|e| AppError(StatusCode::BAD_REQUEST, e.into()))
}

async fn ready() -> Result<Json<Value>, AppError> {
    Ok(Json(json!({"ok": true})))
}

async fn list_offices(State(server_state): State<Arc<Server>>) -> Result<Json<Value>, AppError> {
    let offices = server_state
        .refresher
        .cache()
        .list_offices_with_payload()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "offices": offices })))
}

async fn load_product(server_state: &Server, office: &str) -> Result<CachedProduct, AppError> {
    let office = parse_office(office)?;
    server_state
        .refresher
        .cache()
        .get_payload(&office)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?
        .ok_or_else(|| {
            AppError(
                StatusCode::NOT_FOUND,
                anyhow!("No cached AFD for this office yet."),
            )
        })
}

async fn get_afd_html(
    State(server_state): State<Arc<Server>>,
    Path(office): Path<String>,
) -> Result<Html<String>, AppError> {
    let product = load_product(&server_state, &office).await?;
    Ok(Html(render_product_html(&product)))
}

async fn get_afd_json(
    State(server_state): State<Arc<Server>>,
    Path(office): Path<String>,
) -> Result<Json<CachedProduct>, AppError> {
    Ok(Json(load_product(&server_state, &office).await?))
}

#[derive(Deserialize, Default)]
struct RefreshParams {
    /// Comma-separated office codes. All configured offices when absent.
    offices: Option<String>,
    #[serde(default)]
    force: bool,
}

impl RefreshParams {
    fn subset(&self) -> Option<Vec<String>> {
        let subset: Vec<String> = self
            .offices
            .as_deref()?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        (!subset.is_empty()).then_some(subset)
    }
}

#[derive(Debug, serde::Serialize)]
struct RefreshResponse {
    ok: bool,
    results: Vec<RefreshOutcome>,
}

async fn refresh(
    auth_header: Option<TypedHeader<headers::Authorization<headers::authorization::Bearer>>>,
    State(server_state): State<Arc<Server>>,
    Query(params): Query<RefreshParams>,
) -> Result<Json<RefreshResponse>, AppError> {
    server_state.check_auth(auth_header)?;

    let subset = params.subset();
    if subset.is_none() && server_state.refresher.offices().is_empty() {
        return Err(AppError(
            StatusCode::BAD_REQUEST,
            anyhow!("No offices configured."),
        ));
    }

    let results = server_state
        .refresher
        .run_refresh(subset.as_deref(), params.force)
        .await;
    Ok(Json(RefreshResponse { ok: true, results }))
}

async fn debug_store(State(server_state): State<Arc<Server>>) -> Result<Json<Value>, AppError> {
    let store = server_state.refresher.cache().store();
    let count = store
        .list_keys(PAYLOAD_PREFIX)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?
        .len();
    Ok(Json(json!({ "mode": store.backend(), "count": count })))
}
