//! HTTP API over the token store.
//!
//! | Method | Path             | Store call              |
//! |--------|------------------|-------------------------|
//! | GET    | `/{bucket}/{key}` | `query`                |
//! | POST   | `/{bucket}/{key}` | `adjust(count)`, form field `count` in `[-1, 1]`, default 1 |
//! | DELETE | `/{bucket}/{key}` | `reset`                |
//! | DELETE | `/clean`          | `clean` over all buckets |
//!
//! A POST without a `Content-Type` is a plain take. Any content type other
//! than `application/x-www-form-urlencoded` is rejected.
//!
//! Errors are returned as a plain-text message with a non-200 status.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::FormRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Form, Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cli::ServerConfig;
use crate::error::Error;
use crate::{LimitResult, TokenStore};

/// Smallest `count` accepted by the POST route.
pub const MIN_COUNT: i64 = -1;
/// Largest `count` accepted by the POST route.
pub const MAX_COUNT: i64 = 1;

#[derive(Clone)]
struct AppState {
    store: Arc<TokenStore>,
}

#[derive(Debug, Deserialize)]
struct AdjustForm {
    count: Option<i64>,
}

/// Request failure as seen by an HTTP client.
#[derive(Debug)]
pub enum ApiError {
    /// The request was malformed or named an unknown bucket.
    BadRequest(String),
    /// The store failed while serving the request.
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        if e.is_client_error() {
            Self::BadRequest(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

/// Builds the API router around `store`.
pub fn router(store: Arc<TokenStore>) -> Router {
    Router::new()
        .route("/clean", delete(clean))
        .route("/:bucket/:key", get(query).post(adjust).delete(reset))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { store })
}

/// Binds `host:port` and serves the API until `shutdown` resolves.
pub async fn serve(
    config: &ServerConfig,
    store: Arc<TokenStore>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "Server running at: http://{addr}");

    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn check_params(store: &TokenStore, bucket: &str, key: &str) -> Result<(), ApiError> {
    if !store.has_bucket(bucket) {
        return Err(Error::UnknownBucket(bucket.to_owned()).into());
    }
    if key.is_empty() {
        return Err(ApiError::BadRequest("key must be a non-empty string".into()));
    }
    Ok(())
}

async fn query(
    State(app): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<LimitResult>, ApiError> {
    check_params(&app.store, &bucket, &key)?;
    let res = app.store.query(&bucket, &key)?;
    info!(%bucket, %key, ?res, "query");
    Ok(Json(res))
}

async fn adjust(
    State(app): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    form: Result<Form<AdjustForm>, FormRejection>,
) -> Result<Json<LimitResult>, ApiError> {
    check_params(&app.store, &bucket, &key)?;

    let count = match form {
        Ok(Form(AdjustForm { count })) => count.unwrap_or(1),
        // No content type at all: plain take.
        Err(FormRejection::InvalidFormContentType(_))
            if !headers.contains_key(header::CONTENT_TYPE) =>
        {
            1
        }
        Err(rejection) => return Err(ApiError::BadRequest(rejection.body_text())),
    };
    if !(MIN_COUNT..=MAX_COUNT).contains(&count) {
        return Err(ApiError::BadRequest(format!(
            "count must be between {MIN_COUNT} and {MAX_COUNT}"
        )));
    }

    let res = app.store.adjust(&bucket, &key, count)?;
    info!(%bucket, %key, count, ?res, "adjust");
    Ok(Json(res))
}

async fn reset(
    State(app): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<bool>, ApiError> {
    check_params(&app.store, &bucket, &key)?;
    let res = app.store.reset(&bucket, &key)?;
    info!(%bucket, %key, res, "reset");
    Ok(Json(res))
}

async fn clean(State(app): State<AppState>) -> Result<Json<bool>, ApiError> {
    info!("clean");
    match app.store.clean(None, &CancellationToken::new()).await {
        Ok(remaining) => {
            info!(?remaining, "clean finished");
            Ok(Json(true))
        }
        Err(e) => {
            error!(error = %e, "clean failed");
            Err(e.into())
        }
    }
}
