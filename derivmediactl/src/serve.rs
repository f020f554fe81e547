//! HTTP front of the delivery router.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use derivmedia_core::{
    file_headers, list_derivatives, open_body, ByteRange, DeliveryOutcome, DeliveryRequest,
    DeliveryRouter, DerivativeFile, Services,
};

#[derive(Clone)]
struct ServeState {
    services: Services,
    router: Arc<DeliveryRouter>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveryQuery {
    #[serde(default)]
    force: Option<String>,
    #[serde(default)]
    prepare: Option<String>,
}

fn truthy(value: Option<&str>) -> bool {
    matches!(value, Some(value) if !value.is_empty() && value != "0" && value != "false")
}

pub fn build_router(services: Services) -> Router {
    let state = ServeState {
        router: Arc::new(services.router()),
        services,
    };
    Router::new()
        .route("/derivative/{id}/{kind}", get(derivative))
        .route("/derivatives/{id}", get(derivatives))
        .with_state(state)
}

pub async fn serve(services: Services, bind: &str) -> std::io::Result<()> {
    let app = build_router(services);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "delivery listening");
    axum::serve(listener, app).await
}

async fn derivative(
    State(state): State<ServeState>,
    Path((id, kind)): Path<(i64, String)>,
    Query(query): Query<DeliveryQuery>,
    headers: HeaderMap,
) -> Response {
    let settings = match state.services.derivative_settings() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "unable to load settings");
            return outcome_response(&DeliveryOutcome::Internal);
        }
    };
    let request = DeliveryRequest {
        id,
        force: truthy(query.force.as_deref()),
        prepare: truthy(query.prepare.as_deref()),
    };
    match state.router.route(&settings, &kind, request).await {
        DeliveryOutcome::File(file) => {
            let range = headers
                .get(header::RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| ByteRange::parse(value, file.size));
            file_response(
                &file,
                range,
                state.services.config.delivery.cache_max_age_days,
            )
            .await
        }
        outcome => outcome_response(&outcome),
    }
}

async fn file_response(file: &DerivativeFile, range: Option<ByteRange>, cache_days: u32) -> Response {
    let body = match open_body(&file.path, range).await {
        Ok(body) => body,
        Err(err) => {
            error!(path = %file.path.display(), error = %err, "unable to open derivative");
            return outcome_response(&DeliveryOutcome::Internal);
        }
    };
    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder().status(status);
    for (name, value) in file_headers(file, range, cache_days) {
        builder = builder.header(name, value);
    }
    match builder.body(Body::from_stream(ReaderStream::new(body))) {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "unable to build response");
            outcome_response(&DeliveryOutcome::Internal)
        }
    }
}

fn outcome_response(outcome: &DeliveryOutcome) -> Response {
    let status = StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.body())).into_response()
}

async fn derivatives(State(state): State<ServeState>, Path(id): Path<i64>) -> Response {
    let listing = match state.services.derivative_settings() {
        Ok(settings) => {
            list_derivatives(
                state.services.repository.as_ref(),
                state.services.store.as_ref(),
                &state.services.items,
                &settings,
                id,
            )
            .await
        }
        Err(err) => {
            error!(error = %err, "unable to load settings");
            return outcome_response(&DeliveryOutcome::Internal);
        }
    };
    match listing {
        Ok(Some(listing)) => Json(json!({"status": "success", "data": listing})).into_response(),
        Ok(None) => outcome_response(&DeliveryOutcome::NotFound),
        Err(err) => {
            error!(id, error = %err, "unable to list derivatives");
            outcome_response(&DeliveryOutcome::Internal)
        }
    }
}
