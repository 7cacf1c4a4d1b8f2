//! Legacy pairing routes.
//!
//! A small process-wide key/blob drop the relay core does not depend on:
//! one public key per appID plus a drainable list of ciphertext blobs.
//! Everything lives in memory and vanishes on restart.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;

use crate::problem::Problem;
use crate::request_id::RequestId;

/// In-memory pairing state.
#[derive(Debug, Default)]
pub struct PairingService {
    inner: RwLock<PairingState>,
}

#[derive(Debug, Default)]
struct PairingState {
    pub_keys: HashMap<String, String>,
    blobs: HashMap<String, Vec<String>>,
}

impl PairingService {
    pub fn register_key(&self, app_id: &str, public_key: String) {
        self.inner.write().pub_keys.insert(app_id.to_owned(), public_key);
    }

    pub fn key(&self, app_id: &str) -> Option<String> {
        self.inner.read().pub_keys.get(app_id).cloned()
    }

    pub fn push_blob(&self, app_id: &str, blob: String) {
        self.inner
            .write()
            .blobs
            .entry(app_id.to_owned())
            .or_default()
            .push(blob);
    }

    /// Hand back and clear every queued blob for the appID.
    pub fn pull_blobs(&self, app_id: &str) -> Vec<String> {
        self.inner
            .write()
            .blobs
            .remove(app_id)
            .unwrap_or_default()
    }
}

/// Routes, mounted under `/api` by the daemon.
pub fn router(service: Arc<PairingService>) -> Router {
    Router::new()
        .route("/key", post(register_key))
        .route("/pub", get(fetch_key))
        .route("/push", post(push_blob))
        .route("/pull", get(pull_blobs))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
struct KeyBody {
    #[serde(rename = "appID")]
    app_id: String,
    #[serde(rename = "pub")]
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct BlobBody {
    #[serde(rename = "appID")]
    app_id: String,
    blob: String,
}

#[derive(Debug, Deserialize)]
struct AppQuery {
    #[serde(rename = "appID")]
    app_id: String,
}

async fn register_key(
    State(service): State<Arc<PairingService>>,
    Json(body): Json<KeyBody>,
) -> StatusCode {
    service.register_key(&body.app_id, body.public_key);
    StatusCode::NO_CONTENT
}

async fn fetch_key(
    State(service): State<Arc<PairingService>>,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<AppQuery>,
) -> Response {
    match service.key(&query.app_id) {
        Some(public_key) => Json(json!({ "pub": public_key })).into_response(),
        None => Problem::new(
            StatusCode::NOT_FOUND,
            "NC_NOT_FOUND",
            "No key for appID",
            rid.as_str(),
        )
        .into_response(),
    }
}

async fn push_blob(
    State(service): State<Arc<PairingService>>,
    Json(body): Json<BlobBody>,
) -> StatusCode {
    service.push_blob(&body.app_id, body.blob);
    StatusCode::NO_CONTENT
}

async fn pull_blobs(
    State(service): State<Arc<PairingService>>,
    Query(query): Query<AppQuery>,
) -> Response {
    Json(json!({ "blobs": service.pull_blobs(&query.app_id) })).into_response()
}
