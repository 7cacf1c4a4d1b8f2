//! REST surface over the staged object store.
//!
//! Each path is served by a single method-dispatching handler, mirroring the
//! store's subresource layout, so that 405 responses can carry the problem
//! envelope with an `allow` hint instead of an empty framework default.
//! Upload bodies stream straight into the store; blob reads go through the
//! filesystem content-serving primitive, which supplies Range/`If-Range` and
//! conditional semantics.

use std::io;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Json, Router};
use futures::TryStreamExt;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};
use tower::util::ServiceExt;
use tower_http::services::ServeFile;
use tracing::warn;

use tandem_store::FsStore;

use crate::problem::Problem;
use crate::request_id::RequestId;

/// Shared state for the object routes.
#[derive(Clone)]
pub struct ObjectsState {
    pub store: FsStore,
    /// Public base URL used to build upload/manifest URLs, e.g.
    /// `http://localhost:1234`.
    pub base_url: String,
}

/// Routes for `/objects` and `/objects/{id}/{blob|manifest|commit}`.
pub fn router(state: ObjectsState) -> Router {
    Router::new()
        .route("/objects", any(objects_root))
        .route("/objects/:id", any(missing_subresource))
        .route("/objects/:id/blob", any(blob))
        .route("/objects/:id/manifest", any(manifest))
        .route("/objects/:id/commit", any(commit))
        .route("/objects/:id/:sub", any(unknown_subresource))
        .with_state(state)
}

async fn objects_root(
    State(st): State<ObjectsState>,
    Extension(rid): Extension<RequestId>,
    req: Request,
) -> Response {
    if req.method() != Method::POST {
        return method_not_allowed(&rid, "POST");
    }
    match st.store.create().await {
        Ok(id) => Json(json!({
            "objectId": id,
            "uploadUrl": format!("{}/objects/{}/blob", st.base_url, id),
            "manifestUrl": format!("{}/objects/{}/manifest", st.base_url, id),
        }))
        .into_response(),
        Err(e) => Problem::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "NC_STORE_CREATE",
            "Create failed",
            rid.as_str(),
        )
        .detail(e.to_string())
        .into_response(),
    }
}

async fn missing_subresource(Extension(rid): Extension<RequestId>) -> Response {
    Problem::new(
        StatusCode::BAD_REQUEST,
        "NC_BAD_REQUEST",
        "Missing subresource",
        rid.as_str(),
    )
    .into_response()
}

async fn unknown_subresource(
    Extension(rid): Extension<RequestId>,
    Path((_id, sub)): Path<(String, String)>,
) -> Response {
    Problem::new(
        StatusCode::NOT_FOUND,
        "NC_NOT_FOUND",
        "Unknown subresource",
        rid.as_str(),
    )
    .meta("sub", sub)
    .into_response()
}

async fn blob(
    State(st): State<ObjectsState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    match req.method().as_str() {
        "PUT" => {
            // Size limits are the upstream proxy's job.
            let reader = StreamReader::new(
                req.into_body().into_data_stream().map_err(io::Error::other),
            );
            match st.store.put_blob(&id, reader).await {
                Ok((_size, etag)) => match HeaderValue::from_str(&etag) {
                    Ok(value) => {
                        (StatusCode::NO_CONTENT, [(header::ETAG, value)]).into_response()
                    }
                    Err(_) => StatusCode::NO_CONTENT.into_response(),
                },
                Err(e) => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "NC_UPLOAD_FAILED",
                    "Upload failed",
                    rid.as_str(),
                )
                .detail(e.to_string())
                .meta("objectId", id)
                .into_response(),
            }
        }
        "GET" | "HEAD" => {
            let meta = match st.store.stat_blob(&id).await {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => {
                    return Problem::new(
                        StatusCode::NOT_FOUND,
                        "NC_NOT_FOUND",
                        "Object not found",
                        rid.as_str(),
                    )
                    .meta("objectId", id)
                    .into_response();
                }
                Err(e) => {
                    return Problem::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "NC_STORE_STAT",
                        "Stat failed",
                        rid.as_str(),
                    )
                    .detail(e.to_string())
                    .meta("objectId", id)
                    .into_response();
                }
            };
            if !meta.committed {
                return Problem::new(
                    StatusCode::CONFLICT,
                    "NC_NOT_COMMITTED",
                    "Blob not committed",
                    rid.as_str(),
                )
                .meta("objectId", id)
                .into_response();
            }

            let etag = HeaderValue::from_str(&meta.etag).ok();
            if req.method() == Method::HEAD {
                let mut res = StatusCode::NO_CONTENT.into_response();
                let headers = res.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                if let Some(etag) = etag {
                    headers.insert(header::ETAG, etag);
                }
                return res;
            }

            // Range, If-Range and conditional handling come from the
            // file-serving primitive; we only layer the entity tag on top.
            match ServeFile::new(st.store.blob_path(&id)).oneshot(req).await {
                Ok(res) => {
                    let mut res = res.map(Body::new);
                    let headers = res.headers_mut();
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    );
                    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                    if let Some(etag) = etag {
                        headers.insert(header::ETAG, etag);
                    }
                    res
                }
                Err(e) => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "NC_STORE_READ",
                    "Open failed",
                    rid.as_str(),
                )
                .detail(e.to_string())
                .meta("objectId", id)
                .into_response(),
            }
        }
        _ => method_not_allowed(&rid, "PUT,GET,HEAD"),
    }
}

async fn manifest(
    State(st): State<ObjectsState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    match req.method().as_str() {
        "PUT" => {
            let reader = StreamReader::new(
                req.into_body().into_data_stream().map_err(io::Error::other),
            );
            match st.store.put_manifest(&id, reader).await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "NC_MANIFEST_WRITE",
                    "Manifest write failed",
                    rid.as_str(),
                )
                .detail(e.to_string())
                .meta("objectId", id)
                .into_response(),
            }
        }
        "GET" => match st.store.open_manifest(&id).await {
            Ok(file) => {
                let mut res = Body::from_stream(ReaderStream::new(file)).into_response();
                res.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                res
            }
            Err(e) => {
                let status = if e.is_not_found() {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                Problem::new(status, "NC_NOT_FOUND", "Manifest not found", rid.as_str())
                    .detail(e.to_string())
                    .meta("objectId", id)
                    .into_response()
            }
        },
        _ => method_not_allowed(&rid, "PUT,GET"),
    }
}

async fn commit(
    State(st): State<ObjectsState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    if req.method() != Method::POST {
        return method_not_allowed(&rid, "POST");
    }
    match st.store.commit(&id).await {
        Ok(meta) => Json(meta).into_response(),
        Err(e) => {
            // Missing staged files read as 404; everything else is on us.
            let status = if e.is_not_found() {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            warn!(object = %id, error = %e, "commit failed");
            Problem::new(status, "NC_COMMIT_FAILED", "Commit failed", rid.as_str())
                .detail(e.to_string())
                .meta("objectId", id)
                .into_response()
        }
    }
}

fn method_not_allowed(rid: &RequestId, allow: &str) -> Response {
    Problem::new(
        StatusCode::METHOD_NOT_ALLOWED,
        "NC_METHOD_NOT_ALLOWED",
        "Method not allowed",
        rid.as_str(),
    )
    .meta("allow", allow)
    .into_response()
}
