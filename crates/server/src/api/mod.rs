//! Document store over HTTP, used by the control panel and scene pages.
//!
//! `GET /_db/:id`, `PUT /_db/:id` and a websocket change feed at
//! `/_db/_changes` that streams every committed write as a `ChangeEvent`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use shared::{
    domain::Document,
    error::{ApiError, ErrorCode},
    protocol::PutResponse,
};
use storage::{ChangeFeed, StoreError};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, warn};

use crate::app_state::ControlState;

pub(crate) const MAX_DOCUMENT_BYTES: usize = 1024 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// Store routes bound to `control`, mergeable into a router of any state.
pub(crate) fn routes<S>(control: ControlState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/_db/_changes", get(changes_ws))
        .route("/_db/:id", get(get_document).put(put_document))
        .layer(RequestBodyLimitLayer::new(MAX_DOCUMENT_BYTES))
        .with_state(control)
}

async fn get_document(
    State(control): State<ControlState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Document>> {
    match control.store.get(&id).await.map_err(store_error)? {
        Some(doc) => Ok(Json(doc)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(
                ErrorCode::NotFound,
                format!("document '{id}' not found"),
            )),
        )),
    }
}

/// A body without `_id` takes the id from the path.
async fn put_document(
    State(control): State<ControlState>,
    Path(id): Path<String>,
    Json(mut body): Json<Map<String, Value>>,
) -> ApiResult<(StatusCode, Json<PutResponse>)> {
    let body_id = body
        .entry("_id")
        .or_insert_with(|| Value::String(id.clone()));
    if body_id.as_str() != Some(id.as_str()) {
        return Err(validation(format!(
            "body _id does not match path id '{id}'"
        )));
    }

    let doc: Document =
        serde_json::from_value(Value::Object(body)).map_err(|e| validation(e.to_string()))?;
    let rev = control.store.put(doc).await.map_err(store_error)?;
    debug!(%id, %rev, "document written over http");

    Ok((
        StatusCode::CREATED,
        Json(PutResponse { ok: true, id, rev }),
    ))
}

async fn changes_ws(
    ws: WebSocketUpgrade,
    State(control): State<ControlState>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing committed after the handshake is missed.
    let feed = control.store.subscribe();
    ws.on_upgrade(move |socket| stream_changes(feed, socket))
}

async fn stream_changes(feed: ChangeFeed, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut changes = BroadcastStream::new(feed.into_inner());

    let send_task = tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            let change = match change {
                Ok(change) => change,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change feed websocket fell behind");
                    continue;
                }
            };
            let text = match serde_json::to_string(&change) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

fn store_error(err: StoreError) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match &err {
        StoreError::Conflict { .. } => (StatusCode::CONFLICT, ErrorCode::Conflict),
        StoreError::InvalidDocument(_) => (StatusCode::BAD_REQUEST, ErrorCode::Validation),
        StoreError::Database(_) | StoreError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal)
        }
    };
    (status, Json(ApiError::new(code, err.to_string())))
}

fn validation(message: String) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
