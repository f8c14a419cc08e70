pub mod handlers;

use crate::chain::consumer::ForcedRollback;
use crate::chain::FetchBlockClient;
use crate::error::StorageError;
use crate::health::Health;
use crate::info;
use crate::logger::Component;
use crate::registry::PatternRegistry;
use crate::storage::Storage;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use rusqlite::Connection;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{self, CorsLayer};

pub const MOST_RECENT_CHECKPOINT_HEADER: &str = "X-Most-Recent-Checkpoint";
pub const BLOCK_HEADER_HASH_HEADER: &str = "X-Block-Header-Hash";

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub registry: PatternRegistry,
    pub health: Arc<Health>,
    pub forced: mpsc::Sender<ForcedRollback>,
    pub fetch: Arc<dyn FetchBlockClient>,
    pub concurrency: Arc<Semaphore>,
}

pub fn build_router(state: AppState) -> Router<()> {
    let cors = CorsLayer::new().allow_origin(cors::Any).allow_methods(cors::Any).allow_headers(cors::Any);
    Router::new()
        .route("/health", get(handlers::health))
        .route("/checkpoints", get(handlers::list_checkpoints))
        .route("/checkpoints/{slot}", get(handlers::checkpoint_by_slot))
        .route("/matches", get(handlers::get_all_matches))
        .route("/matches/{pattern}", get(handlers::get_matches_1).delete(handlers::delete_matches_1))
        .route("/matches/{prefix}/{suffix}", get(handlers::get_matches_2).delete(handlers::delete_matches_2))
        .route("/datums/{hash}", get(handlers::get_datum))
        .route("/scripts/{hash}", get(handlers::get_script))
        .route("/metadata/{slot}", get(handlers::get_metadata))
        .route("/patterns", get(handlers::list_patterns))
        .route(
            "/patterns/{pattern}",
            get(handlers::list_patterns_1).put(handlers::put_pattern_1).delete(handlers::delete_pattern_1),
        )
        .route(
            "/patterns/{prefix}/{suffix}",
            get(handlers::list_patterns_2).put(handlers::put_pattern_2).delete(handlers::delete_pattern_2),
        )
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::method_not_allowed)
        .layer(middleware::from_fn(tracer))
        .layer(middleware::from_fn_with_state(state.clone(), checkpoint_header))
        .layer(middleware::from_fn_with_state(state.clone(), concurrency_gate))
        .layer(cors)
        .with_state(state)
}

/// Records `{method, path, status}` for every request.
async fn tracer(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!(Component::Http, "{} {} {}", method, path, response.status().as_u16());
    response
}

/// Every response advertises the most recent checkpoint the index holds.
async fn checkpoint_header(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let checkpoint = state.health.most_recent_checkpoint();
    let mut response = next.run(request).await;
    if let Some(checkpoint) = checkpoint {
        if let Ok(value) = checkpoint.slot_no.to_string().parse() {
            response.headers_mut().insert(MOST_RECENT_CHECKPOINT_HEADER, value);
        }
    }
    response
}

/// Bounds the number of requests in flight to `--max-concurrency`.
async fn concurrency_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let _permit = state.concurrency.acquire().await.expect("semaphore is never closed");
    next.run(request).await
}

/// Newline-delimited JSON out of a snapshot read: the producer side runs on
/// a blocking thread inside one deferred transaction and yields encoded
/// lines; the body stream applies backpressure through the channel.
pub fn ndjson_response<F>(storage: &Arc<Storage>, produce: F) -> Response
where
    F: FnOnce(&Connection, &mut dyn FnMut(Vec<u8>) -> bool) -> Result<(), StorageError> + Send + 'static,
{
    let rows = storage.spawn_stream_read(64, produce);
    let body = Body::from_stream(ReceiverStream::new(rows).map(Ok::<_, Infallible>));
    ([(http::header::CONTENT_TYPE, "application/json")], body).into_response()
}

pub fn json_line<T: serde::Serialize>(value: &T) -> Vec<u8> {
    let mut line = serde_json::to_vec(value).expect("serializable response row");
    line.push(b'\n');
    line
}

pub async fn serve(state: AppState, address: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    let router = build_router(state);
    info!(Component::Http, "Server listening on {}", address);
    match TcpListener::bind(address).await {
        Err(e) => {
            crate::error!(Component::Http, "Cannot bind {}: {}", address, e);
        }
        Ok(listener) => {
            let graceful = async move {
                let _ = shutdown.changed().await;
            };
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(graceful).await {
                crate::error!(Component::Http, "Server failed: {}", e);
            }
        }
    }
}
