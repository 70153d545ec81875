use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::local;
use crate::config::{EVENT_CHANNEL_CAPACITY, SHUTDOWN_GRACE, Settings};
use crate::downloader::Executor;
use crate::error::QueueError;
use crate::progress::{BroadcastPublisher, CHANNEL};
use crate::queue::{Submission, TaskQueue};

pub struct AppState {
    pub queue: TaskQueue,
    pub events: BroadcastPublisher,
    /// Fires when the server stops; open event streams end with it.
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(queue: TaskQueue, events: BroadcastPublisher) -> Self {
        Self {
            queue,
            events,
            shutdown: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    task_id: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn handle_download(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<Submission>,
) -> Response {
    for (field, value) in [
        ("url", &submission.url),
        ("path", &submission.path),
        ("model_id", &submission.model_id),
    ] {
        if value.trim().is_empty() {
            return error_response(StatusCode::BAD_REQUEST, format!("{} is required", field));
        }
    }

    match state.queue.submit(submission).await {
        Ok(task_id) => Json(SubmitResponse { task_id }).into_response(),
        Err(err @ QueueError::DuplicateDestination(_)) => {
            error_response(StatusCode::CONFLICT, err)
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, err),
    }
}

async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    match state.queue.cancel(&task_id).await {
        Ok(()) => Json(MessageResponse {
            message: "Download cancelled".to_string(),
        })
        .into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err),
    }
}

/// Every progress event as one SSE message named `queue_update` whose data
/// is a JSON array holding that event.
async fn handle_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();

    let stream = BroadcastStream::new(rx).map(|msg| match msg {
        Ok(event) => {
            let data = serde_json::to_string(&[event]).unwrap_or_default();
            Ok(Event::default().event(CHANNEL).data(data))
        }
        Err(err) => {
            warn!("event subscriber lagged: {}", err);
            Ok(Event::default().comment("lagged"))
        }
    })
    .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn handle_tree(State(state): State<Arc<AppState>>) -> Response {
    let root = state.queue.storage_root().to_path_buf();
    match tokio::task::spawn_blocking(move || local::model_tree(&root)).await {
        Ok(tree) => Json(tree).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn handle_disk_usage(State(state): State<Arc<AppState>>) -> Response {
    let root = state.queue.storage_root().to_path_buf();
    match tokio::task::spawn_blocking(move || local::disk_usage(&root)).await {
        Ok(usage) => Json(usage).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn handle_root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let info = serde_json::json!({
        "name": "modella",
        "version": env!("CARGO_PKG_VERSION"),
        "active_tasks": state.queue.active().await,
        "endpoints": {
            "download": "POST /download",
            "cancel": "POST /api/download/cancel/{task_id}",
            "events": "GET /events",
            "tree": "GET /local-models/tree",
            "disk_usage": "GET /api/disk-usage"
        }
    });

    Json(info)
}

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/download", post(handle_download))
        .route("/api/download/cancel/{task_id}", post(handle_cancel))
        .route("/events", get(handle_events))
        .route("/local-models/tree", get(handle_tree))
        .route("/api/disk-usage", get(handle_disk_usage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn startup(
    settings: Settings,
    address: String,
    port: u16,
    workers: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let events = BroadcastPublisher::new(EVENT_CHANNEL_CAPACITY);
    let executor = Executor::with_catalogs(&settings.engine_config(), Arc::new(events.clone()))?;
    let queue = TaskQueue::new(Arc::new(executor), settings.storage_path.clone(), workers);
    let state = Arc::new(AppState::new(queue, events));

    let addr: SocketAddr = format!("{}:{}", address, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "listening on http://{} with {} workers, storage at {}",
        addr,
        workers,
        settings.storage_path.display()
    );

    serve_until(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}

/// Serve until `signal` resolves. Then new connections are refused, event
/// streams end, every task is cancelled and gets `SHUTDOWN_GRACE` to stop.
pub async fn serve_until<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stopping = Arc::clone(&state);
    axum::serve(listener, build_app(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            signal.await;
            info!(
                "shutting down with {} active tasks",
                stopping.queue.active().await
            );
            stopping.shutdown.cancel();
            stopping.queue.cancel_all().await;
        })
        .await?;

    state.queue.drain(SHUTDOWN_GRACE).await;
    info!("server stopped");
    Ok(())
}
