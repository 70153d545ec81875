//! Fixtures shared by the unit tests: an in-process range-aware file server
//! with switches for misbehaving, a Civitai-shaped catalog, and a catalog
//! oracle with a fixed answer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{StreamExt, stream};
use tokio::net::TcpListener;

use crate::catalog::{ExpectedHash, HashOracle, Source};
use crate::downloader::hasher::{HashAlgorithm, IncrementalHasher};
use crate::error::DownloadError;

pub fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = IncrementalHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

pub struct FileServerOptions {
    pub body: Vec<u8>,
    pub honor_ranges: bool,
    /// Delay before answering the first request only.
    pub stall_first: Option<Duration>,
    /// First response sends this many bytes, then goes silent for the delay.
    pub stall_after: Option<(usize, Duration)>,
    /// First response sends this many bytes, then drops the connection.
    pub abort_after: Option<usize>,
    /// Ranged requests get a 206 whose `Content-Range` starts at 0.
    pub wrong_content_range: bool,
    /// Stream the body chunked, without `Content-Length`.
    pub omit_length: bool,
}

impl FileServerOptions {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            honor_ranges: true,
            stall_first: None,
            stall_after: None,
            abort_after: None,
            wrong_content_range: false,
            omit_length: false,
        }
    }
}

pub struct FileServerState {
    options: FileServerOptions,
    requests: AtomicUsize,
    ranges: Mutex<Vec<Option<String>>>,
}

impl FileServerState {
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// `Range` header of every request received, in order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }
}

async fn serve_file(State(state): State<Arc<FileServerState>>, req: Request) -> Response {
    let n = state.requests.fetch_add(1, Ordering::SeqCst);
    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    state.ranges.lock().unwrap().push(range.clone());

    if n == 0 {
        if let Some(delay) = state.options.stall_first {
            tokio::time::sleep(delay).await;
        }
    }

    let options = &state.options;
    let body = &options.body;
    let total = body.len() as u64;
    let start = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split('-').next())
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|_| options.honor_ranges);

    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    let mut payload = body.clone();
    if let Some(start) = start {
        if start >= total {
            headers.insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", total).parse().unwrap(),
            );
            return (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response();
        }
        status = StatusCode::PARTIAL_CONTENT;
        let first = if options.wrong_content_range { 0 } else { start };
        payload = body[first as usize..].to_vec();
        headers.insert(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", first, total - 1, total)
                .parse()
                .unwrap(),
        );
    }
    if !options.omit_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(payload.len()));
    }

    (status, headers, response_body(options, n == 0, payload)).into_response()
}

fn response_body(options: &FileServerOptions, first: bool, payload: Vec<u8>) -> Body {
    let payload = Bytes::from(payload);
    if first {
        if let Some((split, delay)) = options.stall_after {
            let split = split.min(payload.len());
            let head = payload.slice(..split);
            let rest = payload.slice(split..);
            let stream = stream::iter([Ok::<_, io::Error>(head)]).chain(stream::once(async move {
                tokio::time::sleep(delay).await;
                Ok(rest)
            }));
            return Body::from_stream(stream);
        }
        if let Some(split) = options.abort_after {
            let head = payload.slice(..split.min(payload.len()));
            // Give the prefix time to reach the client before the reset.
            let stream = stream::iter([Ok(head)]).chain(stream::once(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
            }));
            return Body::from_stream(stream);
        }
    }
    if options.omit_length {
        return Body::from_stream(stream::iter([Ok::<_, io::Error>(payload)]));
    }
    Body::from(payload)
}

/// Serves the body at `/file.bin`; everything else is 404.
pub async fn start_file_server(options: FileServerOptions) -> (String, Arc<FileServerState>) {
    let state = Arc::new(FileServerState {
        options,
        requests: AtomicUsize::new(0),
        ranges: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/file.bin", get(serve_file))
        .with_state(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/file.bin", addr), state)
}

/// Oracle returning the same answer for every lookup.
pub enum FixedOracle {
    Hash(String),
    Absent,
    Unavailable,
}

#[async_trait]
impl HashOracle for FixedOracle {
    async fn expected_hash(
        &self,
        source: Source,
        _model_id: &str,
        _file_name: &str,
    ) -> Result<Option<ExpectedHash>, DownloadError> {
        match self {
            FixedOracle::Hash(value) => Ok(Some(ExpectedHash {
                algorithm: source.hash_algorithm(),
                value: value.clone(),
            })),
            FixedOracle::Absent => Ok(None),
            FixedOracle::Unavailable => Err(DownloadError::MetadataUnavailable(
                "catalog unreachable".to_string(),
            )),
        }
    }
}

/// Civitai-shaped catalog answering every model with one file carrying
/// `blake3`. The first request can be held back.
pub async fn start_civitai_catalog(
    blake3: String,
    stall_first: Option<Duration>,
) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/api/v1/models/{id}",
        get(move || {
            let counter = Arc::clone(&counter);
            let blake3 = blake3.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    if let Some(delay) = stall_first {
                        tokio::time::sleep(delay).await;
                    }
                }
                Json(serde_json::json!({
                    "modelVersions": [{"files": [{"name": "file.bin", "hashes": {"BLAKE3": blake3}}]}]
                }))
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), hits)
}
