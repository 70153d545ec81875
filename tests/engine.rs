use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Path, Request},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use modella::catalog::{ExpectedHash, HashOracle, Source};
use modella::config::EngineConfig;
use modella::downloader::Executor;
use modella::downloader::hasher::{HashAlgorithm, IncrementalHasher};
use modella::error::DownloadError;
use modella::progress::{BroadcastPublisher, ProgressEvent, Status};
use modella::queue::{Submission, TaskQueue};
use tempfile::TempDir;
use tokio::net::TcpListener;

fn body_for(name: &str) -> Vec<u8> {
    let seed = name.len();
    (0..3 * 1024 * 1024 + 17)
        .map(|i| ((i + seed) * 7 % 253) as u8)
        .collect()
}

fn digest(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = IncrementalHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

async fn serve(Path(name): Path<String>, req: Request) -> Response {
    let body = body_for(&name);
    let start = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split('-').next())
        .and_then(|s| s.parse::<usize>().ok());
    match start {
        Some(start) if start >= body.len() => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", body.len()))],
        )
            .into_response(),
        Some(start) => (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, body.len() - 1, body.len()),
            )],
            body[start..].to_vec(),
        )
            .into_response(),
        None => body.into_response(),
    }
}

async fn start_server() -> String {
    let app = Router::new().route("/files/{name}", get(serve));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/files", addr)
}

/// Knows the BLAKE3 of Civitai files and nothing about Hugging Face.
struct CivitaiOnly;

#[async_trait]
impl HashOracle for CivitaiOnly {
    async fn expected_hash(
        &self,
        source: Source,
        _model_id: &str,
        file_name: &str,
    ) -> Result<Option<ExpectedHash>, DownloadError> {
        Ok(match source {
            Source::Civitai => Some(ExpectedHash {
                algorithm: HashAlgorithm::Blake3,
                value: digest(HashAlgorithm::Blake3, &body_for(file_name)).to_uppercase(),
            }),
            Source::HuggingFace => None,
        })
    }
}

fn engine(root: &std::path::Path) -> (TaskQueue, BroadcastPublisher) {
    let events = BroadcastPublisher::new(1024);
    let executor = Executor::new(
        &EngineConfig::default(),
        Arc::new(CivitaiOnly),
        Arc::new(events.clone()),
    )
    .unwrap();
    (
        TaskQueue::new(Arc::new(executor), root.to_path_buf(), 2),
        events,
    )
}

async fn collect_until_terminal(
    rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>,
    ids: &[&str],
) -> HashMap<String, Vec<ProgressEvent>> {
    let mut by_id: HashMap<String, Vec<ProgressEvent>> = HashMap::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = rx.recv().await.unwrap();
            by_id.entry(event.id.clone()).or_default().push(event);
            let done = ids.iter().all(|id| {
                by_id
                    .get(*id)
                    .is_some_and(|events| events.iter().any(|e| e.status.is_terminal()))
            });
            if done {
                break;
            }
        }
    })
    .await
    .unwrap();
    by_id
}

#[tokio::test]
async fn test_concurrent_downloads_from_both_catalogs() {
    let base = start_server().await;
    let root = TempDir::new().unwrap();
    let (queue, events) = engine(root.path());
    let mut rx = events.subscribe();

    queue
        .submit(Submission {
            url: format!("{}/lora.safetensors", base),
            path: "civitai/lora.safetensors".to_string(),
            model_id: "101".to_string(),
            source: Source::Civitai,
        })
        .await
        .unwrap();
    queue
        .submit(Submission {
            url: format!("{}/unet.bin", base),
            path: "huggingface/org/repo/unet.bin".to_string(),
            model_id: "org/repo/unet.bin".to_string(),
            source: Source::HuggingFace,
        })
        .await
        .unwrap();

    let by_id = collect_until_terminal(&mut rx, &["101", "org/repo/unet.bin"]).await;

    for events in by_id.values() {
        assert_eq!(events[0].status, Status::Queued);
        for pair in events.windows(2) {
            assert!(pair[1].progress >= pair[0].progress);
        }
        let last = events.last().unwrap();
        assert_eq!(last.status, Status::Completed);
        assert_eq!(last.progress, 100.0);
    }

    let civitai = by_id["101"].last().unwrap();
    assert_eq!(civitai.warning, None);
    let hf = by_id["org/repo/unet.bin"].last().unwrap();
    let local = digest(HashAlgorithm::Sha256, &body_for("unet.bin"));
    assert_eq!(
        hf.warning.as_deref(),
        Some(format!("Hash computed locally: {}", local).as_str())
    );

    assert_eq!(
        std::fs::read(root.path().join("civitai/lora.safetensors")).unwrap(),
        body_for("lora.safetensors")
    );
    assert_eq!(
        std::fs::read(root.path().join("huggingface/org/repo/unet.bin")).unwrap(),
        body_for("unet.bin")
    );
}

#[tokio::test]
async fn test_traversal_fails_without_writing() {
    let base = start_server().await;
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("models");
    let (queue, events) = engine(&root);
    let mut rx = events.subscribe();

    queue
        .submit(Submission {
            url: format!("{}/evil.bin", base),
            path: "../../evil.bin".to_string(),
            model_id: "666".to_string(),
            source: Source::Civitai,
        })
        .await
        .unwrap();

    let by_id = collect_until_terminal(&mut rx, &["666"]).await;
    let last = by_id["666"].last().unwrap();
    assert_eq!(last.status, Status::Failed);
    assert!(last.reason.as_deref().unwrap().contains("path traversal"));
    assert!(!dir.path().join("evil.bin").exists());
}
