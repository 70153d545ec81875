use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::hasher::digests_match;
use super::path;
use super::transfer::{TransferEngine, TransferTarget};
use super::DownloadRequest;
use crate::catalog::{CatalogClient, CatalogEndpoints, HashOracle};
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::DownloadError;
use crate::progress::{Publisher, Reporter};

/// How a successful execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Digest matched the hash published by the catalog.
    Verified { digest: String },
    /// Catalog publishes no hash and the source accepts that.
    Unverified { digest: String },
}

/// Runs one download end to end: resolve, resume, stream, verify, and report
/// every state change through the publisher.
pub struct Executor {
    engine: TransferEngine,
    oracle: Arc<dyn HashOracle>,
    publisher: Arc<dyn Publisher>,
    endpoints: CatalogEndpoints,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(
        config: &EngineConfig,
        oracle: Arc<dyn HashOracle>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            engine: TransferEngine::new(config.request_timeout)?,
            oracle,
            publisher,
            endpoints: config.endpoints.clone(),
            retry: config.retry.clone(),
        })
    }

    /// Executor that asks the real catalogs for expected hashes.
    pub fn with_catalogs(
        config: &EngineConfig,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, DownloadError> {
        let oracle = CatalogClient::new(config.endpoints.clone(), config.request_timeout)?;
        Self::new(config, Arc::new(oracle), publisher)
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    /// Execute `request` until it reaches a terminal state. The terminal state
    /// is always published before this returns; the return value only mirrors
    /// it for callers that are still around.
    pub async fn execute(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<Outcome, DownloadError> {
        self.execute_then(request, cancel, async {}).await
    }

    /// Like [`Executor::execute`], but awaits `release` once the file is no
    /// longer touched and before the terminal event goes out.
    pub async fn execute_then<R>(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        release: R,
    ) -> Result<Outcome, DownloadError>
    where
        R: Future<Output = ()>,
    {
        let name = request.file_name();
        let mut reporter = Reporter::new(self.publisher.as_ref(), &request.model_id, &name);
        let result = self.run(request, cancel, &mut reporter).await;
        release.await;

        match &result {
            Ok(Outcome::Verified { .. }) => reporter.completed(None),
            Ok(Outcome::Unverified { digest }) => {
                reporter.completed(Some(format!("Hash computed locally: {}", digest)))
            }
            Err(DownloadError::Cancelled) => reporter.cancelled(),
            Err(err) => reporter.failed(err.reason()),
        }
        result
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        reporter: &mut Reporter<'_>,
    ) -> Result<Outcome, DownloadError> {
        let name = request.file_name();
        let mut retries = 0u32;

        loop {
            match self.attempt(request, cancel, reporter).await {
                Ok(outcome) => return Ok(outcome),
                Err(DownloadError::Cancelled) => {
                    info!("download of {} ({}) cancelled", name, request.model_id);
                    return Err(DownloadError::Cancelled);
                }
                Err(err) if err.is_transient() && retries < self.retry.max_retries => {
                    retries += 1;
                    let delay = self.retry.delay(retries);
                    warn!(
                        "download of {} ({}) failed: {}; retry {}/{} in {:?}",
                        name, request.model_id, err, retries, self.retry.max_retries, delay
                    );
                    reporter.attempt_failed(err.reason());
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("download of {} ({}) cancelled", name, request.model_id);
                            return Err(DownloadError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    error!("download of {} ({}) failed: {}", name, request.model_id, err);
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        reporter: &mut Reporter<'_>,
    ) -> Result<Outcome, DownloadError> {
        fs::create_dir_all(&request.storage_root).await?;
        let destination = path::resolve(&request.relative_path, &request.storage_root)?;
        let resume_from = existing_size(&destination).await?;
        if resume_from > 0 {
            info!(
                "resuming {} from {} bytes",
                destination.display(),
                resume_from
            );
        }
        let current = reporter.progress();
        reporter.downloading(current);

        let algorithm = request.source.hash_algorithm();
        let target = TransferTarget {
            url: &request.remote_url,
            destination: &destination,
            resume_from,
            algorithm,
            bearer_token: self.endpoints.token_for(request.source),
        };
        let finished = self
            .engine
            .stream(&target, cancel, |chunk| reporter.downloading(chunk.percent()))
            .await?;
        info!(
            "transferred {} ({} bytes), {} {}",
            destination.display(),
            finished.bytes,
            algorithm,
            finished.digest
        );

        let name = request.file_name();
        let (expected, detail) = match self
            .oracle
            .expected_hash(request.source, &request.model_id, &name)
            .await
        {
            Ok(Some(expected)) => (Some(expected), String::new()),
            Ok(None) => (None, "no published hash".to_string()),
            // Retried like any other timeout; the next attempt re-verifies
            // the file from disk.
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                warn!("cannot fetch expected hash for {}: {}", request.model_id, err);
                (None, err.to_string())
            }
        };

        match expected {
            Some(expected) if expected.algorithm != algorithm => Err(DownloadError::Unverifiable {
                algorithm,
                detail: format!("catalog published {} instead", expected.algorithm),
            }),
            Some(expected) => {
                if digests_match(&expected.value, &finished.digest) {
                    info!("{} verified ({})", destination.display(), algorithm);
                    Ok(Outcome::Verified {
                        digest: finished.digest,
                    })
                } else {
                    remove_corrupt(&destination).await;
                    Err(DownloadError::HashVerification {
                        algorithm,
                        expected: expected.value,
                        actual: finished.digest,
                    })
                }
            }
            None if request.source.allows_missing_hash() => {
                info!(
                    "no hash published for {}; keeping {} with local {} {}",
                    request.model_id,
                    destination.display(),
                    algorithm,
                    finished.digest
                );
                Ok(Outcome::Unverified {
                    digest: finished.digest,
                })
            }
            None => Err(DownloadError::Unverifiable { algorithm, detail }),
        }
    }
}

async fn existing_size(path: &Path) -> Result<u64, DownloadError> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(DownloadError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        ))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

async fn remove_corrupt(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        error!("failed to remove corrupt file {}: {}", path.display(), err);
    }
}
