use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{StatusCode, header};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hasher::{HashAlgorithm, IncrementalHasher};
use crate::error::DownloadError;

/// Bytes accumulated from the network before they are written, hashed and
/// reported as one unit.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Where one transfer reads from and writes to.
pub struct TransferTarget<'a> {
    pub url: &'a str,
    pub destination: &'a Path,
    pub resume_from: u64,
    pub algorithm: HashAlgorithm,
    pub bearer_token: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    pub written: u64,
    pub total: Option<u64>,
}

impl ChunkProgress {
    /// Percentage of the file on disk; 0 while the size is unknown.
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.written as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTransfer {
    /// Hex digest over the complete file, including bytes from earlier attempts.
    pub digest: String,
    pub bytes: u64,
}

/// Mutable state of one transfer. `written` starts at the resume offset and
/// only grows.
struct TransferState {
    written: u64,
    total: Option<u64>,
    hasher: IncrementalHasher,
}

pub struct TransferEngine {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl TransferEngine {
    pub fn new(request_timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .user_agent(concat!("modella/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Stream `target.url` into `target.destination`, appending after
    /// `target.resume_from` bytes when the server honors the range.
    ///
    /// Every chunk is written before it is hashed and before `on_chunk` sees
    /// it. Cancellation is observed between chunks; the file on disk is then a
    /// contiguous prefix of the remote content and can be resumed later.
    pub async fn stream<F>(
        &self,
        target: &TransferTarget<'_>,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<FinishedTransfer, DownloadError>
    where
        F: FnMut(ChunkProgress),
    {
        let mut hasher = IncrementalHasher::new(target.algorithm);
        let mut offset = 0;
        if target.resume_from > 0 {
            // Hash what is already on disk before the connection is opened, so
            // the final digest covers the whole file.
            offset = hasher.absorb_file(target.destination).await?;
            debug!("resuming {} at {} bytes", target.destination.display(), offset);
        }

        let response = loop {
            let response = self.send(target, offset, cancel).await?;
            match self.check_resume(&response, offset) {
                ResumeDecision::Continue => break response,
                ResumeDecision::AlreadyComplete => {
                    info!(
                        "{} already complete on disk ({} bytes)",
                        target.destination.display(),
                        offset
                    );
                    return Ok(FinishedTransfer {
                        digest: hasher.finalize_hex(),
                        bytes: offset,
                    });
                }
                ResumeDecision::RestartWithBody => {
                    warn!(
                        "server ignored range for {}; restarting from zero",
                        target.url
                    );
                    offset = 0;
                    hasher = IncrementalHasher::new(target.algorithm);
                    break response;
                }
                ResumeDecision::Reissue => {
                    warn!(
                        "server cannot resume {} at {}; restarting from zero",
                        target.url, offset
                    );
                    offset = 0;
                    hasher = IncrementalHasher::new(target.algorithm);
                }
            }
        };

        let mut file = self.open_destination(target.destination, offset).await?;
        let mut state = TransferState {
            written: offset,
            total: response.content_length().map(|len| len + offset),
            hasher,
        };

        let mut body = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Unwritten bytes are dropped; the file stays chunk aligned.
                    file.flush().await?;
                    return Err(DownloadError::Cancelled);
                }
                next = tokio::time::timeout(self.request_timeout, body.next()) => next,
            };

            let item = match next {
                Err(_) => {
                    flush_pending(&mut file, &mut state, &mut pending, &mut on_chunk).await?;
                    file.flush().await?;
                    return Err(DownloadError::Timeout(format!(
                        "no data from {} within {:?}",
                        target.url, self.request_timeout
                    )));
                }
                Ok(None) => break,
                Ok(Some(item)) => item,
            };

            match item {
                Ok(bytes) => {
                    pending.extend_from_slice(&bytes);
                    if pending.len() >= CHUNK_SIZE {
                        flush_pending(&mut file, &mut state, &mut pending, &mut on_chunk).await?;
                        if cancel.is_cancelled() {
                            file.flush().await?;
                            return Err(DownloadError::Cancelled);
                        }
                    }
                }
                Err(err) => {
                    flush_pending(&mut file, &mut state, &mut pending, &mut on_chunk).await?;
                    file.flush().await?;
                    return Err(err.into());
                }
            }
        }

        flush_pending(&mut file, &mut state, &mut pending, &mut on_chunk).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(FinishedTransfer {
            digest: state.hasher.finalize_hex(),
            bytes: state.written,
        })
    }

    async fn send(
        &self,
        target: &TransferTarget<'_>,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(target.url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        if let Some(token) = target.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            sent = tokio::time::timeout(self.request_timeout, request.send()) => match sent {
                Err(_) => {
                    return Err(DownloadError::Timeout(format!(
                        "no response from {} within {:?}",
                        target.url, self.request_timeout
                    )));
                }
                Ok(result) => result?,
            },
        };

        let status = response.status();
        if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(response);
        }
        if !status.is_success() {
            return Err(DownloadError::Transport(format!(
                "HTTP {} for {}",
                status, target.url
            )));
        }
        Ok(response)
    }

    fn check_resume(&self, response: &reqwest::Response, offset: u64) -> ResumeDecision {
        if offset == 0 {
            return ResumeDecision::Continue;
        }
        let status = response.status();
        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return match content_range {
                Some(ContentRange { total: Some(total), .. }) if total != offset => {
                    ResumeDecision::Reissue
                }
                _ => ResumeDecision::AlreadyComplete,
            };
        }
        if status == StatusCode::PARTIAL_CONTENT {
            return match content_range {
                Some(ContentRange { start: Some(start), .. }) if start == offset => {
                    ResumeDecision::Continue
                }
                _ => ResumeDecision::Reissue,
            };
        }
        ResumeDecision::RestartWithBody
    }

    async fn open_destination(&self, path: &Path, offset: u64) -> Result<File, DownloadError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = if offset > 0 {
            OpenOptions::new().append(true).open(path).await?
        } else {
            File::create(path).await?
        };
        Ok(file)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ResumeDecision {
    /// Response continues exactly where the file ends.
    Continue,
    /// Ranged request answered 416 for a file that is already whole.
    AlreadyComplete,
    /// Server sent the full body; truncate and use it.
    RestartWithBody,
    /// Response unusable for resuming; ask again without a range.
    Reissue,
}

#[derive(Debug, PartialEq, Eq)]
struct ContentRange {
    start: Option<u64>,
    total: Option<u64>,
}

/// Parse `bytes 100-199/500` or `bytes */500`.
fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let total = total.trim().parse::<u64>().ok();
    let start = if range.trim() == "*" {
        None
    } else {
        Some(range.split('-').next()?.trim().parse::<u64>().ok()?)
    };
    Some(ContentRange { start, total })
}

async fn flush_pending<F>(
    file: &mut File,
    state: &mut TransferState,
    pending: &mut Vec<u8>,
    on_chunk: &mut F,
) -> Result<(), DownloadError>
where
    F: FnMut(ChunkProgress),
{
    if pending.is_empty() {
        return Ok(());
    }
    file.write_all(&pending[..]).await?;
    state.hasher.update(&pending[..]);
    state.written += pending.len() as u64;
    if let Some(total) = state.total {
        state.total = Some(total.max(state.written));
    }
    pending.clear();
    on_chunk(ChunkProgress {
        written: state.written,
        total: state.total,
    });
    Ok(())
}
