use reqwest::header::HeaderMap;
use tracing::debug;

use super::metadata_error;
use crate::error::DownloadError;

const LINKED_ETAG: &str = "x-linked-etag";
const SHA256_HEX_LEN: usize = 64;

/// Split a Hugging Face model id into `(repo, path in repo)`.
///
/// The repo is everything before the second `/`, so `org/name/unet/model.bin`
/// names `unet/model.bin` inside `org/name`. An id with at most one `/` is the
/// repo itself and the file is taken from the destination.
fn split_model_id<'a>(model_id: &'a str, file_name: &'a str) -> (&'a str, &'a str) {
    let repo_end = model_id
        .match_indices('/')
        .nth(1)
        .map(|(index, _)| index);
    match repo_end {
        Some(index) if index + 1 < model_id.len() => (&model_id[..index], &model_id[index + 1..]),
        _ => (model_id, file_name),
    }
}

/// SHA-256 of an LFS file, as advertised through the resolve endpoint.
pub(super) async fn fetch_sha256(
    client: &reqwest::Client,
    base: &str,
    token: Option<&str>,
    model_id: &str,
    file_name: &str,
) -> Result<Option<String>, DownloadError> {
    let (repo, file) = split_model_id(model_id, file_name);
    let url = format!(
        "{}/{}/resolve/main/{}",
        base.trim_end_matches('/'),
        repo,
        file
    );

    let mut request = client.head(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(metadata_error)?;

    let status = response.status();
    if !(status.is_success() || status.is_redirection()) {
        return Err(DownloadError::MetadataUnavailable(format!(
            "HTTP {} for {}",
            status, url
        )));
    }

    let hash = linked_sha256(response.headers());
    debug!("huggingface {repo}/{file}: sha256 {:?}", hash);
    Ok(hash)
}

fn linked_sha256(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(LINKED_ETAG)?.to_str().ok()?;
    let value = raw.trim().trim_start_matches("W/").trim_matches('"');
    if value.len() == SHA256_HEX_LEN && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(value.to_lowercase())
    } else {
        None
    }
}
