use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use super::metadata_error;
use crate::error::DownloadError;

#[derive(Debug, Deserialize)]
struct ModelResponse {
    #[serde(rename = "modelVersions", default)]
    model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Deserialize)]
struct ModelVersion {
    #[serde(default)]
    files: Vec<ModelFile>,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    hashes: HashMap<String, String>,
}

/// BLAKE3 declared by Civitai for `file_name` of model `model_id`.
pub(super) async fn fetch_blake3(
    client: &reqwest::Client,
    base: &str,
    token: Option<&str>,
    model_id: &str,
    file_name: &str,
) -> Result<Option<String>, DownloadError> {
    let url = format!("{}/api/v1/models/{}", base.trim_end_matches('/'), model_id);
    let mut request = client.get(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let model: ModelResponse = request
        .send()
        .await
        .map_err(metadata_error)?
        .error_for_status()
        .map_err(metadata_error)?
        .json()
        .await
        .map_err(metadata_error)?;

    let hash = select_file(&model, file_name).and_then(|file| {
        file.hashes
            .iter()
            .find(|(algorithm, _)| algorithm.eq_ignore_ascii_case("BLAKE3"))
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    });
    debug!("civitai model {model_id} file {file_name}: blake3 {:?}", hash);
    Ok(hash)
}

/// The file whose name matches the download, else the first file of the
/// newest version.
fn select_file<'a>(model: &'a ModelResponse, file_name: &str) -> Option<&'a ModelFile> {
    model
        .model_versions
        .iter()
        .flat_map(|version| version.files.iter())
        .find(|file| file.name == file_name)
        .or_else(|| {
            model
                .model_versions
                .first()
                .and_then(|version| version.files.first())
        })
}
