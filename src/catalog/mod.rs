use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::downloader::hasher::HashAlgorithm;
use crate::error::DownloadError;

mod civitai;
mod huggingface;

/// Catalog a model file was selected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Civitai,
    #[value(name = "huggingface")]
    HuggingFace,
}

impl Source {
    /// Civitai publishes BLAKE3, Hugging Face publishes SHA-256 for LFS files.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            Source::Civitai => HashAlgorithm::Blake3,
            Source::HuggingFace => HashAlgorithm::Sha256,
        }
    }

    /// Whether a file may be accepted when the catalog publishes no hash.
    pub fn allows_missing_hash(&self) -> bool {
        matches!(self, Source::HuggingFace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHash {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

#[async_trait]
pub trait HashOracle: Send + Sync {
    /// `Ok(None)` means the catalog answered but publishes no hash for the
    /// file. Failures to reach the catalog are `MetadataUnavailable`, except
    /// timeouts, which are `Timeout`.
    async fn expected_hash(
        &self,
        source: Source,
        model_id: &str,
        file_name: &str,
    ) -> Result<Option<ExpectedHash>, DownloadError>;
}

#[derive(Debug, Clone)]
pub struct CatalogEndpoints {
    pub civitai_base: String,
    pub huggingface_base: String,
    pub civitai_token: Option<String>,
    pub huggingface_token: Option<String>,
}

impl CatalogEndpoints {
    pub fn token_for(&self, source: Source) -> Option<&str> {
        match source {
            Source::Civitai => self.civitai_token.as_deref(),
            Source::HuggingFace => self.huggingface_token.as_deref(),
        }
    }
}

impl Default for CatalogEndpoints {
    fn default() -> Self {
        Self {
            civitai_base: "https://civitai.com".to_string(),
            huggingface_base: "https://huggingface.co".to_string(),
            civitai_token: None,
            huggingface_token: None,
        }
    }
}

/// Hash oracle backed by the real catalog metadata APIs.
pub struct CatalogClient {
    client: reqwest::Client,
    endpoints: CatalogEndpoints,
}

impl CatalogClient {
    pub fn new(endpoints: CatalogEndpoints, timeout: Duration) -> Result<Self, DownloadError> {
        // Hugging Face answers resolve requests for LFS files with a redirect
        // to the CDN; the hash header lives on the redirect itself.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("modella/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl HashOracle for CatalogClient {
    async fn expected_hash(
        &self,
        source: Source,
        model_id: &str,
        file_name: &str,
    ) -> Result<Option<ExpectedHash>, DownloadError> {
        let token = self.endpoints.token_for(source);
        let value = match source {
            Source::Civitai => {
                civitai::fetch_blake3(
                    &self.client,
                    &self.endpoints.civitai_base,
                    token,
                    model_id,
                    file_name,
                )
                .await?
            }
            Source::HuggingFace => {
                huggingface::fetch_sha256(
                    &self.client,
                    &self.endpoints.huggingface_base,
                    token,
                    model_id,
                    file_name,
                )
                .await?
            }
        };
        Ok(value.map(|value| ExpectedHash {
            algorithm: source.hash_algorithm(),
            value: value.to_lowercase(),
        }))
    }
}

/// Timeouts stay transient so the executor retries them; every other
/// failure means the catalog cannot answer.
fn metadata_error(err: reqwest::Error) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout(format!("catalog metadata: {}", err))
    } else {
        DownloadError::MetadataUnavailable(err.to_string())
    }
}
