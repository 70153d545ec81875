//! Model download service: fetches large model files from Civitai and
//! Hugging Face into a storage root, resumes interrupted transfers, verifies
//! the published hash and streams progress events to subscribers.

pub mod catalog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod progress;
pub mod queue;
pub mod server;
pub mod utils;

#[cfg(test)]
mod test_support;
