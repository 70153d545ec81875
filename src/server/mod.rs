mod api;
pub mod local;

pub use api::{AppState, build_app, serve_until, startup};
