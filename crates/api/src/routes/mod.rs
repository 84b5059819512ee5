use axum::{routing::get, Router};

pub mod control;
pub mod system;

/// Router for the engine command endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/status", get(control::status))
        .route("/stop", get(control::stop))
        .route("/stop-command-server", get(control::stop_command_server))
}
