use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tokio::sync::Notify;
use tracing::{error, info};

use vaultline_infra::engine::EngineControl;

/// Shared handle to the engine being controlled.
pub type ControlHandle = Arc<dyn EngineControl>;

/// Signals the command server to shut down gracefully.
#[derive(Clone, Default)]
pub struct ShutdownSignal(pub Arc<Notify>);

pub async fn status(Extension(engine): Extension<ControlHandle>) -> Response {
    match engine.status() {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            error!(error = %e, "status command failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error while trying to get engine status: {e}"),
            )
                .into_response()
        }
    }
}

pub async fn stop(Extension(engine): Extension<ControlHandle>) -> Response {
    match engine.request_stop() {
        Ok(outcome) => outcome.message().into_response(),
        Err(e) => {
            error!(error = %e, "stop command failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error while trying to stop engine: {e}"),
            )
                .into_response()
        }
    }
}

pub async fn stop_command_server(Extension(shutdown): Extension<ShutdownSignal>) -> &'static str {
    info!("stopping command server");
    shutdown.0.notify_one();
    "success"
}
