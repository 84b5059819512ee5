//! Client for a running engine's command server.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use vaultline_infra::engine::{EngineError, EngineStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineClient {
    base_url: String,
    port: u16,
    http: reqwest::Client,
}

impl EngineClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            port,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Client for an engine on this machine.
    pub fn local(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Engine status; `{"status": "stopped"}` when nothing answers on the port.
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let body = match self.get("/status").await {
            Ok(body) => body,
            Err(EngineError::NotRunning(_)) => return Ok(EngineStatus::stopped()),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&body).map_err(|e| EngineError::Command(format!("invalid status response: {e}")))
    }

    /// Ask the engine to stop; returns the engine's answer.
    pub async fn stop(&self) -> Result<String, EngineError> {
        self.get("/stop").await
    }

    pub async fn stop_command_server(&self) -> Result<(), EngineError> {
        self.get("/stop-command-server").await.map(|_| ())
    }

    async fn get(&self, path: &str) -> Result<String, EngineError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "sending engine command");
        let response = self.http.get(&url).send().await.map_err(|e| {
            if e.is_connect() {
                EngineError::NotRunning(self.port)
            } else {
                EngineError::Command(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Command(e.to_string()))?;
        if status != StatusCode::OK {
            return Err(EngineError::Command(body));
        }
        Ok(body)
    }
}
