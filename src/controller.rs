//! Outbound notifications to the external security-mode controller.
//!
//! The controller is advisory: local household state is authoritative and a
//! failed push is only logged by the caller.

use crate::household::Mode;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Receives the household's automatic mode pushes
#[async_trait]
pub trait ModeController: Send + Sync {
    /// Ask the controller to switch to `mode`
    async fn set_mode(&self, mode: Mode) -> Result<()>;
}

/// Controller reached with `GET {base_url}/{mode}`
pub struct HttpModeController {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpModeController {
    /// # Arguments
    /// * `base_url` - Controller base URL (e.g., "http://hub.local/api/modes")
    /// * `timeout` - Upper bound for the whole request
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build controller HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn mode_url(&self, mode: Mode) -> String {
        format!("{}/{}", self.base_url, mode)
    }
}

#[async_trait]
impl ModeController for HttpModeController {
    async fn set_mode(&self, mode: Mode) -> Result<()> {
        let url = self.mode_url(mode);
        debug!(url = %url, "Notifying mode controller");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach mode controller at {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Mode controller returned status {} for {}", response.status(), url);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn test_set_mode_hits_mode_path() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/modes/away")
            .with_status(200)
            .create_async()
            .await;

        let controller =
            HttpModeController::new(format!("{}/modes/", server.url()), Duration::from_secs(2))
                .unwrap();
        controller.set_mode(Mode::Away).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/home")
            .with_status(503)
            .create_async()
            .await;

        let controller = HttpModeController::new(server.url(), Duration::from_secs(2)).unwrap();
        let err = controller.set_mode(Mode::Home).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_error() {
        // Port 9 (discard) on localhost is not expected to be serving HTTP
        let controller =
            HttpModeController::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(controller.set_mode(Mode::Night).await.is_err());
    }
}
