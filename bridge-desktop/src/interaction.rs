//! Terminal and browser based operator interaction

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    interaction::UserInteraction,
};

/// Prints instructions to stdout and opens consent pages in the default
/// system browser.
///
/// Without the `browser` feature, or with [`without_browser`](Self::without_browser),
/// `open_url` only reports that no browser is available and the caller falls
/// back to the printed link.
#[derive(Debug, Clone)]
pub struct DesktopUserInteraction {
    launch_browser: bool,
}

impl DesktopUserInteraction {
    pub fn new() -> Self {
        Self {
            launch_browser: cfg!(feature = "browser"),
        }
    }

    /// Never launch a browser; useful on headless machines.
    pub fn without_browser() -> Self {
        Self {
            launch_browser: false,
        }
    }
}

impl Default for DesktopUserInteraction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserInteraction for DesktopUserInteraction {
    async fn open_url(&self, url: &str) -> Result<()> {
        if !self.launch_browser {
            return Err(BridgeError::NotAvailable(
                "Browser launch disabled".to_string(),
            ));
        }

        open_in_browser(url.to_string()).await
    }

    fn show_message(&self, message: &str) {
        println!("{}", message);
    }
}

#[cfg(feature = "browser")]
async fn open_in_browser(url: String) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || open::that(&url))
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Browser task failed: {}", e)))?;

    match result {
        Ok(()) => {
            tracing::debug!("Opened consent page in system browser");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to open system browser");
            Err(BridgeError::Io(e))
        }
    }
}

#[cfg(not(feature = "browser"))]
async fn open_in_browser(_url: String) -> Result<()> {
    Err(BridgeError::NotAvailable(
        "Built without the 'browser' feature".to_string(),
    ))
}
