//! Operator Interaction
//!
//! Interactive OAuth flows need a human: a browser has to be opened on the
//! consent page, or a short device code has to be shown so the user can
//! enter it on another device. Hosts decide how that happens.

use async_trait::async_trait;

use crate::error::Result;

/// Surfaces interactive authentication steps to the operator.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::interaction::UserInteraction;
///
/// async fn prompt(ui: &dyn UserInteraction, url: &str) {
///     ui.show_message(&format!("Please visit {url}"));
///     if ui.open_url(url).await.is_err() {
///         ui.show_message("Could not open a browser, copy the link above.");
///     }
/// }
/// ```
#[async_trait]
pub trait UserInteraction: Send + Sync {
    /// Open `url` in the operator's browser.
    ///
    /// Failure is not fatal for callers; the URL is always shown as text too.
    async fn open_url(&self, url: &str) -> Result<()>;

    /// Show an instruction to the operator.
    fn show_message(&self, message: &str);
}
