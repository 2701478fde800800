//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! This crate provides production-ready implementations of the bridge traits
//! using desktop-appropriate libraries:
//! - `HttpClient` using `reqwest`
//! - `FileSystemAccess` using `tokio::fs`, with atomic rename and owner-only permissions
//! - `UserInteraction` using the system browser (`open`) and stdout
//!
//! ## Feature Flags
//!
//! - `browser`: Launch the system browser for consent pages (default)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopUserInteraction, ReqwestHttpClient, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let fs = TokioFileSystem::new();
//!     let interaction = DesktopUserInteraction::default();
//!
//!     // Hand these to the token lifecycle manager
//!     Ok(())
//! }
//! ```

mod filesystem;
mod http;
mod interaction;

pub use filesystem::TokioFileSystem;
pub use http::ReqwestHttpClient;
pub use interaction::DesktopUserInteraction;
