//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the authentication core:
//! - Logging and tracing infrastructure
//! - Account and client configuration (construct once, read many)
//! - Auth lifecycle event bus
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that `core-auth` depends on. It
//! establishes the logging conventions, the fail-fast configuration builder,
//! and the broadcast channel used to publish lifecycle checkpoints.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
