//! Storage and File System Abstractions
//!
//! Provides the platform-agnostic file operations that credential
//! persistence is built on.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File system access trait
///
/// Abstracts the small set of file operations needed to persist token
/// files. `rename` must replace an existing destination in a single step so
/// callers can implement write-temp-then-replace.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn replace(fs: &dyn FileSystemAccess, path: &Path, data: Bytes) -> Result<()> {
///     let tmp = path.with_extension("tmp");
///     fs.write_file(&tmp, data).await?;
///     fs.rename(&tmp, path).await
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the application's data directory
    ///
    /// This directory is suitable for persistent application data.
    async fn get_data_directory(&self) -> Result<PathBuf>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it if it doesn't exist
    ///
    /// The write is flushed to disk before returning.
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Atomically move `from` over `to`, replacing any existing file.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Delete a file
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Restrict a file to its owner (0600 on Unix). A no-op where the
    /// platform has no such notion.
    async fn restrict_to_owner(&self, path: &Path) -> Result<()> {
        let _ = path;
        Ok(())
    }
}
