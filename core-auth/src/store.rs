//! Credential Persistence
//!
//! Durable load/save of one credential per account token file.
//!
//! ## Guarantees
//!
//! - `load` never fails: an absent, unreadable or malformed file is reported
//!   as "no credential" and logged, so the caller re-authenticates.
//! - `save` writes a uniquely named sibling temp file, restricts it to the
//!   owner and then renames it over the target, so a crash mid-write leaves
//!   either the old or the new file, never a torn one. Concurrent writers
//!   (other processes included) never share a staging file.
//! - Writing identical bytes is skipped.
//! - Token values are never logged; paths are logged by basename only.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{CredentialStore, ProviderTag};
//! use std::path::Path;
//! # use std::sync::Arc;
//! # use bridge_traits::FileSystemAccess;
//! # async fn example(fs: Arc<dyn FileSystemAccess>) -> core_auth::Result<()> {
//! let store = CredentialStore::new(fs);
//! let path = Path::new("tokens/gmail_me_gmail.com.json");
//!
//! if let Some(credential) = store.load(path, ProviderTag::Gmail).await {
//!     store.save(path, &credential).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::token_file;
use crate::types::{Credential, ProviderTag};
use bridge_traits::FileSystemAccess;
use bytes::Bytes;
use core_runtime::logging::strip_path;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a successful [`CredentialStore::save`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The token file was (re)written.
    Written,
    /// The token file already held exactly these bytes.
    Unchanged,
}

/// Reads and writes token files through the host file system bridge.
#[derive(Clone)]
pub struct CredentialStore {
    fs: Arc<dyn FileSystemAccess>,
}

impl CredentialStore {
    pub fn new(fs: Arc<dyn FileSystemAccess>) -> Self {
        Self { fs }
    }

    /// Load the credential stored at `path`, if there is a usable one.
    pub async fn load(&self, path: &Path, provider: ProviderTag) -> Option<Credential> {
        let file = display_name(path);

        let data = match self.fs.read_file(path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                debug!(file = %file, "No token file found");
                return None;
            }
            Err(e) => {
                warn!(file = %file, error = %e, "Token file unreadable, treating as absent");
                return None;
            }
        };

        match token_file::decode(provider, &data) {
            Ok(credential) => {
                debug!(
                    file = %file,
                    provider = %provider,
                    has_refresh_token = credential.refresh_token.is_some(),
                    expires_at = %credential.expires_at,
                    "Loaded cached credential"
                );
                Some(credential)
            }
            Err(e) => {
                warn!(
                    file = %file,
                    provider = %provider,
                    error = %e,
                    "Token file is corrupt, treating as absent"
                );
                None
            }
        }
    }

    /// Atomically persist `credential` at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Persistence` if the directory or file cannot be
    /// written. The previous file, if any, is left in place.
    pub async fn save(&self, path: &Path, credential: &Credential) -> Result<SaveOutcome> {
        let file = display_name(path);
        let data = token_file::encode(credential).map_err(|e| persistence(path, e))?;

        if let Ok(existing) = self.fs.read_file(path).await {
            if existing.as_ref() == data.as_slice() {
                debug!(file = %file, "Token file unchanged, skipping write");
                return Ok(SaveOutcome::Unchanged);
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.fs
                .create_dir_all(parent)
                .await
                .map_err(|e| persistence(path, e))?;
        }

        let staged = staging_path(path);
        self.fs
            .write_file(&staged, Bytes::from(data))
            .await
            .map_err(|e| persistence(path, e))?;

        if let Err(e) = self.fs.restrict_to_owner(&staged).await {
            warn!(file = %file, error = %e, "Could not restrict token file permissions");
        }

        if let Err(e) = self.fs.rename(&staged, path).await {
            if let Err(cleanup) = self.fs.delete_file(&staged).await {
                debug!(file = %file, error = %cleanup, "Failed to remove staged token file");
            }
            return Err(persistence(path, e));
        }

        info!(
            file = %file,
            provider = %credential.provider,
            has_refresh_token = credential.refresh_token.is_some(),
            "Credential saved"
        );
        Ok(SaveOutcome::Written)
    }

    /// Whether a token file exists at `path`.
    pub async fn exists(&self, path: &Path) -> bool {
        match self.fs.exists(path).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(file = %display_name(path), error = %e, "Could not check token file");
                false
            }
        }
    }

    /// Delete the token file at `path`. Returns `false` if there was none.
    pub async fn delete(&self, path: &Path) -> Result<bool> {
        match self.fs.delete_file(path).await {
            Ok(()) => {
                info!(file = %display_name(path), "Token file deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(persistence(path, e)),
        }
    }
}

/// `<file>.<pid>-<random>.tmp` next to `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".{}-{:016x}.tmp",
        std::process::id(),
        rand::random::<u64>()
    ));
    path.with_file_name(name)
}

fn display_name(path: &Path) -> String {
    strip_path(&path.to_string_lossy()).to_string()
}

fn persistence(path: &Path, reason: impl std::fmt::Display) -> AuthError {
    AuthError::Persistence {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
