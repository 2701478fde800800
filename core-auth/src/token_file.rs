//! On-disk token file formats.
//!
//! Gmail accounts use a JSON document with the authorized-user fields.
//! Outlook accounts use an opaque session blob: callers only rely on it
//! round-tripping, but internally it is a versioned, JSON-encoded
//! [`SessionCache`] listing cached sessions. The first session is used.

use crate::types::{Credential, ProviderTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current `SessionCache` format version.
pub const SESSION_CACHE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum TokenFileError {
    #[error("malformed token file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported session cache version {0}")]
    UnsupportedVersion(u32),

    #[error("session cache holds no sessions")]
    Empty,
}

/// Gmail authorized-user token file.
///
/// `token` is accepted as an alias of `access_token` so files written by
/// other Google client libraries load as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthorizedUserFile {
    #[serde(alias = "token")]
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    expiry: DateTime<Utc>,
    #[serde(default)]
    scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Serialized device-code session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCache {
    pub version: u32,
    pub sessions: Vec<CachedSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSession {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Encode a credential in its provider's token file format.
pub fn encode(credential: &Credential) -> Result<Vec<u8>, TokenFileError> {
    let bytes = match credential.provider {
        ProviderTag::Gmail => serde_json::to_vec_pretty(&AuthorizedUserFile {
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            token_type: credential.token_type.clone(),
            expiry: credential.expires_at,
            scopes: credential.scopes.clone(),
        })?,
        ProviderTag::Outlook => serde_json::to_vec(&SessionCache {
            version: SESSION_CACHE_VERSION,
            sessions: vec![CachedSession {
                access_token: credential.access_token.clone(),
                refresh_token: credential.refresh_token.clone(),
                token_type: credential.token_type.clone(),
                expires_at: credential.expires_at,
                scopes: credential.scopes.clone(),
            }],
        })?,
    };
    Ok(bytes)
}

/// Decode a token file for `provider`.
pub fn decode(provider: ProviderTag, bytes: &[u8]) -> Result<Credential, TokenFileError> {
    match provider {
        ProviderTag::Gmail => {
            let file: AuthorizedUserFile = serde_json::from_slice(bytes)?;
            Ok(Credential {
                access_token: file.access_token,
                refresh_token: file.refresh_token,
                token_type: file.token_type,
                expires_at: file.expiry,
                scopes: file.scopes,
                provider,
            })
        }
        ProviderTag::Outlook => {
            let cache: SessionCache = serde_json::from_slice(bytes)?;
            if cache.version != SESSION_CACHE_VERSION {
                return Err(TokenFileError::UnsupportedVersion(cache.version));
            }
            let session = cache
                .sessions
                .into_iter()
                .next()
                .ok_or(TokenFileError::Empty)?;
            Ok(Credential {
                access_token: session.access_token,
                refresh_token: session.refresh_token,
                token_type: session.token_type,
                expires_at: session.expires_at,
                scopes: session.scopes,
                provider,
            })
        }
    }
}
