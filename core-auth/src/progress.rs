//! Lifecycle checkpoints for observers.
//!
//! The manager reports what it is doing through a [`ProgressSink`] and never
//! formats anything for display itself. [`EventBusProgressSink`] republishes
//! checkpoints on the application [`EventBus`].

use crate::types::ProviderTag;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};

/// A checkpoint in one `authenticate` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    CacheHit {
        account: String,
        provider: ProviderTag,
    },
    RefreshAttempted {
        account: String,
        provider: ProviderTag,
    },
    RefreshResult {
        account: String,
        provider: ProviderTag,
        success: bool,
    },
    InteractiveStarted {
        account: String,
        provider: ProviderTag,
    },
    InteractiveResult {
        account: String,
        provider: ProviderTag,
        success: bool,
    },
    PersistResult {
        account: String,
        provider: ProviderTag,
        success: bool,
    },
    SignedOut {
        account: String,
        provider: ProviderTag,
    },
    /// The run ended in `FAILED`.
    Failed {
        account: String,
        provider: ProviderTag,
        message: String,
        recoverable: bool,
    },
}

impl ProgressEvent {
    pub fn account(&self) -> &str {
        match self {
            ProgressEvent::CacheHit { account, .. }
            | ProgressEvent::RefreshAttempted { account, .. }
            | ProgressEvent::RefreshResult { account, .. }
            | ProgressEvent::InteractiveStarted { account, .. }
            | ProgressEvent::InteractiveResult { account, .. }
            | ProgressEvent::PersistResult { account, .. }
            | ProgressEvent::SignedOut { account, .. }
            | ProgressEvent::Failed { account, .. } => account,
        }
    }

    pub fn provider(&self) -> ProviderTag {
        match self {
            ProgressEvent::CacheHit { provider, .. }
            | ProgressEvent::RefreshAttempted { provider, .. }
            | ProgressEvent::RefreshResult { provider, .. }
            | ProgressEvent::InteractiveStarted { provider, .. }
            | ProgressEvent::InteractiveResult { provider, .. }
            | ProgressEvent::PersistResult { provider, .. }
            | ProgressEvent::SignedOut { provider, .. }
            | ProgressEvent::Failed { provider, .. } => *provider,
        }
    }
}

/// Receives lifecycle checkpoints. Must not block.
pub trait ProgressSink: Send + Sync {
    fn checkpoint(&self, event: ProgressEvent);
}

/// Discards every checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn checkpoint(&self, _event: ProgressEvent) {}
}

/// Forwards checkpoints to the application event bus.
#[derive(Debug, Clone)]
pub struct EventBusProgressSink {
    bus: EventBus,
}

impl EventBusProgressSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ProgressSink for EventBusProgressSink {
    fn checkpoint(&self, event: ProgressEvent) {
        let provider = event.provider().as_str().to_string();
        let auth_event = match event {
            ProgressEvent::CacheHit { account, .. } => AuthEvent::CacheHit { account, provider },
            ProgressEvent::RefreshAttempted { account, .. } => {
                AuthEvent::RefreshAttempted { account, provider }
            }
            ProgressEvent::RefreshResult {
                account, success, ..
            } => AuthEvent::RefreshCompleted {
                account,
                provider,
                success,
            },
            ProgressEvent::InteractiveStarted { account, .. } => {
                AuthEvent::InteractiveStarted { account, provider }
            }
            ProgressEvent::InteractiveResult {
                account, success, ..
            } => AuthEvent::InteractiveCompleted {
                account,
                provider,
                success,
            },
            ProgressEvent::PersistResult {
                account, success, ..
            } => AuthEvent::CredentialPersisted {
                account,
                provider,
                success,
            },
            ProgressEvent::SignedOut { account, .. } => AuthEvent::SignedOut { account, provider },
            ProgressEvent::Failed {
                account,
                message,
                recoverable,
                ..
            } => AuthEvent::AuthError {
                account,
                message,
                recoverable,
            },
        };
        // No subscribers is not an error
        let _ = self.bus.emit(CoreEvent::Auth(auth_event));
    }
}
