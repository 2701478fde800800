//! # Event Bus System
//!
//! Broadcasts token lifecycle events using `tokio::sync::broadcast` so hosts
//! can render progress (status lines, tray icons, audit logs) without the
//! authentication core knowing about them.
//!
//! ## Overview
//!
//! - **Event Types**: `CoreEvent` wrapping the typed `AuthEvent` checkpoints
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ```text
//! ┌──────────────────┐   emit   ┌───────────┐   subscribe   ┌────────────┐
//! │ Lifecycle manager├─────────>│ EventBus  ├──────────────>│ Subscriber │
//! └──────────────────┘          │ (broadcast│               └────────────┘
//!                               │  channel) ├──────────────>┌────────────┐
//!                               └───────────┘               │ Subscriber │
//!                                                           └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
//!
//! let event_bus = EventBus::new(100);
//! let event = CoreEvent::Auth(AuthEvent::CacheHit {
//!     account: "me@gmail.com".to_string(),
//!     provider: "gmail".to_string(),
//! });
//!
//! // Emitting with no subscribers is not an error for callers that ignore it.
//! event_bus.emit(event).ok();
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Token lifecycle checkpoints
    Auth(AuthEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Auth(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Auth(e) => e.severity(),
        }
    }

    /// The account e-mail the event refers to.
    pub fn account(&self) -> &str {
        match self {
            CoreEvent::Auth(e) => e.account(),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Authentication Events
// ============================================================================

/// Checkpoints of one account's token lifecycle run.
///
/// `provider` is the stable provider identifier (`gmail`, `outlook`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// A cached credential was valid and reused.
    CacheHit { account: String, provider: String },
    /// A silent refresh is being attempted.
    RefreshAttempted { account: String, provider: String },
    /// A silent refresh finished.
    RefreshCompleted {
        account: String,
        provider: String,
        success: bool,
    },
    /// The operator is being asked to grant consent.
    InteractiveStarted { account: String, provider: String },
    /// The interactive flow finished.
    InteractiveCompleted {
        account: String,
        provider: String,
        success: bool,
    },
    /// A new credential was (or failed to be) written to the token file.
    CredentialPersisted {
        account: String,
        provider: String,
        success: bool,
    },
    /// The token file was removed.
    SignedOut { account: String, provider: String },
    /// The lifecycle run ended in failure.
    AuthError {
        account: String,
        /// Human-readable error message, including the action required.
        message: String,
        /// Whether re-running could succeed without configuration changes.
        recoverable: bool,
    },
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::CacheHit { .. } => "Using cached credential",
            AuthEvent::RefreshAttempted { .. } => "Refreshing access token",
            AuthEvent::RefreshCompleted { success: true, .. } => "Token refreshed",
            AuthEvent::RefreshCompleted { success: false, .. } => "Token refresh failed",
            AuthEvent::InteractiveStarted { .. } => "Waiting for user consent",
            AuthEvent::InteractiveCompleted { success: true, .. } => "User consent granted",
            AuthEvent::InteractiveCompleted { success: false, .. } => "Interactive sign-in failed",
            AuthEvent::CredentialPersisted { success: true, .. } => "Credential saved",
            AuthEvent::CredentialPersisted { success: false, .. } => "Credential could not be saved",
            AuthEvent::SignedOut { .. } => "Signed out",
            AuthEvent::AuthError { .. } => "Authentication error",
        }
    }

    fn severity(&self) -> EventSeverity {
        match self {
            AuthEvent::AuthError { .. } => EventSeverity::Error,
            AuthEvent::CredentialPersisted { success: false, .. } => EventSeverity::Warning,
            AuthEvent::RefreshCompleted { success: false, .. } => EventSeverity::Warning,
            AuthEvent::InteractiveCompleted { success: false, .. } => EventSeverity::Warning,
            AuthEvent::InteractiveCompleted { success: true, .. }
            | AuthEvent::SignedOut { .. } => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    fn account(&self) -> &str {
        match self {
            AuthEvent::CacheHit { account, .. }
            | AuthEvent::RefreshAttempted { account, .. }
            | AuthEvent::RefreshCompleted { account, .. }
            | AuthEvent::InteractiveStarted { account, .. }
            | AuthEvent::InteractiveCompleted { account, .. }
            | AuthEvent::CredentialPersisted { account, .. }
            | AuthEvent::SignedOut { account, .. }
            | AuthEvent::AuthError { account, .. } => account,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for lifecycle events.
///
/// Cloning the bus is cheap; clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// When a subscriber falls behind by more than `capacity` events it
    /// receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{EventBus, EventSeverity, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let warnings = EventStream::new(event_bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    fn matches(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_hit(account: &str) -> CoreEvent {
        CoreEvent::Auth(AuthEvent::CacheHit {
            account: account.to_string(),
            provider: "gmail".to_string(),
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(cache_hit("me@gmail.com")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.clone().subscribe();

        let event = CoreEvent::Auth(AuthEvent::RefreshCompleted {
            account: "me@contoso.com".to_string(),
            provider: "outlook".to_string(),
            success: true,
        });

        assert_eq!(bus.emit(event.clone()).unwrap(), 2);
        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| event.severity() >= EventSeverity::Warning);

        bus.emit(cache_hit("me@gmail.com")).ok();

        let persist_failure = CoreEvent::Auth(AuthEvent::CredentialPersisted {
            account: "me@gmail.com".to_string(),
            provider: "gmail".to_string(),
            success: false,
        });
        bus.emit(persist_failure.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), persist_failure);
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(cache_hit(&format!("user{}@gmail.com", i))).ok();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity_and_account() {
        let error_event = CoreEvent::Auth(AuthEvent::AuthError {
            account: "me@gmail.com".to_string(),
            message: "Consent was denied. Re-run and approve access in the browser.".to_string(),
            recoverable: true,
        });
        assert_eq!(error_event.severity(), EventSeverity::Error);
        assert_eq!(error_event.account(), "me@gmail.com");
        assert_eq!(cache_hit("x@gmail.com").severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Auth(AuthEvent::InteractiveStarted {
            account: "me@contoso.com".to_string(),
            provider: "outlook".to_string(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Auth\""));
        assert!(json.contains("\"event\":\"InteractiveStarted\""));

        let back: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
