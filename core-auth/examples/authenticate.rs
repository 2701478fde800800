//! Authenticate every enabled account from a JSON account file.
//!
//! ```text
//! cargo run -p core-auth --features desktop-shims --example authenticate -- config/accounts.json
//! ```
//!
//! Cached tokens are reused, expired ones refreshed, and missing ones obtained
//! interactively. Ctrl-C aborts a pending browser sign-in.

use core_auth::{EventBusProgressSink, TokenLifecycleManager};
use core_runtime::config::AuthConfig;
use core_runtime::events::{CoreEvent, EventBus};
use core_runtime::logging::{init_logging, LoggingConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingConfig::default().with_filter("info,core_auth=debug"))?;

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/accounts.json".to_string());
    let config = Arc::new(AuthConfig::builder().accounts_from_json_file(&path)?.build()?);

    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(CoreEvent::Auth(event)) = events.recv().await {
            tracing::debug!(?event, "Auth event");
        }
    });

    let manager = TokenLifecycleManager::from_config(config)
        .with_progress_sink(Arc::new(EventBusProgressSink::new(bus)));

    let cancel = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut failures = 0;
    for (account, result) in manager.authenticate_all().await {
        match result {
            Ok(outcome) => {
                println!(
                    "OK    {account}: token valid until {}",
                    outcome.credential.expires_at
                );
                if let Some(warning) = outcome.persistence_warning {
                    println!("      warning: {warning}");
                }
            }
            Err(err) => {
                failures += 1;
                println!("FAIL  {account}: {err}");
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
