//! macOS UI automation over the Accessibility API
//!
//! Re-exports the engine from `axkit-core` and adds one-call setup for the
//! live desktop.
//!
//! ## Features
//!
//! - **locators**: criteria with path hints, depth and time budgets
//! - **discovery**: short element ids (B1, T2) ordered by screen position
//! - **sessions**: discovery batches on disk, addressable by later commands
//! - **observation**: bounded notification streams with clean cancellation

pub use axkit_core::*;

use axkit_core::platform;

/// Orchestrator on the live desktop with configuration from `AXKIT_*`
/// variables and a session store under the configured root.
pub fn connect() -> Result<Orchestrator> {
    connect_with(Config::from_env())
}

pub fn connect_with(config: Config) -> Result<Orchestrator> {
    ensure_accessibility()?;
    let store = SessionStore::new(config.session_root(), config.max_snapshots)?;
    let engine = platform::default_engine()?;
    Ok(Orchestrator::new(engine, config).with_session_store(store))
}
