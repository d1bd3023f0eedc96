//! axkit-core - element query and stable-ID engine over accessibility trees
//!
//! Locators find elements in a live tree under depth and time budgets,
//! discovery batches get short position-derived ids ("B1", "T2"), and
//! sessions keep those batches on disk so later commands can act by id.
//!
//! ## Platform Support
//!
//! - **macOS**: Accessibility API via cidre
//! - **In-memory**: full backend for tests and recorded fixtures
//! - **Linux / Windows**: not implemented

pub mod attribute;
pub mod config;
pub mod criteria;
pub mod element;
pub mod error;
pub mod ids;
pub mod locator;
pub mod notification;
pub mod observer;
pub mod orchestrator;
pub mod platform;
pub mod record;
pub mod session;
pub mod traversal;
pub mod value;

pub use attribute::Attribute;
pub use config::Config;
pub use criteria::{Criterion, MatchType};
pub use element::{ActionResult, Element};
pub use error::{Error, ErrorCode, Result};
pub use ids::{parse_id, ElementCategory, ElementIdGenerator, ParsedId};
pub use locator::{Locator, PathHint};
pub use notification::Notification;
pub use observer::{NotificationCenter, NotificationEvent, ObserveRequest, Subscription};
pub use orchestrator::{CommandEnvelope, CommandKind, Orchestrator, Response};
pub use platform::{AccessibilityEngine, AppInfo, AppTarget};
pub use record::{AppContext, DetailLevel, DetectionResult, ElementRecord};
pub use session::{CleanupReport, SessionInfo, SessionStore};
pub use traversal::{CancellationToken, SearchLimits, SearchMode};
pub use value::{AttrValue, Frame, Point, Size};

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::criteria::{Criterion, MatchType};
    pub use crate::element::Element;
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::locator::Locator;
    pub use crate::orchestrator::{CommandEnvelope, CommandKind, Orchestrator};
    pub use crate::platform::AppTarget;
    pub use crate::record::{DetailLevel, ElementRecord};
    pub use crate::session::SessionStore;
}

/// Check if the process has accessibility permissions
pub fn has_accessibility() -> bool {
    platform::current::has_accessibility()
}

/// Ensure accessibility permissions are granted
pub fn ensure_accessibility() -> Result<()> {
    platform::current::ensure_accessibility()
}
