//! Platform abstraction layer
//!
//! The engine only ever talks to the live accessibility graph through
//! [`NativeNode`] and [`AccessibilityEngine`]. Each OS provides one backend;
//! [`memory`] is a complete in-process tree used for tests and offline
//! fixtures.

use crate::error::{Error, Result};
use crate::notification::Notification;
use crate::value::{AttrValue, Point};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub mod memory;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

// Re-export the current platform
#[cfg(target_os = "macos")]
pub use macos as current;

#[cfg(target_os = "linux")]
pub use linux as current;

#[cfg(target_os = "windows")]
pub use windows as current;

/// Shared handle to one native node.
pub type NativeHandle = Arc<dyn NativeNode>;

/// One node of the live tree.
///
/// Reads on a destroyed node fail with `StaleElement`; attributes the node
/// does not support (or has no value for) are `Ok(None)`.
pub trait NativeNode: Send + Sync + fmt::Debug {
    fn attribute(&self, name: &str) -> Result<Option<AttrValue>>;

    fn attribute_names(&self) -> Result<Vec<String>>;

    /// Children in native sibling order.
    fn children(&self) -> Result<Vec<NativeHandle>>;

    fn parent(&self) -> Result<Option<NativeHandle>>;

    fn actions(&self) -> Result<Vec<String>>;

    fn perform_action(&self, action: &str) -> Result<()>;

    fn set_attribute(&self, name: &str, value: &AttrValue) -> Result<()>;

    /// Owning process, when known.
    fn pid(&self) -> Option<i32>;

    /// Native-handle equality.
    fn same_node(&self, other: &dyn NativeNode) -> bool;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub pid: i32,
}

/// How the envelope's `application` string names a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AppTarget {
    Focused,
    Pid(i32),
    BundleId(String),
    Name(String),
}

impl AppTarget {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid_command("application must not be empty"));
        }
        if s.eq_ignore_ascii_case("focused") {
            return Ok(Self::Focused);
        }
        if let Some(rest) = s
            .strip_prefix("PID:")
            .or_else(|| s.strip_prefix("pid:"))
        {
            let pid = rest
                .trim()
                .parse::<i32>()
                .map_err(|_| Error::invalid_command(format!("invalid pid in '{}'", s)))?;
            return Ok(Self::Pid(pid));
        }
        if s.contains('.') && !s.contains(char::is_whitespace) {
            return Ok(Self::BundleId(s.to_string()));
        }
        Ok(Self::Name(s.to_string()))
    }

    /// Exact match: pid, bundle id, or case-insensitive name.
    pub fn matches(&self, app: &AppInfo) -> bool {
        match self {
            Self::Focused => false,
            Self::Pid(pid) => app.pid == *pid,
            Self::BundleId(id) => app.bundle_id.as_deref() == Some(id.as_str()),
            Self::Name(name) => app.name.eq_ignore_ascii_case(name),
        }
    }

    /// Pick the running application this target names. An exact match wins.
    /// Names and bundle ids otherwise fall back to ranked partial matches;
    /// when the best scores are too close the lookup is ambiguous.
    pub fn select<'a>(&self, apps: &'a [AppInfo]) -> Result<&'a AppInfo> {
        if let Some(app) = apps.iter().find(|a| self.matches(a)) {
            return Ok(app);
        }
        let query = match self {
            Self::Name(q) | Self::BundleId(q) => q,
            Self::Focused | Self::Pid(_) => {
                return Err(Error::app_not_running(&self.to_string()))
            }
        };

        let ranked = rank_apps(query, apps);
        let Some(best) = ranked.first() else {
            return Err(Error::app_not_running(&self.to_string()));
        };
        let threshold = if best.kind == AppMatchKind::Fuzzy {
            0.05
        } else {
            0.1
        };
        let close: Vec<&AppMatch> = ranked
            .iter()
            .filter(|m| (best.score - m.score).abs() < threshold)
            .collect();
        if close.len() > 1 {
            let candidates: Vec<serde_json::Value> = close
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "name": m.app.name,
                        "pid": m.app.pid,
                        "match": m.kind,
                        "score": m.score,
                    })
                })
                .collect();
            return Err(Error::ambiguous_app(query, serde_json::Value::Array(candidates)));
        }
        debug!(
            target = %self,
            app = %best.app.name,
            score = best.score,
            kind = ?best.kind,
            "application matched"
        );
        Ok(best.app)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMatchKind {
    Prefix,
    Contains,
    BundleContains,
    Fuzzy,
}

#[derive(Debug, Clone)]
pub struct AppMatch<'a> {
    pub app: &'a AppInfo,
    pub score: f64,
    pub kind: AppMatchKind,
}

/// Non-exact candidates for `query`, best first, one per pid.
pub fn rank_apps<'a>(query: &str, apps: &'a [AppInfo]) -> Vec<AppMatch<'a>> {
    let query = query.to_lowercase();
    let q = query.len() as f64;
    let mut ranked: Vec<AppMatch> = apps
        .iter()
        .filter_map(|app| {
            let name = app.name.to_lowercase();
            let len = name.len().max(1) as f64;
            let (score, kind) = if name.starts_with(&query) {
                (q / len, AppMatchKind::Prefix)
            } else if name.contains(&query) {
                (q / len * 0.8, AppMatchKind::Contains)
            } else if let Some(bundle) = app
                .bundle_id
                .as_deref()
                .filter(|b| b.to_lowercase().contains(&query))
            {
                (q / bundle.len() as f64 * 0.6, AppMatchKind::BundleContains)
            } else {
                let similarity = strsim::jaro_winkler(&name, &query);
                if similarity < 0.7 {
                    return None;
                }
                (similarity * 0.9, AppMatchKind::Fuzzy)
            };
            Some(AppMatch { app, score, kind })
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut seen = std::collections::HashSet::new();
    ranked.retain(|m| seen.insert(m.app.pid));
    ranked
}

impl fmt::Display for AppTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Focused => write!(f, "focused"),
            Self::Pid(pid) => write!(f, "PID:{}", pid),
            Self::BundleId(id) => write!(f, "{}", id),
            Self::Name(name) => write!(f, "{}", name),
        }
    }
}

/// A notification as delivered by the backend.
#[derive(Debug, Clone)]
pub struct NativeNotification {
    pub notification: Notification,
    pub node: Option<NativeHandle>,
    pub pid: i32,
}

pub type NotificationSink = Arc<dyn Fn(NativeNotification) + Send + Sync>;

/// A live OS-level callback registration.
pub trait Registration: Send {
    /// Stop delivery. No sink call may start after this returns.
    fn unregister(self: Box<Self>);
}

/// Process-level entry points of one platform.
pub trait AccessibilityEngine: Send + Sync {
    fn has_permission(&self) -> bool;

    fn request_permission(&self) -> bool {
        self.has_permission()
    }

    fn applications(&self) -> Result<Vec<AppInfo>>;

    /// Application root node for a target.
    fn application(&self, target: &AppTarget) -> Result<(AppInfo, NativeHandle)>;

    fn focused_application(&self) -> Result<(AppInfo, NativeHandle)>;

    fn focused_element(&self) -> Result<NativeHandle>;

    /// Deepest element at a screen point, answered by the OS hit-test.
    fn element_at_point(&self, point: Point) -> Result<NativeHandle>;

    fn subscribe(
        &self,
        pid: i32,
        notification: &Notification,
        sink: NotificationSink,
    ) -> Result<Box<dyn Registration>>;
}

/// The backend for the OS this binary was built for.
#[cfg(target_os = "macos")]
pub fn default_engine() -> Result<Arc<dyn AccessibilityEngine>> {
    Ok(Arc::new(macos::MacEngine::new()))
}

#[cfg(not(target_os = "macos"))]
pub fn default_engine() -> Result<Arc<dyn AccessibilityEngine>> {
    current::ensure_accessibility()?;
    Err(Error::not_implemented("Live accessibility access"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn app_target_forms() {
        assert_eq!(AppTarget::parse("focused").unwrap(), AppTarget::Focused);
        assert_eq!(AppTarget::parse("PID:42").unwrap(), AppTarget::Pid(42));
        assert_eq!(
            AppTarget::parse("com.apple.Safari").unwrap(),
            AppTarget::BundleId("com.apple.Safari".to_string())
        );
        assert_eq!(
            AppTarget::parse("Google Chrome").unwrap(),
            AppTarget::Name("Google Chrome".to_string())
        );
        assert!(AppTarget::parse("PID:abc").is_err());
        assert!(AppTarget::parse("  ").is_err());
    }

    #[test]
    fn name_match_ignores_case() {
        let app = AppInfo {
            name: "Safari".to_string(),
            bundle_id: Some("com.apple.Safari".to_string()),
            pid: 7,
        };
        assert!(AppTarget::Name("safari".to_string()).matches(&app));
        assert!(AppTarget::BundleId("com.apple.Safari".to_string()).matches(&app));
        assert!(!AppTarget::Pid(8).matches(&app));
    }

    fn running() -> Vec<AppInfo> {
        [
            ("Firefox", "org.mozilla.firefox", 1234),
            ("Google Chrome", "com.google.Chrome", 5678),
            ("Visual Studio Code", "com.microsoft.VSCode", 9012),
            ("Terminal", "com.apple.Terminal", 3456),
        ]
        .iter()
        .map(|(name, bundle, pid)| AppInfo {
            name: name.to_string(),
            bundle_id: Some(bundle.to_string()),
            pid: *pid,
        })
        .collect()
    }

    fn select(query: &str) -> Result<i32> {
        let apps = running();
        AppTarget::parse(query)?.select(&apps).map(|a| a.pid)
    }

    #[test]
    fn partial_and_fuzzy_names_resolve() {
        assert_eq!(select("firefox").unwrap(), 1234);
        assert_eq!(select("fire").unwrap(), 1234);
        assert_eq!(select("chrome").unwrap(), 5678);
        assert_eq!(select("Visual Studio").unwrap(), 9012);
        assert_eq!(select("Firefx").unwrap(), 1234);
        assert_eq!(select("com.microsoft.VSCode").unwrap(), 9012);
        assert_eq!(select("mozilla").unwrap(), 1234);
    }

    #[test]
    fn unknown_and_ambiguous_names() {
        assert_eq!(select("Photoshop").unwrap_err().code, ErrorCode::AppNotRunning);

        let mut apps = running();
        apps.push(AppInfo {
            name: "Terminus".to_string(),
            bundle_id: None,
            pid: 7777,
        });
        let err = AppTarget::parse("Termin").unwrap().select(&apps).unwrap_err();
        assert_eq!(err.code, ErrorCode::AmbiguousMatch);
        let context = err.context.unwrap();
        assert_eq!(context["candidates"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn exact_match_beats_partial_ones() {
        let mut apps = running();
        apps.push(AppInfo {
            name: "Fire".to_string(),
            bundle_id: None,
            pid: 42,
        });
        let chosen = AppTarget::Name("fire".to_string()).select(&apps).unwrap();
        assert_eq!(chosen.pid, 42);
    }
}
