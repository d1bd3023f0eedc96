//! Structured errors with a stable machine-readable kind

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{}] {message}", .code.kind())]
pub struct Error {
    #[serde(rename = "kind")]
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ElementNotFound,
    AmbiguousMatch,
    StaleElement,
    LocatorPathNotFound,
    SearchTimeout,
    ActionNotSupported,
    PermissionDenied,
    SessionNotFound,
    SessionCorrupted,
    InvalidCriterion,
    InvalidCommand,
    AppNotRunning,
    NotImplemented,
    Cancelled,
    SystemError,
}

impl ErrorCode {
    /// Stable string callers branch on. Matches the serde representation.
    pub fn kind(self) -> &'static str {
        match self {
            Self::ElementNotFound => "ELEMENT_NOT_FOUND",
            Self::AmbiguousMatch => "AMBIGUOUS_MATCH",
            Self::StaleElement => "STALE_ELEMENT",
            Self::LocatorPathNotFound => "LOCATOR_PATH_NOT_FOUND",
            Self::SearchTimeout => "SEARCH_TIMEOUT",
            Self::ActionNotSupported => "ACTION_NOT_SUPPORTED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionCorrupted => "SESSION_CORRUPTED",
            Self::InvalidCriterion => "INVALID_CRITERION",
            Self::InvalidCommand => "INVALID_COMMAND",
            Self::AppNotRunning => "APP_NOT_RUNNING",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::Cancelled => "CANCELLED",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }

    /// Whether re-resolving or re-running discovery can fix the failure.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            Self::PermissionDenied | Self::SystemError | Self::NotImplemented
        )
    }
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            suggestions: Vec::new(),
            context: None,
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.code.kind()
    }

    pub fn element_not_found(query: &str) -> Self {
        Self::new(
            ErrorCode::ElementNotFound,
            format!("No element matching: {}", query),
        )
    }

    pub fn ambiguous(query: &str, count: usize, candidates: serde_json::Value) -> Self {
        Self::new(
            ErrorCode::AmbiguousMatch,
            format!("'{}' matched {} elements, expected 1", query, count),
        )
        .with_suggestions(vec![
            "Add criteria (identifier, title) to narrow the match".to_string(),
            "Use a path hint to restrict the search to one window".to_string(),
        ])
        .with_context(serde_json::json!({ "candidates": candidates }))
    }

    /// Several running applications fit a name about equally well.
    pub fn ambiguous_app(target: &str, candidates: serde_json::Value) -> Self {
        Self::new(
            ErrorCode::AmbiguousMatch,
            format!("Multiple applications match '{}'", target),
        )
        .with_suggestions(vec![
            "Use the full application name or its bundle identifier".to_string(),
            "Use PID:<n> to pick one process".to_string(),
        ])
        .with_context(serde_json::json!({ "candidates": candidates }))
    }

    pub fn stale(what: &str) -> Self {
        Self::new(
            ErrorCode::StaleElement,
            format!("Element is no longer available: {}", what),
        )
        .with_suggestions(vec!["Re-run the query or discovery and retry".to_string()])
    }

    pub fn path_not_found(step: usize, hint: &str, depth: usize) -> Self {
        Self::new(
            ErrorCode::LocatorPathNotFound,
            format!(
                "Path hint #{} ({}) not found within depth {}",
                step + 1,
                hint,
                depth
            ),
        )
        .with_context(serde_json::json!({ "step": step, "depth": depth }))
    }

    pub fn timeout(what: &str, budget_ms: u64) -> Self {
        Self::new(
            ErrorCode::SearchTimeout,
            format!("Timeout after {}ms: {}", budget_ms, what),
        )
    }

    pub fn action_not_supported(action: &str, available: &[String]) -> Self {
        Self::new(
            ErrorCode::ActionNotSupported,
            format!("Action '{}' is not supported by the element", action),
        )
        .with_context(serde_json::json!({ "available": available }))
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message).with_suggestions(vec![
            "Enable the host process in System Settings > Privacy & Security > Accessibility"
                .to_string(),
        ])
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("Session not found: {}", id),
        )
        .with_suggestions(vec!["Run discovery (collectAll) to create a session".to_string()])
    }

    pub fn session_corrupted(id: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::SessionCorrupted,
            format!("Session '{}' could not be read: {}", id, reason),
        )
    }

    pub fn invalid_criterion(criterion: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::InvalidCriterion,
            format!("Invalid criterion '{}': {}", criterion, reason),
        )
    }

    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidCommand, reason)
    }

    pub fn app_not_running(app: &str) -> Self {
        Self::new(ErrorCode::AppNotRunning, format!("App not running: {}", app))
    }

    pub fn not_implemented(what: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("{} is not implemented on this platform", what),
        )
    }

    pub fn cancelled(what: &str) -> Self {
        Self::new(ErrorCode::Cancelled, format!("Cancelled: {}", what))
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SystemError, message)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Self::system(format!("{:#}", e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::system(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_serialized_code() {
        let err = Error::stale("B1");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "STALE_ELEMENT");
        assert_eq!(err.kind(), "STALE_ELEMENT");
    }

    #[test]
    fn display_carries_kind() {
        let err = Error::path_not_found(1, "identifier:toolbar", 3);
        assert!(err.to_string().starts_with("[LOCATOR_PATH_NOT_FOUND]"));
        assert!(err.to_string().contains("#2"));
    }

    #[test]
    fn permission_is_not_recoverable() {
        assert!(!ErrorCode::PermissionDenied.is_recoverable());
        assert!(ErrorCode::StaleElement.is_recoverable());
    }
}
