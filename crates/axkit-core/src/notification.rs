//! Accessibility notification names

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Notification {
    ValueChanged,
    TitleChanged,
    FocusedElementChanged,
    FocusedWindowChanged,
    ElementDestroyed,
    Created,
    WindowCreated,
    WindowMoved,
    WindowResized,
    SelectedTextChanged,
    SelectedChildrenChanged,
    LayoutChanged,
    Other(String),
}

impl Notification {
    pub fn parse(name: &str) -> Self {
        let trimmed = name.trim();
        let key = trimmed
            .strip_prefix("AX")
            .unwrap_or(trimmed)
            .replace(['_', '-'], "")
            .to_ascii_lowercase();
        match key.as_str() {
            "valuechanged" => Self::ValueChanged,
            "titlechanged" => Self::TitleChanged,
            "focuseduielementchanged" | "focusedelementchanged" | "focuschanged" => {
                Self::FocusedElementChanged
            }
            "focusedwindowchanged" => Self::FocusedWindowChanged,
            "uielementdestroyed" | "elementdestroyed" | "destroyed" => Self::ElementDestroyed,
            "created" => Self::Created,
            "windowcreated" => Self::WindowCreated,
            "windowmoved" | "moved" => Self::WindowMoved,
            "windowresized" | "resized" => Self::WindowResized,
            "selectedtextchanged" => Self::SelectedTextChanged,
            "selectedchildrenchanged" => Self::SelectedChildrenChanged,
            "layoutchanged" => Self::LayoutChanged,
            _ => Self::Other(trimmed.to_string()),
        }
    }

    pub fn ax_name(&self) -> &str {
        match self {
            Self::ValueChanged => "AXValueChanged",
            Self::TitleChanged => "AXTitleChanged",
            Self::FocusedElementChanged => "AXFocusedUIElementChanged",
            Self::FocusedWindowChanged => "AXFocusedWindowChanged",
            Self::ElementDestroyed => "AXUIElementDestroyed",
            Self::Created => "AXCreated",
            Self::WindowCreated => "AXWindowCreated",
            Self::WindowMoved => "AXWindowMoved",
            Self::WindowResized => "AXWindowResized",
            Self::SelectedTextChanged => "AXSelectedTextChanged",
            Self::SelectedChildrenChanged => "AXSelectedChildrenChanged",
            Self::LayoutChanged => "AXLayoutChanged",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ax_name())
    }
}

impl From<String> for Notification {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<Notification> for String {
    fn from(n: Notification) -> Self {
        n.ax_name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_short_and_ax_names() {
        assert_eq!(Notification::parse("AXValueChanged"), Notification::ValueChanged);
        assert_eq!(Notification::parse("value_changed"), Notification::ValueChanged);
        assert_eq!(
            Notification::parse("AXFocusedUIElementChanged"),
            Notification::FocusedElementChanged
        );
    }

    #[test]
    fn unknown_names_round_trip() {
        let n = Notification::parse("AXMenuOpened");
        assert_eq!(n, Notification::Other("AXMenuOpened".to_string()));
        assert_eq!(n.ax_name(), "AXMenuOpened");
    }
}
