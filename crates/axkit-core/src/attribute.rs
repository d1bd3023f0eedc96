//! Attribute names and their synonyms

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical attribute, resolved from one of its accepted spellings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Role,
    Subrole,
    RoleDescription,
    Identifier,
    Title,
    Value,
    Description,
    Help,
    Placeholder,
    Enabled,
    Focused,
    Hidden,
    Busy,
    Frame,
    Position,
    Size,
    Actions,
    Pid,
    DomClassList,
    DomIdentifier,
    Url,
    /// Any other `AX*` attribute, passed through to the backend untouched.
    Raw(String),
}

impl Attribute {
    /// Resolve a user-supplied name. Unknown non-`AX` names resolve to `None`.
    pub fn resolve(name: &str) -> Option<Self> {
        let attr = match name.trim().to_ascii_lowercase().as_str() {
            "role" | "axrole" => Self::Role,
            "subrole" | "axsubrole" => Self::Subrole,
            "roledescription" | "role_description" | "axroledescription" => {
                Self::RoleDescription
            }
            "identifier" | "id" | "axidentifier" => Self::Identifier,
            "title" | "name" | "axtitle" => Self::Title,
            "value" | "axvalue" => Self::Value,
            "description" | "desc" | "label" | "axdescription" => Self::Description,
            "help" | "axhelp" => Self::Help,
            "placeholder" | "placeholdervalue" | "axplaceholdervalue" => Self::Placeholder,
            "enabled" | "axenabled" => Self::Enabled,
            "focused" | "axfocused" => Self::Focused,
            "hidden" | "axhidden" => Self::Hidden,
            "busy" | "axelementbusy" => Self::Busy,
            "frame" | "bounds" | "axframe" => Self::Frame,
            "position" | "axposition" => Self::Position,
            "size" | "axsize" => Self::Size,
            "actions" | "axactions" => Self::Actions,
            "pid" => Self::Pid,
            "domclasslist" | "classlist" | "class" | "axdomclasslist" => Self::DomClassList,
            "domidentifier" | "domid" | "axdomidentifier" => Self::DomIdentifier,
            "url" | "axurl" => Self::Url,
            _ => {
                let trimmed = name.trim();
                if trimmed.len() > 2 && trimmed.starts_with("AX") {
                    Self::Raw(trimmed.to_string())
                } else {
                    return None;
                }
            }
        };
        Some(attr)
    }

    /// Canonical native attribute name. `Pid` and `Actions` are not native
    /// attributes; the element wrapper answers them from the handle itself.
    pub fn ax_name(&self) -> &str {
        match self {
            Self::Role => "AXRole",
            Self::Subrole => "AXSubrole",
            Self::RoleDescription => "AXRoleDescription",
            Self::Identifier => "AXIdentifier",
            Self::Title => "AXTitle",
            Self::Value => "AXValue",
            Self::Description => "AXDescription",
            Self::Help => "AXHelp",
            Self::Placeholder => "AXPlaceholderValue",
            Self::Enabled => "AXEnabled",
            Self::Focused => "AXFocused",
            Self::Hidden => "AXHidden",
            Self::Busy => "AXElementBusy",
            Self::Frame => "AXFrame",
            Self::Position => "AXPosition",
            Self::Size => "AXSize",
            Self::Actions => "AXActions",
            Self::Pid => "AXPid",
            Self::DomClassList => "AXDOMClassList",
            Self::DomIdentifier => "AXDOMIdentifier",
            Self::Url => "AXURL",
            Self::Raw(name) => name,
        }
    }

    /// Attributes whose string form is a token list.
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, Self::DomClassList)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ax_name())
    }
}

pub mod roles {
    pub const APPLICATION: &str = "AXApplication";
    pub const WINDOW: &str = "AXWindow";
    pub const BUTTON: &str = "AXButton";
    pub const TEXT_FIELD: &str = "AXTextField";
    pub const TEXT_AREA: &str = "AXTextArea";
    pub const STATIC_TEXT: &str = "AXStaticText";
    pub const GROUP: &str = "AXGroup";
    pub const TOOLBAR: &str = "AXToolbar";
    pub const LINK: &str = "AXLink";
    pub const CHECK_BOX: &str = "AXCheckBox";
    pub const IMAGE: &str = "AXImage";
}

pub mod actions {
    pub const PRESS: &str = "AXPress";
    pub const CONFIRM: &str = "AXConfirm";
    pub const SHOW_MENU: &str = "AXShowMenu";
    pub const RAISE: &str = "AXRaise";
    pub const INCREMENT: &str = "AXIncrement";
    pub const DECREMENT: &str = "AXDecrement";
    /// Pseudo-action: write `actionValue` into `AXValue`.
    pub const SET_VALUE: &str = "AXSetValue";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synonyms_resolve_to_one_attribute() {
        assert_eq!(Attribute::resolve("role"), Some(Attribute::Role));
        assert_eq!(Attribute::resolve("AXRole"), Some(Attribute::Role));
        assert_eq!(Attribute::resolve("desc"), Some(Attribute::Description));
        assert_eq!(Attribute::resolve("AXDescription"), Some(Attribute::Description));
    }

    #[test]
    fn raw_ax_names_pass_through() {
        assert_eq!(
            Attribute::resolve("AXSelectedText"),
            Some(Attribute::Raw("AXSelectedText".to_string()))
        );
        assert_eq!(Attribute::resolve("AXSelectedText").unwrap().ax_name(), "AXSelectedText");
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        assert_eq!(Attribute::resolve("colour"), None);
        assert_eq!(Attribute::resolve("AX"), None);
    }
}
