//! Windows platform implementation
//!
//! Not implemented. A UI Automation backend would plug in behind
//! `AccessibilityEngine`; until then every live call reports `NotImplemented`.

use crate::{Error, Result};

pub fn has_accessibility() -> bool {
    false
}

pub fn ensure_accessibility() -> Result<()> {
    Err(Error::not_implemented("Windows (UI Automation) accessibility")
        .with_suggestions(vec!["Use --fixture to run against a captured tree".to_string()]))
}
