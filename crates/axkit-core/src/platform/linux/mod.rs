//! Linux platform implementation
//!
//! Not implemented. An AT-SPI2 backend would plug in behind
//! `AccessibilityEngine`; until then every live call reports `NotImplemented`.

use crate::{Error, Result};

/// AT-SPI is not wired up, so there is nothing to be trusted for yet.
pub fn has_accessibility() -> bool {
    false
}

pub fn ensure_accessibility() -> Result<()> {
    Err(Error::not_implemented("Linux (AT-SPI2) accessibility")
        .with_suggestions(vec!["Use --fixture to run against a captured tree".to_string()]))
}
