//! Short, category-prefixed element ids ("B1", "T2", ...)
//!
//! Batch assignment sorts by visual position first so that two scans of the
//! same layout hand out the same ids, whatever order the OS listed children in.

use crate::record::ElementRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ElementCategory {
    Button,
    TextInput,
    Link,
    Checkbox,
    RadioButton,
    Slider,
    Menu,
    Image,
    Container,
    Text,
    /// Anything else, carrying its own prefix.
    Custom(String),
}

const KNOWN: [ElementCategory; 10] = [
    ElementCategory::Button,
    ElementCategory::TextInput,
    ElementCategory::Link,
    ElementCategory::Checkbox,
    ElementCategory::RadioButton,
    ElementCategory::Slider,
    ElementCategory::Menu,
    ElementCategory::Image,
    ElementCategory::Container,
    ElementCategory::Text,
];

/// Prefix used for roles with no category of their own.
pub const UNKNOWN_PREFIX: &str = "U";

impl ElementCategory {
    pub fn from_role(role: &str) -> Self {
        match role {
            "AXButton" | "AXMenuButton" | "AXPopUpButton" | "AXDisclosureTriangle" => {
                Self::Button
            }
            "AXTextField" | "AXTextArea" | "AXSearchField" | "AXSecureTextField"
            | "AXComboBox" => Self::TextInput,
            "AXLink" => Self::Link,
            "AXCheckBox" | "AXSwitch" => Self::Checkbox,
            "AXRadioButton" => Self::RadioButton,
            "AXSlider" | "AXIncrementor" | "AXScrollBar" => Self::Slider,
            "AXMenu" | "AXMenuBar" | "AXMenuItem" | "AXMenuBarItem" => Self::Menu,
            "AXImage" => Self::Image,
            "AXGroup" | "AXWindow" | "AXSheet" | "AXDrawer" | "AXScrollArea"
            | "AXSplitGroup" | "AXTabGroup" | "AXToolbar" | "AXList" | "AXTable"
            | "AXOutline" | "AXRow" | "AXCell" | "AXLayoutArea" | "AXWebArea"
            | "AXApplication" | "AXRadioGroup" => Self::Container,
            "AXStaticText" | "AXHeading" => Self::Text,
            _ => Self::Custom(UNKNOWN_PREFIX.to_string()),
        }
    }

    /// Build a custom category. The prefix keeps its ASCII letters only,
    /// upper-cased; a prefix that belongs to a known category yields that
    /// category instead, so ids stay unambiguous.
    pub fn custom(prefix: &str) -> Self {
        let cleaned: String = prefix
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.is_empty() {
            return Self::Custom(UNKNOWN_PREFIX.to_string());
        }
        Self::from_prefix(&cleaned)
    }

    fn from_prefix(prefix: &str) -> Self {
        KNOWN
            .iter()
            .find(|c| c.prefix() == prefix)
            .cloned()
            .unwrap_or_else(|| Self::Custom(prefix.to_string()))
    }

    pub fn prefix(&self) -> &str {
        match self {
            Self::Button => "B",
            Self::TextInput => "T",
            Self::Link => "L",
            Self::Checkbox => "C",
            Self::RadioButton => "R",
            Self::Slider => "S",
            Self::Menu => "M",
            Self::Image => "I",
            Self::Container => "G",
            Self::Text => "X",
            Self::Custom(prefix) => prefix,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Button => "button".to_string(),
            Self::TextInput => "textInput".to_string(),
            Self::Link => "link".to_string(),
            Self::Checkbox => "checkbox".to_string(),
            Self::RadioButton => "radioButton".to_string(),
            Self::Slider => "slider".to_string(),
            Self::Menu => "menu".to_string(),
            Self::Image => "image".to_string(),
            Self::Container => "container".to_string(),
            Self::Text => "text".to_string(),
            Self::Custom(prefix) => format!("custom:{}", prefix),
        }
    }
}

impl fmt::Display for ElementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<String> for ElementCategory {
    fn from(s: String) -> Self {
        if let Some(prefix) = s.strip_prefix("custom:") {
            return Self::custom(prefix);
        }
        KNOWN
            .iter()
            .find(|c| c.name() == s)
            .cloned()
            .unwrap_or_else(|| Self::custom(&s))
    }
}

impl From<ElementCategory> for String {
    fn from(c: ElementCategory) -> Self {
        c.name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub category: ElementCategory,
    pub index: usize,
}

/// Split an id into its category and index. Returns `None` for anything that
/// is not letters followed by digits.
pub fn parse_id(id: &str) -> Option<ParsedId> {
    let id = id.trim();
    let split = id.find(|c: char| !c.is_ascii_alphabetic())?;
    let (prefix, digits) = id.split_at(split);
    if prefix.is_empty() || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse::<usize>().ok()?;
    Some(ParsedId {
        category: ElementCategory::custom(prefix),
        index,
    })
}

/// Hands out ids, either one at a time or for a whole discovery batch.
pub struct ElementIdGenerator {
    counters: Mutex<HashMap<ElementCategory, usize>>,
    row_tolerance: f64,
}

impl Default for ElementIdGenerator {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl ElementIdGenerator {
    pub fn new(row_tolerance: f64) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            row_tolerance: if row_tolerance > 0.0 { row_tolerance } else { 1.0 },
        }
    }

    /// Next id for a category. Safe to call from several threads.
    pub fn generate_id(&self, category: &ElementCategory) -> String {
        let mut counters = self.counters.lock();
        let n = counters.entry(category.clone()).or_insert(0);
        *n += 1;
        format!("{}{}", category.prefix(), n)
    }

    pub fn reset(&self) {
        self.counters.lock().clear();
    }

    /// Ids for a batch, index-aligned with `records`.
    ///
    /// Order is row bucket (`floor(y / tolerance)`), then x; ties and
    /// unframed records keep their input order, unframed after framed.
    /// Batch counters are local, so incremental ids are left alone.
    pub fn assign_ids(&self, records: &[ElementRecord]) -> Vec<String> {
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by(|&a, &b| self.position_order(&records[a], &records[b]));

        let mut counters: HashMap<&ElementCategory, usize> = HashMap::new();
        let mut ids = vec![String::new(); records.len()];
        for i in order {
            let category = &records[i].category;
            let n = counters.entry(category).or_insert(0);
            *n += 1;
            ids[i] = format!("{}{}", category.prefix(), n);
        }
        ids
    }

    fn position_order(&self, a: &ElementRecord, b: &ElementRecord) -> Ordering {
        match (a.frame, b.frame) {
            (Some(fa), Some(fb)) => {
                let row_a = (fa.y / self.row_tolerance).floor();
                let row_b = (fb.y / self.row_tolerance).floor();
                row_a.total_cmp(&row_b).then(fa.x.total_cmp(&fb.x))
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}
