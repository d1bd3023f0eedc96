//! Snapshots of discovered elements
//!
//! Records are plain data. They never hold a live handle, so they can be
//! persisted and read back by another process.

use crate::attribute::Attribute;
use crate::element::Element;
use crate::ids::ElementCategory;
use crate::platform::AppInfo;
use crate::value::Frame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetailLevel {
    #[default]
    Essential,
    Full,
}

impl DetailLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "essential" | "minimal" => Some(Self::Essential),
            "full" | "all" => Some(Self::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub category: ElementCategory,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subrole: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_ids: Vec<String>,
    #[serde(default)]
    pub depth: usize,
    /// Extra attributes a query asked for, by the name it used.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

fn enabled_default() -> bool {
    true
}

impl ElementRecord {
    pub fn new(role: &str) -> Self {
        Self {
            id: String::new(),
            category: ElementCategory::from_role(role),
            role: role.to_string(),
            subrole: None,
            title: None,
            label: None,
            value: None,
            description: None,
            identifier: None,
            frame: None,
            enabled: true,
            actions: Vec::new(),
            parent_id: None,
            children_ids: Vec::new(),
            depth: 0,
            attributes: BTreeMap::new(),
        }
    }

    /// Read an element into a record. `None` when the node is gone or has no
    /// role.
    pub fn snapshot(element: &Element, detail: DetailLevel, depth: usize) -> Option<Self> {
        let role = element.try_role().ok()??;
        let mut record = Self::new(&role);
        record.title = element.title();
        record.label = element.label();
        record.value = element.value_string();
        record.identifier = element.identifier();
        record.frame = element.frame();
        record.enabled = element.is_enabled();
        record.depth = depth;

        if detail == DetailLevel::Full {
            record.subrole = element.subrole();
            record.description = element.description();
            record.actions = element.actions();
        }
        Some(record)
    }

    /// Attach the named attributes. Unknown or unreadable names come back as
    /// `null` so callers see every name they asked for.
    pub fn with_attributes(mut self, element: &Element, names: &[String]) -> Self {
        for name in names {
            let value = Attribute::resolve(name)
                .and_then(|a| element.attribute(&a))
                .map(|v| v.to_json())
                .unwrap_or(serde_json::Value::Null);
            self.attributes.insert(name.clone(), value);
        }
        self
    }

    /// Case-insensitive text search over the record's readable fields.
    pub fn matches_query(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return true;
        }
        if self.id.eq_ignore_ascii_case(&q) {
            return true;
        }
        [
            Some(&self.role),
            self.title.as_ref(),
            self.label.as_ref(),
            self.value.as_ref(),
            self.description.as_ref(),
            self.identifier.as_ref(),
        ]
        .into_iter()
        .flatten()
        .any(|s| s.to_lowercase().contains(&q))
    }
}

/// Where a discovery batch came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppContext {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub pid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_bounds: Option<Frame>,
}

impl From<&AppInfo> for AppContext {
    fn from(app: &AppInfo) -> Self {
        Self {
            name: app.name.clone(),
            bundle_id: app.bundle_id.clone(),
            pid: app.pid,
            window_title: None,
            window_bounds: None,
        }
    }
}

/// One discovery batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub app: AppContext,
    pub elements: Vec<ElementRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub detail_level: DetailLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    /// The traversal ran out of time; `elements` is what was reached.
    #[serde(default)]
    pub partial: bool,
}

impl DetectionResult {
    /// Build a batch from records in traversal order, with `parents[i]` the
    /// index of record `i`'s nearest collected ancestor, and `ids` from
    /// [`crate::ElementIdGenerator::assign_ids`].
    pub fn link(
        app: AppContext,
        mut elements: Vec<ElementRecord>,
        parents: &[Option<usize>],
        ids: Vec<String>,
        detail_level: DetailLevel,
    ) -> Self {
        for (record, id) in elements.iter_mut().zip(ids.iter()) {
            record.id = id.clone();
            record.children_ids.clear();
        }
        for (i, parent) in parents.iter().enumerate().take(elements.len()) {
            if let Some(p) = *parent {
                if p < elements.len() && p != i {
                    let child_id = elements[i].id.clone();
                    elements[i].parent_id = Some(elements[p].id.clone());
                    elements[p].children_ids.push(child_id);
                }
            }
        }

        Self {
            app,
            elements,
            created_at: Utc::now(),
            detail_level,
            screenshot_path: None,
            partial: false,
        }
    }

    pub fn element(&self, id: &str) -> Option<&ElementRecord> {
        self.elements.iter().find(|e| e.id.eq_ignore_ascii_case(id))
    }

    pub fn find(&self, query: &str) -> Vec<&ElementRecord> {
        self.elements
            .iter()
            .filter(|e| e.matches_query(query))
            .collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.id.as_str()).collect()
    }
}
