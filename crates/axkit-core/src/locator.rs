//! Locator - composite query over the accessibility tree
//!
//! Syntax (text form):
//!   role:AXButton AND title:Submit    - every criterion must match
//!   title~:ok OR title~:done          - any criterion may match
//!   role:AXWindow@1                   - path hint, searched within 1 level
//!
//! An empty locator matches every element.

use crate::criteria::{Criterion, CriterionSpec, MatchType};
use crate::element::Element;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Depth a path hint searches when none is given.
pub const DEFAULT_HINT_DEPTH: usize = 3;

/// Waypoint searched for below the previous one, at most `max_depth` levels
/// down.
#[derive(Debug, Clone, PartialEq)]
pub struct PathHint {
    pub criterion: Criterion,
    pub max_depth: usize,
}

impl PathHint {
    pub fn new(criterion: Criterion, max_depth: usize) -> Self {
        Self {
            criterion,
            max_depth,
        }
    }

    /// `attr<op>value[@depth]`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((head, depth)) = s.rsplit_once('@') {
            if let Ok(depth) = depth.trim().parse::<usize>() {
                return Ok(Self::new(Criterion::parse(head)?, depth));
            }
        }
        Ok(Self::new(Criterion::parse(s)?, DEFAULT_HINT_DEPTH))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.criterion, self.max_depth)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LocatorSpec", into = "LocatorSpec")]
pub struct Locator {
    path_hints: Vec<PathHint>,
    criteria: Vec<Criterion>,
    match_all: bool,
}

impl Default for Locator {
    fn default() -> Self {
        Self::new()
    }
}

impl Locator {
    pub fn new() -> Self {
        Self {
            path_hints: Vec::new(),
            criteria: Vec::new(),
            match_all: true,
        }
    }

    pub fn role(role: &str) -> Self {
        Self::new().with(Criterion::role(role))
    }

    pub fn title(title: &str) -> Self {
        Self::new().with(Criterion::title(title))
    }

    pub fn identifier(identifier: &str) -> Self {
        Self::new().with(Criterion::identifier(identifier))
    }

    pub fn with(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn path(mut self, criterion: Criterion, max_depth: usize) -> Self {
        self.path_hints.push(PathHint::new(criterion, max_depth));
        self
    }

    pub fn match_all(mut self, match_all: bool) -> Self {
        self.match_all = match_all;
        self
    }

    pub fn path_hints(&self) -> &[PathHint] {
        &self.path_hints
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    pub fn is_empty(&self) -> bool {
        self.path_hints.is_empty() && self.criteria.is_empty()
    }

    /// Parse criteria joined by ` AND ` or ` OR ` (not both). An empty string
    /// or `*` is the empty locator.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::new());
        }

        let has_and = s.contains(" AND ");
        let has_or = s.contains(" OR ");
        if has_and && has_or {
            return Err(Error::invalid_criterion(
                s,
                "cannot mix AND and OR in one locator",
            ));
        }

        let separator = if has_or { " OR " } else { " AND " };
        let criteria = s
            .split(separator)
            .map(Criterion::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path_hints: Vec::new(),
            criteria,
            match_all: !has_or,
        })
    }

    /// Add path hints parsed with [`PathHint::parse`], in root-to-target order.
    pub fn with_path<S: AsRef<str>>(mut self, hints: &[S]) -> Result<Self> {
        for hint in hints {
            self.path_hints.push(PathHint::parse(hint.as_ref())?);
        }
        Ok(self)
    }

    /// Whether a candidate (already reached through any path hints) is a
    /// target. Path hints are not consulted here.
    pub fn matches(&self, element: &Element) -> bool {
        if self.criteria.is_empty() {
            return true;
        }
        if self.match_all {
            self.criteria.iter().all(|c| c.matches(element))
        } else {
            self.criteria.iter().any(|c| c.matches(element))
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hint in &self.path_hints {
            write!(f, "{} > ", hint)?;
        }
        if self.criteria.is_empty() {
            return write!(f, "*");
        }
        let sep = if self.match_all { " AND " } else { " OR " };
        let parts: Vec<String> = self.criteria.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(sep))
    }
}

/// Wire form of one path hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHintSpec {
    pub attribute: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_hint_depth")]
    pub depth: usize,
    #[serde(default, alias = "matchType")]
    pub match_type: MatchType,
}

fn default_hint_depth() -> usize {
    DEFAULT_HINT_DEPTH
}

fn default_match_all() -> bool {
    true
}

/// Wire form of a locator, as it appears in command envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorSpec {
    #[serde(default, alias = "pathFromRoot", skip_serializing_if = "Vec::is_empty")]
    pub path_from_root: Vec<PathHintSpec>,
    #[serde(default)]
    pub criteria: Vec<CriterionSpec>,
    #[serde(rename = "matchAll", alias = "match_all", default = "default_match_all")]
    pub match_all: bool,
}

impl TryFrom<LocatorSpec> for Locator {
    type Error = Error;

    fn try_from(spec: LocatorSpec) -> Result<Self> {
        let path_hints = spec
            .path_from_root
            .into_iter()
            .map(|h| {
                Ok(PathHint::new(
                    Criterion::new(&h.attribute, &h.value, h.match_type)?,
                    h.depth,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let criteria = spec
            .criteria
            .into_iter()
            .map(Criterion::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            path_hints,
            criteria,
            match_all: spec.match_all,
        })
    }
}

impl From<Locator> for LocatorSpec {
    fn from(locator: Locator) -> Self {
        Self {
            path_from_root: locator
                .path_hints
                .into_iter()
                .map(|h| {
                    let c = CriterionSpec::from(h.criterion);
                    PathHintSpec {
                        attribute: c.attribute,
                        value: c.value,
                        depth: h.max_depth,
                        match_type: c.match_type,
                    }
                })
                .collect(),
            criteria: locator.criteria.into_iter().map(CriterionSpec::from).collect(),
            match_all: locator.match_all,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{MemoryTree, NodeSpec};

    fn buttons() -> (Element, Element) {
        let tree = MemoryTree::new();
        let app = tree.add_app("Form", None, 3);
        let submit = tree.add_node(app, NodeSpec::new("AXButton").title("Submit"));
        let cancel = tree.add_node(app, NodeSpec::new("AXButton").title("Cancel"));
        (tree.element(submit), tree.element(cancel))
    }

    #[test]
    fn parse_compound() {
        let loc = Locator::parse("role:AXButton AND title:Submit").unwrap();
        assert_eq!(loc.criteria().len(), 2);
        assert!(loc.is_match_all());

        let loc = Locator::parse("title:Submit OR title:Cancel").unwrap();
        assert!(!loc.is_match_all());

        assert!(Locator::parse("a:1 AND b:2 OR c:3").is_err());
        assert!(Locator::parse("*").unwrap().is_empty());
    }

    #[test]
    fn and_versus_or() {
        let (submit, cancel) = buttons();
        let and = Locator::parse("role:AXButton AND title:Submit").unwrap();
        assert!(and.matches(&submit));
        assert!(!and.matches(&cancel));

        let or = Locator::parse("title:Submit OR title:Cancel").unwrap();
        assert!(or.matches(&submit));
        assert!(or.matches(&cancel));
    }

    #[test]
    fn empty_locator_matches_everything() {
        let (submit, _) = buttons();
        assert!(Locator::new().matches(&submit));
    }

    #[test]
    fn path_hint_depth_suffix() {
        let hint = PathHint::parse("identifier:toolbar@3").unwrap();
        assert_eq!(hint.max_depth, 3);
        assert_eq!(hint.criterion.expected(), "toolbar");

        let hint = PathHint::parse("title:user@example.com").unwrap();
        assert_eq!(hint.max_depth, DEFAULT_HINT_DEPTH);
        assert_eq!(hint.criterion.expected(), "user@example.com");
    }

    #[test]
    fn envelope_form() {
        let json = r#"{
            "path_from_root": [{"attribute": "role", "value": "AXWindow", "depth": 1}],
            "criteria": [{"attribute": "title", "value": "Back", "match_type": "contains"}],
            "matchAll": false
        }"#;
        let loc: Locator = serde_json::from_str(json).unwrap();
        assert_eq!(loc.path_hints().len(), 1);
        assert_eq!(loc.path_hints()[0].max_depth, 1);
        assert!(!loc.is_match_all());
        assert_eq!(loc.to_string(), "role:AXWindow@1 > title~:Back");

        let back: Locator = serde_json::from_value(serde_json::to_value(&loc).unwrap()).unwrap();
        assert_eq!(back, loc);
    }
}
