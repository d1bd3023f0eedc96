//! Single-attribute match rules
//!
//! Text syntax (one criterion):
//!   role:AXButton        - exact (case-sensitive)
//!   title~:submit        - contains (case-insensitive)
//!   title*:ok,cancel     - contains any comma-separated part (case-insensitive)
//!   identifier^:nav-     - prefix (case-sensitive)
//!   identifier$:-btn     - suffix (case-sensitive)
//!   value/:^\d+$         - regex
//!   help?:true           - attribute present (`false`: absent)

use crate::attribute::Attribute;
use crate::element::Element;
use crate::error::{Error, Result};
use crate::value::AttrValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    #[default]
    Exact,
    Contains,
    #[serde(alias = "contains_any")]
    ContainsAny,
    Prefix,
    Suffix,
    Regex,
    Exists,
}

impl MatchType {
    pub fn parse(s: &str) -> Result<Self> {
        let m = match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "" | "exact" | "equals" => Self::Exact,
            "contains" => Self::Contains,
            "containsany" => Self::ContainsAny,
            "prefix" | "startswith" => Self::Prefix,
            "suffix" | "endswith" => Self::Suffix,
            "regex" => Self::Regex,
            "exists" | "present" => Self::Exists,
            other => {
                return Err(Error::invalid_criterion(
                    s,
                    &format!("unknown match type '{}'", other),
                ))
            }
        };
        Ok(m)
    }

    fn operator(self) -> &'static str {
        match self {
            Self::Exact => ":",
            Self::Contains => "~:",
            Self::ContainsAny => "*:",
            Self::Prefix => "^:",
            Self::Suffix => "$:",
            Self::Regex => "/:",
            Self::Exists => "?:",
        }
    }

    fn from_operator(c: char) -> Option<Self> {
        match c {
            '~' => Some(Self::Contains),
            '*' => Some(Self::ContainsAny),
            '^' => Some(Self::Prefix),
            '$' => Some(Self::Suffix),
            '/' => Some(Self::Regex),
            '?' => Some(Self::Exists),
            _ => None,
        }
    }
}

/// Wire form of a criterion, as it appears in command envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionSpec {
    pub attribute: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, alias = "matchType")]
    pub match_type: MatchType,
}

/// A compiled criterion. Construction validates everything that can be
/// validated up front; evaluation never fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CriterionSpec", into = "CriterionSpec")]
pub struct Criterion {
    attribute: String,
    resolved: Option<Attribute>,
    expected: String,
    match_type: MatchType,
    folded: String,
    parts: Vec<String>,
    regex: Option<Regex>,
    pid: Option<i32>,
    present: bool,
}

impl Criterion {
    pub fn new(attribute: &str, expected: &str, match_type: MatchType) -> Result<Self> {
        let resolved = Attribute::resolve(attribute);
        let mut criterion = Self {
            attribute: attribute.to_string(),
            resolved,
            expected: expected.to_string(),
            match_type,
            folded: expected.to_lowercase(),
            parts: expected
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            regex: None,
            pid: None,
            present: true,
        };

        if match_type == MatchType::Regex {
            let re = Regex::new(expected).map_err(|e| {
                Error::invalid_criterion(&criterion.to_string(), &e.to_string())
            })?;
            criterion.regex = Some(re);
        }

        if criterion.resolved == Some(Attribute::Pid) {
            let pid = expected.trim().parse::<i32>().map_err(|_| {
                Error::invalid_criterion(&criterion.to_string(), "pid must be an integer")
            })?;
            criterion.pid = Some(pid);
        }

        if match_type == MatchType::Exists {
            criterion.present = match expected.trim().to_ascii_lowercase().as_str() {
                "" | "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                _ => {
                    return Err(Error::invalid_criterion(
                        &criterion.to_string(),
                        "presence expects true or false",
                    ))
                }
            };
        }

        Ok(criterion)
    }

    pub fn exact(attribute: &str, expected: &str) -> Result<Self> {
        Self::new(attribute, expected, MatchType::Exact)
    }

    pub fn contains(attribute: &str, expected: &str) -> Result<Self> {
        Self::new(attribute, expected, MatchType::Contains)
    }

    pub fn role(role: &str) -> Self {
        Self::infallible("role", role, MatchType::Exact)
    }

    pub fn title(title: &str) -> Self {
        Self::infallible("title", title, MatchType::Exact)
    }

    pub fn identifier(identifier: &str) -> Self {
        Self::infallible("identifier", identifier, MatchType::Exact)
    }

    // Only for match types and attributes that cannot fail validation.
    fn infallible(attribute: &str, expected: &str, match_type: MatchType) -> Self {
        Self {
            attribute: attribute.to_string(),
            resolved: Attribute::resolve(attribute),
            expected: expected.to_string(),
            match_type,
            folded: expected.to_lowercase(),
            parts: Vec::new(),
            regex: None,
            pid: None,
            present: true,
        }
    }

    /// Parse `attr<op>value`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (head, value) = s.split_once(':').ok_or_else(|| {
            Error::invalid_criterion(s, "expected format 'attr:value' or 'attr~:value'")
        })?;

        let mut attr = head.trim();
        let mut match_type = MatchType::Exact;
        if let Some(last) = attr.chars().last() {
            if let Some(m) = MatchType::from_operator(last) {
                match_type = m;
                attr = &attr[..attr.len() - last.len_utf8()];
            }
        }
        if attr.is_empty() {
            return Err(Error::invalid_criterion(s, "missing attribute name"));
        }
        Self::new(attr, value, match_type)
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn resolved(&self) -> Option<&Attribute> {
        self.resolved.as_ref()
    }

    pub fn expected(&self) -> &str {
        &self.expected
    }

    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    /// Evaluate against an element. Unknown attributes, unreadable attributes
    /// and stale nodes are non-matches.
    pub fn matches(&self, element: &Element) -> bool {
        let Some(attr) = &self.resolved else {
            return false;
        };

        if *attr == Attribute::Pid {
            return self.pid.is_some() && element.pid() == self.pid;
        }

        let value = element.attribute(attr);
        if self.match_type == MatchType::Exists {
            return value.is_some() == self.present;
        }
        let Some(value) = value else {
            return false;
        };
        self.matches_value(attr, &value)
    }

    pub fn matches_value(&self, attr: &Attribute, value: &AttrValue) -> bool {
        let token_level = attr.is_multi_valued() || matches!(value, AttrValue::List(_));
        if token_level
            && matches!(
                self.match_type,
                MatchType::Exact | MatchType::Contains | MatchType::ContainsAny
            )
        {
            return value.tokens().iter().any(|t| self.matches_str(t));
        }
        self.matches_str(&value.match_string())
    }

    fn matches_str(&self, actual: &str) -> bool {
        match self.match_type {
            MatchType::Exact => actual == self.expected,
            MatchType::Contains => actual.to_lowercase().contains(&self.folded),
            MatchType::ContainsAny => {
                let lower = actual.to_lowercase();
                self.parts.iter().any(|p| lower.contains(p.as_str()))
            }
            MatchType::Prefix => actual.starts_with(&self.expected),
            MatchType::Suffix => actual.ends_with(&self.expected),
            MatchType::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(actual)),
            MatchType::Exists => true,
        }
    }
}

impl PartialEq for Criterion {
    fn eq(&self, other: &Self) -> bool {
        self.attribute == other.attribute
            && self.expected == other.expected
            && self.match_type == other.match_type
    }
}

impl TryFrom<CriterionSpec> for Criterion {
    type Error = Error;

    fn try_from(spec: CriterionSpec) -> Result<Self> {
        Self::new(&spec.attribute, &spec.value, spec.match_type)
    }
}

impl From<Criterion> for CriterionSpec {
    fn from(c: Criterion) -> Self {
        Self {
            attribute: c.attribute,
            value: c.expected,
            match_type: c.match_type,
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.attribute,
            self.match_type.operator(),
            self.expected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::platform::memory::{MemoryTree, NodeSpec};

    fn button() -> Element {
        let tree = MemoryTree::new();
        let app = tree.add_app("Mail", None, 4242);
        let id = tree.add_node(
            app,
            NodeSpec::new("AXButton")
                .title("Send Message")
                .identifier("compose-send-btn")
                .attr(
                    "AXDOMClassList",
                    AttrValue::List(vec!["btn".into(), "btn-primary".into()]),
                ),
        );
        tree.element(id)
    }

    #[test]
    fn parse_simple() {
        let c = Criterion::parse("role:AXButton").unwrap();
        assert_eq!(c.attribute(), "role");
        assert_eq!(c.expected(), "AXButton");
        assert_eq!(c.match_type(), MatchType::Exact);
    }

    #[test]
    fn parse_operators() {
        assert_eq!(Criterion::parse("title~:send").unwrap().match_type(), MatchType::Contains);
        assert_eq!(Criterion::parse("title*:a,b").unwrap().match_type(), MatchType::ContainsAny);
        assert_eq!(Criterion::parse("id^:nav").unwrap().match_type(), MatchType::Prefix);
        assert_eq!(Criterion::parse("id$:btn").unwrap().match_type(), MatchType::Suffix);
        assert_eq!(Criterion::parse("value/:^a").unwrap().match_type(), MatchType::Regex);
        assert!(Criterion::parse("no-colon").is_err());
        assert!(Criterion::parse("~:x").is_err());
    }

    #[test]
    fn exact_is_case_sensitive_contains_is_not() {
        let el = button();
        assert!(Criterion::exact("title", "Send Message").unwrap().matches(&el));
        assert!(!Criterion::exact("title", "send message").unwrap().matches(&el));
        assert!(Criterion::contains("title", "SEND").unwrap().matches(&el));
    }

    #[test]
    fn contains_any_splits_on_comma() {
        let el = button();
        let c = Criterion::new("title", "cancel, message", MatchType::ContainsAny).unwrap();
        assert!(c.matches(&el));
        let c = Criterion::new("title", "cancel,close", MatchType::ContainsAny).unwrap();
        assert!(!c.matches(&el));
    }

    #[test]
    fn prefix_and_suffix_are_case_sensitive() {
        let el = button();
        assert!(Criterion::new("identifier", "compose-", MatchType::Prefix).unwrap().matches(&el));
        assert!(!Criterion::new("identifier", "Compose-", MatchType::Prefix).unwrap().matches(&el));
        assert!(Criterion::new("identifier", "-btn", MatchType::Suffix).unwrap().matches(&el));
        assert!(!Criterion::new("identifier", "-BTN", MatchType::Suffix).unwrap().matches(&el));
    }

    #[test]
    fn invalid_regex_fails_at_construction() {
        let err = Criterion::new("title", "(unclosed", MatchType::Regex).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCriterion);
        let ok = Criterion::new("title", r"^Send\s+\w+$", MatchType::Regex).unwrap();
        assert!(ok.matches(&button()));
    }

    #[test]
    fn unknown_attribute_never_matches() {
        let el = button();
        let c = Criterion::exact("colour", "red").unwrap();
        assert!(!c.matches(&el));
        let c = Criterion::new("colour", "", MatchType::Exists).unwrap();
        assert!(!c.matches(&el));
    }

    #[test]
    fn pid_is_exact_numeric() {
        let el = button();
        assert!(Criterion::contains("pid", "4242").unwrap().matches(&el));
        assert!(!Criterion::contains("pid", "424").unwrap().matches(&el));
        assert!(Criterion::exact("pid", "abc").is_err());
    }

    #[test]
    fn class_list_matches_per_token() {
        let el = button();
        assert!(Criterion::exact("domclasslist", "btn-primary").unwrap().matches(&el));
        assert!(!Criterion::exact("domclasslist", "btn btn-primary x").unwrap().matches(&el));
        assert!(Criterion::new("class", "danger,PRIMARY", MatchType::ContainsAny)
            .unwrap()
            .matches(&el));
    }

    #[test]
    fn presence() {
        let el = button();
        assert!(Criterion::parse("title?:true").unwrap().matches(&el));
        assert!(Criterion::parse("help?:false").unwrap().matches(&el));
        assert!(!Criterion::parse("help?:true").unwrap().matches(&el));
    }

    #[test]
    fn matching_is_repeatable() {
        let el = button();
        let c = Criterion::contains("title", "send").unwrap();
        let first = c.matches(&el);
        assert_eq!(first, c.matches(&el));
        assert_eq!(first, c.matches(&el.refreshed()));
    }

    #[test]
    fn serde_wire_form() {
        let c: Criterion = serde_json::from_str(
            r#"{"attribute":"title","value":"Sub","match_type":"prefix"}"#,
        )
        .unwrap();
        assert_eq!(c.match_type(), MatchType::Prefix);
        let bad: std::result::Result<Criterion, _> =
            serde_json::from_str(r#"{"attribute":"title","value":"(","match_type":"regex"}"#);
        assert!(bad.is_err());
    }
}
