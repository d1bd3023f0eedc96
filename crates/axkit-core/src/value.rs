//! Attribute values read from the accessibility tree
//!
//! Every attribute a backend returns is one of a closed set of shapes, so the
//! matcher and the projections never guess at types.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Position and size in screen coordinates (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Frame {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_parts(origin: Point, size: Size) -> Self {
        Self::new(origin.x, origin.y, size.width, size.height)
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.y >= self.y && p.x < self.x + self.width && p.y < self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttrValue {
    String(String),
    Number(f64),
    Bool(bool),
    Rect(Frame),
    Point(Point),
    Size(Size),
    List(Vec<AttrValue>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_frame(&self) -> Option<Frame> {
        match self {
            Self::Rect(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttrValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// String items of a list value, or the whitespace-separated tokens of a
    /// string value.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.iter().map(|v| v.match_string()).collect(),
            Self::String(s) => s.split_whitespace().map(str::to_string).collect(),
            other => vec![other.match_string()],
        }
    }

    /// Canonical string form the matcher compares against.
    pub fn match_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Bool(b) => b.to_string(),
            Self::Rect(f) => format!(
                "{} {} {} {}",
                format_number(f.x),
                format_number(f.y),
                format_number(f.width),
                format_number(f.height)
            ),
            Self::Point(p) => format!("{} {}", format_number(p.x), format_number(p.y)),
            Self::Size(s) => format!("{} {}", format_number(s.width), format_number(s.height)),
            Self::List(items) => items
                .iter()
                .map(|v| v.match_string())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Plain JSON for projections (no type tag).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => serde_json::json!(n),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Rect(f) => serde_json::json!(f),
            Self::Point(p) => serde_json::json!(p),
            Self::Size(s) => serde_json::json!(s),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(AttrValue::to_json).collect())
            }
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.match_string())
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for AttrValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<Frame> for AttrValue {
    fn from(f: Frame) -> Self {
        Self::Rect(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_print_without_fraction() {
        assert_eq!(AttrValue::Number(42.0).match_string(), "42");
        assert_eq!(AttrValue::Number(0.5).match_string(), "0.5");
    }

    #[test]
    fn list_tokens() {
        let v = AttrValue::List(vec!["btn".into(), "btn-primary".into()]);
        assert_eq!(v.tokens(), vec!["btn", "btn-primary"]);
        assert_eq!(v.match_string(), "btn btn-primary");
        let s = AttrValue::from("nav  main");
        assert_eq!(s.tokens(), vec!["nav", "main"]);
    }

    #[test]
    fn frame_contains_is_half_open() {
        let f = Frame::new(10.0, 10.0, 20.0, 20.0);
        assert!(f.contains(Point::new(10.0, 10.0)));
        assert!(!f.contains(Point::new(30.0, 15.0)));
        assert_eq!(f.center(), Point::new(20.0, 20.0));
    }
}
