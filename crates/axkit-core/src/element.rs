//! Element wrapper over a native accessibility node

use crate::attribute::{actions, Attribute};
use crate::error::{Error, ErrorCode, Result};
use crate::platform::NativeHandle;
use crate::record::ElementRecord;
use crate::value::{AttrValue, Frame, Point, Size};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A view over one live node.
///
/// Attribute reads are cached for the lifetime of the value (clones share the
/// cache), which is one traversal pass. Use [`Element::refreshed`] to read
/// through again.
#[derive(Clone)]
pub struct Element {
    native: NativeHandle,
    cache: Arc<Mutex<HashMap<String, Option<AttrValue>>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementRecord>,
    pub timing_ms: u64,
}

impl Element {
    pub fn new(native: NativeHandle) -> Self {
        Self {
            native,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn native(&self) -> &NativeHandle {
        &self.native
    }

    /// Same node, empty cache.
    pub fn refreshed(&self) -> Self {
        Self::new(self.native.clone())
    }

    pub fn try_attribute(&self, attr: &Attribute) -> Result<Option<AttrValue>> {
        match attr {
            Attribute::Pid => {
                return Ok(self.native.pid().map(|p| AttrValue::Number(p as f64)));
            }
            Attribute::Actions => {
                let list = self.try_actions()?;
                return Ok(Some(AttrValue::List(
                    list.into_iter().map(AttrValue::String).collect(),
                )));
            }
            _ => {}
        }

        let key = attr.ax_name();
        if let Some(hit) = self.cache.lock().get(key) {
            return Ok(hit.clone());
        }

        let value = match attr {
            Attribute::Frame => self.read_frame()?,
            _ => self.native.attribute(key)?,
        };
        self.cache.lock().insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Graceful read: absent, unsupported and stale all come back as `None`.
    pub fn attribute(&self, attr: &Attribute) -> Option<AttrValue> {
        self.try_attribute(attr).ok().flatten()
    }

    /// Read by user-facing name; unknown names read as absent.
    pub fn attribute_named(&self, name: &str) -> Option<AttrValue> {
        Attribute::resolve(name).and_then(|a| self.attribute(&a))
    }

    fn read_frame(&self) -> Result<Option<AttrValue>> {
        if let Some(v) = self.native.attribute("AXFrame")? {
            return Ok(Some(v));
        }
        let position = self.native.attribute("AXPosition")?;
        let size = self.native.attribute("AXSize")?;
        Ok(match (position, size) {
            (Some(AttrValue::Point(p)), Some(AttrValue::Size(s))) => {
                Some(AttrValue::Rect(Frame::from_parts(p, s)))
            }
            _ => None,
        })
    }

    fn string(&self, attr: Attribute) -> Option<String> {
        match self.attribute(&attr)? {
            AttrValue::String(s) if !s.is_empty() => Some(s),
            AttrValue::String(_) => None,
            other => Some(other.match_string()),
        }
    }

    fn flag(&self, attr: Attribute) -> Option<bool> {
        self.attribute(&attr).and_then(|v| v.as_bool())
    }

    pub fn try_role(&self) -> Result<Option<String>> {
        Ok(self
            .try_attribute(&Attribute::Role)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn role(&self) -> Option<String> {
        self.string(Attribute::Role)
    }

    pub fn subrole(&self) -> Option<String> {
        self.string(Attribute::Subrole)
    }

    pub fn role_description(&self) -> Option<String> {
        self.string(Attribute::RoleDescription)
    }

    pub fn identifier(&self) -> Option<String> {
        self.string(Attribute::Identifier)
    }

    pub fn title(&self) -> Option<String> {
        self.string(Attribute::Title)
    }

    pub fn value(&self) -> Option<AttrValue> {
        self.attribute(&Attribute::Value)
    }

    pub fn value_string(&self) -> Option<String> {
        self.string(Attribute::Value)
    }

    pub fn description(&self) -> Option<String> {
        self.string(Attribute::Description)
    }

    pub fn help(&self) -> Option<String> {
        self.string(Attribute::Help)
    }

    pub fn placeholder(&self) -> Option<String> {
        self.string(Attribute::Placeholder)
    }

    /// Best human-readable name.
    pub fn label(&self) -> Option<String> {
        self.description()
            .or_else(|| self.title())
            .or_else(|| self.placeholder())
            .or_else(|| self.help())
    }

    pub fn is_enabled(&self) -> bool {
        self.flag(Attribute::Enabled).unwrap_or(true)
    }

    pub fn is_focused(&self) -> bool {
        self.flag(Attribute::Focused).unwrap_or(false)
    }

    pub fn is_hidden(&self) -> bool {
        self.flag(Attribute::Hidden).unwrap_or(false)
    }

    pub fn is_busy(&self) -> bool {
        self.flag(Attribute::Busy).unwrap_or(false)
    }

    pub fn frame(&self) -> Option<Frame> {
        self.attribute(&Attribute::Frame).and_then(|v| v.as_frame())
    }

    pub fn position(&self) -> Option<Point> {
        self.frame().map(|f| f.origin())
    }

    pub fn size(&self) -> Option<Size> {
        self.frame().map(|f| Size {
            width: f.width,
            height: f.height,
        })
    }

    pub fn pid(&self) -> Option<i32> {
        self.native.pid()
    }

    pub fn try_actions(&self) -> Result<Vec<String>> {
        self.native.actions()
    }

    pub fn actions(&self) -> Vec<String> {
        self.try_actions().unwrap_or_default()
    }

    pub fn try_children(&self) -> Result<Vec<Element>> {
        Ok(self
            .native
            .children()?
            .into_iter()
            .map(Element::new)
            .collect())
    }

    pub fn children(&self) -> Vec<Element> {
        self.try_children().unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Element> {
        self.native.parent().ok().flatten().map(Element::new)
    }

    /// Whether the underlying node still exists. Bypasses the cache.
    pub fn is_alive(&self) -> bool {
        match self.native.attribute("AXRole") {
            Ok(_) => true,
            Err(e) => e.code != ErrorCode::StaleElement,
        }
    }

    pub fn same_node(&self, other: &Element) -> bool {
        self.native.same_node(other.native.as_ref())
    }

    /// Invoke a native action after checking the element advertises it.
    pub fn perform_action(&self, action: &str) -> Result<ActionResult> {
        let start = Instant::now();
        let available = self.try_actions()?;
        if !available.iter().any(|a| a == action) {
            return Err(Error::action_not_supported(action, &available));
        }
        self.native.perform_action(action)?;

        Ok(ActionResult {
            success: true,
            action: action.to_string(),
            element: None,
            timing_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub fn press(&self) -> Result<ActionResult> {
        self.perform_action(actions::PRESS)
    }

    pub fn set_value(&self, text: &str) -> Result<ActionResult> {
        let start = Instant::now();
        self.native
            .set_attribute(Attribute::Value.ax_name(), &AttrValue::from(text))?;
        self.cache.lock().remove(Attribute::Value.ax_name());

        Ok(ActionResult {
            success: true,
            action: actions::SET_VALUE.to_string(),
            element: None,
            timing_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("role", &self.role())
            .field("title", &self.title())
            .field("identifier", &self.identifier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{MemoryTree, NodeSpec};

    fn field() -> (MemoryTree, Element, usize) {
        let tree = MemoryTree::new();
        let app = tree.add_app("Editor", None, 1);
        let id = tree.add_node(
            app,
            NodeSpec::new("AXTextField")
                .value("draft")
                .description("Subject")
                .frame(5.0, 6.0, 100.0, 20.0),
        );
        (tree.clone(), tree.element(id), id)
    }

    #[test]
    fn missing_attributes_are_none() {
        let (_, el, _) = field();
        assert_eq!(el.role().as_deref(), Some("AXTextField"));
        assert_eq!(el.title(), None);
        assert_eq!(el.attribute_named("colour"), None);
        assert!(el.is_enabled());
        assert!(!el.is_hidden());
    }

    #[test]
    fn reads_are_cached_per_pass() {
        let (tree, el, id) = field();
        assert_eq!(el.value_string().as_deref(), Some("draft"));
        tree.set_attribute(id, "AXValue", "sent");
        assert_eq!(el.value_string().as_deref(), Some("draft"));
        assert_eq!(el.refreshed().value_string().as_deref(), Some("sent"));
    }

    #[test]
    fn stale_reads_degrade_to_none() {
        let (tree, el, id) = field();
        tree.destroy(id);
        assert!(!el.is_alive());
        assert_eq!(el.refreshed().role(), None);
        let err = el.refreshed().try_role().unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleElement);
    }

    #[test]
    fn label_prefers_description() {
        let (_, el, _) = field();
        assert_eq!(el.label().as_deref(), Some("Subject"));
        assert_eq!(el.frame(), Some(Frame::new(5.0, 6.0, 100.0, 20.0)));
        assert_eq!(el.pid(), Some(1));
    }

    #[test]
    fn action_must_be_advertised() {
        let (_, el, _) = field();
        let err = el.press().unwrap_err();
        assert_eq!(err.code, ErrorCode::ActionNotSupported);
    }
}
