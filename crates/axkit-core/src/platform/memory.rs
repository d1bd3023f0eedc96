//! In-memory accessibility tree
//!
//! A complete backend over a mutable tree held in process. Nodes can be
//! destroyed, re-ordered, slowed down and made to post notifications, which
//! is everything the engine has to cope with on a real desktop.

use super::{
    AccessibilityEngine, AppInfo, AppTarget, NativeHandle, NativeNode, NativeNotification,
    NotificationSink, Registration,
};
use crate::element::Element;
use crate::error::{Error, ErrorCode, Result};
use crate::notification::Notification;
use crate::value::{AttrValue, Frame, Point, Size};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub type NodeId = usize;

/// Declarative description of a node (and its subtree).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subrole: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(role: &str) -> Self {
        Self {
            role: role.to_string(),
            ..Default::default()
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn identifier(mut self, identifier: &str) -> Self {
        self.identifier = Some(identifier.to_string());
        self
    }

    pub fn subrole(mut self, subrole: &str) -> Self {
        self.subrole = Some(subrole.to_string());
        self
    }

    pub fn frame(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.frame = Some(Frame::new(x, y, width, height));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn action(mut self, action: &str) -> Self {
        self.actions.push(action.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    fn native_attributes(&self) -> HashMap<String, AttrValue> {
        let mut attrs: HashMap<String, AttrValue> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        attrs.insert("AXRole".to_string(), AttrValue::from(self.role.as_str()));
        let strings = [
            ("AXSubrole", &self.subrole),
            ("AXTitle", &self.title),
            ("AXValue", &self.value),
            ("AXDescription", &self.description),
            ("AXIdentifier", &self.identifier),
        ];
        for (name, value) in strings {
            if let Some(v) = value {
                attrs.insert(name.to_string(), AttrValue::from(v.as_str()));
            }
        }
        if let Some(frame) = self.frame {
            attrs.insert("AXFrame".to_string(), AttrValue::Rect(frame));
        }
        if let Some(enabled) = self.enabled {
            attrs.insert("AXEnabled".to_string(), AttrValue::Bool(enabled));
        }
        attrs
    }

    /// Snapshot a live subtree into a spec, up to `max_depth` levels below
    /// `element`. Stale nodes are dropped.
    pub fn capture(element: &Element, max_depth: usize) -> Option<Self> {
        let role = element.try_role().ok()??;
        let mut spec = NodeSpec::new(&role);
        spec.subrole = element.subrole();
        spec.title = element.title();
        spec.value = element.value_string();
        spec.description = element.description();
        spec.identifier = element.identifier();
        spec.frame = element.frame();
        spec.enabled = element.attribute(&crate::Attribute::Enabled).and_then(|v| v.as_bool());
        spec.actions = element.actions();
        if max_depth > 0 {
            if let Ok(children) = element.try_children() {
                spec.children = children
                    .iter()
                    .filter_map(|c| Self::capture(c, max_depth - 1))
                    .collect();
            }
        }
        Some(spec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppFixture {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub pid: i32,
    #[serde(default)]
    pub children: Vec<NodeSpec>,
}

/// A serialized desktop: apps and their trees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    pub apps: Vec<AppFixture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_pid: Option<i32>,
}

impl Fixture {
    /// Record the trees of `targets` from any backend, `max_depth` levels
    /// below each application root.
    pub fn capture(
        engine: &dyn AccessibilityEngine,
        targets: &[AppTarget],
        max_depth: usize,
    ) -> Result<Self> {
        let mut apps = Vec::with_capacity(targets.len());
        for target in targets {
            let (info, root) = engine.application(target)?;
            let root = Element::new(root);
            let children = if max_depth == 0 {
                Vec::new()
            } else {
                root.try_children()?
                    .iter()
                    .filter_map(|c| NodeSpec::capture(c, max_depth - 1))
                    .collect()
            };
            apps.push(AppFixture {
                name: info.name,
                bundle_id: info.bundle_id,
                pid: info.pid,
                children,
            });
        }
        let focused_pid = engine.focused_application().ok().map(|(info, _)| info.pid);
        Ok(Self { apps, focused_pid })
    }
}

#[derive(Debug)]
struct NodeData {
    pid: i32,
    attrs: HashMap<String, AttrValue>,
    actions: Vec<String>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    alive: bool,
    performed: Vec<String>,
}

struct AppEntry {
    info: AppInfo,
    root: NodeId,
}

struct Subscriber {
    id: u64,
    pid: i32,
    notification: Notification,
    sink: NotificationSink,
}

struct TreeState {
    nodes: Vec<NodeData>,
    apps: Vec<AppEntry>,
    focused_pid: Option<i32>,
    focused_node: Option<NodeId>,
    latency: Duration,
    trusted: bool,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    unsupported: Vec<Notification>,
}

struct Shared {
    state: RwLock<TreeState>,
    // Held for the whole of a delivery; unregistering waits on it.
    dispatch: Mutex<()>,
}

/// Handle to an in-memory desktop. Cheap to clone; clones share the tree.
#[derive(Clone)]
pub struct MemoryTree {
    shared: Arc<Shared>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(TreeState {
                    nodes: Vec::new(),
                    apps: Vec::new(),
                    focused_pid: None,
                    focused_node: None,
                    latency: Duration::ZERO,
                    trusted: true,
                    subscribers: Vec::new(),
                    next_subscriber: 1,
                    unsupported: Vec::new(),
                }),
                dispatch: Mutex::new(()),
            }),
        }
    }

    pub fn from_fixture(fixture: &Fixture) -> Self {
        let tree = Self::new();
        for app in &fixture.apps {
            let root = tree.add_app(&app.name, app.bundle_id.as_deref(), app.pid);
            for child in &app.children {
                tree.add_node(root, child.clone());
            }
        }
        if let Some(pid) = fixture.focused_pid {
            tree.shared.state.write().focused_pid = Some(pid);
        }
        tree
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let fixture: Fixture = serde_json::from_str(&raw).map_err(|e| {
            Error::invalid_command(format!("invalid fixture {}: {}", path.display(), e))
        })?;
        Ok(Self::from_fixture(&fixture))
    }

    /// Add an application and return its root node. The first app added is
    /// the focused one until [`MemoryTree::focus_app`] says otherwise.
    pub fn add_app(&self, name: &str, bundle_id: Option<&str>, pid: i32) -> NodeId {
        let mut state = self.shared.state.write();
        let root = NodeSpec::new("AXApplication").title(name);
        let id = insert_node(&mut state, None, pid, &root);
        state.apps.push(AppEntry {
            info: AppInfo {
                name: name.to_string(),
                bundle_id: bundle_id.map(str::to_string),
                pid,
            },
            root: id,
        });
        if state.focused_pid.is_none() {
            state.focused_pid = Some(pid);
        }
        id
    }

    /// Append a subtree under `parent`; returns the new subtree root.
    pub fn add_node(&self, parent: NodeId, spec: NodeSpec) -> NodeId {
        let mut state = self.shared.state.write();
        let pid = state.nodes[parent].pid;
        let id = insert_node(&mut state, Some(parent), pid, &spec);
        state.nodes[parent].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> NativeHandle {
        Arc::new(MemoryNode {
            shared: self.shared.clone(),
            id,
        })
    }

    pub fn element(&self, id: NodeId) -> Element {
        Element::new(self.node(id))
    }

    /// Child ids of a node, in sibling order.
    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.shared.state.read().nodes[id].children.clone()
    }

    /// Destroy a node and its subtree, detach it, and post
    /// `ElementDestroyed` for it.
    pub fn destroy(&self, id: NodeId) {
        {
            let mut state = self.shared.state.write();
            let mut stack = vec![id];
            while let Some(n) = stack.pop() {
                state.nodes[n].alive = false;
                stack.extend(state.nodes[n].children.iter().copied());
            }
            if let Some(parent) = state.nodes[id].parent {
                state.nodes[parent].children.retain(|c| *c != id);
            }
            if state.focused_node.is_some_and(|f| !state.nodes[f].alive) {
                state.focused_node = None;
            }
        }
        self.post(id, Notification::ElementDestroyed);
    }

    /// Terminate an application: its tree is destroyed and it leaves the
    /// running list.
    pub fn quit_app(&self, pid: i32) {
        let root = {
            let mut state = self.shared.state.write();
            let root = state.apps.iter().find(|a| a.info.pid == pid).map(|a| a.root);
            state.apps.retain(|a| a.info.pid != pid);
            if state.focused_pid == Some(pid) {
                state.focused_pid = None;
            }
            root
        };
        if let Some(root) = root {
            self.destroy(root);
        }
    }

    pub fn set_attribute(&self, id: NodeId, name: &str, value: impl Into<AttrValue>) {
        self.shared.state.write().nodes[id]
            .attrs
            .insert(name.to_string(), value.into());
        match name {
            "AXValue" => self.post(id, Notification::ValueChanged),
            "AXTitle" => self.post(id, Notification::TitleChanged),
            _ => {}
        }
    }

    pub fn set_frame(&self, id: NodeId, frame: Frame) {
        self.shared.state.write().nodes[id]
            .attrs
            .insert("AXFrame".to_string(), AttrValue::Rect(frame));
    }

    /// Replace the child order of `parent`. `order` must be a permutation of
    /// the current children.
    pub fn reorder_children(&self, parent: NodeId, order: Vec<NodeId>) {
        self.shared.state.write().nodes[parent].children = order;
    }

    pub fn set_focused(&self, id: NodeId) {
        {
            let mut state = self.shared.state.write();
            state.focused_node = Some(id);
            state.focused_pid = Some(state.nodes[id].pid);
        }
        self.post(id, Notification::FocusedElementChanged);
    }

    pub fn focus_app(&self, pid: i32) {
        self.shared.state.write().focused_pid = Some(pid);
    }

    /// Delay applied to every attribute and children read.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.state.write().latency = latency;
    }

    /// Make `subscribe` refuse a notification, as an app that does not post
    /// it would.
    pub fn set_unsupported(&self, notification: Notification) {
        self.shared.state.write().unsupported.push(notification);
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.shared.state.write().trusted = trusted;
    }

    pub fn performed_actions(&self, id: NodeId) -> Vec<String> {
        self.shared.state.read().nodes[id].performed.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.read().subscribers.len()
    }

    /// Deliver a notification about `id` to every matching subscriber.
    pub fn post(&self, id: NodeId, notification: Notification) {
        let _delivery = self.shared.dispatch.lock();
        let (pid, sinks) = {
            let state = self.shared.state.read();
            let pid = state.nodes[id].pid;
            let sinks: Vec<NotificationSink> = state
                .subscribers
                .iter()
                .filter(|s| s.pid == pid && s.notification == notification)
                .map(|s| s.sink.clone())
                .collect();
            (pid, sinks)
        };
        for sink in sinks {
            sink(NativeNotification {
                notification: notification.clone(),
                node: Some(self.node(id)),
                pid,
            });
        }
    }

    fn latency(&self) -> Duration {
        self.shared.state.read().latency
    }

    fn app_entry(&self, target: &AppTarget) -> Result<(AppInfo, NodeId)> {
        let state = self.shared.state.read();
        let pid = match target {
            AppTarget::Focused => state
                .focused_pid
                .ok_or_else(|| Error::app_not_running("focused"))?,
            other => {
                let infos: Vec<AppInfo> = state.apps.iter().map(|a| a.info.clone()).collect();
                other.select(&infos)?.pid
            }
        };
        let entry = state.apps.iter().find(|a| a.info.pid == pid);
        entry
            .map(|a| (a.info.clone(), a.root))
            .ok_or_else(|| Error::app_not_running(&target.to_string()))
    }
}

fn insert_node(state: &mut TreeState, parent: Option<NodeId>, pid: i32, spec: &NodeSpec) -> NodeId {
    let id = state.nodes.len();
    state.nodes.push(NodeData {
        pid,
        attrs: spec.native_attributes(),
        actions: spec.actions.clone(),
        children: Vec::new(),
        parent,
        alive: true,
        performed: Vec::new(),
    });
    for child in &spec.children {
        let child_id = insert_node(state, Some(id), pid, child);
        state.nodes[id].children.push(child_id);
    }
    id
}

pub struct MemoryNode {
    shared: Arc<Shared>,
    id: NodeId,
}

impl MemoryNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn tree(&self) -> MemoryTree {
        MemoryTree {
            shared: self.shared.clone(),
        }
    }

    fn stale(&self) -> Error {
        Error::stale(&format!("memory node {}", self.id))
    }

    fn pause(&self) {
        let latency = self.tree().latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }
}

impl std::fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNode").field("id", &self.id).finish()
    }
}

impl NativeNode for MemoryNode {
    fn attribute(&self, name: &str) -> Result<Option<AttrValue>> {
        self.pause();
        let state = self.shared.state.read();
        let node = &state.nodes[self.id];
        if !node.alive {
            return Err(self.stale());
        }
        let frame = node.attrs.get("AXFrame").and_then(AttrValue::as_frame);
        let value = match name {
            "AXPosition" => frame.map(|f| AttrValue::Point(f.origin())),
            "AXSize" => frame.map(|f| {
                AttrValue::Size(Size {
                    width: f.width,
                    height: f.height,
                })
            }),
            "AXFocused" => node
                .attrs
                .get(name)
                .cloned()
                .or(Some(AttrValue::Bool(state.focused_node == Some(self.id)))),
            _ => node.attrs.get(name).cloned(),
        };
        Ok(value)
    }

    fn attribute_names(&self) -> Result<Vec<String>> {
        let state = self.shared.state.read();
        let node = &state.nodes[self.id];
        if !node.alive {
            return Err(self.stale());
        }
        let mut names: Vec<String> = node.attrs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn children(&self) -> Result<Vec<NativeHandle>> {
        self.pause();
        let ids = {
            let state = self.shared.state.read();
            let node = &state.nodes[self.id];
            if !node.alive {
                return Err(self.stale());
            }
            node.children.clone()
        };
        let tree = self.tree();
        Ok(ids.into_iter().map(|id| tree.node(id)).collect())
    }

    fn parent(&self) -> Result<Option<NativeHandle>> {
        let parent = {
            let state = self.shared.state.read();
            let node = &state.nodes[self.id];
            if !node.alive {
                return Err(self.stale());
            }
            node.parent
        };
        Ok(parent.map(|id| self.tree().node(id)))
    }

    fn actions(&self) -> Result<Vec<String>> {
        let state = self.shared.state.read();
        let node = &state.nodes[self.id];
        if !node.alive {
            return Err(self.stale());
        }
        Ok(node.actions.clone())
    }

    fn perform_action(&self, action: &str) -> Result<()> {
        let mut state = self.shared.state.write();
        let node = &mut state.nodes[self.id];
        if !node.alive {
            return Err(self.stale());
        }
        if !node.actions.iter().any(|a| a == action) {
            return Err(Error::action_not_supported(action, &node.actions));
        }
        node.performed.push(action.to_string());
        Ok(())
    }

    fn set_attribute(&self, name: &str, value: &AttrValue) -> Result<()> {
        {
            let state = self.shared.state.read();
            if !state.nodes[self.id].alive {
                return Err(self.stale());
            }
        }
        self.tree().set_attribute(self.id, name, value.clone());
        Ok(())
    }

    fn pid(&self) -> Option<i32> {
        Some(self.shared.state.read().nodes[self.id].pid)
    }

    fn same_node(&self, other: &dyn NativeNode) -> bool {
        other
            .as_any()
            .downcast_ref::<MemoryNode>()
            .is_some_and(|o| Arc::ptr_eq(&o.shared, &self.shared) && o.id == self.id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MemoryRegistration {
    shared: Arc<Shared>,
    id: u64,
}

impl Registration for MemoryRegistration {
    fn unregister(self: Box<Self>) {
        let _delivery = self.shared.dispatch.lock();
        self.shared
            .state
            .write()
            .subscribers
            .retain(|s| s.id != self.id);
    }
}

impl AccessibilityEngine for MemoryTree {
    fn has_permission(&self) -> bool {
        self.shared.state.read().trusted
    }

    fn applications(&self) -> Result<Vec<AppInfo>> {
        Ok(self
            .shared
            .state
            .read()
            .apps
            .iter()
            .map(|a| a.info.clone())
            .collect())
    }

    fn application(&self, target: &AppTarget) -> Result<(AppInfo, NativeHandle)> {
        let (info, root) = self.app_entry(target)?;
        Ok((info, self.node(root)))
    }

    fn focused_application(&self) -> Result<(AppInfo, NativeHandle)> {
        self.application(&AppTarget::Focused)
    }

    fn focused_element(&self) -> Result<NativeHandle> {
        let focused = self.shared.state.read().focused_node;
        focused
            .map(|id| self.node(id))
            .ok_or_else(|| Error::element_not_found("focused element"))
    }

    fn element_at_point(&self, point: Point) -> Result<NativeHandle> {
        let state = self.shared.state.read();
        let contains = |id: NodeId| {
            state.nodes[id]
                .attrs
                .get("AXFrame")
                .and_then(AttrValue::as_frame)
                .is_some_and(|f| f.contains(point))
        };
        // Focused app first, like the window server's z-order would.
        let mut roots: Vec<&AppEntry> = state.apps.iter().collect();
        roots.sort_by_key(|a| Some(a.info.pid) != state.focused_pid);

        for app in roots {
            let mut current = app.root;
            let mut hit = None;
            loop {
                let next = state.nodes[current]
                    .children
                    .iter()
                    .rev()
                    .copied()
                    .find(|c| state.nodes[*c].alive && contains(*c));
                match next {
                    Some(child) => {
                        hit = Some(child);
                        current = child;
                    }
                    None => break,
                }
            }
            if let Some(id) = hit {
                return Ok(self.node(id));
            }
        }
        Err(Error::new(
            ErrorCode::ElementNotFound,
            format!("No element at ({}, {})", point.x, point.y),
        ))
    }

    fn subscribe(
        &self,
        pid: i32,
        notification: &Notification,
        sink: NotificationSink,
    ) -> Result<Box<dyn Registration>> {
        let mut state = self.shared.state.write();
        if !state.apps.iter().any(|a| a.info.pid == pid) {
            return Err(Error::app_not_running(&format!("PID:{}", pid)));
        }
        if state.unsupported.contains(notification) {
            return Err(Error::not_implemented(&format!(
                "{} notifications for PID {}",
                notification, pid
            )));
        }
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.push(Subscriber {
            id,
            pid,
            notification: notification.clone(),
            sink,
        });
        Ok(Box::new(MemoryRegistration {
            shared: self.shared.clone(),
            id,
        }))
    }
}
