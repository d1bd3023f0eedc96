//! macOS platform implementation
//!
//! Uses Accessibility API (AX) and AppKit (NSWorkspace) via cidre.
//! Notifications come from one AXObserver per (application, notification)
//! pair, each pumped by its own run-loop thread.

use crate::error::{Error, ErrorCode, Result};
use crate::notification::Notification;
use crate::platform::{
    AccessibilityEngine, AppInfo, AppTarget, NativeHandle, NativeNode, NativeNotification,
    NotificationSink, Registration,
};
use crate::value::{AttrValue, Frame, Point, Size};
use cidre::arc::R;
use cidre::{ax, cf, ns};
use crossbeam_channel::{bounded, Sender};
use std::any::Any;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Seconds per run-loop pass between stop checks.
const RUN_LOOP_SLICE: f64 = 0.05;

/// Check if the process has accessibility permissions
pub fn has_accessibility() -> bool {
    ax::is_process_trusted()
}

/// Request accessibility permissions with a prompt
pub fn request_accessibility() -> bool {
    ax::is_process_trusted_with_prompt(true)
}

/// Ensure accessibility permissions are granted
pub fn ensure_accessibility() -> Result<()> {
    if has_accessibility() {
        return Ok(());
    }
    request_accessibility();
    Err(Error::permission_denied(
        "Accessibility permissions required. Enable in System Settings > Privacy & Security > Accessibility",
    ))
}

/// One `AXUIElement`. The AX client API is thread-safe; element refs are
/// immutable CF objects.
pub struct MacNode {
    inner: R<ax::UiElement>,
}

unsafe impl Send for MacNode {}
unsafe impl Sync for MacNode {}

impl MacNode {
    pub fn new(inner: R<ax::UiElement>) -> Self {
        Self { inner }
    }

    fn handle(inner: R<ax::UiElement>) -> NativeHandle {
        Arc::new(Self::new(inner))
    }

    pub fn raw(&self) -> &ax::UiElement {
        &self.inner
    }

    fn read(&self, name: &str) -> Result<Option<R<cf::Type>>> {
        let cf_name = cf::String::from_str(name);
        let attr: &ax::Attr = unsafe { std::mem::transmute(&*cf_name) };
        match self.inner.attr_value(attr) {
            Ok(v) => Ok(Some(v)),
            Err(e) => absent_or(e, name),
        }
    }
}

impl std::fmt::Debug for MacNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacNode")
            .field("role", &role_name(&self.inner))
            .field("pid", &self.inner.pid().ok())
            .finish()
    }
}

/// Missing attributes read as absent, a dead element as stale.
fn absent_or<T>(e: ax::Error, what: &str) -> Result<Option<T>> {
    if e == ax::err::INVALID_UI_ELEMENT {
        Err(Error::stale(what))
    } else if e == ax::err::API_DISABLED {
        Err(Error::permission_denied("Accessibility API is disabled for this process"))
    } else {
        Ok(None)
    }
}

fn ax_failure(e: ax::Error, what: &str) -> Error {
    if e == ax::err::INVALID_UI_ELEMENT {
        Error::stale(what)
    } else if e == ax::err::API_DISABLED {
        Error::permission_denied("Accessibility API is disabled for this process")
    } else {
        Error::system(format!("{} failed: {:?}", what, e))
    }
}

/// Extract a clean role name from an AX role
fn role_name(element: &ax::UiElement) -> Option<String> {
    let role = element.role().ok()?;
    let debug = format!("{:?}", role);
    let start = debug.find("AX")?;
    let rest = &debug[start..];
    let end = rest
        .find(|c| c == ')' || c == '"' || c == '}')
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn string_of(v: &cf::Type) -> Option<String> {
    if v.get_type_id() == cf::String::type_id() {
        let s: &cf::String = unsafe { std::mem::transmute(v) };
        Some(s.to_string())
    } else {
        None
    }
}

fn element_of(v: &cf::Type) -> Option<R<ax::UiElement>> {
    if v.get_type_id() == ax::UiElement::type_id() {
        let el: &ax::UiElement = unsafe { std::mem::transmute(v) };
        Some(el.retained())
    } else {
        None
    }
}

/// Convert a CF attribute value. Element references are not values and read
/// as absent.
fn convert(v: &cf::Type) -> Option<AttrValue> {
    let type_id = v.get_type_id();
    if let Some(s) = string_of(v) {
        return Some(AttrValue::String(s));
    }
    if type_id == cf::Boolean::type_id() {
        let b: &cf::Boolean = unsafe { std::mem::transmute(v) };
        return Some(AttrValue::Bool(b.value()));
    }
    if type_id == cf::Number::type_id() {
        let n: &cf::Number = unsafe { std::mem::transmute(v) };
        return n.to_f64().map(AttrValue::Number);
    }
    if type_id == ax::Value::type_id() {
        let value: &ax::Value = unsafe { std::mem::transmute(v) };
        if let Some(p) = value.cg_point() {
            return Some(AttrValue::Point(Point::new(p.x, p.y)));
        }
        if let Some(s) = value.cg_size() {
            return Some(AttrValue::Size(Size {
                width: s.width,
                height: s.height,
            }));
        }
        if let Some(r) = value.cg_rect() {
            return Some(AttrValue::Rect(Frame::new(
                r.origin.x,
                r.origin.y,
                r.size.width,
                r.size.height,
            )));
        }
        return None;
    }
    if type_id == cf::Array::type_id() {
        let array: &cf::Array = unsafe { std::mem::transmute(v) };
        let items: Vec<AttrValue> = array.iter().filter_map(convert).collect();
        return Some(AttrValue::List(items));
    }
    None
}

impl NativeNode for MacNode {
    fn attribute(&self, name: &str) -> Result<Option<AttrValue>> {
        Ok(self.read(name)?.and_then(|v| convert(&v)))
    }

    fn attribute_names(&self) -> Result<Vec<String>> {
        match self.inner.attr_names() {
            Ok(names) => Ok(names.iter().map(|n| n.to_string()).collect()),
            Err(e) => Err(ax_failure(e, "attribute names")),
        }
    }

    fn children(&self) -> Result<Vec<NativeHandle>> {
        match self.inner.children() {
            Ok(children) => Ok(children.iter().map(|c| Self::handle(c.retained())).collect()),
            Err(e) => absent_or(e, "children").map(|_: Option<()>| Vec::new()),
        }
    }

    fn parent(&self) -> Result<Option<NativeHandle>> {
        Ok(self
            .read("AXParent")?
            .and_then(|v| element_of(&v))
            .map(Self::handle))
    }

    fn actions(&self) -> Result<Vec<String>> {
        match self.inner.action_names() {
            Ok(names) => Ok(names.iter().map(|n| n.to_string()).collect()),
            Err(e) => absent_or(e, "actions").map(|_: Option<()>| Vec::new()),
        }
    }

    fn perform_action(&self, action: &str) -> Result<()> {
        let cf_name = cf::String::from_str(action);
        let ax_action: &ax::Action = unsafe { std::mem::transmute(&*cf_name) };
        self.inner.perform_action(ax_action).map_err(|e| {
            if e == ax::err::ACTION_UNSUPPORTED {
                Error::action_not_supported(action, &self.actions().unwrap_or_default())
            } else {
                ax_failure(e, action)
            }
        })
    }

    fn set_attribute(&self, name: &str, value: &AttrValue) -> Result<()> {
        let cf_name = cf::String::from_str(name);
        let attr: &ax::Attr = unsafe { std::mem::transmute(&*cf_name) };
        let result = match value {
            AttrValue::String(s) => {
                let cf_value = cf::String::from_str(s);
                self.inner.set_attr(attr, cf_value.as_type_ref())
            }
            AttrValue::Bool(b) => {
                let cf_value = if *b {
                    cf::Boolean::value_true()
                } else {
                    cf::Boolean::value_false()
                };
                self.inner.set_attr(attr, cf_value.as_type_ref())
            }
            AttrValue::Number(n) => {
                let cf_value = cf::Number::from_f64(*n);
                self.inner.set_attr(attr, cf_value.as_type_ref())
            }
            other => {
                return Err(Error::invalid_command(format!(
                    "cannot set {} to a {:?} value",
                    name, other
                )))
            }
        };
        result.map_err(|e| {
            if e == ax::err::ATTR_UNSUPPORTED || e == ax::err::CANNOT_COMPLETE {
                Error::new(
                    ErrorCode::ActionNotSupported,
                    format!("{} is not settable on this element", name),
                )
            } else {
                ax_failure(e, name)
            }
        })
    }

    fn pid(&self) -> Option<i32> {
        self.inner.pid().ok()
    }

    fn same_node(&self, other: &dyn NativeNode) -> bool {
        other
            .as_any()
            .downcast_ref::<MacNode>()
            .is_some_and(|o| o.inner.equal(&self.inner))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The live desktop.
#[derive(Debug, Default)]
pub struct MacEngine;

impl MacEngine {
    pub fn new() -> Self {
        Self
    }

    fn app_info(app: &ns::RunningApp) -> Option<AppInfo> {
        let name = app.localized_name()?.to_string();
        Some(AppInfo {
            name,
            bundle_id: app.bundle_id().map(|s| s.to_string()),
            pid: app.pid(),
        })
    }

    fn app_element(pid: i32) -> Result<NativeHandle> {
        let app = ax::UiElement::with_app_pid(pid);
        // Verify we can access it
        app.role().map_err(|e| {
            if e == ax::err::API_DISABLED {
                Error::permission_denied(
                    "Failed to access application - check accessibility permissions",
                )
            } else {
                Error::app_not_running(&format!("PID:{}", pid))
            }
        })?;
        Ok(MacNode::handle(app))
    }
}

impl AccessibilityEngine for MacEngine {
    fn has_permission(&self) -> bool {
        has_accessibility()
    }

    fn request_permission(&self) -> bool {
        request_accessibility()
    }

    fn applications(&self) -> Result<Vec<AppInfo>> {
        let workspace = ns::Workspace::shared();
        Ok(workspace
            .running_apps()
            .iter()
            .filter_map(|app| Self::app_info(app))
            .collect())
    }

    fn application(&self, target: &AppTarget) -> Result<(AppInfo, NativeHandle)> {
        if let AppTarget::Focused = target {
            return self.focused_application();
        }
        let apps = self.applications()?;
        let info = target.select(&apps)?.clone();
        let node = Self::app_element(info.pid)?;
        Ok((info, node))
    }

    fn focused_application(&self) -> Result<(AppInfo, NativeHandle)> {
        let workspace = ns::Workspace::shared();
        let apps = workspace.running_apps();
        let info = apps
            .iter()
            .find(|app| app.is_active())
            .and_then(|app| Self::app_info(app))
            .ok_or_else(|| Error::app_not_running("focused"))?;
        let node = Self::app_element(info.pid)?;
        Ok((info, node))
    }

    fn focused_element(&self) -> Result<NativeHandle> {
        let sys = MacNode::new(ax::UiElement::sys_wide());
        sys.read("AXFocusedUIElement")?
            .and_then(|v| element_of(&v))
            .map(MacNode::handle)
            .ok_or_else(|| Error::element_not_found("focused element"))
    }

    fn element_at_point(&self, point: Point) -> Result<NativeHandle> {
        let sys = ax::UiElement::sys_wide();
        sys.element_at_pos(point.x as f32, point.y as f32)
            .map(MacNode::handle)
            .map_err(|e| {
                if e == ax::err::API_DISABLED {
                    Error::permission_denied("Accessibility API is disabled for this process")
                } else {
                    Error::element_not_found(&format!("element at ({}, {})", point.x, point.y))
                }
            })
    }

    fn subscribe(
        &self,
        pid: i32,
        notification: &Notification,
        sink: NotificationSink,
    ) -> Result<Box<dyn Registration>> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let context = ObserverContext {
            pid,
            notification: notification.clone(),
            sink,
        };
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("axkit-observer-{}", pid))
            .spawn(move || run_observer(context, thread_stop, ready_tx))
            .map_err(|e| Error::system(format!("failed to start observer thread: {}", e)))?;

        let registration = ObserverRegistration {
            stop,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!(pid, notification = %notification, "observer registered");
                Ok(Box::new(registration))
            }
            Ok(Err(e)) => {
                Box::new(registration).unregister();
                Err(e)
            }
            Err(_) => {
                Box::new(registration).unregister();
                Err(Error::system("observer thread exited during setup"))
            }
        }
    }
}

// HIServices observer API. cidre covers the element and run loop types.
type AXObserverRef = *mut c_void;
type AXObserverCallback = extern "C" fn(
    observer: AXObserverRef,
    element: *const c_void,
    name: *const c_void,
    refcon: *mut c_void,
);

#[link(name = "ApplicationServices", kind = "framework")]
extern "C" {
    fn AXObserverCreate(pid: i32, callback: AXObserverCallback, out: *mut AXObserverRef) -> i32;
    fn AXObserverAddNotification(
        observer: AXObserverRef,
        element: *const c_void,
        name: *const c_void,
        refcon: *mut c_void,
    ) -> i32;
    fn AXObserverRemoveNotification(
        observer: AXObserverRef,
        element: *const c_void,
        name: *const c_void,
    ) -> i32;
    fn AXObserverGetRunLoopSource(observer: AXObserverRef) -> *mut c_void;
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFRelease(cf: *const c_void);
}

const AX_SUCCESS: i32 = 0;
const AX_CANNOT_COMPLETE: i32 = -25204;
const AX_INVALID_UI_ELEMENT: i32 = -25202;
const AX_NOTIFICATION_UNSUPPORTED: i32 = -25207;
const AX_NOTIFICATION_ALREADY_REGISTERED: i32 = -25209;
const AX_API_DISABLED: i32 = -25211;

/// Setup failure for one (application, notification) registration.
fn registration_error(code: i32, pid: i32, notification: &Notification) -> Option<Error> {
    match code {
        AX_SUCCESS | AX_NOTIFICATION_ALREADY_REGISTERED => None,
        AX_NOTIFICATION_UNSUPPORTED => Some(Error::not_implemented(&format!(
            "{} notifications for PID {}",
            notification, pid
        ))),
        AX_API_DISABLED => Some(Error::permission_denied(
            "Accessibility API is disabled for this process",
        )),
        AX_INVALID_UI_ELEMENT | AX_CANNOT_COMPLETE => {
            Some(Error::app_not_running(&format!("PID:{}", pid)))
        }
        other => Some(Error::system(format!(
            "registering {} for PID {} failed with AX error {}",
            notification, pid, other
        ))),
    }
}

struct ObserverContext {
    pid: i32,
    notification: Notification,
    sink: NotificationSink,
}

extern "C" fn observer_callback(
    _observer: AXObserverRef,
    element: *const c_void,
    name: *const c_void,
    refcon: *mut c_void,
) {
    if refcon.is_null() {
        return;
    }
    // SAFETY: refcon is the context owned by `run_observer`, which outlives
    // every run-loop pass that can call back here.
    let context = unsafe { &*(refcon as *const ObserverContext) };
    let node = (!element.is_null()).then(|| {
        // SAFETY: the OS passes a valid AXUIElementRef for this call.
        let el: &ax::UiElement = unsafe { &*(element as *const ax::UiElement) };
        MacNode::handle(el.retained())
    });
    let notification = if name.is_null() {
        context.notification.clone()
    } else {
        // SAFETY: a CFStringRef for this call.
        let name: &cf::String = unsafe { &*(name as *const cf::String) };
        Notification::parse(&name.to_string())
    };
    (context.sink)(NativeNotification {
        notification,
        node,
        pid: context.pid,
    });
}

/// Owns one AXObserver on the calling thread and pumps its run loop until
/// `stop` is set. Callbacks only run inside `run_in_mode` on this thread, so
/// once it exits no sink call can start.
fn run_observer(context: ObserverContext, stop: Arc<AtomicBool>, ready: Sender<Result<()>>) {
    let pid = context.pid;
    let notification = context.notification.clone();

    let mut observer: AXObserverRef = std::ptr::null_mut();
    // SAFETY: `observer` is a valid out pointer.
    let code = unsafe { AXObserverCreate(pid, observer_callback, &mut observer) };
    if let Some(e) = registration_error(code, pid, &notification) {
        let _ = ready.send(Err(e));
        return;
    }
    if observer.is_null() {
        let _ = ready.send(Err(Error::system("AXObserverCreate returned no observer")));
        return;
    }

    let app = ax::UiElement::with_app_pid(pid);
    let app_ptr = &*app as *const ax::UiElement as *const c_void;
    let name = cf::String::from_str(notification.ax_name());
    let name_ptr = &*name as *const cf::String as *const c_void;
    let context = Box::into_raw(Box::new(context));

    // SAFETY: all pointers are live CF objects held above.
    let code = unsafe {
        AXObserverAddNotification(observer, app_ptr, name_ptr, context as *mut c_void)
    };
    if let Some(e) = registration_error(code, pid, &notification) {
        // SAFETY: never added to a run loop; no callback can hold the context.
        unsafe {
            CFRelease(observer as *const c_void);
            drop(Box::from_raw(context));
        }
        let _ = ready.send(Err(e));
        return;
    }

    // SAFETY: the source is owned by the observer, retained above.
    let src: &cf::RunLoopSrc =
        unsafe { &*(AXObserverGetRunLoopSource(observer) as *const cf::RunLoopSrc) };
    let rl = cf::RunLoop::current();
    rl.add_src(src, cf::RunLoopMode::default());
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::SeqCst) {
        cf::RunLoop::run_in_mode(cf::RunLoopMode::default(), RUN_LOOP_SLICE, true);
    }

    rl.remove_src(src, cf::RunLoopMode::default());
    // SAFETY: removed from the run loop; nothing can call back any more.
    unsafe {
        AXObserverRemoveNotification(observer, app_ptr, name_ptr);
        CFRelease(observer as *const c_void);
        drop(Box::from_raw(context));
    }
    debug!(pid, notification = %notification, "observer stopped");
}

struct ObserverRegistration {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Registration for ObserverRegistration {
    fn unregister(mut self: Box<Self>) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("observer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_errors_are_typed() {
        let n = Notification::SelectedChildrenChanged;
        assert!(registration_error(AX_SUCCESS, 1, &n).is_none());
        assert!(registration_error(AX_NOTIFICATION_ALREADY_REGISTERED, 1, &n).is_none());
        assert_eq!(
            registration_error(AX_NOTIFICATION_UNSUPPORTED, 1, &n).unwrap().code,
            ErrorCode::NotImplemented
        );
        assert_eq!(
            registration_error(AX_API_DISABLED, 1, &n).unwrap().code,
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            registration_error(AX_INVALID_UI_ELEMENT, 1, &n).unwrap().code,
            ErrorCode::AppNotRunning
        );
    }
}
