//! Notification center
//!
//! One backend registration per (application, notification) pair, all
//! feeding one bounded queue per subscription. The consumer pulls.

use crate::element::Element;
use crate::error::{Error, Result};
use crate::locator::Locator;
use crate::notification::Notification;
use crate::platform::{AccessibilityEngine, AppTarget, NativeNotification, Registration};
use crate::record::{DetailLevel, ElementRecord};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub notification: Notification,
    /// Best effort; may already be stale when inspected.
    pub element: Option<Element>,
    pub pid: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub notification: Notification,
    pub pid: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementRecord>,
}

impl NotificationEvent {
    /// Serializable view. Element details are read now, so a destroyed
    /// element simply has none.
    pub fn payload(&self, include_details: bool) -> EventPayload {
        let detail = if include_details {
            DetailLevel::Full
        } else {
            DetailLevel::Essential
        };
        EventPayload {
            notification: self.notification.clone(),
            pid: self.pid,
            timestamp: self.timestamp,
            element: self
                .element
                .as_ref()
                .and_then(|e| ElementRecord::snapshot(e, detail, 0)),
        }
    }
}

/// What to observe.
#[derive(Debug, Clone)]
pub struct ObserveRequest {
    pub application: AppTarget,
    pub notifications: Vec<Notification>,
    /// Only events whose element matches. With `watch_children`, an event
    /// also passes when any ancestor matches.
    pub filter: Option<Locator>,
    pub watch_children: bool,
}

impl ObserveRequest {
    pub fn new(application: AppTarget, notifications: Vec<Notification>) -> Self {
        Self {
            application,
            notifications,
            filter: None,
            watch_children: false,
        }
    }

    pub fn filter(mut self, filter: Locator) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn watch_children(mut self, watch: bool) -> Self {
        self.watch_children = watch;
        self
    }
}

pub struct NotificationCenter {
    engine: Arc<dyn AccessibilityEngine>,
    capacity: usize,
    next_id: AtomicU64,
}

impl NotificationCenter {
    pub fn new(engine: Arc<dyn AccessibilityEngine>, capacity: usize) -> Self {
        Self {
            engine,
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn observe(&self, request: ObserveRequest) -> Result<Subscription> {
        if request.notifications.is_empty() {
            return Err(Error::invalid_command("observe needs at least one notification"));
        }
        let (app, _) = self.engine.application(&request.application)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = bounded(self.capacity);
        let gate: Arc<Mutex<Option<Sender<NotificationEvent>>>> = Arc::new(Mutex::new(Some(tx)));
        let dropped = Arc::new(AtomicU64::new(0));
        let filter = Arc::new(request.filter.clone());
        let watch_children = request.watch_children;

        let mut subscription = Subscription {
            id,
            pid: app.pid,
            notifications: request.notifications.clone(),
            receiver: rx,
            registrations: Vec::new(),
            gate: gate.clone(),
            dropped: dropped.clone(),
        };

        for notification in &request.notifications {
            let gate = gate.clone();
            let dropped = dropped.clone();
            let filter = filter.clone();
            let sink = Arc::new(move |native: NativeNotification| {
                let guard = gate.lock();
                let Some(tx) = guard.as_ref() else {
                    return;
                };
                let element = native.node.map(Element::new);
                if let Some(locator) = filter.as_ref() {
                    if !passes(locator, element.as_ref(), watch_children) {
                        return;
                    }
                }
                let event = NotificationEvent {
                    notification: native.notification,
                    element,
                    pid: native.pid,
                    timestamp: Utc::now(),
                };
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        let total = dropped.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(
                            subscription = id,
                            notification = %event.notification,
                            dropped = total,
                            "event queue full, dropping"
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            });

            // Partial registration is torn down by the subscription's drop.
            let registration = self.engine.subscribe(app.pid, notification, sink)?;
            subscription.registrations.push(registration);
        }

        debug!(
            subscription = id,
            pid = app.pid,
            notifications = ?request.notifications,
            "observing"
        );
        Ok(subscription)
    }
}

fn passes(filter: &Locator, element: Option<&Element>, watch_children: bool) -> bool {
    let Some(element) = element else {
        return false;
    };
    if filter.matches(element) {
        return true;
    }
    if !watch_children {
        return false;
    }
    let mut current = element.parent();
    while let Some(ancestor) = current {
        if filter.matches(&ancestor) {
            return true;
        }
        current = ancestor.parent();
    }
    false
}

/// A live event stream. Cancelling (or dropping) it stops delivery before
/// returning; events queued earlier stay readable.
pub struct Subscription {
    id: u64,
    pid: i32,
    notifications: Vec<Notification>,
    receiver: Receiver<NotificationEvent>,
    registrations: Vec<Box<dyn Registration>>,
    gate: Arc<Mutex<Option<Sender<NotificationEvent>>>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.gate.lock().is_some()
    }

    pub fn try_recv(&self) -> Option<NotificationEvent> {
        self.receiver.try_recv().ok()
    }

    /// `None` once cancelled and drained.
    pub fn recv(&self) -> Option<NotificationEvent> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<NotificationEvent>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    pub fn cancel(&mut self) {
        // Close the gate first: a callback already inside finishes, later
        // ones see no sender.
        let was_active = self.gate.lock().take().is_some();
        for registration in self.registrations.drain(..) {
            registration.unregister();
        }
        if was_active {
            debug!(subscription = self.id, "subscription cancelled");
        }
    }
}

impl Iterator for Subscription {
    type Item = NotificationEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criterion;
    use crate::platform::memory::{MemoryTree, NodeSpec};

    fn app() -> (MemoryTree, usize, usize) {
        let tree = MemoryTree::new();
        let root = tree.add_app("Editor", Some("com.example.editor"), 77);
        let field = tree.add_node(
            root,
            NodeSpec::new("AXGroup")
                .identifier("form")
                .child(NodeSpec::new("AXTextField").identifier("subject")),
        );
        let input = tree.children_of(field)[0];
        (tree, field, input)
    }

    fn center(tree: &MemoryTree, capacity: usize) -> NotificationCenter {
        NotificationCenter::new(Arc::new(tree.clone()), capacity)
    }

    #[test]
    fn events_arrive_in_order() {
        let (tree, _, input) = app();
        let sub = center(&tree, 16)
            .observe(ObserveRequest::new(
                AppTarget::Pid(77),
                vec![Notification::ValueChanged, Notification::TitleChanged],
            ))
            .unwrap();
        tree.set_attribute(input, "AXValue", "a");
        tree.set_attribute(input, "AXTitle", "b");
        tree.set_attribute(input, "AXValue", "c");

        let kinds: Vec<Notification> = (0..3)
            .filter_map(|_| sub.try_recv())
            .map(|e| e.notification)
            .collect();
        assert_eq!(
            kinds,
            vec![Notification::ValueChanged, Notification::TitleChanged, Notification::ValueChanged]
        );
        let event = sub.try_recv();
        assert!(event.is_none());
    }

    #[test]
    fn nothing_arrives_after_cancel() {
        let (tree, _, input) = app();
        let mut sub = center(&tree, 16)
            .observe(ObserveRequest::new(AppTarget::Pid(77), vec![Notification::ValueChanged]))
            .unwrap();
        tree.set_attribute(input, "AXValue", "before");
        sub.cancel();
        assert_eq!(tree.subscriber_count(), 0);
        tree.set_attribute(input, "AXValue", "after");

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
        assert!(!sub.is_active());
        assert!(sub.next().is_none());
    }

    #[test]
    fn drop_unregisters() {
        let (tree, _, _) = app();
        let sub = center(&tree, 16)
            .observe(ObserveRequest::new(
                AppTarget::Pid(77),
                vec![Notification::ValueChanged, Notification::ElementDestroyed],
            ))
            .unwrap();
        assert_eq!(tree.subscriber_count(), 2);
        drop(sub);
        assert_eq!(tree.subscriber_count(), 0);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (tree, _, input) = app();
        let sub = center(&tree, 2)
            .observe(ObserveRequest::new(AppTarget::Pid(77), vec![Notification::ValueChanged]))
            .unwrap();
        for i in 0..5 {
            tree.set_attribute(input, "AXValue", format!("{}", i));
        }
        assert_eq!(sub.dropped(), 3);
    }

    #[test]
    fn filter_with_children() {
        let (tree, _, input) = app();
        let form = Locator::new().with(Criterion::identifier("form"));
        let center = center(&tree, 16);

        let direct = center
            .observe(
                ObserveRequest::new(AppTarget::Pid(77), vec![Notification::ValueChanged])
                    .filter(form.clone()),
            )
            .unwrap();
        let nested = center
            .observe(
                ObserveRequest::new(AppTarget::Pid(77), vec![Notification::ValueChanged])
                    .filter(form)
                    .watch_children(true),
            )
            .unwrap();

        tree.set_attribute(input, "AXValue", "x");
        assert!(direct.try_recv().is_none());
        let event = nested.try_recv().unwrap();
        assert_eq!(event.element.unwrap().identifier().as_deref(), Some("subject"));
    }

    #[test]
    fn payload_of_destroyed_element_has_no_details() {
        let (tree, field, _) = app();
        let sub = center(&tree, 16)
            .observe(ObserveRequest::new(AppTarget::Pid(77), vec![Notification::ElementDestroyed]))
            .unwrap();
        tree.destroy(field);
        let event = sub.try_recv().unwrap();
        let payload = event.payload(true);
        assert!(payload.element.is_none());
        assert_eq!(payload.pid, 77);
    }

    #[test]
    fn undeliverable_notification_fails_the_whole_subscription() {
        let (tree, _, _) = app();
        tree.set_unsupported(Notification::SelectedChildrenChanged);
        let err = center(&tree, 16)
            .observe(ObserveRequest::new(
                AppTarget::Pid(77),
                vec![Notification::ValueChanged, Notification::SelectedChildrenChanged],
            ))
            .err()
            .unwrap();
        assert_eq!(err.code, crate::error::ErrorCode::NotImplemented);
        assert_eq!(tree.subscriber_count(), 0);
    }

    #[test]
    fn unknown_app_fails() {
        let (tree, _, _) = app();
        let err = center(&tree, 16)
            .observe(ObserveRequest::new(AppTarget::Pid(1), vec![Notification::ValueChanged]))
            .err()
            .unwrap();
        assert_eq!(err.code, crate::error::ErrorCode::AppNotRunning);
    }
}
