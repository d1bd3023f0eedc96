//! Command orchestrator
//!
//! Takes a command envelope, resolves its target against the live tree or
//! the session store, runs it and answers with a `{success, data, error}`
//! response. One instance per process, passed to whoever needs it.

use crate::attribute::{actions, roles};
use crate::config::Config;
use crate::criteria::Criterion;
use crate::element::{ActionResult, Element};
use crate::error::{Error, Result};
use crate::ids::ElementIdGenerator;
use crate::locator::Locator;
use crate::notification::Notification;
use crate::observer::{NotificationCenter, ObserveRequest, Subscription};
use crate::platform::{AccessibilityEngine, AppInfo, AppTarget};
use crate::record::{AppContext, DetailLevel, DetectionResult, ElementRecord};
use crate::session::SessionStore;
use crate::traversal::{self, SearchLimits, SearchMode, Searcher};
use crate::value::{Frame, Point};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `sessionId` value asking discovery to open a fresh session.
pub const NEW_SESSION: &str = "new";

const MAX_AMBIGUOUS_CANDIDATES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    #[default]
    Query,
    PerformAction,
    Batch,
    Observe,
    CollectAll,
    GetFocusedElement,
    GetElementAtPoint,
    WaitFor,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<Locator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth_for_search: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<String>,
    #[serde(default)]
    pub include_details: bool,
    #[serde(default)]
    pub watch_children: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_level: Option<DetailLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
}

impl CommandEnvelope {
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::invalid_command(format!("invalid command envelope: {}", e)))
    }

    fn target(&self) -> Result<AppTarget> {
        AppTarget::parse(self.application.as_deref().unwrap_or("focused"))
    }

    fn detail(&self) -> DetailLevel {
        self.detail_level.unwrap_or(if self.include_details {
            DetailLevel::Full
        } else {
            DetailLevel::Essential
        })
    }

    fn query_options(&self) -> QueryOptions {
        QueryOptions {
            max_depth: self.max_depth_for_search,
            timeout: self.timeout_ms.map(Duration::from_millis),
            detail: self.detail(),
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            command_id: None,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: Error) -> Self {
        Self {
            success: false,
            command_id: None,
            data: None,
            error: Some(error),
        }
    }

    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Where a command is in its life. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandPhase {
    Received,
    Resolving,
    Executing,
    Completed,
    Failed,
}

struct CommandState {
    kind: CommandKind,
    phase: CommandPhase,
    started: Instant,
}

impl CommandState {
    fn new(kind: CommandKind) -> Self {
        debug!(command = ?kind, phase = ?CommandPhase::Received, "command");
        Self {
            kind,
            phase: CommandPhase::Received,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: CommandPhase) {
        if next <= self.phase {
            return;
        }
        self.phase = next;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match next {
            CommandPhase::Failed => {
                debug!(command = ?self.kind, phase = ?next, elapsed_ms, "command failed")
            }
            _ => debug!(command = ?self.kind, phase = ?next, elapsed_ms, "command"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub max_depth: Option<usize>,
    pub timeout: Option<Duration>,
    pub detail: DetailLevel,
    /// Extra attributes to project onto each record.
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub elements: Vec<ElementRecord>,
    pub count: usize,
    /// The search hit its time budget before finishing.
    pub partial: bool,
    pub visited: usize,
}

/// Whether discovery goes to the session store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionRequest {
    #[default]
    None,
    New,
    Existing(String),
}

#[derive(Debug, Clone, Default)]
pub struct DiscoverOptions {
    pub locator: Option<Locator>,
    pub max_depth: Option<usize>,
    pub timeout: Option<Duration>,
    pub detail: DetailLevel,
    pub session: SessionRequest,
    pub screenshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<u64>,
    pub result: DetectionResult,
}

/// What an action is aimed at.
#[derive(Debug, Clone)]
pub enum ActionTarget {
    Locator { app: AppTarget, locator: Locator },
    /// A record from a discovery batch. Without a session, the most recently
    /// used one is searched.
    Stored {
        session_id: Option<String>,
        element_id: String,
    },
}

pub struct Orchestrator {
    engine: Arc<dyn AccessibilityEngine>,
    config: Config,
    sessions: Option<Arc<SessionStore>>,
    ids: ElementIdGenerator,
    notifications: NotificationCenter,
    app_locks: Mutex<HashMap<i32, Arc<Mutex<()>>>>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn AccessibilityEngine>, config: Config) -> Self {
        Self {
            notifications: NotificationCenter::new(engine.clone(), config.event_queue_capacity),
            ids: ElementIdGenerator::new(config.row_tolerance),
            engine,
            config,
            sessions: None,
            app_locks: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.sessions = Some(Arc::new(store));
        self
    }

    pub fn engine(&self) -> &Arc<dyn AccessibilityEngine> {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> Option<&SessionStore> {
        self.sessions.as_deref()
    }

    pub fn id_generator(&self) -> &ElementIdGenerator {
        &self.ids
    }

    fn session_store(&self) -> Result<&SessionStore> {
        self.sessions
            .as_deref()
            .ok_or_else(|| Error::invalid_command("no session store configured"))
    }

    // --- envelope dispatch ---

    /// Run one envelope. Never fails; errors come back in the response.
    pub fn execute(&self, envelope: &CommandEnvelope) -> Response {
        let mut state = CommandState::new(envelope.command);
        let mut response = match envelope.command {
            CommandKind::Batch => self.batch(envelope, &mut state),
            _ => Response::from_result(self.dispatch(envelope, &mut state)),
        };
        state.advance(if response.success {
            CommandPhase::Completed
        } else {
            CommandPhase::Failed
        });
        if let Some(e) = &response.error {
            debug!(kind = e.kind(), message = %e.message, "command error");
        }
        response.command_id = envelope.command_id.clone();
        response
    }

    pub fn execute_json(&self, json: &str) -> Response {
        match CommandEnvelope::parse(json) {
            Ok(envelope) => self.execute(&envelope),
            Err(e) => Response::err(e),
        }
    }

    fn dispatch(&self, env: &CommandEnvelope, state: &mut CommandState) -> Result<Value> {
        state.advance(CommandPhase::Resolving);
        match env.command {
            CommandKind::Query => {
                let locator = env.locator.clone().unwrap_or_default();
                let target = env.target()?;
                state.advance(CommandPhase::Executing);
                let outcome = self.query(&target, &locator, &env.query_options())?;
                to_value(&outcome)
            }
            CommandKind::CollectAll => {
                let session = match env.session_id.as_deref() {
                    None => SessionRequest::None,
                    Some(NEW_SESSION) => SessionRequest::New,
                    Some(id) => SessionRequest::Existing(id.to_string()),
                };
                let opts = DiscoverOptions {
                    locator: env.locator.clone(),
                    max_depth: env.max_depth_for_search,
                    timeout: env.timeout_ms.map(Duration::from_millis),
                    detail: env.detail(),
                    session,
                    screenshot_path: env.screenshot_path.clone(),
                };
                let target = env.target()?;
                state.advance(CommandPhase::Executing);
                to_value(&self.discover(&target, &opts)?)
            }
            CommandKind::PerformAction => {
                let action = env
                    .action
                    .as_deref()
                    .ok_or_else(|| Error::invalid_command("performAction needs 'action'"))?;
                let target = if let Some(element_id) = &env.element_id {
                    ActionTarget::Stored {
                        session_id: env.session_id.clone(),
                        element_id: element_id.clone(),
                    }
                } else {
                    let locator = env.locator.clone().ok_or_else(|| {
                        Error::invalid_command("performAction needs 'locator' or 'elementId'")
                    })?;
                    ActionTarget::Locator {
                        app: env.target()?,
                        locator,
                    }
                };
                state.advance(CommandPhase::Executing);
                let result = self.perform_action(
                    &target,
                    action,
                    env.action_value.as_deref(),
                    &env.query_options(),
                )?;
                to_value(&result)
            }
            CommandKind::GetFocusedElement => {
                state.advance(CommandPhase::Executing);
                let record = self.focused_element(env.detail(), &env.attributes)?;
                to_value(&record)
            }
            CommandKind::GetElementAtPoint => {
                let point = env
                    .point
                    .ok_or_else(|| Error::invalid_command("getElementAtPoint needs 'point'"))?;
                state.advance(CommandPhase::Executing);
                let record = self.element_at_point(point, env.detail(), &env.attributes)?;
                to_value(&record)
            }
            CommandKind::WaitFor => {
                let locator = env
                    .locator
                    .clone()
                    .ok_or_else(|| Error::invalid_command("waitFor needs 'locator'"))?;
                let target = env.target()?;
                let timeout = env
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.config.time_budget());
                state.advance(CommandPhase::Executing);
                let record = self.wait_for(&target, &locator, timeout, &env.query_options())?;
                to_value(&record)
            }
            CommandKind::Observe => {
                let request = self.observe_request(env)?;
                state.advance(CommandPhase::Executing);
                let subscription = self.observe(request)?;
                let data = json!({
                    "subscriptionId": subscription.id(),
                    "pid": subscription.pid(),
                    "notifications": subscription.notifications(),
                });
                let mut subscriptions = self.subscriptions.lock();
                self.prune_subscriptions(&mut subscriptions);
                subscriptions.insert(subscription.id(), subscription);
                Ok(data)
            }
            CommandKind::Batch => Err(Error::invalid_command("nested batch is not supported")),
        }
    }

    fn batch(&self, env: &CommandEnvelope, state: &mut CommandState) -> Response {
        let Some(fail_fast) = env.fail_fast else {
            return Response::err(Error::invalid_command(
                "batch needs an explicit 'failFast' (true or false)",
            ));
        };
        state.advance(CommandPhase::Executing);

        let mut results = Vec::with_capacity(env.commands.len());
        let mut first_error = None;
        let mut failed = 0;
        for (i, sub) in env.commands.iter().enumerate() {
            let response = if sub.command == CommandKind::Batch {
                Response::err(Error::invalid_command("nested batch is not supported"))
            } else {
                self.execute(sub)
            };
            let ok = response.success;
            if !ok {
                failed += 1;
                if first_error.is_none() {
                    first_error = response.error.clone();
                }
            }
            results.push(response);
            if !ok && fail_fast {
                info!(index = i, total = env.commands.len(), "batch stopped at failed command");
                break;
            }
        }

        let data = json!({
            "results": results,
            "completed": results.len(),
            "failed": failed,
            "total": env.commands.len(),
        });
        Response {
            success: failed == 0,
            command_id: None,
            data: Some(data),
            error: first_error,
        }
    }

    fn observe_request(&self, env: &CommandEnvelope) -> Result<ObserveRequest> {
        let notifications: Vec<Notification> =
            env.notifications.iter().map(|n| Notification::parse(n)).collect();
        let mut request = ObserveRequest::new(env.target()?, notifications)
            .watch_children(env.watch_children);
        if let Some(locator) = env.locator.clone().filter(|l| !l.is_empty()) {
            request = request.filter(locator);
        }
        Ok(request)
    }

    // --- typed operations ---

    fn ensure_permission(&self) -> Result<()> {
        if self.engine.has_permission() {
            Ok(())
        } else {
            Err(Error::permission_denied(
                "Accessibility permission is not granted to this process",
            ))
        }
    }

    pub fn application(&self, target: &AppTarget) -> Result<(AppInfo, Element)> {
        self.ensure_permission()?;
        let (info, root) = self.engine.application(target)?;
        Ok((info, Element::new(root)))
    }

    pub fn applications(&self) -> Result<Vec<AppInfo>> {
        self.ensure_permission()?;
        self.engine.applications()
    }

    fn limits(&self, max_depth: Option<usize>, timeout: Option<Duration>) -> SearchLimits {
        let mut limits = SearchLimits::from_config(&self.config);
        if let Some(depth) = max_depth {
            limits = limits.with_max_depth(depth);
        }
        if let Some(timeout) = timeout {
            limits = limits.with_time_budget(timeout);
        }
        limits
    }

    /// Commands against one application run one at a time. Not reentrant:
    /// `f` must not take the lock of the same pid again.
    fn with_app_lock<T>(&self, pid: i32, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .app_locks
            .lock()
            .entry(pid)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        let mut locks = self.app_locks.lock();
        drop(lock);
        if locks.get(&pid).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&pid);
        }
        result
    }

    pub fn query(
        &self,
        app: &AppTarget,
        locator: &Locator,
        opts: &QueryOptions,
    ) -> Result<QueryOutcome> {
        let (info, root) = self.application(app)?;
        let limits = self.limits(opts.max_depth, opts.timeout);
        self.with_app_lock(info.pid, || {
            let result = Searcher::new(limits).find(&root, locator, SearchMode::CollectAll)?;
            if result.matches.is_empty() {
                if result.timed_out {
                    return Err(Error::timeout(
                        &locator.to_string(),
                        limits.time_budget.as_millis() as u64,
                    ));
                }
                return Err(Error::element_not_found(&locator.to_string()));
            }

            let elements: Vec<ElementRecord> = result
                .matches
                .iter()
                .filter_map(|m| {
                    ElementRecord::snapshot(&m.element, opts.detail, m.depth)
                        .map(|r| r.with_attributes(&m.element, &opts.attributes))
                })
                .collect();
            if result.timed_out {
                warn!(locator = %locator, found = elements.len(), "query returned partial results");
            }
            Ok(QueryOutcome {
                count: elements.len(),
                elements,
                partial: result.timed_out,
                visited: result.visited,
            })
        })
    }

    /// Exactly one live element for a locator.
    pub fn find_unique(
        &self,
        app: &AppTarget,
        locator: &Locator,
        opts: &QueryOptions,
    ) -> Result<(AppInfo, Element)> {
        let (info, root) = self.application(app)?;
        let limits = self.limits(opts.max_depth, opts.timeout);
        let element = self.with_app_lock(info.pid, || unique_match(&root, locator, limits))?;
        Ok((info, element))
    }

    /// Discovery: collect, snapshot, assign ids, optionally persist.
    pub fn discover(&self, app: &AppTarget, opts: &DiscoverOptions) -> Result<DiscoveryOutcome> {
        let (info, root) = self.application(app)?;
        let limits = self.limits(opts.max_depth, opts.timeout);
        let locator = opts.locator.clone().unwrap_or_default();

        let mut batch = self.with_app_lock(info.pid, || {
            let result = Searcher::new(limits).find(&root, &locator, SearchMode::CollectAll)?;

            // Snapshots can fail for nodes destroyed since the walk; children
            // of a dropped record hang off its nearest kept ancestor.
            let mut records = Vec::with_capacity(result.matches.len());
            let mut kept: Vec<Option<usize>> = Vec::with_capacity(result.matches.len());
            let mut anchor: Vec<Option<usize>> = Vec::with_capacity(result.matches.len());
            let mut parents = Vec::with_capacity(result.matches.len());
            for m in &result.matches {
                let inherited = m.parent.and_then(|p| kept[p].or(anchor[p]));
                match ElementRecord::snapshot(&m.element, opts.detail, m.depth) {
                    Some(record) => {
                        kept.push(Some(records.len()));
                        anchor.push(inherited);
                        parents.push(inherited);
                        records.push(record);
                    }
                    None => {
                        kept.push(None);
                        anchor.push(inherited);
                    }
                }
            }

            let ids = self.ids.assign_ids(&records);
            let mut context = AppContext::from(&info);
            if let Some(window) = main_window(&root) {
                context.window_title = window.title();
                context.window_bounds = window.frame();
            }
            let mut batch = DetectionResult::link(context, records, &parents, ids, opts.detail);
            batch.partial = result.timed_out;
            Ok(batch)
        })?;
        batch.screenshot_path = opts.screenshot_path.clone();

        let (session_id, snapshot) = match &opts.session {
            SessionRequest::None => (None, None),
            SessionRequest::New => {
                let store = self.session_store()?;
                let id = store.create_session()?;
                let n = store.store_detection_result(&id, &batch)?;
                (Some(id), Some(n))
            }
            SessionRequest::Existing(id) => {
                let store = self.session_store()?;
                store.ensure_session(id)?;
                let n = store.store_detection_result(id, &batch)?;
                (Some(id.clone()), Some(n))
            }
        };
        if let (Some(id), Some(store)) = (&session_id, self.sessions.as_deref()) {
            // Keep the stored copy's screenshot path.
            if let Some(stored) = store.get_detection_result(id)? {
                batch.screenshot_path = stored.screenshot_path;
            }
        }

        info!(
            app = %info.name,
            elements = batch.elements.len(),
            partial = batch.partial,
            session = session_id.as_deref().unwrap_or("-"),
            "discovery finished"
        );
        Ok(DiscoveryOutcome {
            session_id,
            snapshot,
            result: batch,
        })
    }

    /// Live element for a stored record (snapshot-then-verify). The record's
    /// role, identifier and title must still match, and its frame must be
    /// within tolerance of the recorded one.
    pub fn resolve_record(&self, pid: i32, record: &ElementRecord) -> Result<Element> {
        let (_, root) = self.application(&AppTarget::Pid(pid))?;
        self.with_app_lock(pid, || self.resolve_in(&root, record))
    }

    // Caller holds the app lock.
    fn resolve_in(&self, root: &Element, record: &ElementRecord) -> Result<Element> {
        let mut locator = Locator::new().with(Criterion::role(&record.role));
        if let Some(identifier) = &record.identifier {
            locator = locator.with(Criterion::identifier(identifier));
        }
        if let Some(title) = &record.title {
            locator = locator.with(Criterion::title(title));
        }
        let limits = self.limits(None, None);
        let result = Searcher::new(limits).find(root, &locator, SearchMode::CollectAll)?;

        let what = if record.id.is_empty() {
            record.role.clone()
        } else {
            record.id.clone()
        };
        let chosen = match record.frame {
            Some(recorded) => nearest(&result.elements(), recorded, self.config.resolve_tolerance),
            None => result.elements().into_iter().next(),
        };
        match chosen {
            Some(element) => {
                debug!(id = %what, "re-resolved stored element");
                Ok(element)
            }
            None => Err(Error::stale(&what)),
        }
    }

    fn stored_record(
        &self,
        session_id: Option<&str>,
        element_id: &str,
    ) -> Result<(i32, ElementRecord)> {
        let store = self.session_store()?;
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => store
                .list_sessions()?
                .into_iter()
                .next()
                .map(|s| s.id)
                .ok_or_else(|| Error::session_not_found("(most recent)"))?,
        };
        let batch = store.get_detection_result(&session_id)?.ok_or_else(|| {
            Error::session_not_found(&session_id).with_suggestions(vec![format!(
                "Session '{}' has no discovery batch yet; run collectAll with this sessionId first",
                session_id
            )])
        })?;
        let record = batch
            .element(element_id)
            .cloned()
            .ok_or_else(|| Error::element_not_found(element_id))?;
        Ok((batch.app.pid, record))
    }

    /// Resolve, check the action is advertised, invoke. Never retried.
    pub fn perform_action(
        &self,
        target: &ActionTarget,
        action: &str,
        value: Option<&str>,
        opts: &QueryOptions,
    ) -> Result<ActionResult> {
        let action = normalize_action(action);
        let (app, how) = match target {
            ActionTarget::Locator { app, locator } => (app.clone(), Resolve::Search(locator)),
            ActionTarget::Stored {
                session_id,
                element_id,
            } => {
                let (pid, record) = self.stored_record(session_id.as_deref(), element_id)?;
                (AppTarget::Pid(pid), Resolve::Record(record))
            }
        };
        let (info, root) = self.application(&app)?;
        let pid = info.pid;

        self.with_app_lock(pid, || {
            let (element, record_id) = match how {
                Resolve::Search(locator) => {
                    let limits = self.limits(opts.max_depth, opts.timeout);
                    (unique_match(&root, locator, limits)?, None)
                }
                Resolve::Record(record) => (self.resolve_in(&root, &record)?, Some(record.id)),
            };
            let mut result = if action == actions::SET_VALUE {
                let text = value.ok_or_else(|| {
                    Error::invalid_command("setValue needs 'actionValue'")
                })?;
                element.set_value(text)?
            } else {
                element.perform_action(&action)?
            };
            result.element =
                ElementRecord::snapshot(&element.refreshed(), DetailLevel::Essential, 0).map(
                    |mut r| {
                        if let Some(id) = record_id {
                            r.id = id;
                        }
                        r
                    },
                );
            info!(action = %action, pid, timing_ms = result.timing_ms, "action performed");
            Ok(result)
        })
    }

    pub fn focused_element(
        &self,
        detail: DetailLevel,
        attributes: &[String],
    ) -> Result<ElementRecord> {
        self.ensure_permission()?;
        let element = Element::new(self.engine.focused_element()?);
        self.snapshot_locked(&element, detail, attributes, "focused element")
    }

    /// OS hit-test, not a traversal.
    pub fn element_at_point(
        &self,
        point: Point,
        detail: DetailLevel,
        attributes: &[String],
    ) -> Result<ElementRecord> {
        self.ensure_permission()?;
        let element = Element::new(self.engine.element_at_point(point)?);
        let what = format!("element at ({}, {})", point.x, point.y);
        self.snapshot_locked(&element, detail, attributes, &what)
    }

    /// Snapshot under the lock of the element's application.
    fn snapshot_locked(
        &self,
        element: &Element,
        detail: DetailLevel,
        attributes: &[String],
        what: &str,
    ) -> Result<ElementRecord> {
        match element.pid() {
            Some(pid) => self.with_app_lock(pid, || {
                snapshot_or_stale(element, detail, attributes, what)
            }),
            None => snapshot_or_stale(element, detail, attributes, what),
        }
    }

    /// Poll until the locator finds something or `timeout` elapses.
    pub fn wait_for(
        &self,
        app: &AppTarget,
        locator: &Locator,
        timeout: Duration,
        opts: &QueryOptions,
    ) -> Result<ElementRecord> {
        let what = format!("waiting for {}", locator);
        traversal::wait_for(&what, timeout, self.config.wait_poll(), || {
            let (info, root) = self.application(app)?;
            let limits = self.limits(opts.max_depth, Some(timeout));
            self.with_app_lock(info.pid, || {
                let result = Searcher::new(limits).find(&root, locator, SearchMode::FirstMatch)?;
                Ok(result.matches.first().and_then(|m| {
                    ElementRecord::snapshot(&m.element, opts.detail, m.depth)
                        .map(|r| r.with_attributes(&m.element, &opts.attributes))
                }))
            })
        })
    }

    pub fn observe(&self, request: ObserveRequest) -> Result<Subscription> {
        self.ensure_permission()?;
        self.notifications.observe(request)
    }

    // Drop handles that were cancelled or whose application has quit.
    fn prune_subscriptions(&self, subscriptions: &mut HashMap<u64, Subscription>) {
        subscriptions.retain(|id, s| {
            let keep =
                s.is_active() && self.engine.application(&AppTarget::Pid(s.pid())).is_ok();
            if !keep {
                debug!(subscription = id, pid = s.pid(), "evicting subscription");
            }
            keep
        });
    }

    /// Hand a subscription opened through an envelope to the caller.
    pub fn take_subscription(&self, id: u64) -> Option<Subscription> {
        self.subscriptions.lock().remove(&id)
    }

    /// Stop a subscription opened through an envelope.
    pub fn cancel_subscription(&self, id: u64) -> bool {
        match self.subscriptions.lock().remove(&id) {
            Some(mut subscription) => {
                subscription.cancel();
                true
            }
            None => false,
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::system(format!("serializing response: {}", e)))
}

fn snapshot_or_stale(
    element: &Element,
    detail: DetailLevel,
    attributes: &[String],
    what: &str,
) -> Result<ElementRecord> {
    ElementRecord::snapshot(element, detail, 0)
        .map(|r| r.with_attributes(element, attributes))
        .ok_or_else(|| Error::stale(what))
}

/// How an action target becomes a live element.
enum Resolve<'a> {
    Search(&'a Locator),
    Record(ElementRecord),
}

/// Exactly one match under `root`. Caller holds the app lock.
fn unique_match(root: &Element, locator: &Locator, limits: SearchLimits) -> Result<Element> {
    let result = Searcher::new(limits).find(root, locator, SearchMode::CollectAll)?;
    let mut elements = result.elements();
    match elements.len() {
        0 if result.timed_out => Err(Error::timeout(
            &locator.to_string(),
            limits.time_budget.as_millis() as u64,
        )),
        0 => Err(Error::element_not_found(&locator.to_string())),
        1 => Ok(elements.remove(0)),
        n => {
            let candidates: Vec<ElementRecord> = result
                .matches
                .iter()
                .take(MAX_AMBIGUOUS_CANDIDATES)
                .filter_map(|m| {
                    ElementRecord::snapshot(&m.element, DetailLevel::Essential, m.depth)
                })
                .collect();
            Err(Error::ambiguous(&locator.to_string(), n, json!(candidates)))
        }
    }
}

fn main_window(root: &Element) -> Option<Element> {
    root.children()
        .into_iter()
        .find(|c| c.role().as_deref() == Some(roles::WINDOW))
}

fn nearest(candidates: &[Element], recorded: Frame, tolerance: f64) -> Option<Element> {
    let target = recorded.center();
    candidates
        .iter()
        .filter_map(|c| c.frame().map(|f| (c, f.center().distance(&target))))
        .filter(|(_, d)| *d <= tolerance)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c.clone())
}

/// `press` -> `AXPress`, `setValue` -> `AXSetValue`; `AX*` names pass through.
pub fn normalize_action(name: &str) -> String {
    let name = name.trim();
    if name.starts_with("AX") {
        return name.to_string();
    }
    match name.to_ascii_lowercase().as_str() {
        "press" | "click" => actions::PRESS.to_string(),
        "setvalue" | "set_value" | "type" => actions::SET_VALUE.to_string(),
        "showmenu" | "show_menu" => actions::SHOW_MENU.to_string(),
        _ => {
            let mut chars = name.chars();
            match chars.next() {
                Some(first) => format!("AX{}{}", first.to_ascii_uppercase(), chars.as_str()),
                None => String::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::platform::memory::{MemoryTree, NodeSpec};

    fn form() -> (MemoryTree, Orchestrator, usize) {
        let tree = MemoryTree::new();
        let app = tree.add_app("Form", Some("com.example.form"), 500);
        let window = tree.add_node(
            app,
            NodeSpec::new("AXWindow")
                .title("Sign in")
                .frame(0.0, 0.0, 400.0, 300.0)
                .child(
                    NodeSpec::new("AXButton")
                        .title("Submit")
                        .frame(10.0, 200.0, 80.0, 24.0)
                        .action("AXPress"),
                )
                .child(
                    NodeSpec::new("AXButton")
                        .title("Cancel")
                        .frame(100.0, 200.0, 80.0, 24.0)
                        .action("AXPress"),
                )
                .child(
                    NodeSpec::new("AXTextField")
                        .description("Email")
                        .frame(10.0, 50.0, 200.0, 24.0),
                ),
        );
        let orchestrator = Orchestrator::new(Arc::new(tree.clone()), Config::default());
        (tree, orchestrator, window)
    }

    fn envelope(json: Value) -> CommandEnvelope {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn query_by_and_locator() {
        let (_, orch, _) = form();
        let response = orch.execute(&envelope(json!({
            "command": "query",
            "application": "com.example.form",
            "locator": {
                "criteria": [
                    {"attribute": "role", "value": "AXButton"},
                    {"attribute": "title", "value": "Submit"}
                ],
                "matchAll": true
            },
            "attributes": ["AXTitle"]
        })));
        assert!(response.success, "{:?}", response.error);
        let data = response.data.unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["elements"][0]["title"], "Submit");
        assert_eq!(data["elements"][0]["attributes"]["AXTitle"], "Submit");
    }

    #[test]
    fn no_match_is_element_not_found() {
        let (_, orch, _) = form();
        let response = orch.execute(&envelope(json!({
            "command": "query",
            "application": "Form",
            "locator": {"criteria": [{"attribute": "title", "value": "Nope"}]}
        })));
        assert!(!response.success);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["kind"], "ELEMENT_NOT_FOUND");
    }

    #[test]
    fn action_by_locator_requires_unique_target() {
        let (tree, orch, window) = form();
        let response = orch.execute(&envelope(json!({
            "command": "performAction",
            "application": "PID:500",
            "locator": {"criteria": [{"attribute": "role", "value": "AXButton"}]},
            "action": "press"
        })));
        assert_eq!(response.error.unwrap().code, ErrorCode::AmbiguousMatch);

        let response = orch.execute(&envelope(json!({
            "command": "performAction",
            "application": "PID:500",
            "locator": {"criteria": [{"attribute": "title", "value": "Cancel"}]},
            "action": "AXPress"
        })));
        assert!(response.success);
        let cancel = tree.children_of(window)[1];
        assert_eq!(tree.performed_actions(cancel), vec!["AXPress"]);
    }

    #[test]
    fn unsupported_action_is_rejected_before_invoking() {
        let (tree, orch, window) = form();
        let response = orch.execute(&envelope(json!({
            "command": "performAction",
            "application": "Form",
            "locator": {"criteria": [{"attribute": "title", "value": "Submit"}]},
            "action": "AXShowMenu"
        })));
        assert_eq!(response.error.unwrap().code, ErrorCode::ActionNotSupported);
        let submit = tree.children_of(window)[0];
        assert!(tree.performed_actions(submit).is_empty());
    }

    #[test]
    fn set_value_writes_the_field() {
        let (tree, orch, window) = form();
        let response = orch.execute(&envelope(json!({
            "command": "performAction",
            "application": "Form",
            "locator": {"criteria": [{"attribute": "description", "value": "Email"}]},
            "action": "setValue",
            "actionValue": "me@example.com"
        })));
        assert!(response.success, "{:?}", response.error);
        let field = tree.children_of(window)[2];
        assert_eq!(tree.element(field).value_string().as_deref(), Some("me@example.com"));
    }

    #[test]
    fn batch_requires_fail_fast() {
        let (_, orch, _) = form();
        let response = orch.execute(&envelope(json!({"command": "batch", "commands": []})));
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidCommand);
    }

    #[test]
    fn batch_policies() {
        let (_, orch, _) = form();
        let commands = json!([
            {"command": "query", "application": "Form",
             "locator": {"criteria": [{"attribute": "title", "value": "Missing"}]}},
            {"command": "query", "application": "Form",
             "locator": {"criteria": [{"attribute": "title", "value": "Submit"}]}}
        ]);

        let fast = orch.execute(&envelope(
            json!({"command": "batch", "failFast": true, "commands": commands}),
        ));
        assert!(!fast.success);
        assert_eq!(fast.data.as_ref().unwrap()["completed"], 1);
        assert_eq!(fast.error.unwrap().code, ErrorCode::ElementNotFound);

        let all = orch.execute(&envelope(
            json!({"command": "batch", "failFast": false, "commands": commands}),
        ));
        assert!(!all.success);
        let data = all.data.unwrap();
        assert_eq!(data["completed"], 2);
        assert_eq!(data["failed"], 1);
        assert_eq!(data["results"][1]["success"], true);
    }

    #[test]
    fn discover_assigns_ids_and_window_context() {
        let (_, orch, _) = form();
        let outcome = orch
            .discover(&AppTarget::Name("form".to_string()), &DiscoverOptions::default())
            .unwrap();
        let batch = &outcome.result;
        assert_eq!(batch.app.window_title.as_deref(), Some("Sign in"));
        assert_eq!(batch.element("B1").unwrap().title.as_deref(), Some("Submit"));
        assert_eq!(batch.element("B2").unwrap().title.as_deref(), Some("Cancel"));
        assert_eq!(batch.element("T1").unwrap().label.as_deref(), Some("Email"));
        assert_eq!(batch.element("B1").unwrap().parent_id.as_deref(), Some("G1"));
        assert_eq!(batch.element("G2").unwrap().role, "AXApplication");
        assert!(outcome.session_id.is_none());
    }

    #[test]
    fn session_requested_without_store_fails() {
        let (_, orch, _) = form();
        let opts = DiscoverOptions {
            session: SessionRequest::New,
            ..Default::default()
        };
        let err = orch.discover(&AppTarget::Pid(500), &opts).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCommand);
    }

    #[test]
    fn point_and_focus() {
        let (tree, orch, window) = form();
        let record = orch
            .element_at_point(Point::new(20.0, 210.0), DetailLevel::Full, &[])
            .unwrap();
        assert_eq!(record.title.as_deref(), Some("Submit"));
        assert_eq!(record.actions, vec!["AXPress"]);

        let field = tree.children_of(window)[2];
        tree.set_focused(field);
        let response = orch.execute(&envelope(json!({"command": "getFocusedElement"})));
        assert_eq!(response.data.unwrap()["role"], "AXTextField");
    }

    #[test]
    fn permission_is_checked_first() {
        let (tree, orch, _) = form();
        tree.set_trusted(false);
        let response = orch.execute(&envelope(json!({"command": "query", "application": "Form"})));
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::PermissionDenied);
        assert!(!error.suggestions.is_empty());
    }

    #[test]
    fn observe_returns_a_handle() {
        let (tree, orch, window) = form();
        let response = orch.execute(&envelope(json!({
            "command": "observe",
            "application": "Form",
            "notifications": ["AXValueChanged"]
        })));
        let id = response.data.unwrap()["subscriptionId"].as_u64().unwrap();
        let field = tree.children_of(window)[2];
        tree.set_attribute(field, "AXValue", "typed");

        let subscription = orch.take_subscription(id).unwrap();
        let event = subscription.try_recv().unwrap();
        assert_eq!(event.notification, Notification::ValueChanged);
        drop(subscription);
        assert_eq!(tree.subscriber_count(), 0);
        assert!(!orch.cancel_subscription(id));
    }

    #[test]
    fn subscriptions_of_quit_apps_are_evicted() {
        let (tree, orch, _) = form();
        let other = tree.add_app("Other", None, 501);
        tree.add_node(other, NodeSpec::new("AXWindow"));
        let observe = |app: &str| {
            orch.execute(&envelope(json!({
                "command": "observe",
                "application": app,
                "notifications": ["AXValueChanged"]
            })))
            .data
            .unwrap()["subscriptionId"]
                .as_u64()
                .unwrap()
        };

        let first = observe("Form");
        tree.quit_app(500);
        let second = observe("Other");
        assert!(!orch.cancel_subscription(first));
        assert!(orch.cancel_subscription(second));
        assert!(orch.subscriptions.lock().is_empty());
    }

    #[test]
    fn action_resolves_inside_the_app_lock() {
        let (tree, orch, window) = form();
        let submit = tree.children_of(window)[0];
        let target = ActionTarget::Locator {
            app: AppTarget::Pid(500),
            locator: Locator::new()
                .with(Criterion::role("AXButton"))
                .with(Criterion::title("Submit")),
        };

        // While another command holds the lock the button is replaced. The
        // waiting action must resolve the replacement, not the original.
        let replacement = std::thread::scope(|scope| {
            let (handle, replacement) = orch
                .with_app_lock(500, || {
                    let handle = scope.spawn(|| {
                        orch.perform_action(&target, "press", None, &QueryOptions::default())
                    });
                    std::thread::sleep(Duration::from_millis(100));
                    assert!(!handle.is_finished());
                    tree.destroy(submit);
                    let replacement = tree.add_node(
                        window,
                        NodeSpec::new("AXButton")
                            .title("Submit")
                            .frame(10.0, 200.0, 80.0, 24.0)
                            .action("AXPress"),
                    );
                    Ok((handle, replacement))
                })
                .unwrap();
            handle.join().unwrap().unwrap();
            replacement
        });
        assert_eq!(tree.performed_actions(replacement), vec!["AXPress"]);
        assert!(tree.performed_actions(submit).is_empty());
        assert!(orch.app_locks.lock().is_empty());
    }

    #[test]
    fn session_without_batch_asks_for_discovery() {
        let (_, orch, _) = form();
        let dir = tempfile::tempdir().unwrap();
        let orch = orch.with_session_store(SessionStore::new(dir.path(), 5).unwrap());
        let id = orch.sessions().unwrap().create_session().unwrap();
        let response = orch.execute(&envelope(json!({
            "command": "performAction",
            "sessionId": id,
            "elementId": "B1",
            "action": "press"
        })));
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::SessionNotFound);
        assert!(error.suggestions.iter().any(|s| s.contains("collectAll")));
    }

    #[test]
    fn wait_for_sees_late_element() {
        let (tree, orch, window) = form();
        let late = tree.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            late.add_node(window, NodeSpec::new("AXStaticText").value("Welcome"));
        });
        let record = orch
            .wait_for(
                &AppTarget::Pid(500),
                &Locator::new().with(Criterion::exact("value", "Welcome").unwrap()),
                Duration::from_secs(2),
                &QueryOptions::default(),
            )
            .unwrap();
        handle.join().unwrap();
        assert_eq!(record.role, "AXStaticText");
    }

    #[test]
    fn normalizes_action_names() {
        assert_eq!(normalize_action("press"), "AXPress");
        assert_eq!(normalize_action("setValue"), "AXSetValue");
        assert_eq!(normalize_action("raise"), "AXRaise");
        assert_eq!(normalize_action("AXConfirm"), "AXConfirm");
    }
}
