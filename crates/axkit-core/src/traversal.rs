//! Depth- and time-bounded search over the live tree
//!
//! Path hints are resolved first, breadth-first below the previous waypoint.
//! The remaining criteria are then evaluated in a pre-order depth-first walk,
//! children in native sibling order. Nodes that disappear mid-walk are
//! skipped along with their subtree.

use crate::config::Config;
use crate::element::Element;
use crate::error::{Error, ErrorCode, Result};
use crate::locator::{Locator, PathHint};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    FirstMatch,
    CollectAll,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchLimits {
    /// Maximum `children()` hops from the search root.
    pub max_depth: usize,
    pub time_budget: Duration,
    /// Node visits between clock checks.
    pub check_interval: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SearchLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_depth: config.max_depth,
            time_budget: config.time_budget(),
            check_interval: config.time_check_interval.max(1),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }
}

/// Cooperative cancellation, checked at every node visit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Match {
    pub element: Element,
    /// Hops from the search root.
    pub depth: usize,
    /// Index of the nearest matched ancestor in the same result.
    pub parent: Option<usize>,
}

#[derive(Debug, Default)]
pub struct SearchResult {
    pub matches: Vec<Match>,
    /// Collection stopped at the time budget; `matches` is partial.
    pub timed_out: bool,
    pub visited: usize,
    pub elapsed: Duration,
}

impl SearchResult {
    pub fn elements(&self) -> Vec<Element> {
        self.matches.iter().map(|m| m.element.clone()).collect()
    }

    pub fn first(&self) -> Option<&Element> {
        self.matches.first().map(|m| &m.element)
    }
}

pub struct Searcher {
    limits: SearchLimits,
    cancel: Option<CancellationToken>,
    start: Instant,
    visited: usize,
}

impl Searcher {
    pub fn new(limits: SearchLimits) -> Self {
        Self {
            limits,
            cancel: None,
            start: Instant::now(),
            visited: 0,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run a locator from `root`.
    ///
    /// `FirstMatch` fails with `SearchTimeout` when the budget runs out.
    /// `CollectAll` returns what it reached with `timed_out` set instead.
    /// Path hint failures are `LocatorPathNotFound`; no wider search follows.
    pub fn find(
        mut self,
        root: &Element,
        locator: &Locator,
        mode: SearchMode,
    ) -> Result<SearchResult> {
        self.start = Instant::now();
        self.visited = 0;

        let (anchor, offset) = match self.resolve_path(root, locator.path_hints()) {
            Ok(found) => found,
            Err(e) if e.code == ErrorCode::SearchTimeout && mode == SearchMode::CollectAll => {
                return Ok(SearchResult {
                    timed_out: true,
                    visited: self.visited,
                    elapsed: self.start.elapsed(),
                    ..Default::default()
                })
            }
            Err(e) => return Err(e),
        };

        let mut result = SearchResult::default();
        let outcome = self.walk(&anchor, offset, locator, mode, &mut result.matches);
        result.visited = self.visited;
        result.elapsed = self.start.elapsed();

        match outcome {
            Ok(()) => {}
            Err(e) if e.code == ErrorCode::SearchTimeout && mode == SearchMode::CollectAll => {
                debug!(
                    visited = result.visited,
                    found = result.matches.len(),
                    "collection hit time budget"
                );
                result.timed_out = true;
            }
            Err(e) => return Err(e),
        }

        debug!(
            locator = %locator,
            visited = result.visited,
            found = result.matches.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "search finished"
        );
        Ok(result)
    }

    /// Resolve path hints in order. Returns the last waypoint and its depth
    /// below `root`.
    pub fn resolve_path(&mut self, root: &Element, hints: &[PathHint]) -> Result<(Element, usize)> {
        let mut anchor = root.clone();
        let mut offset = 0;
        for (step, hint) in hints.iter().enumerate() {
            match self.find_waypoint(&anchor, hint)? {
                Some((found, hops)) => {
                    debug!(step, hint = %hint, hops, "path hint resolved");
                    anchor = found;
                    offset += hops;
                }
                None => {
                    return Err(Error::path_not_found(
                        step,
                        &hint.criterion.to_string(),
                        hint.max_depth,
                    ))
                }
            }
        }
        Ok((anchor, offset))
    }

    fn find_waypoint(
        &mut self,
        from: &Element,
        hint: &PathHint,
    ) -> Result<Option<(Element, usize)>> {
        let mut queue: VecDeque<(Element, usize)> = VecDeque::new();
        queue.push_back((from.clone(), 0));

        while let Some((node, depth)) = queue.pop_front() {
            if depth > 0 {
                self.tick()?;
                if hint.criterion.matches(&node) {
                    return Ok(Some((node, depth)));
                }
            }
            if depth < hint.max_depth {
                if let Ok(children) = node.try_children() {
                    queue.extend(children.into_iter().map(|c| (c, depth + 1)));
                }
            }
        }
        Ok(None)
    }

    fn walk(
        &mut self,
        anchor: &Element,
        offset: usize,
        locator: &Locator,
        mode: SearchMode,
        out: &mut Vec<Match>,
    ) -> Result<()> {
        let mut stack: Vec<(Element, usize, Option<usize>)> = vec![(anchor.clone(), offset, None)];

        while let Some((node, depth, parent)) = stack.pop() {
            self.tick()?;

            if let Err(e) = node.try_role() {
                debug!(error = %e, depth, "skipping unreadable node");
                continue;
            }

            let mut parent_for_children = parent;
            if locator.matches(&node) {
                out.push(Match {
                    element: node.clone(),
                    depth,
                    parent,
                });
                if mode == SearchMode::FirstMatch {
                    return Ok(());
                }
                parent_for_children = Some(out.len() - 1);
            }

            if depth >= self.limits.max_depth {
                continue;
            }
            match node.try_children() {
                Ok(children) => {
                    for child in children.into_iter().rev() {
                        stack.push((child, depth + 1, parent_for_children));
                    }
                }
                Err(e) => debug!(error = %e, depth, "skipping subtree"),
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.visited += 1;
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(Error::cancelled("tree search"));
        }
        if self.visited % self.limits.check_interval.max(1) == 0
            && self.start.elapsed() >= self.limits.time_budget
        {
            return Err(Error::timeout(
                "tree search",
                self.limits.time_budget.as_millis() as u64,
            ));
        }
        Ok(())
    }
}

/// One-shot search with default cancellation.
pub fn find(
    root: &Element,
    locator: &Locator,
    mode: SearchMode,
    limits: SearchLimits,
) -> Result<SearchResult> {
    Searcher::new(limits).find(root, locator, mode)
}

/// Poll `probe` until it yields a value or `timeout` elapses.
pub fn wait_for<T>(
    what: &str,
    timeout: Duration,
    poll: Duration,
    mut probe: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let start = Instant::now();
    loop {
        match probe() {
            Ok(Some(found)) => return Ok(found),
            Ok(None) => {}
            // Not-found-like failures are what waiting is for.
            Err(e)
                if matches!(
                    e.code,
                    ErrorCode::ElementNotFound
                        | ErrorCode::StaleElement
                        | ErrorCode::LocatorPathNotFound
                        | ErrorCode::SearchTimeout
                ) => {}
            Err(e) => return Err(e),
        }
        if start.elapsed() >= timeout {
            return Err(Error::timeout(what, timeout.as_millis() as u64));
        }
        let remaining = timeout.saturating_sub(start.elapsed());
        std::thread::sleep(poll.min(remaining).max(Duration::from_millis(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criterion;
    use crate::platform::memory::{MemoryTree, NodeId, NodeSpec};

    fn deep_tree(levels: usize) -> (MemoryTree, NodeId) {
        let tree = MemoryTree::new();
        let app = tree.add_app("Deep", None, 1);
        let mut spec = NodeSpec::new("AXButton").title("leaf");
        for i in 0..levels {
            spec = NodeSpec::new("AXGroup").title(&format!("g{}", levels - i)).child(spec);
        }
        tree.add_node(app, spec);
        (tree, app)
    }

    #[test]
    fn collect_respects_depth_bound() {
        let (tree, app) = deep_tree(6);
        let limits = SearchLimits::default().with_max_depth(3);
        let result =
            find(&tree.element(app), &Locator::new(), SearchMode::CollectAll, limits).unwrap();
        assert_eq!(result.matches.len(), 4);
        assert!(result.matches.iter().all(|m| m.depth <= 3));
        assert!(!result.timed_out);
    }

    #[test]
    fn collect_order_is_preorder() {
        let tree = MemoryTree::new();
        let app = tree.add_app("Order", None, 1);
        tree.add_node(
            app,
            NodeSpec::new("AXGroup")
                .title("a")
                .child(NodeSpec::new("AXButton").title("a1"))
                .child(NodeSpec::new("AXButton").title("a2")),
        );
        tree.add_node(app, NodeSpec::new("AXButton").title("b"));
        let result = find(
            &tree.element(app),
            &Locator::role("AXButton"),
            SearchMode::CollectAll,
            SearchLimits::default(),
        )
        .unwrap();
        let titles: Vec<String> = result.elements().iter().filter_map(|e| e.title()).collect();
        assert_eq!(titles, vec!["a1", "a2", "b"]);
    }

    #[test]
    fn first_match_short_circuits() {
        let tree = MemoryTree::new();
        let app = tree.add_app("Short", None, 1);
        for i in 0..50 {
            tree.add_node(app, NodeSpec::new("AXButton").title(&format!("b{}", i)));
        }
        let result = find(
            &tree.element(app),
            &Locator::role("AXButton"),
            SearchMode::FirstMatch,
            SearchLimits::default(),
        )
        .unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.visited, 2);
    }

    #[test]
    fn nearest_matched_ancestor_is_recorded() {
        let tree = MemoryTree::new();
        let app = tree.add_app("Nest", None, 1);
        tree.add_node(
            app,
            NodeSpec::new("AXGroup").child(NodeSpec::new("AXStaticText").title("x")),
        );
        let result = find(
            &tree.element(app),
            &Locator::new(),
            SearchMode::CollectAll,
            SearchLimits::default(),
        )
        .unwrap();
        assert_eq!(result.matches[0].parent, None);
        assert_eq!(result.matches[1].parent, Some(0));
        assert_eq!(result.matches[2].parent, Some(1));
    }

    #[test]
    fn path_hint_failure_does_not_fall_back() {
        let tree = MemoryTree::new();
        let app = tree.add_app("Hints", None, 1);
        tree.add_node(
            app,
            NodeSpec::new("AXWindow").child(NodeSpec::new("AXButton").title("Back")),
        );
        let locator = Locator::new()
            .path(Criterion::role("AXWindow"), 1)
            .path(Criterion::identifier("toolbar"), 3)
            .with(Criterion::title("Back"));
        let err = find(
            &tree.element(app),
            &locator,
            SearchMode::FirstMatch,
            SearchLimits::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::LocatorPathNotFound);
        assert_eq!(err.context.unwrap()["step"], 1);
    }

    #[test]
    fn path_hints_narrow_the_search() {
        let tree = MemoryTree::new();
        let app = tree.add_app("Hints", None, 1);
        tree.add_node(app, NodeSpec::new("AXButton").title("Back"));
        tree.add_node(
            app,
            NodeSpec::new("AXWindow").child(
                NodeSpec::new("AXGroup")
                    .child(
                        NodeSpec::new("AXToolbar")
                            .identifier("toolbar")
                            .child(NodeSpec::new("AXButton").title("Back")),
                    ),
            ),
        );
        let locator = Locator::new()
            .path(Criterion::role("AXWindow"), 1)
            .path(Criterion::identifier("toolbar"), 3)
            .with(Criterion::title("Back"));
        let result = find(
            &tree.element(app),
            &locator,
            SearchMode::CollectAll,
            SearchLimits::default(),
        )
        .unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].depth, 4);
    }

    #[test]
    fn stale_subtrees_are_skipped() {
        let tree = MemoryTree::new();
        let app = tree.add_app("Stale", None, 1);
        let doomed = tree.add_node(app, NodeSpec::new("AXGroup").child(NodeSpec::new("AXButton")));
        tree.add_node(app, NodeSpec::new("AXButton"));
        // A handle captured before destruction, as a racing walk would hold.
        let stale = tree.element(doomed);
        tree.destroy(doomed);
        let result = find(
            &stale,
            &Locator::new(),
            SearchMode::CollectAll,
            SearchLimits::default(),
        )
        .unwrap();
        assert!(result.matches.is_empty());

        let result = find(
            &tree.element(app),
            &Locator::role("AXButton"),
            SearchMode::CollectAll,
            SearchLimits::default(),
        )
        .unwrap();
        assert_eq!(result.matches.len(), 1);
    }

    #[test]
    fn slow_tree_times_out() {
        let (tree, app) = deep_tree(200);
        tree.set_latency(Duration::from_millis(2));
        let limits = SearchLimits {
            max_depth: 500,
            time_budget: Duration::from_millis(50),
            check_interval: 4,
        };
        let start = Instant::now();
        let collected =
            find(&tree.element(app), &Locator::new(), SearchMode::CollectAll, limits).unwrap();
        assert!(collected.timed_out);
        assert!(!collected.matches.is_empty());

        let err = find(
            &tree.element(app),
            &Locator::title("leaf"),
            SearchMode::FirstMatch,
            limits,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SearchTimeout);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let (tree, app) = deep_tree(10);
        let token = CancellationToken::new();
        token.cancel();
        let err = Searcher::new(SearchLimits::default())
            .with_cancel(token)
            .find(&tree.element(app), &Locator::new(), SearchMode::CollectAll)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
    }

    #[test]
    fn wait_for_times_out() {
        let mut calls = 0;
        let err = wait_for("never", Duration::from_millis(30), Duration::from_millis(5), || {
            calls += 1;
            Ok::<Option<()>, Error>(None)
        })
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SearchTimeout);
        assert!(calls > 1);
    }
}
