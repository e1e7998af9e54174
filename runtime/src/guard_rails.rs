//! Development-time guard rails for the reference host.
//!
//! Every notification accepted by a [`Dispatcher`](crate::Dispatcher) is shown
//! to a list of [`Auditor`]s together with the state before and after the
//! reducer ran. Auditors report [`Violation`]s; the guard rails log them with
//! `tracing::warn!`, count them, and keep the most recent ones for inspection.
//! They never block or alter a notification.
//!
//! Guard rails are enabled by default in debug builds only.
//!
//! # Built-in auditors
//!
//! - [`SerializabilityAuditor`]: events and states must serialize to JSON
//! - [`LifecycleOrderAuditor`]: `Started` precedes exactly one terminal event
//! - [`FnAuditor`]: wraps a closure

use crate::metrics::GuardRailMetrics;
use chrono::{DateTime, Utc};
use composable_ops_core::event::{LifecycleEvent, RequestStatus};
use composable_ops_core::request_id::RequestId;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Number of violations kept by [`GuardRails::recent_violations`]
pub const DEFAULT_VIOLATION_HISTORY: usize = 256;

/// What auditors can learn about a host event
///
/// Implemented for [`LifecycleEvent`]. Host event enums wrapping lifecycle
/// events implement it by delegation.
pub trait ObservedEvent {
    /// Type string such as `"users/fetch/pending"`
    fn event_type(&self) -> String;

    /// Invocation id, for lifecycle events
    fn request_id(&self) -> Option<&RequestId> {
        None
    }

    /// Lifecycle status, for lifecycle events
    fn request_status(&self) -> Option<RequestStatus> {
        None
    }

    /// `true` for a vetoed invocation's terminal event
    fn condition_failed(&self) -> bool {
        false
    }
}

impl<A, T, R> ObservedEvent for LifecycleEvent<A, T, R> {
    fn event_type(&self) -> String {
        Self::event_type(self)
    }

    fn request_id(&self) -> Option<&RequestId> {
        Some(Self::request_id(self))
    }

    fn request_status(&self) -> Option<RequestStatus> {
        Some(Self::request_status(self))
    }

    fn condition_failed(&self) -> bool {
        Self::condition_failed(self)
    }
}

/// A problem reported by an auditor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    /// Name of the reporting auditor
    pub auditor: String,
    /// Type of the event being audited
    pub event_type: String,
    /// Human readable description
    pub message: String,
    /// Where the problem was found (`"event"`, `"state"`, ...)
    pub path: Option<String>,
    /// When the violation was detected
    pub detected_at: DateTime<Utc>,
}

impl Violation {
    /// Create a violation stamped with the current time
    #[must_use]
    pub fn new(
        auditor: impl Into<String>,
        event_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            auditor: auditor.into(),
            event_type: event_type.into(),
            message: message.into(),
            path: None,
            detected_at: Utc::now(),
        }
    }

    /// Attach the location of the problem
    #[must_use]
    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.auditor, self.event_type, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " (at {path})")?;
        }
        Ok(())
    }
}

/// Observes accepted notifications
pub trait Auditor<S, Ev>: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Inspect one notification and the state transition it caused
    fn check(&self, event: &Ev, current: &S, previous: &S) -> Vec<Violation>;
}

/// Auditor list plus the violation history
pub struct GuardRails<S, Ev> {
    enabled: bool,
    auditors: Vec<Arc<dyn Auditor<S, Ev>>>,
    history: Mutex<VecDeque<Violation>>,
    history_limit: usize,
}

impl<S, Ev> GuardRails<S, Ev> {
    /// Empty guard rails, enabled in debug builds
    #[must_use]
    pub fn new() -> Self {
        Self::with_enabled(cfg!(debug_assertions))
    }

    /// Empty guard rails with an explicit switch
    #[must_use]
    pub fn with_enabled(enabled: bool) -> Self {
        Self {
            enabled,
            auditors: Vec::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_VIOLATION_HISTORY,
        }
    }

    /// Register an auditor
    pub fn push(&mut self, auditor: Arc<dyn Auditor<S, Ev>>) {
        self.auditors.push(auditor);
    }

    /// `true` when auditors run
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `true` when enabled with at least one auditor
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && !self.auditors.is_empty()
    }

    /// Number of registered auditors
    #[must_use]
    pub fn len(&self) -> usize {
        self.auditors.len()
    }

    /// `true` when no auditor is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.auditors.is_empty()
    }

    /// Run every auditor and report what they found
    ///
    /// Violations are logged, counted and recorded; the return value is the
    /// list for this notification only.
    pub fn audit(&self, event: &Ev, current: &S, previous: &S) -> Vec<Violation> {
        if !self.enabled {
            return Vec::new();
        }

        let violations: Vec<Violation> = self
            .auditors
            .iter()
            .flat_map(|auditor| auditor.check(event, current, previous))
            .collect();

        for violation in &violations {
            tracing::warn!(
                auditor = %violation.auditor,
                event_type = %violation.event_type,
                path = violation.path.as_deref().unwrap_or_default(),
                "Guard rail violation: {}",
                violation.message
            );
            GuardRailMetrics::record_violation(&violation.auditor);
        }

        if !violations.is_empty() {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            for violation in &violations {
                if history.len() >= self.history_limit {
                    history.pop_front();
                }
                history.push_back(violation.clone());
            }
        }

        violations
    }

    /// Most recent violations, oldest first
    #[must_use]
    pub fn recent_violations(&self) -> Vec<Violation> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl<S, Ev> Default for GuardRails<S, Ev> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, Ev> fmt::Debug for GuardRails<S, Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.auditors.iter().map(|auditor| auditor.name()).collect();
        f.debug_struct("GuardRails")
            .field("enabled", &self.enabled)
            .field("auditors", &names)
            .finish_non_exhaustive()
    }
}

/// Flags events and states that cannot be serialized to JSON
///
/// A value fails when `serde_json` rejects it, for example a map whose keys do
/// not serialize as strings.
#[derive(Debug, Clone)]
pub struct SerializabilityAuditor {
    ignored_event_types: HashSet<String>,
    check_state: bool,
}

impl SerializabilityAuditor {
    /// Check every event and the resulting state
    #[must_use]
    pub fn new() -> Self {
        Self {
            ignored_event_types: HashSet::new(),
            check_state: true,
        }
    }

    /// Skip events of the given type
    #[must_use]
    pub fn with_ignored_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.ignored_event_types.insert(event_type.into());
        self
    }

    /// Set whether the resulting state is checked as well
    #[must_use]
    pub const fn with_state_check(mut self, check_state: bool) -> Self {
        self.check_state = check_state;
        self
    }
}

impl Default for SerializabilityAuditor {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, Ev> Auditor<S, Ev> for SerializabilityAuditor
where
    S: Serialize,
    Ev: Serialize + ObservedEvent,
{
    fn name(&self) -> &str {
        "serializability"
    }

    fn check(&self, event: &Ev, current: &S, _previous: &S) -> Vec<Violation> {
        let event_type = event.event_type();
        if self.ignored_event_types.contains(&event_type) {
            return Vec::new();
        }

        let mut violations = Vec::new();
        if let Err(error) = serde_json::to_value(event) {
            violations.push(
                Violation::new(
                    "serializability",
                    event_type.clone(),
                    format!("event is not serializable: {error}"),
                )
                .at_path("event"),
            );
        }
        if self.check_state {
            if let Err(error) = serde_json::to_value(current) {
                violations.push(
                    Violation::new(
                        "serializability",
                        event_type,
                        format!("state is not serializable: {error}"),
                    )
                    .at_path("state"),
                );
            }
        }
        violations
    }
}

#[derive(Debug, Default)]
struct OrderBook {
    open: HashSet<RequestId>,
    closed: HashSet<RequestId>,
    closed_order: VecDeque<RequestId>,
}

/// Checks that every invocation notifies `Started` before exactly one terminal event
///
/// Vetoed invocations may notify their terminal event without `Started`.
/// Closed invocations are remembered up to a fixed limit.
#[derive(Debug)]
pub struct LifecycleOrderAuditor {
    book: Mutex<OrderBook>,
    remembered: usize,
}

impl LifecycleOrderAuditor {
    /// Remember up to 1024 closed invocations
    #[must_use]
    pub fn new() -> Self {
        Self::with_memory(1024)
    }

    /// Remember up to `remembered` closed invocations
    #[must_use]
    pub fn with_memory(remembered: usize) -> Self {
        Self {
            book: Mutex::new(OrderBook::default()),
            remembered,
        }
    }

    fn violation(event_type: String, message: String) -> Violation {
        Violation::new("lifecycle_order", event_type, message).at_path("request_id")
    }
}

impl Default for LifecycleOrderAuditor {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, Ev> Auditor<S, Ev> for LifecycleOrderAuditor
where
    Ev: ObservedEvent,
{
    fn name(&self) -> &str {
        "lifecycle_order"
    }

    fn check(&self, event: &Ev, _current: &S, _previous: &S) -> Vec<Violation> {
        let (Some(request_id), Some(status)) = (event.request_id(), event.request_status()) else {
            return Vec::new();
        };
        let event_type = event.event_type();
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);

        if book.closed.contains(request_id) {
            return vec![Self::violation(
                event_type,
                format!("invocation {request_id} already settled"),
            )];
        }

        if status == RequestStatus::Pending {
            if !book.open.insert(request_id.clone()) {
                return vec![Self::violation(
                    event_type,
                    format!("invocation {request_id} started twice"),
                )];
            }
            return Vec::new();
        }

        let was_open = book.open.remove(request_id);
        book.closed.insert(request_id.clone());
        book.closed_order.push_back(request_id.clone());
        while book.closed_order.len() > self.remembered {
            if let Some(oldest) = book.closed_order.pop_front() {
                book.closed.remove(&oldest);
            }
        }

        if !was_open && !event.condition_failed() {
            return vec![Self::violation(
                event_type,
                format!("invocation {request_id} settled without starting"),
            )];
        }
        Vec::new()
    }
}

/// Auditor backed by a closure
pub struct FnAuditor<F> {
    name: String,
    check: F,
}

impl<F> FnAuditor<F> {
    /// Wrap `check` under the given name
    #[must_use]
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> fmt::Debug for FnAuditor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAuditor").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<S, Ev, F> Auditor<S, Ev> for FnAuditor<F>
where
    F: Fn(&Ev, &S, &S) -> Vec<Violation> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, event: &Ev, current: &S, previous: &S) -> Vec<Violation> {
        (self.check)(event, current, previous)
    }
}
