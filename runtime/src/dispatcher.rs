//! Reference host state container.
//!
//! A [`Dispatcher`] owns a state value and a reducer. Each notification is
//! reduced into the state under a write lock, broadcast to subscribers and
//! shown to the guard rails. It implements both host seams, so an
//! [`InvokeContext`] can be built from it directly with
//! [`Dispatcher::context`].
//!
//! # Example
//!
//! ```
//! use composable_ops_core::LifecycleEvent;
//! use composable_ops_runtime::{AsyncOperation, Dispatcher, OperationApi};
//!
//! type Event = LifecycleEvent<u32, u32, ()>;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = Dispatcher::new(Vec::<String>::new(), |log: &mut Vec<String>, event: &Event| {
//!     log.push(event.event_type());
//! });
//!
//! let square = AsyncOperation::<u32, u32, (), Vec<String>>::new(
//!     "math/square",
//!     |n: u32, api: OperationApi<Vec<String>, (), ()>| async move { Ok(api.fulfill(n * n)) },
//! );
//!
//! let value = square.invoke(3, &dispatcher.context(())).unwrap().await;
//! assert_eq!(value, Ok(9));
//! assert_eq!(dispatcher.snapshot(), vec!["math/square/pending", "math/square/fulfilled"]);
//! # }
//! ```

use crate::context::InvokeContext;
use crate::guard_rails::{
    Auditor, GuardRails, LifecycleOrderAuditor, ObservedEvent, SerializabilityAuditor, Violation,
};
use composable_ops_core::host::{NotificationSink, StateSource};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// Host policy for a [`Dispatcher`]
///
/// # Example
///
/// ```
/// use composable_ops_runtime::DispatcherConfig;
///
/// let config = DispatcherConfig::default()
///     .with_broadcast_capacity(256)
///     .with_guard_rails(true);
///
/// assert_eq!(config.broadcast_capacity, 256);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Events buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// Run auditors on every notification
    pub guard_rails: bool,
    /// Install the [`SerializabilityAuditor`] in [`Dispatcher::with_default_auditors`]
    pub serializable_check: bool,
    /// Install the [`LifecycleOrderAuditor`] in [`Dispatcher::with_default_auditors`]
    pub lifecycle_order_check: bool,
}

impl DispatcherConfig {
    /// Set the broadcast capacity
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Turn guard rails on or off
    #[must_use]
    pub const fn with_guard_rails(mut self, enabled: bool) -> Self {
        self.guard_rails = enabled;
        self
    }

    /// Toggle the serializability auditor
    #[must_use]
    pub const fn with_serializable_check(mut self, enabled: bool) -> Self {
        self.serializable_check = enabled;
        self
    }

    /// Toggle the lifecycle ordering auditor
    #[must_use]
    pub const fn with_lifecycle_order_check(mut self, enabled: bool) -> Self {
        self.lifecycle_order_check = enabled;
        self
    }
}

impl Default for DispatcherConfig {
    /// Defaults:
    /// - `broadcast_capacity`: 16
    /// - `guard_rails`: on in debug builds, off in release builds
    /// - `serializable_check`: true
    /// - `lifecycle_order_check`: true
    fn default() -> Self {
        Self {
            broadcast_capacity: 16,
            guard_rails: cfg!(debug_assertions),
            serializable_check: true,
            lifecycle_order_check: true,
        }
    }
}

type Reducer<S, Ev> = Box<dyn Fn(&mut S, &Ev) + Send + Sync>;

struct Inner<S, Ev> {
    state: RwLock<S>,
    reducer: Reducer<S, Ev>,
    events: broadcast::Sender<Ev>,
    guard_rails: GuardRails<S, Ev>,
    config: DispatcherConfig,
}

/// Reference host: state, reducer, broadcast and guard rails
///
/// Cloning is cheap; clones share the same state.
pub struct Dispatcher<S, Ev> {
    inner: Arc<Inner<S, Ev>>,
}

impl<S, Ev> Dispatcher<S, Ev>
where
    S: Clone + Send + Sync + 'static,
    Ev: Clone + Send + Sync + 'static,
{
    /// Create a dispatcher with the default configuration and no auditors
    #[must_use]
    pub fn new<F>(initial_state: S, reducer: F) -> Self
    where
        F: Fn(&mut S, &Ev) + Send + Sync + 'static,
    {
        Self::with_config(initial_state, reducer, DispatcherConfig::default())
    }

    /// Create a dispatcher with a custom configuration and no auditors
    #[must_use]
    pub fn with_config<F>(initial_state: S, reducer: F, config: DispatcherConfig) -> Self
    where
        F: Fn(&mut S, &Ev) + Send + Sync + 'static,
    {
        Self::with_guard_rails(
            initial_state,
            reducer,
            config,
            GuardRails::with_enabled(config.guard_rails),
        )
    }

    /// Create a dispatcher with explicit guard rails
    ///
    /// `config.guard_rails` is ignored; the switch on `guard_rails` wins.
    #[must_use]
    pub fn with_guard_rails<F>(
        initial_state: S,
        reducer: F,
        config: DispatcherConfig,
        guard_rails: GuardRails<S, Ev>,
    ) -> Self
    where
        F: Fn(&mut S, &Ev) + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(config.broadcast_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(initial_state),
                reducer: Box::new(reducer),
                events,
                guard_rails,
                config,
            }),
        }
    }

    /// Create a dispatcher with the built-in auditors selected by `config`
    #[must_use]
    pub fn with_default_auditors<F>(initial_state: S, reducer: F, config: DispatcherConfig) -> Self
    where
        F: Fn(&mut S, &Ev) + Send + Sync + 'static,
        S: Serialize,
        Ev: Serialize + ObservedEvent,
    {
        let mut guard_rails = GuardRails::with_enabled(config.guard_rails);
        if config.serializable_check {
            let auditor: Arc<dyn Auditor<S, Ev>> = Arc::new(SerializabilityAuditor::new());
            guard_rails.push(auditor);
        }
        if config.lifecycle_order_check {
            let auditor: Arc<dyn Auditor<S, Ev>> = Arc::new(LifecycleOrderAuditor::new());
            guard_rails.push(auditor);
        }
        Self::with_guard_rails(initial_state, reducer, config, guard_rails)
    }

    fn read(&self) -> RwLockReadGuard<'_, S> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, S> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reduce, broadcast and audit one event
    #[tracing::instrument(skip_all, name = "dispatcher_notify")]
    pub fn dispatch(&self, event: Ev) {
        let audited = self.inner.guard_rails.is_active();

        let snapshots = {
            let mut state = self.write();
            let previous = audited.then(|| state.clone());
            (self.inner.reducer)(&mut state, &event);
            let snapshots = previous.map(|previous| (previous, state.clone()));

            // Broadcast under the lock so subscribers see reduction order.
            match self.inner.events.send(event.clone()) {
                Ok(receivers) => tracing::trace!(receivers, "Event broadcast"),
                Err(_) => tracing::trace!("Event broadcast with no subscribers"),
            }
            snapshots
        };

        if let Some((previous, current)) = snapshots {
            self.inner.guard_rails.audit(&event, &current, &previous);
        }
    }

    /// Read state through a closure
    pub fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        f(&self.read())
    }

    /// Clone of the current state
    #[must_use]
    pub fn snapshot(&self) -> S {
        self.read().clone()
    }

    /// Receive every event accepted after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Ev> {
        self.inner.events.subscribe()
    }

    /// Violations recorded by the guard rails, oldest first
    #[must_use]
    pub fn recent_violations(&self) -> Vec<Violation> {
        self.inner.guard_rails.recent_violations()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> DispatcherConfig {
        self.inner.config
    }

    /// Invoke context delivering to and reading from this dispatcher
    #[must_use]
    pub fn context<X>(&self, extra: X) -> InvokeContext<S, X, Ev> {
        let sink: Arc<dyn NotificationSink<Ev>> = Arc::new(self.clone());
        let state: Arc<dyn StateSource<S>> = Arc::new(self.clone());
        InvokeContext::new(sink, state, extra)
    }
}

impl<S, Ev> NotificationSink<Ev> for Dispatcher<S, Ev>
where
    S: Clone + Send + Sync + 'static,
    Ev: Clone + Send + Sync + 'static,
{
    fn notify(&self, event: Ev) {
        self.dispatch(event);
    }
}

impl<S, Ev> StateSource<S> for Dispatcher<S, Ev>
where
    S: Clone + Send + Sync + 'static,
    Ev: Clone + Send + Sync + 'static,
{
    fn read_state(&self) -> S {
        self.snapshot()
    }
}

impl<S, Ev> Clone for Dispatcher<S, Ev> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: fmt::Debug, Ev> fmt::Debug for Dispatcher<S, Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Dispatcher");
        match self.inner.state.try_read() {
            Ok(state) => debug.field("state", &*state),
            Err(_) => debug.field("state", &"<locked>"),
        };
        debug
            .field("subscribers", &self.inner.events.receiver_count())
            .field("guard_rails", &self.inner.guard_rails)
            .field("config", &self.inner.config)
            .finish()
    }
}
