//! Lifecycle engine.
//!
//! [`AsyncOperation::invoke`] builds the handle synchronously and spawns one
//! lifecycle task per invocation. The task walks the state machine:
//!
//! ```text
//! Created ──gate false──────────────────────────────▶ Vetoed  (Failed, condition_failed)
//!    │
//!    └─gate true─▶ Started ──work returns──────────▶ Succeeded | RejectedWithValue
//!                     │     ──work throws──────────▶ Failed
//!                     └──── signal fires first ────▶ Failed  (aborted)
//! ```
//!
//! Exactly one terminal event is produced. It is delivered to the host (unless
//! the invocation was vetoed silently) and then settles the handle.

use crate::context::InvokeContext;
use crate::handle::{
    OperationHandle, RUNTIME_UNAVAILABLE_ERROR_NAME, RUNTIME_UNAVAILABLE_MESSAGE, SettlementSender,
};
use crate::metrics::{
    OPERATION_ABORTED_TOTAL, OPERATION_CONDITION_REJECTED_TOTAL, OPERATION_FULFILLED_TOTAL,
    OPERATION_REJECTED_TOTAL, OperationMetrics,
};
use crate::operation::{AsyncOperation, Condition, OperationApi, OperationScope};
use composable_ops_core::error::{
    ABORT_ERROR_NAME, CONDITION_ERROR_MESSAGE, CONDITION_ERROR_NAME, DEFAULT_ABORT_MESSAGE,
    NormalizedError, SerializedError, Thrown,
};
use composable_ops_core::event::{Completion, LifecycleEvent, Metadata};
use composable_ops_core::host::{NotificationSink, StateSource};
use composable_ops_core::request_id::RequestId;
use composable_ops_core::signal::{AbortController, CancellationSignal};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;

/// How the work phase ended
enum WorkOutcome<T, R> {
    Completed(Completion<T, R>),
    Threw(Thrown),
    Aborted,
}

impl<A, T, R, S, X> AsyncOperation<A, T, R, S, X>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    S: 'static,
    X: Clone + Send + Sync + 'static,
{
    /// Start one invocation
    ///
    /// Returns immediately; the returned handle can be aborted at once and
    /// awaited for the terminal event. Lifecycle events are converted into the
    /// host's event type with `Ev::from` and delivered through the context's
    /// sink, in order: `Started`, then exactly one terminal event.
    ///
    /// Never fails synchronously. Without a Tokio runtime on the current
    /// thread, nothing is notified and the handle settles with a `Failed`
    /// event named `RuntimeUnavailable`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let handle = fetch_user.invoke(7, &dispatcher.context(()));
    /// let event = handle.settled().await;
    /// assert_eq!(event.event_type(), "users/fetch/fulfilled");
    /// ```
    #[tracing::instrument(skip_all, name = "operation_invoke", fields(type_prefix = %self.type_prefix))]
    pub fn invoke<Ev>(&self, argument: A, context: &InvokeContext<S, X, Ev>) -> OperationHandle<A, T, R>
    where
        Ev: From<LifecycleEvent<A, T, R>> + 'static,
    {
        let request_id = self.id_generator.generate();
        let gate_signal = context.create_signal();
        let work_signal = context.create_signal();
        let controller = AbortController::new(vec![gate_signal.clone(), work_signal.clone()]);

        let (handle, settlement) = OperationHandle::new(
            Arc::clone(&self.type_prefix),
            request_id.clone(),
            argument.clone(),
            controller,
        );

        let lifecycle = Lifecycle {
            operation: self.clone(),
            request_id: request_id.clone(),
            argument,
            gate_signal,
            work_signal,
            sink: context.sink(),
            state: context.state_source(),
            extra: context.extra().clone(),
            settlement,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::trace!(request_id = %request_id, "Spawning lifecycle task");
                runtime.spawn(lifecycle.run());
            },
            Err(error) => {
                tracing::error!(
                    request_id = %request_id,
                    error = %error,
                    "No Tokio runtime available, invocation cannot run"
                );
                lifecycle.settlement.send_replace(Some(lifecycle.unavailable()));
            },
        }

        handle
    }
}

/// Everything the lifecycle task owns
struct Lifecycle<A, T, R, S, X, Ev> {
    operation: AsyncOperation<A, T, R, S, X>,
    request_id: RequestId,
    argument: A,
    gate_signal: CancellationSignal,
    work_signal: CancellationSignal,
    sink: Arc<dyn NotificationSink<Ev>>,
    state: Arc<dyn StateSource<S>>,
    extra: X,
    settlement: SettlementSender<A, T, R>,
}

impl<A, T, R, S, X, Ev> Lifecycle<A, T, R, S, X, Ev>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    S: 'static,
    X: Clone + Send + Sync + 'static,
    Ev: From<LifecycleEvent<A, T, R>> + 'static,
{
    async fn run(self) {
        let started_at = Instant::now();
        let prefix = self.operation.type_prefix().to_string();

        let (terminal, deliver) = self.drive().await;

        if let Some(outcome) = outcome_counter(&terminal) {
            OperationMetrics::record_settled(outcome, &prefix, started_at.elapsed());
        }

        if deliver {
            self.sink.notify(Ev::from(terminal.clone()));
        }

        tracing::debug!(
            request_id = %self.request_id,
            event_type = %terminal.event_type(),
            aborted = terminal.aborted(),
            condition_failed = terminal.condition_failed(),
            delivered = deliver,
            "Invocation settled"
        );
        self.settlement.send_replace(Some(terminal));
    }

    /// Produce the terminal event and whether the host should see it
    async fn drive(&self) -> (LifecycleEvent<A, T, R>, bool) {
        let gate_scope = self.scope(self.gate_signal.clone());

        if let Some(condition) = &self.operation.condition {
            match self.evaluate(condition, &gate_scope).await {
                Ok(true) => {},
                Ok(false) => {
                    let dispatch = self.operation.options.dispatch_condition_rejection;
                    tracing::debug!(
                        request_id = %self.request_id,
                        dispatched = dispatch,
                        "Condition vetoed invocation"
                    );
                    let thrown = Thrown::named(CONDITION_ERROR_NAME, CONDITION_ERROR_MESSAGE);
                    return (self.failed(&thrown, false, true), dispatch);
                },
                Err(thrown) => {
                    tracing::warn!(request_id = %self.request_id, error = %thrown, "Condition panicked");
                    return (self.classify_thrown(thrown, &self.gate_signal), true);
                },
            }
        }

        let meta = match &self.operation.pending_meta {
            Some(pending_meta) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| {
                    pending_meta(&self.argument, &gate_scope)
                })) {
                    Ok(meta) => meta,
                    Err(payload) => {
                        let thrown = Thrown::panic(payload.as_ref());
                        tracing::warn!(request_id = %self.request_id, error = %thrown, "Pending meta panicked");
                        return (self.classify_thrown(thrown, &self.gate_signal), true);
                    },
                }
            },
            None => Metadata::new(),
        };

        OperationMetrics::record_started(self.operation.type_prefix());
        tracing::debug!(request_id = %self.request_id, "Invocation started");
        self.sink.notify(Ev::from(LifecycleEvent::Started {
            type_prefix: Arc::clone(&self.operation.type_prefix),
            request_id: self.request_id.clone(),
            argument: self.argument.clone(),
            meta,
        }));

        let event = match self.run_work().await {
            WorkOutcome::Completed(Completion::Fulfilled { value, meta }) => LifecycleEvent::Succeeded {
                type_prefix: Arc::clone(&self.operation.type_prefix),
                request_id: self.request_id.clone(),
                argument: self.argument.clone(),
                value,
                meta,
            },
            WorkOutcome::Completed(Completion::Rejected(rejection)) => LifecycleEvent::RejectedWithValue {
                type_prefix: Arc::clone(&self.operation.type_prefix),
                request_id: self.request_id.clone(),
                argument: self.argument.clone(),
                value: rejection.value,
                meta: rejection.meta,
            },
            WorkOutcome::Threw(thrown) => self.classify_thrown(thrown, &self.work_signal),
            WorkOutcome::Aborted => self.aborted(&self.work_signal),
        };
        (event, true)
    }

    /// Run the gating predicate, catching panics
    async fn evaluate(
        &self,
        condition: &Condition<A, S, X>,
        scope: &OperationScope<S, X>,
    ) -> Result<bool, Thrown> {
        let outcome = match condition {
            Condition::Sync(predicate) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| predicate(&self.argument, scope)))
            },
            Condition::Async(predicate) => {
                let predicate = Arc::clone(predicate);
                let argument = self.argument.clone();
                let scope = scope.clone();
                AssertUnwindSafe(async move { predicate(argument, scope).await })
                    .catch_unwind()
                    .await
            },
        };
        outcome.map_err(|payload| Thrown::panic(payload.as_ref()))
    }

    /// Spawn the work function and race it against the work signal
    async fn run_work(&self) -> WorkOutcome<T, R> {
        let work = Arc::clone(&self.operation.work);
        let argument = self.argument.clone();
        let api = OperationApi::new(self.scope(self.work_signal.clone()));
        let mut task = tokio::spawn(async move { work(argument, api).await });

        tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(Ok(completion)) => WorkOutcome::Completed(completion),
                Ok(Err(thrown)) => WorkOutcome::Threw(thrown),
                Err(error) => WorkOutcome::Threw(thrown_from_join(error)),
            },
            () = self.work_signal.aborted() => {
                tracing::trace!(
                    request_id = %self.request_id,
                    "Abort observed while work is running, detaching work task"
                );
                WorkOutcome::Aborted
            },
        }
    }

    /// An abort that has been requested wins over whatever the phase threw
    fn classify_thrown(&self, thrown: Thrown, signal: &CancellationSignal) -> LifecycleEvent<A, T, R> {
        if signal.is_aborted() {
            return self.aborted(signal);
        }
        tracing::debug!(request_id = %self.request_id, error = %thrown, "Work function failed");
        self.failed(&thrown, false, false)
    }

    fn aborted(&self, signal: &CancellationSignal) -> LifecycleEvent<A, T, R> {
        let message = signal.reason().unwrap_or_else(|| DEFAULT_ABORT_MESSAGE.to_string());
        self.failed(&Thrown::named(ABORT_ERROR_NAME, message), true, false)
    }

    fn failed(&self, thrown: &Thrown, aborted: bool, condition_failed: bool) -> LifecycleEvent<A, T, R> {
        LifecycleEvent::Failed {
            type_prefix: Arc::clone(&self.operation.type_prefix),
            request_id: self.request_id.clone(),
            argument: self.argument.clone(),
            error: self.operation.serialize_error(thrown),
            aborted,
            condition_failed,
        }
    }

    /// Settlement used when no runtime can drive the invocation
    fn unavailable(&self) -> LifecycleEvent<A, T, R> {
        LifecycleEvent::Failed {
            type_prefix: Arc::clone(&self.operation.type_prefix),
            request_id: self.request_id.clone(),
            argument: self.argument.clone(),
            error: SerializedError::Normalized(NormalizedError::named(
                RUNTIME_UNAVAILABLE_ERROR_NAME,
                RUNTIME_UNAVAILABLE_MESSAGE,
            )),
            aborted: false,
            condition_failed: false,
        }
    }

    fn scope(&self, signal: CancellationSignal) -> OperationScope<S, X> {
        OperationScope::new(
            self.request_id.clone(),
            signal,
            Arc::clone(&self.state),
            self.extra.clone(),
        )
    }
}

fn thrown_from_join(error: JoinError) -> Thrown {
    if error.is_panic() {
        let payload = error.into_panic();
        return Thrown::panic(payload.as_ref());
    }
    Thrown::named("JoinError", error.to_string())
}

const fn outcome_counter<A, T, R>(terminal: &LifecycleEvent<A, T, R>) -> Option<&'static str> {
    match terminal {
        LifecycleEvent::Succeeded { .. } => Some(OPERATION_FULFILLED_TOTAL),
        LifecycleEvent::Failed { aborted: true, .. } => Some(OPERATION_ABORTED_TOTAL),
        LifecycleEvent::Failed {
            condition_failed: true,
            ..
        } => Some(OPERATION_CONDITION_REJECTED_TOTAL),
        LifecycleEvent::RejectedWithValue { .. } | LifecycleEvent::Failed { .. } => {
            Some(OPERATION_REJECTED_TOTAL)
        },
        LifecycleEvent::Started { .. } => None,
    }
}

/// Metadata helper for `pending_meta` and `fulfill_with_meta` callers
///
/// # Example
///
/// ```
/// use composable_ops_runtime::engine::meta;
/// use serde_json::json;
///
/// let fields = meta([("source", json!("cache")), ("attempt", json!(2))]);
/// assert_eq!(fields["attempt"], json!(2));
/// ```
#[must_use]
pub fn meta<K, I>(fields: I) -> Metadata
where
    K: Into<String>,
    I: IntoIterator<Item = (K, serde_json::Value)>,
{
    fields.into_iter().map(|(key, value)| (key.into(), value)).collect()
}
