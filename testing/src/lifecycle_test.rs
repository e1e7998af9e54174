//! Fluent harness for testing a single invocation.
//!
//! Provides a Given-When-Then style API:
//!
//! ```ignore
//! LifecycleTest::new(fetch_user)
//!     .given_state(AppState::default())
//!     .with_extra(api_client)
//!     .when_invoked(7)
//!     .then_events(|events| {
//!         assertions::assert_event_types(events, &["users/fetch/pending", "users/fetch/fulfilled"]);
//!     })
//!     .then_outcome(|outcome| {
//!         assert!(!outcome.aborted());
//!     })
//!     .run()
//!     .await;
//! ```

use crate::mocks::{FixedState, RecordingSink};
use composable_ops_core::LifecycleEvent;
use composable_ops_runtime::{AsyncOperation, InvokeContext};
use std::sync::Arc;

type EventsAssertion<A, T, R> = Box<dyn FnOnce(&[LifecycleEvent<A, T, R>])>;
type OutcomeAssertion<A, T, R> = Box<dyn FnOnce(&LifecycleEvent<A, T, R>)>;

/// Fluent test builder for one invocation of an operation
pub struct LifecycleTest<A, T, R, S, X> {
    operation: AsyncOperation<A, T, R, S, X>,
    state: Option<S>,
    extra: Option<X>,
    argument: Option<A>,
    abort: Option<Option<String>>,
    fallback_signals: bool,
    event_assertions: Vec<EventsAssertion<A, T, R>>,
    outcome_assertions: Vec<OutcomeAssertion<A, T, R>>,
}

impl<A, T, R, S, X> LifecycleTest<A, T, R, S, X>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    X: Clone + Send + Sync + 'static,
{
    /// Create a new test for the given operation
    #[must_use]
    pub fn new(operation: AsyncOperation<A, T, R, S, X>) -> Self {
        Self {
            operation,
            state: None,
            extra: None,
            argument: None,
            abort: None,
            fallback_signals: false,
            event_assertions: Vec::new(),
            outcome_assertions: Vec::new(),
        }
    }

    /// Set the host state read by the condition and the work function
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the injected extra value
    #[must_use]
    pub fn with_extra(mut self, extra: X) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Use fallback signals instead of the native factory
    #[must_use]
    pub const fn with_fallback_signals(mut self) -> Self {
        self.fallback_signals = true;
        self
    }

    /// Set the invocation argument
    #[must_use]
    pub fn when_invoked(mut self, argument: A) -> Self {
        self.argument = Some(argument);
        self
    }

    /// Abort right after invoking, with an optional reason
    #[must_use]
    pub fn when_aborted(mut self, reason: Option<&str>) -> Self {
        self.abort = Some(reason.map(str::to_owned));
        self
    }

    /// Assert on every notification the host received
    #[must_use]
    pub fn then_events<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[LifecycleEvent<A, T, R>]) + 'static,
    {
        self.event_assertions.push(Box::new(assertion));
        self
    }

    /// Assert on the event the handle settled with
    #[must_use]
    pub fn then_outcome<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&LifecycleEvent<A, T, R>) + 'static,
    {
        self.outcome_assertions.push(Box::new(assertion));
        self
    }

    /// Invoke, wait for settlement and run all assertions
    ///
    /// Returns the settled event.
    ///
    /// # Panics
    ///
    /// Panics if the state, extra value or argument was not set, or if any
    /// assertion fails.
    #[allow(clippy::expect_used)] // Test helper
    pub async fn run(self) -> LifecycleEvent<A, T, R> {
        let state = self
            .state
            .expect("State must be set with given_state()");
        let extra = self.extra.expect("Extra must be set with with_extra()");
        let argument = self
            .argument
            .expect("Argument must be set with when_invoked()");

        let sink = RecordingSink::new();
        let mut context: InvokeContext<S, X, LifecycleEvent<A, T, R>> = InvokeContext::new(
            Arc::new(sink.clone()),
            Arc::new(FixedState::new(state)),
            extra,
        );
        if self.fallback_signals {
            context = context.without_signal_factory();
        }

        let handle = self.operation.invoke(argument, &context);
        if let Some(reason) = &self.abort {
            handle.abort(reason.as_deref());
        }
        let outcome = handle.settled().await;

        let events = sink.events();
        for assertion in self.event_assertions {
            assertion(&events);
        }
        for assertion in self.outcome_assertions {
            assertion(&outcome);
        }
        outcome
    }
}

/// Helper assertions for lifecycle notifications
pub mod assertions {
    use composable_ops_core::{LifecycleEvent, RequestStatus};
    use std::fmt::Debug;

    /// Assert the exact sequence of event types
    ///
    /// # Panics
    ///
    /// Panics if the types differ.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_event_types<A, T, R>(events: &[LifecycleEvent<A, T, R>], expected: &[&str]) {
        let actual: Vec<String> = events.iter().map(LifecycleEvent::event_type).collect();
        assert_eq!(actual, expected, "Unexpected lifecycle notifications");
    }

    /// Assert `Started` followed by exactly one terminal event, all for one request
    ///
    /// # Panics
    ///
    /// Panics if the sequence is anything else.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_started_then_terminal<A: Debug, T: Debug, R: Debug>(
        events: &[LifecycleEvent<A, T, R>],
    ) {
        assert_eq!(
            events.len(),
            2,
            "Expected pending and one terminal event, but found {events:?}"
        );
        assert_eq!(events[0].request_status(), RequestStatus::Pending);
        assert!(
            events[1].is_terminal(),
            "Second event is not terminal: {:?}",
            events[1]
        );
        assert_eq!(events[0].request_id(), events[1].request_id());
    }

    /// Assert that nothing was notified
    ///
    /// # Panics
    ///
    /// Panics if any event was notified.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_events<A: Debug, T: Debug, R: Debug>(events: &[LifecycleEvent<A, T, R>]) {
        assert!(events.is_empty(), "Expected no events, but found {events:?}");
    }

    /// Assert an aborted failure carrying `message`
    ///
    /// # Panics
    ///
    /// Panics if the event is not an aborted `Failed` with that message.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_aborted<A: Debug, T: Debug, R: Debug>(
        event: &LifecycleEvent<A, T, R>,
        message: &str,
    ) {
        assert!(event.aborted(), "Expected an aborted failure, found {event:?}");
        let error = event.error();
        assert_eq!(error.and_then(|e| e.name()), Some("AbortError"));
        assert_eq!(error.and_then(|e| e.message()), Some(message));
    }

    /// Assert a failure caused by the gating predicate
    ///
    /// # Panics
    ///
    /// Panics if the event is not a condition failure.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_condition_failed<A: Debug, T: Debug, R: Debug>(
        event: &LifecycleEvent<A, T, R>,
    ) {
        assert!(
            event.condition_failed(),
            "Expected a condition failure, found {event:?}"
        );
        assert!(!event.aborted());
        assert_eq!(event.error().and_then(|e| e.name()), Some("ConditionError"));
    }

    /// Assert a failure with the given error name and message
    ///
    /// # Panics
    ///
    /// Panics if the event is not a `Failed` with that error.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_failed_with<A: Debug, T: Debug, R: Debug>(
        event: &LifecycleEvent<A, T, R>,
        name: &str,
        message: &str,
    ) {
        let Some(error) = event.error() else {
            panic!("Expected a failure, found {event:?}");
        };
        assert_eq!(error.name(), Some(name));
        assert_eq!(error.message(), Some(message));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use composable_ops_core::Thrown;
    use composable_ops_runtime::OperationApi;

    fn halve() -> AsyncOperation<u32, u32, String, u32> {
        AsyncOperation::new(
            "math/halve",
            |n: u32, api: OperationApi<u32, (), String>| async move {
                if n % 2 == 1 {
                    return Ok(api.reject_with(format!("{n} is odd")));
                }
                if n == 0 {
                    return Err(Thrown::named("RangeError", "zero"));
                }
                Ok(api.fulfill(n / 2))
            },
        )
        .with_condition(|n: &u32, scope| *n <= scope.read_state())
    }

    #[tokio::test]
    async fn test_lifecycle_test_fulfilled() {
        let outcome = LifecycleTest::new(halve())
            .given_state(100)
            .with_extra(())
            .when_invoked(8)
            .then_events(|events| {
                assertions::assert_started_then_terminal(events);
                assertions::assert_event_types(events, &["math/halve/pending", "math/halve/fulfilled"]);
            })
            .run()
            .await;

        assert!(matches!(outcome, LifecycleEvent::Succeeded { value: 4, .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_test_rejected_and_failed() {
        LifecycleTest::new(halve())
            .given_state(100)
            .with_extra(())
            .when_invoked(3)
            .then_outcome(|outcome| {
                assert!(outcome.rejected_with_value());
            })
            .run()
            .await;

        LifecycleTest::new(halve())
            .given_state(100)
            .with_extra(())
            .when_invoked(0)
            .then_outcome(|outcome| {
                assertions::assert_failed_with(outcome, "RangeError", "zero");
            })
            .run()
            .await;
    }

    #[tokio::test]
    async fn test_lifecycle_test_condition_veto() {
        LifecycleTest::new(halve())
            .given_state(1)
            .with_extra(())
            .when_invoked(8)
            .then_events(|events| assertions::assert_no_events(events))
            .then_outcome(|outcome| assertions::assert_condition_failed(outcome))
            .run()
            .await;
    }
}
