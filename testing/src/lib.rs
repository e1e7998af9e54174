//! # Composable Ops Testing
//!
//! Testing utilities and helpers for the Composable Ops lifecycle engine.
//!
//! This crate provides:
//! - Mock host seams (recording sink, fixed state, sequential ids)
//! - A fluent Given-When-Then harness for single invocations
//! - Captured `tracing` output for asserting on diagnostics
//! - Property-based strategies for thrown values
//!
//! ## Example
//!
//! ```
//! use composable_ops_runtime::{AsyncOperation, OperationApi};
//! use composable_ops_testing::{assertions, LifecycleTest};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let double = AsyncOperation::<u32, u32>::new(
//!     "math/double",
//!     |n: u32, api: OperationApi<(), (), ()>| async move { Ok(api.fulfill(n * 2)) },
//! );
//!
//! LifecycleTest::new(double)
//!     .given_state(())
//!     .with_extra(())
//!     .when_invoked(21)
//!     .then_events(|events| {
//!         assertions::assert_event_types(events, &["math/double/pending", "math/double/fulfilled"]);
//!     })
//!     .run()
//!     .await;
//! # }
//! ```

/// Captured `tracing` output
pub mod logs;

/// Fluent harness for single invocations
pub mod lifecycle_test;

pub use lifecycle_test::{LifecycleTest, assertions};
pub use logs::CapturedLogs;
pub use mocks::{CountingSignalFactory, FixedState, RecordingSink, SequentialIdGenerator};

/// Mock host seams for testing.
pub mod mocks {
    use composable_ops_core::{
        CancellationSignal, IdGenerator, NativeSignalFactory, NotificationSink, RequestId,
        SignalFactory, StateSource,
    };
    use composable_ops_runtime::ObservedEvent;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError, RwLock};

    /// Notification sink that keeps every event it receives
    ///
    /// Clones share the same buffer, so one clone can be handed to the
    /// engine while the test inspects another.
    ///
    /// # Example
    ///
    /// ```
    /// use composable_ops_core::NotificationSink;
    /// use composable_ops_testing::mocks::RecordingSink;
    ///
    /// let sink = RecordingSink::new();
    /// sink.notify("first");
    /// sink.notify("second");
    /// assert_eq!(sink.events(), vec!["first", "second"]);
    /// ```
    #[derive(Debug)]
    pub struct RecordingSink<Ev> {
        events: Arc<Mutex<Vec<Ev>>>,
    }

    impl<Ev> RecordingSink<Ev> {
        /// Create an empty sink
        #[must_use]
        pub fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Number of events received so far
        #[must_use]
        pub fn len(&self) -> usize {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// `true` if nothing was received
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Forget every recorded event
        pub fn clear(&self) {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    impl<Ev: Clone> RecordingSink<Ev> {
        /// Snapshot of the recorded events, oldest first
        #[must_use]
        pub fn events(&self) -> Vec<Ev> {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl<Ev: ObservedEvent> RecordingSink<Ev> {
        /// Type strings of the recorded events, oldest first
        #[must_use]
        pub fn event_types(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(ObservedEvent::event_type)
                .collect()
        }
    }

    impl<Ev> Default for RecordingSink<Ev> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<Ev> Clone for RecordingSink<Ev> {
        fn clone(&self) -> Self {
            Self {
                events: Arc::clone(&self.events),
            }
        }
    }

    impl<Ev: Send> NotificationSink<Ev> for RecordingSink<Ev> {
        fn notify(&self, event: Ev) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
    }

    /// State source returning a settable snapshot
    #[derive(Debug)]
    pub struct FixedState<S> {
        state: Arc<RwLock<S>>,
    }

    impl<S> FixedState<S> {
        /// Serve `state` until [`set`](Self::set) replaces it
        #[must_use]
        pub fn new(state: S) -> Self {
            Self {
                state: Arc::new(RwLock::new(state)),
            }
        }

        /// Replace the served snapshot
        pub fn set(&self, state: S) {
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        }
    }

    impl<S> Clone for FixedState<S> {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
            }
        }
    }

    impl<S: Clone + Send + Sync> StateSource<S> for FixedState<S> {
        fn read_state(&self) -> S {
            self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Predictable request ids: `req-1`, `req-2`, ...
    ///
    /// # Example
    ///
    /// ```
    /// use composable_ops_core::IdGenerator;
    /// use composable_ops_testing::mocks::SequentialIdGenerator;
    ///
    /// let ids = SequentialIdGenerator::new();
    /// assert_eq!(ids.generate().as_str(), "req-1");
    /// assert_eq!(ids.generate().as_str(), "req-2");
    /// ```
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Ids prefixed with `req`
        #[must_use]
        pub fn new() -> Self {
            Self::with_prefix("req")
        }

        /// Ids prefixed with `prefix`
        #[must_use]
        pub fn with_prefix(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl Default for SequentialIdGenerator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn generate(&self) -> RequestId {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            RequestId::new(format!("{}-{n}", self.prefix))
        }
    }

    /// Native signal factory that counts the signals it creates
    #[derive(Debug, Clone, Default)]
    pub struct CountingSignalFactory {
        created: Arc<AtomicUsize>,
    }

    impl CountingSignalFactory {
        /// Create a factory with a zero count
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Signals created so far, across clones
        #[must_use]
        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl SignalFactory for CountingSignalFactory {
        fn create(&self) -> CancellationSignal {
            self.created.fetch_add(1, Ordering::SeqCst);
            NativeSignalFactory.create()
        }
    }
}

/// Test helpers and builders
pub mod helpers {
    use super::mocks::{FixedState, RecordingSink};
    use composable_ops_runtime::InvokeContext;
    use std::sync::Arc;

    /// Invoke context over a fixed state whose notifications are recorded
    ///
    /// Returns the context, the sink it notifies and the state it reads.
    #[must_use]
    pub fn recording_context<S, X, Ev>(
        state: S,
        extra: X,
    ) -> (InvokeContext<S, X, Ev>, RecordingSink<Ev>, FixedState<S>)
    where
        S: Clone + Send + Sync + 'static,
        Ev: Send + 'static,
    {
        let sink = RecordingSink::new();
        let source = FixedState::new(state);
        let context = InvokeContext::new(Arc::new(sink.clone()), Arc::new(source.clone()), extra);
        (context, sink, source)
    }
}

/// Property-based testing strategies
pub mod properties {
    use composable_ops_core::Thrown;
    use proptest::prelude::*;
    use serde_json::{Map, Value};
    use thiserror::Error;

    /// Error type thrown by generated work functions
    #[derive(Debug, Clone, Error)]
    #[error("{0}")]
    pub struct SampleError(pub String);

    /// Short printable strings
    pub fn text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 _./-]{0,24}"
    }

    /// `null`, booleans, integers and strings
    pub fn json_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            text().prop_map(Value::String),
        ]
    }

    /// Objects carrying any subset of `name`, `message`, `stack` and `code`
    /// plus an unrelated key
    pub fn error_like_object() -> impl Strategy<Value = Value> {
        (
            proptest::option::of(json_scalar()),
            proptest::option::of(json_scalar()),
            proptest::option::of(json_scalar()),
            proptest::option::of(json_scalar()),
            json_scalar(),
        )
            .prop_map(|(name, message, stack, code, extra)| {
                let mut object = Map::new();
                for (key, value) in [("name", name), ("message", message), ("stack", stack), ("code", code)] {
                    if let Some(value) = value {
                        object.insert(key.to_owned(), value);
                    }
                }
                object.insert("details".to_owned(), extra);
                Value::Object(object)
            })
    }

    /// Anything a work function might fail with
    pub fn thrown() -> impl Strategy<Value = Thrown> {
        prop_oneof![
            json_scalar().prop_map(Thrown::value),
            error_like_object().prop_map(Thrown::value),
            (text(), text()).prop_map(|(name, message)| Thrown::named(name, message)),
            text().prop_map(|message| Thrown::error(SampleError(message))),
        ]
    }

    /// Optional abort reasons
    pub fn abort_reason() -> impl Strategy<Value = Option<String>> {
        proptest::option::of(text())
    }
}
