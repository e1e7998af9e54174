//! # Composable Ops Runtime
//!
//! Lifecycle engine for the Composable Ops architecture.
//!
//! This crate drives invocations of an [`AsyncOperation`]: it gates them,
//! runs the work function on a Tokio task, races it against cancellation and
//! reports each stage to a host as a [`LifecycleEvent`].
//!
//! ## Core Components
//!
//! - **`AsyncOperation`**: type prefix, work function and per-operation policy
//! - **`InvokeContext`**: the host seams an invocation needs (sink, state, extra)
//! - **`OperationHandle`**: abortable, awaitable view of one invocation
//! - **`Dispatcher`**: reference host with a reducer, broadcast and guard rails
//! - **Metrics**: Prometheus counters and histograms for every outcome
//!
//! ## Example
//!
//! ```
//! use composable_ops_core::{LifecycleEvent, Thrown};
//! use composable_ops_runtime::{AsyncOperation, Dispatcher, OperationApi};
//!
//! type Event = LifecycleEvent<String, usize, String>;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = Dispatcher::new(0_usize, |settled: &mut usize, event: &Event| {
//!     if event.is_terminal() {
//!         *settled += 1;
//!     }
//! });
//!
//! let measure = AsyncOperation::<String, usize, String, usize>::new(
//!     "text/measure",
//!     |text: String, api: OperationApi<usize, (), String>| async move {
//!         if text.is_empty() {
//!             return Ok(api.reject_with("empty input".to_string()));
//!         }
//!         if text.len() > 1_000 {
//!             return Err(Thrown::named("RangeError", "too long"));
//!         }
//!         Ok(api.fulfill(text.len()))
//!     },
//! );
//!
//! let handle = measure.invoke("hello".to_string(), &dispatcher.context(()));
//! assert_eq!(handle.unwrap().await, Ok(5));
//! assert_eq!(dispatcher.snapshot(), 1);
//! # }
//! ```

/// Invocation context supplied by the host
pub mod context;

/// Reference host state container
pub mod dispatcher;

/// Invocation state machine
pub mod engine;

/// Development-time auditors
pub mod guard_rails;

/// Caller-side invocation handle
pub mod handle;

/// Prometheus metrics for observability
pub mod metrics;

/// Operation definitions and the APIs handed to user code
pub mod operation;

pub use context::{DiagnosticNotice, FALLBACK_SIGNAL_NOTICE, InvokeContext, fallback_notice_emitted};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use engine::meta;
pub use guard_rails::{
    Auditor, FnAuditor, GuardRails, LifecycleOrderAuditor, ObservedEvent, SerializabilityAuditor,
    Violation,
};
pub use handle::{
    LIFECYCLE_LOST_ERROR_NAME, OperationHandle, RUNTIME_UNAVAILABLE_ERROR_NAME, unwrap_result,
};
pub use operation::{
    AsyncOperation, Condition, OperationApi, OperationOptions, OperationScope, WorkFuture,
};

// Core types used in every signature
pub use composable_ops_core::{
    Completion, LifecycleEvent, Metadata, RejectWithValue, RequestId, SerializedError, Thrown,
    UnwrapError,
};
