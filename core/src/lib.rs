//! # Composable Ops Core
//!
//! Core types for the Composable Ops lifecycle engine.
//!
//! This crate defines the data model shared by the runtime, the host state
//! container and tests. It contains no scheduling logic.
//!
//! ## Core Concepts
//!
//! - **Operation**: one named unit of asynchronous work (`"users/fetch"`)
//! - **Invocation**: one call of an operation with an argument and a [`RequestId`]
//! - **Lifecycle event**: `Started`, then exactly one of `Succeeded`,
//!   `RejectedWithValue` or `Failed`
//! - **Thrown value**: anything a work function fails with, projected onto a
//!   [`NormalizedError`] before it leaves the engine
//! - **Signal**: cooperative, one-way cancellation shared between the engine
//!   and the work function
//!
//! ## Architecture Principles
//!
//! - Exactly one terminal notification per invocation
//! - Deliberate rejections are returned, not thrown
//! - Errors cross the boundary only as small serializable records
//! - Cancellation is advisory for running code and authoritative for the outcome
//!
//! ## Example
//!
//! ```
//! use composable_ops_core::error::{mini_serialize_error, Thrown};
//! use composable_ops_core::signal::CancellationSignal;
//!
//! let signal = CancellationSignal::native();
//! signal.abort(Some("AbortReason".into()));
//! assert!(signal.is_aborted());
//!
//! let error = mini_serialize_error(&Thrown::named("AbortError", "AbortReason"));
//! assert_eq!(error.message.as_deref(), Some("AbortReason"));
//! ```

// Re-export commonly used types
pub use serde::{Deserialize, Serialize};

/// Thrown values, error normalization and the unwrap error
pub mod error;

/// Lifecycle events and work outcomes
pub mod event;

/// Host seams: notification sink and state source
pub mod host;

/// Request ids and generators
pub mod request_id;

/// Cooperative cancellation signals
pub mod signal;

pub use error::{
    ErrorNormalizer, NormalizedError, SerializedError, Thrown, UnwrapError, mini_serialize_error,
};
pub use event::{Completion, LifecycleEvent, Metadata, RejectWithValue, RequestStatus};
pub use host::{NotificationSink, StateSource};
pub use request_id::{IdGenerator, NanoIdGenerator, RequestId};
pub use signal::{AbortController, CancellationSignal, NativeSignalFactory, SignalBackend, SignalFactory};
