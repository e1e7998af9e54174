//! Lifecycle events and work-function outcomes.
//!
//! An invocation produces at most three notifications, strictly ordered:
//!
//! ```text
//!   [gating] ──veto──────────────────────────────► Failed { condition_failed }
//!      │
//!      ▼
//!   Started ──► work ──┬── value ──────────────────► Succeeded
//!                      ├── reject_with(value) ─────► RejectedWithValue
//!                      ├── thrown, not aborted ────► Failed
//!                      └── aborted ────────────────► Failed { aborted }
//! ```
//!
//! The work function reports its outcome as a [`Completion`]. A deliberate
//! rejection is a *returned* value tagged by [`RejectWithValue`], never a
//! thrown one, which is how the engine tells structured failures apart from
//! faults.

use crate::error::SerializedError;
use crate::request_id::RequestId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Extra fields attached to an event (pending meta, fulfill/reject meta)
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Coarse status of a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// The work function is running
    Pending,
    /// The work function produced a value
    Fulfilled,
    /// Rejected with a value, failed, aborted or vetoed
    Rejected,
}

impl RequestStatus {
    /// Suffix appended to the type prefix to form the event type
    #[must_use]
    pub const fn as_suffix(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_suffix())
    }
}

/// Notification emitted by the lifecycle engine
///
/// # Type Parameters
///
/// - `A`: the invocation argument
/// - `T`: the success value
/// - `R`: the deliberate-rejection value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent<A, T, R> {
    /// Emitted right before the work function is invoked
    Started {
        /// Operation name
        type_prefix: Arc<str>,
        /// Invocation id
        request_id: RequestId,
        /// Invocation argument
        argument: A,
        /// Fields produced by the operation's pending-meta hook
        meta: Metadata,
    },

    /// The work function returned a value
    Succeeded {
        /// Operation name
        type_prefix: Arc<str>,
        /// Invocation id
        request_id: RequestId,
        /// Invocation argument
        argument: A,
        /// The returned value
        value: T,
        /// Fields attached with `fulfill_with_meta`
        meta: Metadata,
    },

    /// The work function returned `reject_with(value)`
    RejectedWithValue {
        /// Operation name
        type_prefix: Arc<str>,
        /// Invocation id
        request_id: RequestId,
        /// Invocation argument
        argument: A,
        /// The rejection payload, never normalized
        value: R,
        /// Fields attached with `reject_with_meta`
        meta: Metadata,
    },

    /// The work function threw, was aborted, or the condition vetoed it
    Failed {
        /// Operation name
        type_prefix: Arc<str>,
        /// Invocation id
        request_id: RequestId,
        /// Invocation argument
        argument: A,
        /// Normalized or custom-serialized error
        error: SerializedError,
        /// The invocation was aborted through its signal
        aborted: bool,
        /// The gating predicate vetoed execution
        condition_failed: bool,
    },
}

impl<A, T, R> LifecycleEvent<A, T, R> {
    /// Operation name the event belongs to
    #[must_use]
    pub fn type_prefix(&self) -> &str {
        match self {
            Self::Started { type_prefix, .. }
            | Self::Succeeded { type_prefix, .. }
            | Self::RejectedWithValue { type_prefix, .. }
            | Self::Failed { type_prefix, .. } => type_prefix,
        }
    }

    /// Invocation id the event belongs to
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        match self {
            Self::Started { request_id, .. }
            | Self::Succeeded { request_id, .. }
            | Self::RejectedWithValue { request_id, .. }
            | Self::Failed { request_id, .. } => request_id,
        }
    }

    /// Invocation argument
    #[must_use]
    pub const fn argument(&self) -> &A {
        match self {
            Self::Started { argument, .. }
            | Self::Succeeded { argument, .. }
            | Self::RejectedWithValue { argument, .. }
            | Self::Failed { argument, .. } => argument,
        }
    }

    /// Coarse status of this event
    #[must_use]
    pub const fn request_status(&self) -> RequestStatus {
        match self {
            Self::Started { .. } => RequestStatus::Pending,
            Self::Succeeded { .. } => RequestStatus::Fulfilled,
            Self::RejectedWithValue { .. } | Self::Failed { .. } => RequestStatus::Rejected,
        }
    }

    /// Event type string, e.g. `"users/fetch/fulfilled"`
    #[must_use]
    pub fn event_type(&self) -> String {
        format!("{}/{}", self.type_prefix(), self.request_status())
    }

    /// `true` for every event except `Started`
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started { .. })
    }

    /// `true` if the invocation was aborted
    #[must_use]
    pub const fn aborted(&self) -> bool {
        matches!(self, Self::Failed { aborted: true, .. })
    }

    /// `true` if the gating predicate vetoed the invocation
    #[must_use]
    pub const fn condition_failed(&self) -> bool {
        matches!(
            self,
            Self::Failed {
                condition_failed: true,
                ..
            }
        )
    }

    /// `true` for the deliberate-rejection variant
    #[must_use]
    pub const fn rejected_with_value(&self) -> bool {
        matches!(self, Self::RejectedWithValue { .. })
    }

    /// Error payload of a `Failed` event
    #[must_use]
    pub const fn error(&self) -> Option<&SerializedError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Metadata attached to the event (empty for `Failed`)
    #[must_use]
    pub const fn meta(&self) -> Option<&Metadata> {
        match self {
            Self::Started { meta, .. }
            | Self::Succeeded { meta, .. }
            | Self::RejectedWithValue { meta, .. } => Some(meta),
            Self::Failed { .. } => None,
        }
    }
}

/// Sentinel marking a deliberate rejection
///
/// Produced by `reject_with` in the work API. Returning it is not an error
/// path: the engine inspects the tag on the settled value.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectWithValue<R> {
    /// Rejection payload
    pub value: R,
    /// Extra fields for the terminal event
    pub meta: Metadata,
}

impl<R> RejectWithValue<R> {
    /// Tag a value as a deliberate rejection
    pub fn new(value: R) -> Self {
        Self {
            value,
            meta: Metadata::new(),
        }
    }

    /// Attach extra fields for the terminal event
    #[must_use]
    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }
}

/// Settled value of a work function that did not throw
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T, R> {
    /// Normal return
    Fulfilled {
        /// Returned value
        value: T,
        /// Extra fields for the terminal event
        meta: Metadata,
    },

    /// Returned `reject_with(value)`
    Rejected(RejectWithValue<R>),
}

impl<T, R> Completion<T, R> {
    /// Plain success
    pub fn fulfilled(value: T) -> Self {
        Self::Fulfilled {
            value,
            meta: Metadata::new(),
        }
    }

    /// Success with extra fields
    pub const fn fulfilled_with_meta(value: T, meta: Metadata) -> Self {
        Self::Fulfilled { value, meta }
    }

    /// `true` if this is the rejection sentinel
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl<T, R> From<RejectWithValue<R>> for Completion<T, R> {
    fn from(rejection: RejectWithValue<R>) -> Self {
        Self::Rejected(rejection)
    }
}
