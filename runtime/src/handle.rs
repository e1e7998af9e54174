//! Caller-side view of one invocation.

use composable_ops_core::error::{NormalizedError, SerializedError, UnwrapError};
use composable_ops_core::event::LifecycleEvent;
use composable_ops_core::request_id::RequestId;
use composable_ops_core::signal::AbortController;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::watch;

/// Error name used when an invocation could not be driven to completion
pub const RUNTIME_UNAVAILABLE_ERROR_NAME: &str = "RuntimeUnavailable";

/// Error message used when an invocation could not be driven to completion
pub const RUNTIME_UNAVAILABLE_MESSAGE: &str =
    "No Tokio runtime was available to drive the operation to completion.";

/// Error name used when the lifecycle task ended without settling
pub const LIFECYCLE_LOST_ERROR_NAME: &str = "LifecycleLost";

/// Error message used when the lifecycle task ended without settling
pub const LIFECYCLE_LOST_MESSAGE: &str =
    "The lifecycle task ended before the invocation settled.";

/// Error name reported by [`unwrap_result`] for a non-terminal event
pub const NOT_SETTLED_ERROR_NAME: &str = "NotSettled";

pub(crate) type SettlementSender<A, T, R> = watch::Sender<Option<LifecycleEvent<A, T, R>>>;

/// Handle returned by [`AsyncOperation::invoke`](crate::AsyncOperation::invoke)
///
/// The handle exists before any asynchronous step runs, so [`abort`](Self::abort)
/// is usable immediately. It settles exactly once, with the terminal
/// [`LifecycleEvent`] of the invocation, and is immutable afterwards. Clones
/// observe the same settlement.
///
/// # Example
///
/// ```ignore
/// let handle = fetch_user.invoke(7, &context);
/// handle.abort(Some("navigated away"));
///
/// match handle.unwrap().await {
///     Ok(user) => render(user),
///     Err(err) if err.is_aborted() => {},
///     Err(err) => report(err),
/// }
/// ```
pub struct OperationHandle<A, T, R> {
    type_prefix: Arc<str>,
    request_id: RequestId,
    argument: A,
    controller: AbortController,
    settlement: watch::Receiver<Option<LifecycleEvent<A, T, R>>>,
}

impl<A, T, R> OperationHandle<A, T, R> {
    pub(crate) fn new(
        type_prefix: Arc<str>,
        request_id: RequestId,
        argument: A,
        controller: AbortController,
    ) -> (Self, SettlementSender<A, T, R>) {
        let (sender, settlement) = watch::channel(None);
        let handle = Self {
            type_prefix,
            request_id,
            argument,
            controller,
            settlement,
        };
        (handle, sender)
    }

    /// Id of the invocation
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Argument the operation was invoked with
    #[must_use]
    pub const fn argument(&self) -> &A {
        &self.argument
    }

    /// Type prefix of the invoked operation
    #[must_use]
    pub fn type_prefix(&self) -> &str {
        &self.type_prefix
    }

    /// Request cancellation
    ///
    /// Idempotent: only the first call records its reason. Aborting a handle
    /// that has already settled has no effect.
    pub fn abort(&self, reason: Option<&str>) {
        if self.is_settled() {
            tracing::trace!(request_id = %self.request_id, "Abort ignored, invocation already settled");
            return;
        }
        if self.controller.abort(reason.map(str::to_owned)) {
            tracing::debug!(
                request_id = %self.request_id,
                type_prefix = %self.type_prefix,
                reason = reason.unwrap_or_default(),
                "Abort requested"
            );
        }
    }

    /// `true` once the terminal event is available
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settlement.borrow().is_some()
    }
}

impl<A: Clone, T: Clone, R: Clone> OperationHandle<A, T, R> {
    /// Terminal event, if the invocation has settled
    #[must_use]
    pub fn try_outcome(&self) -> Option<LifecycleEvent<A, T, R>> {
        self.settlement.borrow().clone()
    }

    /// Wait for the terminal event
    ///
    /// Can be awaited any number of times, from any clone. If the lifecycle
    /// task disappears without settling (a panicking host sink, or the
    /// runtime shut down), a `Failed` event named `LifecycleLost` is returned.
    pub async fn settled(&self) -> LifecycleEvent<A, T, R> {
        let mut receiver = self.settlement.clone();
        let settled = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|event| event.clone());

        settled.unwrap_or_else(|| self.lost())
    }

    /// Wait for the terminal event and extract its payload
    ///
    /// # Errors
    ///
    /// - [`UnwrapError::Rejected`] with the value passed to `reject_with`
    /// - [`UnwrapError::Failed`] with the serialized error for thrown,
    ///   aborted and condition-vetoed invocations
    pub async fn unwrap(&self) -> Result<T, UnwrapError<R>> {
        unwrap_result(self.settled().await)
    }

    fn lost(&self) -> LifecycleEvent<A, T, R> {
        tracing::warn!(request_id = %self.request_id, "Lifecycle task ended without settling");
        LifecycleEvent::Failed {
            type_prefix: Arc::clone(&self.type_prefix),
            request_id: self.request_id.clone(),
            argument: self.argument.clone(),
            error: SerializedError::Normalized(NormalizedError::named(
                LIFECYCLE_LOST_ERROR_NAME,
                LIFECYCLE_LOST_MESSAGE,
            )),
            aborted: false,
            condition_failed: false,
        }
    }
}

/// Extract the payload of a terminal event
///
/// # Errors
///
/// Returns [`UnwrapError::Rejected`] for `RejectedWithValue`,
/// [`UnwrapError::Failed`] for `Failed`, and an [`UnwrapError::Failed`] named
/// `NotSettled` when given a `Started` event.
pub fn unwrap_result<A, T, R>(event: LifecycleEvent<A, T, R>) -> Result<T, UnwrapError<R>> {
    match event {
        LifecycleEvent::Succeeded { value, .. } => Ok(value),
        LifecycleEvent::RejectedWithValue { value, .. } => Err(UnwrapError::Rejected(value)),
        LifecycleEvent::Failed { error, .. } => Err(UnwrapError::Failed(error)),
        LifecycleEvent::Started { request_id, .. } => Err(UnwrapError::Failed(
            SerializedError::Normalized(NormalizedError::named(
                NOT_SETTLED_ERROR_NAME,
                format!("invocation {request_id} has not settled"),
            )),
        )),
    }
}

impl<A: Clone, T, R> Clone for OperationHandle<A, T, R> {
    fn clone(&self) -> Self {
        Self {
            type_prefix: Arc::clone(&self.type_prefix),
            request_id: self.request_id.clone(),
            argument: self.argument.clone(),
            controller: self.controller.clone(),
            settlement: self.settlement.clone(),
        }
    }
}

impl<A: fmt::Debug, T, R> fmt::Debug for OperationHandle<A, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("type_prefix", &self.type_prefix)
            .field("request_id", &self.request_id)
            .field("argument", &self.argument)
            .field("aborted", &self.controller.is_aborted())
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<A, T, R> IntoFuture for OperationHandle<A, T, R>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    type Output = LifecycleEvent<A, T, R>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.settled().await }.boxed()
    }
}
