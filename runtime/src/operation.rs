//! Operation definitions.
//!
//! An [`AsyncOperation`] bundles a type prefix, a work function and the
//! per-operation policy (gating predicate, error serializer, pending meta, id
//! generator). It is cheap to clone and can be invoked any number of times
//! through [`AsyncOperation::invoke`].
//!
//! # Example
//!
//! ```
//! use composable_ops_runtime::{AsyncOperation, OperationApi};
//!
//! let fetch_user = AsyncOperation::<u32, String, String>::new(
//!     "users/fetch",
//!     |id: u32, api: OperationApi<(), (), String>| async move {
//!         if id == 0 {
//!             return Ok(api.reject_with("no such user".to_string()));
//!         }
//!         Ok(api.fulfill(format!("user-{id}")))
//!     },
//! )
//! .with_condition(|id: &u32, _scope| *id < 1_000);
//!
//! assert_eq!(fetch_user.type_prefix(), "users/fetch");
//! assert_eq!(fetch_user.fulfilled_type(), "users/fetch/fulfilled");
//! ```

use composable_ops_core::error::{ErrorNormalizer, NormalizedError, SerializedError, Thrown};
use composable_ops_core::event::{Completion, Metadata, RejectWithValue, RequestStatus};
use composable_ops_core::host::StateSource;
use composable_ops_core::request_id::{IdGenerator, NanoIdGenerator, RequestId};
use composable_ops_core::signal::CancellationSignal;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Boxed future produced by a work function
pub type WorkFuture<T, R> = BoxFuture<'static, Result<Completion<T, R>, Thrown>>;

pub(crate) type WorkFn<A, T, R, S, X> =
    Arc<dyn Fn(A, OperationApi<S, X, R>) -> WorkFuture<T, R> + Send + Sync>;

pub(crate) type ErrorSerializer = Arc<dyn Fn(&Thrown) -> Value + Send + Sync>;

pub(crate) type PendingMetaFn<A, S, X> =
    Arc<dyn Fn(&A, &OperationScope<S, X>) -> Metadata + Send + Sync>;

/// Gating predicate consulted before the work function runs
///
/// Returning `false` vetoes the invocation.
pub enum Condition<A, S, X> {
    /// Evaluated inline on the lifecycle task
    Sync(Arc<dyn Fn(&A, &OperationScope<S, X>) -> bool + Send + Sync>),
    /// Awaited on the lifecycle task
    Async(Arc<dyn Fn(A, OperationScope<S, X>) -> BoxFuture<'static, bool> + Send + Sync>),
}

impl<A, S, X> Clone for Condition<A, S, X> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<A, S, X> fmt::Debug for Condition<A, S, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Condition::Sync"),
            Self::Async(_) => f.write_str("Condition::Async"),
        }
    }
}

/// Per-operation policy
///
/// # Example
///
/// ```
/// use composable_ops_runtime::OperationOptions;
///
/// let options = OperationOptions::default()
///     .with_dispatch_condition_rejection(true)
///     .with_strip_stack_traces(true);
///
/// assert!(options.dispatch_condition_rejection);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOptions {
    /// Notify the host when the gating predicate vetoes an invocation
    pub dispatch_condition_rejection: bool,
    /// Drop `stack` from normalized errors
    pub strip_stack_traces: bool,
}

impl OperationOptions {
    /// Create options with explicit values
    #[must_use]
    pub const fn new(dispatch_condition_rejection: bool, strip_stack_traces: bool) -> Self {
        Self {
            dispatch_condition_rejection,
            strip_stack_traces,
        }
    }

    /// Set whether vetoed invocations are notified
    #[must_use]
    pub const fn with_dispatch_condition_rejection(mut self, dispatch: bool) -> Self {
        self.dispatch_condition_rejection = dispatch;
        self
    }

    /// Set whether stack traces are stripped from normalized errors
    #[must_use]
    pub const fn with_strip_stack_traces(mut self, strip: bool) -> Self {
        self.strip_stack_traces = strip;
        self
    }
}

impl Default for OperationOptions {
    /// Defaults:
    /// - `dispatch_condition_rejection`: false (vetoes are silent)
    /// - `strip_stack_traces`: false
    fn default() -> Self {
        Self::new(false, false)
    }
}

/// What the gating predicate, `pending_meta` and the work function can see
pub struct OperationScope<S, X> {
    request_id: RequestId,
    signal: CancellationSignal,
    state: Arc<dyn StateSource<S>>,
    extra: X,
}

impl<S, X> OperationScope<S, X> {
    pub(crate) fn new(
        request_id: RequestId,
        signal: CancellationSignal,
        state: Arc<dyn StateSource<S>>,
        extra: X,
    ) -> Self {
        Self {
            request_id,
            signal,
            state,
            extra,
        }
    }

    /// Id of the invocation
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Cancellation signal for the current phase
    #[must_use]
    pub const fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    /// Snapshot of the host state
    #[must_use]
    pub fn read_state(&self) -> S {
        self.state.read_state()
    }

    /// Caller-supplied extra value
    #[must_use]
    pub const fn extra(&self) -> &X {
        &self.extra
    }
}

impl<S, X: Clone> Clone for OperationScope<S, X> {
    fn clone(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            signal: self.signal.clone(),
            state: Arc::clone(&self.state),
            extra: self.extra.clone(),
        }
    }
}

impl<S, X: fmt::Debug> fmt::Debug for OperationScope<S, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationScope")
            .field("request_id", &self.request_id)
            .field("signal", &self.signal)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

/// Handed to the work function
///
/// Besides the [`OperationScope`] accessors it builds the completion values:
/// [`reject_with`](Self::reject_with) produces the deliberate-rejection
/// marker, [`fulfill`](Self::fulfill) a plain success.
pub struct OperationApi<S, X, R> {
    scope: OperationScope<S, X>,
    _rejection: PhantomData<fn() -> R>,
}

impl<S, X, R> OperationApi<S, X, R> {
    pub(crate) const fn new(scope: OperationScope<S, X>) -> Self {
        Self {
            scope,
            _rejection: PhantomData,
        }
    }

    /// Id of the invocation
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        self.scope.request_id()
    }

    /// Cancellation signal for the work phase
    #[must_use]
    pub const fn signal(&self) -> &CancellationSignal {
        self.scope.signal()
    }

    /// Snapshot of the host state
    #[must_use]
    pub fn read_state(&self) -> S {
        self.scope.read_state()
    }

    /// Caller-supplied extra value
    #[must_use]
    pub const fn extra(&self) -> &X {
        self.scope.extra()
    }

    /// The scope this api wraps
    #[must_use]
    pub const fn scope(&self) -> &OperationScope<S, X> {
        &self.scope
    }

    /// Deliberate rejection carrying `value` verbatim
    #[must_use]
    pub fn reject_with<T>(&self, value: R) -> Completion<T, R> {
        Completion::Rejected(RejectWithValue::new(value))
    }

    /// Deliberate rejection with meta fields for the terminal event
    #[must_use]
    pub fn reject_with_meta<T>(&self, value: R, meta: Metadata) -> Completion<T, R> {
        Completion::Rejected(RejectWithValue::new(value).with_meta(meta))
    }

    /// Plain success
    #[must_use]
    pub fn fulfill<T>(&self, value: T) -> Completion<T, R> {
        Completion::fulfilled(value)
    }

    /// Success with meta fields for the terminal event
    #[must_use]
    pub const fn fulfill_with_meta<T>(&self, value: T, meta: Metadata) -> Completion<T, R> {
        Completion::fulfilled_with_meta(value, meta)
    }
}

impl<S, X: Clone, R> Clone for OperationApi<S, X, R> {
    fn clone(&self) -> Self {
        Self::new(self.scope.clone())
    }
}

impl<S, X: fmt::Debug, R> fmt::Debug for OperationApi<S, X, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationApi")
            .field("scope", &self.scope)
            .finish()
    }
}

/// A named asynchronous operation
///
/// # Type Parameters
///
/// - `A`: Argument type
/// - `T`: Success value type
/// - `R`: Deliberate rejection value type
/// - `S`: Host state type seen through [`OperationScope::read_state`]
/// - `X`: Extra value type supplied by the invoke context
pub struct AsyncOperation<A, T, R = (), S = (), X = ()> {
    pub(crate) type_prefix: Arc<str>,
    pub(crate) work: WorkFn<A, T, R, S, X>,
    pub(crate) condition: Option<Condition<A, S, X>>,
    pub(crate) serialize_error: Option<ErrorSerializer>,
    pub(crate) pending_meta: Option<PendingMetaFn<A, S, X>>,
    pub(crate) id_generator: Arc<dyn IdGenerator>,
    pub(crate) options: OperationOptions,
}

impl<A, T, R, S, X> AsyncOperation<A, T, R, S, X>
where
    A: 'static,
    T: 'static,
    R: 'static,
    S: 'static,
    X: 'static,
{
    /// Define an operation from a type prefix and a work function
    ///
    /// The work function resolves to `Ok(Completion)` for success or a
    /// deliberate rejection, and to `Err(Thrown)` for anything that went
    /// wrong. Panics inside the work function are caught and reported as
    /// failures.
    #[must_use]
    pub fn new<F, Fut>(type_prefix: impl Into<Arc<str>>, work: F) -> Self
    where
        F: Fn(A, OperationApi<S, X, R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Completion<T, R>, Thrown>> + Send + 'static,
    {
        Self {
            type_prefix: type_prefix.into(),
            work: Arc::new(move |argument, api| work(argument, api).boxed()),
            condition: None,
            serialize_error: None,
            pending_meta: None,
            id_generator: Arc::new(NanoIdGenerator::new()),
            options: OperationOptions::default(),
        }
    }

    /// Gate invocations with a synchronous predicate
    #[must_use]
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&A, &OperationScope<S, X>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Condition::Sync(Arc::new(condition)));
        self
    }

    /// Gate invocations with an asynchronous predicate
    #[must_use]
    pub fn with_async_condition<F, Fut>(mut self, condition: F) -> Self
    where
        F: Fn(A, OperationScope<S, X>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.condition = Some(Condition::Async(Arc::new(move |argument, scope| {
            condition(argument, scope).boxed()
        })));
        self
    }

    /// Replace error normalization with a custom serializer
    ///
    /// The returned value is used verbatim, including for the fixed abort and
    /// condition errors.
    #[must_use]
    pub fn with_serialize_error<F>(mut self, serializer: F) -> Self
    where
        F: Fn(&Thrown) -> Value + Send + Sync + 'static,
    {
        self.serialize_error = Some(Arc::new(serializer));
        self
    }

    /// Extra meta fields for the `Started` event
    #[must_use]
    pub fn with_pending_meta<F>(mut self, pending_meta: F) -> Self
    where
        F: Fn(&A, &OperationScope<S, X>) -> Metadata + Send + Sync + 'static,
    {
        self.pending_meta = Some(Arc::new(pending_meta));
        self
    }

    /// Replace the request id generator
    #[must_use]
    pub fn with_id_generator(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Arc::new(generator);
        self
    }

    /// Replace the per-operation policy
    #[must_use]
    pub const fn with_options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }

    /// Notify the host when the gating predicate vetoes an invocation
    #[must_use]
    pub const fn with_dispatch_condition_rejection(mut self, dispatch: bool) -> Self {
        self.options = self.options.with_dispatch_condition_rejection(dispatch);
        self
    }

    /// Drop `stack` from normalized errors
    #[must_use]
    pub const fn with_strip_stack_traces(mut self, strip: bool) -> Self {
        self.options = self.options.with_strip_stack_traces(strip);
        self
    }
}

impl<A, T, R, S, X> AsyncOperation<A, T, R, S, X> {
    /// The operation's type prefix
    #[must_use]
    pub fn type_prefix(&self) -> &str {
        &self.type_prefix
    }

    /// `"<prefix>/pending"`
    #[must_use]
    pub fn pending_type(&self) -> String {
        self.event_type(RequestStatus::Pending)
    }

    /// `"<prefix>/fulfilled"`
    #[must_use]
    pub fn fulfilled_type(&self) -> String {
        self.event_type(RequestStatus::Fulfilled)
    }

    /// `"<prefix>/rejected"`
    #[must_use]
    pub fn rejected_type(&self) -> String {
        self.event_type(RequestStatus::Rejected)
    }

    fn event_type(&self, status: RequestStatus) -> String {
        format!("{}/{}", self.type_prefix, status.as_suffix())
    }

    /// Current per-operation policy
    #[must_use]
    pub const fn options(&self) -> OperationOptions {
        self.options
    }

    /// Turn a thrown value into the error carried by a `Failed` event
    ///
    /// A panicking custom serializer falls back to the built-in normalizer.
    pub(crate) fn serialize_error(&self, thrown: &Thrown) -> SerializedError {
        let Some(serializer) = &self.serialize_error else {
            return SerializedError::Normalized(self.normalize(thrown));
        };
        match panic::catch_unwind(AssertUnwindSafe(|| serializer(thrown))) {
            Ok(value) => SerializedError::Custom(value),
            Err(payload) => {
                tracing::warn!(
                    type_prefix = %self.type_prefix,
                    panic = %Thrown::panic(payload.as_ref()),
                    "Custom error serializer panicked, using the built-in normalizer"
                );
                SerializedError::Normalized(self.normalize(thrown))
            },
        }
    }

    fn normalize(&self, thrown: &Thrown) -> NormalizedError {
        ErrorNormalizer::new()
            .with_strip_stack(self.options.strip_stack_traces)
            .normalize(thrown)
    }
}

impl<A, T, R, S, X> Clone for AsyncOperation<A, T, R, S, X> {
    fn clone(&self) -> Self {
        Self {
            type_prefix: Arc::clone(&self.type_prefix),
            work: Arc::clone(&self.work),
            condition: self.condition.clone(),
            serialize_error: self.serialize_error.clone(),
            pending_meta: self.pending_meta.clone(),
            id_generator: Arc::clone(&self.id_generator),
            options: self.options,
        }
    }
}

impl<A, T, R, S, X> fmt::Debug for AsyncOperation<A, T, R, S, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("type_prefix", &self.type_prefix)
            .field("condition", &self.condition)
            .field("custom_serializer", &self.serialize_error.is_some())
            .field("pending_meta", &self.pending_meta.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> AsyncOperation<u32, u32, String> {
        AsyncOperation::new("test/echo", |n: u32, api: OperationApi<(), (), String>| async move {
            Ok(api.fulfill(n))
        })
    }

    #[test]
    fn derives_event_types_from_prefix() {
        let operation = echo();

        assert_eq!(operation.type_prefix(), "test/echo");
        assert_eq!(operation.pending_type(), "test/echo/pending");
        assert_eq!(operation.fulfilled_type(), "test/echo/fulfilled");
        assert_eq!(operation.rejected_type(), "test/echo/rejected");
    }

    #[test]
    fn options_default_to_silent_vetoes_and_full_stacks() {
        let options = OperationOptions::default();
        assert!(!options.dispatch_condition_rejection);
        assert!(!options.strip_stack_traces);

        let operation = echo()
            .with_dispatch_condition_rejection(true)
            .with_strip_stack_traces(true);
        assert_eq!(operation.options(), OperationOptions::new(true, true));
    }

    #[test]
    fn default_serializer_normalizes() {
        let operation = echo();
        let error = operation.serialize_error(&Thrown::named("TypeError", "bad input"));

        let normalized = error.as_normalized().unwrap();
        assert_eq!(normalized.name.as_deref(), Some("TypeError"));
        assert_eq!(normalized.message.as_deref(), Some("bad input"));
    }

    #[test]
    fn strip_policy_reaches_the_normalizer() {
        let operation = echo().with_strip_stack_traces(true);
        let thrown = Thrown::value(json!({ "message": "boom", "stack": "at line 1" }));

        let error = operation.serialize_error(&thrown);

        assert_eq!(error.as_normalized().unwrap().stack, None);
    }

    #[test]
    fn custom_serializer_is_used_verbatim() {
        let operation = echo().with_serialize_error(|_| json!("custom"));

        let error = operation.serialize_error(&Thrown::named("Error", "ignored"));

        assert_eq!(error.as_custom(), Some(&json!("custom")));
    }

    #[test]
    fn panicking_serializer_falls_back_to_normalizer() {
        let operation = echo()
            .with_strip_stack_traces(true)
            .with_serialize_error(|thrown: &Thrown| {
                assert!(thrown.as_value().is_none(), "serializer rejects data");
                json!("custom")
            });

        let thrown = Thrown::value(json!({ "message": "boom", "stack": "at line 1" }));

        let error = operation.serialize_error(&thrown);

        let normalized = error.as_normalized().unwrap();
        assert_eq!(normalized.message.as_deref(), Some("boom"));
        assert_eq!(normalized.stack, None);
    }

    #[test]
    fn api_builds_completions() {
        let state: Arc<dyn StateSource<u8>> = Arc::new(|| 7_u8);
        let scope = OperationScope::new(
            RequestId::new("id-1"),
            CancellationSignal::native(),
            state,
            "extra",
        );
        let api: OperationApi<u8, &str, String> = OperationApi::new(scope);

        assert_eq!(api.request_id().as_str(), "id-1");
        assert_eq!(api.read_state(), 7);
        assert_eq!(*api.extra(), "extra");

        let rejected: Completion<u32, String> = api.reject_with("nope".to_string());
        assert!(rejected.is_rejection());

        let mut meta = Metadata::new();
        meta.insert("source".into(), json!("cache"));
        match api.fulfill_with_meta(1_u32, meta.clone()) {
            Completion::Fulfilled { value, meta: carried } => {
                assert_eq!(value, 1);
                assert_eq!(carried, meta);
            },
            Completion::Rejected(_) => unreachable!("expected fulfilled"),
        }
    }
}
