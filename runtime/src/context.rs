//! Invocation context supplied by the host.
//!
//! An [`InvokeContext`] carries everything an invocation needs from outside
//! the operation: the notification sink, the state source, the caller's extra
//! value and the factory for cancellation signals.

use composable_ops_core::host::{NotificationSink, StateSource};
use composable_ops_core::signal::{CancellationSignal, NativeSignalFactory, SignalFactory};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Text of the one-time notice logged when the fallback signal is used
pub const FALLBACK_SIGNAL_NOTICE: &str = "No native cancellation primitive is available; \
     using the built-in fallback signal. Cancellation still works, but supply a \
     SignalFactory on the invoke context to use the native backend.";

static FALLBACK_NOTICE: DiagnosticNotice = DiagnosticNotice::new(FALLBACK_SIGNAL_NOTICE);

/// A diagnostic message logged at most once
#[derive(Debug)]
pub struct DiagnosticNotice {
    message: &'static str,
    emitted: AtomicBool,
}

impl DiagnosticNotice {
    /// Create a notice that has not fired yet
    #[must_use]
    pub const fn new(message: &'static str) -> Self {
        Self {
            message,
            emitted: AtomicBool::new(false),
        }
    }

    /// Log the notice unless it already fired
    ///
    /// Returns `true` on the call that actually logged.
    pub fn emit(&self) -> bool {
        if self.emitted.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!("{}", self.message);
        true
    }

    /// `true` once the notice has fired
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.emitted.load(Ordering::Acquire)
    }

    /// Notice text
    #[must_use]
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

/// `true` once the process-wide fallback notice has been logged
#[must_use]
pub fn fallback_notice_emitted() -> bool {
    FALLBACK_NOTICE.has_fired()
}

/// Everything an invocation borrows from its host
///
/// # Type Parameters
///
/// - `S`: Host state type
/// - `X`: Extra value handed to predicates and work functions
/// - `Ev`: Host event type; lifecycle events are converted with `Ev::from`
///
/// # Example
///
/// ```
/// use composable_ops_runtime::InvokeContext;
/// use std::sync::Arc;
///
/// let context: InvokeContext<u32, (), String> =
///     InvokeContext::new(Arc::new(|event: String| println!("{event}")), Arc::new(|| 1_u32), ());
///
/// // Without a factory, invocations fall back to the built-in signal.
/// let context = context.without_signal_factory();
/// assert!(!context.has_signal_factory());
/// ```
pub struct InvokeContext<S, X, Ev> {
    sink: Arc<dyn NotificationSink<Ev>>,
    state: Arc<dyn StateSource<S>>,
    extra: X,
    signal_factory: Option<Arc<dyn SignalFactory>>,
}

impl<S, X, Ev> InvokeContext<S, X, Ev> {
    /// Create a context backed by the native signal factory
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink<Ev>>, state: Arc<dyn StateSource<S>>, extra: X) -> Self {
        Self {
            sink,
            state,
            extra,
            signal_factory: Some(Arc::new(NativeSignalFactory)),
        }
    }

    /// Use a specific signal factory
    #[must_use]
    pub fn with_signal_factory(mut self, factory: Arc<dyn SignalFactory>) -> Self {
        self.signal_factory = Some(factory);
        self
    }

    /// Run without a native primitive, forcing the fallback signal
    #[must_use]
    pub fn without_signal_factory(mut self) -> Self {
        self.signal_factory = None;
        self
    }

    /// Replace the extra value
    #[must_use]
    pub fn with_extra<Y>(self, extra: Y) -> InvokeContext<S, Y, Ev> {
        InvokeContext {
            sink: self.sink,
            state: self.state,
            extra,
            signal_factory: self.signal_factory,
        }
    }

    /// `true` when a signal factory is configured
    #[must_use]
    pub const fn has_signal_factory(&self) -> bool {
        self.signal_factory.is_some()
    }

    /// Deliver an event to the host
    pub fn notify(&self, event: Ev) {
        self.sink.notify(event);
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

    pub(crate) fn sink(&self) -> Arc<dyn NotificationSink<Ev>> {
        Arc::clone(&self.sink)
    }

    pub(crate) fn state_source(&self) -> Arc<dyn StateSource<S>> {
        Arc::clone(&self.state)
    }

    /// Create a signal, substituting the fallback when no factory is set
    pub(crate) fn create_signal(&self) -> CancellationSignal {
        self.create_signal_with(&FALLBACK_NOTICE)
    }

    fn create_signal_with(&self, notice: &DiagnosticNotice) -> CancellationSignal {
        match &self.signal_factory {
            Some(factory) => factory.create(),
            None => {
                notice.emit();
                CancellationSignal::fallback()
            },
        }
    }
}

impl<S, X: Clone, Ev> Clone for InvokeContext<S, X, Ev> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            state: Arc::clone(&self.state),
            extra: self.extra.clone(),
            signal_factory: self.signal_factory.clone(),
        }
    }
}

impl<S, X: fmt::Debug, Ev> fmt::Debug for InvokeContext<S, X, Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeContext")
            .field("extra", &self.extra)
            .field("signal_factory", &self.signal_factory.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use composable_ops_core::signal::SignalBackend;
    use std::sync::Mutex;

    fn context() -> InvokeContext<u32, &'static str, u32> {
        let sink: Arc<dyn NotificationSink<u32>> = Arc::new(|_event: u32| {});
        let state: Arc<dyn StateSource<u32>> = Arc::new(|| 42_u32);
        InvokeContext::new(sink, state, "extra")
    }

    #[test]
    fn notice_fires_once() {
        let notice = DiagnosticNotice::new("only once");

        assert!(notice.emit());
        assert!(!notice.emit());
        assert!(notice.has_fired());
        assert_eq!(notice.message(), "only once");
    }

    #[test]
    fn native_factory_by_default() {
        let notice = DiagnosticNotice::new("unused");
        let signal = context().create_signal_with(&notice);

        assert_eq!(signal.backend(), SignalBackend::Native);
        assert!(!notice.has_fired());
    }

    #[test]
    fn missing_factory_falls_back_and_notices() {
        let notice = DiagnosticNotice::new("fallback");
        let context = context().without_signal_factory();

        let first = context.create_signal_with(&notice);
        let second = context.create_signal_with(&notice);

        assert_eq!(first.backend(), SignalBackend::Fallback);
        assert_eq!(second.backend(), SignalBackend::Fallback);
        assert!(notice.has_fired());
    }

    #[test]
    fn exposes_host_seams() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let sink: Arc<dyn NotificationSink<u32>> =
            Arc::new(move |event: u32| recorder.lock().unwrap().push(event));
        let state: Arc<dyn StateSource<u32>> = Arc::new(|| 7_u32);
        let context = InvokeContext::new(sink, state, ()).with_extra("api");

        context.notify(1);

        assert_eq!(context.read_state(), 7);
        assert_eq!(*context.extra(), "api");
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
