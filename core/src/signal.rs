//! Cooperative cancellation.
//!
//! A [`CancellationSignal`] is a shared cell with a one-way `aborted` flag, an
//! optional reason and a list of observers. Aborting never interrupts running
//! code; work functions poll [`CancellationSignal::is_aborted`], register an
//! observer, or await [`CancellationSignal::aborted`].
//!
//! # Backends
//!
//! The awaitable part of the signal is delegated to an [`AbortPrimitive`]:
//!
//! - **Native**: `tokio_util::sync::CancellationToken`
//! - **Fallback**: a self-contained primitive built on `futures` oneshot
//!   channels, used when the host provides no [`SignalFactory`]
//!
//! Both behave identically from the caller's point of view.
//!
//! # Example
//!
//! ```
//! use composable_ops_core::signal::CancellationSignal;
//! use std::sync::{Arc, Mutex};
//!
//! let signal = CancellationSignal::native();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let log = Arc::clone(&seen);
//! signal.on_abort(move |reason| log.lock().unwrap().push(reason.map(str::to_owned)));
//!
//! assert!(signal.abort(Some("user left".into())));
//! assert!(!signal.abort(Some("ignored".into())));
//!
//! assert!(signal.is_aborted());
//! assert_eq!(signal.reason().as_deref(), Some("user left"));
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! ```

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Callback run once when a signal transitions to aborted
type Observer = Box<dyn FnOnce(Option<&str>) + Send>;

/// Awaitable one-shot trigger backing a [`CancellationSignal`]
pub trait AbortPrimitive: Send + Sync {
    /// Fire the trigger. Must be idempotent.
    fn trigger(&self);

    /// Whether the trigger has fired
    fn is_triggered(&self) -> bool;

    /// Future resolving once the trigger has fired
    fn triggered(&self) -> BoxFuture<'static, ()>;
}

/// Primitive backed by `tokio_util`'s `CancellationToken`
#[derive(Debug, Clone, Default)]
pub struct NativeAbortPrimitive {
    token: CancellationToken,
}

impl NativeAbortPrimitive {
    /// Create an untriggered primitive
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }
}

impl AbortPrimitive for NativeAbortPrimitive {
    fn trigger(&self) {
        self.token.cancel();
    }

    fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    fn triggered(&self) -> BoxFuture<'static, ()> {
        let token = self.token.clone();
        async move { token.cancelled().await }.boxed()
    }
}

/// Self-contained primitive used when no native factory is available
pub struct FallbackAbortPrimitive {
    fired: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<()>>>,
    receiver: Shared<oneshot::Receiver<()>>,
}

impl FallbackAbortPrimitive {
    /// Create an untriggered primitive
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            fired: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            receiver: receiver.shared(),
        }
    }
}

impl Default for FallbackAbortPrimitive {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FallbackAbortPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackAbortPrimitive")
            .field("fired", &self.fired.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl AbortPrimitive for FallbackAbortPrimitive {
    fn trigger(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn triggered(&self) -> BoxFuture<'static, ()> {
        let receiver = self.receiver.clone();
        async move {
            // A dropped sender means the primitive is gone without firing.
            if receiver.await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
        .boxed()
    }
}

/// Which primitive a signal was built on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalBackend {
    /// `tokio_util::sync::CancellationToken`
    Native,
    /// [`FallbackAbortPrimitive`]
    Fallback,
    /// A caller supplied [`AbortPrimitive`]
    Custom,
}

struct SignalState {
    aborted: bool,
    reason: Option<String>,
    observers: SmallVec<[Observer; 2]>,
}

struct SignalInner {
    backend: SignalBackend,
    primitive: Box<dyn AbortPrimitive>,
    state: Mutex<SignalState>,
}

/// Shared, one-way cancellation cell
///
/// Cloning is cheap and every clone observes the same cell.
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

impl CancellationSignal {
    /// Signal backed by `CancellationToken`
    #[must_use]
    pub fn native() -> Self {
        Self::build(SignalBackend::Native, Box::new(NativeAbortPrimitive::new()))
    }

    /// Signal backed by the self-contained fallback primitive
    #[must_use]
    pub fn fallback() -> Self {
        Self::build(SignalBackend::Fallback, Box::new(FallbackAbortPrimitive::new()))
    }

    /// Signal backed by a caller supplied primitive
    #[must_use]
    pub fn with_primitive(primitive: Box<dyn AbortPrimitive>) -> Self {
        Self::build(SignalBackend::Custom, primitive)
    }

    fn build(backend: SignalBackend, primitive: Box<dyn AbortPrimitive>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                backend,
                primitive,
                state: Mutex::new(SignalState {
                    aborted: false,
                    reason: None,
                    observers: SmallVec::new(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SignalState> {
        // Observers run outside the lock, so a poisoned lock still holds consistent state.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition to aborted
    ///
    /// Only the first call records `reason` and runs the registered observers,
    /// in registration order. Returns `true` if this call performed the
    /// transition.
    pub fn abort(&self, reason: Option<String>) -> bool {
        let observers = {
            let mut state = self.state();
            if state.aborted {
                return false;
            }
            state.aborted = true;
            state.reason.clone_from(&reason);
            std::mem::take(&mut state.observers)
        };

        self.inner.primitive.trigger();

        for observer in observers {
            observer(reason.as_deref());
        }
        true
    }

    /// Whether the signal has been aborted
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }

    /// Reason passed to the first `abort` call, if any
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state().reason.clone()
    }

    /// Register an observer
    ///
    /// If the signal is already aborted the observer runs immediately, on the
    /// calling thread, instead of being stored.
    pub fn on_abort<F>(&self, observer: F)
    where
        F: FnOnce(Option<&str>) + Send + 'static,
    {
        let reason = {
            let mut state = self.state();
            if !state.aborted {
                state.observers.push(Box::new(observer));
                return;
            }
            state.reason.clone()
        };
        observer(reason.as_deref());
    }

    /// Future resolving once the signal is aborted
    ///
    /// The future owns a handle on the signal and may outlive `self`.
    pub fn aborted(&self) -> BoxFuture<'static, ()> {
        self.inner.primitive.triggered()
    }

    /// Primitive this signal was built on
    #[must_use]
    pub fn backend(&self) -> SignalBackend {
        self.inner.backend
    }

    /// `true` if both handles refer to the same cell
    #[must_use]
    pub fn same_signal(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("CancellationSignal")
            .field("backend", &self.inner.backend)
            .field("aborted", &state.aborted)
            .field("reason", &state.reason)
            .field("observers", &state.observers.len())
            .field("primitive_triggered", &self.inner.primitive.is_triggered())
            .finish()
    }
}

/// Source of cancellation signals supplied by the host
///
/// When the invoke context carries no factory, the runtime falls back to
/// [`CancellationSignal::fallback`].
pub trait SignalFactory: Send + Sync {
    /// Create a fresh, unaborted signal
    fn create(&self) -> CancellationSignal;
}

/// Factory producing [`SignalBackend::Native`] signals
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSignalFactory;

impl SignalFactory for NativeSignalFactory {
    fn create(&self) -> CancellationSignal {
        CancellationSignal::native()
    }
}

/// Drives a set of linked signals with a single `abort` call
///
/// One invocation owns one controller linking the signal handed to its gating
/// predicate and the signal handed to its work function.
#[derive(Debug, Clone)]
pub struct AbortController {
    signals: Arc<[CancellationSignal]>,
}

impl AbortController {
    /// Link the given signals
    #[must_use]
    pub fn new(signals: Vec<CancellationSignal>) -> Self {
        Self {
            signals: signals.into(),
        }
    }

    /// Abort every linked signal; returns `true` if any of them transitioned
    pub fn abort(&self, reason: Option<String>) -> bool {
        self.signals
            .iter()
            .fold(false, |any, signal| signal.abort(reason.clone()) || any)
    }

    /// `true` once any linked signal is aborted
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.signals.iter().any(CancellationSignal::is_aborted)
    }

    /// Linked signals, in the order they were given
    #[must_use]
    pub fn signals(&self) -> &[CancellationSignal] {
        &self.signals
    }
}
