//! Host seams consumed by the engine.
//!
//! The engine does not own any state. It needs two things from the host state
//! container: somewhere to send notifications and a way to snapshot the
//! current state for gating predicates and work functions. Both are traits so
//! any container (or a plain closure) can play the host.

/// Accepts lifecycle notifications
///
/// Implementations must return without failing; anything they do with the
/// event is their own business.
pub trait NotificationSink<Ev>: Send + Sync {
    /// Deliver one event
    fn notify(&self, event: Ev);
}

impl<Ev, F> NotificationSink<Ev> for F
where
    F: Fn(Ev) + Send + Sync,
{
    fn notify(&self, event: Ev) {
        self(event);
    }
}

/// Synchronous snapshot accessor for the host state
pub trait StateSource<S>: Send + Sync {
    /// Current state
    fn read_state(&self) -> S;
}

impl<S, F> StateSource<S> for F
where
    F: Fn() -> S + Send + Sync,
{
    fn read_state(&self) -> S {
        self()
    }
}
