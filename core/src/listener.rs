//! Capability-set interfaces for the per-subscription sinks described in
//! spec.md §3/§9. The watcher tables hold only the push-update half of a
//! subscription (`Update`/`NoEndpoints`, `Update(profile)`); the
//! "ClientClose | ServerClose, then Stop" lifecycle is owned by the gRPC
//! handler task that drives the subscription, not by the listener object
//! itself, so that a listener can never re-enter the watcher that is
//! calling it (the invariant spec.md §5 calls out under "Locking
//! discipline").

use crate::{diff::AddressDiff, profile::Profile};
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A process-unique identity for a subscribed listener, used so that
/// watcher listener lists behave as sets (no duplicate subscription by
/// identity) and so unsubscribe can find the right entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(usize);

impl ListenerId {
    pub fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// The per-stream sink for endpoint updates (spec.md §3).
pub trait EndpointListener: Send + Sync + fmt::Debug {
    fn id(&self) -> ListenerId;

    /// Pushes an address diff. Implementations must not block: a slow or
    /// full sink should report failure and let the caller continue (spec.md
    /// §4.2's fan-out invariant, §5's "Listener `Update` calls are expected
    /// to be non-blocking").
    fn update(&self, diff: AddressDiff);

    /// Pushes an absence signal. `exists` distinguishes a known service with
    /// no ready endpoints (`true`) from a service that doesn't exist, or is
    /// of type ExternalName (`false`).
    fn no_endpoints(&self, exists: bool);
}

/// The per-stream sink for profile updates (spec.md §3).
pub trait ProfileListener: Send + Sync + fmt::Debug {
    fn id(&self) -> ListenerId;

    /// Replaces the whole profile. Non-blocking, same as `EndpointListener::update`.
    fn update(&self, profile: Profile);
}
