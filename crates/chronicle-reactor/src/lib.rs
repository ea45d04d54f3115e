#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-reactor** – Type-dispatched side-effect handlers for
//! Chronicle.
//!
//! A reactor is the fire-and-forget counterpart of a projector: it performs
//! a side effect when an event of one specific type is processed live, keeps
//! no cursor, and is skipped entirely during replay. Which type a reactor
//! subscribes to is expressed by its `handle` parameter - the [`Reactor`]
//! trait's associated `Event` type - so the subscription is checked at
//! compile time and dispatch is a plain type-id lookup at run time.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chronicle_types::{downcast_event, event_type_id, DomainEvent};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors surfaced by reactor registration.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// A reactor of the same concrete type is already registered.
    #[error("reactor '{0}' is already registered")]
    DuplicateReactor(&'static str),
}

//─────────────────────────────
//  Reactor trait
//─────────────────────────────

/// A side-effect handler for exactly one event type.
///
/// The associated `Event` type is the subscription: the registry dispatches
/// an event to every reactor whose `Event` matches the event's runtime type.
/// Reactors are best-effort - they return nothing, and the processor
/// contains any panic they raise.
pub trait Reactor: Send + Sync + 'static {
    /// The event type this reactor subscribes to.
    type Event: DomainEvent;

    /// React to one event.
    fn handle(&self, event: &Self::Event);
}

/// An erased reactor invocation, safe to call with any event; it dispatches
/// only when the runtime type matches the registered subscription.
pub type ReactorFn = Arc<dyn Fn(&dyn DomainEvent) + Send + Sync>;

//─────────────────────────────
//  Reactor registry
//─────────────────────────────

#[derive(Default)]
struct RegistryState {
    by_event: HashMap<TypeId, Vec<ReactorFn>>,
    registered: HashSet<TypeId>,
}

/// Thread-safe set of reactors indexed by subscribed event type.
#[derive(Default)]
pub struct ReactorRegistry {
    inner: Mutex<RegistryState>,
}

impl ReactorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reactor.
    ///
    /// At most one reactor of a given concrete type may be registered;
    /// distinct reactor types may share a subscription.
    pub fn register<R: Reactor>(&self, reactor: R) -> Result<(), ReactorError> {
        let mut state = self.lock();
        if !state.registered.insert(TypeId::of::<R>()) {
            return Err(ReactorError::DuplicateReactor(std::any::type_name::<R>()));
        }

        let reactor = Arc::new(reactor);
        let callable: ReactorFn = Arc::new(move |event| {
            if let Some(event) = downcast_event::<R::Event>(event) {
                reactor.handle(event);
            }
        });
        state
            .by_event
            .entry(TypeId::of::<R::Event>())
            .or_default()
            .push(callable);
        Ok(())
    }

    /// Callables for every reactor subscribed to the runtime type of
    /// `event`, in registration order.
    pub fn for_event(&self, event: &dyn DomainEvent) -> Vec<ReactorFn> {
        self.lock()
            .by_event
            .get(&event_type_id(event))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of registered reactors.
    pub fn len(&self) -> usize {
        self.lock().registered.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().registered.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
