//! Store lifecycle events and listener dispatch.
//!
//! Every successful mutation emits one [`LifecycleEvent`] through the
//! store's [`StoreEvents`] hub. Delivery is synchronous: listeners run
//! before the mutating call returns, and a listener error is returned to
//! the caller of that mutation.
//!
//! Writes performed while replaying an event (see [`replaying`]) carry the
//! replaying component's [`ReplayTag`] as the event origin, which lets that
//! component recognise and skip its own side effects.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StorageResult;

use super::object::StoredObject;
use super::partial::PartialUpdate;

tokio::task_local! {
    static REPLAY_ORIGIN: ReplayTag;
}

/// Identifies the component on whose behalf a write was made.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayTag(Arc<str>);

impl ReplayTag {
    /// Creates a tag unique to this process.
    pub fn unique(label: &str) -> Self {
        Self(Arc::from(format!("{}#{}", label, uuid::Uuid::new_v4().simple())))
    }

    /// Returns the tag text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs `future` with `tag` as the origin of every event it causes.
pub async fn replaying<F: Future>(tag: ReplayTag, future: F) -> F::Output {
    REPLAY_ORIGIN.scope(tag, future).await
}

/// Returns the replay tag of the current task, if inside [`replaying`].
pub fn current_origin() -> Option<ReplayTag> {
    REPLAY_ORIGIN.try_with(Clone::clone).ok()
}

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`LifecycleEvent::Saved`].
    Saved,
    /// See [`LifecycleEvent::Updated`].
    Updated,
    /// See [`LifecycleEvent::PatchUpdated`].
    PatchUpdated,
    /// See [`LifecycleEvent::PartialUpdated`].
    PartialUpdated,
    /// See [`LifecycleEvent::Deleted`].
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Saved => "Store.Saved",
            EventKind::Updated => "Store.Updated",
            EventKind::PatchUpdated => "Store.PatchUpdated",
            EventKind::PartialUpdated => "Store.PartialUpdated",
            EventKind::Deleted => "Store.Deleted",
        };
        f.write_str(name)
    }
}

/// A mutation that has been committed.
///
/// `previous` is the state before the mutation when the backend captured it
/// in the same atomic step; backends that cannot leave it `None`.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum LifecycleEvent {
    /// An object was created.
    Saved { object: StoredObject },
    /// An object was replaced.
    Updated {
        object: StoredObject,
        previous: Option<StoredObject>,
    },
    /// An object was merge-patched.
    PatchUpdated {
        object: StoredObject,
        previous: Option<StoredObject>,
        patch: Value,
    },
    /// One attribute was changed by a targeted update.
    PartialUpdated {
        object: StoredObject,
        previous: Option<StoredObject>,
        update: PartialUpdate,
    },
    /// An object was deleted (or tombstoned).
    Deleted {
        object: StoredObject,
        tombstoned: bool,
    },
}

impl LifecycleEvent {
    /// Returns the event kind.
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Saved { .. } => EventKind::Saved,
            LifecycleEvent::Updated { .. } => EventKind::Updated,
            LifecycleEvent::PatchUpdated { .. } => EventKind::PatchUpdated,
            LifecycleEvent::PartialUpdated { .. } => EventKind::PartialUpdated,
            LifecycleEvent::Deleted { .. } => EventKind::Deleted,
        }
    }

    /// Returns the object after the mutation (before it, for deletes).
    pub fn object(&self) -> &StoredObject {
        match self {
            LifecycleEvent::Saved { object }
            | LifecycleEvent::Updated { object, .. }
            | LifecycleEvent::PatchUpdated { object, .. }
            | LifecycleEvent::PartialUpdated { object, .. }
            | LifecycleEvent::Deleted { object, .. } => object,
        }
    }

    /// Returns the object identifier.
    pub fn object_id(&self) -> &str {
        self.object().id()
    }

    /// Returns the state before the mutation, when known.
    pub fn previous(&self) -> Option<&StoredObject> {
        match self {
            LifecycleEvent::Updated { previous, .. }
            | LifecycleEvent::PatchUpdated { previous, .. }
            | LifecycleEvent::PartialUpdated { previous, .. } => previous.as_ref(),
            _ => None,
        }
    }

    /// Returns the targeted update of a `PartialUpdated` event.
    pub fn partial_update(&self) -> Option<&PartialUpdate> {
        match self {
            LifecycleEvent::PartialUpdated { update, .. } => Some(update),
            _ => None,
        }
    }
}

/// A lifecycle event as delivered to listeners.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Name of the store that emitted the event.
    pub store: String,
    /// Replay tag active when the mutation was made.
    pub origin: Option<ReplayTag>,
    /// The event.
    pub event: LifecycleEvent,
}

impl StoreEvent {
    /// Returns true if the event was caused by a replay under `tag`.
    pub fn originates_from(&self, tag: &ReplayTag) -> bool {
        self.origin.as_ref() == Some(tag)
    }
}

/// Receives the lifecycle events of one or more stores.
#[async_trait]
pub trait StoreListener: Send + Sync {
    /// Listener name, used in logs and for unsubscribing.
    fn name(&self) -> &str;

    /// Handles one event. An error is returned to the mutating caller.
    async fn on_event(&self, event: &StoreEvent) -> StorageResult<()>;
}

/// The listener registry of one store.
pub struct StoreEvents {
    store: String,
    listeners: RwLock<Vec<Arc<dyn StoreListener>>>,
}

impl StoreEvents {
    /// Creates an empty registry for the named store.
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a listener.
    pub fn subscribe(&self, listener: Arc<dyn StoreListener>) {
        debug!(store = %self.store, listener = listener.name(), "Listener subscribed");
        self.listeners.write().push(listener);
    }

    /// Removes every listener with the given name. Returns true if any was
    /// removed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        before != listeners.len()
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers an event to every listener.
    ///
    /// Listeners run concurrently and all of them complete before this
    /// returns. When several fail, the first error is returned and the
    /// others are logged.
    pub async fn emit(&self, event: LifecycleEvent) -> StorageResult<()> {
        let listeners: Vec<Arc<dyn StoreListener>> = self.listeners.read().clone();
        if listeners.is_empty() {
            return Ok(());
        }

        let event = StoreEvent {
            store: self.store.clone(),
            origin: current_origin(),
            event,
        };
        debug!(
            store = %self.store,
            event = %event.event.kind(),
            id = event.event.object_id(),
            origin = event.origin.as_ref().map(ReplayTag::as_str),
            "Emitting lifecycle event"
        );

        let outcomes =
            futures::future::join_all(listeners.iter().map(|l| l.on_event(&event))).await;

        let mut first_error = None;
        for (listener, outcome) in listeners.iter().zip(outcomes) {
            if let Err(err) = outcome {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(
                        store = %self.store,
                        listener = listener.name(),
                        error = %err,
                        "Listener failed"
                    );
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for StoreEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreEvents")
            .field("store", &self.store)
            .field("listeners", &self.listener_count())
            .finish()
    }
}
