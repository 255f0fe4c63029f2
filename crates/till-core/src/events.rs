//! # Event Feed
//!
//! The subscribe/emit capability composed by [`Item`](crate::item::Item) and
//! [`Cart`](crate::cart::Cart), plus the typed event vocabulary of both.
//!
//! ## Event Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Event Flow                                      │
//! │                                                                         │
//! │  mutation ──► Emitter::schedule(event) ──► Scheduler queue              │
//! │                                                 │                       │
//! │                              drain (end of the public operation)        │
//! │                                                 │                       │
//! │                                                 ▼                       │
//! │                              listeners for event.kind(), in             │
//! │                              registration order                         │
//! │                                                                         │
//! │  Cart-mediated item mutations schedule the item's events AND the        │
//! │  cart-level `item:*` / aggregate counterparts on the same queue,        │
//! │  so both feeds observe one consistent order.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The emitter is an explicit capability, not a base class: entities own an
//! `Emitter<E>` and expose `on`/`once`/`off` by delegation. Registration has
//! a fixed per-kind capacity ([`MAX_EVENT_LISTENERS`]); exceeding it is a
//! hard failure rather than a silent drop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{CartError, CartResult};
use crate::item::ItemSnapshot;
use crate::scheduler::Scheduler;

/// Maximum listeners per event kind on a single emitter.
pub const MAX_EVENT_LISTENERS: usize = 10;

// =============================================================================
// Event Trait
// =============================================================================

/// A typed event with a discriminant used to key listener registration.
pub trait Event: Clone + Debug + 'static {
    /// The kind discriminant (payload-free mirror of the event enum).
    type Kind: Copy + Eq + Hash + Debug + 'static;

    /// Returns the kind of this event.
    fn kind(&self) -> Self::Kind;
}

// =============================================================================
// Emitter
// =============================================================================

/// Handle returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Entry<E: Event> {
    id: ListenerId,
    once: bool,
    handler: Rc<RefCell<dyn FnMut(&E)>>,
}

impl<E: Event> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Entry {
            id: self.id,
            once: self.once,
            handler: Rc::clone(&self.handler),
        }
    }
}

struct Registry<E: Event> {
    listeners: HashMap<E::Kind, Vec<Entry<E>>>,
    next_id: u64,
}

/// An ordered listener registry keyed by event kind.
///
/// Cloning yields another handle to the same registry (listeners registered
/// through either handle fire for events scheduled through both). Delivery is
/// deferred: [`Emitter::schedule`] enqueues the delivery on a [`Scheduler`]
/// and the owning entity drains once its mutation is complete.
pub struct Emitter<E: Event> {
    registry: Rc<RefCell<Registry<E>>>,
}

impl<E: Event> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Emitter {
            registry: Rc::clone(&self.registry),
        }
    }
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Emitter::new()
    }
}

impl<E: Event> Emitter<E> {
    /// Creates an emitter with no listeners.
    pub fn new() -> Self {
        Emitter {
            registry: Rc::new(RefCell::new(Registry {
                listeners: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Registers a listener for one event kind.
    ///
    /// Fails with [`CartError::TooManyListeners`] once the kind already has
    /// [`MAX_EVENT_LISTENERS`] listeners.
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> CartResult<ListenerId>
    where
        F: FnMut(&E) + 'static,
    {
        self.register(kind, handler, false)
    }

    /// Registers a listener that is removed after its first delivery.
    pub fn once<F>(&self, kind: E::Kind, handler: F) -> CartResult<ListenerId>
    where
        F: FnMut(&E) + 'static,
    {
        self.register(kind, handler, true)
    }

    fn register<F>(&self, kind: E::Kind, handler: F, once: bool) -> CartResult<ListenerId>
    where
        F: FnMut(&E) + 'static,
    {
        let mut registry = self.registry.borrow_mut();
        if registry.listeners.get(&kind).map_or(0, Vec::len) >= MAX_EVENT_LISTENERS {
            return Err(CartError::TooManyListeners {
                event: format!("{kind:?}"),
            });
        }
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.entry(kind).or_default().push(Entry {
            id,
            once,
            handler: Rc::new(RefCell::new(handler)),
        });
        Ok(id)
    }

    /// Removes one listener. Returns true if it was registered.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut registry = self.registry.borrow_mut();
        if let Some(entries) = registry.listeners.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            return entries.len() != before;
        }
        false
    }

    /// Removes every listener for one event kind.
    pub fn remove_listeners(&self, kind: E::Kind) {
        self.registry.borrow_mut().listeners.remove(&kind);
    }

    /// Number of listeners registered for one event kind.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.registry
            .borrow()
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Schedules `event` for delivery on the next drain of `scheduler`.
    pub fn schedule(&self, scheduler: &Scheduler, event: E) {
        let registry = Rc::clone(&self.registry);
        scheduler.enqueue(move || deliver(&registry, &event));
    }
}

impl<E: Event> Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.borrow();
        f.debug_struct("Emitter")
            .field("kinds", &registry.listeners.len())
            .finish()
    }
}

/// Delivers `event` to the listeners registered for its kind.
///
/// The entry list is cloned up front so listeners may register or remove
/// listeners (on this or any other emitter) while delivery is in progress.
fn deliver<E: Event>(registry: &Rc<RefCell<Registry<E>>>, event: &E) {
    let entries: Vec<Entry<E>> = registry
        .borrow()
        .listeners
        .get(&event.kind())
        .cloned()
        .unwrap_or_default();

    let mut spent = Vec::new();
    for entry in &entries {
        (entry.handler.borrow_mut())(event);
        if entry.once {
            spent.push(entry.id);
        }
    }

    if !spent.is_empty() {
        let mut registry = registry.borrow_mut();
        if let Some(entries) = registry.listeners.get_mut(&event.kind()) {
            entries.retain(|entry| !spent.contains(&entry.id));
        }
    }
}

// =============================================================================
// Item Events
// =============================================================================

/// Discriminants for [`ItemEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemEventKind {
    Price,
    Quantity,
    Total,
    Change,
    PropertyChange,
    Lock,
    Unlock,
    Error,
}

/// Events emitted by a single [`Item`](crate::item::Item).
#[derive(Debug, Clone)]
pub enum ItemEvent {
    /// The price changed. Carries the new effective price.
    Price { price: f64 },
    /// The quantity changed. Carries the new quantity.
    Quantity { quantity: i64 },
    /// The subtotal changed (follows price and quantity changes).
    Total { subtotal: f64 },
    /// Any state change (follows every mutation).
    Change,
    /// One property changed.
    PropertyChange {
        key: String,
        value: Value,
        previous: Option<Value>,
    },
    /// The item transitioned to locked.
    Lock,
    /// The item transitioned to unlocked.
    Unlock,
    /// A soft failure (e.g. quantity mutation on a non-countable item).
    Error { error: CartError },
}

impl Event for ItemEvent {
    type Kind = ItemEventKind;

    fn kind(&self) -> ItemEventKind {
        match self {
            ItemEvent::Price { .. } => ItemEventKind::Price,
            ItemEvent::Quantity { .. } => ItemEventKind::Quantity,
            ItemEvent::Total { .. } => ItemEventKind::Total,
            ItemEvent::Change => ItemEventKind::Change,
            ItemEvent::PropertyChange { .. } => ItemEventKind::PropertyChange,
            ItemEvent::Lock => ItemEventKind::Lock,
            ItemEvent::Unlock => ItemEventKind::Unlock,
            ItemEvent::Error { .. } => ItemEventKind::Error,
        }
    }
}

// =============================================================================
// Cart Events
// =============================================================================

/// Discriminants for [`CartEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CartEventKind {
    ItemAdd,
    ItemRemove,
    ItemChange,
    ItemQuantity,
    ItemTotal,
    ItemError,
    Change,
    Count,
    Quantity,
    Total,
    Error,
    Lock,
    Unlock,
    Clearing,
    Clear,
    MetaChange,
    Purchasing,
    Purchase,
}

/// Events emitted by a [`Cart`](crate::cart::Cart).
///
/// `ItemChange`/`ItemQuantity`/`ItemTotal`/`ItemError` mirror the contained
/// item's own events at the cart level; the bare `Change`/`Quantity`/`Total`/
/// `Error` counterparts follow each of them. `Count`/`Quantity`/`Total` are
/// also emitted (coalesced, at most once each) for the net effect of an
/// `add`/`remove` batch.
#[derive(Debug, Clone)]
pub enum CartEvent {
    /// An item was inserted. Carries a snapshot of the inserted item.
    ItemAdd { item: ItemSnapshot },
    /// An item was removed. Carries a snapshot of the removed item.
    ItemRemove { item: ItemSnapshot },
    /// A contained item changed.
    ItemChange { id: Value },
    /// A contained item's quantity changed.
    ItemQuantity { id: Value, quantity: i64 },
    /// A contained item's subtotal changed.
    ItemTotal { id: Value, subtotal: f64 },
    /// A contained item reported a soft failure.
    ItemError { id: Value, error: CartError },
    /// Any cart state change.
    Change,
    /// The number of countable items changed. Carries the new count.
    Count { count: usize },
    /// The aggregate quantity changed. Carries the new aggregate.
    Quantity { quantity: i64 },
    /// The aggregate total changed. Carries the new aggregate.
    Total { total: f64 },
    /// A soft failure at the cart level.
    Error { error: CartError },
    /// The cart transitioned to locked.
    Lock,
    /// The cart transitioned to unlocked.
    Unlock,
    /// `clear` is about to remove every item.
    Clearing,
    /// `clear` finished.
    Clear,
    /// One meta key changed.
    MetaChange {
        key: String,
        value: Value,
        previous: Option<Value>,
    },
    /// A purchase attempt entered the locked `purchasing` state.
    Purchasing,
    /// A purchase attempt completed successfully. Carries the driver result.
    Purchase { result: Value },
}

impl Event for CartEvent {
    type Kind = CartEventKind;

    fn kind(&self) -> CartEventKind {
        match self {
            CartEvent::ItemAdd { .. } => CartEventKind::ItemAdd,
            CartEvent::ItemRemove { .. } => CartEventKind::ItemRemove,
            CartEvent::ItemChange { .. } => CartEventKind::ItemChange,
            CartEvent::ItemQuantity { .. } => CartEventKind::ItemQuantity,
            CartEvent::ItemTotal { .. } => CartEventKind::ItemTotal,
            CartEvent::ItemError { .. } => CartEventKind::ItemError,
            CartEvent::Change => CartEventKind::Change,
            CartEvent::Count { .. } => CartEventKind::Count,
            CartEvent::Quantity { .. } => CartEventKind::Quantity,
            CartEvent::Total { .. } => CartEventKind::Total,
            CartEvent::Error { .. } => CartEventKind::Error,
            CartEvent::Lock => CartEventKind::Lock,
            CartEvent::Unlock => CartEventKind::Unlock,
            CartEvent::Clearing => CartEventKind::Clearing,
            CartEvent::Clear => CartEventKind::Clear,
            CartEvent::MetaChange { .. } => CartEventKind::MetaChange,
            CartEvent::Purchasing => CartEventKind::Purchasing,
            CartEvent::Purchase { .. } => CartEventKind::Purchase,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
