//! # Cart
//!
//! An ordered owner of [`Item`]s plus configuration: aggregation, duplicate
//! policy, event forwarding, and the purchase protocol.
//!
//! ## Ownership & Mutation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Cart Ownership Model                                │
//! │                                                                         │
//! │  Caller Action             Cart Method              Events (deferred)   │
//! │  ─────────────             ───────────              ─────────────────   │
//! │  add item/bag ───────────► add / add_all ─────────► item:add, change,   │
//! │                                                     count/qty/total*    │
//! │  change quantity ────────► set_quantity(id, n) ───► quantity pair,      │
//! │                                                     total pair, change  │
//! │  remove ─────────────────► remove / remove_index ─► item:remove, change │
//! │  checkout ───────────────► purchase(cb) ──────────► purchasing, ...     │
//! │                                                                         │
//! │  * coalesced: at most once per batch, only if the batch affects         │
//! │    that aggregate                                                        │
//! │                                                                         │
//! │  The cart owns its items exclusively. Once added, an item is only       │
//! │  reachable as `&Item`; every mutation flows through the cart, which     │
//! │  is what lets the cart forward item events and enforce the lock.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CartError, CartResult};
use crate::events::{CartEvent, CartEventKind, Emitter, ListenerId};
use crate::item::{Item, ItemInit, ItemSnapshot, Price};
use crate::payment::{DriverOutcome, PaymentDriver, PurchaseCallback, PurchaseResult};
use crate::scheduler::Scheduler;
use crate::signer::{default_signer, Signer};

// =============================================================================
// Options
// =============================================================================

/// The cart's response to adding an item whose product already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DupeItemMode {
    /// Merge: increment the existing item's quantity, discard the new item.
    Add,
    /// Report a duplicate-product `error` event and skip the addition.
    Error,
    /// Insert anyway, no merge.
    Allow,
}

impl Default for DupeItemMode {
    fn default() -> Self {
        DupeItemMode::Error
    }
}

/// Cart configuration, immutable after construction.
///
/// The one mutable configuration surface is `meta`, which the cart takes
/// ownership of and exposes through [`Cart::meta`]/[`Cart::set_meta`]; the
/// rest of the record has no post-construction setters.
#[derive(Clone, Default)]
pub struct CartOptions {
    pub store: Option<String>,
    pub user: Option<String>,
    /// Seed for the cart's mutable meta store.
    pub meta: HashMap<String, Value>,
    pub dupe_item_mode: DupeItemMode,
    /// Remove an item automatically when a cart-mediated quantity update
    /// reaches zero.
    pub remove_on_zero_quantity: bool,
    /// Signature function; `None` selects the hash-based default.
    pub signer: Option<Signer>,
    /// Payment driver; purchasing without one is a soft failure.
    pub payment_driver: Option<PaymentDriver>,
}

impl fmt::Debug for CartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CartOptions")
            .field("store", &self.store)
            .field("user", &self.user)
            .field("meta", &self.meta)
            .field("dupe_item_mode", &self.dupe_item_mode)
            .field("remove_on_zero_quantity", &self.remove_on_zero_quantity)
            .field("signer", &self.signer.as_ref().map(|_| "<fn>"))
            .field("payment_driver", &self.payment_driver.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

// =============================================================================
// Construction Input
// =============================================================================

/// What `add` and construction accept: a built [`Item`] or a property bag.
#[derive(Debug)]
pub enum ItemInput {
    Built(Item),
    Init(ItemInit),
}

impl From<Item> for ItemInput {
    fn from(item: Item) -> Self {
        ItemInput::Built(item)
    }
}

impl From<ItemInit> for ItemInput {
    fn from(init: ItemInit) -> Self {
        ItemInput::Init(init)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Serializable snapshot of a [`Cart`] (`toJSON` form).
///
/// Injected functions (signer, payment driver) are not serializable and are
/// not part of the snapshot; [`Cart::from`] takes them as explicit arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CartSnapshot {
    pub store: Option<String>,
    pub user: Option<String>,
    pub meta: HashMap<String, Value>,
    pub total: f64,
    pub taxable_total: f64,
    pub count: usize,
    pub quantity: i64,
    pub signature: Value,
    pub items: Vec<ItemSnapshot>,
}

// =============================================================================
// Cart
// =============================================================================

struct PendingPurchase {
    attempt: Uuid,
    callback: Option<PurchaseCallback>,
}

/// Which aggregates a batch of additions/removals actually touched.
/// Drives the coalesced `count`/`quantity`/`total` emission.
#[derive(Default)]
struct AggregateTouch {
    count: bool,
    quantity: bool,
    total: bool,
}

impl AggregateTouch {
    /// An item affects count if countable; quantity if countable with a
    /// positive quantity; total if quantity-affecting with a positive or
    /// computed price.
    fn record(&mut self, item: &Item) {
        let affects_count = item.countable();
        let affects_quantity = affects_count && item.quantity() > 0;
        let affects_total =
            affects_quantity && (item.price_spec().is_computed() || item.price() > 0.0);
        self.count |= affects_count;
        self.quantity |= affects_quantity;
        self.total |= affects_total;
    }
}

/// An ordered collection of [`Item`]s with aggregation, dedup policy, an
/// event feed, and the purchase protocol.
pub struct Cart {
    store: Option<String>,
    user: Option<String>,
    meta: HashMap<String, Value>,
    dupe_item_mode: DupeItemMode,
    remove_on_zero_quantity: bool,
    signer: Signer,
    payment_driver: Option<PaymentDriver>,
    items: Vec<Item>,
    locked: bool,
    pending_purchase: Option<PendingPurchase>,
    created_at: DateTime<Utc>,
    events: Emitter<CartEvent>,
    scheduler: Scheduler,
}

impl Cart {
    /// Creates an empty cart.
    pub fn new(options: CartOptions) -> Self {
        Cart {
            store: options.store,
            user: options.user,
            meta: options.meta,
            dupe_item_mode: options.dupe_item_mode,
            remove_on_zero_quantity: options.remove_on_zero_quantity,
            signer: options.signer.unwrap_or_else(default_signer),
            payment_driver: options.payment_driver,
            items: Vec::new(),
            locked: false,
            pending_purchase: None,
            created_at: Utc::now(),
            events: Emitter::new(),
            scheduler: Scheduler::new(),
        }
    }

    /// Creates a cart seeded with items. Construction stores the items as
    /// given: no dedup policy, no events (there are no listeners yet).
    pub fn with_items(items: Vec<ItemInput>, options: CartOptions) -> Self {
        let mut cart = Cart::new(options);
        for input in items {
            let mut item = match input {
                ItemInput::Built(item) => item,
                ItemInput::Init(init) => Item::new(init),
            };
            item.adopt(cart.scheduler.clone());
            cart.items.push(item);
        }
        cart
    }

    /// Reconstructs a cart from a snapshot. `signer` and `payment_driver`
    /// override the defaults (functions are never embedded in snapshots).
    pub fn from(
        snapshot: CartSnapshot,
        signer: Option<Signer>,
        payment_driver: Option<PaymentDriver>,
    ) -> CartResult<Self> {
        let items = snapshot
            .items
            .into_iter()
            .map(|item| Item::from_snapshot(item).map(ItemInput::Built))
            .collect::<CartResult<Vec<_>>>()?;
        Ok(Cart::with_items(
            items,
            CartOptions {
                store: snapshot.store,
                user: snapshot.user,
                meta: snapshot.meta,
                signer,
                payment_driver,
                ..CartOptions::default()
            },
        ))
    }

    /// Reconstructs a cart from raw JSON. Unrecognized keys fail fast.
    pub fn from_value(
        value: Value,
        signer: Option<Signer>,
        payment_driver: Option<PaymentDriver>,
    ) -> CartResult<Self> {
        let snapshot: CartSnapshot =
            serde_json::from_value(value).map_err(|source| CartError::InvalidSnapshot {
                message: source.to_string(),
            })?;
        Cart::from(snapshot, signer, payment_driver)
    }

    // -------------------------------------------------------------------------
    // Accessors & Aggregates
    // -------------------------------------------------------------------------

    pub fn store(&self) -> Option<&str> {
        self.store.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn dupe_item_mode(&self) -> DupeItemMode {
        self.dupe_item_mode
    }

    pub fn remove_on_zero_quantity(&self) -> bool {
        self.remove_on_zero_quantity
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The items, in insertion order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// The item at `index`, if in range.
    pub fn item_at(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    /// Number of items, countable or not.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of countable items.
    pub fn count(&self) -> usize {
        self.items.iter().filter(|item| item.countable()).count()
    }

    /// Sum of quantities over countable items.
    pub fn quantity(&self) -> i64 {
        self.items.iter().map(Item::quantity).sum()
    }

    /// Sum of subtotals over all items.
    pub fn total(&self) -> f64 {
        self.items.iter().map(Item::subtotal).sum()
    }

    /// Sum of subtotals restricted to taxable items.
    pub fn taxable_total(&self) -> f64 {
        self.items
            .iter()
            .filter(|item| item.taxable())
            .map(Item::subtotal)
            .sum()
    }

    /// Invokes the injected signer. A signer failure is reported through an
    /// `error` event and then re-raised.
    pub fn signature(&self) -> CartResult<Value> {
        let signer = self.signer.clone();
        match signer(self) {
            Ok(signature) => Ok(signature),
            Err(error) => {
                warn!(%error, "signer failed");
                self.events
                    .schedule(&self.scheduler, CartEvent::Error { error: error.clone() });
                self.scheduler.drain();
                Err(error)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// First item with this id, linear scan.
    pub fn find(&self, id: &Value) -> Option<&Item> {
        self.items.iter().find(|item| item.id() == id)
    }

    /// First item whose field (built-in or freeform property) strictly
    /// equals `value`.
    pub fn find_by(&self, field: &str, value: &Value) -> Option<&Item> {
        self.items
            .iter()
            .find(|item| item.field(field).as_ref() == Some(value))
    }

    /// Filters items: no field keeps all; a field alone keeps items where it
    /// is truthy; field plus value keeps items where it strictly equals.
    pub fn items_by(&self, field: Option<&str>, value: Option<&Value>) -> Vec<&Item> {
        self.items
            .iter()
            .filter(|item| match (field, value) {
                (None, _) => true,
                (Some(field), None) => item.field(field).map_or(false, |v| truthy(&v)),
                (Some(field), Some(value)) => item.field(field).as_ref() == Some(value),
            })
            .collect()
    }

    /// Sums a numeric field over [`Cart::items_by`]. Non-numeric field
    /// values contribute zero.
    pub fn tally_by(&self, aggregate: &str, field: Option<&str>, value: Option<&Value>) -> f64 {
        self.items_by(field, value)
            .into_iter()
            .map(|item| {
                item.field(aggregate)
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
            })
            .sum()
    }

    // -------------------------------------------------------------------------
    // Event Feed
    // -------------------------------------------------------------------------

    /// Registers a listener. Fails once the kind holds
    /// [`MAX_EVENT_LISTENERS`](crate::events::MAX_EVENT_LISTENERS) listeners.
    pub fn on<F>(&self, kind: CartEventKind, handler: F) -> CartResult<ListenerId>
    where
        F: FnMut(&CartEvent) + 'static,
    {
        self.events.on(kind, handler)
    }

    /// Registers a listener that fires at most once.
    pub fn once<F>(&self, kind: CartEventKind, handler: F) -> CartResult<ListenerId>
    where
        F: FnMut(&CartEvent) + 'static,
    {
        self.events.once(kind, handler)
    }

    /// Removes one listener.
    pub fn off(&self, kind: CartEventKind, id: ListenerId) -> bool {
        self.events.off(kind, id)
    }

    // -------------------------------------------------------------------------
    // Meta
    // -------------------------------------------------------------------------

    /// One meta value.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    /// The whole meta store.
    pub fn meta_map(&self) -> &HashMap<String, Value> {
        &self.meta
    }

    /// Sets one meta value; allowed even while locked (meta is the mutable
    /// exception in the configuration). Returns the cart for chaining.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        let previous = self.meta.insert(key.clone(), value.clone());
        self.events.schedule(
            &self.scheduler,
            CartEvent::MetaChange {
                key,
                value,
                previous,
            },
        );
        self.events.schedule(&self.scheduler, CartEvent::Change);
        self.scheduler.drain();
        self
    }

    // -------------------------------------------------------------------------
    // Add / Remove
    // -------------------------------------------------------------------------

    /// Adds one item or property bag. Hard-fails when the cart is locked.
    pub fn add(&mut self, addition: impl Into<ItemInput>) -> CartResult<()> {
        self.add_all(vec![addition.into()])
    }

    /// Adds a batch. Duplicate ids are soft failures; duplicate products go
    /// through the configured [`DupeItemMode`]. After the batch, coalesced
    /// `count`/`quantity`/`total` events fire at most once each, only if an
    /// addition affected that aggregate.
    pub fn add_all(&mut self, additions: Vec<ItemInput>) -> CartResult<()> {
        if self.locked {
            return Err(CartError::CartLocked);
        }
        let mut touched = AggregateTouch::default();

        for input in additions {
            let mut item = match input {
                ItemInput::Built(item) => item,
                ItemInput::Init(init) => Item::new(init),
            };

            if self.items.iter().any(|existing| existing.id() == item.id()) {
                let error = CartError::DuplicateItem {
                    id: item.id().clone(),
                };
                warn!(id = %item.id(), "skipping duplicate item");
                self.events
                    .schedule(&self.scheduler, CartEvent::Error { error });
                continue;
            }

            // Dedup policy is evaluated per addition, against items already
            // inserted, including earlier additions of this same batch.
            let existing_index = self
                .items
                .iter()
                .position(|existing| existing.product() == item.product());
            if let Some(index) = existing_index {
                match self.dupe_item_mode {
                    DupeItemMode::Error => {
                        let existing = &self.items[index];
                        let error = CartError::DuplicateProduct {
                            product: item.product().clone(),
                            existing_id: existing.id().clone(),
                            incoming_id: item.id().clone(),
                        };
                        warn!(product = %item.product(), "skipping duplicate product");
                        self.events
                            .schedule(&self.scheduler, CartEvent::Error { error });
                        continue;
                    }
                    DupeItemMode::Add => {
                        self.merge_quantity(index, item.quantity(), &mut touched);
                        continue;
                    }
                    DupeItemMode::Allow => {}
                }
            }

            item.adopt(self.scheduler.clone());
            touched.record(&item);
            let snapshot = item.to_json();
            debug!(id = %item.id(), product = %item.product(), "item added");
            self.items.push(item);
            self.events
                .schedule(&self.scheduler, CartEvent::ItemAdd { item: snapshot });
            self.events.schedule(&self.scheduler, CartEvent::Change);
        }

        self.schedule_aggregates(&touched);
        self.scheduler.drain();
        Ok(())
    }

    /// Merge path of [`DupeItemMode::Add`]: the existing item absorbs the
    /// incoming quantity, the incoming item is discarded.
    fn merge_quantity(&mut self, index: usize, added: i64, touched: &mut AggregateTouch) {
        let item = &mut self.items[index];
        let merged = item.quantity() + added;
        match item.apply_quantity(merged) {
            Ok(true) => {
                let id = item.id().clone();
                let subtotal = item.subtotal();
                let affects_total = item.price_spec().is_computed() || item.price() > 0.0;
                touched.quantity |= added > 0;
                touched.total |= added > 0 && affects_total;
                self.events
                    .schedule(&self.scheduler, CartEvent::ItemQuantity { id: id.clone(), quantity: merged });
                self.events
                    .schedule(&self.scheduler, CartEvent::ItemTotal { id: id.clone(), subtotal });
                self.events
                    .schedule(&self.scheduler, CartEvent::ItemChange { id });
                self.events.schedule(&self.scheduler, CartEvent::Change);
            }
            Ok(false) => {
                // Non-countable target: the item already scheduled its own
                // soft error; mirror it at the cart level.
                let id = item.id().clone();
                let error = CartError::NotCountable { id: id.clone() };
                self.events
                    .schedule(&self.scheduler, CartEvent::ItemError { id, error: error.clone() });
                self.events
                    .schedule(&self.scheduler, CartEvent::Error { error });
            }
            Err(error) => {
                // A pre-locked item slipped in at construction time.
                let id = item.id().clone();
                self.events
                    .schedule(&self.scheduler, CartEvent::ItemError { id, error: error.clone() });
                self.events
                    .schedule(&self.scheduler, CartEvent::Error { error });
            }
        }
    }

    /// Removes one item by id. Absent ids are a silent no-op. Hard-fails
    /// when the cart is locked. Returns the removed item, ownership back to
    /// the caller.
    pub fn remove(&mut self, id: impl Into<Value>) -> CartResult<Option<Item>> {
        Ok(self.remove_all(vec![id.into()])?.pop())
    }

    /// Removes a batch by id, with coalesced aggregate events as in
    /// [`Cart::add_all`].
    pub fn remove_all(&mut self, ids: Vec<Value>) -> CartResult<Vec<Item>> {
        if self.locked {
            return Err(CartError::CartLocked);
        }
        let removed = self.remove_batch(ids);
        self.scheduler.drain();
        Ok(removed)
    }

    /// Removes the item at `index`; out-of-range is a no-op. Hard-fails when
    /// locked.
    pub fn remove_index(&mut self, index: usize) -> CartResult<Option<Item>> {
        if self.locked {
            return Err(CartError::CartLocked);
        }
        match self.items.get(index) {
            Some(item) => {
                let id = item.id().clone();
                self.remove(id)
            }
            None => Ok(None),
        }
    }

    /// Removes every item as a single batch, bracketed by `clearing` and
    /// `clear` events. Hard-fails when locked.
    pub fn clear(&mut self) -> CartResult<Vec<Item>> {
        if self.locked {
            return Err(CartError::CartLocked);
        }
        self.events.schedule(&self.scheduler, CartEvent::Clearing);
        let ids: Vec<Value> = self.items.iter().map(|item| item.id().clone()).collect();
        let removed = self.remove_batch(ids);
        self.events.schedule(&self.scheduler, CartEvent::Clear);
        self.scheduler.drain();
        Ok(removed)
    }

    /// Shared removal path: no lock check, no drain.
    fn remove_batch(&mut self, ids: Vec<Value>) -> Vec<Item> {
        let mut touched = AggregateTouch::default();
        let mut removed = Vec::new();

        for id in ids {
            let Some(index) = self.items.iter().position(|item| item.id() == &id) else {
                // Open question resolved as a silent no-op (see DESIGN.md).
                debug!(%id, "remove target not found, skipping");
                continue;
            };
            let mut item = self.items.remove(index);
            item.release();
            touched.record(&item);
            debug!(id = %item.id(), "item removed");
            self.events.schedule(
                &self.scheduler,
                CartEvent::ItemRemove {
                    item: item.to_json(),
                },
            );
            self.events.schedule(&self.scheduler, CartEvent::Change);
            removed.push(item);
        }

        self.schedule_aggregates(&touched);
        removed
    }

    /// Coalesced aggregate emission: at most one `count`/`quantity`/`total`
    /// per batch, carrying the settled aggregate.
    fn schedule_aggregates(&self, touched: &AggregateTouch) {
        if touched.count {
            self.events
                .schedule(&self.scheduler, CartEvent::Count { count: self.count() });
        }
        if touched.quantity {
            self.events.schedule(
                &self.scheduler,
                CartEvent::Quantity {
                    quantity: self.quantity(),
                },
            );
        }
        if touched.total {
            self.events
                .schedule(&self.scheduler, CartEvent::Total { total: self.total() });
        }
    }

    // -------------------------------------------------------------------------
    // Cart-Mediated Item Mutation
    // -------------------------------------------------------------------------
    //
    // Contained items are only reachable as `&Item`; these methods are the
    // route to their state. Each schedules the item's own events plus the
    // cart-level mirrors (`item:*` and the bare aggregate counterparts).

    /// Sets an item's quantity. Honors `remove_on_zero_quantity`. Hard-fails
    /// if the item is locked or absent; a non-countable target is a soft
    /// failure mirrored as `item:error` + `error`.
    pub fn set_quantity(&mut self, id: &Value, quantity: i64) -> CartResult<()> {
        let index = self.index_of(id)?;
        let item = &mut self.items[index];
        let changed = item.apply_quantity(quantity)?;
        let id = item.id().clone();
        let subtotal = item.subtotal();

        if !changed {
            let error = CartError::NotCountable { id: id.clone() };
            self.events
                .schedule(&self.scheduler, CartEvent::ItemError { id, error: error.clone() });
            self.events
                .schedule(&self.scheduler, CartEvent::Error { error });
            self.scheduler.drain();
            return Ok(());
        }

        self.events.schedule(
            &self.scheduler,
            CartEvent::ItemQuantity {
                id: id.clone(),
                quantity,
            },
        );
        self.events.schedule(
            &self.scheduler,
            CartEvent::Quantity {
                quantity: self.quantity(),
            },
        );
        self.events.schedule(
            &self.scheduler,
            CartEvent::ItemTotal {
                id: id.clone(),
                subtotal,
            },
        );
        self.events
            .schedule(&self.scheduler, CartEvent::Total { total: self.total() });
        self.events
            .schedule(&self.scheduler, CartEvent::ItemChange { id: id.clone() });
        self.events.schedule(&self.scheduler, CartEvent::Change);

        if quantity == 0 && self.remove_on_zero_quantity {
            debug!(%id, "quantity reached zero, removing item");
            self.remove_batch(vec![id]);
        }
        self.scheduler.drain();
        Ok(())
    }

    /// Sets an item's price. Hard-fails if the item is locked, signed, or
    /// absent.
    pub fn set_price(&mut self, id: &Value, price: impl Into<Price>) -> CartResult<()> {
        let index = self.index_of(id)?;
        let item = &mut self.items[index];
        item.apply_price(price.into())?;
        let id = item.id().clone();
        let subtotal = item.subtotal();

        self.events
            .schedule(&self.scheduler, CartEvent::ItemTotal { id: id.clone(), subtotal });
        self.events
            .schedule(&self.scheduler, CartEvent::Total { total: self.total() });
        self.events
            .schedule(&self.scheduler, CartEvent::ItemChange { id });
        self.events.schedule(&self.scheduler, CartEvent::Change);
        self.scheduler.drain();
        Ok(())
    }

    /// Sets one freeform property on an item. Hard-fails if the item is
    /// locked or absent.
    pub fn set_item_property(
        &mut self,
        id: &Value,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> CartResult<()> {
        let index = self.index_of(id)?;
        let item = &mut self.items[index];
        item.apply_property(key.into(), value.into())?;
        let id = item.id().clone();

        self.events
            .schedule(&self.scheduler, CartEvent::ItemChange { id });
        self.events.schedule(&self.scheduler, CartEvent::Change);
        self.scheduler.drain();
        Ok(())
    }

    fn index_of(&self, id: &Value) -> CartResult<usize> {
        self.items
            .iter()
            .position(|item| item.id() == id)
            .ok_or_else(|| CartError::ItemNotFound { id: id.clone() })
    }

    // -------------------------------------------------------------------------
    // Lock
    // -------------------------------------------------------------------------

    /// Locks or unlocks the cart, cascading to every item. A no-op (no
    /// events) when the flag is unchanged.
    pub fn lock(&mut self, locked: bool) {
        if self.apply_lock(locked) {
            self.scheduler.drain();
        }
    }

    fn apply_lock(&mut self, locked: bool) -> bool {
        if self.locked == locked {
            return false;
        }
        self.locked = locked;
        for item in &mut self.items {
            item.apply_lock(locked);
        }
        let event = if locked {
            CartEvent::Lock
        } else {
            CartEvent::Unlock
        };
        self.events.schedule(&self.scheduler, event);
        true
    }

    // -------------------------------------------------------------------------
    // Purchase Protocol
    // -------------------------------------------------------------------------

    /// Runs the purchase protocol: lock, `purchasing` event, hand the cart
    /// to the payment driver, and settle through [`Cart::finish_purchase`].
    ///
    /// Hard-fails if already locked. An empty cart or a missing driver is a
    /// soft failure: no lock transition, the error goes to the callback and
    /// the `error` event. A synchronous driver failure unlocks, reports, and
    /// re-raises the driver's error.
    pub fn purchase(&mut self, callback: Option<PurchaseCallback>) -> CartResult<()> {
        if self.locked {
            return Err(CartError::CartLocked);
        }
        if self.items.is_empty() {
            return self.refuse_purchase(CartError::EmptyCart, callback);
        }
        let Some(driver) = self.payment_driver.clone() else {
            return self.refuse_purchase(CartError::NoPaymentDriver, callback);
        };

        let attempt = Uuid::new_v4();
        debug!(%attempt, items = self.items.len(), "purchase started");
        self.apply_lock(true);
        self.pending_purchase = Some(PendingPurchase { attempt, callback });
        self.events.schedule(&self.scheduler, CartEvent::Purchasing);

        match driver(self) {
            Ok(DriverOutcome::Pending) => {
                debug!(%attempt, "driver pending, cart stays locked");
            }
            Ok(DriverOutcome::Completed(result)) => {
                self.finish_purchase(result);
            }
            Err(error) => {
                // Synchronous driver failure: settle, then re-raise.
                self.finish_purchase(Err(error.clone()));
                self.scheduler.drain();
                return Err(error);
            }
        }
        self.scheduler.drain();
        Ok(())
    }

    /// Delivers a deferred driver completion. Settling when nothing is
    /// pending (including a second settle) is a soft failure: an `error`
    /// event, never a second callback invocation.
    pub fn settle_purchase(&mut self, result: PurchaseResult) {
        self.finish_purchase(result);
        self.scheduler.drain();
    }

    /// The completion path, at most once per attempt: unlock first,
    /// unconditionally, then callback, then `purchase`/`error` event.
    fn finish_purchase(&mut self, result: PurchaseResult) {
        self.apply_lock(false);
        match self.pending_purchase.take() {
            None => {
                warn!("purchase completion with no attempt in flight");
                self.events.schedule(
                    &self.scheduler,
                    CartEvent::Error {
                        error: CartError::CompletionAlreadyCalled,
                    },
                );
            }
            Some(pending) => {
                match &result {
                    Ok(value) => {
                        debug!(attempt = %pending.attempt, "purchase completed");
                        self.events.schedule(
                            &self.scheduler,
                            CartEvent::Purchase {
                                result: value.clone(),
                            },
                        );
                    }
                    Err(error) => {
                        warn!(attempt = %pending.attempt, %error, "purchase failed");
                        self.events.schedule(
                            &self.scheduler,
                            CartEvent::Error {
                                error: error.clone(),
                            },
                        );
                    }
                }
                if let Some(callback) = pending.callback {
                    callback(result);
                }
            }
        }
    }

    /// Soft purchase refusal: no lock transition, error through both
    /// channels the caller can observe (callback and `error` event).
    fn refuse_purchase(
        &mut self,
        error: CartError,
        callback: Option<PurchaseCallback>,
    ) -> CartResult<()> {
        warn!(%error, "purchase refused");
        self.events
            .schedule(&self.scheduler, CartEvent::Error { error: error.clone() });
        if let Some(callback) = callback {
            callback(Err(error));
        }
        self.scheduler.drain();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Snapshot of the cart (`toJSON` form). Fails only if the signer fails
    /// (the failure is also reported through an `error` event).
    pub fn to_json(&self) -> CartResult<CartSnapshot> {
        let signature = self.signature()?;
        Ok(CartSnapshot {
            store: self.store.clone(),
            user: self.user.clone(),
            meta: self.meta.clone(),
            total: self.total(),
            taxable_total: self.taxable_total(),
            count: self.count(),
            quantity: self.quantity(),
            signature,
            items: self.items.iter().map(Item::to_json).collect(),
        })
    }
}

impl fmt::Debug for Cart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cart")
            .field("store", &self.store)
            .field("items", &self.items.len())
            .field("total", &self.total())
            .field("locked", &self.locked)
            .field("purchasing", &self.pending_purchase.is_some())
            .finish()
    }
}

/// JavaScript-style truthiness for `items_by` single-field filters.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map_or(false, |n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::payment::driver;
    use crate::signer::signer;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cart() -> Cart {
        Cart::new(CartOptions::default())
    }

    fn priced(product: &str, price: f64) -> ItemInit {
        ItemInit {
            product: Some(json!(product)),
            price: Some(price.into()),
            ..ItemInit::default()
        }
    }

    /// Records the kind of every observed event.
    fn watch(cart: &Cart, kinds: &[CartEventKind]) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for &kind in kinds {
            let log = Rc::clone(&log);
            cart.on(kind, move |event| {
                log.borrow_mut().push(format!("{:?}", event.kind()))
            })
            .unwrap();
        }
        log
    }

    fn errors_of(cart: &Cart) -> Rc<RefCell<Vec<CartError>>> {
        let errors = Rc::new(RefCell::new(Vec::new()));
        {
            let errors = Rc::clone(&errors);
            cart.on(CartEventKind::Error, move |event| {
                if let CartEvent::Error { error } = event {
                    errors.borrow_mut().push(error.clone());
                }
            })
            .unwrap();
        }
        errors
    }

    // -------------------------------------------------------------------------
    // Construction & Aggregates
    // -------------------------------------------------------------------------

    #[test]
    fn test_construction_with_items_preserves_order() {
        let cart = Cart::with_items(
            vec![priced("one", 1.0).into(), priced("two", 2.0).into()],
            CartOptions::default(),
        );
        assert_eq!(cart.len(), 2);
        assert_eq!(cart.item_at(0).unwrap().product(), &json!("one"));
        assert_eq!(cart.item_at(1).unwrap().product(), &json!("two"));
        assert!(cart.item_at(2).is_none());
    }

    #[test]
    fn test_aggregates() {
        let cart = Cart::with_items(
            vec![priced("a", 100.0).into(), priced("b", 250.0).into()],
            CartOptions::default(),
        );
        assert_eq!(cart.total(), 350.0);
        assert_eq!(cart.taxable_total(), 350.0);
        assert_eq!(cart.count(), 2);
        assert_eq!(cart.quantity(), 2);
    }

    #[test]
    fn test_aggregates_respect_flags() {
        let cart = Cart::with_items(
            vec![
                ItemInit {
                    quantity: Some(3),
                    ..priced("taxed", 10.0)
                }
                .into(),
                ItemInit {
                    taxable: Some(false),
                    ..priced("untaxed", 5.0)
                }
                .into(),
                ItemInit {
                    countable: Some(false),
                    ..priced("fee", 2.5)
                }
                .into(),
            ],
            CartOptions::default(),
        );
        assert_eq!(cart.total(), 30.0 + 5.0 + 2.5);
        assert_eq!(cart.taxable_total(), 30.0 + 2.5);
        assert_eq!(cart.count(), 2); // the fee is not countable
        assert_eq!(cart.quantity(), 4);
    }

    #[test]
    fn test_meta_is_mutable_and_observable() {
        let mut cart = Cart::new(CartOptions {
            meta: HashMap::from([("seed".to_string(), json!(1))]),
            ..CartOptions::default()
        });
        assert_eq!(cart.meta("seed"), Some(&json!(1)));

        let log = watch(&cart, &[CartEventKind::MetaChange, CartEventKind::Change]);
        cart.set_meta("foo", json!("bar")).set_meta("seed", json!(2));
        assert_eq!(cart.meta("foo"), Some(&json!("bar")));
        assert_eq!(cart.meta("seed"), Some(&json!(2)));
        assert_eq!(
            *log.borrow(),
            vec!["MetaChange", "Change", "MetaChange", "Change"]
        );
    }

    // -------------------------------------------------------------------------
    // Add
    // -------------------------------------------------------------------------

    #[test]
    fn test_add_accepts_items_and_bags() {
        let mut cart = cart();
        cart.add(Item::new(priced("built", 1.0))).unwrap();
        cart.add(priced("bag", 2.0)).unwrap();
        assert_eq!(cart.len(), 2);
        assert_eq!(cart.item_at(1).unwrap().product(), &json!("bag"));
    }

    #[test]
    fn test_add_emits_item_add_change_then_coalesced_aggregates() {
        let mut cart = cart();
        let log = watch(
            &cart,
            &[
                CartEventKind::ItemAdd,
                CartEventKind::Change,
                CartEventKind::Count,
                CartEventKind::Quantity,
                CartEventKind::Total,
            ],
        );
        cart.add_all(vec![priced("a", 1.0).into(), priced("b", 2.0).into()])
            .unwrap();
        // Two insertions, but each aggregate at most once for the batch.
        assert_eq!(
            *log.borrow(),
            vec![
                "ItemAdd", "Change", "ItemAdd", "Change", "Count", "Quantity", "Total"
            ]
        );
    }

    #[test]
    fn test_add_skips_aggregates_the_batch_does_not_affect() {
        let mut cart = cart();
        let log = watch(
            &cart,
            &[
                CartEventKind::Count,
                CartEventKind::Quantity,
                CartEventKind::Total,
            ],
        );
        // Non-countable: affects neither count, quantity nor total.
        cart.add(ItemInit {
            countable: Some(false),
            ..priced("fee", 5.0)
        })
        .unwrap();
        assert_eq!(log.borrow().len(), 0);

        // Countable with zero quantity: count only.
        cart.add(ItemInit {
            quantity: Some(0),
            ..priced("zero", 5.0)
        })
        .unwrap();
        assert_eq!(*log.borrow(), vec!["Count"]);
    }

    #[test]
    fn test_add_duplicate_id_is_a_soft_error() {
        let mut cart = cart();
        let errors = errors_of(&cart);
        cart.add(ItemInit {
            id: Some(json!("x")),
            ..priced("a", 1.0)
        })
        .unwrap();
        cart.add(ItemInit {
            id: Some(json!("x")),
            ..priced("b", 2.0)
        })
        .unwrap();
        assert_eq!(cart.len(), 1);
        assert!(matches!(
            errors.borrow()[0],
            CartError::DuplicateItem { .. }
        ));
    }

    #[test]
    fn test_dupe_mode_error_skips_and_reports() {
        let mut cart = cart();
        let errors = errors_of(&cart);
        cart.add(priced("coke", 2.5)).unwrap();
        cart.add(priced("coke", 2.5)).unwrap();
        assert_eq!(cart.count(), 1);
        assert_eq!(errors.borrow().len(), 1);
        assert!(matches!(
            errors.borrow()[0],
            CartError::DuplicateProduct { .. }
        ));
    }

    #[test]
    fn test_dupe_mode_error_applies_within_one_batch() {
        let mut cart = cart();
        let errors = errors_of(&cart);
        cart.add_all(vec![priced("coke", 2.5).into(), priced("coke", 2.5).into()])
            .unwrap();
        assert_eq!(cart.count(), 1);
        assert_eq!(errors.borrow().len(), 1);
    }

    #[test]
    fn test_dupe_mode_add_merges_quantity() {
        let mut cart = Cart::new(CartOptions {
            dupe_item_mode: DupeItemMode::Add,
            ..CartOptions::default()
        });
        cart.add(ItemInit {
            quantity: Some(2),
            ..priced("coke", 2.5)
        })
        .unwrap();
        cart.add(ItemInit {
            quantity: Some(3),
            ..priced("coke", 2.5)
        })
        .unwrap();
        assert_eq!(cart.count(), 1);
        assert_eq!(cart.item_at(0).unwrap().quantity(), 5);
        assert_eq!(cart.quantity(), 5);
    }

    #[test]
    fn test_dupe_mode_allow_inserts_anyway() {
        let mut cart = Cart::new(CartOptions {
            dupe_item_mode: DupeItemMode::Allow,
            ..CartOptions::default()
        });
        cart.add(priced("coke", 2.5)).unwrap();
        cart.add(priced("coke", 2.5)).unwrap();
        assert_eq!(cart.count(), 2);
    }

    #[test]
    fn test_add_fails_hard_when_locked() {
        let mut cart = cart();
        cart.lock(true);
        assert!(matches!(
            cart.add(priced("a", 1.0)),
            Err(CartError::CartLocked)
        ));
        assert_eq!(cart.len(), 0);
    }

    // -------------------------------------------------------------------------
    // Remove / Clear
    // -------------------------------------------------------------------------

    #[test]
    fn test_remove_by_id_returns_ownership() {
        let mut cart = cart();
        cart.add(ItemInit {
            id: Some(json!("x")),
            ..priced("a", 1.0)
        })
        .unwrap();
        let removed = cart.remove(json!("x")).unwrap().expect("item removed");
        assert_eq!(removed.id(), &json!("x"));
        assert_eq!(cart.len(), 0);
    }

    #[test]
    fn test_remove_of_absent_id_is_a_silent_noop() {
        let mut cart = cart();
        let errors = errors_of(&cart);
        cart.add(priced("a", 1.0)).unwrap();
        let removed = cart.remove(json!("nonexistent")).unwrap();
        assert!(removed.is_none());
        assert_eq!(cart.len(), 1);
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn test_remove_emits_item_remove_change_and_coalesced_aggregates() {
        let mut cart = Cart::with_items(
            vec![priced("a", 1.0).into(), priced("b", 2.0).into()],
            CartOptions::default(),
        );
        let ids: Vec<Value> = cart.items().iter().map(|i| i.id().clone()).collect();
        let log = watch(
            &cart,
            &[
                CartEventKind::ItemRemove,
                CartEventKind::Change,
                CartEventKind::Count,
                CartEventKind::Quantity,
                CartEventKind::Total,
            ],
        );
        cart.remove_all(ids).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "ItemRemove", "Change", "ItemRemove", "Change", "Count", "Quantity", "Total"
            ]
        );
    }

    #[test]
    fn test_remove_index() {
        let mut cart = Cart::with_items(
            vec![priced("a", 1.0).into(), priced("b", 2.0).into()],
            CartOptions::default(),
        );
        let removed = cart.remove_index(0).unwrap().expect("in range");
        assert_eq!(removed.product(), &json!("a"));
        assert_eq!(cart.len(), 1);
        assert!(cart.remove_index(5).unwrap().is_none());
    }

    #[test]
    fn test_remove_and_clear_fail_hard_when_locked() {
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], CartOptions::default());
        let id = cart.item_at(0).unwrap().id().clone();
        cart.lock(true);
        assert!(matches!(cart.remove(id), Err(CartError::CartLocked)));
        assert!(matches!(cart.remove_index(0), Err(CartError::CartLocked)));
        assert!(matches!(cart.clear(), Err(CartError::CartLocked)));
        assert_eq!(cart.len(), 1);
    }

    #[test]
    fn test_clear_brackets_the_batch_with_clearing_and_clear() {
        let mut cart = Cart::with_items(
            vec![priced("a", 1.0).into(), priced("b", 2.0).into()],
            CartOptions::default(),
        );
        let log = watch(
            &cart,
            &[
                CartEventKind::Clearing,
                CartEventKind::ItemRemove,
                CartEventKind::Clear,
            ],
        );
        cart.clear().unwrap();
        assert_eq!(cart.len(), 0);
        assert_eq!(
            *log.borrow(),
            vec!["Clearing", "ItemRemove", "ItemRemove", "Clear"]
        );
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    #[test]
    fn test_find_and_find_by() {
        let cart = Cart::with_items(
            vec![
                ItemInit {
                    id: Some(json!("one")),
                    ..priced("p1", 1.0)
                }
                .into(),
                ItemInit {
                    id: Some(json!("two")),
                    ..priced("p2", 2.0)
                }
                .into(),
            ],
            CartOptions::default(),
        );
        assert_eq!(cart.find(&json!("two")).unwrap().product(), &json!("p2"));
        assert!(cart.find(&json!("nonexistent")).is_none());
        assert_eq!(
            cart.find_by("product", &json!("p1")).unwrap().id(),
            &json!("one")
        );
        assert!(cart.find_by("product", &json!("nonexistent")).is_none());
    }

    #[test]
    fn test_items_by_filters() {
        let mut shippable_off = priced("digital", 5.0);
        shippable_off.shippable = Some(false);
        let mut with_color = priced("red-thing", 1.0);
        with_color.properties = Some(HashMap::from([("color".to_string(), json!("red"))]));

        let cart = Cart::with_items(
            vec![
                priced("plain", 2.0).into(),
                shippable_off.into(),
                with_color.into(),
            ],
            CartOptions::default(),
        );

        assert_eq!(cart.items_by(None, None).len(), 3);
        // Truthy filter: `color` is only set (and truthy) on one item.
        assert_eq!(cart.items_by(Some("color"), None).len(), 1);
        // Strict equality filter.
        assert_eq!(
            cart.items_by(Some("shippable"), Some(&json!(false))).len(),
            1
        );
    }

    #[test]
    fn test_tally_by() {
        let cart = Cart::with_items(
            vec![
                ItemInit {
                    quantity: Some(2),
                    ..priced("a", 10.0)
                }
                .into(),
                ItemInit {
                    taxable: Some(false),
                    quantity: Some(1),
                    ..priced("b", 5.0)
                }
                .into(),
            ],
            CartOptions::default(),
        );
        assert_eq!(cart.tally_by("subtotal", None, None), 25.0);
        assert_eq!(
            cart.tally_by("subtotal", Some("taxable"), Some(&json!(true))),
            20.0
        );
        assert_eq!(cart.tally_by("quantity", None, None), 3.0);
    }

    // -------------------------------------------------------------------------
    // Lock & Mediated Mutation
    // -------------------------------------------------------------------------

    #[test]
    fn test_lock_cascades_to_items_and_is_idempotent() {
        let mut cart = Cart::with_items(
            vec![priced("a", 1.0).into(), priced("b", 2.0).into()],
            CartOptions::default(),
        );
        let log = watch(&cart, &[CartEventKind::Lock, CartEventKind::Unlock]);

        cart.lock(true);
        assert!(cart.locked());
        assert!(cart.items().iter().all(Item::locked));
        cart.lock(true); // no second event
        cart.lock(false);
        assert!(!cart.locked());
        assert!(cart.items().iter().all(|item| !item.locked()));
        assert_eq!(*log.borrow(), vec!["Lock", "Unlock"]);
    }

    #[test]
    fn test_set_quantity_forwards_item_and_cart_events() {
        let mut cart = Cart::with_items(vec![priced("a", 10.0).into()], CartOptions::default());
        let id = cart.item_at(0).unwrap().id().clone();
        let log = watch(
            &cart,
            &[
                CartEventKind::ItemQuantity,
                CartEventKind::Quantity,
                CartEventKind::ItemTotal,
                CartEventKind::Total,
                CartEventKind::ItemChange,
                CartEventKind::Change,
            ],
        );
        // The contained item's own feed keeps working too.
        let item_log = Rc::new(RefCell::new(Vec::new()));
        {
            let item_log = Rc::clone(&item_log);
            cart.item_at(0)
                .unwrap()
                .on(crate::events::ItemEventKind::Quantity, move |event| {
                    item_log.borrow_mut().push(format!("{event:?}"))
                })
                .unwrap();
        }

        cart.set_quantity(&id, 3).unwrap();
        assert_eq!(cart.quantity(), 3);
        assert_eq!(cart.total(), 30.0);
        assert_eq!(
            *log.borrow(),
            vec![
                "ItemQuantity",
                "Quantity",
                "ItemTotal",
                "Total",
                "ItemChange",
                "Change"
            ]
        );
        assert_eq!(*item_log.borrow(), vec!["Quantity { quantity: 3 }"]);
    }

    #[test]
    fn test_set_quantity_on_non_countable_is_mirrored_as_soft_error() {
        let mut cart = Cart::with_items(
            vec![ItemInit {
                countable: Some(false),
                ..priced("fee", 5.0)
            }
            .into()],
            CartOptions::default(),
        );
        let id = cart.item_at(0).unwrap().id().clone();
        let errors = errors_of(&cart);
        cart.set_quantity(&id, 3).unwrap();
        assert_eq!(cart.item_at(0).unwrap().quantity(), 0);
        assert!(matches!(
            errors.borrow()[0],
            CartError::NotCountable { .. }
        ));
    }

    #[test]
    fn test_set_quantity_unknown_id_fails_hard() {
        let mut cart = cart();
        assert!(matches!(
            cart.set_quantity(&json!("nope"), 1),
            Err(CartError::ItemNotFound { .. })
        ));
    }

    #[test]
    fn test_remove_on_zero_quantity() {
        let mut cart = Cart::new(CartOptions {
            remove_on_zero_quantity: true,
            ..CartOptions::default()
        });
        cart.add(priced("a", 1.0)).unwrap();
        let id = cart.item_at(0).unwrap().id().clone();
        let log = watch(&cart, &[CartEventKind::ItemRemove]);

        cart.set_quantity(&id, 0).unwrap();
        assert_eq!(cart.len(), 0);
        assert_eq!(*log.borrow(), vec!["ItemRemove"]);
    }

    #[test]
    fn test_set_price_respects_item_invariants() {
        let mut cart = Cart::with_items(
            vec![ItemInit {
                signature: Some(json!("sig")),
                ..priced("signed", 10.0)
            }
            .into()],
            CartOptions::default(),
        );
        let id = cart.item_at(0).unwrap().id().clone();
        assert!(matches!(
            cart.set_price(&id, 20.0),
            Err(CartError::PriceSigned { .. })
        ));
        assert_eq!(cart.item_at(0).unwrap().price(), 10.0);
    }

    #[test]
    fn test_set_item_property_emits_change_pair() {
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], CartOptions::default());
        let id = cart.item_at(0).unwrap().id().clone();
        let log = watch(&cart, &[CartEventKind::ItemChange, CartEventKind::Change]);
        cart.set_item_property(&id, "note", json!("gift")).unwrap();
        assert_eq!(
            cart.item_at(0).unwrap().property("note"),
            Some(&json!("gift"))
        );
        assert_eq!(*log.borrow(), vec!["ItemChange", "Change"]);
    }

    // -------------------------------------------------------------------------
    // Purchase Protocol
    // -------------------------------------------------------------------------

    fn capture_callback() -> (PurchaseCallback, Rc<RefCell<Vec<PurchaseResult>>>) {
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&results);
        let callback: PurchaseCallback = Box::new(move |result| sink.borrow_mut().push(result));
        (callback, results)
    }

    #[test]
    fn test_purchase_on_empty_cart_never_locks() {
        let mut cart = cart();
        let errors = errors_of(&cart);
        let (callback, results) = capture_callback();

        cart.purchase(Some(callback)).unwrap();
        assert!(!cart.locked());
        assert_eq!(results.borrow().len(), 1);
        assert!(matches!(
            results.borrow()[0],
            Err(CartError::EmptyCart)
        ));
        assert!(matches!(errors.borrow()[0], CartError::EmptyCart));
    }

    #[test]
    fn test_purchase_without_driver_is_a_soft_failure() {
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], CartOptions::default());
        let errors = errors_of(&cart);
        cart.purchase(None).unwrap();
        assert!(!cart.locked());
        assert!(matches!(errors.borrow()[0], CartError::NoPaymentDriver));
    }

    #[test]
    fn test_purchase_locks_during_driver_and_unlocks_after_success() {
        let observed_locked = Rc::new(RefCell::new((false, false)));
        let inside = Rc::clone(&observed_locked);
        let options = CartOptions {
            payment_driver: Some(driver(move |cart| {
                *inside.borrow_mut() = (
                    cart.locked(),
                    cart.items().iter().all(Item::locked),
                );
                Ok(DriverOutcome::Completed(Ok(json!(true))))
            })),
            ..CartOptions::default()
        };
        let mut cart = Cart::with_items(
            vec![priced("a", 1.0).into(), priced("b", 2.0).into()],
            options,
        );
        let log = watch(&cart, &[CartEventKind::Purchasing, CartEventKind::Purchase]);
        let (callback, results) = capture_callback();

        cart.purchase(Some(callback)).unwrap();

        assert_eq!(*observed_locked.borrow(), (true, true));
        assert!(!cart.locked());
        assert!(cart.items().iter().all(|item| !item.locked()));
        assert_eq!(results.borrow().len(), 1);
        assert_eq!(results.borrow()[0], Ok(json!(true)));
        assert_eq!(*log.borrow(), vec!["Purchasing", "Purchase"]);
    }

    #[test]
    fn test_purchase_fails_hard_when_already_locked() {
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], CartOptions::default());
        cart.lock(true);
        assert!(matches!(
            cart.purchase(None),
            Err(CartError::CartLocked)
        ));
        assert!(cart.locked()); // no auto unlock
    }

    #[test]
    fn test_pending_driver_keeps_cart_locked_until_settle() {
        let options = CartOptions {
            payment_driver: Some(driver(|_| Ok(DriverOutcome::Pending))),
            ..CartOptions::default()
        };
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], options);
        let (callback, results) = capture_callback();

        cart.purchase(Some(callback)).unwrap();
        assert!(cart.locked());
        assert!(results.borrow().is_empty());

        cart.settle_purchase(Ok(json!("receipt-42")));
        assert!(!cart.locked());
        assert_eq!(results.borrow()[0], Ok(json!("receipt-42")));
    }

    #[test]
    fn test_double_settle_invokes_callback_exactly_once() {
        let options = CartOptions {
            payment_driver: Some(driver(|_| Ok(DriverOutcome::Pending))),
            ..CartOptions::default()
        };
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], options);
        let errors = errors_of(&cart);
        let (callback, results) = capture_callback();

        cart.purchase(Some(callback)).unwrap();
        cart.settle_purchase(Ok(json!(true)));
        cart.settle_purchase(Ok(json!(true)));

        assert_eq!(results.borrow().len(), 1);
        assert!(matches!(
            errors.borrow()[0],
            CartError::CompletionAlreadyCalled
        ));
    }

    #[test]
    fn test_synchronous_driver_failure_unlocks_reports_and_reraises() {
        let failure = CartError::Driver {
            message: "card declined".to_string(),
        };
        let raised = failure.clone();
        let options = CartOptions {
            payment_driver: Some(driver(move |_| Err(raised.clone()))),
            ..CartOptions::default()
        };
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], options);
        let errors = errors_of(&cart);
        let (callback, results) = capture_callback();

        let result = cart.purchase(Some(callback));
        assert_eq!(result, Err(failure.clone()));
        assert!(!cart.locked());
        assert_eq!(results.borrow()[0], Err(failure.clone()));
        assert_eq!(errors.borrow()[0], failure);
    }

    #[test]
    fn test_driver_reported_failure_does_not_reraise() {
        let failure = CartError::Driver {
            message: "insufficient funds".to_string(),
        };
        let reported = failure.clone();
        let options = CartOptions {
            payment_driver: Some(driver(move |_| {
                Ok(DriverOutcome::Completed(Err(reported.clone())))
            })),
            ..CartOptions::default()
        };
        let mut cart = Cart::with_items(vec![priced("a", 1.0).into()], options);
        let errors = errors_of(&cart);

        assert!(cart.purchase(None).is_ok());
        assert!(!cart.locked());
        assert_eq!(errors.borrow()[0], failure);
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    #[test]
    fn test_to_json_shape() {
        let mut cart = Cart::with_items(
            vec![priced("a", 100.0).into(), priced("b", 250.0).into()],
            CartOptions {
                store: Some("test-store".to_string()),
                user: Some("user-1".to_string()),
                ..CartOptions::default()
            },
        );
        cart.set_meta("channel", json!("web"));
        let snapshot = cart.to_json().unwrap();
        assert_eq!(snapshot.store.as_deref(), Some("test-store"));
        assert_eq!(snapshot.user.as_deref(), Some("user-1"));
        assert_eq!(snapshot.meta.get("channel"), Some(&json!("web")));
        assert_eq!(snapshot.total, 350.0);
        assert_eq!(snapshot.taxable_total, 350.0);
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.quantity, 2);
        assert!(snapshot.signature.is_string());
        assert_eq!(snapshot.items.len(), 2);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_products_in_order() {
        let cart = Cart::with_items(
            vec![priced("item1", 1.0).into(), priced("item2", 2.0).into()],
            CartOptions::default(),
        );
        let json = serde_json::to_value(cart.to_json().unwrap()).unwrap();
        let rebuilt = Cart::from_value(json, None, None).unwrap();

        assert_eq!(rebuilt.len(), cart.len());
        for (a, b) in cart.items().iter().zip(rebuilt.items()) {
            assert_eq!(a.product(), b.product());
        }
    }

    #[test]
    fn test_from_value_rejects_unknown_keys() {
        let mut json = serde_json::to_value(cart().to_json().unwrap()).unwrap();
        json.as_object_mut()
            .unwrap()
            .insert("doesNotExist".to_string(), json!(1));
        let error = Cart::from_value(json, None, None).unwrap_err();
        assert!(matches!(error, CartError::InvalidSnapshot { .. }));
    }

    #[test]
    fn test_from_overrides_signer() {
        let cart = Cart::with_items(vec![priced("a", 1.0).into()], CartOptions::default());
        let rebuilt = Cart::from(
            cart.to_json().unwrap(),
            Some(signer(|_| Ok(json!("injected")))),
            None,
        )
        .unwrap();
        assert_eq!(rebuilt.signature().unwrap(), json!("injected"));
    }

    #[test]
    fn test_failing_signer_reports_then_reraises() {
        let cart = Cart::new(CartOptions {
            signer: Some(signer(|_| {
                Err(CartError::Signer {
                    message: "keystore unavailable".to_string(),
                })
            })),
            ..CartOptions::default()
        });
        let errors = errors_of(&cart);
        let result = cart.signature();
        assert!(matches!(result, Err(CartError::Signer { .. })));
        assert!(matches!(errors.borrow()[0], CartError::Signer { .. }));
    }
}
