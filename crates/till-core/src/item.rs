//! # Item State Machine
//!
//! A single cart line entry: identity, pricing (fixed or computed), quantity,
//! freeform properties, and a lock flag.
//!
//! ## Mutation Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Item Mutation Rules                                 │
//! │                                                                         │
//! │  set_price      locked ──► hard error                                   │
//! │                 signed ──► hard error (signature makes price immutable) │
//! │                 else   ──► price, total, change events                  │
//! │                                                                         │
//! │  set_quantity   locked        ──► hard error                            │
//! │                 not countable ──► soft `error` event, no mutation       │
//! │                 else          ──► quantity, total, change events        │
//! │                                                                         │
//! │  set_property   locked ──► hard error                                   │
//! │                 else   ──► property:change, change events               │
//! │                                                                         │
//! │  lock(flag)     unchanged ──► no-op (no duplicate lock/unlock events)   │
//! │                 else      ──► lock / unlock event                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Once an item is added to a [`Cart`](crate::cart::Cart) the cart owns it
//! exclusively and mutation goes through the cart's mediated setters; the
//! rules above still apply.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{CartError, CartResult};
use crate::events::{Emitter, ItemEvent, ItemEventKind, ListenerId};
use crate::scheduler::Scheduler;

/// Process-global counter for auto-assigned item ids: unique and strictly
/// increasing across the process.
static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

fn next_auto_id() -> Value {
    Value::from(NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed))
}

/// Converts an `f64` to a JSON value, mapping non-finite values to null.
pub(crate) fn number_value(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

// =============================================================================
// Price
// =============================================================================

/// A price handler: a pure function of the item, evaluated on every read.
pub type PriceFn = Rc<dyn Fn(&Item) -> f64>;

/// An item's price: a fixed number or a named handler computing it on demand.
///
/// Computed prices are evaluated lazily on **every** read and never cached;
/// memoization is the handler's responsibility, so handlers must be pure and
/// cheap. In a snapshot a computed price serializes as its handler name.
#[derive(Clone)]
pub enum Price {
    /// A fixed price.
    Fixed(f64),
    /// A price computed from the item on every read.
    Computed { name: String, handler: PriceFn },
}

impl Price {
    /// Creates a computed price from a handler name and function.
    pub fn computed(name: impl Into<String>, handler: impl Fn(&Item) -> f64 + 'static) -> Self {
        Price::Computed {
            name: name.into(),
            handler: Rc::new(handler),
        }
    }

    /// Evaluates the price for `item`.
    fn evaluate(&self, item: &Item) -> f64 {
        match self {
            Price::Fixed(value) => *value,
            Price::Computed { handler, .. } => handler(item),
        }
    }

    /// True for handler-backed prices.
    pub fn is_computed(&self) -> bool {
        matches!(self, Price::Computed { .. })
    }

    /// The snapshot form: the number, or the handler name for computed
    /// prices (code is not serializable).
    pub fn to_value(&self) -> Value {
        match self {
            Price::Fixed(value) => number_value(*value),
            Price::Computed { name, .. } => Value::String(name.clone()),
        }
    }
}

impl Default for Price {
    /// The original model defaults an unpriced item to the maximum
    /// representable number so it is never accidentally free.
    fn default() -> Self {
        Price::Fixed(f64::MAX)
    }
}

impl From<f64> for Price {
    fn from(value: f64) -> Self {
        Price::Fixed(value)
    }
}

impl fmt::Debug for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Price::Computed { name, .. } => f.debug_struct("Computed").field("name", name).finish(),
        }
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Price::Fixed(value) => serializer.serialize_f64(*value),
            Price::Computed { name, .. } => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(number) => number
                .as_f64()
                .map(Price::Fixed)
                .ok_or_else(|| D::Error::custom("price is not representable as f64")),
            Value::String(name) => Err(D::Error::custom(format!(
                "price handler '{name}' cannot be restored from a snapshot"
            ))),
            other => Err(D::Error::custom(format!(
                "price must be a number, got {other}"
            ))),
        }
    }
}

// =============================================================================
// Item Init
// =============================================================================

/// The property bag accepted by [`Item::new`] and by carts in place of a
/// built [`Item`].
///
/// Unrecognized keys in a deserialized bag are a construction-time failure,
/// not a silent default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ItemInit {
    /// Stable identity; auto-assigned (unique, strictly increasing) if absent.
    pub id: Option<Value>,
    /// Product key used for duplicate detection; defaults to the id.
    pub product: Option<Value>,
    /// Fixed price, or a computed price built with [`Price::computed`].
    pub price: Option<Price>,
    /// Integer count; defaults to 1.
    pub quantity: Option<i64>,
    /// Non-null marks the item signed (price immutable).
    pub signature: Option<Value>,
    /// Opaque grouping tag.
    pub group: Option<Value>,
    pub shippable: Option<bool>,
    pub countable: Option<bool>,
    pub taxable: Option<bool>,
    /// Freeform key/value properties.
    pub properties: Option<HashMap<String, Value>>,
}

// =============================================================================
// Item Snapshot
// =============================================================================

/// Serializable snapshot of an [`Item`] (`toJSON` form).
///
/// `price` is a number, or the handler name when the price is computed.
/// `quantity` and `subtotal` are the effective values (a non-countable item
/// snapshots quantity 0 and subtotal equal to its raw price).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemSnapshot {
    pub product: Value,
    pub price: Value,
    pub group: Value,
    pub taxable: bool,
    pub countable: bool,
    pub shippable: bool,
    pub quantity: i64,
    pub signature: Value,
    pub subtotal: f64,
    pub properties: HashMap<String, Value>,
}

// =============================================================================
// Item
// =============================================================================

/// A single cart line entry.
///
/// Composes an event feed ([`Item::on`]) whose delivery is deferred: a batch
/// of synchronous mutations delivers its events once the mutating call
/// completes, in schedule order.
pub struct Item {
    id: Value,
    product: Value,
    price: Price,
    raw_quantity: i64,
    signature: Value,
    group: Value,
    shippable: bool,
    countable: bool,
    taxable: bool,
    properties: HashMap<String, Value>,
    locked: bool,
    created_at: DateTime<Utc>,
    events: Emitter<ItemEvent>,
    scheduler: Scheduler,
}

impl Item {
    /// Builds an item from a property bag. Missing fields take the defaults
    /// documented on [`ItemInit`].
    pub fn new(init: ItemInit) -> Self {
        let id = init.id.unwrap_or_else(next_auto_id);
        let product = init.product.unwrap_or_else(|| id.clone());
        Item {
            id,
            product,
            price: init.price.unwrap_or_default(),
            raw_quantity: init.quantity.unwrap_or(1),
            signature: init.signature.unwrap_or(Value::Null),
            group: init.group.unwrap_or(Value::Null),
            shippable: init.shippable.unwrap_or(true),
            countable: init.countable.unwrap_or(true),
            taxable: init.taxable.unwrap_or(true),
            properties: init.properties.unwrap_or_default(),
            locked: false,
            created_at: Utc::now(),
            events: Emitter::new(),
            scheduler: Scheduler::new(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: ItemSnapshot) -> CartResult<Self> {
        let price = match snapshot.price {
            Value::Number(number) => number
                .as_f64()
                .map(Price::Fixed)
                .ok_or_else(|| CartError::InvalidSnapshot {
                    message: "price is not representable as f64".to_string(),
                })?,
            Value::String(name) => return Err(CartError::PriceHandlerNotRestorable { name }),
            other => {
                return Err(CartError::InvalidSnapshot {
                    message: format!("price must be a number, got {other}"),
                })
            }
        };
        Ok(Item::new(ItemInit {
            product: Some(snapshot.product),
            price: Some(price),
            quantity: Some(snapshot.quantity),
            signature: Some(snapshot.signature),
            group: Some(snapshot.group),
            shippable: Some(snapshot.shippable),
            countable: Some(snapshot.countable),
            taxable: Some(snapshot.taxable),
            properties: Some(snapshot.properties),
            ..ItemInit::default()
        }))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn product(&self) -> &Value {
        &self.product
    }

    /// The effective price. Computed prices are evaluated on every call.
    pub fn price(&self) -> f64 {
        self.price.evaluate(self)
    }

    /// The price variant (fixed or computed).
    pub fn price_spec(&self) -> &Price {
        &self.price
    }

    /// The effective quantity: 0 for non-countable items.
    pub fn quantity(&self) -> i64 {
        if self.countable {
            self.raw_quantity
        } else {
            0
        }
    }

    pub fn signature(&self) -> &Value {
        &self.signature
    }

    /// True when the signature is non-null; a signed item's price can never
    /// change.
    pub fn is_signed(&self) -> bool {
        !self.signature.is_null()
    }

    pub fn group(&self) -> &Value {
        &self.group
    }

    pub fn shippable(&self) -> bool {
        self.shippable
    }

    pub fn countable(&self) -> bool {
        self.countable
    }

    pub fn taxable(&self) -> bool {
        self.taxable
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `price * quantity` for countable items, the raw price otherwise.
    pub fn subtotal(&self) -> f64 {
        if self.countable {
            self.price() * self.raw_quantity as f64
        } else {
            self.price()
        }
    }

    /// A copy of the freeform properties.
    pub fn properties(&self) -> HashMap<String, Value> {
        self.properties.clone()
    }

    /// One freeform property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Looks up a built-in field or a freeform property by name. Used by the
    /// cart's `find_by`/`items_by`/`tally_by` scans.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.clone()),
            "product" => Some(self.product.clone()),
            "price" => Some(number_value(self.price())),
            "quantity" => Some(Value::from(self.quantity())),
            "subtotal" => Some(number_value(self.subtotal())),
            "signature" => Some(self.signature.clone()),
            "group" => Some(self.group.clone()),
            "shippable" => Some(Value::Bool(self.shippable)),
            "countable" => Some(Value::Bool(self.countable)),
            "taxable" => Some(Value::Bool(self.taxable)),
            "locked" => Some(Value::Bool(self.locked)),
            _ => self.properties.get(name).cloned(),
        }
    }

    // -------------------------------------------------------------------------
    // Event Feed
    // -------------------------------------------------------------------------

    /// Registers a listener. Fails once the kind holds
    /// [`MAX_EVENT_LISTENERS`](crate::events::MAX_EVENT_LISTENERS) listeners.
    pub fn on<F>(&self, kind: ItemEventKind, handler: F) -> CartResult<ListenerId>
    where
        F: FnMut(&ItemEvent) + 'static,
    {
        self.events.on(kind, handler)
    }

    /// Registers a listener that fires at most once.
    pub fn once<F>(&self, kind: ItemEventKind, handler: F) -> CartResult<ListenerId>
    where
        F: FnMut(&ItemEvent) + 'static,
    {
        self.events.once(kind, handler)
    }

    /// Removes one listener.
    pub fn off(&self, kind: ItemEventKind, id: ListenerId) -> bool {
        self.events.off(kind, id)
    }

    // -------------------------------------------------------------------------
    // Mutators
    // -------------------------------------------------------------------------

    /// Sets the price. Hard-fails if the item is locked or signed.
    pub fn set_price(&mut self, price: impl Into<Price>) -> CartResult<()> {
        self.apply_price(price.into())?;
        self.scheduler.drain();
        Ok(())
    }

    /// Sets the quantity. Hard-fails if locked; on a non-countable item this
    /// is a soft failure reported through an `error` event, with no mutation.
    pub fn set_quantity(&mut self, quantity: i64) -> CartResult<()> {
        self.apply_quantity(quantity)?;
        self.scheduler.drain();
        Ok(())
    }

    /// Sets one property. Hard-fails if locked. Returns the item for call
    /// chaining.
    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> CartResult<&mut Self> {
        self.apply_property(key.into(), value.into())?;
        self.scheduler.drain();
        Ok(self)
    }

    /// Locks or unlocks the item. A no-op (no event) when the flag is
    /// unchanged.
    pub fn lock(&mut self, locked: bool) {
        self.apply_lock(locked);
        self.scheduler.drain();
    }

    /// Snapshot of the item (`toJSON` form).
    pub fn to_json(&self) -> ItemSnapshot {
        ItemSnapshot {
            product: self.product.clone(),
            price: self.price.to_value(),
            group: self.group.clone(),
            taxable: self.taxable,
            countable: self.countable,
            shippable: self.shippable,
            quantity: self.quantity(),
            signature: self.signature.clone(),
            subtotal: self.subtotal(),
            properties: self.properties.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Crate-internal plumbing (used by Cart)
    // -------------------------------------------------------------------------

    /// Moves the item onto `scheduler` so its events share the owning cart's
    /// queue. Pending events migrate implicitly only when the queues already
    /// match; callers adopt before mutating.
    pub(crate) fn adopt(&mut self, scheduler: Scheduler) {
        if !self.scheduler.same_queue(&scheduler) {
            self.scheduler = scheduler;
        }
    }

    /// Detaches the item from a cart's queue (after removal).
    pub(crate) fn release(&mut self) {
        self.scheduler = Scheduler::new();
    }

    pub(crate) fn apply_price(&mut self, price: Price) -> CartResult<()> {
        if self.locked {
            return Err(CartError::ItemLocked {
                id: self.id.clone(),
            });
        }
        if self.is_signed() {
            return Err(CartError::PriceSigned {
                id: self.id.clone(),
            });
        }
        self.price = price;
        self.events
            .schedule(&self.scheduler, ItemEvent::Price { price: self.price() });
        self.events.schedule(
            &self.scheduler,
            ItemEvent::Total {
                subtotal: self.subtotal(),
            },
        );
        self.events.schedule(&self.scheduler, ItemEvent::Change);
        Ok(())
    }

    /// Returns `Ok(true)` when the quantity changed, `Ok(false)` when the
    /// item is non-countable (soft failure already scheduled).
    pub(crate) fn apply_quantity(&mut self, quantity: i64) -> CartResult<bool> {
        if self.locked {
            return Err(CartError::ItemLocked {
                id: self.id.clone(),
            });
        }
        if !self.countable {
            let error = CartError::NotCountable {
                id: self.id.clone(),
            };
            tracing::warn!(id = %self.id, "quantity mutation on non-countable item");
            self.events
                .schedule(&self.scheduler, ItemEvent::Error { error });
            return Ok(false);
        }
        self.raw_quantity = quantity;
        self.events
            .schedule(&self.scheduler, ItemEvent::Quantity { quantity });
        self.events.schedule(
            &self.scheduler,
            ItemEvent::Total {
                subtotal: self.subtotal(),
            },
        );
        self.events.schedule(&self.scheduler, ItemEvent::Change);
        Ok(true)
    }

    pub(crate) fn apply_property(&mut self, key: String, value: Value) -> CartResult<()> {
        if self.locked {
            return Err(CartError::ItemLocked {
                id: self.id.clone(),
            });
        }
        let previous = self.properties.insert(key.clone(), value.clone());
        self.events.schedule(
            &self.scheduler,
            ItemEvent::PropertyChange {
                key,
                value,
                previous,
            },
        );
        self.events.schedule(&self.scheduler, ItemEvent::Change);
        Ok(())
    }

    /// Returns true when the flag actually flipped.
    pub(crate) fn apply_lock(&mut self, locked: bool) -> bool {
        if self.locked == locked {
            return false;
        }
        self.locked = locked;
        let event = if locked {
            ItemEvent::Lock
        } else {
            ItemEvent::Unlock
        };
        self.events.schedule(&self.scheduler, event);
        true
    }
}

impl Default for Item {
    fn default() -> Self {
        Item::new(ItemInit::default())
    }
}

impl From<ItemInit> for Item {
    fn from(init: ItemInit) -> Self {
        Item::new(init)
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("product", &self.product)
            .field("price", &self.price)
            .field("quantity", &self.quantity())
            .field("signed", &self.is_signed())
            .field("locked", &self.locked)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
