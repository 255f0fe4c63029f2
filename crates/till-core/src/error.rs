//! # Error Types
//!
//! Domain-specific error types for till-core.
//!
//! ## Two Error Channels
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Error Channels                                    │
//! │                                                                         │
//! │  HARD failures ──► Err(CartError) from the called operation             │
//! │    API misuse: mutating a locked entity, unknown snapshot keys,         │
//! │    listener capacity, purchase while locked. The mutation never         │
//! │    happens and the caller must handle the Result.                       │
//! │                                                                         │
//! │  SOFT failures ──► `error` event on the entity's feed                   │
//! │    Business-rule violations a reactive UI observes: duplicate           │
//! │    product on add, quantity on a non-countable item, empty-cart         │
//! │    purchase, double purchase completion. The operation continues        │
//! │    or no-ops; the call stack does not unwind.                           │
//! │                                                                         │
//! │  The same enum serves both channels; the channel is decided by the      │
//! │  operation, never by the variant alone.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (item id, option key, etc.)
//! 3. Errors are enum variants, never String
//! 4. `Clone` so soft failures can travel inside event payloads

use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Cart Error
// =============================================================================

/// Errors raised by the cart data model.
///
/// Variants marked *hard* fail the calling operation synchronously.
/// Variants marked *soft* are reported through `error` events while the
/// operation continues or silently no-ops.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CartError {
    /// *Hard.* The cart is locked (e.g. a purchase is in flight) and the
    /// requested mutation is not allowed.
    #[error("cart is locked")]
    CartLocked,

    /// *Hard.* The item is locked and price/quantity/property mutation is
    /// not allowed.
    #[error("item {id} is locked")]
    ItemLocked { id: Value },

    /// *Hard.* The item carries a non-null signature; its price is immutable.
    #[error("item {id} is signed, price is immutable")]
    PriceSigned { id: Value },

    /// *Hard.* A cart-mediated mutator was given an id that is not in the
    /// cart.
    #[error("item {id} was not found in cart")]
    ItemNotFound { id: Value },

    /// *Hard.* Listener capacity for one event kind was exhausted.
    /// Registration fails loudly rather than silently dropping the listener.
    #[error("maximum event listeners reached for {event}")]
    TooManyListeners { event: String },

    /// *Hard.* A snapshot or property bag carried an unrecognized key, or was
    /// otherwise malformed. Construction is fail-fast, not defaulting.
    #[error("invalid cart snapshot: {message}")]
    InvalidSnapshot { message: String },

    /// *Hard.* A snapshot serialized a computed price as its handler name;
    /// code is not serializable, so the item cannot be rebuilt from it.
    #[error("price handler '{name}' cannot be restored from a snapshot")]
    PriceHandlerNotRestorable { name: String },

    /// *Soft.* An item with the same id is already in the cart.
    #[error("item {id} already exists in cart")]
    DuplicateItem { id: Value },

    /// *Soft.* An item with the same product is already in the cart and the
    /// dedup policy is `Error`.
    #[error("product {product} already exists in cart (item {existing_id})")]
    DuplicateProduct {
        product: Value,
        existing_id: Value,
        incoming_id: Value,
    },

    /// *Soft.* Quantity mutation was attempted on a non-countable item.
    #[error("item {id} is not countable, quantity is fixed at zero")]
    NotCountable { id: Value },

    /// *Soft.* Purchase was attempted on an empty cart.
    #[error("cannot purchase an empty cart")]
    EmptyCart,

    /// *Soft.* Purchase was attempted with no payment driver configured.
    #[error("no payment driver configured")]
    NoPaymentDriver,

    /// *Soft.* A purchase completion was delivered after the attempt had
    /// already been completed (or when no purchase was in flight).
    #[error("purchase completion already called")]
    CompletionAlreadyCalled,

    /// Signer function failure. Reported through an `error` event, then
    /// re-raised to the caller.
    #[error("signer failed: {message}")]
    Signer { message: String },

    /// Payment driver failure. A synchronous driver failure is reported
    /// through an `error` event and the callback, then re-raised from
    /// `purchase`; an asynchronous one stops at the event and the callback.
    #[error("payment driver failed: {message}")]
    Driver { message: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CartError.
pub type CartResult<T> = Result<T, CartError>;

// =============================================================================
// Unit Tests
// =============================================================================
