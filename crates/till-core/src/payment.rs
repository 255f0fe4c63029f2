//! # Payment Driver Interface
//!
//! The injected collaborator that performs the actual payment. The core owns
//! no gateway integration; it hands the locked cart to the driver and waits
//! for exactly one completion.
//!
//! ## Purchase Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Purchase Protocol                                  │
//! │                                                                         │
//! │   unlocked ──purchase()──► purchasing (cart + items locked)             │
//! │                                 │                                       │
//! │          ┌──────────────────────┼──────────────────────┐                │
//! │          ▼                      ▼                      ▼                │
//! │   driver returns         driver returns         driver returns         │
//! │   Completed(result)      Pending                Err(e)                 │
//! │          │                      │                      │                │
//! │          │            settle_purchase(result)          │                │
//! │          │            (called by the application       │                │
//! │          │             when the gateway answers)       │                │
//! │          ▼                      ▼                      ▼                │
//! │   unlock, callback,      unlock, callback,      unlock, callback,      │
//! │   purchase/error event   purchase/error event   error event, and       │
//! │                                                 purchase() re-raises e │
//! │                                                                         │
//! │   The completion path runs AT MOST ONCE per attempt; a second           │
//! │   settle emits an `error` event instead of re-invoking the callback.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no timeout or abort path: a `Pending` driver keeps the cart
//! locked until the application settles. Cancellation is a known design gap
//! of the protocol, carried over deliberately.

use std::rc::Rc;

use serde_json::Value;

use crate::cart::Cart;
use crate::error::CartError;

/// The value a successful purchase resolves to (gateway receipt, etc.).
pub type PurchaseResult = Result<Value, CartError>;

/// Caller callback invoked exactly once per purchase attempt.
pub type PurchaseCallback = Box<dyn FnOnce(PurchaseResult)>;

/// What a payment driver did with the attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverOutcome {
    /// The driver finished synchronously; the cart unlocks before
    /// `purchase` returns.
    Completed(PurchaseResult),
    /// The driver will answer later; the cart stays locked until the
    /// application calls [`Cart::settle_purchase`].
    Pending,
}

/// The injected payment driver.
///
/// Invoked with the locked cart. Returning `Err` is the synchronous-failure
/// path: the cart unlocks, the failure is reported through the callback and
/// an `error` event, and `purchase` re-raises the error to its caller.
pub type PaymentDriver = Rc<dyn Fn(&mut Cart) -> Result<DriverOutcome, CartError>>;

/// Wraps a closure as a [`PaymentDriver`].
pub fn driver<F>(f: F) -> PaymentDriver
where
    F: Fn(&mut Cart) -> Result<DriverOutcome, CartError> + 'static,
{
    Rc::new(f)
}
