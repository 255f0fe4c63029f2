//! # till-core: Pure Shopping-Cart Logic
//!
//! This crate is the **heart** of Till. It contains the cart state machine
//! as pure in-memory logic with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Till Architecture                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     Host Application                            │   │
//! │  │    Catalog UI ──► Cart UI ──► Checkout UI ──► Receipt UI       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ till-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   item    │  │   cart    │  │  events   │  │ scheduler │  │   │
//! │  │   │   Item    │  │   Cart    │  │  Emitter  │  │ deferred  │  │   │
//! │  │   │   Price   │  │ aggregates│  │ ItemEvent │  │  queue    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐                 │   │
//! │  │   │  payment  │  │  signer   │  │   error   │                 │   │
//! │  │   │  drivers  │  │ signatures│  │ CartError │                 │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘                 │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • IN-MEMORY ONLY           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ injected collaborators                 │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            Payment Driver / Signer (host-provided)              │   │
//! │  │        gateway calls, receipt signing, persistence              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`item`] - The item state machine ([`Item`], [`Price`], init bags, snapshots)
//! - [`cart`] - The cart: ordered items, aggregation, dedup policy, purchase
//! - [`events`] - Typed event feeds with deferred delivery
//! - [`scheduler`] - The FIFO queue backing deferred event delivery
//! - [`payment`] - The injected payment-driver interface
//! - [`signer`] - Cart signatures and the hash-based default signer
//! - [`error`] - Domain error types
//!
//! ## Design Principles
//!
//! 1. **No I/O**: payment and signing are injected functions; the core never
//!    touches a gateway, database or clock beyond timestamping
//! 2. **Deferred Events**: mutations complete before their events deliver, so
//!    listeners always observe settled state
//! 3. **Cart-Mediated Mutation**: items inside a cart change only through the
//!    cart, which forwards item events to the cart's own feed
//! 4. **Explicit Errors**: contract violations are typed `Err` values;
//!    in-band failures are `error` events, never panics
//!
//! ## Example Usage
//!
//! ```rust
//! use till_core::{Cart, CartOptions, ItemInit};
//! use serde_json::json;
//!
//! let mut cart = Cart::new(CartOptions::default());
//! cart.add(ItemInit {
//!     product: Some(json!("coke")),
//!     price: Some(2.5.into()),
//!     quantity: Some(2),
//!     ..ItemInit::default()
//! })
//! .unwrap();
//!
//! assert_eq!(cart.total(), 5.0);
//! assert_eq!(cart.quantity(), 2);
//! assert_eq!(cart.count(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cart;
pub mod error;
pub mod events;
pub mod item;
pub mod payment;
pub mod scheduler;
pub mod signer;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use till_core::Cart` instead of
// `use till_core::cart::Cart`

pub use cart::{Cart, CartOptions, CartSnapshot, DupeItemMode, ItemInput};
pub use error::{CartError, CartResult};
pub use events::{
    CartEvent, CartEventKind, Event, ItemEvent, ItemEventKind, ListenerId, MAX_EVENT_LISTENERS,
};
pub use item::{Item, ItemInit, ItemSnapshot, Price};
pub use payment::{driver, DriverOutcome, PaymentDriver, PurchaseCallback, PurchaseResult};
pub use signer::{default_signer, signer, Signer};
