//! # Cart Signer
//!
//! The injected function producing an opaque signature for a cart, plus the
//! hash-based default. A signature is a cheap integrity tag over the cart's
//! item snapshots, not a cryptographic guarantee; hosts that need one inject
//! their own signer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde_json::Value;

use crate::cart::Cart;
use crate::error::{CartError, CartResult};

/// The injected signer: cart in, opaque signature value out.
///
/// Failures are reported through an `error` event and then re-raised to the
/// caller of [`Cart::signature`].
pub type Signer = Rc<dyn Fn(&Cart) -> CartResult<Value>>;

/// Wraps a closure as a [`Signer`].
pub fn signer<F>(f: F) -> Signer
where
    F: Fn(&Cart) -> CartResult<Value> + 'static,
{
    Rc::new(f)
}

/// The default signer: hashes the canonical JSON of the item snapshots plus
/// the store and user, and renders the digest as a hex string.
pub fn default_signer() -> Signer {
    Rc::new(|cart: &Cart| {
        let snapshots: Vec<_> = cart.items().iter().map(|item| item.to_json()).collect();
        let canonical =
            serde_json::to_string(&snapshots).map_err(|source| CartError::Signer {
                message: source.to_string(),
            })?;
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        cart.store().hash(&mut hasher);
        cart.user().hash(&mut hasher);
        Ok(Value::String(format!("{:016x}", hasher.finish())))
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
