//! Payment gateway integration
//!
//! Request signing, callback verification and the adapters the rest of the
//! core uses to reach the recharge backend.

pub mod providers;
pub mod signer;
pub mod traits;
pub mod types;
pub mod verifier;

pub use signer::{format_amount, RequestSigner};
pub use verifier::CallbackVerifier;
