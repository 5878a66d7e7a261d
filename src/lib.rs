//! Payment orchestration and verification for a recharge storefront
//!
//! Signs outbound gateway requests, verifies callbacks, tracks each
//! transaction until it resolves, polls the backend while the outcome is
//! unknown, and keeps payment-app deep links out of the embedded browser.

pub mod api;
pub mod config;
pub mod deeplink;
pub mod error;
pub mod payments;
pub mod poller;
pub mod popup;
pub mod service;
pub mod store;
pub mod transaction;

pub use error::{PaymentError, PaymentResult};
pub use service::PaymentService;
