//! Backend adapters
//!
//! Concrete implementations of the traits in [`crate::payments::traits`].

pub mod recharge_backend;

pub use recharge_backend::{BackendConfig, RechargeBackend};
