//! Transaction lifecycle
//!
//! `Submitted → AwaitingRedirect → Pending → Success | Failed`, with `Error`
//! reachable from any unresolved state on local failures.

pub mod machine;
pub mod state;

pub use machine::{CallbackHandling, IdSource, TransactionStateMachine, Transition};
pub use state::{TransactionEvent, TransactionState};
