//! Currency Wallet Common Types
//!
//! Shared types used across the wallet ledger crates, including identifiers,
//! the supported currency set, operation kinds and the error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod operation;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use operation::*;
pub use error::*;
