//! Domain layer types and invariants.

pub mod error;
pub mod slug;
pub mod types;
