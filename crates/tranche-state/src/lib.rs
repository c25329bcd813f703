//! # Tranche State
//!
//! Versioned escrow state store with transition history, plus event
//! publication.

pub mod events;
pub mod history;
pub mod store;

pub use events::{BroadcastPublisher, EventFilter, EventPublisher, EventSubscription};
pub use history::{EntityHistory, EntityKind, TransitionRecord};
pub use store::{EscrowStore, InMemoryEscrowStore};
