//! Client SDK for sandboxed interactions.
//!
//! Interaction code talks to the host only through an [`InteractionClient`]
//! bound to one message port. Each capability call becomes a correlated
//! request; replies are routed by a single reader task through the
//! [`PendingRequests`] map.

pub mod pending;
pub mod sdk;

pub use pending::PendingRequests;
pub use sdk::{InteractionClient, Lifecycle, Subscription};
