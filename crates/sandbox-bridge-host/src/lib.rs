//! Host side of the sandbox bridge: mounts interaction channels, dispatches
//! their requests to host capabilities, and relays push events back.

pub mod bridge;
pub mod capabilities;
pub mod context;
pub mod events;
pub mod facade;
pub mod methods;
pub mod persistence;
pub mod realtime;
pub mod server;
pub mod state;
pub mod subscriptions;

#[cfg(test)]
mod test_support;

pub use bridge::HostBridge;
pub use capabilities::{ChatUi, MediaPlayer, PersistenceApi, RealtimeChannel};
pub use facade::{display_plan, DisplayPlan, SdkFacade};
pub use persistence::{HttpPersistenceApi, UnconfiguredPersistence};
pub use realtime::{LoopbackRealtime, WsRealtimeChannel};
pub use server::{router, serve_with_shutdown, start_server};
pub use state::HostState;
