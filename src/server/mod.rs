//! HTTP surface for validation, checkpoints and sequences.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (build_state, build_router)          │
//! │ (agents, │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! │   UI)    │ WebSocket│         │                                        │
//! └──────────┘          │         ├─ ValidationService (editorial role)    │
//!                       │         └─ CheckpointManager / SequenceTracker   │
//!                       │              (orchestrator role)                 │
//!                       │  ws.rs  (WsMessage, filtered per Subscription)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! Which handlers have a backing component depends on the configured
//! [`ServiceRole`](crate::config::ServiceRole); routes whose component is
//! absent answer `404 not_served`.

pub mod api;
#[allow(clippy::module_inception)]
pub mod server;
pub mod ws;

pub use api::{AppState, SharedState, api_router};
pub use server::{build_router, build_state, start_server};
