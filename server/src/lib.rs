//! relayd — real-time message relay for two-party chat.
//!
//! Authenticates WebSocket connections, tracks which user owns which
//! connection, persists sent messages and fans them out to every live
//! connection of the conversation's participants.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;
