//! Realtime stream modules.
//!
//! - `client`: identity, endpoint configuration, and the websocket transport.
//! - `proto`: liveness literals and the inbound event envelope.
//! - `session`: the self-healing session manager with heartbeat and
//!   reconnect handling.

/// Endpoint configuration, identity, and transport seam.
pub mod client;
/// Stream wire envelope.
pub mod proto;
/// Session manager that owns the live connection.
pub mod session;
