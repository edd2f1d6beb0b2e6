//! Live vitals streaming client.
//!
//! The crate is organized by concern:
//! - `stream`: websocket session manager, endpoint configuration, and the
//!   wire envelope for vitals notifications.
//! - `retry`: reconnect backoff policy and timeout helpers.

/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Live vitals stream client, protocol types, and session manager.
pub mod stream;

pub use retry::ReconnectPolicy;
pub use stream::client::{SessionIdentity, StreamClientError, StreamConfig};
pub use stream::proto::VitalsEvent;
pub use stream::session::{
    ConnectionState, EventHandler, SessionManager, SessionStatus, StartOutcome, StopHandle,
};
