//! Stream endpoint configuration, session identity, and websocket transport.
//!
//! The session manager never touches sockets directly: it asks a
//! [`Connector`] for a [`Transport`] and drives it. [`WsConnector`] is the
//! production implementation built on tokio-tungstenite.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::retry::ReconnectPolicy;

/// Local development websocket endpoint for the vitals stream.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/vitals";
/// Environment variable that overrides [`DEFAULT_ENDPOINT`].
pub const ENDPOINT_ENV_VAR: &str = "VITALS_WS_URL";
/// Query parameter carrying the credential token.
pub const TOKEN_QUERY_PARAM: &str = "token";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// The (subject, credential) pair a session connects for.
#[derive(Clone)]
pub struct SessionIdentity {
    subject_id: String,
    credential_token: SecretString,
}

impl SessionIdentity {
    pub fn new(subject_id: impl Into<String>, credential_token: SecretString) -> Self {
        Self {
            subject_id: subject_id.into(),
            credential_token,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn credential_token(&self) -> &SecretString {
        &self.credential_token
    }

    /// Returns `true` when both the subject and the token are non-blank.
    ///
    /// An invalid identity never produces a connection attempt.
    pub fn is_valid(&self) -> bool {
        !self.subject_id.trim().is_empty()
            && !self.credential_token.expose_secret().trim().is_empty()
    }
}

impl PartialEq for SessionIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.subject_id == other.subject_id
            && self.credential_token.expose_secret() == other.credential_token.expose_secret()
    }
}

impl Eq for SessionIdentity {}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("subject_id", &self.subject_id)
            .field("credential_token", &"[REDACTED]")
            .finish()
    }
}

/// Tunables for a vitals stream session.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    endpoint_override: Option<String>,
    env_endpoint: Option<String>,
    heartbeat_interval: Duration,
    reconnect_policy: ReconnectPolicy,
    close_timeout: Duration,
    connect_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint_override: None,
            env_endpoint: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_policy: ReconnectPolicy::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            connect_timeout: None,
        }
    }
}

impl StreamConfig {
    /// Creates a config pointing at [`DEFAULT_ENDPOINT`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config whose endpoint honours [`ENDPOINT_ENV_VAR`].
    pub fn from_env() -> Self {
        Self::default().with_env_endpoint(std::env::var(ENDPOINT_ENV_VAR).ok())
    }

    fn with_env_endpoint(mut self, value: Option<String>) -> Self {
        self.env_endpoint = value
            .map(|endpoint| endpoint.trim().to_string())
            .filter(|endpoint| !endpoint.is_empty());
        self
    }

    /// Sets an explicit stream endpoint.
    ///
    /// The override takes precedence over the environment when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Bounds how long `stop` waits for the close frame to be flushed.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Bounds the opening handshake. A handshake that exceeds the bound is
    /// treated like any other failed connect.
    ///
    /// Unset by default: without it, only the transport decides when a
    /// handshake has failed.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if let Some(endpoint) = self.env_endpoint.as_deref() {
            return endpoint;
        }
        DEFAULT_ENDPOINT
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect_policy
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Builds `<endpoint>?token=<credential>` for one connection attempt.
    ///
    /// Query parameters already present on the endpoint are kept.
    pub fn session_url(&self, identity: &SessionIdentity) -> Result<Url, StreamClientError> {
        let mut url = Url::parse(self.endpoint()).map_err(|err| {
            StreamClientError::InvalidEndpoint(format!("{}: {err}", self.endpoint()))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(StreamClientError::InvalidEndpoint(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }
        url.query_pairs_mut().append_pair(
            TOKEN_QUERY_PARAM,
            identity.credential_token().expose_secret(),
        );
        Ok(url)
    }
}

/// Errors produced by stream transport and frame handling.
///
/// None of these reach the event handler; the session logs them and either
/// drops the frame or reconnects.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint could not be turned into a websocket URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Opening handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Frame was valid JSON but not an event envelope.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
/// Inbound half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An open connection handed to the session by a [`Connector`].
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }

    /// Splits a duplex websocket into a transport.
    pub fn from_socket<S>(socket: S) -> Self
    where
        S: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Send + 'static,
    {
        let (sink, stream) = socket.split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports for the session manager.
pub trait Connector: Send + Sync + 'static {
    /// Opens one connection to `url`. Resolving means the handshake finished.
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, StreamClientError>>;
}

/// tokio-tungstenite backed [`Connector`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, StreamClientError>> {
        Box::pin(async move {
            let request = url.as_str().into_client_request()?;
            let (socket, _) = connect_async(request).await?;
            Ok(Transport::from_socket(socket))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;

    use super::{SessionIdentity, StreamClientError, StreamConfig, DEFAULT_ENDPOINT};

    fn identity(subject: &str, token: &str) -> SessionIdentity {
        SessionIdentity::new(subject, SecretString::new(token.to_string()))
    }

    #[test]
    fn config_uses_local_endpoint_by_default() {
        assert_eq!(StreamConfig::new().endpoint(), DEFAULT_ENDPOINT);
    }

    #[test]
    fn env_endpoint_replaces_default() {
        let config = StreamConfig::new().with_env_endpoint(Some(" wss://vitals.example/ws ".into()));
        assert_eq!(config.endpoint(), "wss://vitals.example/ws");
    }

    #[test]
    fn blank_env_endpoint_is_ignored() {
        let config = StreamConfig::new().with_env_endpoint(Some("   ".into()));
        assert_eq!(config.endpoint(), DEFAULT_ENDPOINT);
    }

    #[test]
    fn endpoint_override_takes_precedence() {
        let config = StreamConfig::new()
            .with_env_endpoint(Some("wss://from-env.example/ws".into()))
            .with_endpoint("wss://stream-dev.example/ws   \n");
        assert_eq!(config.endpoint(), "wss://stream-dev.example/ws");
    }

    #[test]
    fn session_url_carries_token_query() {
        let url = StreamConfig::new()
            .session_url(&identity("u1", "t1"))
            .unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/vitals?token=t1");
    }

    #[test]
    fn session_url_encodes_token_and_keeps_existing_query() {
        let url = StreamConfig::new()
            .with_endpoint("wss://vitals.example/ws?v=2")
            .session_url(&identity("u1", "a b&c"))
            .unwrap();
        assert_eq!(url.as_str(), "wss://vitals.example/ws?v=2&token=a+b%26c");
    }

    #[test]
    fn session_url_rejects_http_scheme() {
        let err = StreamConfig::new()
            .with_endpoint("http://vitals.example/ws")
            .session_url(&identity("u1", "t1"))
            .unwrap_err();
        assert!(matches!(err, StreamClientError::InvalidEndpoint(_)));
    }

    #[test]
    fn session_url_rejects_garbage_endpoint() {
        let err = StreamConfig::new()
            .with_endpoint("not a url")
            .session_url(&identity("u1", "t1"))
            .unwrap_err();
        assert!(matches!(err, StreamClientError::InvalidEndpoint(_)));
    }

    #[test]
    fn identity_requires_subject_and_token() {
        assert!(identity("u1", "t1").is_valid());
        assert!(!identity("", "t1").is_valid());
        assert!(!identity("u1", "").is_valid());
        assert!(!identity("  ", "t1").is_valid());
    }

    #[test]
    fn identity_equality_compares_token() {
        assert_eq!(identity("u1", "t1"), identity("u1", "t1"));
        assert_ne!(identity("u1", "t1"), identity("u1", "t2"));
        assert_ne!(identity("u1", "t1"), identity("u2", "t1"));
    }

    #[test]
    fn identity_debug_redacts_token() {
        let debug = format!("{:?}", identity("u1", "super-secret"));
        assert!(debug.contains("u1"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn zero_heartbeat_interval_is_clamped() {
        let config = StreamConfig::new().with_heartbeat_interval(Duration::ZERO);
        assert!(config.heartbeat_interval() > Duration::ZERO);
    }
}
