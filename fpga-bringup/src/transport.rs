//! Transport handle: the single control channel to a debug server

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{BringupError, ConnectionError};
use crate::server::{DebugServer, ServerError};

/// Default hw_server port
pub const DEFAULT_HW_SERVER_PORT: u16 = 3121;

/// Where the debug server lives, e.g. `tcp:127.0.0.1:3121`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionDescriptor {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionDescriptor {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// The URI handed to the server's `connect`
    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self::new("tcp", "127.0.0.1", DEFAULT_HW_SERVER_PORT)
    }
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("Connection URI '{}' must have the form scheme:host:port", s))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("Connection URI '{}' is missing a port", s))?;

        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("Invalid scheme '{}' in connection URI '{}'", scheme, s));
        }
        if host.is_empty() {
            return Err(format!("Connection URI '{}' has an empty host", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|e| format!("Invalid port '{}' in connection URI '{}': {}", port, s, e))?;
        if port == 0 {
            return Err(format!("Connection URI '{}' has port 0", s));
        }

        Ok(Self::new(scheme, host, port))
    }
}

impl TryFrom<String> for ConnectionDescriptor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectionDescriptor> for String {
    fn from(value: ConnectionDescriptor) -> Self {
        value.to_string()
    }
}

/// Owns zero-or-one live connection to a debug server.
///
/// Every successful connect starts a new epoch; target handles remember the
/// epoch they were resolved in and become invalid once it ends.
pub struct TransportHandle<S> {
    server: S,
    connected: Option<ConnectionDescriptor>,
    epoch: u64,
    /// Connection was lost mid-session; the server side still needs a teardown
    stale: bool,
}

impl<S: DebugServer> TransportHandle<S> {
    pub fn new(server: S) -> Self {
        Self {
            server,
            connected: None,
            epoch: 0,
            stale: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    /// Whether `disconnect` still has a server-side session to tear down
    pub fn needs_teardown(&self) -> bool {
        self.is_connected() || self.stale
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a handle resolved in `epoch` may still issue operations
    pub fn is_live(&self, epoch: u64) -> bool {
        self.is_connected() && self.epoch == epoch
    }

    pub async fn connect(
        &mut self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), ConnectionError> {
        if self.connected.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        let uri = descriptor.uri();
        info!("Connecting to debug server at {}", uri);

        self.server.connect(&uri).await.map_err(|e| ConnectionError::Unreachable {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;

        self.epoch += 1;
        self.connected = Some(descriptor.clone());
        self.stale = false;
        debug!("Connected to {} (epoch {})", uri, self.epoch);
        Ok(())
    }

    /// Tear down the channel. A no-op when already disconnected.
    ///
    /// The handle is left disconnected even if the server reports an error.
    /// After a connection loss the server still gets one teardown call.
    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        match self.connected.take() {
            Some(descriptor) => info!("Disconnecting from {}", descriptor),
            None if self.stale => debug!("Releasing lost connection"),
            None => {
                debug!("Disconnect requested while not connected, nothing to do");
                return Ok(());
            }
        }
        self.stale = false;

        self.server
            .disconnect()
            .await
            .map_err(|e| ConnectionError::Disconnect(e.to_string()))
    }

    /// Server access for registry and target operations
    pub(crate) fn server_mut(&mut self) -> Result<&mut S, ConnectionError> {
        if self.connected.is_none() {
            return Err(ConnectionError::NotConnected);
        }
        Ok(&mut self.server)
    }

    /// Translate a server error raised mid-session.
    ///
    /// Errors that leave the control channel untrustworthy drop the
    /// connection and surface as [`ConnectionError::Lost`]; anything else is
    /// handed to `rejected` to become the operation-specific error.
    pub(crate) fn fail(
        &mut self,
        error: ServerError,
        rejected: impl FnOnce(String) -> BringupError,
    ) -> BringupError {
        if error.is_connection_loss() {
            warn!("Lost connection to debug server: {}", error);
            if self.connected.take().is_some() {
                self.stale = true;
            }
            return ConnectionError::Lost(error.to_string()).into();
        }
        match error {
            ServerError::Rejected(reason) => rejected(reason),
            other => rejected(other.to_string()),
        }
    }
}
