//! Request/response channel to the DUT over a bridge-forwarded local port.
//!
//! The channel binds lazily: the first request reserves a local port and asks
//! the [`DeviceBridge`] to forward it to the DUT's named endpoint. Every
//! request then opens its own connection, writes one line, reads one
//! response buffer and drops the connection.

use core::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::protocol::{Request, Response};

/// Largest response read per request; longer replies are truncated.
pub const MAX_RESPONSE_BYTES: usize = 4096;

/// Named endpoint the DUT listens on.
pub const DEFAULT_ENDPOINT: &str = "/android/cts/powertest";

/// Failure reported by a [`DeviceBridge`] call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BridgeError {
    pub operation: &'static str,
    pub detail: String,
}

impl BridgeError {
    pub fn new(operation: &'static str, detail: impl Into<String>) -> Self {
        Self {
            operation,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bridge {} failed: {}", self.operation, self.detail)
    }
}

impl std::error::Error for BridgeError {}

/// Host-side utility that links the host to the DUT.
pub trait DeviceBridge {
    /// Forwards local `port` to `endpoint` on the DUT.
    fn forward(&mut self, port: u16, endpoint: &str) -> Result<(), BridgeError>;

    /// Removes the forward for local `port`.
    fn remove_forward(&mut self, port: u16) -> Result<(), BridgeError>;

    /// Blocks until the DUT is reachable again.
    fn wait_for_device(&mut self) -> Result<(), BridgeError>;

    /// Creates `remote_dir` (and parents) on the DUT.
    fn make_dir(&mut self, remote_dir: &str) -> Result<(), BridgeError>;

    /// Copies `local` into `remote_dir` on the DUT.
    fn push_file(&mut self, local: &Path, remote_dir: &str) -> Result<(), BridgeError>;
}

/// Source of byte-stream connections to forwarded local ports.
pub trait Connector {
    type Stream: Read + Write;

    /// Finds a free local port to forward.
    fn reserve_port(&mut self) -> io::Result<u16>;

    /// Opens a fresh connection to `port`.
    fn connect(&mut self, port: u16) -> io::Result<Self::Stream>;
}

/// Binding state of a [`ControlChannel`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Unbound,
    Bound { port: u16 },
    Closed,
}

#[derive(Debug)]
pub enum ChannelError {
    /// The bridge refused to forward the port.
    Forward(BridgeError),
    /// No local port could be reserved.
    PortUnavailable(io::Error),
    /// Connecting to the forwarded port failed.
    Connect { port: u16, source: io::Error },
    /// Writing the request or reading the response failed.
    Io { port: u16, source: io::Error },
    /// The channel was already torn down.
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Forward(error) => {
                write!(f, "Unable to forward requests to client: {error}")
            }
            ChannelError::PortUnavailable(error) => {
                write!(f, "no local port available for forwarding: {error}")
            }
            ChannelError::Connect { port, source } => write!(
                f,
                "Unable to communicate with device on port {port}: {source}"
            ),
            ChannelError::Io { port, source } => {
                write!(f, "request on port {port} failed: {source}")
            }
            ChannelError::Closed => f.write_str("control channel is closed"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Forward(error) => Some(error),
            ChannelError::PortUnavailable(error)
            | ChannelError::Connect { source: error, .. }
            | ChannelError::Io { source: error, .. } => Some(error),
            ChannelError::Closed => None,
        }
    }
}

/// Lazily bound control channel. One instance per run.
pub struct ControlChannel<C, B> {
    connector: C,
    bridge: B,
    endpoint: String,
    state: ChannelState,
}

impl<C, B> ControlChannel<C, B>
where
    C: Connector,
    B: DeviceBridge,
{
    pub fn new(connector: C, bridge: B) -> Self {
        Self::with_endpoint(connector, bridge, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(connector: C, bridge: B, endpoint: impl Into<String>) -> Self {
        Self {
            connector,
            bridge,
            endpoint: endpoint.into(),
            state: ChannelState::Unbound,
        }
    }

    pub const fn state(&self) -> ChannelState {
        self.state
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    fn ensure_bound(&mut self) -> Result<u16, ChannelError> {
        match self.state {
            ChannelState::Bound { port } => Ok(port),
            ChannelState::Closed => Err(ChannelError::Closed),
            ChannelState::Unbound => {
                let port = self
                    .connector
                    .reserve_port()
                    .map_err(ChannelError::PortUnavailable)?;
                self.bridge
                    .forward(port, &self.endpoint)
                    .map_err(ChannelError::Forward)?;
                self.state = ChannelState::Bound { port };
                info!(port, endpoint = %self.endpoint, "forwarding requests over local port");
                Ok(port)
            }
        }
    }

    /// Sends one request and returns the DUT's reply.
    pub fn send(&mut self, request: &Request<'_>) -> Result<Response, ChannelError> {
        let port = self.ensure_bound()?;
        let line = request.encode();

        debug!(port, request = %line, "sending");
        let mut stream = self
            .connector
            .connect(port)
            .map_err(|source| ChannelError::Connect { port, source })?;

        let io_error = |source| ChannelError::Io { port, source };
        stream.write_all(line.as_bytes()).map_err(io_error)?;
        stream.flush().map_err(io_error)?;

        let mut buffer = [0_u8; MAX_RESPONSE_BYTES];
        let read = stream.read(&mut buffer).map_err(io_error)?;
        let response = Response::decode(&buffer[..read]);
        debug!(port, %response, "received");
        Ok(response)
    }

    /// Sends a request whose failure must not interrupt the caller, e.g.
    /// during teardown or error reporting.
    pub fn send_best_effort(&mut self, request: &Request<'_>) -> Option<Response> {
        match self.send(request) {
            Ok(response) => Some(response),
            Err(error) => {
                debug!(%error, "best-effort request failed");
                None
            }
        }
    }

    /// Re-applies the port forward after the DUT re-enumerated. Does nothing
    /// until the channel has been bound.
    pub fn refresh_forwarding(&mut self) -> Result<(), ChannelError> {
        if let ChannelState::Bound { port } = self.state {
            self.bridge
                .forward(port, &self.endpoint)
                .map_err(ChannelError::Forward)?;
            debug!(port, "forwarding re-established");
        }
        Ok(())
    }

    /// Tells the DUT to exit and removes the forward. Safe to call any number
    /// of times; the forward is removed at most once.
    pub fn close(&mut self) {
        if let ChannelState::Bound { port } = self.state {
            let _ = self.send_best_effort(&Request::Exit);
            if let Err(error) = self.bridge.remove_forward(port) {
                warn!(%error, port, "failed to remove port forward");
            }
        }
        self.state = ChannelState::Closed;
    }
}
