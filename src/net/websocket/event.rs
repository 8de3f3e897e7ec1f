//! User events fired when a handshake completes or times out.
//!
//! Each successful handshake fires two events, in order: a bare marker
//! (`HandshakeComplete` of the side's state enum) and a detailed event
//! carrying what was negotiated. Applications may watch either.

use http::HeaderMap;

/// Server-side handshake markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHandshakeStateEvent {
    /// The upgrade response was written; the connection speaks WebSocket.
    HandshakeComplete,
    /// The handshake did not finish in time; the connection is being closed.
    HandshakeTimeout,
}

/// Client-side handshake markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHandshakeStateEvent {
    /// The upgrade request was written.
    HandshakeIssued,
    /// A valid `101 Switching Protocols` response was received.
    HandshakeComplete,
    /// No valid response arrived in time; the connection is being closed.
    HandshakeTimeout,
}

/// Details of a completed server handshake.
#[derive(Debug, Clone)]
pub struct HandshakeComplete {
    request_uri: String,
    request_headers: HeaderMap,
    selected_subprotocol: Option<String>,
}

impl HandshakeComplete {
    pub(crate) fn new(
        request_uri: String,
        request_headers: HeaderMap,
        selected_subprotocol: Option<String>,
    ) -> Self {
        Self {
            request_uri,
            request_headers,
            selected_subprotocol,
        }
    }

    /// Request target of the upgrade request.
    #[must_use]
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// Headers of the upgrade request, as aggregated.
    #[must_use]
    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    /// Negotiated subprotocol, if any.
    #[must_use]
    pub fn selected_subprotocol(&self) -> Option<&str> {
        self.selected_subprotocol.as_deref()
    }
}

/// Details of a completed client handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshakeComplete {
    selected_subprotocol: Option<String>,
    response_headers: HeaderMap,
}

impl ClientHandshakeComplete {
    pub(crate) fn new(selected_subprotocol: Option<String>, response_headers: HeaderMap) -> Self {
        Self {
            selected_subprotocol,
            response_headers,
        }
    }

    /// Subprotocol the server selected, if any.
    #[must_use]
    pub fn selected_subprotocol(&self) -> Option<&str> {
        self.selected_subprotocol.as_deref()
    }

    /// Headers of the `101` response.
    #[must_use]
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }
}
