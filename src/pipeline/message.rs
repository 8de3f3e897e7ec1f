//! Messages and user events that travel through a connection pipeline.

use crate::http::{FullHttpRequest, FullHttpResponse};
use crate::net::websocket::{
    ClientHandshakeComplete, ClientHandshakeStateEvent, Frame, HandshakeComplete,
    ServerHandshakeStateEvent,
};
use bytes::Bytes;

/// A message moving through the pipeline.
///
/// Inbound, raw bytes enter at the head and are decoded into richer messages
/// by decoder stages. Outbound, encoder stages turn richer messages back into
/// bytes; only [`Message::Bytes`] may reach the transport.
#[derive(Debug, Clone)]
pub enum Message {
    /// Raw transport bytes.
    Bytes(Bytes),
    /// An aggregated HTTP request.
    Request(FullHttpRequest),
    /// An aggregated HTTP response.
    Response(FullHttpResponse),
    /// A WebSocket frame.
    Frame(Frame),
}

impl Message {
    /// Short name of the variant, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Frame(_) => "frame",
        }
    }

    /// Returns the frame, if this message is one.
    #[must_use]
    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Self::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

impl From<FullHttpRequest> for Message {
    fn from(request: FullHttpRequest) -> Self {
        Self::Request(request)
    }
}

impl From<FullHttpResponse> for Message {
    fn from(response: FullHttpResponse) -> Self {
        Self::Response(response)
    }
}

/// Out-of-band notifications fired down the pipeline.
#[derive(Debug, Clone)]
pub enum UserEvent {
    /// Server handshake marker (completion or timeout).
    ServerHandshake(ServerHandshakeStateEvent),
    /// Detailed server handshake completion.
    ServerHandshakeComplete(HandshakeComplete),
    /// Client handshake marker (issued, completion or timeout).
    ClientHandshake(ClientHandshakeStateEvent),
    /// Detailed client handshake completion.
    ClientHandshakeComplete(ClientHandshakeComplete),
}
