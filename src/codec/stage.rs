//! Pipeline stages that drive a [`Decoder`] or an [`Encoder`].
//!
//! [`DecoderStage`] accumulates inbound bytes and fires every complete item
//! downstream. It stops decoding as soon as it is removed from the pipeline
//! (typically because a decoded item triggered its replacement) and hands
//! any unconsumed bytes to whatever now follows its old position:
//!
//! ```text
//!   bytes: [ HTTP upgrade request | first WebSocket frame ]
//!                   │                        │
//!            http-decoder ── replaced ──► ws-decoder
//! ```
//!
//! [`EncoderStage`] turns one outbound message type into bytes and forwards
//! everything else untouched.

use crate::codec::{Decoder, Encoder};
use crate::error::Error;
use crate::http::{FullHttpRequest, FullHttpResponse};
use crate::net::websocket::Frame;
use crate::pipeline::{Context, Message, Stage};
use crate::promise::Promise;
use crate::tracing_compat::{trace, warn};
use bytes::BytesMut;
use std::fmt;
use std::marker::PhantomData;

/// Message payloads an [`EncoderStage`] can pick out of the pipeline.
pub trait FromMessage: Sized {
    /// Returns the payload, or gives the message back if it is of another kind.
    fn from_message(msg: Message) -> Result<Self, Message>;
}

impl FromMessage for FullHttpRequest {
    fn from_message(msg: Message) -> Result<Self, Message> {
        match msg {
            Message::Request(request) => Ok(request),
            other => Err(other),
        }
    }
}

impl FromMessage for FullHttpResponse {
    fn from_message(msg: Message) -> Result<Self, Message> {
        match msg {
            Message::Response(response) => Ok(response),
            other => Err(other),
        }
    }
}

impl FromMessage for Frame {
    fn from_message(msg: Message) -> Result<Self, Message> {
        match msg {
            Message::Frame(frame) => Ok(frame),
            other => Err(other),
        }
    }
}

/// Inbound stage that decodes accumulated bytes.
///
/// Non-byte messages pass through. A decode error is fired downstream as an
/// error event, after which the connection is closed and further bytes are
/// discarded.
pub struct DecoderStage<D> {
    label: &'static str,
    decoder: D,
    buffer: BytesMut,
    failed: bool,
}

impl<D> DecoderStage<D> {
    /// Wraps `decoder`; `label` names the stage in logs.
    pub fn new(label: &'static str, decoder: D) -> Self {
        Self {
            label,
            decoder,
            buffer: BytesMut::new(),
            failed: false,
        }
    }

    /// The wrapped decoder.
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Number of buffered, not yet decoded bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl<D> DecoderStage<D>
where
    D: Decoder,
    D::Item: Into<Message>,
    D::Error: Into<Error> + fmt::Display,
{
    fn decode_buffered(&mut self, ctx: &mut Context<'_>, eof: bool) {
        while !ctx.is_removed() {
            let decoded = if eof {
                self.decoder.decode_eof(&mut self.buffer)
            } else {
                self.decoder.decode(&mut self.buffer)
            };
            match decoded {
                Ok(Some(item)) => ctx.fire_read(item),
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        conn = %ctx.connection_id(),
                        decoder = self.label,
                        error = %err,
                        "decode failed, closing connection"
                    );
                    self.failed = true;
                    self.buffer.clear();
                    ctx.fire_error(err);
                    ctx.close();
                    break;
                }
            }
        }
    }
}

impl<D> Stage for DecoderStage<D>
where
    D: Decoder + Send + 'static,
    D::Item: Into<Message>,
    D::Error: Into<Error> + fmt::Display,
{
    fn on_read(&mut self, ctx: &mut Context<'_>, msg: Message) {
        let Message::Bytes(bytes) = msg else {
            ctx.fire_read(msg);
            return;
        };
        if self.failed {
            trace!(decoder = self.label, len = bytes.len(), "discarding bytes after decode failure");
            return;
        }
        self.buffer.extend_from_slice(&bytes);
        self.decode_buffered(ctx, false);
    }

    fn on_inactive(&mut self, ctx: &mut Context<'_>) {
        if !self.failed && !self.buffer.is_empty() {
            self.decode_buffered(ctx, true);
        }
        ctx.fire_inactive();
    }

    fn on_removed(&mut self, ctx: &mut Context<'_>) {
        if self.buffer.is_empty() {
            return;
        }
        let rest = self.buffer.split().freeze();
        trace!(
            conn = %ctx.connection_id(),
            decoder = self.label,
            len = rest.len(),
            "handing over unconsumed bytes"
        );
        ctx.fire_read(rest);
    }
}

impl<D> fmt::Debug for DecoderStage<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderStage")
            .field("label", &self.label)
            .field("buffered", &self.buffer.len())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

/// Outbound stage that encodes messages of type `I` into bytes.
pub struct EncoderStage<E, I> {
    label: &'static str,
    encoder: E,
    _item: PhantomData<fn(I)>,
}

impl<E, I> EncoderStage<E, I> {
    /// Wraps `encoder`; `label` names the stage in logs.
    pub fn new(label: &'static str, encoder: E) -> Self {
        Self {
            label,
            encoder,
            _item: PhantomData,
        }
    }

    /// The wrapped encoder.
    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Mutable access to the wrapped encoder.
    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }
}

impl<E, I> Stage for EncoderStage<E, I>
where
    E: Encoder<I> + Send + 'static,
    E::Error: Into<Error> + fmt::Display,
    I: FromMessage + 'static,
{
    fn handles_inbound(&self) -> bool {
        false
    }

    fn handles_outbound(&self) -> bool {
        true
    }

    fn on_write(&mut self, ctx: &mut Context<'_>, msg: Message, promise: Promise) {
        let item = match I::from_message(msg) {
            Ok(item) => item,
            Err(other) => {
                ctx.forward_write(other, promise);
                return;
            }
        };
        let mut dst = BytesMut::new();
        match self.encoder.encode(item, &mut dst) {
            Ok(()) => ctx.forward_write(Message::Bytes(dst.freeze()), promise),
            Err(err) => {
                warn!(
                    conn = %ctx.connection_id(),
                    encoder = self.label,
                    error = %err,
                    "encode failed"
                );
                promise.try_failure(err);
            }
        }
    }
}

impl<E, I> fmt::Debug for EncoderStage<E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderStage")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
