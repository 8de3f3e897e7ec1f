//! Codec traits shared by the HTTP and WebSocket wire formats.
//!
//! A [`Decoder`] turns an accumulating byte buffer into items, consuming
//! exactly the bytes of each item it yields and leaving the rest in place. An
//! [`Encoder`] appends the wire form of an item to an output buffer.
//!
//! The codecs themselves never see the pipeline; [`DecoderStage`] and
//! [`EncoderStage`] adapt them into pipeline stages.

mod stage;

pub use stage::{DecoderStage, EncoderStage, FromMessage};

use bytes::BytesMut;

/// Decodes items from a byte buffer.
pub trait Decoder {
    /// The decoded item type.
    type Item;
    /// The error type.
    type Error;

    /// Attempts to decode one item from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes belonging to a
    /// successfully decoded item are removed from `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error>;

    /// Decodes after the input has ended. Defaults to [`Self::decode`].
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode(src)
    }
}

/// Encodes items into a byte buffer.
pub trait Encoder<Item> {
    /// The error type.
    type Error;

    /// Appends the encoded form of `item` to `dst`.
    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error>;
}
