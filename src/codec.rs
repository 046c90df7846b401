//! Payload encoding.
//!
//! The engine itself only moves bytes. A [`Codec`] turns typed requests into payloads and reply payloads back into
//! typed values for the convenience methods on [`RequestReplyClient`](crate::client::RequestReplyClient).

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::CodecError;

/// Encodes and decodes payloads.
pub trait Codec: Send + Sync + 'static {
    /// Encodes a value into bytes.
    fn encode<T>(&self, value: &T) -> Result<Bytes, CodecError>
    where
        T: Serialize + ?Sized;

    /// Decodes bytes into a value.
    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T>(&self, value: &T) -> Result<Bytes, CodecError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}
