//! Framed codec for the control channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (TCP halves in practice).
//!
//! Decoding separates the two failure layers: a broken frame boundary is an
//! `io::Error` and ends the stream, while a well-framed body that is not valid
//! JSON for `T` is yielded as `Ok(Err(_))` so the reader can drop it and carry on.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are treated as a broken stream.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec that frames messages with length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, serde_json::Error>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes))),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Envelope, MessageKind, OperationId};
    use tokio_util::bytes::BufMut;

    #[test]
    fn codec_roundtrip_envelope() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let op = OperationId::new();
        let envelope = Envelope::result(op, serde_json::json!({"test": "Math.adds"}));
        codec.encode(envelope.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut full = BytesMut::new();
        codec
            .encode(Envelope::find(OperationId::new(), serde_json::Value::Null), &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap().unwrap();
        assert_eq!(decoded.kind, MessageKind::Find);
    }

    #[test]
    fn malformed_body_is_yielded_not_fatal() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let garbage = b"{not json";
        buf.put_u32(garbage.len() as u32);
        buf.put_slice(garbage);
        codec
            .encode(Envelope::complete(OperationId::new(), None), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(second.is_complete());
    }

    #[test]
    fn oversized_length_prefix_is_stream_error() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LENGTH + 1) as u32);
        buf.put_slice(b"{}");

        assert!(codec.decode(&mut buf).is_err());
    }
}
