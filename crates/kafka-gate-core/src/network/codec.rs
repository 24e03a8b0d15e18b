//! Kafka protocol frame codecs.
//!
//! Kafka uses a simple framing format: a 4-byte big-endian length prefix
//! followed by the message bytes. The proxy relays frames without decoding
//! their bodies, so the codecs here only peek at the fixed-position header
//! fields needed for correlation and dispatch:
//!
//! - requests carry `api_key`, `api_version`, `correlation_id` in the first
//!   8 bytes;
//! - responses carry only `correlation_id` in the first 4 bytes.
//!
//! Unknown api keys are forwarded untouched — a transparent proxy must not
//! drop traffic it does not understand — so the raw `i16` is kept alongside
//! the parsed [`ApiKey`] where one exists.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::ApiKey;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (100 MB by default).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// A request frame read from the client side.
#[derive(Debug)]
pub struct RequestFrame {
    /// Raw API key as sent by the client.
    pub api_key: i16,
    /// Parsed API key, when this build of the protocol tables knows it.
    pub parsed_key: Option<ApiKey>,
    /// The API version.
    pub api_version: i16,
    /// The correlation ID for request/response matching.
    pub correlation_id: i32,
    /// The complete frame bytes (after the length prefix).
    pub payload: BytesMut,
}

/// A response frame read from the broker side. The body past the correlation
/// ID stays opaque unless the rewriter decides to decode it.
#[derive(Debug)]
pub struct BrokerResponseFrame {
    /// The correlation ID matching the originating request.
    pub correlation_id: i32,
    /// The complete frame bytes (after the length prefix).
    pub payload: BytesMut,
}

fn read_frame(src: &mut BytesMut, max_frame_size: usize) -> io::Result<Option<BytesMut>> {
    // Need at least 4 bytes for the length prefix
    if src.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

    if length > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {length} exceeds maximum {max_frame_size}"),
        ));
    }

    if src.len() < 4 + length {
        // Reserve space for the full frame
        src.reserve(4 + length - src.len());
        return Ok(None);
    }

    src.advance(4);
    Ok(Some(src.split_to(length)))
}

/// Decoder for client-to-proxy request frames.
#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_frame_size: usize,
}

impl RequestCodec {
    /// Create a new codec with default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RequestCodec {
    type Item = RequestFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(payload) = read_frame(src, self.max_frame_size)? else {
            return Ok(None);
        };

        // api_key + api_version + correlation_id
        if payload.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame too small for request header",
            ));
        }

        let api_key = i16::from_be_bytes([payload[0], payload[1]]);
        let api_version = i16::from_be_bytes([payload[2], payload[3]]);
        let correlation_id =
            i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

        Ok(Some(RequestFrame {
            api_key,
            parsed_key: ApiKey::try_from(api_key).ok(),
            api_version,
            correlation_id,
            payload,
        }))
    }
}

/// Decoder for broker-to-proxy response frames.
#[derive(Debug, Clone)]
pub struct ResponseCodec {
    max_frame_size: usize,
}

impl ResponseCodec {
    /// Create a new codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for ResponseCodec {
    type Item = BrokerResponseFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(payload) = read_frame(src, self.max_frame_size)? else {
            return Ok(None);
        };

        if payload.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame too small for response header",
            ));
        }

        let correlation_id = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

        Ok(Some(BrokerResponseFrame {
            correlation_id,
            payload,
        }))
    }
}

/// Encoder that writes a payload back with its recomputed length prefix.
/// Used on both relay directions.
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder;

impl Encoder<Bytes> for FrameEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

// The local auth exchange answers frames on the same `Framed` it reads
// requests from, so the request codec doubles as a frame encoder.
impl Encoder<Bytes> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        FrameEncoder.encode(item, dst)
    }
}
