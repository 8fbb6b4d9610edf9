//! Wire protocol between the timer service and its client
//!
//! Every message is a JSON object `{"type": ..., "data": ...}` followed by a
//! single form-feed byte. JSON text never contains a raw form feed (control
//! characters are always escaped), so the delimiter needs no escaping.
//!
//! Framing and schema decoding are split: [`FrameCodec`] only cuts the byte
//! stream into frames, and [`WireMessage::decode`] parses a single frame. A
//! malformed payload therefore costs one message, never the connection.

use crate::callback::CallbackDescriptor;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// End-of-message delimiter (form feed)
pub const DELIMITER: u8 = 0x0C;

/// Default upper bound for a single frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Longest delay a debounce request may ask for (365 days)
///
/// The service's timer wheel cannot hold deadlines much past two years.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Errors raised while framing or parsing messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame content is not a valid message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// Peer sent more than `max` bytes without a delimiter
    #[error("frame exceeds {max} bytes without a delimiter ({len} buffered)")]
    FrameTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Messages exchanged over the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WireMessage {
    /// Client → service: start or restart the timer for a key
    DebounceEvent(DebounceEvent),
    /// Client → service: cancel every pending timer without firing
    Reset,
    /// Service → client: a timer expired
    PublishEvent(PublishEvent),
    /// Service → client: another client already holds the service
    RejectClient,
}

/// Payload of [`WireMessage::DebounceEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebounceEvent {
    /// Debounce key
    pub descriptor: String,
    /// Delay in seconds
    pub timeout: f64,
    /// Callback to publish when the delay elapses
    pub callback: CallbackDescriptor,
}

/// Payload of [`WireMessage::PublishEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEvent {
    pub callback: CallbackDescriptor,
}

impl DebounceEvent {
    pub fn new(key: impl Into<String>, delay: Duration, callback: CallbackDescriptor) -> Self {
        Self {
            descriptor: key.into(),
            timeout: delay.as_secs_f64(),
            callback,
        }
    }

    /// Requested delay as a `Duration`
    ///
    /// Negative, NaN, infinite and timeouts beyond [`MAX_DELAY`] are rejected.
    pub fn delay(&self) -> Result<Duration, ProtocolError> {
        let delay = Duration::try_from_secs_f64(self.timeout).map_err(|e| {
            ProtocolError::Malformed(format!(
                "invalid timeout {} for '{}': {}",
                self.timeout, self.descriptor, e
            ))
        })?;
        if delay > MAX_DELAY {
            return Err(ProtocolError::Malformed(format!(
                "timeout {}s for '{}' exceeds the {}s maximum",
                self.timeout,
                self.descriptor,
                MAX_DELAY.as_secs()
            )));
        }
        Ok(delay)
    }
}

impl WireMessage {
    /// Parse a single frame (without its delimiter)
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(|e| {
            ProtocolError::Malformed(format!("{} in {:?}", e, String::from_utf8_lossy(frame)))
        })
    }

    /// Encode as a complete frame, delimiter included
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = serde_json::to_vec(self).map_err(ProtocolError::Encode)?;
        frame.push(DELIMITER);
        Ok(frame)
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::DebounceEvent(_) => "debounceEvent",
            WireMessage::Reset => "reset",
            WireMessage::PublishEvent(_) => "publishEvent",
            WireMessage::RejectClient => "rejectClient",
        }
    }
}

/// Splits a byte stream on [`DELIMITER`] and writes delimited messages
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Bytes of the buffer already searched for a delimiter
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scanned: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            let start = self.scanned.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == DELIMITER) else {
                if src.len() > self.max_frame_bytes {
                    return Err(ProtocolError::FrameTooLarge {
                        len: src.len(),
                        max: self.max_frame_bytes,
                    });
                }
                // Partial fragment stays buffered for the next read
                self.scanned = src.len();
                return Ok(None);
            };

            let end = start + offset;
            self.scanned = 0;
            let frame = src.split_to(end).freeze();
            src.advance(1);

            // Back-to-back delimiters carry nothing
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            tracing::debug!("Discarding {} trailing bytes without delimiter", src.len());
            src.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

impl Encoder<WireMessage> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(&item).map_err(ProtocolError::Encode)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
