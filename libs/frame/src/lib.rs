//! Control socket framing.
//!
//! The manager talks to this process over a length-prefixed byte protocol.
//!
//! Request wire format:
//! - 2 bytes big-endian length `L` (everything after the length field)
//! - 6 bytes big-endian sender clock, epoch milliseconds
//! - JSON command envelope
//! - 4 bytes check code
//!
//! The check code is the first four bytes of
//! `MD5(decimal(timestamp) ++ json ++ key)`, so only holders of the shared
//! key can produce a frame the server accepts.
//!
//! Response wire format:
//! - 2 bytes big-endian length
//! - JSON result body
//!
//! Frames arrive over TCP in arbitrary chunks. [`FrameBuffer`] accumulates
//! reads and only yields a frame once all `L + 2` bytes are present.

use bytes::{Buf, Bytes, BytesMut};
use md5::{Digest, Md5};
use serde::Serialize;
use thiserror::Error;

/// Size of the big-endian length field.
pub const LENGTH_FIELD_LEN: usize = 2;

/// Size of the timestamp prefix carried before the JSON envelope.
pub const TIMESTAMP_LEN: usize = 6;

/// Size of the trailing check code.
pub const CHECK_CODE_LEN: usize = 4;

/// Largest body that fits behind a 2-byte length field.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Default tolerated distance between sender and local clocks.
pub const DEFAULT_MAX_CLOCK_SKEW_MS: i64 = 10 * 60 * 1000;

/// Framing and authentication errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared length cannot hold the timestamp and check code.
    #[error("frame length {length} is too short (minimum {minimum})")]
    TooShort { length: usize, minimum: usize },

    /// Recomputed check code differs from the supplied one.
    #[error("check code mismatch")]
    CheckCodeMismatch,

    /// Sender clock is outside the accepted window.
    #[error("frame timestamp {timestamp} is outside the accepted window")]
    Expired { timestamp: i64 },

    /// Body does not fit behind the length field.
    #[error("body of {0} bytes exceeds the maximum frame length")]
    Oversized(usize),

    /// Response body could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FrameError {
    /// True for failures that mean the sender does not hold the key.
    ///
    /// These close the connection with an authentication status rather
    /// than a framing one.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::CheckCodeMismatch | Self::Expired { .. })
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        FrameError::Serialization(err.to_string())
    }
}

/// Compute the 4-byte check code for a payload.
pub fn check_code(key: &str, timestamp: i64, payload: &[u8]) -> [u8; CHECK_CODE_LEN] {
    let mut hasher = Md5::new();
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(payload);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut code = [0u8; CHECK_CODE_LEN];
    code.copy_from_slice(&digest[..CHECK_CODE_LEN]);
    code
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` while fewer than `L + 2` bytes are available.
/// On success yields the frame body (without the length field) and the
/// unconsumed remainder.
pub fn split_frame(buf: &[u8]) -> Result<Option<(&[u8], &[u8])>, FrameError> {
    if buf.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }

    let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let minimum = TIMESTAMP_LEN + CHECK_CODE_LEN;
    if length < minimum {
        return Err(FrameError::TooShort { length, minimum });
    }

    let total = LENGTH_FIELD_LEN + length;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some((&buf[LENGTH_FIELD_LEN..total], &buf[total..])))
}

/// Incremental receive buffer for one connection.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the next complete frame body, if one is buffered.
    ///
    /// Partial frames stay buffered and are re-evaluated on the next call.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        let body_len = match split_frame(&self.buf)? {
            Some((body, _)) => body.len(),
            None => return Ok(None),
        };

        self.buf.advance(LENGTH_FIELD_LEN);
        Ok(Some(self.buf.split_to(body_len).freeze()))
    }
}

/// Keyed codec shared by every connection.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    key: String,
    max_clock_skew_ms: Option<i64>,
}

impl FrameCodec {
    /// Create a codec for the given shared key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            max_clock_skew_ms: Some(DEFAULT_MAX_CLOCK_SKEW_MS),
        }
    }

    /// Override the accepted clock skew. `None` disables the window check.
    pub fn with_max_clock_skew(mut self, skew_ms: Option<i64>) -> Self {
        self.max_clock_skew_ms = skew_ms;
        self
    }

    /// Verify a frame body and return the JSON envelope it carries.
    ///
    /// `now_ms` is the local clock in epoch milliseconds.
    pub fn open<'a>(&self, body: &'a [u8], now_ms: i64) -> Result<&'a [u8], FrameError> {
        let minimum = TIMESTAMP_LEN + CHECK_CODE_LEN;
        if body.len() < minimum {
            return Err(FrameError::TooShort {
                length: body.len(),
                minimum,
            });
        }

        let (signed, code) = body.split_at(body.len() - CHECK_CODE_LEN);
        let (stamp, payload) = signed.split_at(TIMESTAMP_LEN);
        let timestamp = read_timestamp(stamp);

        let expected = check_code(&self.key, timestamp, payload);
        if !constant_time_eq(&expected, code) {
            return Err(FrameError::CheckCodeMismatch);
        }

        if let Some(skew) = self.max_clock_skew_ms {
            if (now_ms - timestamp).abs() > skew {
                return Err(FrameError::Expired { timestamp });
            }
        }

        Ok(payload)
    }

    /// Decode the first complete frame in `buf`.
    ///
    /// Returns the verified JSON payload and the unconsumed remainder, or
    /// `Ok(None)` if the frame is still incomplete.
    pub fn decode<'a>(
        &self,
        buf: &'a [u8],
        now_ms: i64,
    ) -> Result<Option<(&'a [u8], &'a [u8])>, FrameError> {
        match split_frame(buf)? {
            Some((body, rest)) => Ok(Some((self.open(body, now_ms)?, rest))),
            None => Ok(None),
        }
    }

    /// Build a signed request frame, as the manager sends it.
    pub fn seal(&self, payload: &[u8], timestamp: i64) -> Result<Vec<u8>, FrameError> {
        let length = TIMESTAMP_LEN + payload.len() + CHECK_CODE_LEN;
        if length > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(length));
        }

        let mut frame = Vec::with_capacity(LENGTH_FIELD_LEN + length);
        frame.extend_from_slice(&(length as u16).to_be_bytes());
        frame.extend_from_slice(&timestamp.to_be_bytes()[8 - TIMESTAMP_LEN..]);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&check_code(&self.key, timestamp, payload));
        Ok(frame)
    }
}

/// Encode a response body as a single complete frame.
pub fn encode_response<T: Serialize>(response: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(response)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(body.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_FIELD_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Split a response frame back into its JSON body.
pub fn decode_response(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < LENGTH_FIELD_LEN {
        return None;
    }
    let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    buf.get(LENGTH_FIELD_LEN..LENGTH_FIELD_LEN + length)
}

fn read_timestamp(stamp: &[u8]) -> i64 {
    stamp
        .iter()
        .fold(0i64, |acc, byte| (acc << 8) | i64::from(*byte))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const KEY: &str = "s3cret";
    const NOW: i64 = 1_700_000_000_000;

    fn list_frame() -> Vec<u8> {
        FrameCodec::new(KEY)
            .seal(br#"{"command":"list"}"#, NOW)
            .unwrap()
    }

    #[test]
    fn test_seal_then_decode_returns_payload() {
        let codec = FrameCodec::new(KEY);
        let payload = br#"{"command":"add","port":5,"password":"h1"}"#;
        let frame = codec.seal(payload, NOW).unwrap();

        let (decoded, rest) = codec.decode(&frame, NOW).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_length_field_counts_prefix_and_code() {
        let frame = list_frame();
        let length = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(length, TIMESTAMP_LEN + 18 + CHECK_CODE_LEN);
        assert_eq!(frame.len(), length + LENGTH_FIELD_LEN);
    }

    #[test]
    fn test_timestamp_prefix_is_big_endian_millis() {
        let frame = list_frame();
        assert_eq!(read_timestamp(&frame[2..8]), NOW);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn test_tampered_check_code_is_auth_failure(#[case] index: usize) {
        let codec = FrameCodec::new(KEY);
        let mut frame = list_frame();
        let pos = frame.len() - CHECK_CODE_LEN + index;
        frame[pos] ^= 0xff;

        let err = codec.decode(&frame, NOW).unwrap_err();
        assert_eq!(err, FrameError::CheckCodeMismatch);
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let frame = list_frame();
        let err = FrameCodec::new("other").decode(&frame, NOW).unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let frame = list_frame();
        let codec = FrameCodec::new(KEY);

        let late = NOW + DEFAULT_MAX_CLOCK_SKEW_MS + 1;
        let err = codec.decode(&frame, late).unwrap_err();
        assert_eq!(err, FrameError::Expired { timestamp: NOW });

        let unchecked = codec.with_max_clock_skew(None);
        assert!(unchecked.decode(&frame, late).unwrap().is_some());
    }

    #[test]
    fn test_short_length_is_framing_error() {
        let err = split_frame(&[0x00, 0x03, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, FrameError::TooShort { length: 3, .. }));
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn test_partial_frame_fires_once_when_complete() {
        let frame = list_frame();
        let mut buffer = FrameBuffer::new();
        let mut fired = 0;

        for (i, byte) in frame.iter().enumerate() {
            buffer.extend(&[*byte]);
            match buffer.next_frame().unwrap() {
                Some(body) => {
                    assert_eq!(i, frame.len() - 1, "frame decoded before it was complete");
                    assert_eq!(&body[..], &frame[LENGTH_FIELD_LEN..]);
                    fired += 1;
                }
                None => assert!(i < frame.len() - 1),
            }
        }

        assert_eq!(fired, 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_keeps_trailing_bytes() {
        let mut frame = list_frame();
        let first_len = frame.len();
        frame.extend_from_slice(&[0x00]);

        let mut buffer = FrameBuffer::new();
        buffer.extend(&frame);
        assert!(buffer.next_frame().unwrap().is_some());
        assert_eq!(buffer.len(), frame.len() - first_len);
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_response_frame() {
        let frame = encode_response(&serde_json::json!({"code": 0, "data": []})).unwrap();
        let body = decode_response(&frame).unwrap();
        assert_eq!(body, br#"{"code":0,"data":[]}"#);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let payload = vec![b'a'; MAX_FRAME_LEN];
        let err = FrameCodec::new(KEY).seal(&payload, NOW).unwrap_err();
        assert!(matches!(err, FrameError::Oversized(_)));
    }
}
