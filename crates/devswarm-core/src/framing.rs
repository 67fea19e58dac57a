//! Length-prefixed frame codec: a 2-byte big-endian length header followed
//! by that many bytes of payload. No magic number, unlike the teacher's
//! `PacketFrame` — the wire format here is fixed-width and simpler — but
//! the incremental, state-carrying decode loop is the same idiom.

use crate::error::{DeviceError, Result};

pub const HEADER_LEN: usize = 2;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Encodes a single payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(DeviceError::MalformedPacket(format!(
            "payload of {} bytes exceeds {} byte frame limit",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug)]
enum DecodeState {
    AwaitingHeader { partial: Vec<u8> },
    AwaitingBody { expected_len: usize, buf: Vec<u8> },
}

/// Stateful inbound decoder. Bytes arrive in arbitrary chunk boundaries —
/// a header or body can be split across any number of `push` calls, and a
/// single chunk can carry more than one complete frame.
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader { partial: Vec::with_capacity(HEADER_LEN) },
        }
    }

    /// Feeds `chunk` into the decoder, returning every frame payload
    /// completed as a result (zero, one, or many).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut cursor = 0usize;
        while cursor < chunk.len() {
            match &mut self.state {
                DecodeState::AwaitingHeader { partial } => {
                    let need = HEADER_LEN - partial.len();
                    let take = need.min(chunk.len() - cursor);
                    partial.extend_from_slice(&chunk[cursor..cursor + take]);
                    cursor += take;
                    if partial.len() == HEADER_LEN {
                        let expected_len = u16::from_be_bytes([partial[0], partial[1]]) as usize;
                        self.state = DecodeState::AwaitingBody {
                            expected_len,
                            buf: Vec::with_capacity(expected_len),
                        };
                    }
                }
                DecodeState::AwaitingBody { expected_len, buf } => {
                    let need = *expected_len - buf.len();
                    let take = need.min(chunk.len() - cursor);
                    buf.extend_from_slice(&chunk[cursor..cursor + take]);
                    cursor += take;
                    if buf.len() == *expected_len {
                        frames.push(std::mem::take(buf));
                        self.state = DecodeState::AwaitingHeader { partial: Vec::with_capacity(HEADER_LEN) };
                    }
                }
            }
        }
        frames
    }
}
