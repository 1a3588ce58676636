//! Extracts an in-band OSC-framed control protocol from an otherwise opaque
//! PTY output byte stream.
//!
//! Each control frame is `ESC ] <prefix> <json-payload> (BEL|ST)` where
//! `<prefix>` is the constant [`CONTROL_PREFIX`]. Everything else is plain
//! terminal output and is forwarded to the data sink unchanged.
//!
//! [`PtyDemux::feed`] may be called many times for the logical stream of one
//! PTY; all state needed to resume mid-frame across calls lives in `self`.

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const CONTROL_PREFIX: &[u8] = b"1337;BlockCtl;";

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

/// A parsed control frame's payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlFrame {
    pub command: String,
    #[serde(default)]
    pub data: Json,
    #[serde(default)]
    pub reqid: Option<String>,
    #[serde(default)]
    pub resid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Esc,
    CtlEsc,
    /// Inside `CtlEsc`, just saw an `ESC` and is waiting to see whether the
    /// next byte is `\` (completing an ST terminator) or something else
    /// (the `ESC` wasn't a terminator after all).
    CtlEscEsc,
}

/// Byte-stream demultiplexer. Forwards data bytes to a `data` sink
/// (`FnMut(&[u8])`) and parsed control frames to a `control` sink
/// (`FnMut(ControlFrame)`), carrying buffered state across `feed` calls.
pub struct PtyDemux {
    state: State,
    /// Bytes seen so far that might still turn out to be a prefix/frame;
    /// flushed to the data sink verbatim on mismatch or abort.
    pending: Vec<u8>,
    /// How many prefix bytes have matched so far, while in `Esc`.
    prefix_matched: usize,
    /// Accumulated payload bytes while in `CtlEsc`.
    payload: Vec<u8>,
}

impl PtyDemux {
    pub fn new() -> Self {
        PtyDemux { state: State::Normal, pending: Vec::new(), prefix_matched: 0, payload: Vec::new() }
    }

    pub fn feed(&mut self, chunk: &[u8], mut data: impl FnMut(&[u8]), mut control: impl FnMut(ControlFrame)) {
        for &b in chunk {
            self.feed_byte(b, &mut data, &mut control);
        }
    }

    fn feed_byte(&mut self, b: u8, data: &mut impl FnMut(&[u8]), control: &mut impl FnMut(ControlFrame)) {
        match self.state {
            State::Normal => {
                if b == ESC {
                    self.pending.clear();
                    self.pending.push(b);
                    self.prefix_matched = 0;
                    self.state = State::Esc;
                } else {
                    data(&[b]);
                }
            }
            State::Esc => {
                if self.pending.len() == 1 {
                    // expecting ']'
                    if b == b']' {
                        self.pending.push(b);
                    } else {
                        self.abort_to_data(data);
                        self.feed_byte(b, data, control);
                    }
                    return;
                }
                if b == ESC || b == BEL {
                    self.abort_to_data(data);
                    self.feed_byte(b, data, control);
                    return;
                }
                if self.prefix_matched < CONTROL_PREFIX.len() && b == CONTROL_PREFIX[self.prefix_matched] {
                    self.pending.push(b);
                    self.prefix_matched += 1;
                    if self.prefix_matched == CONTROL_PREFIX.len() {
                        self.pending.clear();
                        self.payload.clear();
                        self.state = State::CtlEsc;
                    }
                } else {
                    self.abort_to_data(data);
                    self.feed_byte(b, data, control);
                }
            }
            State::CtlEsc => {
                if b == BEL {
                    self.finish_frame(control);
                    self.state = State::Normal;
                    return;
                }
                if b == ESC {
                    // might be the start of ST (`ESC \`); decide on the next byte.
                    self.state = State::CtlEscEsc;
                    return;
                }
                self.payload.push(b);
            }
            State::CtlEscEsc => {
                if b == b'\\' {
                    self.finish_frame(control);
                    self.state = State::Normal;
                    return;
                }
                // the ESC wasn't ST after all: dump the payload as raw data
                // and reprocess both the ESC and this byte from Normal.
                let raw = std::mem::take(&mut self.payload);
                data(&raw);
                self.state = State::Normal;
                self.feed_byte(ESC, data, control);
                self.feed_byte(b, data, control);
            }
        }
    }

    fn abort_to_data(&mut self, data: &mut impl FnMut(&[u8])) {
        let raw = std::mem::take(&mut self.pending);
        data(&raw);
        self.prefix_matched = 0;
        self.state = State::Normal;
    }

    fn finish_frame(&mut self, control: &mut impl FnMut(ControlFrame)) {
        let payload = std::mem::take(&mut self.payload);
        match serde_json::from_slice::<ControlFrame>(&payload) {
            Ok(frame) => control(frame),
            Err(e) => warn!("discarding malformed control frame ({} bytes): {}", payload.len(), e),
        }
    }
}

impl Default for PtyDemux {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a well-formed control frame for writing back into the PTY (used by
/// the controller's rpc-out worker thread).
pub fn encode_frame(frame: &ControlFrame) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(ESC);
    out.push(b']');
    out.extend_from_slice(CONTROL_PREFIX);
    out.extend_from_slice(&serde_json::to_vec(frame).expect("ControlFrame always serializes"));
    out.push(BEL);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> (Vec<u8>, Vec<ControlFrame>) {
        let mut demux = PtyDemux::new();
        let mut data = Vec::new();
        let mut frames = Vec::new();
        demux.feed(input, |b| data.extend_from_slice(b), |f| frames.push(f));
        (data, frames)
    }

    #[test]
    fn passes_plain_bytes_unchanged() {
        let (data, frames) = run(b"hello world\r\n");
        assert_eq!(data, b"hello world\r\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn extracts_single_frame() {
        let frame =
            ControlFrame { command: "ping".into(), data: serde_json::json!({"n": 1}), reqid: None, resid: None };
        let encoded = encode_frame(&frame);
        let (data, frames) = run(&encoded);
        assert!(data.is_empty());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn frame_interleaved_with_data() {
        let frame = ControlFrame { command: "x".into(), data: Json::Null, reqid: None, resid: None };
        let mut input = b"before".to_vec();
        input.extend_from_slice(&encode_frame(&frame));
        input.extend_from_slice(b"after");
        let (data, frames) = run(&input);
        assert_eq!(data, b"beforeafter");
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn escape_not_matching_prefix_is_flushed_unchanged() {
        let (data, frames) = run(b"\x1b[31mred\x1b[0m");
        assert_eq!(data, b"\x1b[31mred\x1b[0m");
        assert!(frames.is_empty());
    }

    #[test]
    fn buffered_state_survives_chunk_boundary() {
        let frame = ControlFrame { command: "split".into(), data: Json::Null, reqid: None, resid: None };
        let encoded = encode_frame(&frame);
        let mid = encoded.len() / 2;
        let mut demux = PtyDemux::new();
        let mut data = Vec::new();
        let mut frames = Vec::new();
        demux.feed(&encoded[..mid], |b| data.extend_from_slice(b), |f| frames.push(f));
        demux.feed(&encoded[mid..], |b| data.extend_from_slice(b), |f| frames.push(f));
        assert!(data.is_empty());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn payload_with_backslash_is_not_truncated() {
        let frame = ControlFrame {
            command: "x".into(),
            data: serde_json::json!({"path": "C:\\Users\\a", "msg": "a\"b"}),
            reqid: None,
            resid: None,
        };
        let encoded = encode_frame(&frame);
        let (data, frames) = run(&encoded);
        assert!(data.is_empty());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn st_terminated_frame_is_extracted() {
        let frame = ControlFrame { command: "st".into(), data: Json::Null, reqid: None, resid: None };
        let mut input = vec![ESC, b']'];
        input.extend_from_slice(CONTROL_PREFIX);
        input.extend_from_slice(&serde_json::to_vec(&frame).unwrap());
        input.push(ESC);
        input.push(b'\\');
        let (data, frames) = run(&input);
        assert!(data.is_empty());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn malformed_payload_is_dropped_not_forwarded() {
        let mut input = vec![ESC, b']'];
        input.extend_from_slice(CONTROL_PREFIX);
        input.extend_from_slice(b"not json");
        input.push(BEL);
        let (data, frames) = run(&input);
        assert!(data.is_empty());
        assert!(frames.is_empty());
    }
}
