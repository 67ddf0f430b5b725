//! Frame reassembly
//!
//! Turns the raw chunks read from one channel into complete
//! `header ‖ payload` frames. A read may carry part of a frame, exactly one
//! frame, or several frames plus the start of the next one.

use crate::network::constants::{MAX_BUF_LEN, MSG_HDR_LEN};
use crate::network::message::{FrameError, MessageHeader};
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    AwaitingHeader,
    AwaitingPayload { still_needed: usize },
}

/// Per-channel reassembly buffer
///
/// `pending` only ever holds the bytes of the frame currently being built:
/// a partial header, or a full header followed by part of its payload.
#[derive(Debug)]
pub struct Reassembler {
    magic: u32,
    pending: BytesMut,
    state: RxState,
}

impl Reassembler {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            pending: BytesMut::with_capacity(MSG_HDR_LEN),
            state: RxState::AwaitingHeader,
        }
    }

    /// Bytes of the current frame still missing, 0 while reading a header
    pub fn still_needed(&self) -> usize {
        match self.state {
            RxState::AwaitingHeader => 0,
            RxState::AwaitingPayload { still_needed } => still_needed,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state == RxState::AwaitingHeader && self.pending.is_empty()
    }

    /// Consume one chunk, pushing every completed frame onto `out`
    ///
    /// An invalid header drops everything buffered plus the rest of the chunk
    /// and leaves the reassembler waiting for a fresh header. Frames completed
    /// earlier in the same chunk are still pushed.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) -> Result<(), FrameError> {
        let mut cursor = 0;

        while cursor < chunk.len() {
            match self.state {
                RxState::AwaitingHeader => {
                    let want = MSG_HDR_LEN - self.pending.len();
                    let take = want.min(chunk.len() - cursor);
                    self.pending
                        .extend_from_slice(&chunk[cursor..cursor + take]);
                    cursor += take;

                    if self.pending.len() < MSG_HDR_LEN {
                        break;
                    }

                    let header = match MessageHeader::decode_valid(&self.pending, self.magic) {
                        Ok(header) => header,
                        Err(e) => {
                            self.reset();
                            return Err(e);
                        }
                    };

                    let payload_len = header.payload_len();
                    if payload_len == 0 {
                        out.push(self.pending.split().freeze());
                    } else {
                        // grow with the data actually received
                        self.pending.reserve(payload_len.min(MAX_BUF_LEN));
                        self.state = RxState::AwaitingPayload {
                            still_needed: payload_len,
                        };
                    }
                }
                RxState::AwaitingPayload { still_needed } => {
                    let take = still_needed.min(chunk.len() - cursor);
                    self.pending
                        .extend_from_slice(&chunk[cursor..cursor + take]);
                    cursor += take;

                    if take == still_needed {
                        out.push(self.pending.split().freeze());
                        self.state = RxState::AwaitingHeader;
                    } else {
                        self.state = RxState::AwaitingPayload {
                            still_needed: still_needed - take,
                        };
                    }
                }
            }
        }

        Ok(())
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.pending.clear();
        self.state = RxState::AwaitingHeader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::constants::NETWORK_MAGIC;
    use crate::network::message::build_frame;

    fn sample_frames() -> Vec<Bytes> {
        vec![
            build_frame(NETWORK_MAGIC, "ping", b"{\"height\":1}"),
            build_frame(NETWORK_MAGIC, "verack", b""),
            build_frame(NETWORK_MAGIC, "block", &vec![7u8; 1000]),
            build_frame(NETWORK_MAGIC, "tx", b"x"),
        ]
    }

    fn concat(frames: &[Bytes]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.iter().copied()).collect()
    }

    fn feed_in_chunks(stream: &[u8], sizes: &[usize]) -> Vec<Bytes> {
        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();
        let mut pos = 0;
        let mut i = 0;
        while pos < stream.len() {
            let size = sizes[i % sizes.len()].max(1);
            let end = (pos + size).min(stream.len());
            rx.feed(&stream[pos..end], &mut out).unwrap();
            pos = end;
            i += 1;
        }
        assert!(rx.is_idle());
        out
    }

    #[test]
    fn test_single_byte_chunks() {
        let frames = sample_frames();
        let stream = concat(&frames);
        assert_eq!(feed_in_chunks(&stream, &[1]), frames);
    }

    #[test]
    fn test_irregular_chunks() {
        let frames = sample_frames();
        let stream = concat(&frames);
        let patterns: Vec<Vec<usize>> = vec![
            vec![3, 17, 250],
            vec![23, 25],
            vec![24],
            vec![1024],
            vec![5, 1, 999],
        ];
        for sizes in &patterns {
            assert_eq!(feed_in_chunks(&stream, sizes), frames);
        }
    }

    #[test]
    fn test_boundaries_on_header_and_payload_edges() {
        let frame = build_frame(NETWORK_MAGIC, "block", &[9u8; 40]);
        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();

        rx.feed(&frame[..MSG_HDR_LEN], &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(rx.still_needed(), 40);
        assert_eq!(rx.pending_len(), MSG_HDR_LEN);

        rx.feed(&frame[MSG_HDR_LEN..], &mut out).unwrap();
        assert_eq!(out, vec![frame]);
        assert!(rx.is_idle());
    }

    #[test]
    fn test_many_frames_in_one_read() {
        let frames = sample_frames();
        let mut stream = concat(&frames);
        let trailing = build_frame(NETWORK_MAGIC, "pong", b"{}");
        stream.extend_from_slice(&trailing[..10]);

        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();
        rx.feed(&stream, &mut out).unwrap();
        assert_eq!(out, frames);
        assert_eq!(rx.pending_len(), 10);

        out.clear();
        rx.feed(&trailing[10..], &mut out).unwrap();
        assert_eq!(out, vec![trailing]);
    }

    #[test]
    fn test_partial_header_is_silent() {
        let frame = build_frame(NETWORK_MAGIC, "ping", b"{}");
        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();

        rx.feed(&frame[..MSG_HDR_LEN - 1], &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(rx.still_needed(), 0);

        rx.feed(&frame[MSG_HDR_LEN - 1..], &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_invalid_header_discards_and_recovers() {
        let bad = build_frame(0x0102_0304, "ping", b"{}");
        let good = build_frame(NETWORK_MAGIC, "pong", b"{}");
        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();

        let mut chunk = bad.to_vec();
        chunk.extend_from_slice(&good);
        assert!(rx.feed(&chunk, &mut out).is_err());
        assert!(out.is_empty());
        assert!(rx.is_idle());

        rx.feed(&good, &mut out).unwrap();
        assert_eq!(out, vec![good]);
    }

    #[test]
    fn test_frames_before_bad_header_are_kept() {
        let good = build_frame(NETWORK_MAGIC, "ping", b"{}");
        let mut chunk = good.to_vec();
        chunk.extend_from_slice(&[0xffu8; MSG_HDR_LEN]);

        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();
        assert!(rx.feed(&chunk, &mut out).is_err());
        assert_eq!(out, vec![good]);
    }

    #[test]
    fn test_large_declared_length_reserves_bounded_buffer() {
        use crate::network::constants::MAX_PAYLOAD_LEN;

        let frame = build_frame(NETWORK_MAGIC, "block", b"");
        let mut header = frame[..MSG_HDR_LEN].to_vec();
        header[16..20].copy_from_slice(&(MAX_PAYLOAD_LEN as u32).to_le_bytes());

        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();
        rx.feed(&header, &mut out).unwrap();
        assert_eq!(rx.still_needed(), MAX_PAYLOAD_LEN);
        assert!(rx.pending.capacity() <= MSG_HDR_LEN + MAX_BUF_LEN);
    }

    #[test]
    fn test_garbage_does_not_hang() {
        let mut rx = Reassembler::new(NETWORK_MAGIC);
        let mut out = Vec::new();
        let garbage: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        for chunk in garbage.chunks(97) {
            let _ = rx.feed(chunk, &mut out);
        }
        assert!(out.is_empty());
    }
}
