//! Wire format for gateway streams.
//!
//! Every record starts with a one-byte event code; the header that follows
//! depends on the framing shape:
//!
//! ```text
//! START / ONE:   [event:1][stream_type:1][varint id][data]
//! NEXT / END:    [event:1][varint id][varint seqno][data]
//! STOP:          [event:1][varint id][reason bytes]
//! FIX:           [event:1][varint id][varint seqno]
//! ERROR:         [event:1][varint id][varint seqno][reason bytes]
//! ```
//!
//! `id` is the transport position at which the stream's first packet was
//! written; it is both the correlation key and implicitly ordered. Integers
//! are little-endian base-128 varints, at most [`MAX_VARINT_LEN`] bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{GatewayError, Result};
use crate::gateway::StreamPart;

/// A 64-bit value never takes more than ten varint bytes.
pub const MAX_VARINT_LEN: usize = 10;

// =============================================================================
// Event codes
// =============================================================================

/// Wire event codes; one byte each, shared by both framing directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamEvent {
    /// First packet of a stream, more will follow.
    Start = 1,
    /// First and only packet.
    One = 2,
    /// Continuation, more will follow.
    Next = 3,
    /// Final continuation.
    End = 4,
    /// Ask the sender to stop emitting parts.
    Stop = 5,
    /// Ask for a resend of a missing part.
    Fix = 6,
    /// Report a stream-level error.
    Error = 7,
}

impl StreamEvent {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Start),
            2 => Some(Self::One),
            3 => Some(Self::Next),
            4 => Some(Self::End),
            5 => Some(Self::Stop),
            6 => Some(Self::Fix),
            7 => Some(Self::Error),
            _ => None,
        }
    }

    /// START and ONE open a stream and are the only packets carrying a
    /// stream type on the wire.
    pub fn is_first_packet(self) -> bool {
        matches!(self, Self::Start | Self::One)
    }
}

// =============================================================================
// Varint codec
// =============================================================================

/// Append `v` to `buf` as a little-endian base-128 varint.
pub fn put_varint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Encode `v` as a standalone varint buffer, 1-10 bytes.
pub fn encode_varint(v: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN);
    put_varint(&mut buf, v);
    buf.freeze()
}

/// Decode one varint from `data` starting at `*pos`, advancing `*pos` past it.
///
/// Reads at most `min(data.len() - *pos, 10)` bytes. Fails with `Truncated`
/// when the extent runs out before a terminator byte; a full ten-byte read is
/// accepted as-is, the cap bounds the read rather than validating continuation
/// bits past it.
pub fn decode_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let len = data.len();
    if len == 0 || *pos >= len {
        return Err(GatewayError::Truncated { offset: *pos, len });
    }

    let cap = (len - *pos).min(MAX_VARINT_LEN);
    let mut value = 0u64;
    for i in 0..cap {
        let byte = data[*pos + i];
        value |= u64::from(byte & 0x7f) << (7 * i as u32);
        if byte & 0x80 == 0 {
            *pos += i + 1;
            return Ok(value);
        }
    }

    if cap == MAX_VARINT_LEN {
        *pos += MAX_VARINT_LEN;
        Ok(value)
    } else {
        Err(GatewayError::Truncated {
            offset: *pos + cap,
            len,
        })
    }
}

// =============================================================================
// Frame construction
// =============================================================================

/// One outbound frame, ready to be rendered into wire segments.
///
/// Each variant carries only the fields its framing shape needs; `segments`
/// is the single place the header layouts live on the send side.
#[derive(Debug, Clone)]
pub enum Frame {
    Single {
        stream_type: u8,
        id: u64,
        data: Bytes,
    },
    Start {
        stream_type: u8,
        id: u64,
        data: Bytes,
    },
    Next {
        id: u64,
        seqno: u64,
        data: Bytes,
    },
    Last {
        id: u64,
        seqno: u64,
        data: Bytes,
    },
    Stop {
        id: u64,
        reason: Bytes,
    },
    Fix {
        id: u64,
        seqno: u64,
    },
    Error {
        id: u64,
        seqno: u64,
        reason: Bytes,
    },
}

impl Frame {
    pub fn event(&self) -> StreamEvent {
        match self {
            Frame::Single { .. } => StreamEvent::One,
            Frame::Start { .. } => StreamEvent::Start,
            Frame::Next { .. } => StreamEvent::Next,
            Frame::Last { .. } => StreamEvent::End,
            Frame::Stop { .. } => StreamEvent::Stop,
            Frame::Fix { .. } => StreamEvent::Fix,
            Frame::Error { .. } => StreamEvent::Error,
        }
    }

    /// Render the frame as scatter-gather segments, header first.
    ///
    /// An empty payload yields no payload segment at all rather than a
    /// zero-length one.
    pub fn segments(&self) -> Vec<Bytes> {
        match self {
            Frame::Single {
                stream_type,
                id,
                data,
            }
            | Frame::Start {
                stream_type,
                id,
                data,
            } => {
                let mut header = BytesMut::with_capacity(2 + MAX_VARINT_LEN);
                header.put_u8(self.event() as u8);
                header.put_u8(*stream_type);
                put_varint(&mut header, *id);
                with_payload(header.freeze(), data)
            }
            Frame::Next { id, seqno, data } | Frame::Last { id, seqno, data } => {
                let mut header = BytesMut::with_capacity(1 + 2 * MAX_VARINT_LEN);
                header.put_u8(self.event() as u8);
                put_varint(&mut header, *id);
                put_varint(&mut header, *seqno);
                with_payload(header.freeze(), data)
            }
            Frame::Stop { id, reason } => {
                let mut header = BytesMut::with_capacity(1 + MAX_VARINT_LEN);
                header.put_u8(StreamEvent::Stop as u8);
                put_varint(&mut header, *id);
                with_payload(header.freeze(), reason)
            }
            Frame::Fix { id, seqno } => {
                let mut header = BytesMut::with_capacity(1 + 2 * MAX_VARINT_LEN);
                header.put_u8(StreamEvent::Fix as u8);
                put_varint(&mut header, *id);
                put_varint(&mut header, *seqno);
                vec![header.freeze()]
            }
            Frame::Error { id, seqno, reason } => {
                let mut header = BytesMut::with_capacity(1 + 2 * MAX_VARINT_LEN);
                header.put_u8(StreamEvent::Error as u8);
                put_varint(&mut header, *id);
                put_varint(&mut header, *seqno);
                with_payload(header.freeze(), reason)
            }
        }
    }

    /// Contiguous rendering of `segments`, mostly for tests and benches.
    pub fn encode(&self) -> Bytes {
        let segments = self.segments();
        let total = segments.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for s in &segments {
            buf.extend_from_slice(s);
        }
        buf.freeze()
    }
}

fn with_payload(header: Bytes, data: &Bytes) -> Vec<Bytes> {
    if data.is_empty() {
        vec![header]
    } else {
        vec![header, data.clone()]
    }
}

// =============================================================================
// Record decoding
// =============================================================================

/// Decode one pulled record into a [`StreamPart`].
///
/// Dispatches on the first byte. Unknown event codes and records too short to
/// carry their declared header fail with `BadMessage`/`Truncated`; the payload
/// view (reason bytes, for control frames) is whatever follows the header.
pub fn decode_record(position: u64, data: &[u8]) -> Result<StreamPart> {
    if data.len() < 2 {
        return Err(GatewayError::BadMessage(format!(
            "record too short: {} bytes",
            data.len()
        )));
    }
    let event = StreamEvent::from_u8(data[0])
        .ok_or_else(|| GatewayError::BadMessage(format!("unknown event code: {}", data[0])))?;

    let mut part = StreamPart {
        position,
        total_bytes: data.len() as u64,
        event: event as u8,
        ..StreamPart::default()
    };

    match event {
        StreamEvent::Start | StreamEvent::One => {
            part.stream_type = data[1];
            let mut pos = 2usize;
            part.id = decode_varint(data, &mut pos)?;
            part.buffer = Bytes::copy_from_slice(&data[pos..]);
        }
        StreamEvent::Next | StreamEvent::End | StreamEvent::Fix | StreamEvent::Error => {
            let mut pos = 1usize;
            part.id = decode_varint(data, &mut pos)?;
            part.seqno = decode_varint(data, &mut pos)?;
            part.buffer = Bytes::copy_from_slice(&data[pos..]);
        }
        StreamEvent::Stop => {
            let mut pos = 1usize;
            part.id = decode_varint(data, &mut pos)?;
            part.buffer = Bytes::copy_from_slice(&data[pos..]);
        }
    }

    Ok(part)
}

// =============================================================================
// Tests
// =============================================================================
