//! Envelope encoding and stream framing for the Veil wire protocol.
//!
//! A [`Packet`] is CBOR-serialized into an envelope body. On a stream each
//! body is preceded by a 4-byte little-endian length header:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (LE)  | body: CBOR(Packet), len B |
//! +----------------+---------------------------+
//! ```
//!
//! [`encode`] and [`decode`] are pure: they touch no sockets and no circuit
//! state, so a relay can reject garbage before doing any work for it.

use crate::cbor;
use crate::messages::Packet;
use crate::TransportError;

/// Maximum envelope body size (to prevent allocation attacks).
pub const MAX_ENVELOPE_SIZE: usize = 65536;

/// Length of the frame header.
pub const HEADER_SIZE: usize = 4;

/// Serialize a packet to an envelope body.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] if the packet cannot be encoded
/// or the encoded body exceeds [`MAX_ENVELOPE_SIZE`].
pub fn encode(packet: &Packet) -> Result<Vec<u8>, TransportError> {
    let body = cbor::to_vec(packet)?;
    if body.len() > MAX_ENVELOPE_SIZE {
        return Err(TransportError::Serialization(format!(
            "envelope too large: {} bytes, max {MAX_ENVELOPE_SIZE}",
            body.len()
        )));
    }
    Ok(body)
}

/// Parse an envelope body.
///
/// # Errors
///
/// Returns [`TransportError::MalformedPacket`] for oversized input, bytes
/// that are not CBOR, or an unknown `type` or `command`.
pub fn decode(body: &[u8]) -> Result<Packet, TransportError> {
    if body.len() > MAX_ENVELOPE_SIZE {
        return Err(TransportError::MalformedPacket(format!(
            "envelope too large: {} bytes, max {MAX_ENVELOPE_SIZE}",
            body.len()
        )));
    }
    cbor::from_slice(body)
}

/// Prefix `body` with its length header.
pub fn frame(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = u32::try_from(body.len())
        .map_err(|_| TransportError::Serialization("frame length overflows u32".into()))?;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Incremental de-framer for byte streams that may split or coalesce frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame body, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MalformedPacket`] if the header announces a
    /// body larger than [`MAX_ENVELOPE_SIZE`]. The decoder should be dropped
    /// afterwards since the stream can no longer be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buf[..HEADER_SIZE]);
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_ENVELOPE_SIZE {
            return Err(TransportError::MalformedPacket(format!(
                "frame too large: {len} bytes, max {MAX_ENVELOPE_SIZE}"
            )));
        }
        if self.buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        let body = self.buf[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        self.buf.drain(..HEADER_SIZE + len);
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ControlCell, DirectoryMessage};
    use veil_types::{CircuitId, Direction, NodeRegistration};

    fn sample_packets() -> Vec<Packet> {
        vec![
            DirectoryMessage::Query {
                context: String::new(),
            }
            .into(),
            DirectoryMessage::Update {
                address: "127.0.0.1".into(),
                port: 5001,
                public_key: [7u8; 32],
            }
            .into(),
            DirectoryMessage::Answer {
                registry: vec![NodeRegistration::new("127.0.0.1", 5001, [7u8; 32])],
            }
            .into(),
            ControlCell::Create {
                circuit_id: CircuitId(u64::MAX),
                public_value: [1u8; 32],
                relayed: true,
            }
            .into(),
            ControlCell::Created {
                circuit_id: CircuitId(2),
                public_value: [2u8; 32],
                confirmation: [3u8; 32],
            }
            .into(),
            ControlCell::Relay {
                circuit_id: CircuitId(5),
                direction: Direction::Outbound,
                payload: b"layered".to_vec(),
            }
            .into(),
        ]
    }

    #[test]
    fn test_every_command_survives_encoding() {
        for packet in sample_packets() {
            let body = encode(&packet).expect("encode");
            let decoded = decode(&body).expect("decode");
            assert_eq!(decoded, packet, "{:?}", packet.kind());
        }
    }

    #[test]
    fn test_unknown_command_is_malformed() {
        #[derive(serde::Serialize)]
        struct Bogus {
            #[serde(rename = "type")]
            kind: &'static str,
            command: &'static str,
        }
        let body = cbor::to_vec(&Bogus {
            kind: "control",
            command: "destroy",
        })
        .expect("serialize");
        assert!(matches!(decode(&body), Err(TransportError::MalformedPacket(_))));
    }

    #[test]
    fn test_cleartext_extend_is_not_an_envelope() {
        #[derive(serde::Serialize)]
        struct Extend {
            #[serde(rename = "type")]
            kind: &'static str,
            command: &'static str,
            circuit_id: u64,
            address: &'static str,
            port: u16,
        }
        let body = cbor::to_vec(&Extend {
            kind: "control",
            command: "extend",
            circuit_id: 3,
            address: "127.0.0.1",
            port: 6000,
        })
        .expect("serialize");
        assert!(matches!(decode(&body), Err(TransportError::MalformedPacket(_))));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        #[derive(serde::Serialize)]
        struct Bogus {
            #[serde(rename = "type")]
            kind: &'static str,
            command: &'static str,
        }
        let body = cbor::to_vec(&Bogus {
            kind: "gossip",
            command: "query",
        })
        .expect("serialize");
        assert!(matches!(decode(&body), Err(TransportError::MalformedPacket(_))));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        #[derive(serde::Serialize)]
        struct Partial {
            #[serde(rename = "type")]
            kind: &'static str,
            command: &'static str,
            circuit_id: u64,
        }
        let body = cbor::to_vec(&Partial {
            kind: "control",
            command: "relay",
            circuit_id: 1,
        })
        .expect("serialize");
        assert!(matches!(decode(&body), Err(TransportError::MalformedPacket(_))));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            decode(b"not cbor at all"),
            Err(TransportError::MalformedPacket(_))
        ));
        assert!(matches!(decode(&[]), Err(TransportError::MalformedPacket(_))));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let body = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(decode(&body), Err(TransportError::MalformedPacket(_))));
    }

    #[test]
    fn test_frame_header_is_little_endian() {
        let framed = frame(&[0xAA; 258]).expect("frame");
        assert_eq!(&framed[..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(framed.len(), 262);
    }

    #[test]
    fn test_decoder_handles_split_and_coalesced_frames() {
        let a = frame(b"first").expect("frame");
        let b = frame(b"second").expect("frame");
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        // Feed one byte at a time up to the middle of the second frame.
        let split = a.len() + 3;
        for byte in &stream[..split] {
            decoder.push(std::slice::from_ref(byte));
        }
        assert_eq!(
            decoder.next_frame().expect("ok"),
            Some(b"first".to_vec())
        );
        assert_eq!(decoder.next_frame().expect("ok"), None);

        decoder.push(&stream[split..]);
        assert_eq!(
            decoder.next_frame().expect("ok"),
            Some(b"second".to_vec())
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_oversized_header() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(TransportError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_empty_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame(&[]).expect("frame"));
        assert_eq!(decoder.next_frame().expect("ok"), Some(Vec::new()));
    }
}
