//! Wire record shared by the registration and simulation channels.
//!
//! Format (big-endian):
//! - 1 byte: kind
//! - 4 bytes: sender (u32)
//! - 4 bytes: iteration (u32)
//! - 2 bytes: payload length (u16)
//! - payload length bytes: payload (UTF-8)

use std::fmt;

use crate::gl_error::{GlError, Result};
use crate::gl_interface::{Iteration, PeerId, MAX_DATAGRAM_SIZE};

pub const HEADER_SIZE: usize = 11;

/// Largest payload that still fits one datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// coordinator -> peer: begin the round loop
    Start = 1,
    /// peer -> coordinator: payload is the peer's UDP port
    RegisterRequest = 2,
    /// coordinator -> peer: sender is the assigned id, payload "group,V", iteration S
    RegisterReply = 3,
    /// peer -> coordinator -> group peers: round payload
    Broadcast = 4,
    /// round acknowledgment, see `Message::ack` / `Message::relayed_ack`
    Ack = 5,
    /// peer -> coordinator: payload is the mean round time in ms
    Done = 6,
    /// coordinator -> peer: whole group finished, safe to disconnect
    GroupRelease = 7,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Start),
            2 => Some(Self::RegisterRequest),
            3 => Some(Self::RegisterReply),
            4 => Some(Self::Broadcast),
            5 => Some(Self::Ack),
            6 => Some(Self::Done),
            7 => Some(Self::GroupRelease),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Start => "START",
            MessageKind::RegisterRequest => "REGISTER_REQUEST",
            MessageKind::RegisterReply => "REGISTER_REPLY",
            MessageKind::Broadcast => "BROADCAST",
            MessageKind::Ack => "ACK",
            MessageKind::Done => "DONE",
            MessageKind::GroupRelease => "GROUP_RELEASE",
        };
        f.write_str(name)
    }
}

/// Immutable once built; relaying always constructs a new one per hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: PeerId,
    pub iteration: Iteration,
    pub payload: String,
}

impl Message {
    pub fn new(kind: MessageKind, sender: PeerId, payload: impl Into<String>, iteration: Iteration) -> Self {
        Self {
            kind,
            sender,
            iteration,
            payload: payload.into(),
        }
    }

    pub fn start(receiver: PeerId) -> Self {
        Self::new(MessageKind::Start, receiver, "", 0)
    }

    pub fn broadcast(sender: PeerId, payload: impl Into<String>, iteration: Iteration) -> Self {
        Self::new(MessageKind::Broadcast, sender, payload, iteration)
    }

    /// Peer -> coordinator: `acker` confirms `broadcaster`'s round `iteration`
    pub fn ack(acker: PeerId, broadcaster: PeerId, iteration: Iteration) -> Self {
        Self::new(MessageKind::Ack, acker, broadcaster.to_string(), iteration)
    }

    /// Coordinator -> original broadcaster
    pub fn relayed_ack(acker: PeerId, iteration: Iteration) -> Self {
        Self::new(MessageKind::Ack, acker, acker.to_string(), iteration)
    }

    pub fn done(sender: PeerId, mean_round_ms: f64, iterations: Iteration) -> Self {
        Self::new(MessageKind::Done, sender, mean_round_ms.to_string(), iterations)
    }

    pub fn group_release() -> Self {
        Self::new(MessageKind::GroupRelease, 0, "", 0)
    }

    /// Peer id carried in the payload (ACK destination)
    pub fn payload_peer(&self) -> Result<PeerId> {
        self.payload.trim().parse().map_err(|_| {
            GlError::MalformedMessage(format!(
                "{} payload {:?} is not a peer id",
                self.kind, self.payload
            ))
        })
    }

    /// Mean round time carried by a DONE message
    pub fn payload_latency(&self) -> Result<f64> {
        let value: f64 = self.payload.trim().parse().map_err(|_| {
            GlError::MalformedMessage(format!("DONE payload {:?} is not a number", self.payload))
        })?;
        if !value.is_finite() || value < 0.0 {
            return Err(GlError::MalformedMessage(format!(
                "DONE latency {} out of range",
                value
            )));
        }
        Ok(value)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload.as_bytes();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(GlError::MalformedMessage(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.sender.to_be_bytes());
        buf.extend_from_slice(&self.iteration.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(GlError::MalformedMessage(format!(
                "{} bytes is shorter than the {} byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let kind = MessageKind::from_byte(bytes[0])
            .ok_or_else(|| GlError::MalformedMessage(format!("unknown kind {}", bytes[0])))?;
        let sender = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let iteration = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let len = u16::from_be_bytes([bytes[9], bytes[10]]) as usize;

        let body = &bytes[HEADER_SIZE..];
        if body.len() != len {
            return Err(GlError::MalformedMessage(format!(
                "payload length {} but {} bytes follow the header",
                len,
                body.len()
            )));
        }

        let payload = std::str::from_utf8(body)
            .map_err(|e| GlError::MalformedMessage(format!("payload is not utf-8: {}", e)))?
            .to_string();

        Ok(Self {
            kind,
            sender,
            iteration,
            payload,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from:{} it:{} payload:{:?}",
            self.kind, self.sender, self.iteration, self.payload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let msg = Message::broadcast(0x0102_0304, "(1,2,3)", 7);
        let bytes = msg.encode().unwrap();

        assert_eq!(bytes[0], MessageKind::Broadcast as u8);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 7]);
        assert_eq!(&bytes[9..11], &[0, 7]);
        assert_eq!(&bytes[11..], b"(1,2,3)");
        assert_eq!(bytes.len(), msg.encoded_len());
    }

    #[test]
    fn test_every_kind_survives_decode() {
        let messages = vec![
            Message::start(4),
            Message::new(MessageKind::RegisterRequest, 0, "40123", 0),
            Message::new(MessageKind::RegisterReply, 5, "1,3", 2),
            Message::broadcast(2, "(10,20,30)", 1),
            Message::ack(1, 2, 1),
            Message::relayed_ack(1, 1),
            Message::done(3, 12.5, 2),
            Message::group_release(),
        ];

        for msg in messages {
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let err = Message::decode(&[4, 0, 0]).unwrap_err();
        assert!(matches!(err, GlError::MalformedMessage(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut bytes = Message::start(0).encode().unwrap();
        bytes[0] = 0x42;
        assert!(matches!(
            Message::decode(&bytes),
            Err(GlError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = Message::broadcast(1, "abc", 1).encode().unwrap();
        bytes.push(b'x');
        assert!(Message::decode(&bytes).is_err());

        let bytes = Message::broadcast(1, "abc", 1).encode().unwrap();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let mut bytes = Message::broadcast(1, "ab", 1).encode().unwrap();
        bytes[11] = 0xFF;
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let msg = Message::broadcast(1, "x".repeat(MAX_PAYLOAD_SIZE + 1), 1);
        assert!(msg.encode().is_err());

        let msg = Message::broadcast(1, "x".repeat(MAX_PAYLOAD_SIZE), 1);
        assert_eq!(msg.encode().unwrap().len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_payload_accessors() {
        assert_eq!(Message::ack(1, 9, 3).payload_peer().unwrap(), 9);
        assert!(Message::broadcast(1, "(1,2,3)", 1).payload_peer().is_err());

        assert_eq!(Message::done(1, 42.25, 2).payload_latency().unwrap(), 42.25);
        assert!(Message::new(MessageKind::Done, 1, "NaN", 2).payload_latency().is_err());
        assert!(Message::new(MessageKind::Done, 1, "-1", 2).payload_latency().is_err());
    }
}
