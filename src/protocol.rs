use crate::error::{LockError, Result};

/// Version marker written as the first byte of every packet. Peers running
/// an incompatible codec reject the packet instead of misparsing it.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed wire size: version byte + big-endian lock id + type byte.
pub const MAX_PACKET_BYTES: usize = 1 + 8 + 1;

/// Discriminant values are part of the wire contract and must match across
/// every process sharing the cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    UnlockRequest = 1,
    UnlockRequestConfirmation = 2,
    LockReleaseConfirmation = 3,
}

impl PacketType {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::UnlockRequest),
            2 => Ok(Self::UnlockRequestConfirmation),
            3 => Ok(Self::LockReleaseConfirmation),
            other => Err(LockError::Decode(format!("unknown packet type {other}"))),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnlockRequest => write!(f, "unlock_request"),
            Self::UnlockRequestConfirmation => write!(f, "unlock_request_confirmation"),
            Self::LockReleaseConfirmation => write!(f, "lock_release_confirmation"),
        }
    }
}

/// A decoded contention message: which lock, and what the sender wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub lock_id: u64,
    pub packet_type: PacketType,
}

pub fn encode(lock_id: u64, packet_type: PacketType) -> [u8; MAX_PACKET_BYTES] {
    let mut payload = [0u8; MAX_PACKET_BYTES];
    payload[0] = PROTOCOL_VERSION;
    payload[1..9].copy_from_slice(&lock_id.to_be_bytes());
    payload[9] = packet_type as u8;
    payload
}

pub fn decode(payload: &[u8]) -> Result<Packet> {
    if payload.len() < MAX_PACKET_BYTES {
        return Err(LockError::Decode(format!(
            "packet too short: {} bytes, expected {MAX_PACKET_BYTES}",
            payload.len()
        )));
    }
    if payload[0] != PROTOCOL_VERSION {
        return Err(LockError::Decode(format!(
            "unknown protocol version {}, expected {PROTOCOL_VERSION}",
            payload[0]
        )));
    }
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&payload[1..9]);
    Ok(Packet {
        lock_id: u64::from_be_bytes(id_bytes),
        packet_type: PacketType::from_byte(payload[9])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_packet_types() {
        for packet_type in [
            PacketType::UnlockRequest,
            PacketType::UnlockRequestConfirmation,
            PacketType::LockReleaseConfirmation,
        ] {
            for lock_id in [0, 1, 42, u64::MAX] {
                let decoded = decode(&encode(lock_id, packet_type)).unwrap();
                assert_eq!(decoded.lock_id, lock_id);
                assert_eq!(decoded.packet_type, packet_type);
            }
        }
    }

    #[test]
    fn wire_layout_is_stable() {
        let payload = encode(0x0102_0304_0506_0708, PacketType::LockReleaseConfirmation);
        assert_eq!(
            payload,
            [1, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 3]
        );
    }

    #[test]
    fn truncated_packet_fails_to_decode() {
        let payload = encode(7, PacketType::UnlockRequest);
        for len in 0..MAX_PACKET_BYTES {
            let err = decode(&payload[..len]).unwrap_err();
            assert_eq!(err.code(), "decode_error");
        }
    }

    #[test]
    fn unknown_version_fails_to_decode() {
        let mut payload = encode(7, PacketType::UnlockRequest);
        payload[0] = 9;
        assert!(decode(&payload).is_err());
    }

    #[test]
    fn unknown_packet_type_fails_to_decode() {
        let mut payload = encode(7, PacketType::UnlockRequest);
        payload[9] = 0;
        assert!(decode(&payload).is_err());
        payload[9] = 4;
        assert!(decode(&payload).is_err());
    }
}
