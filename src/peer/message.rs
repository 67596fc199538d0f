//! BitTorrent peer wire messages (BEP 3), plus the fast-extension (BEP 6)
//! and extension-protocol (BEP 10) message ids the state machine needs.
//!
//! Length-prefixed framing with `id`/`len` accessors, covering the full
//! message set: `suggest`/`have-all`/`have-none`/`reject`/`allowed-fast`
//! (BEP 6) and `extended` (BEP 10) alongside the BEP 3 core.

use std::io::{Error, ErrorKind};

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
    // BEP 6 fast extension
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(u32, u32, u32),
    AllowedFast(u32),
    // BEP 10 extension protocol
    Extended(u8, Vec<u8>),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => frame(0, &[]),
            Message::Unchoke => frame(1, &[]),
            Message::Interested => frame(2, &[]),
            Message::NotInterested => frame(3, &[]),
            Message::Have(index) => frame(4, &index.to_be_bytes()),
            Message::Bitfield(bitfield) => frame(5, bitfield),
            Message::Request(index, begin, length) => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(6, &payload)
            }
            Message::Piece(index, begin, block) => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(7, &payload)
            }
            Message::Cancel(index, begin, length) => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(8, &payload)
            }
            Message::Port(port) => frame(9, &port.to_be_bytes()),
            Message::Suggest(index) => frame(13, &index.to_be_bytes()),
            Message::HaveAll => frame(14, &[]),
            Message::HaveNone => frame(15, &[]),
            Message::Reject(index, begin, length) => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(16, &payload)
            }
            Message::AllowedFast(index) => frame(17, &index.to_be_bytes()),
            Message::Extended(ext_id, payload) => {
                let mut body = Vec::with_capacity(1 + payload.len());
                body.push(*ext_id);
                body.extend_from_slice(payload);
                frame(20, &body)
            }
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Message, Error> {
        if data.len() == 4 && data == [0, 0, 0, 0] {
            return Ok(Message::KeepAlive);
        }
        if data.len() < 5 {
            return Err(invalid("message too short to be valid"));
        }

        let id = data[4];
        let payload = &data[5..];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(read_u32(payload, "have")?),
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                let (index, begin, length) = read_three_u32(payload, "request")?;
                Message::Request(index, begin, length)
            }
            7 => {
                if payload.len() < 8 {
                    return Err(invalid("piece message too short"));
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                Message::Piece(index, begin, payload[8..].to_vec())
            }
            8 => {
                let (index, begin, length) = read_three_u32(payload, "cancel")?;
                Message::Cancel(index, begin, length)
            }
            9 => {
                if payload.len() != 2 {
                    return Err(invalid("port message should carry exactly 2 bytes"));
                }
                Message::Port(u16::from_be_bytes(payload.try_into().unwrap()))
            }
            13 => Message::Suggest(read_u32(payload, "suggest")?),
            14 => Message::HaveAll,
            15 => Message::HaveNone,
            16 => {
                let (index, begin, length) = read_three_u32(payload, "reject")?;
                Message::Reject(index, begin, length)
            }
            17 => Message::AllowedFast(read_u32(payload, "allowed-fast")?),
            20 => {
                if payload.is_empty() {
                    return Err(invalid("extended message missing extension id"));
                }
                Message::Extended(payload[0], payload[1..].to_vec())
            }
            other => return Err(invalid(&format!("unknown message id {other}"))),
        };
        Ok(msg)
    }

    pub fn id(&self) -> u8 {
        match self {
            Message::KeepAlive | Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request(..) => 6,
            Message::Piece(..) => 7,
            Message::Cancel(..) => 8,
            Message::Port(_) => 9,
            Message::Suggest(_) => 13,
            Message::HaveAll => 14,
            Message::HaveNone => 15,
            Message::Reject(..) => 16,
            Message::AllowedFast(_) => 17,
            Message::Extended(..) => 20,
        }
    }

    /// Wire length in bytes including the 4-byte length prefix.
    pub fn wire_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have(_) | Message::Suggest(_) | Message::AllowedFast(_) => 5,
            Message::HaveAll | Message::HaveNone => 1,
            Message::Bitfield(b) => 1 + b.len(),
            Message::Request(..) | Message::Cancel(..) | Message::Reject(..) => 13,
            Message::Piece(_, _, block) => 9 + block.len(),
            Message::Port(_) => 3,
            Message::Extended(_, payload) => 2 + payload.len(),
        }
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let len = 1 + payload.len();
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out.push(id);
    out.extend_from_slice(payload);
    out
}

fn invalid(msg: &str) -> Error {
    Error::new(ErrorKind::InvalidData, msg.to_string())
}

fn read_u32(payload: &[u8], what: &str) -> Result<u32, Error> {
    if payload.len() != 4 {
        return Err(invalid(&format!("{what} message should carry exactly 4 bytes")));
    }
    Ok(u32::from_be_bytes(payload.try_into().unwrap()))
}

fn read_three_u32(payload: &[u8], what: &str) -> Result<(u32, u32, u32), Error> {
    if payload.len() != 12 {
        return Err(invalid(&format!("{what} message should carry exactly 12 bytes")));
    }
    Ok((
        u32::from_be_bytes(payload[0..4].try_into().unwrap()),
        u32::from_be_bytes(payload[4..8].try_into().unwrap()),
        u32::from_be_bytes(payload[8..12].try_into().unwrap()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let bytes = Message::KeepAlive.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn choke_round_trips() {
        let bytes = Message::Choke.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::Choke);
    }

    #[test]
    fn request_round_trips() {
        let msg = Message::Request(1, 16384, 16384);
        let bytes = msg.serialize();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn piece_round_trips_with_block_payload() {
        let msg = Message::Piece(2, 0, vec![0xAB; 16384]);
        let bytes = msg.serialize();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn fast_extension_messages_round_trip() {
        for msg in [
            Message::HaveAll,
            Message::HaveNone,
            Message::Suggest(3),
            Message::AllowedFast(9),
            Message::Reject(1, 0, 16384),
        ] {
            let bytes = msg.serialize();
            assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn extended_message_round_trips() {
        let msg = Message::Extended(0, vec![1, 2, 3]);
        let bytes = msg.serialize();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_message_id_is_rejected() {
        let bytes = frame(200, &[]);
        assert!(Message::deserialize(&bytes).is_err());
    }
}
