//! Framed peer wire messages: `<4:length><length bytes payload>`.
//! `length == 0` is a keep-alive; otherwise the first payload byte is the
//! message id.

use std::io;

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
    /// Any id this client doesn't recognize; the body is discarded by the
    /// reader but the id is kept for logging.
    Unknown(u8),
}

impl Message {
    /// Serializes with a true 4-byte big-endian length prefix, so a
    /// BITFIELD or PIECE body over 255 bytes (any full 16 KiB block) still
    /// frames correctly.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
            Message::Choke => framed(0, &[]),
            Message::Unchoke => framed(1, &[]),
            Message::Interested => framed(2, &[]),
            Message::NotInterested => framed(3, &[]),
            Message::Have(index) => framed(4, &index.to_be_bytes()),
            Message::Bitfield(bits) => framed(5, bits),
            Message::Request(index, begin, length) => {
                let mut body = Vec::with_capacity(12);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                framed(6, &body)
            }
            Message::Piece(index, begin, block) => {
                let mut body = Vec::with_capacity(8 + block.len());
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
                framed(7, &body)
            }
            Message::Cancel(index, begin, length) => {
                let mut body = Vec::with_capacity(12);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                framed(8, &body)
            }
            Message::Unknown(id) => framed(*id, &[]),
        }
    }

    /// Decodes one message from a full frame body, i.e. `data` is exactly
    /// `length` bytes as read off the wire (not including the length
    /// prefix itself), or empty for a keep-alive.
    pub fn deserialize(data: &[u8]) -> io::Result<Message> {
        let Some((&id, body)) = data.split_first() else {
            return Ok(Message::KeepAlive);
        };

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(read_u32_at(body, 0, "HAVE")?),
            5 => Message::Bitfield(body.to_vec()),
            6 => Message::Request(
                read_u32_at(body, 0, "REQUEST.index")?,
                read_u32_at(body, 4, "REQUEST.begin")?,
                read_u32_at(body, 8, "REQUEST.length")?,
            ),
            7 => {
                if body.len() < 8 {
                    return Err(invalid("PIECE body too short"));
                }
                Message::Piece(
                    read_u32_at(body, 0, "PIECE.index")?,
                    read_u32_at(body, 4, "PIECE.begin")?,
                    body[8..].to_vec(),
                )
            }
            8 => Message::Cancel(
                read_u32_at(body, 0, "CANCEL.index")?,
                read_u32_at(body, 4, "CANCEL.begin")?,
                read_u32_at(body, 8, "CANCEL.length")?,
            ),
            other => Message::Unknown(other),
        };
        Ok(msg)
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(..) => Some(6),
            Message::Piece(..) => Some(7),
            Message::Cancel(..) => Some(8),
            Message::Unknown(id) => Some(*id),
        }
    }
}

fn framed(id: u8, body: &[u8]) -> Vec<u8> {
    let len = 1 + body.len() as u32;
    let mut out = Vec::with_capacity(4 + body.len() + 1);
    out.extend_from_slice(&len.to_be_bytes());
    out.push(id);
    out.extend_from_slice(body);
    out
}

fn read_u32_at(bytes: &[u8], offset: usize, what: &str) -> io::Result<u32> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| invalid(&format!("{what} truncated")))?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(slice);
    Ok(u32::from_be_bytes(arr))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
