//! Datagram header shared by every reliable-link message.
//!
//! ```text
//! ┌───────────┬───────────────┬──────────────────┐
//! │ kind (u8) │ seq (u32 LE)  │ body             │
//! └───────────┴───────────────┴──────────────────┘
//! ```

/// Header size in bytes.
pub const HEADER_SIZE: usize = 5;

/// Largest datagram put on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Largest frame a single `Data` datagram carries.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Datagram kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// Client asks to open a link.
    Connect = 1,
    /// Server accepted the link.
    ConnectAck = 2,
    /// Either side closes the link (also a refusal).
    Disconnect = 3,
    /// Reliable ordered frame.
    Data = 4,
    /// Acknowledges the `Data` with the same sequence.
    Ack = 5,
    /// Round-trip probe carrying a timestamp.
    Ping = 6,
    /// Probe answer echoing the timestamp.
    Pong = 7,
}

impl Kind {
    /// Maps a wire byte to a kind.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Connect,
            2 => Self::ConnectAck,
            3 => Self::Disconnect,
            4 => Self::Data,
            5 => Self::Ack,
            6 => Self::Ping,
            7 => Self::Pong,
            _ => return None,
        })
    }
}

/// Appends a header to `out`.
#[inline]
pub fn write_header(out: &mut Vec<u8>, kind: Kind, seq: u32) {
    out.push(kind as u8);
    out.extend_from_slice(&seq.to_le_bytes());
}

/// Builds a body-less or small control datagram.
#[must_use]
pub fn control(kind: Kind, seq: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    write_header(&mut out, kind, seq);
    out.extend_from_slice(body);
    out
}

/// Splits a datagram into kind, sequence and body.
///
/// Returns `None` for short datagrams and unknown kinds.
#[must_use]
pub fn parse(datagram: &[u8]) -> Option<(Kind, u32, &[u8])> {
    if datagram.len() < HEADER_SIZE {
        return None;
    }
    let kind = Kind::from_u8(datagram[0])?;
    let seq = u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
    Some((kind, seq, &datagram[HEADER_SIZE..]))
}
