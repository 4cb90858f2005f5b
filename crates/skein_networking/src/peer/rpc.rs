//! RPC frame layout.
//!
//! ```text
//! ┌──────────────────┬──────────────┬──────────────┬────────────────────┐
//! │ 0xFF01 / 0xFF02  │ serial (u32) │ cookie (u32) │ [inner id][inner]  │
//! └──────────────────┴──────────────┴──────────────┴────────────────────┘
//! ```
//!
//! The cookie tells fan-out responses apart; single calls send 0.

use skein_core::codec::{MessageId, FRAME_HEADER_SIZE};

/// Bytes between the outer id and the inner frame.
pub const RPC_HEADER_SIZE: usize = 8;

/// Offset of the cookie inside an encoded RPC frame.
pub(crate) const COOKIE_OFFSET: usize = FRAME_HEADER_SIZE + 4;

/// Correlation fields of an RPC frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcHeader {
    /// Call serial chosen by the caller.
    pub serial: u32,
    /// Distinguishes the targets of a fan-out call.
    pub cookie: u32,
}

/// Appends the outer id and the header.
pub fn write_rpc_header(out: &mut Vec<u8>, kind: MessageId, header: RpcHeader) {
    out.extend_from_slice(&kind.0.to_le_bytes());
    out.extend_from_slice(&header.serial.to_le_bytes());
    out.extend_from_slice(&header.cookie.to_le_bytes());
}

/// Splits an RPC payload (after the outer id) into header and inner frame.
///
/// Returns `None` when the inner frame is missing its id.
#[must_use]
pub fn parse_rpc(payload: &[u8]) -> Option<(RpcHeader, &[u8])> {
    if payload.len() < RPC_HEADER_SIZE + FRAME_HEADER_SIZE {
        return None;
    }
    let serial = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let cookie = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((RpcHeader { serial, cookie }, &payload[RPC_HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::codec::split_frame;

    #[test]
    fn test_header_layout() {
        let mut frame = Vec::new();
        write_rpc_header(&mut frame, MessageId::RPC_REQUEST, RpcHeader { serial: 7, cookie: 3 });
        frame.extend_from_slice(&[10, 0, 0xAB]);
        assert_eq!(frame[COOKIE_OFFSET], 3);

        let (id, payload) = split_frame(&frame).unwrap();
        assert_eq!(id, MessageId::RPC_REQUEST);
        let (header, inner) = parse_rpc(payload).unwrap();
        assert_eq!(header, RpcHeader { serial: 7, cookie: 3 });
        assert_eq!(inner, [10, 0, 0xAB]);
    }

    #[test]
    fn test_missing_inner_id() {
        assert_eq!(parse_rpc(&[1, 0, 0, 0, 0, 0, 0, 0, 10]), None);
    }
}
