//! # Message Codec
//!
//! Binary encoding for application messages.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┐
//! │ id (u16 LE)  │ payload (Message::write)    │
//! └──────────────┴─────────────────────────────┘
//! ```
//!
//! Transports that need framing (stream, websocket) add their own length
//! prefix around this. Ids from `0xFF00` upward belong to the runtime.
//!
//! ## Decoding
//!
//! Messages read themselves *into* an existing instance so handlers can
//! decode into objects rented from an [`ObjectPool`](crate::memory::ObjectPool)
//! instead of allocating per message.

mod error;
mod reader;
mod registry;
mod writer;

use std::fmt;

use tracing::debug;

use crate::memory::Poolable;

pub use error::{CodecError, CodecResult};
pub use reader::MessageReader;
pub use registry::MessageRegistry;
pub use writer::MessageWriter;

/// Maximum encoded payload size for a single message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Size of the id prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 2;

/// Numeric message identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub u16);

impl MessageId {
    /// First id of the range reserved for runtime frames.
    pub const RESERVED_START: u16 = 0xFF00;

    /// Request frame of the RPC layer.
    pub const RPC_REQUEST: Self = Self(0xFF01);

    /// Response frame of the RPC layer.
    pub const RPC_RESPONSE: Self = Self(0xFF02);

    /// Returns true for ids owned by the runtime.
    #[inline]
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 >= Self::RESERVED_START
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// An application message with a fixed id and a binary layout.
pub trait Message: Default + Send + 'static {
    /// Wire identifier of this message type.
    const ID: MessageId;

    /// Encodes the fields.
    fn write(&self, writer: &mut MessageWriter<'_>) -> CodecResult<()>;

    /// Decodes the fields into `self`, overwriting previous contents.
    fn read(&mut self, reader: &mut MessageReader<'_>) -> CodecResult<()>;

    /// Clears the fields before the instance goes back to a pool.
    ///
    /// The default replaces the value; override it to keep allocations.
    fn reset_fields(&mut self) {
        *self = Self::default();
    }
}

impl<T: Message> Poolable for T {
    fn create() -> Self {
        T::default()
    }

    fn reset(&mut self) {
        self.reset_fields();
    }
}

/// Appends `[id][payload]` for `message` to `out`.
///
/// On failure `out` is restored to its previous length.
pub fn encode_frame<T: Message>(message: &T, out: &mut Vec<u8>) -> CodecResult<()> {
    encode_frame_with_limit(message, out, MAX_MESSAGE_SIZE)
}

/// Like [`encode_frame`] with an explicit payload limit.
pub fn encode_frame_with_limit<T: Message>(
    message: &T,
    out: &mut Vec<u8>,
    limit: usize,
) -> CodecResult<()> {
    let start = out.len();
    out.extend_from_slice(&T::ID.0.to_le_bytes());
    let result = message.write(&mut MessageWriter::with_limit(out, limit));
    if result.is_err() {
        out.truncate(start);
    }
    result
}

/// Appends the payload of `message` without an id.
///
/// On failure `out` is restored to its previous length.
pub fn encode_payload<T: Message>(message: &T, out: &mut Vec<u8>) -> CodecResult<()> {
    let start = out.len();
    let result = message.write(&mut MessageWriter::new(out));
    if result.is_err() {
        out.truncate(start);
    }
    result
}

/// Splits a frame into its id and payload.
pub fn split_frame(frame: &[u8]) -> CodecResult<(MessageId, &[u8])> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::Truncated(frame.len()));
    }
    let id = u16::from_le_bytes([frame[0], frame[1]]);
    Ok((MessageId(id), &frame[FRAME_HEADER_SIZE..]))
}

/// Decodes a payload into a new instance.
///
/// Malformed input yields `None` and is logged at debug level.
#[must_use]
pub fn decode<T: Message>(payload: &[u8]) -> Option<T> {
    let mut message = T::default();
    decode_into(payload, &mut message).then_some(message)
}

/// Decodes a payload into an existing instance.
///
/// Returns false on malformed input; `target` is then in an unspecified
/// but valid state.
pub fn decode_into<T: Message>(payload: &[u8], target: &mut T) -> bool {
    match target.read(&mut MessageReader::new(payload)) {
        Ok(()) => true,
        Err(err) => {
            debug!(
                id = %T::ID,
                message = std::any::type_name::<T>(),
                len = payload.len(),
                error = %err,
                "Dropping malformed message"
            );
            false
        }
    }
}

/// Implements [`Message`] for a `bytemuck::Pod` type by copying its bytes.
///
/// ```
/// use bytemuck::{Pod, Zeroable};
///
/// #[repr(C)]
/// #[derive(Clone, Copy, Default, Pod, Zeroable)]
/// struct Heartbeat {
///     tick: u32,
/// }
///
/// skein_core::pod_message!(Heartbeat, 42);
///
/// let mut frame = Vec::new();
/// skein_core::codec::encode_frame(&Heartbeat { tick: 7 }, &mut frame).unwrap();
/// assert_eq!(frame, [42, 0, 7, 0, 0, 0]);
/// ```
#[macro_export]
macro_rules! pod_message {
    ($ty:ty, $id:expr) => {
        impl $crate::codec::Message for $ty {
            const ID: $crate::codec::MessageId = $crate::codec::MessageId($id);

            #[inline]
            fn write(
                &self,
                writer: &mut $crate::codec::MessageWriter<'_>,
            ) -> $crate::codec::CodecResult<()> {
                writer.write_pod(self)
            }

            #[inline]
            fn read(
                &mut self,
                reader: &mut $crate::codec::MessageReader<'_>,
            ) -> $crate::codec::CodecResult<()> {
                *self = reader.read_pod()?;
                Ok(())
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ObjectPool;

    #[derive(Debug, Default, PartialEq)]
    struct Greeting {
        from: String,
        tags: Vec<u8>,
    }

    impl Message for Greeting {
        const ID: MessageId = MessageId(7);

        fn write(&self, writer: &mut MessageWriter<'_>) -> CodecResult<()> {
            writer.write_str(&self.from)?;
            writer.write_bytes(&self.tags)
        }

        fn read(&mut self, reader: &mut MessageReader<'_>) -> CodecResult<()> {
            reader.read_string_into(&mut self.from)?;
            reader.read_bytes_into(&mut self.tags)
        }

        fn reset_fields(&mut self) {
            self.from.clear();
            self.tags.clear();
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Position {
        x: f32,
        y: f32,
    }

    crate::pod_message!(Position, 8);

    #[test]
    fn test_frame_layout() {
        let mut frame = Vec::new();
        let greeting = Greeting {
            from: "ab".into(),
            tags: vec![9],
        };
        encode_frame(&greeting, &mut frame).unwrap();

        let (id, payload) = split_frame(&frame).unwrap();
        assert_eq!(id, Greeting::ID);
        assert_eq!(payload, [2, 0, 0, 0, b'a', b'b', 1, 0, 0, 0, 9]);
        assert_eq!(decode::<Greeting>(payload), Some(greeting));
    }

    #[test]
    fn test_encode_failure_restores_output() {
        let mut frame = vec![0xEE];
        let big = Greeting {
            from: "x".repeat(64),
            tags: Vec::new(),
        };
        assert!(encode_frame_with_limit(&big, &mut frame, 16).is_err());
        assert_eq!(frame, [0xEE]);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        assert_eq!(decode::<Greeting>(&[5, 0, 0, 0, b'a']), None);
        assert_eq!(decode::<Position>(&[0, 0, 128]), None);
        assert!(matches!(split_frame(&[1]), Err(CodecError::Truncated(1))));
    }

    #[test]
    fn test_pod_message() {
        let mut frame = Vec::new();
        encode_frame(&Position { x: 1.0, y: -2.0 }, &mut frame).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 8);

        let (_, payload) = split_frame(&frame).unwrap();
        assert_eq!(decode::<Position>(payload), Some(Position { x: 1.0, y: -2.0 }));
    }

    #[test]
    fn test_decode_into_pooled_instance() {
        let pool: ObjectPool<Greeting> = ObjectPool::new(2);
        let mut frame = Vec::new();
        encode_frame(
            &Greeting {
                from: "pool".into(),
                tags: vec![1, 2],
            },
            &mut frame,
        )
        .unwrap();

        let mut msg = pool.rent();
        assert!(decode_into(&frame[FRAME_HEADER_SIZE..], &mut *msg));
        assert_eq!(msg.from, "pool");
        assert!(pool.give_back(msg));

        let msg = pool.rent();
        assert!(msg.from.is_empty());
        assert!(msg.from.capacity() >= 4);
    }

    #[test]
    fn test_reserved_ids() {
        assert!(MessageId::RPC_REQUEST.is_reserved());
        assert!(MessageId::RPC_RESPONSE.is_reserved());
        assert!(!MessageId(0xFEFF).is_reserved());
        assert_eq!(MessageId(0xFF01).to_string(), "0xff01");
    }
}
