//! Message definitions.
//!
//! Fixed-size messages are `Pod` and go through the copy fast path;
//! messages carrying text encode field by field.

use bytemuck::{Pod, Zeroable};
use skein_core::codec::{CodecResult, Message, MessageId, MessageReader, MessageWriter};

use crate::ids;

/// Liveness probe. The receiver answers with a [`Pong`] echoing both fields.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Ping {
    /// Sender-local timestamp in microseconds.
    pub sent_at_micros: u64,
    /// Sender-chosen sequence number.
    pub sequence: u32,
    /// Padding to keep the layout explicit.
    pub _pad: u32,
}

/// Answer to a [`Ping`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Pong {
    /// Echo of [`Ping::sent_at_micros`].
    pub sent_at_micros: u64,
    /// Echo of [`Ping::sequence`].
    pub sequence: u32,
    /// Padding to keep the layout explicit.
    pub _pad: u32,
}

impl Pong {
    /// Builds the answer to `ping`.
    #[must_use]
    pub const fn answer(ping: &Ping) -> Self {
        Self {
            sent_at_micros: ping.sent_at_micros,
            sequence: ping.sequence,
            _pad: 0,
        }
    }
}

/// Entity transform update.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Transform {
    /// Entity id.
    pub entity: u32,
    /// Server tick when this was generated.
    pub tick: u32,
    /// Position.
    pub position: [f32; 3],
    /// Rotation quaternion (x, y, z, w).
    pub rotation: [f32; 4],
}

skein_core::pod_message!(Ping, ids::PING.0);
skein_core::pod_message!(Pong, ids::PONG.0);
skein_core::pod_message!(Transform, ids::TRANSFORM.0);

/// Chat line. The server stamps `sender` before relaying.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chat {
    /// Connection id of the author.
    pub sender: u32,
    /// Message text.
    pub text: String,
}

impl Message for Chat {
    const ID: MessageId = ids::CHAT;

    fn write(&self, writer: &mut MessageWriter<'_>) -> CodecResult<()> {
        writer.write_u32(self.sender)?;
        writer.write_str(&self.text)
    }

    fn read(&mut self, reader: &mut MessageReader<'_>) -> CodecResult<()> {
        self.sender = reader.read_u32()?;
        reader.read_string_into(&mut self.text)
    }

    fn reset_fields(&mut self) {
        self.sender = 0;
        self.text.clear();
    }
}

/// Request answered with an [`EchoResponse`] carrying the same text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EchoRequest {
    /// Text to echo.
    pub text: String,
}

/// Answer to an [`EchoRequest`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EchoResponse {
    /// Echoed text.
    pub text: String,
    /// Number of requests the responder has served, this one included.
    pub served: u32,
}

impl Message for EchoRequest {
    const ID: MessageId = ids::ECHO_REQUEST;

    fn write(&self, writer: &mut MessageWriter<'_>) -> CodecResult<()> {
        writer.write_str(&self.text)
    }

    fn read(&mut self, reader: &mut MessageReader<'_>) -> CodecResult<()> {
        reader.read_string_into(&mut self.text)
    }

    fn reset_fields(&mut self) {
        self.text.clear();
    }
}

impl Message for EchoResponse {
    const ID: MessageId = ids::ECHO_RESPONSE;

    fn write(&self, writer: &mut MessageWriter<'_>) -> CodecResult<()> {
        writer.write_str(&self.text)?;
        writer.write_u32(self.served)
    }

    fn read(&mut self, reader: &mut MessageReader<'_>) -> CodecResult<()> {
        reader.read_string_into(&mut self.text)?;
        self.served = reader.read_u32()?;
        Ok(())
    }

    fn reset_fields(&mut self) {
        self.text.clear();
        self.served = 0;
    }
}
