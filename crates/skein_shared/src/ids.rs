//! Message id table.

#![allow(missing_docs)]

use skein_core::MessageId;

pub const PING: MessageId = MessageId(1);
pub const PONG: MessageId = MessageId(2);
pub const CHAT: MessageId = MessageId(3);
pub const ECHO_REQUEST: MessageId = MessageId(10);
pub const ECHO_RESPONSE: MessageId = MessageId(11);
pub const TRANSFORM: MessageId = MessageId(20);
