//! # SKEIN Shared
//!
//! Messages used by both client and server builds.
//!
//! ## Rule
//!
//! Every id is declared in [`ids`]. Application ids stay below
//! `0xFF00`; the range above belongs to the runtime.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod ids;
pub mod messages;

pub use messages::{Chat, EchoRequest, EchoResponse, Ping, Pong, Transform};

use skein_core::{CodecResult, MessageRegistry};

/// Registers every shared message, failing on an id collision.
///
/// A start-up check over the whole message set. Handler registration on
/// servers, clients and session registries checks ownership per table as
/// handlers are added.
pub fn register_all(registry: &mut MessageRegistry) -> CodecResult<()> {
    registry.register::<Ping>()?;
    registry.register::<Pong>()?;
    registry.register::<Chat>()?;
    registry.register::<EchoRequest>()?;
    registry.register::<EchoResponse>()?;
    registry.register::<Transform>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_do_not_collide() {
        let mut registry = MessageRegistry::new();
        register_all(&mut registry).unwrap();
        assert_eq!(registry.len(), 6);

        // Second pass is a no-op.
        register_all(&mut registry).unwrap();
        assert_eq!(registry.len(), 6);
    }
}
