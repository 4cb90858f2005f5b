//! # Message Registry
//!
//! Tracks which type owns each message id so two types cannot silently
//! share one.

use std::any::TypeId;
use std::collections::HashMap;

use super::error::{CodecError, CodecResult};
use super::{Message, MessageId};

#[derive(Debug, Clone, Copy)]
struct Entry {
    type_id: TypeId,
    name: &'static str,
}

/// Map from message id to the registered type.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    entries: HashMap<MessageId, Entry>,
}

impl MessageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `T::ID`.
    ///
    /// Returns `Ok(true)` on first registration and `Ok(false)` if `T` was
    /// already registered. Fails when the id is reserved or owned by a
    /// different type.
    pub fn register<T: Message>(&mut self) -> CodecResult<bool> {
        if T::ID.is_reserved() {
            return Err(CodecError::ReservedId(T::ID));
        }
        self.insert::<T>()
    }

    /// Registers `T` without the reserved-range check.
    ///
    /// Used by the runtime for its own frame types.
    pub fn register_system<T: Message>(&mut self) -> CodecResult<bool> {
        self.insert::<T>()
    }

    fn insert<T: Message>(&mut self) -> CodecResult<bool> {
        let incoming = Entry {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        };

        match self.entries.get(&T::ID) {
            Some(existing) if existing.type_id == incoming.type_id => Ok(false),
            Some(existing) => Err(CodecError::IdCollision {
                id: T::ID,
                existing: existing.name,
                incoming: incoming.name,
            }),
            None => {
                self.entries.insert(T::ID, incoming);
                Ok(true)
            }
        }
    }

    /// Returns true if a type owns `id`.
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns the type name registered under `id`.
    #[must_use]
    pub fn name_of(&self, id: MessageId) -> Option<&'static str> {
        self.entries.get(&id).map(|entry| entry.name)
    }

    /// Number of registered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MessageReader, MessageWriter};

    #[derive(Default)]
    struct Alpha;
    #[derive(Default)]
    struct Beta;
    #[derive(Default)]
    struct Reserved;

    macro_rules! empty_message {
        ($ty:ty, $id:expr) => {
            impl Message for $ty {
                const ID: MessageId = MessageId($id);
                fn write(&self, _: &mut MessageWriter<'_>) -> CodecResult<()> {
                    Ok(())
                }
                fn read(&mut self, _: &mut MessageReader<'_>) -> CodecResult<()> {
                    Ok(())
                }
            }
        };
    }

    empty_message!(Alpha, 10);
    empty_message!(Beta, 10);
    empty_message!(Reserved, 0xFF10);

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = MessageRegistry::new();
        assert!(registry.register::<Alpha>().unwrap());
        assert!(!registry.register::<Alpha>().unwrap());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(MessageId(10)));
    }

    #[test]
    fn test_collision_rejected() {
        let mut registry = MessageRegistry::new();
        registry.register::<Alpha>().unwrap();
        let err = registry.register::<Beta>().unwrap_err();
        assert!(matches!(err, CodecError::IdCollision { id: MessageId(10), .. }));
        assert!(registry.name_of(MessageId(10)).unwrap().ends_with("Alpha"));
    }

    #[test]
    fn test_reserved_range() {
        let mut registry = MessageRegistry::new();
        assert_eq!(
            registry.register::<Reserved>(),
            Err(CodecError::ReservedId(MessageId(0xFF10)))
        );
        assert!(registry.register_system::<Reserved>().unwrap());
    }
}
