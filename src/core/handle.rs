//! Handle registry
//! Maps every bridged native object to a stable, generation-tagged handle.
//! The registry is the only owner that keeps a native object alive on the
//! caller's behalf: the bridge retains an object when it is first registered
//! and releases it when its handle is invalidated.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

use crate::core::error::{BridgeError, Result};
use crate::core::native::NativeRef;

/// Opaque identifier for a bridged object.
///
/// A freed slot is reused with a bumped generation, so a stale handle never
/// resolves to a later object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Wire form: generation in the high word, slot index in the low word.
    pub fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self)
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.to_raw())
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Handle::from_raw)
    }
}

struct Entry<T> {
    native: NativeRef,
    value: T,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Arena of registered objects keyed by handle, indexed by native reference.
pub struct HandleRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    by_native: HashMap<NativeRef, Handle>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_native: HashMap::new(),
        }
    }

    /// Registers `native`, building its value only on first sight.
    /// Returns the handle and whether a new entry was created.
    pub fn register_with(&mut self, native: NativeRef, make: impl FnOnce() -> T) -> (Handle, bool) {
        if let Some(handle) = self.by_native.get(&native) {
            return (*handle, false);
        }

        let entry = Entry {
            native,
            value: make(),
        };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                Handle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                Handle {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_native.insert(native, handle);
        (handle, true)
    }

    pub fn lookup(&self, native: NativeRef) -> Option<Handle> {
        self.by_native.get(&native).copied()
    }

    fn entry(&self, handle: Handle) -> Result<&Entry<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(BridgeError::NotFound(handle))
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T> {
        self.entry(handle).map(|entry| &entry.value)
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Result<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .map(|entry| &mut entry.value)
            .ok_or(BridgeError::NotFound(handle))
    }

    pub fn native(&self, handle: Handle) -> Result<NativeRef> {
        self.entry(handle).map(|entry| entry.native)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entry(handle).is_ok()
    }

    /// Points an existing handle at a different native object.
    /// Returns the previously bound native reference.
    pub fn rebind(&mut self, handle: Handle, native: NativeRef) -> Result<NativeRef> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(BridgeError::NotFound(handle))?;
        let previous = std::mem::replace(&mut slot.native, native);
        self.by_native.remove(&previous);
        self.by_native.insert(native, handle);
        Ok(previous)
    }

    /// Removes the entry. Every later `resolve` of this handle fails.
    pub fn invalidate(&mut self, handle: Handle) -> Result<(NativeRef, T)> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.entry.is_some())
            .ok_or(BridgeError::NotFound(handle))?;
        let entry = slot.entry.take().ok_or(BridgeError::NotFound(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_native.remove(&entry.native);
        Ok((entry.native, entry.value))
    }

    pub fn len(&self) -> usize {
        self.by_native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_native.is_empty()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.by_native.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = HandleRegistry::new();
        let (first, inserted) = registry.register_with(NativeRef(7), || "peripheral");
        assert!(inserted);
        let (second, inserted) = registry.register_with(NativeRef(7), || "other");
        assert!(!inserted);
        assert_eq!(first, second);
        assert_eq!(registry.resolve(first), Ok(&"peripheral"));
    }

    #[test]
    fn test_invalidated_slot_is_reused_with_new_generation() {
        let mut registry = HandleRegistry::new();
        let (old, _) = registry.register_with(NativeRef(1), || 1);
        registry.invalidate(old).unwrap();
        let (new, _) = registry.register_with(NativeRef(2), || 2);

        assert_ne!(old, new);
        assert_eq!(registry.resolve(old), Err(BridgeError::NotFound(old)));
        assert_eq!(registry.resolve(new), Ok(&2));
        assert_eq!(registry.lookup(NativeRef(1)), None);
    }

    #[test]
    fn test_rebind_moves_native_index() {
        let mut registry = HandleRegistry::new();
        let (handle, _) = registry.register_with(NativeRef(10), || ());
        assert_eq!(registry.rebind(handle, NativeRef(11)), Ok(NativeRef(10)));
        assert_eq!(registry.lookup(NativeRef(10)), None);
        assert_eq!(registry.lookup(NativeRef(11)), Some(handle));
        assert_eq!(registry.native(handle), Ok(NativeRef(11)));
    }

    #[test]
    fn test_raw_form_round_trips() {
        let mut registry = HandleRegistry::new();
        for n in 0..3 {
            let (h, _) = registry.register_with(NativeRef(n), || ());
            registry.invalidate(h).unwrap();
        }
        let (handle, _) = registry.register_with(NativeRef(99), || ());
        assert_eq!(Handle::from_raw(handle.to_raw()), handle);
    }

    proptest! {
        #[test]
        fn prop_resolve_after_invalidate_fails(natives in prop::collection::vec(0u64..32, 1..64)) {
            let mut registry = HandleRegistry::new();
            let mut dead = Vec::new();
            for (i, native) in natives.iter().enumerate() {
                let (handle, _) = registry.register_with(NativeRef(*native), || *native);
                prop_assert_eq!(registry.resolve(handle), Ok(native));
                if i % 3 == 0 {
                    registry.invalidate(handle).unwrap();
                    dead.push(handle);
                }
            }
            for handle in dead {
                prop_assert_eq!(registry.resolve(handle), Err(BridgeError::NotFound(handle)));
            }
        }

        #[test]
        fn prop_same_native_same_handle(natives in prop::collection::vec(0u64..8, 1..64)) {
            let mut registry = HandleRegistry::new();
            let mut seen = HashMap::new();
            for native in natives {
                let (handle, _) = registry.register_with(NativeRef(native), || ());
                prop_assert_eq!(*seen.entry(native).or_insert(handle), handle);
            }
        }
    }
}
