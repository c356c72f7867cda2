use std::{
    fmt,
    sync::{Arc, RwLock},
};

use bridge_core::BridgeError;

/// Caller-facing session handle: an arena index plus the generation that
/// was live when it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a single integer, generation in the high half.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<Arc<T>>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

/// Generation-checked arena of live sessions.
///
/// A removed slot bumps its generation, so every handle issued for it stays
/// invalid even after the index is reused.
pub(crate) struct SessionRegistry<T> {
    arena: RwLock<Arena<T>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            arena: RwLock::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }
}

impl<T> SessionRegistry<T> {
    /// Insert the value built for the freshly issued handle.
    pub(crate) fn insert_with<F>(&self, build: F) -> Result<(SessionHandle, Arc<T>), BridgeError>
    where
        F: FnOnce(SessionHandle) -> Arc<T>,
    {
        let mut arena = self.write()?;
        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(arena.slots.len())
                    .map_err(|_| BridgeError::internal("session arena is full"))?;
                arena.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                index
            }
        };

        let slot = &mut arena.slots[index as usize];
        let handle = SessionHandle {
            index,
            generation: slot.generation,
        };
        let value = build(handle);
        slot.entry = Some(Arc::clone(&value));
        Ok((handle, value))
    }

    pub(crate) fn get(&self, handle: SessionHandle) -> Result<Arc<T>, BridgeError> {
        let arena = self.read()?;
        arena
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.clone())
            .ok_or_else(|| BridgeError::unknown_handle(handle))
    }

    /// Remove the entry; `None` when the handle is already stale.
    pub(crate) fn remove(&self, handle: SessionHandle) -> Result<Option<Arc<T>>, BridgeError> {
        let mut arena = self.write()?;
        let Some(slot) = arena.slots.get_mut(handle.index as usize) else {
            return Ok(None);
        };
        if slot.generation != handle.generation || slot.entry.is_none() {
            return Ok(None);
        }
        let removed = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(handle.index);
        Ok(removed)
    }

    pub(crate) fn len(&self) -> usize {
        self.read()
            .map(|arena| arena.slots.iter().filter(|slot| slot.entry.is_some()).count())
            .unwrap_or(0)
    }

    pub(crate) fn handles(&self) -> Vec<SessionHandle> {
        self.read()
            .map(|arena| {
                arena
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.entry.is_some())
                    .map(|(index, slot)| SessionHandle {
                        index: index as u32,
                        generation: slot.generation,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<T>> {
        match self.arena.write() {
            Ok(mut arena) => {
                let mut drained = Vec::new();
                let Arena { slots, free } = &mut *arena;
                for (index, slot) in slots.iter_mut().enumerate() {
                    if let Some(entry) = slot.entry.take() {
                        slot.generation = slot.generation.wrapping_add(1);
                        free.push(index as u32);
                        drained.push(entry);
                    }
                }
                drained
            }
            Err(_) => Vec::new(),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Arena<T>>, BridgeError> {
        self.arena
            .read()
            .map_err(|_| BridgeError::internal("session registry lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Arena<T>>, BridgeError> {
        self.arena
            .write()
            .map_err(|_| BridgeError::internal("session registry lock poisoned"))
    }
}
