//! Generation-checked socket registry
//!
//! The interface owns every socket through this arena. Poller
//! registrations carry a [`SocketKey`] rather than a pointer; a key whose
//! slot has since been vacated (or reused) resolves to nothing.
//!
//! Free slots are reused LIFO for cache-friendly reuse of recently
//! retired entries.

use std::fmt;

use parking_lot::Mutex;

/// Index plus generation of a registry slot
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    index: u32,
    generation: u32,
}

impl SocketKey {
    /// Pack into a poller token
    #[inline]
    pub const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_token(token: u64) -> Self {
        SocketKey {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Debug for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketKey({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    /// LIFO stack of vacant slot indices
    free: Vec<u32>,
    len: usize,
}

pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                len: 0,
            }),
        }
    }

    pub fn insert(&self, entry: T) -> SocketKey {
        let mut inner = self.inner.lock();
        inner.len += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.entry = Some(entry);
            return SocketKey {
                index,
                generation: slot.generation,
            };
        }
        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        SocketKey { index, generation: 0 }
    }

    pub fn get(&self, key: SocketKey) -> Option<T> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.clone())
    }

    /// Vacate the slot. The next occupant gets a new generation.
    pub fn remove(&self, key: SocketKey) -> Option<T> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(key.index);
        inner.len -= 1;
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live entry
    pub fn entries(&self) -> Vec<(SocketKey, T)> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entry.clone().map(|entry| {
                    (
                        SocketKey {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        entry,
                    )
                })
            })
            .collect()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let reg = Registry::new();
        let a = reg.insert("a");
        let b = reg.insert("b");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(a), Some("a"));
        assert_eq!(reg.get(b), Some("b"));

        assert_eq!(reg.remove(a), Some("a"));
        assert_eq!(reg.remove(a), None);
        assert_eq!(reg.get(a), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_stale_key_after_reuse() {
        let reg = Registry::new();
        let old = reg.insert(1);
        reg.remove(old);
        let new = reg.insert(2);

        assert_ne!(old, new);
        assert_eq!(reg.get(old), None);
        assert_eq!(reg.remove(old), None);
        assert_eq!(reg.get(new), Some(2));
    }

    #[test]
    fn test_token_round_trip() {
        let reg = Registry::new();
        for i in 0..3 {
            let k = reg.insert(i);
            reg.remove(k);
        }
        let key = reg.insert(42);
        assert_eq!(SocketKey::from_token(key.to_token()), key);
        assert_eq!(reg.get(SocketKey::from_token(key.to_token())), Some(42));
    }

    #[test]
    fn test_entries_snapshot() {
        let reg = Registry::new();
        let a = reg.insert('a');
        let _b = reg.insert('b');
        reg.remove(a);
        let entries = reg.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, 'b');
    }
}
