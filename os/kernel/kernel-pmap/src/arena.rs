//! Generational arena.
//!
//! Page-table pages and reverse-mapping records are stored here instead of
//! being linked by pointers. A [`Handle`] names a slot *and* the generation
//! of the value that lived in it, so a handle kept past `remove` no longer
//! resolves instead of silently aliasing the slot's next occupant.

use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::num::NonZeroU32;

/// Stable reference to a value in an [`Arena<T>`].
pub struct Handle<T> {
    index: u32,
    generation: NonZeroU32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: NonZeroU32, value: T },
    Vacant { generation: NonZeroU32 },
}

/// Slot arena with an optional hard capacity.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Unbounded arena.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Arena that refuses inserts once `limit` values are live.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.len >= self.limit
    }

    /// Stores `value`, handing it back if the arena is at its limit.
    pub fn insert(&mut self, value: T) -> Result<Handle<T>, T> {
        if self.is_full() {
            return Err(value);
        }

        let (index, generation) = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let Slot::Vacant { generation } = *slot else {
                unreachable!("free list points at an occupied slot");
            };
            *slot = Slot::Occupied { generation, value };
            (index, generation)
        } else {
            let Ok(index) = u32::try_from(self.slots.len()) else {
                return Err(value);
            };
            let generation = NonZeroU32::MIN;
            self.slots.push(Slot::Occupied { generation, value });
            (index, generation)
        };

        self.len += 1;
        Ok(Handle {
            index,
            generation,
            _marker: PhantomData,
        })
    }

    /// Removes and returns the value `h` refers to.
    pub fn remove(&mut self, h: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(h.index())?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == h.generation => {
                let next = generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
                let Slot::Occupied { value, .. } =
                    core::mem::replace(slot, Slot::Vacant { generation: next })
                else {
                    unreachable!();
                };
                self.free.push(h.index);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get(&self, h: Handle<T>) -> Option<&T> {
        match self.slots.get(h.index())? {
            Slot::Occupied { generation, value } if *generation == h.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, h: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(h.index())? {
            Slot::Occupied { generation, value } if *generation == h.generation => Some(value),
            _ => None,
        }
    }

    /// Live values with their handles, in slot order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { generation, value } => Some((
                Handle {
                    index: i as u32,
                    generation: *generation,
                    _marker: PhantomData,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }
}

impl<T> core::ops::Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, h: Handle<T>) -> &T {
        self.get(h)
            .unwrap_or_else(|| panic!("stale arena handle {h:?}"))
    }
}

impl<T> core::ops::IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, h: Handle<T>) -> &mut T {
        self.get_mut(h)
            .unwrap_or_else(|| panic!("stale arena handle {h:?}"))
    }
}
