//! Fixed-size slot pools with generation-checked handles.
//!
//! A pool never grows: its slots mirror hardware blocks that exist on the
//! device whether or not the host uses them. Items stay in place between
//! holders so per-slot state (ids, colors) is stable. A handle names a slot
//! index, the generation that slot had when it was acquired, and the pool it
//! came from; releasing bumps the generation so stale copies are rejected.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use super::ResourceKind;
use crate::error::{Error, Result};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Reference to a held pool slot.
pub struct Handle<T> {
    index: u16,
    generation: u32,
    pool: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Slot index, which doubles as the device id of the resource.
    pub fn index(&self) -> usize {
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
        self.index == other.index && self.generation == other.generation && self.pool == other.pool
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
        self.pool.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{}@{})", self.index, self.generation, self.pool)
    }
}

struct Slot<T> {
    item: T,
    generation: u32,
    held: bool,
}

pub struct Pool<T> {
    id: u32,
    kind: ResourceKind,
    slots: Vec<Slot<T>>,
}

impl<T> Pool<T> {
    pub fn new(kind: ResourceKind, items: impl IntoIterator<Item = T>) -> Self {
        let slots = items
            .into_iter()
            .map(|item| Slot {
                item,
                generation: 0,
                held: false,
            })
            .collect();
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            slots,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.slots.iter().filter(|s| !s.held).count()
    }

    fn handle_for(&self, index: usize) -> Handle<T> {
        Handle {
            index: index as u16,
            generation: self.slots[index].generation,
            pool: self.id,
            _marker: PhantomData,
        }
    }

    /// Take the lowest-numbered free slot.
    pub fn acquire_next(&mut self) -> Result<Handle<T>> {
        let index = self
            .slots
            .iter()
            .position(|s| !s.held)
            .ok_or(Error::ResourceExhausted(self.kind))?;
        self.slots[index].held = true;
        Ok(self.handle_for(index))
    }

    /// Take a specific slot; `label` names it in errors.
    pub fn acquire_at(&mut self, index: usize, label: &str) -> Result<Handle<T>> {
        let slot = self.slots.get_mut(index).ok_or_else(|| Error::NotFound {
            kind: self.kind,
            id: label.to_string(),
        })?;
        if slot.held {
            return Err(Error::AlreadyInUse {
                kind: self.kind,
                id: label.to_string(),
            });
        }
        slot.held = true;
        Ok(self.handle_for(index))
    }

    pub fn release(&mut self, handle: Handle<T>) -> Result<()> {
        self.check(handle)?;
        let slot = &mut self.slots[handle.index()];
        slot.held = false;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Whether `handle` refers to a slot its holder still owns.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.check(handle).is_ok()
    }

    fn check(&self, handle: Handle<T>) -> Result<()> {
        match self.slots.get(handle.index()) {
            Some(slot)
                if handle.pool == self.id && slot.held && slot.generation == handle.generation =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidHandle(self.kind)),
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Result<&T> {
        self.check(handle)?;
        Ok(&self.slots[handle.index()].item)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        self.check(handle)?;
        Ok(&mut self.slots[handle.index()].item)
    }

    /// Item in slot `index`, held or not.
    pub fn slot(&self, index: usize) -> Option<&T> {
        self.slots.get(index).map(|s| &s.item)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).map(|s| &mut s.item)
    }

    /// Handle of the current holder of slot `index`, if held.
    pub fn held_handle(&self, index: usize) -> Option<Handle<T>> {
        self.slots
            .get(index)
            .filter(|s| s.held)
            .map(|_| self.handle_for(index))
    }

    /// Held slots in index order.
    pub fn iter_held(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.held)
            .map(|(i, s)| (i, &s.item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, s)| (i, &mut s.item))
    }
}
