//! Generation-checked handle arena
//!
//! Every entity the caller can observe (users, devices, networks, endpoints,
//! invitations, chat controls, tickets) lives in a `HandleTable` and is
//! referred to by a `Handle<T>`. A handle stays resolvable until its entity
//! is both marked pending-destroy and no longer mentioned by any
//! unacknowledged state change; retiring the slot bumps its generation so
//! that stale handles fail instead of aliasing a new entity.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::errors::HandleError;

static NEXT_TABLE_ID: AtomicU32 = AtomicU32::new(1);

// ----------------------------------------------------------------------------
// Handle Kinds
// ----------------------------------------------------------------------------

/// The kind of entity a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleKind {
    LocalUser,
    Device,
    Network,
    Endpoint,
    Invitation,
    ChatControl,
    Ticket,
}

impl HandleKind {
    pub fn name(&self) -> &'static str {
        match self {
            HandleKind::LocalUser => "local user",
            HandleKind::Device => "device",
            HandleKind::Network => "network",
            HandleKind::Endpoint => "endpoint",
            HandleKind::Invitation => "invitation",
            HandleKind::ChatControl => "chat control",
            HandleKind::Ticket => "matchmaking ticket",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Implemented by every type stored in a `HandleTable`
pub trait Entity {
    const KIND: HandleKind;
}

// ----------------------------------------------------------------------------
// Typed Handle
// ----------------------------------------------------------------------------

/// Typed, copyable reference to an entity in a `HandleTable`
pub struct Handle<T> {
    table: u32,
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(table: u32, index: u32, generation: u32) -> Self {
        Self {
            table,
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index (stable for the lifetime of the entity)
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single integer, unique within one table
    pub fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

impl<T: Entity> Handle<T> {
    /// Erase the entity type
    pub fn raw(&self) -> RawHandle {
        RawHandle {
            kind: T::KIND,
            table: self.table,
            index: self.index,
            generation: self.generation,
        }
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
        self.table == other.table && self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.table, self.index, self.generation).cmp(&(other.table, other.index, other.generation))
    }
}

impl<T: Entity> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}.{}", T::KIND, self.index, self.generation)
    }
}

// ----------------------------------------------------------------------------
// Type-Erased Handle
// ----------------------------------------------------------------------------

/// A handle with its entity type erased, used by state changes to list the
/// entities they keep alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawHandle {
    kind: HandleKind,
    table: u32,
    index: u32,
    generation: u32,
}

impl RawHandle {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Recover the typed handle if the kind matches
    pub fn typed<T: Entity>(&self) -> Option<Handle<T>> {
        (self.kind == T::KIND).then(|| Handle::new(self.table, self.index, self.generation))
    }
}

// ----------------------------------------------------------------------------
// Handle Table
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Entry<T> {
    value: T,
    refs: u32,
    pending_destroy: bool,
    custom_context: Option<u64>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Arena of entities addressed by generation-checked handles
#[derive(Debug)]
pub struct HandleTable<T> {
    id: u32,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T: Entity> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> HandleTable<T> {
    /// Create an empty table with a process-unique id
    pub fn new() -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store an entity and return its handle
    pub fn allocate(&mut self, value: T) -> Handle<T> {
        let entry = Entry {
            value,
            refs: 0,
            pending_destroy: false,
            custom_context: None,
        };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return Handle::new(self.id, index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            entry: Some(entry),
        });
        Handle::new(self.id, index, 1)
    }

    fn check(&self, handle: Handle<T>) -> Result<(), HandleError> {
        if handle.table != self.id {
            return Err(HandleError::Foreign { kind: T::KIND.name() });
        }
        Ok(())
    }

    fn stale(handle: Handle<T>) -> HandleError {
        HandleError::Stale {
            kind: T::KIND.name(),
            index: handle.index,
            generation: handle.generation,
        }
    }

    fn entry(&self, handle: Handle<T>) -> Result<&Entry<T>, HandleError> {
        self.check(handle)?;
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| Self::stale(handle))
    }

    fn entry_mut(&mut self, handle: Handle<T>) -> Result<&mut Entry<T>, HandleError> {
        self.check(handle)?;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or_else(|| Self::stale(handle))
    }

    /// Resolve a handle to its entity
    pub fn resolve(&self, handle: Handle<T>) -> Result<&T, HandleError> {
        self.entry(handle).map(|entry| &entry.value)
    }

    pub fn resolve_mut(&mut self, handle: Handle<T>) -> Result<&mut T, HandleError> {
        self.entry_mut(handle).map(|entry| &mut entry.value)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.entry(handle).is_ok()
    }

    /// Mark the entity for retirement once its references drain
    pub fn mark_pending_destroy(&mut self, handle: Handle<T>) -> Result<(), HandleError> {
        self.entry_mut(handle)?.pending_destroy = true;
        Ok(())
    }

    pub fn is_pending_destroy(&self, handle: Handle<T>) -> Result<bool, HandleError> {
        self.entry(handle).map(|entry| entry.pending_destroy)
    }

    /// Record one more unacknowledged state change mentioning this entity
    pub fn add_ref(&mut self, handle: Handle<T>) -> Result<(), HandleError> {
        let entry = self.entry_mut(handle)?;
        entry.refs += 1;
        Ok(())
    }

    pub fn refs(&self, handle: Handle<T>) -> Result<u32, HandleError> {
        self.entry(handle).map(|entry| entry.refs)
    }

    /// Drop one reference; retires and returns the entity when it was the
    /// last reference of a pending-destroy entity
    pub fn release(&mut self, handle: Handle<T>) -> Result<Option<T>, HandleError> {
        let entry = self.entry_mut(handle)?;
        entry.refs = entry.refs.saturating_sub(1);
        self.retire_if_unreferenced(handle)
    }

    /// Retire a pending-destroy entity that has no outstanding references
    pub fn retire_if_unreferenced(&mut self, handle: Handle<T>) -> Result<Option<T>, HandleError> {
        let entry = self.entry(handle)?;
        if entry.pending_destroy && entry.refs == 0 {
            return self.retire(handle).map(Some);
        }
        Ok(None)
    }

    /// Remove the entity; fails while state changes still mention it
    pub fn retire(&mut self, handle: Handle<T>) -> Result<T, HandleError> {
        let refs = self.entry(handle)?.refs;
        if refs > 0 {
            return Err(HandleError::OutstandingReferences {
                kind: T::KIND.name(),
                refs,
            });
        }
        let slot = &mut self.slots[handle.index as usize];
        let entry = slot.entry.take().ok_or_else(|| Self::stale(handle))?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.live -= 1;
        Ok(entry.value)
    }

    pub fn set_custom_context(&mut self, handle: Handle<T>, context: Option<u64>) -> Result<(), HandleError> {
        self.entry_mut(handle)?.custom_context = context;
        Ok(())
    }

    pub fn custom_context(&self, handle: Handle<T>) -> Result<Option<u64>, HandleError> {
        self.entry(handle).map(|entry| entry.custom_context)
    }

    /// Iterate over live entities, including pending-destroy ones
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        let id = self.id;
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (Handle::new(id, index as u32, slot.generation), &entry.value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        let id = self.id;
        self.slots.iter_mut().enumerate().filter_map(move |(index, slot)| {
            let generation = slot.generation;
            slot.entry
                .as_mut()
                .map(|entry| (Handle::new(id, index as u32, generation), &mut entry.value))
        })
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Widget(u32);

    impl Entity for Widget {
        const KIND: HandleKind = HandleKind::Endpoint;
    }

    #[test]
    fn test_allocate_and_resolve() {
        let mut table = HandleTable::new();
        let a = table.allocate(Widget(1));
        let b = table.allocate(Widget(2));
        assert_ne!(a, b);
        assert_eq!(table.resolve(a).unwrap(), &Widget(1));
        assert_eq!(table.resolve(b).unwrap(), &Widget(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_retired_slot_rejects_stale_handle() {
        let mut table = HandleTable::new();
        let a = table.allocate(Widget(1));
        assert_eq!(table.retire(a).unwrap(), Widget(1));

        let b = table.allocate(Widget(2));
        assert_eq!(a.index(), b.index());
        assert!(matches!(table.resolve(a), Err(HandleError::Stale { .. })));
        assert_eq!(table.resolve(b).unwrap(), &Widget(2));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let mut first = HandleTable::new();
        let second: HandleTable<Widget> = HandleTable::new();
        let handle = first.allocate(Widget(7));
        assert!(matches!(
            second.resolve(handle),
            Err(HandleError::Foreign { .. })
        ));
    }

    #[test]
    fn test_pending_destroy_waits_for_references() {
        let mut table = HandleTable::new();
        let handle = table.allocate(Widget(3));
        table.add_ref(handle).unwrap();
        table.add_ref(handle).unwrap();
        table.mark_pending_destroy(handle).unwrap();

        assert!(matches!(
            table.retire(handle),
            Err(HandleError::OutstandingReferences { refs: 2, .. })
        ));
        assert_eq!(table.release(handle).unwrap(), None);
        assert!(table.contains(handle));
        assert_eq!(table.release(handle).unwrap(), Some(Widget(3)));
        assert!(!table.contains(handle));
        assert!(table.is_empty());
    }

    #[test]
    fn test_raw_handle_round_trip_and_context() {
        let mut table = HandleTable::new();
        let handle = table.allocate(Widget(9));
        let raw = handle.raw();
        assert_eq!(raw.kind(), HandleKind::Endpoint);
        assert_eq!(raw.typed::<Widget>(), Some(handle));

        table.set_custom_context(handle, Some(42)).unwrap();
        assert_eq!(table.custom_context(handle).unwrap(), Some(42));
    }
}
