use std::marker::PhantomPinned;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use intrusive_collections::{intrusive_adapter, LinkedListLink, UnsafeRef};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{EntryCache, Error};

/// Numeric entry identifier. Identifiers are assigned by the host (usually
/// by the underlying record store) and must be nonzero and unique among
/// resident entries.
pub type Id = u64;

/// Reserved identifier meaning "no such entry". Never resident.
pub const NOID: Id = 0;

/// The payload stored in the cache. The host implements this for its entry
/// type; the cache itself never interprets the contents.
///
/// Both keys must stay stable while the entry is resident: mutating the id
/// or the name of a cached record through a write guard corrupts the
/// indexes. To change a key, delete the entry and insert a fresh record.
/// The name is the caller-normalized form and is compared as raw bytes.
pub trait Record {
    fn id(&self) -> Id;
    fn name(&self) -> &[u8];
}

/// Lifecycle of a slot. Only `Ready` entries are visible to lookups; the
/// other states make lookups wait and retry. Discriminant 0 is deliberately
/// unassigned, a zeroed state is a corruption and trips `from_u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    Creating = 1,
    Ready = 2,
    Deleted = 3,
    Committed = 4,
}

impl State {
    pub(crate) fn from_u8(raw: u8) -> State {
        match raw {
            1 => State::Creating,
            2 => State::Ready,
            3 => State::Deleted,
            4 => State::Committed,
            _ => panic!("entry cache corrupted: undefined slot state {}", raw),
        }
    }
}

/// Cache-private bookkeeping wrapped around each resident record: lifecycle
/// state, the count of outstanding guards, the per-entry lock and the LRU
/// list node. Slots are pinned, their addresses are handed around as raw
/// pointers by the indexes and the LRU list.
///
/// `id` and `name` are snapshots of the record's keys taken at insert time
/// so the indexes can be maintained without touching the payload lock.
pub(crate) struct Slot<E> {
    pub(crate) id:       Id,
    pub(crate) name:     Box<[u8]>,
    pub(crate) value:    RwLock<E>,
    // state and refcount are only modified under the cache mutex, the
    // atomics just make the aliased slot shareable. Relaxed is enough.
    pub(crate) state:    AtomicU8,
    pub(crate) refcount: AtomicUsize,
    pub(crate) lru_link: LinkedListLink,
    _pin:                PhantomPinned,
}

intrusive_adapter!(pub(crate) SlotAdapter<E> = UnsafeRef<Slot<E>>: Slot<E> { lru_link: LinkedListLink });

// `lru_link` is a `Cell`-based intrusive link, which makes `Slot<E>` neither
// `Send` nor `Sync` by auto-trait inference. In practice the link is only
// ever touched while holding the cache mutex (see `CacheInner`), so sharing
// a `Slot<E>` across threads is sound as long as `E` itself is Send/Sync.
unsafe impl<E: Send> Send for Slot<E> {}
unsafe impl<E: Sync> Sync for Slot<E> {}

impl<E: Record> Slot<E> {
    /// A fresh slot starts in `Creating` with one reference: the inserting
    /// caller's.
    pub(crate) fn new(record: E) -> Self {
        let id = record.id();
        let name = Box::<[u8]>::from(record.name());
        Slot {
            id,
            name,
            value: RwLock::new(record),
            state: AtomicU8::new(State::Creating as u8),
            refcount: AtomicUsize::new(1),
            lru_link: LinkedListLink::new(),
            _pin: PhantomPinned,
        }
    }
}

impl<E> Slot<E> {
    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn refs(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference, returns the count that remains.
    pub(crate) fn release_ref(&self) -> usize {
        let before = self.refcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(before > 0, "entry released more often than acquired");
        before - 1
    }
}

/// Shared borrow of a cached entry, obtained from [`EntryCache::insert`] or
/// [`EntryCache::get_id`]. Holds the entry's lock in read mode and keeps the
/// entry pinned (ineligible for eviction). Dropping the guard releases both.
pub struct EntryReadGuard<'a, E>
where
    E: Record,
{
    pub(crate) cache: &'a EntryCache<E>,
    pub(crate) slot:  &'a Slot<E>,
    pub(crate) guard: ManuallyDrop<RwLockReadGuard<'a, E>>,
}

impl<E: Record> EntryReadGuard<'_, E> {
    /// The entry's identifier.
    pub fn id(&self) -> Id {
        self.slot.id
    }

    /// The entry's normalized name key.
    pub fn name(&self) -> &[u8] {
        &self.slot.name
    }

    /// Marks a freshly inserted entry as complete, so that the following
    /// drop publishes it to lookups instead of discarding it.
    ///
    /// Panics when the entry is not in creation, committing an entry that
    /// was obtained from a lookup is a caller bug.
    pub fn commit(&self) {
        // the creating caller is the only thread that can reach the slot
        // here, no need for the cache mutex
        assert_eq!(
            self.slot.state(),
            State::Creating,
            "commit on an entry that is not being created"
        );
        self.slot.set_state(State::Committed);
    }

    /// Removes the entry from the cache. The entry disappears from the
    /// indexes at once, concurrent lookups no longer find it. This guard
    /// stays valid; the record is freed when the last guard is dropped.
    /// Deleting an already deleted entry does nothing.
    pub fn delete(&self) {
        self.cache.delete_entry(self.slot);
    }
}

impl<E: Record> Drop for EntryReadGuard<'_, E> {
    fn drop(&mut self) {
        let guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        self.cache.release_read(self.slot, guard);
    }
}

impl<E: Record> Deref for EntryReadGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

/// Exclusive borrow of a cached entry, obtained from
/// [`EntryCache::insert_mut`] or [`EntryCache::get_id_mut`]. Holds the
/// entry's lock in write mode and keeps the entry pinned. Dropping the guard
/// releases both; dropping a guard from `insert_mut` without a prior
/// [`commit`](Self::commit) aborts the creation and discards the record.
pub struct EntryWriteGuard<'a, E>
where
    E: Record,
{
    pub(crate) cache: &'a EntryCache<E>,
    pub(crate) slot:  &'a Slot<E>,
    pub(crate) guard: ManuallyDrop<RwLockWriteGuard<'a, E>>,
}

impl<E: Record> EntryWriteGuard<'_, E> {
    /// The entry's identifier.
    pub fn id(&self) -> Id {
        self.slot.id
    }

    /// The entry's normalized name key.
    pub fn name(&self) -> &[u8] {
        &self.slot.name
    }

    /// Marks a freshly inserted entry as complete, so that the following
    /// drop publishes it to lookups instead of discarding it.
    ///
    /// Panics when the entry is not in creation.
    pub fn commit(&self) {
        assert_eq!(
            self.slot.state(),
            State::Creating,
            "commit on an entry that is not being created"
        );
        self.slot.set_state(State::Committed);
    }

    /// Removes the entry from the cache. See [`EntryReadGuard::delete`].
    pub fn delete(&self) {
        self.cache.delete_entry(self.slot);
    }

    /// Aborts an insertion and takes the record back out of the cache.
    /// Where a plain drop of an uncommitted guard discards the record, this
    /// returns it to the caller, for hosts that constructed the record
    /// elsewhere and still own its wider lifecycle.
    ///
    /// Panics when the entry is not in creation.
    pub fn abort(self) -> E {
        let mut this = ManuallyDrop::new(self);
        let guard = unsafe { ManuallyDrop::take(&mut this.guard) };
        this.cache.abort_insert(this.slot, guard)
    }

    /// Puts a deleted entry back into the cache under its original keys.
    /// The entry must have been deleted while held by this guard and
    /// re-enters creation: the caller mutates the record as needed, commits,
    /// and drops the guard to publish it again.
    ///
    /// Fails when another resident entry took the name or id in the
    /// meantime; the entry then simply stays deleted. The record's keys
    /// must not have changed, a renamed record is a new entry.
    pub fn reinsert(&mut self) -> Result<(), Error> {
        self.cache.reinsert_entry(self.slot, &**self.guard)
    }
}

impl<E: Record> Drop for EntryWriteGuard<'_, E> {
    fn drop(&mut self) {
        let guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        self.cache.release_write(self.slot, guard);
    }
}

impl<E: Record> Deref for EntryWriteGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl<E: Record> DerefMut for EntryWriteGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}
