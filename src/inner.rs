use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;

use intrusive_collections::{LinkedList, UnsafeRef};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::entry::{Id, Record, Slot, SlotAdapter, State, NOID};
use crate::{Error, InsertError};

/// How many pinned entries an eviction pass inspects at the cold end of the
/// LRU list before giving up. Pinned entries found there are spliced back to
/// the hot end so that heavily used entries do not clog the tail, and the
/// cap keeps insertion cost bounded when most of the cache is pinned.
pub(crate) const EVICT_SKIP_MAX: usize = 10;

/// Everything behind the cache mutex: both indexes, the LRU list, the
/// parking area for deleted-but-referenced slots, and the size accounting.
///
/// The id index owns the slot allocations; the name index and the LRU list
/// hold raw references into them. Slots are pinned boxes, so the maps may
/// reshuffle their nodes freely without moving any slot.
///
/// Resident slots are in all three structures or in none of them. A slot
/// that was deleted while guards were still outstanding is in `doomed`
/// (keyed by address) until the last guard goes away.
pub(crate) struct CacheInner<E> {
    by_name: BTreeMap<Box<[u8]>, UnsafeRef<Slot<E>>>,
    by_id:   BTreeMap<Id, Pin<Box<Slot<E>>>>,
    lru:     LinkedList<SlotAdapter<E>>,
    doomed:  HashMap<usize, Pin<Box<Slot<E>>>>,
    cursize: usize,
    maxsize: usize,
}

impl<E> CacheInner<E> {
    pub(crate) fn new(maxsize: usize) -> Self {
        CacheInner {
            by_name: BTreeMap::new(),
            by_id: BTreeMap::new(),
            lru: LinkedList::new(SlotAdapter::new()),
            doomed: HashMap::new(),
            cursize: 0,
            maxsize,
        }
    }

    pub(crate) fn cursize(&self) -> usize {
        self.cursize
    }

    pub(crate) fn maxsize(&self) -> usize {
        self.maxsize
    }

    pub(crate) fn find_id(&self, id: Id) -> Option<*const Slot<E>> {
        self.by_id.get(&id).map(|boxed| &**boxed as *const Slot<E>)
    }

    pub(crate) fn find_name(&self, name: &[u8]) -> Option<*const Slot<E>> {
        self.by_name.get(name).map(|slot| &**slot as *const Slot<E>)
    }

    /// Resident ids in LRU order, most recently used first.
    pub(crate) fn lru_ids(&self) -> Vec<Id> {
        self.lru.iter().map(|slot| slot.id).collect()
    }

    /// Creates a slot for the record and links it into both indexes and the
    /// hot end of the LRU list. On a name or id collision nothing is
    /// changed and the record travels back inside the error.
    pub(crate) fn attach(&mut self, record: E) -> Result<*const Slot<E>, InsertError<E>>
    where
        E: Record,
    {
        debug_assert_ne!(record.id(), NOID, "record ids must be nonzero");

        if self.by_name.contains_key(record.name()) {
            return Err(InsertError {
                kind: Error::DuplicateName,
                record,
            });
        }
        if self.by_id.contains_key(&record.id()) {
            return Err(InsertError {
                kind: Error::DuplicateId,
                record,
            });
        }

        let boxed = Box::pin(Slot::new(record));
        let ptr: *const Slot<E> = &*boxed;

        let prev = self
            .by_name
            .insert(boxed.name.clone(), unsafe { UnsafeRef::from_raw(ptr) });
        debug_assert!(prev.is_none());
        let prev = self.by_id.insert(boxed.id, boxed);
        debug_assert!(prev.is_none());

        self.lru.push_front(unsafe { UnsafeRef::from_raw(ptr) });
        self.cursize += 1;

        Ok(ptr)
    }

    /// Relinks a previously detached slot, the counterpart of `attach` for
    /// reinsertion. The slot re-enters creation; callers have checked for
    /// collisions beforehand.
    pub(crate) fn attach_existing(&mut self, boxed: Pin<Box<Slot<E>>>) {
        let ptr: *const Slot<E> = &*boxed;
        let slot = unsafe { &*ptr };

        slot.set_state(State::Creating);

        let prev = self
            .by_name
            .insert(slot.name.clone(), unsafe { UnsafeRef::from_raw(ptr) });
        debug_assert!(prev.is_none());
        let prev = self.by_id.insert(slot.id, boxed);
        debug_assert!(prev.is_none());

        self.lru.push_front(unsafe { UnsafeRef::from_raw(ptr) });
        self.cursize += 1;
    }

    /// Unlinks a resident slot from both indexes and the LRU list, marks it
    /// deleted, and returns the owning box. Absence from either index at
    /// this point means the cross-index invariant broke, which is not
    /// recoverable.
    pub(crate) fn detach(&mut self, slot: &Slot<E>) -> Pin<Box<Slot<E>>> {
        let named = self
            .by_name
            .remove(&*slot.name)
            .expect("entry cache corrupted: resident entry missing from the name index");
        debug_assert!(std::ptr::eq(&*named, slot));

        let boxed = self
            .by_id
            .remove(&slot.id)
            .expect("entry cache corrupted: resident entry missing from the id index");
        debug_assert!(std::ptr::eq(&*boxed, slot));

        debug_assert!(slot.lru_link.is_linked());
        let _ = unsafe { self.lru.cursor_mut_from_ptr(slot).remove() };
        self.cursize -= 1;

        slot.set_state(State::Deleted);
        boxed
    }

    /// Parks a detached slot until its outstanding guards are gone.
    pub(crate) fn park(&mut self, boxed: Pin<Box<Slot<E>>>) {
        let addr = &*boxed as *const Slot<E> as usize;
        let prev = self.doomed.insert(addr, boxed);
        debug_assert!(prev.is_none());
    }

    /// Takes a parked slot back out, either to free it on the last release
    /// or to reinsert it.
    pub(crate) fn unpark(&mut self, slot: &Slot<E>) -> Pin<Box<Slot<E>>> {
        self.doomed
            .remove(&(slot as *const Slot<E> as usize))
            .expect("entry cache corrupted: deleted entry not parked")
    }

    /// Moves a resident slot to the hot end of the LRU list.
    pub(crate) fn touch(&mut self, slot: &Slot<E>) {
        debug_assert!(slot.lru_link.is_linked());
        let _ = unsafe { self.lru.cursor_mut_from_ptr(slot).remove() };
        self.lru.push_front(unsafe { UnsafeRef::from_raw(slot) });
    }

    /// Brings the cache back under `maxsize`, called after every operation
    /// that grew it. Runs in two passes over the cold end of the list:
    /// first up to [`EVICT_SKIP_MAX`] pinned entries get spliced back to
    /// the hot end, then unpinned tail entries are dropped until the size
    /// bound holds or only pinned entries remain. The bound is soft; with
    /// the whole tail pinned the cache stays oversized for a while.
    pub(crate) fn evict(&mut self) {
        if self.cursize <= self.maxsize {
            return;
        }

        let mut skipped = 0;
        while skipped < EVICT_SKIP_MAX {
            let pinned = match self.lru.back().get() {
                Some(tail) => tail.refs() != 0,
                None => break,
            };
            if !pinned {
                break;
            }
            if let Some(tail) = self.lru.pop_back() {
                self.lru.push_front(tail);
            }
            skipped += 1;
        }

        while self.cursize > self.maxsize {
            let tail = match self.lru.back().get() {
                Some(tail) if tail.refs() == 0 => tail as *const Slot<E>,
                _ => break,
            };
            #[cfg(feature = "logging")]
            debug!("evicting entry {}", unsafe { &*tail }.id);
            let boxed = self.detach(unsafe { &*tail });
            drop(boxed);
        }
    }

    /// Drops every unpinned entry at the cold end of the list, for
    /// shutdown. Stops at the first pinned entry.
    pub(crate) fn drain_unused(&mut self) {
        loop {
            let tail = match self.lru.back().get() {
                Some(tail) if tail.refs() == 0 => tail as *const Slot<E>,
                _ => break,
            };
            let boxed = self.detach(unsafe { &*tail });
            drop(boxed);
        }
    }
}
