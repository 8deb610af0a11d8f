#![doc = include_str!("../README.md")]
//!
//!
//! Entry lifecycle
//! ===============
//!
//! Every resident entry carries a small lifecycle state. [`EntryCache::insert`]
//! and [`EntryCache::insert_mut`] attach the record in a *creating* state
//! with the caller holding the entry lock; nothing else can see the entry
//! yet. [`EntryWriteGuard::commit`] marks the creation as complete, and the
//! guard drop that follows publishes the entry as *ready*, the only state
//! lookups ever return. Dropping the insert guard without committing aborts
//! the creation and the entry disappears as if it had never been inserted.
//!
//! [`EntryReadGuard::delete`] detaches an entry from the indexes at once but
//! keeps the record alive as long as guards are outstanding; the last guard
//! to go frees it. A deleted entry that is still held can be put back with
//! [`EntryWriteGuard::reinsert`], which is how an update that has to
//! momentarily take an entry out of circulation recovers it afterwards.
//!
//!
//! Locking discussion
//! ==================
//!
//! There are two kinds of locks. One cache-wide mutex protects the two
//! indexes, the LRU list and the per-entry bookkeeping (state, reference
//! count, list links). It is held only across pointer and counter
//! manipulation, never while anything blocks or touches a payload. Each
//! entry additionally has its own RwLock around the record, which is what
//! the guards returned to callers hold.
//!
//! The entry lock is never acquired blockingly while the cache mutex is
//! held; lookups use a try-lock. A blocking acquire there would deadlock:
//! the current holder of the entry lock needs the cache mutex to release
//! it. The one exception is insertion, where the slot was just attached and
//! no other thread can reach it, so taking its lock cannot contend.
//!
//! When a lookup finds an entry that is not ready, or loses the try-lock
//! race, it waits on a condition variable paired with the cache mutex and
//! then retries the search from scratch. Every guard release and every
//! delete signals the condition variable. Waiters can wake spuriously and
//! collectively; that is fine, they re-check everything under the mutex.
//! Progress relies on lock holders eventually releasing, there are no
//! timeouts. A host that wants cancellation wraps its calls at a layer
//! above.
//!
//!
//! LRU and eviction
//! ================
//!
//! Resident entries sit in a doubly linked list ordered by last access,
//! hottest at the front. Whenever an insertion pushes the cache over its
//! configured size, entries are reclaimed from the cold end. Entries with
//! outstanding guards are never reclaimed; a bounded number of them get
//! spliced back to the hot end per pass so the tail does not silt up with
//! pinned entries. The size limit is therefore soft: with enough pinned
//! entries the cache runs oversized until guards are returned.
//!
//!
//! Tests
//! =====
//!
//! The `test::multithreaded_stress` test can be controlled by environment
//! variables:
//!
//!  * 'STRESS_THREADS' sets the number of threads to spawn. Defaults to 10.
//!  * 'STRESS_WAIT' threads randomly wait up to this much milliseconds to
//!    fake some work. Defaults to 5.
//!  * 'STRESS_ITERATIONS' how many iterations each thread shall do.
//!    Defaults to 100.
//!  * 'STRESS_RANGE' how many unique ids the test uses. Defaults to 1000.
//!
//! The defaults keep the suite fast; raise them significantly for dedicated
//! stress testing.

use std::fmt;
use std::mem::ManuallyDrop;
use std::pin::Pin;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, RwLockReadGuard, RwLockWriteGuard};

mod entry;
use crate::entry::{Slot, State};
pub use crate::entry::{EntryReadGuard, EntryWriteGuard, Id, Record, NOID};

mod inner;
use crate::inner::CacheInner;

/// The entry cache. One instance per backend; typically shared behind an
/// `Arc` and used from many threads at once. `E` is the host's record type.
///
/// Entries are resident under their name and id simultaneously, so either
/// key resolves to the same cached record. Lookups and insertions return
/// guards that pin the entry and hold its lock; see the crate documentation
/// for the lifecycle and locking rules.
pub struct EntryCache<E>
where
    E: Record,
{
    inner:    Mutex<CacheInner<E>>,
    // signalled on every guard release and every delete, see the locking
    // discussion in the crate docs
    released: Condvar,
}

impl<E> EntryCache<E>
where
    E: Record,
{
    /// Creates a cache that aims to keep at most `maxsize` entries
    /// resident. `maxsize` is a soft bound and must be at least 1.
    pub fn new(maxsize: usize) -> EntryCache<E> {
        assert!(maxsize >= 1, "maxsize must be at least 1");
        EntryCache {
            inner: Mutex::new(CacheInner::new(maxsize)),
            released: Condvar::new(),
        }
    }

    /// Inserts a record and returns a read guard on the new entry. The
    /// entry is in creation and invisible to lookups until the caller
    /// commits and drops the guard; see [`EntryReadGuard::commit`].
    ///
    /// When an entry with the same name or id is already resident the cache
    /// is left unchanged and the record comes back inside the error.
    pub fn insert(&self, record: E) -> Result<EntryReadGuard<'_, E>, InsertError<E>> {
        let mut inner = self.inner.lock();
        let ptr = inner.attach(record)?;
        let slot = unsafe { &*ptr };
        // the slot is not reachable by any other thread before the mutex is
        // released, this cannot contend
        let guard = slot.value.read();
        inner.evict();
        #[cfg(feature = "logging")]
        trace!("insert({}): created", slot.id);
        Ok(EntryReadGuard {
            cache: self,
            slot,
            guard: ManuallyDrop::new(guard),
        })
    }

    /// Inserts a record and returns a write guard on the new entry. Same
    /// contract as [`insert`](Self::insert), with the entry held
    /// exclusively so the caller can keep constructing it in place.
    pub fn insert_mut(&self, record: E) -> Result<EntryWriteGuard<'_, E>, InsertError<E>> {
        let mut inner = self.inner.lock();
        let ptr = inner.attach(record)?;
        let slot = unsafe { &*ptr };
        let guard = slot.value.write();
        inner.evict();
        #[cfg(feature = "logging")]
        trace!("insert_mut({}): created", slot.id);
        Ok(EntryWriteGuard {
            cache: self,
            slot,
            guard: ManuallyDrop::new(guard),
        })
    }

    /// Looks up an entry by id for reading. Returns `None` when no such
    /// entry is resident. Blocks while the entry exists but is being
    /// created, being torn down, or held by a writer.
    pub fn get_id(&self, id: Id) -> Option<EntryReadGuard<'_, E>> {
        let mut inner = self.inner.lock();
        loop {
            let ptr = match inner.find_id(id) {
                Some(ptr) => ptr,
                None => return None,
            };
            let slot = unsafe { &*ptr };

            if slot.state() != State::Ready {
                #[cfg(feature = "logging")]
                trace!("get_id({}): not ready, waiting", id);
                self.released.wait(&mut inner);
                continue;
            }

            match slot.value.try_read() {
                Some(guard) => {
                    inner.touch(slot);
                    slot.acquire();
                    #[cfg(feature = "logging")]
                    trace!("get_id({}): found", id);
                    return Some(EntryReadGuard {
                        cache: self,
                        slot,
                        guard: ManuallyDrop::new(guard),
                    });
                }
                None => {
                    #[cfg(feature = "logging")]
                    trace!("get_id({}): busy, waiting", id);
                    self.released.wait(&mut inner);
                }
            }
        }
    }

    /// Looks up an entry by id for writing. Returns `None` when no such
    /// entry is resident. Blocks while the entry exists but is being
    /// created, being torn down, or held by anyone else.
    pub fn get_id_mut(&self, id: Id) -> Option<EntryWriteGuard<'_, E>> {
        let mut inner = self.inner.lock();
        loop {
            let ptr = match inner.find_id(id) {
                Some(ptr) => ptr,
                None => return None,
            };
            let slot = unsafe { &*ptr };

            if slot.state() != State::Ready {
                #[cfg(feature = "logging")]
                trace!("get_id_mut({}): not ready, waiting", id);
                self.released.wait(&mut inner);
                continue;
            }

            match slot.value.try_write() {
                Some(guard) => {
                    inner.touch(slot);
                    slot.acquire();
                    #[cfg(feature = "logging")]
                    trace!("get_id_mut({}): found", id);
                    return Some(EntryWriteGuard {
                        cache: self,
                        slot,
                        guard: ManuallyDrop::new(guard),
                    });
                }
                None => {
                    #[cfg(feature = "logging")]
                    trace!("get_id_mut({}): busy, waiting", id);
                    self.released.wait(&mut inner);
                }
            }
        }
    }

    /// Resolves a normalized name to the entry's id without pinning the
    /// entry or taking its lock. Returns `None` when no such entry is
    /// resident; blocks while the entry exists but is not ready.
    ///
    /// The result is a snapshot: the entry can be deleted between this call
    /// and a subsequent [`get_id`](Self::get_id), which then comes back
    /// empty. Callers must cope with that race.
    pub fn name_to_id(&self, name: &[u8]) -> Option<Id> {
        let mut inner = self.inner.lock();
        loop {
            let ptr = match inner.find_name(name) {
                Some(ptr) => ptr,
                None => return None,
            };
            let slot = unsafe { &*ptr };

            if slot.state() != State::Ready {
                #[cfg(feature = "logging")]
                trace!("name_to_id({}): not ready, waiting", slot.id);
                self.released.wait(&mut inner);
                continue;
            }

            inner.touch(slot);
            return Some(slot.id);
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.inner.lock().cursize()
    }

    /// True when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured soft size bound.
    pub fn maxsize(&self) -> usize {
        self.inner.lock().maxsize()
    }

    /// Whether an entry with this id is resident. Snapshot only, the answer
    /// can be stale by the time it is used.
    pub fn contains_id(&self, id: Id) -> bool {
        self.inner.lock().find_id(id).is_some()
    }

    /// Whether an entry with this name is resident. Snapshot only.
    pub fn contains_name(&self, name: &[u8]) -> bool {
        self.inner.lock().find_name(name).is_some()
    }

    /// Empties the cache of all unheld entries, for shutdown. Entries that
    /// are still pinned by outstanding guards survive (shutting down with
    /// guards outstanding is a host bug and gets logged); they are freed
    /// when the cache itself is dropped.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.drain_unused();
        #[cfg(feature = "logging")]
        {
            if inner.cursize() != 0 {
                warn!(
                    "drain: {} entries still referenced, cache not emptied",
                    inner.cursize()
                );
            }
        }
    }

    /// Common tail of every guard drop: give back one reference and act on
    /// the entry's state. Runs with the entry lock already released but the
    /// cache mutex held, so no lookup can slip in between.
    fn finish_release(&self, inner: &mut CacheInner<E>, slot: &Slot<E>) {
        #[cfg(feature = "logging")]
        let id = slot.id;
        let refs = slot.release_ref();
        match slot.state() {
            State::Creating => {
                // released without commit: the creation is aborted and the
                // record discarded
                debug_assert_eq!(refs, 0, "entries in creation have exactly one holder");
                let boxed = inner.detach(slot);
                drop(boxed);
                #[cfg(feature = "logging")]
                trace!("release({}): creation aborted", id);
            }
            State::Committed => {
                slot.set_state(State::Ready);
                #[cfg(feature = "logging")]
                trace!("release({}): created, refs {}", id, refs);
            }
            State::Deleted => {
                if refs == 0 {
                    let boxed = inner.unpark(slot);
                    drop(boxed);
                    #[cfg(feature = "logging")]
                    trace!("release({}): deleted entry freed", id);
                } else {
                    #[cfg(feature = "logging")]
                    trace!("release({}): delete pending, refs {}", id, refs);
                }
            }
            State::Ready => {
                #[cfg(feature = "logging")]
                trace!("release({}): returned, refs {}", id, refs);
            }
        }
    }

    pub(crate) fn release_read(&self, slot: &Slot<E>, guard: RwLockReadGuard<'_, E>) {
        let mut inner = self.inner.lock();
        drop(guard);
        self.finish_release(&mut inner, slot);
        drop(inner);
        self.released.notify_all();
    }

    pub(crate) fn release_write(&self, slot: &Slot<E>, guard: RwLockWriteGuard<'_, E>) {
        let mut inner = self.inner.lock();
        drop(guard);
        self.finish_release(&mut inner, slot);
        drop(inner);
        self.released.notify_all();
    }

    /// Backs [`EntryReadGuard::delete`] and [`EntryWriteGuard::delete`]:
    /// detach the entry and park it until the last guard drop frees it.
    pub(crate) fn delete_entry(&self, slot: &Slot<E>) {
        let mut inner = self.inner.lock();
        if slot.state() == State::Deleted {
            return;
        }
        #[cfg(feature = "logging")]
        trace!("delete({})", slot.id);
        let boxed = inner.detach(slot);
        inner.park(boxed);
        drop(inner);
        self.released.notify_all();
    }

    /// Backs [`EntryWriteGuard::abort`]: undo an insertion and move the
    /// record back out to the caller.
    pub(crate) fn abort_insert(&self, slot: &Slot<E>, guard: RwLockWriteGuard<'_, E>) -> E {
        let mut inner = self.inner.lock();
        drop(guard);
        assert_eq!(
            slot.state(),
            State::Creating,
            "abort on an entry that is not being created"
        );
        #[cfg(feature = "logging")]
        trace!("abort({}): record handed back to the caller", slot.id);
        let refs = slot.release_ref();
        debug_assert_eq!(refs, 0, "entries in creation have exactly one holder");
        let boxed = inner.detach(slot);
        drop(inner);
        self.released.notify_all();

        // sole owner now: unlinked, unindexed and guardless, so the slot
        // may be unpinned and taken apart
        let boxed = unsafe { Pin::into_inner_unchecked(boxed) };
        let slot = *boxed;
        slot.value.into_inner()
    }

    /// Backs [`EntryWriteGuard::reinsert`].
    pub(crate) fn reinsert_entry(&self, slot: &Slot<E>, record: &E) -> Result<(), Error> {
        debug_assert_eq!(record.id(), slot.id, "record id changed while cached");
        debug_assert_eq!(
            record.name(),
            &*slot.name,
            "record name changed while cached"
        );

        let mut inner = self.inner.lock();
        assert_eq!(
            slot.state(),
            State::Deleted,
            "reinsert of an entry that is not deleted"
        );
        let boxed = inner.unpark(slot);
        if inner.find_name(&slot.name).is_some() {
            inner.park(boxed);
            return Err(Error::DuplicateName);
        }
        if inner.find_id(slot.id).is_some() {
            inner.park(boxed);
            return Err(Error::DuplicateId);
        }
        inner.attach_existing(boxed);
        inner.evict();
        #[cfg(feature = "logging")]
        trace!("reinsert({})", slot.id);
        Ok(())
    }
}

impl<E> fmt::Debug for EntryCache<E>
where
    E: Record,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EntryCache")
            .field("cursize", &inner.cursize())
            .field("maxsize", &inner.maxsize())
            .field("lru", &inner.lru_ids())
            .finish()
    }
}

/// Why an insertion or reinsertion was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An entry with the same normalized name is already resident.
    DuplicateName,
    /// An entry with the same id is already resident.
    DuplicateId,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateName => write!(f, "an entry with this name is already cached"),
            Error::DuplicateId => write!(f, "an entry with this id is already cached"),
        }
    }
}

impl std::error::Error for Error {}

/// Rejection returned by the insert functions. Carries the record back to
/// the caller, the cache has not taken ownership of it.
pub struct InsertError<E> {
    pub kind:   Error,
    pub record: E,
}

impl<E> InsertError<E> {
    /// Recovers the rejected record.
    pub fn into_record(self) -> E {
        self.record
    }
}

impl<E> fmt::Debug for InsertError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertError")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<E> fmt::Display for InsertError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl<E> std::error::Error for InsertError<E> {}

#[cfg(test)]
mod test {
    use std::env;
    #[cfg(feature = "logging")]
    use std::io::Write;
    use std::sync::{Arc, Barrier};
    use std::{thread, time};

    use rand::Rng;

    use crate::*;

    #[cfg(feature = "logging")]
    fn init() {
        let _ = env_logger::Builder::from_default_env()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{:>5}: {}: {}",
                    record.level().as_str(),
                    thread::current().name().unwrap_or("UNKNOWN"),
                    record.args()
                )
            })
            .try_init();
    }

    #[cfg(not(feature = "logging"))]
    fn init() {}

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestEntry {
        id:     Id,
        dn:     Vec<u8>,
        visits: u64,
    }

    impl TestEntry {
        fn new(id: Id, dn: &str) -> TestEntry {
            TestEntry {
                id,
                dn: dn.as_bytes().to_vec(),
                visits: 0,
            }
        }
    }

    impl Record for TestEntry {
        fn id(&self) -> Id {
            self.id
        }

        fn name(&self) -> &[u8] {
            &self.dn
        }
    }

    fn put(cache: &EntryCache<TestEntry>, id: Id, dn: &str) {
        let entry = cache.insert(TestEntry::new(id, dn)).unwrap_or_else(|err| {
            panic!("insert of {} failed: {}", id, err);
        });
        entry.commit();
    }

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn send_sync() {
        is_send_sync_static::<EntryCache<TestEntry>>();
    }

    #[test]
    fn create() {
        init();
        let cache = EntryCache::<TestEntry>::new(16);

        println!("Debug {:?}", &cache);
        assert!(cache.get_id(1).is_none());
        assert!(cache.name_to_id(b"uid=nobody").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.maxsize(), 16);
    }

    #[test]
    fn insert_commit_lookup() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 1, "uid=a");

        let entry = cache.get_id(1).unwrap();
        assert_eq!(entry.id(), 1);
        assert_eq!(entry.name(), b"uid=a");
        assert_eq!(entry.dn, b"uid=a");
        drop(entry);

        assert_eq!(cache.name_to_id(b"uid=a"), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn aborted_creation() {
        init();
        let cache = EntryCache::new(4);

        let entry = cache.insert_mut(TestEntry::new(2, "uid=b")).unwrap();
        drop(entry); // no commit

        assert!(cache.get_id(2).is_none());
        assert!(cache.name_to_id(b"uid=b").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn abort_returns_record() {
        init();
        let cache = EntryCache::new(4);

        let entry = cache.insert_mut(TestEntry::new(2, "uid=b")).unwrap();
        let record = entry.abort();

        assert_eq!(record, TestEntry::new(2, "uid=b"));
        assert!(cache.is_empty());
        assert!(cache.get_id(2).is_none());
    }

    #[test]
    fn duplicate_insert() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 1, "uid=a");

        match cache.insert(TestEntry::new(1, "uid=a2")) {
            Err(err) => {
                assert_eq!(err.kind, Error::DuplicateId);
                assert_eq!(err.into_record().id, 1);
            }
            Ok(_) => panic!("insert with duplicate id succeeded"),
        }

        match cache.insert(TestEntry::new(3, "uid=a")) {
            Err(err) => {
                assert_eq!(err.kind, Error::DuplicateName);
                assert_eq!(err.into_record().id, 3);
            }
            Ok(_) => panic!("insert with duplicate name succeeded"),
        }

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn mutate() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 1, "uid=a");

        let mut entry = cache.get_id_mut(1).unwrap();
        entry.visits = 5;
        drop(entry);

        assert_eq!(cache.get_id(1).unwrap().visits, 5);
    }

    #[test]
    fn eviction_in_lru_order() {
        init();
        let cache = EntryCache::new(2);

        put(&cache, 1, "uid=a");
        put(&cache, 2, "uid=b");
        put(&cache, 3, "uid=c");

        assert!(cache.get_id(1).is_none());
        assert!(cache.get_id(2).is_some());
        assert!(cache.get_id(3).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn pinned_entry_survives_eviction() {
        init();
        let cache = EntryCache::new(2);

        put(&cache, 1, "uid=a");
        put(&cache, 2, "uid=b");

        let held = cache.get_id(1).unwrap();
        put(&cache, 3, "uid=c");

        // 2 was the coldest unpinned entry and got evicted for 3
        assert!(cache.get_id(2).is_none());
        assert!(cache.contains_id(1));
        assert!(cache.contains_id(3));
        assert_eq!(cache.len(), 2);
        drop(held);
    }

    #[test]
    fn soft_bound_with_everything_pinned() {
        init();
        let cache = EntryCache::new(2);

        let mut held = Vec::new();
        for id in 1..=3 {
            let entry = cache
                .insert(TestEntry::new(id, &format!("uid=u{}", id)))
                .unwrap();
            entry.commit();
            held.push(entry);
        }

        // everything is pinned, the bound is soft and nothing was evicted
        assert_eq!(cache.len(), 3);

        put(&cache, 4, "uid=u4");
        assert_eq!(cache.len(), 4);

        // with the guards gone the next insertion shrinks the cache again
        held.clear();
        put(&cache, 5, "uid=u5");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn delete_while_held() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 5, "uid=e");

        let held = cache.get_id(5).unwrap();
        held.delete();
        held.delete(); // idempotent

        assert!(cache.get_id(5).is_none());
        assert!(cache.name_to_id(b"uid=e").is_none());
        assert_eq!(cache.len(), 0);

        // the guard still reads the detached record
        assert_eq!(held.id(), 5);
        assert_eq!(held.visits, 0);
        drop(held);
    }

    #[test]
    fn delete_with_two_holders() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 5, "uid=e");

        let first = cache.get_id(5).unwrap();
        let second = cache.get_id(5).unwrap();
        first.delete();

        assert!(cache.get_id(5).is_none());
        drop(first);
        assert_eq!(second.dn, b"uid=e");
        drop(second);
    }

    #[test]
    fn reinsert_after_delete() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 7, "uid=g");

        let mut entry = cache.get_id_mut(7).unwrap();
        entry.delete();
        assert!(cache.get_id(7).is_none());

        entry.visits = 3;
        entry.reinsert().unwrap();
        entry.commit();
        drop(entry);

        let entry = cache.get_id(7).unwrap();
        assert_eq!(entry.visits, 3);
        assert_eq!(cache.name_to_id(b"uid=g"), Some(7));
    }

    #[test]
    fn reinsert_conflict() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 9, "uid=i");

        let mut held = cache.get_id_mut(9).unwrap();
        held.delete();

        // somebody else takes the keys while the old entry is in limbo
        put(&cache, 9, "uid=i");

        assert_eq!(held.reinsert(), Err(Error::DuplicateName));
        drop(held);

        assert_eq!(cache.len(), 1);
        assert!(cache.get_id(9).is_some());
    }

    #[test]
    fn drain_leaves_pinned_entries() {
        init();
        let cache = EntryCache::new(4);

        put(&cache, 1, "uid=a");
        put(&cache, 2, "uid=b");

        let held = cache.get_id(1).unwrap();
        cache.drain();

        assert_eq!(cache.len(), 1);
        assert!(cache.contains_id(1));
        assert!(!cache.contains_id(2));

        drop(held);
        cache.drain();
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_waits_for_creation() {
        init();
        let cache = Arc::new(EntryCache::<TestEntry>::new(8));

        // an aborted creation makes concurrent lookups come back empty
        let pending = cache.insert_mut(TestEntry::new(1, "uid=a")).unwrap();
        let peer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_id(1).map(|entry| entry.id()))
        };
        thread::sleep(time::Duration::from_millis(50));
        drop(pending); // no commit
        assert_eq!(peer.join().unwrap(), None);

        // a committed one becomes visible to the waiter
        let pending = cache.insert_mut(TestEntry::new(1, "uid=a")).unwrap();
        let peer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_id(1).map(|entry| entry.id()))
        };
        thread::sleep(time::Duration::from_millis(50));
        pending.commit();
        drop(pending);
        assert_eq!(peer.join().unwrap(), Some(1));
    }

    #[test]
    fn lookup_waits_for_writer() {
        init();
        let cache = Arc::new(EntryCache::<TestEntry>::new(8));

        put(&cache, 3, "uid=c");

        let mut entry = cache.get_id_mut(3).unwrap();
        let peer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_id(3).unwrap().visits)
        };
        thread::sleep(time::Duration::from_millis(50));
        entry.visits = 7;
        drop(entry);

        // the reader can only have gotten in after the writer released
        assert_eq!(peer.join().unwrap(), 7);
    }

    #[test]
    #[should_panic(expected = "not being created")]
    fn commit_on_ready_panics() {
        let cache = EntryCache::new(4);

        put(&cache, 1, "uid=a");

        let entry = cache.get_id(1).unwrap();
        entry.commit();
    }

    #[test]
    pub fn multithreaded_stress() {
        init();
        let cache = Arc::new(EntryCache::<TestEntry>::new(128));

        let num_threads: usize = env::var("STRESS_THREADS")
            .unwrap_or("10".to_string())
            .parse()
            .unwrap();
        let wait_millis: u64 = env::var("STRESS_WAIT")
            .unwrap_or("5".to_string())
            .parse()
            .unwrap();
        let iterations: u64 = env::var("STRESS_ITERATIONS")
            .unwrap_or("100".to_string())
            .parse()
            .unwrap();
        let range: u64 = env::var("STRESS_RANGE")
            .unwrap_or("1000".to_string())
            .parse()
            .unwrap();

        fn stress_dn(id: Id) -> String {
            format!("uid=user{},dc=example", id)
        }

        let mut handles = Vec::with_capacity(num_threads);
        let barrier = Arc::new(Barrier::new(num_threads));
        for thread_num in 0..num_threads {
            let barrier = Arc::clone(&barrier);
            let cache = Arc::clone(&cache);

            handles.push(
                thread::Builder::new()
                    .name(thread_num.to_string())
                    .spawn(move || {
                        let mut rng = rand::thread_rng();
                        barrier.wait();

                        for _ in 0..iterations {
                            // id is the entry we handle
                            let id = rng.gen_range(1..=range);
                            // p is the probability of some operation
                            let p = rng.gen_range(0..100);
                            // w is the wait time to simulate thread work
                            let w = if wait_millis > 0 {
                                Some(time::Duration::from_millis(rng.gen_range(0..wait_millis)))
                            } else {
                                None
                            };

                            if p < 35 {
                                if let Some(entry) = cache.get_id(id) {
                                    assert_eq!(entry.id(), id);
                                    assert_eq!(entry.dn, stress_dn(id).into_bytes());
                                    if let Some(w) = w {
                                        thread::sleep(w);
                                    }
                                }
                            } else if p < 50 {
                                if let Some(mut entry) = cache.get_id_mut(id) {
                                    entry.visits += 1;
                                    if let Some(w) = w {
                                        thread::sleep(w);
                                    }
                                }
                            } else if p < 60 {
                                if let Some(found) = cache.name_to_id(stress_dn(id).as_bytes()) {
                                    assert_eq!(found, id);
                                }
                            } else if p < 90 {
                                match cache.insert_mut(TestEntry::new(id, &stress_dn(id))) {
                                    Ok(entry) => {
                                        entry.commit();
                                        if let Some(w) = w {
                                            thread::sleep(w);
                                        }
                                    }
                                    Err(err) => {
                                        let record = err.into_record();
                                        assert_eq!(record.id, id);
                                    }
                                }
                            } else if p < 95 {
                                if let Some(entry) = cache.get_id_mut(id) {
                                    entry.delete();
                                }
                            } else {
                                // delete and resurrect in one held sequence
                                if let Some(mut entry) = cache.get_id_mut(id) {
                                    entry.delete();
                                    if entry.reinsert().is_ok() {
                                        entry.commit();
                                    }
                                }
                            }
                        }
                    })
                    .unwrap(),
            );
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // every guard is gone, so a drain must leave nothing behind
        cache.drain();
        assert_eq!(cache.len(), 0);
    }
}
