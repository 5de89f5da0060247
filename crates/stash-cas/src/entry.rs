//! The entry table: content key -> entry metadata with an embedded
//! most-recently-used ordering.
//!
//! Two-level locking: a structural lock guards the key->id map; each entry
//! owns a `RwLock` over its mutable fields. The access-order list lives in
//! an arena of slots addressed by integer id — `prev`/`next` are indices,
//! not pointers — guarded, together with the byte tally, by one mutex.
//!
//! Lock order: structural, then access, then entry state. The structural
//! lock is only ever held for map lookups; the access mutex is never taken
//! while an entry lock is held (entry locks may be *taken* under the access
//! mutex, but only without blocking).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::info;

use stash_codec::ContentKey;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct EntryId(u32);

impl EntryId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Mutable entry fields, guarded by the entry's own lock.
#[derive(Default)]
pub(crate) struct EntryState {
    /// Bytes on disk. Meaningful only while `exists`.
    pub size: u64,
    /// Existence has been checked against the filesystem (or the blob was
    /// written by us). `verified && !exists` means confirmed absent.
    pub verified: bool,
    pub exists: bool,
    /// Soft-deleted; the physical delete happens on the next snapshot save.
    pub dropped: bool,
    /// Path policy excluded the source; never materialized from.
    pub disallowed: bool,
}

pub(crate) struct Entry {
    pub key: ContentKey,
    pub state: RwLock<EntryState>,
}

#[derive(Default, Clone, Copy)]
struct Slot {
    prev: Option<EntryId>,
    next: Option<EntryId>,
    attached: bool,
}

struct AccessList {
    slots: Vec<Slot>,
    entries: Vec<Option<Arc<Entry>>>,
    free: Vec<EntryId>,
    /// Most recently used end.
    newest: Option<EntryId>,
    /// Least recently used end.
    oldest: Option<EntryId>,
    total_bytes: u64,
    max_bytes: u64,
    evicted_bytes: u64,
    evicted_count: u64,
    dropped_bytes: u64,
    dropped_count: u64,
    overflow_reported: bool,
}

/// Byte tally and eviction counters, snapshotted for reporting.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Tally {
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub evicted_bytes: u64,
    pub evicted_count: u64,
    pub dropped_bytes: u64,
    pub dropped_count: u64,
    pub overflow_reported: bool,
}

/// An entry pulled off the cold end by the incremental eviction walk. Its
/// bytes are already deducted; the caller deletes the blob and finalizes.
pub(crate) struct EvictionCandidate {
    pub id: EntryId,
    pub key: ContentKey,
    pub size: u64,
    pub entry: Arc<Entry>,
}

pub(crate) struct EntryTable {
    lookup: RwLock<HashMap<ContentKey, EntryId>>,
    access: Mutex<AccessList>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self {
            lookup: RwLock::new(HashMap::new()),
            access: Mutex::new(AccessList {
                slots: Vec::new(),
                entries: Vec::new(),
                free: Vec::new(),
                newest: None,
                oldest: None,
                total_bytes: 0,
                max_bytes: 0,
                evicted_bytes: 0,
                evicted_count: 0,
                dropped_bytes: 0,
                dropped_count: 0,
                overflow_reported: false,
            }),
        }
    }

    pub fn find(&self, key: ContentKey) -> Option<(EntryId, Arc<Entry>)> {
        let id = *self.lookup.read().unwrap().get(&key)?;
        let entry = self.access.lock().unwrap().entries[id.idx()].clone()?;
        Some((id, entry))
    }

    pub fn find_or_insert(&self, key: ContentKey) -> (EntryId, Arc<Entry>) {
        let mut lookup = self.lookup.write().unwrap();
        let mut access = self.access.lock().unwrap();
        if let Some(&id) = lookup.get(&key) {
            let entry = access.entries[id.idx()].clone().expect("mapped entry has no slot");
            return (id, entry);
        }
        let entry = Arc::new(Entry {
            key,
            state: RwLock::new(EntryState::default()),
        });
        let id = match access.free.pop() {
            Some(id) => {
                access.slots[id.idx()] = Slot::default();
                access.entries[id.idx()] = Some(entry.clone());
                id
            }
            None => {
                let id = EntryId(access.slots.len() as u32);
                access.slots.push(Slot::default());
                access.entries.push(Some(entry.clone()));
                id
            }
        };
        lookup.insert(key, id);
        (id, entry)
    }

    pub fn entry_by_id(&self, id: EntryId) -> Option<Arc<Entry>> {
        self.access.lock().unwrap().entries[id.idx()].clone()
    }

    pub fn len(&self) -> usize {
        self.lookup.read().unwrap().len()
    }

    /// Move an entry to the most-recently-used end (attaching it if fresh).
    pub fn touch(&self, id: EntryId) {
        let mut a = self.access.lock().unwrap();
        a.move_to_newest(id);
    }

    /// Append an entry at the least-recently-used end. Used when rebuilding
    /// the list in stored order (snapshot load, reconciliation).
    pub fn attach_oldest(&self, id: EntryId) {
        let mut a = self.access.lock().unwrap();
        a.attach_oldest(id);
    }

    /// Account a loaded entry: attach cold and add its bytes.
    pub fn insert_loaded(&self, id: EntryId, size: u64) {
        let mut a = self.access.lock().unwrap();
        a.attach_oldest(id);
        a.total_bytes += size;
        a.max_bytes = a.max_bytes.max(a.total_bytes);
    }

    /// Zero the byte tally before a reconciliation recount.
    pub fn reset_total(&self) {
        self.access.lock().unwrap().total_bytes = 0;
    }

    pub fn add_total(&self, size: u64) {
        let mut a = self.access.lock().unwrap();
        a.total_bytes += size;
        a.max_bytes = a.max_bytes.max(a.total_bytes);
    }

    /// Record a blob write and, once capacity is configured and exceeded,
    /// walk the cold end collecting eviction candidates. The walk stops at
    /// the first entry still verified (or locked) this pass: those are in
    /// use. If the budget still cannot be met, the overflow is reported
    /// once and allowed.
    ///
    /// The caller must not hold the entry's state lock.
    pub fn record_write(
        &self,
        _id: EntryId,
        old_size: u64,
        new_size: u64,
        capacity: u64,
    ) -> Vec<EvictionCandidate> {
        let mut a = self.access.lock().unwrap();
        a.total_bytes = a.total_bytes + new_size - old_size;
        a.max_bytes = a.max_bytes.max(a.total_bytes);

        if capacity == 0 || a.overflow_reported || a.total_bytes <= capacity {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        let mut it = a.oldest;
        while let Some(id) = it {
            let entry = match a.entries[id.idx()].clone() {
                Some(e) => e,
                None => break,
            };
            let Ok(mut st) = entry.state.try_write() else {
                break; // locked: actively in use
            };
            if st.verified {
                break; // in use this pass; never evict mid-use
            }
            let size = st.size;
            st.exists = false;
            st.size = 0;
            drop(st);

            a.evicted_bytes += size;
            a.evicted_count += 1;
            a.total_bytes -= size;

            it = a.slots[id.idx()].prev;
            a.detach(id);
            candidates.push(EvictionCandidate {
                id,
                key: entry.key,
                size,
                entry,
            });
            if a.total_bytes <= capacity {
                break;
            }
        }

        if a.total_bytes > capacity {
            a.overflow_reported = true;
            info!(
                capacity_bytes = capacity,
                total_bytes = a.total_bytes,
                "exceeding configured store capacity; current session needs more storage and will overflow"
            );
        }
        candidates
    }

    /// Undo one candidate's accounting after its blob delete failed.
    pub fn restore_after_failed_evict(&self, id: EntryId, size: u64) {
        let mut a = self.access.lock().unwrap();
        a.evicted_bytes -= size;
        a.evicted_count -= 1;
        a.total_bytes += size;
        a.attach_oldest(id);
    }

    /// Account a physical drop: bytes come off the tally, the entry leaves
    /// the access list (it stays in the map as confirmed-missing).
    pub fn record_dropped(&self, id: EntryId, size_deleted: u64) {
        let mut a = self.access.lock().unwrap();
        a.total_bytes -= size_deleted;
        if size_deleted > 0 {
            a.dropped_bytes += size_deleted;
            a.dropped_count += 1;
        }
        a.detach(id);
    }

    /// Remove an entry from the table entirely.
    pub fn erase(&self, key: ContentKey, id: EntryId) {
        let mut lookup = self.lookup.write().unwrap();
        let mut a = self.access.lock().unwrap();
        if lookup.remove(&key).is_some() {
            a.detach(id);
            a.entries[id.idx()] = None;
            a.free.push(id);
        }
    }

    /// Oldest entry while the tally exceeds `capacity`; zeroes the tally if
    /// the list is empty (nothing left to account for).
    pub fn oldest_if_over(&self, capacity: u64) -> Option<(EntryId, Arc<Entry>)> {
        let mut a = self.access.lock().unwrap();
        if a.total_bytes <= capacity {
            return None;
        }
        match a.oldest {
            None => {
                a.total_bytes = 0;
                None
            }
            Some(id) => {
                let entry = a.entries[id.idx()].clone()?;
                Some((id, entry))
            }
        }
    }

    /// All entries newest-first, in access order.
    pub fn collect_mru(&self) -> Vec<(EntryId, Arc<Entry>)> {
        let _lookup = self.lookup.read().unwrap();
        let a = self.access.lock().unwrap();
        let mut out = Vec::with_capacity(a.slots.len());
        let mut it = a.newest;
        while let Some(id) = it {
            if let Some(entry) = a.entries[id.idx()].clone() {
                out.push((id, entry));
            }
            it = a.slots[id.idx()].next;
        }
        out
    }

    /// Every mapped entry, unordered.
    pub fn all_entries(&self) -> Vec<(ContentKey, EntryId, Arc<Entry>)> {
        let lookup = self.lookup.read().unwrap();
        let a = self.access.lock().unwrap();
        lookup
            .iter()
            .filter_map(|(&key, &id)| a.entries[id.idx()].clone().map(|e| (key, id, e)))
            .collect()
    }

    pub fn clear(&self) {
        let mut lookup = self.lookup.write().unwrap();
        let mut a = self.access.lock().unwrap();
        lookup.clear();
        a.slots.clear();
        a.entries.clear();
        a.free.clear();
        a.newest = None;
        a.oldest = None;
        a.total_bytes = 0;
        a.max_bytes = 0;
        a.overflow_reported = false;
    }

    pub fn tally(&self) -> Tally {
        let a = self.access.lock().unwrap();
        Tally {
            total_bytes: a.total_bytes,
            max_bytes: a.max_bytes,
            evicted_bytes: a.evicted_bytes,
            evicted_count: a.evicted_count,
            dropped_bytes: a.dropped_bytes,
            dropped_count: a.dropped_count,
            overflow_reported: a.overflow_reported,
        }
    }
}

impl AccessList {
    fn move_to_newest(&mut self, id: EntryId) {
        if self.newest == Some(id) {
            return;
        }
        if self.slots[id.idx()].attached {
            self.unlink(id);
        }
        self.slots[id.idx()].prev = None;
        self.slots[id.idx()].next = self.newest;
        if let Some(n) = self.newest {
            self.slots[n.idx()].prev = Some(id);
        }
        self.newest = Some(id);
        if self.oldest.is_none() {
            self.oldest = Some(id);
        }
        self.slots[id.idx()].attached = true;
    }

    fn attach_oldest(&mut self, id: EntryId) {
        if self.slots[id.idx()].attached {
            return;
        }
        self.slots[id.idx()].prev = self.oldest;
        self.slots[id.idx()].next = None;
        if let Some(o) = self.oldest {
            self.slots[o.idx()].next = Some(id);
        }
        self.oldest = Some(id);
        if self.newest.is_none() {
            self.newest = Some(id);
        }
        self.slots[id.idx()].attached = true;
    }

    fn detach(&mut self, id: EntryId) {
        if !self.slots[id.idx()].attached {
            return;
        }
        self.unlink(id);
        self.slots[id.idx()] = Slot::default();
    }

    fn unlink(&mut self, id: EntryId) {
        let Slot { prev, next, .. } = self.slots[id.idx()];
        match prev {
            Some(p) => self.slots[p.idx()].next = next,
            None => {
                debug_assert_eq!(self.newest, Some(id), "unlinked head is not newest");
                self.newest = next;
            }
        }
        match next {
            Some(n) => self.slots[n.idx()].prev = prev,
            None => {
                debug_assert_eq!(self.oldest, Some(id), "unlinked tail is not oldest");
                self.oldest = prev;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_codec::compute_key;

    fn key(n: u8) -> ContentKey {
        compute_key(&[n], true)
    }

    #[test]
    fn test_insert_and_find() {
        let table = EntryTable::new();
        assert!(table.find(key(1)).is_none());
        let (id, entry) = table.find_or_insert(key(1));
        assert_eq!(entry.key, key(1));
        let (id2, _) = table.find_or_insert(key(1));
        assert_eq!(id, id2);
        assert_eq!(table.len(), 1);
        assert!(table.find(key(1)).is_some());
    }

    #[test]
    fn test_mru_order_follows_touch() {
        let table = EntryTable::new();
        let (a, _) = table.find_or_insert(key(1));
        let (b, _) = table.find_or_insert(key(2));
        let (c, _) = table.find_or_insert(key(3));
        table.touch(a);
        table.touch(b);
        table.touch(c);
        // MRU order: c, b, a
        let order: Vec<ContentKey> = table.collect_mru().iter().map(|(_, e)| e.key).collect();
        assert_eq!(order, vec![key(3), key(2), key(1)]);

        table.touch(a);
        let order: Vec<ContentKey> = table.collect_mru().iter().map(|(_, e)| e.key).collect();
        assert_eq!(order, vec![key(1), key(3), key(2)]);
        let _ = (b, c);
    }

    #[test]
    fn test_eviction_walk_stops_at_verified() {
        let table = EntryTable::new();
        // Oldest-first: k1 (unverified), k2 (verified), k3 (unverified)
        for (n, verified) in [(1u8, false), (2, true), (3, false)] {
            let (id, entry) = table.find_or_insert(key(n));
            table.touch(id);
            let mut st = entry.state.write().unwrap();
            st.verified = verified;
            st.exists = true;
            st.size = 100;
            drop(st);
            table.add_total(100);
        }
        // Writing 100 more with capacity 150: walk evicts k1 (oldest,
        // unverified) then stops at verified k2 even though still over.
        let (id, entry) = table.find_or_insert(key(4));
        table.touch(id);
        entry.state.write().unwrap().size = 100;
        let candidates = table.record_write(id, 0, 100, 150);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key, key(1));
        let t = table.tally();
        assert!(t.overflow_reported);
        assert_eq!(t.total_bytes, 300);
        assert_eq!(t.evicted_count, 1);
    }

    #[test]
    fn test_erase_reuses_slot() {
        let table = EntryTable::new();
        let (id, _) = table.find_or_insert(key(1));
        table.touch(id);
        table.erase(key(1), id);
        assert!(table.find(key(1)).is_none());
        assert_eq!(table.len(), 0);
        let (id2, _) = table.find_or_insert(key(2));
        assert_eq!(id, id2); // freed slot reused
    }

    #[test]
    fn test_record_dropped_detaches() {
        let table = EntryTable::new();
        let (id, _) = table.find_or_insert(key(1));
        table.touch(id);
        table.add_total(50);
        table.record_dropped(id, 50);
        let t = table.tally();
        assert_eq!(t.total_bytes, 0);
        assert_eq!(t.dropped_count, 1);
        assert!(table.collect_mru().is_empty());
        // still mapped: confirmed-missing, not erased
        assert_eq!(table.len(), 1);
    }
}
