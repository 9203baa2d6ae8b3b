use std::num::NonZeroUsize;

use chrono::NaiveDate;
use lru::LruCache;
use parking_lot::Mutex;

use crate::calendar::date_from_epoch_day;
use crate::limits::{DAY_MS, HOUR_MS};
use crate::model::{Ms, Slot};
use crate::observability::CACHE_LOOKUPS_TOTAL;

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// Day slots keyed by logical day, least recently used evicted first.
///
/// One handle is shared by the whole process. While inactive every lookup
/// misses and `add` is ignored. Deactivating clears the content.
pub struct SlotCache {
    inner: Mutex<Inner>,
    offset_ms: Ms,
}

/// The active flag lives under the same lock as the entries: a writer that
/// saw the cache active cannot store after a concurrent deactivation.
struct Inner {
    active: bool,
    entries: LruCache<NaiveDate, Slot>,
}

impl SlotCache {
    /// A new inactive cache. `offset_ms` is the local zone, used to probe
    /// instants by their local date.
    pub fn new(size: usize, offset_ms: Ms) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: false,
                entries: LruCache::new(capacity(size)),
            }),
            offset_ms,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn activate(&self) {
        self.inner.lock().active = true;
    }

    /// Clear and deactivate. Returns whether the cache was active.
    pub fn deactivate(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        std::mem::replace(&mut inner.active, false)
    }

    /// Empty the cache, keep the active flag.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn set_size(&self, size: usize) {
        self.inner.lock().entries.resize(capacity(size));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a day slot. Ignored while inactive, or if the slot does not
    /// stand for a single day.
    pub fn add(&self, slot: &Slot) {
        let Some(day) = slot.day() else {
            tracing::debug!("SlotCache::add: slot {} has no day, not cached", slot.id);
            return;
        };
        let mut inner = self.inner.lock();
        if inner.active {
            inner.entries.put(day, slot.clone());
        }
    }

    pub fn invalidate(&self, day: NaiveDate) {
        self.inner.lock().entries.pop(&day);
    }

    pub fn try_get_by_day(&self, day: NaiveDate) -> Option<Slot> {
        let mut inner = self.inner.lock();
        if !inner.active {
            drop(inner);
            metrics::counter!(CACHE_LOOKUPS_TOTAL, "result" => "inactive").increment(1);
            return None;
        }
        let found = inner.entries.get(&day).cloned();
        drop(inner);
        let result = if found.is_some() { "hit" } else { "miss" };
        metrics::counter!(CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
        found
    }

    /// The cached day containing `t`: its local date first, then the
    /// previous day before local noon, the next one after.
    pub fn try_get_by_instant(&self, t: Ms) -> Option<Slot> {
        let local = t + self.offset_ms;
        let epoch_day = local.div_euclid(DAY_MS);
        let adjacent = if local.rem_euclid(DAY_MS) < 12 * HOUR_MS {
            epoch_day - 1
        } else {
            epoch_day + 1
        };
        [epoch_day, adjacent].into_iter().find_map(|n| {
            self.try_get_by_day(date_from_epoch_day(n))
                .filter(|slot| slot.span().contains_instant(t))
        })
    }

    /// Deactivate until the returned guard is dropped.
    pub fn suspend(&self) -> CacheSuspend<'_> {
        CacheSuspend::new(self)
    }
}

/// Keeps the cache deactivated (and empty) for its lifetime and restores the
/// previous active flag on drop, whichever way the scope is left.
pub struct CacheSuspend<'a> {
    cache: &'a SlotCache,
    was_active: bool,
}

impl<'a> CacheSuspend<'a> {
    pub fn new(cache: &'a SlotCache) -> Self {
        let was_active = cache.deactivate();
        Self { cache, was_active }
    }
}

impl Drop for CacheSuspend<'_> {
    fn drop(&mut self) {
        if self.was_active {
            self.cache.activate();
        }
    }
}
