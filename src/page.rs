// src/page.rs - Tracked page records, neighbor slots and the record arena
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::MAX_NEIGHBORS;

/// Physical placement of a tracked page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Fast,
    Slow,
}

impl Tier {
    fn to_raw(self) -> u8 {
        match self {
            Tier::Fast => 0,
            Tier::Slow => 1,
        }
    }

    fn from_raw(raw: u8) -> Self {
        if raw == 0 {
            Tier::Fast
        } else {
            Tier::Slow
        }
    }
}

/// Non-owning handle to a page record in the [`PageArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u32);

impl PageId {
    pub(crate) const NIL: u32 = u32::MAX;

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NIL {
            None
        } else {
            Some(PageId(raw))
        }
    }
}

/// The three membership lists a page can be linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Cold,
    Hot,
    Free,
}

impl ListKind {
    pub(crate) fn to_raw(self) -> u8 {
        match self {
            ListKind::Cold => 1,
            ListKind::Hot => 2,
            ListKind::Free => 3,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ListKind::Cold),
            2 => Some(ListKind::Hot),
            3 => Some(ListKind::Free),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ListKind::Cold => "cold",
            ListKind::Hot => "hot",
            ListKind::Free => "free",
        }
    }
}

/// Linkage owned by whichever list currently holds the page. Only written
/// while that list's lock is held.
#[derive(Debug)]
pub(crate) struct ListLink {
    pub(crate) owner: AtomicU8,
    pub(crate) prev: AtomicU32,
    pub(crate) next: AtomicU32,
}

impl ListLink {
    fn new() -> Self {
        Self {
            owner: AtomicU8::new(0),
            prev: AtomicU32::new(PageId::NIL),
            next: AtomicU32::new(PageId::NIL),
        }
    }
}

/// A page considered spatio-temporally close to its owner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub page: PageId,
    pub distance: f64,
    /// Neighbor access time minus owner access time.
    pub time_diff: i64,
}

/// Fixed-capacity neighbor slots ranked by distance.
#[derive(Debug, Clone, Default)]
pub struct NeighborSet {
    slots: [Option<Neighbor>; MAX_NEIGHBORS],
}

impl NeighborSet {
    pub fn clear(&mut self) {
        self.slots = [None; MAX_NEIGHBORS];
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn contains(&self, page: PageId) -> bool {
        self.iter().any(|n| n.page == page)
    }

    /// Age every relationship so stale neighbors lose priority.
    pub fn decay(&mut self, factor: f64) {
        for n in self.slots.iter_mut().flatten() {
            n.distance *= factor;
        }
    }

    /// Offer a candidate. An existing entry for the same page is refreshed,
    /// otherwise an empty slot is filled, otherwise the furthest entry is
    /// replaced if the candidate is closer. Returns whether the set changed.
    pub fn offer(&mut self, candidate: Neighbor) -> bool {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|n| n.page == candidate.page)
        {
            *slot = candidate;
            return true;
        }
        if let Some(empty) = self.slots.iter_mut().find(|s| s.is_none()) {
            *empty = Some(candidate);
            return true;
        }
        let furthest = self
            .slots
            .iter_mut()
            .flatten()
            .max_by(|a, b| a.distance.total_cmp(&b.distance));
        match furthest {
            Some(slot) if candidate.distance < slot.distance => {
                *slot = candidate;
                true
            }
            _ => false,
        }
    }

    /// Closest neighbor strictly below `threshold`.
    pub fn closest_below(&self, threshold: f64) -> Option<Neighbor> {
        self.iter()
            .filter(|n| n.distance < threshold)
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .copied()
    }
}

/// Address span assigned to a page record when it is carved from a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// Table key.
    pub(crate) va: u64,
    pub(crate) va_start: u64,
    pub(crate) size: u64,
    pub(crate) tier: Tier,
}

/// Metadata for one tracked region of virtual memory.
#[derive(Debug)]
pub struct Page {
    id: PageId,
    lock: Mutex<()>,
    va: AtomicU64,
    va_start: AtomicU64,
    size: AtomicU64,
    tier: AtomicU8,
    hot: AtomicBool,
    free: AtomicBool,
    migrating: AtomicBool,
    migrated: AtomicBool,
    accesses: AtomicU64,
    local_clock: AtomicU64,
    cyc_accessed: AtomicU64,
    ip: AtomicU64,
    mig_start: AtomicU64,
    neighbors: Mutex<NeighborSet>,
    pub(crate) link: ListLink,
}

impl Page {
    fn new(id: PageId, span: PageSpan) -> Self {
        let page = Self {
            id,
            lock: Mutex::new(()),
            va: AtomicU64::new(0),
            va_start: AtomicU64::new(0),
            size: AtomicU64::new(0),
            tier: AtomicU8::new(Tier::Slow.to_raw()),
            hot: AtomicBool::new(false),
            free: AtomicBool::new(false),
            migrating: AtomicBool::new(false),
            migrated: AtomicBool::new(false),
            accesses: AtomicU64::new(0),
            local_clock: AtomicU64::new(0),
            cyc_accessed: AtomicU64::new(0),
            ip: AtomicU64::new(0),
            mig_start: AtomicU64::new(0),
            neighbors: Mutex::new(NeighborSet::default()),
            link: ListLink::new(),
        };
        page.reset(span);
        page
    }

    /// Reinitialize every transient field for a new span. Callers recycling
    /// a record hold the page lock.
    pub fn reset(&self, span: PageSpan) {
        self.va.store(span.va, Ordering::Release);
        self.va_start.store(span.va_start, Ordering::Release);
        self.size.store(span.size, Ordering::Release);
        self.tier.store(span.tier.to_raw(), Ordering::Release);
        self.hot.store(false, Ordering::Release);
        self.free.store(false, Ordering::Release);
        self.migrating.store(false, Ordering::Release);
        self.migrated.store(false, Ordering::Release);
        self.accesses.store(0, Ordering::Relaxed);
        self.local_clock.store(0, Ordering::Relaxed);
        self.cyc_accessed.store(0, Ordering::Relaxed);
        self.ip.store(0, Ordering::Relaxed);
        self.mig_start.store(0, Ordering::Relaxed);
        self.neighbors.lock().clear();
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Page lock guarding list membership transitions.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Non-blocking page lock for the sampling path.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock()
    }

    pub fn va(&self) -> u64 {
        self.va.load(Ordering::Acquire)
    }

    pub fn va_start(&self) -> u64 {
        self.va_start.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Whether `addr` falls inside `[va_start, va_start + size)`.
    pub fn covers(&self, addr: u64) -> bool {
        let start = self.va_start();
        addr >= start && addr < start + self.size()
    }

    pub fn tier(&self) -> Tier {
        Tier::from_raw(self.tier.load(Ordering::Acquire))
    }

    pub fn set_tier(&self, tier: Tier) {
        self.tier.store(tier.to_raw(), Ordering::Release);
    }

    pub fn is_hot(&self) -> bool {
        self.hot.load(Ordering::Acquire)
    }

    pub fn set_hot(&self, hot: bool) {
        self.hot.store(hot, Ordering::Release);
    }

    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    pub fn set_free(&self, free: bool) {
        self.free.store(free, Ordering::Release);
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::Acquire)
    }

    pub fn set_migrating(&self, migrating: bool) {
        self.migrating.store(migrating, Ordering::Release);
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated.load(Ordering::Acquire)
    }

    pub fn set_migrated(&self, migrated: bool) {
        self.migrated.store(migrated, Ordering::Release);
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    pub fn local_clock(&self) -> u64 {
        self.local_clock.load(Ordering::Relaxed)
    }

    pub fn cyc_accessed(&self) -> u64 {
        self.cyc_accessed.load(Ordering::Relaxed)
    }

    pub fn ip(&self) -> u64 {
        self.ip.load(Ordering::Relaxed)
    }

    pub fn mig_start(&self) -> u64 {
        self.mig_start.load(Ordering::Relaxed)
    }

    pub fn set_mig_start(&self, ts: u64) {
        self.mig_start.store(ts, Ordering::Relaxed);
    }

    /// List currently linking this page, if any.
    pub fn list(&self) -> Option<ListKind> {
        ListKind::from_raw(self.link.owner.load(Ordering::Acquire))
    }

    pub fn neighbors(&self) -> MutexGuard<'_, NeighborSet> {
        self.neighbors.lock()
    }

    /// Apply the cooling epochs missed since the last sample:
    /// `accesses >>= global_clock - local_clock`.
    pub fn cool(&self, global_clock: u64) -> u64 {
        let epochs = global_clock.saturating_sub(self.local_clock());
        let accesses = if epochs >= u64::BITS as u64 {
            0
        } else {
            self.accesses() >> epochs
        };
        self.accesses.store(accesses, Ordering::Relaxed);
        self.local_clock.store(global_clock, Ordering::Relaxed);
        accesses
    }

    /// Cool, count one access and keep the newest timestamp/ip.
    /// Returns the updated access count.
    pub fn record_access(&self, global_clock: u64, time: u64, ip: u64) -> u64 {
        let accesses = self.cool(global_clock) + 1;
        self.accesses.store(accesses, Ordering::Relaxed);
        if time > self.cyc_accessed() {
            self.cyc_accessed.store(time, Ordering::Relaxed);
            self.ip.store(ip, Ordering::Relaxed);
        }
        accesses
    }
}

/// Owner of every page record for the life of the process. Records are never
/// dropped before teardown, so [`PageId`] handles stay valid.
#[derive(Debug, Default)]
pub struct PageArena {
    pages: RwLock<Vec<Arc<Page>>>,
}

impl PageArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh record for `span`.
    pub fn create(&self, span: PageSpan) -> Arc<Page> {
        let mut pages = self.pages.write();
        let id = PageId(pages.len() as u32);
        let page = Arc::new(Page::new(id, span));
        pages.push(Arc::clone(&page));
        page
    }

    pub fn get(&self, id: PageId) -> Option<Arc<Page>> {
        self.pages.read().get(id.index()).cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }

    /// Bytes of metadata held for `count` records.
    pub fn record_bytes(count: usize) -> u64 {
        (count * std::mem::size_of::<Page>()) as u64
    }
}
