// src/table.rs - Address-keyed page table behind a single lock
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::page::Page;

/// Ordered map from page key (`Page::va`) to page record.
///
/// Every operation takes the same lock. The sampling path uses the
/// non-blocking variants and simply misses when the table is busy.
#[derive(Debug)]
pub struct PageTable {
    pages: Mutex<BTreeMap<u64, Arc<Page>>>,
    page_size: u64,
    base_page_size: u64,
}

impl PageTable {
    pub fn new(page_size: u64, base_page_size: u64) -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            page_size,
            base_page_size,
        }
    }

    /// Insert keyed by `page.va()`. A duplicate key is left untouched.
    pub fn insert(&self, page: Arc<Page>) -> bool {
        let mut pages = self.pages.lock();
        let va = page.va();
        if pages.contains_key(&va) {
            log::debug!("page table: duplicate page {:#x}", va);
            return false;
        }
        pages.insert(va, page);
        true
    }

    /// Remove the entry for `page`, only if it still maps to this record.
    pub fn remove(&self, page: &Page) -> bool {
        let mut pages = self.pages.lock();
        let va = page.va();
        match pages.get(&va) {
            Some(existing) if existing.id() == page.id() => {
                pages.remove(&va);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, va: u64) -> Option<Arc<Page>> {
        self.pages.lock().get(&va).cloned()
    }

    /// Like [`lookup`](Self::lookup) but gives up immediately when contended.
    pub fn lookup_best_effort(&self, va: u64) -> Option<Arc<Page>> {
        let pages = self.pages.try_lock()?;
        pages.get(&va).cloned()
    }

    /// Find the record covering `addr`.
    ///
    /// Tries the page-size aligned key, then the next page-size key (full
    /// pages of an unaligned region are keyed at their rounded-up start),
    /// then the base-page key. Partial tails of unaligned regions are keyed
    /// at their own start, so the last resort is the closest key at or
    /// below `addr`.
    pub fn resolve(&self, addr: u64, best_effort: bool) -> Option<Arc<Page>> {
        let pages = if best_effort {
            self.pages.try_lock()?
        } else {
            self.pages.lock()
        };
        let aligned = addr & !(self.page_size - 1);
        let candidates = [
            aligned,
            aligned.wrapping_add(self.page_size),
            addr & !(self.base_page_size - 1),
        ];
        let found = candidates
            .iter()
            .filter_map(|key| pages.get(key))
            .chain(pages.range(..=addr).next_back().map(|(_, page)| page))
            .find(|page| page.covers(addr))
            .cloned();
        found
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BASE_PAGE_SIZE, DEFAULT_PAGE_SIZE};
    use crate::page::{PageArena, PageSpan, Tier};

    fn table() -> PageTable {
        PageTable::new(DEFAULT_PAGE_SIZE, BASE_PAGE_SIZE)
    }

    #[test]
    fn test_insert_is_idempotent() {
        let arena = PageArena::new();
        let table = table();
        let span = PageSpan {
            va: 0x4000_0000,
            va_start: 0x4000_0000,
            size: DEFAULT_PAGE_SIZE,
            tier: Tier::Fast,
        };
        let a = arena.create(span);
        let b = arena.create(span);
        assert!(table.insert(Arc::clone(&a)));
        assert!(!table.insert(Arc::clone(&b)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(0x4000_0000).map(|p| p.id()), Some(a.id()));

        // Removing the duplicate record must not evict the original.
        assert!(!table.remove(&b));
        assert!(table.remove(&a));
        assert!(table.is_empty());
    }

    #[test]
    fn test_best_effort_misses_when_contended() {
        let arena = PageArena::new();
        let table = table();
        let page = arena.create(PageSpan {
            va: 0x4000_0000,
            va_start: 0x4000_0000,
            size: DEFAULT_PAGE_SIZE,
            tier: Tier::Slow,
        });
        table.insert(page);
        let guard = table.pages.lock();
        assert!(table.lookup_best_effort(0x4000_0000).is_none());
        drop(guard);
        assert!(table.lookup_best_effort(0x4000_0000).is_some());
    }

    #[test]
    fn test_resolve_unaligned_full_page() {
        let arena = PageArena::new();
        let table = table();
        // Region starts 1 MiB past a 2 MiB boundary; key is rounded up.
        let start = 0x4010_0000;
        let page = arena.create(PageSpan {
            va: 0x4020_0000,
            va_start: start,
            size: DEFAULT_PAGE_SIZE,
            tier: Tier::Fast,
        });
        table.insert(Arc::clone(&page));
        for addr in [start, start + 0x8_0000, 0x4020_0000, start + DEFAULT_PAGE_SIZE - 1] {
            assert_eq!(table.resolve(addr, false).map(|p| p.id()), Some(page.id()));
        }
        assert!(table.resolve(start + DEFAULT_PAGE_SIZE, false).is_none());
    }

    #[test]
    fn test_resolve_partial_tail() {
        let arena = PageArena::new();
        let table = table();
        // 3 MiB region starting 8 KiB past a 2 MiB boundary.
        let start = 0x4000_2000;
        let head = arena.create(PageSpan {
            va: 0x4020_0000,
            va_start: start,
            size: DEFAULT_PAGE_SIZE,
            tier: Tier::Fast,
        });
        let tail_start = start + DEFAULT_PAGE_SIZE;
        let tail = arena.create(PageSpan {
            va: tail_start,
            va_start: tail_start,
            size: DEFAULT_PAGE_SIZE / 2,
            tier: Tier::Slow,
        });
        table.insert(Arc::clone(&head));
        table.insert(Arc::clone(&tail));

        for off in (0..3 * DEFAULT_PAGE_SIZE / 2).step_by(BASE_PAGE_SIZE as usize) {
            let expected = if off < DEFAULT_PAGE_SIZE { head.id() } else { tail.id() };
            assert_eq!(table.resolve(start + off, false).map(|p| p.id()), Some(expected));
            assert_eq!(table.resolve(start + off, true).map(|p| p.id()), Some(expected));
        }
        assert!(table.resolve(start - 1, false).is_none());
        assert!(table.resolve(tail_start + DEFAULT_PAGE_SIZE / 2, false).is_none());
    }
}
