// src/list.rs - Locked doubly-linked page list used as FIFO queue and LRU order
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::page::{ListKind, Page, PageArena, PageId};

#[derive(Debug, Default)]
struct Ends {
    /// Most recently enqueued.
    head: Option<PageId>,
    /// Oldest; next to dequeue.
    tail: Option<PageId>,
}

/// Thread-safe list of pages. Links live in the pages themselves and are
/// only touched while `ends` is locked.
#[derive(Debug)]
pub struct PageList {
    kind: ListKind,
    arena: Arc<PageArena>,
    ends: Mutex<Ends>,
    len: AtomicUsize,
}

impl PageList {
    pub fn new(kind: ListKind, arena: Arc<PageArena>) -> Self {
        Self {
            kind,
            arena,
            ends: Mutex::new(Ends::default()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    /// Entry count; may briefly lag actual membership.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn page(&self, id: PageId) -> Arc<Page> {
        match self.arena.get(id) {
            Some(page) => page,
            None => panic!("{} list links unknown page {:?}", self.kind.name(), id),
        }
    }

    /// Insert at the head.
    ///
    /// # Panics
    /// If the page is already linked into any list.
    pub fn enqueue(&self, page: &Page) {
        let mut ends = self.ends.lock();
        assert!(
            page.list().is_none(),
            "page {:#x} enqueued to {} list while linked in {:?}",
            page.va(),
            self.kind.name(),
            page.list()
        );

        let link = &page.link;
        link.prev.store(PageId::NIL, Ordering::Relaxed);
        match ends.head {
            Some(old_head) => {
                self.page(old_head)
                    .link
                    .prev
                    .store(page.id().raw(), Ordering::Relaxed);
                link.next.store(old_head.raw(), Ordering::Relaxed);
            }
            None => {
                debug_assert!(ends.tail.is_none());
                link.next.store(PageId::NIL, Ordering::Relaxed);
                ends.tail = Some(page.id());
            }
        }
        ends.head = Some(page.id());
        link.owner.store(self.kind.to_raw(), Ordering::Release);
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Remove and return the oldest page.
    pub fn dequeue(&self) -> Option<Arc<Page>> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }

        let mut ends = self.ends.lock();
        let tail = self.page(ends.tail?);
        if tail.list() != Some(self.kind) {
            return None;
        }
        self.unlink(&mut ends, &tail);
        Some(tail)
    }

    /// Unlink `page` wherever it sits; no-op when it is not in this list.
    pub fn remove(&self, page: &Page) {
        let mut ends = self.ends.lock();
        if page.list() != Some(self.kind) {
            return;
        }
        if ends.head.is_none() {
            log::debug!("remove from empty {} list", self.kind.name());
            return;
        }
        self.unlink(&mut ends, page);
    }

    /// Page enqueued just before `page`, or the tail when `page` is `None`.
    pub fn peek_prev(&self, page: Option<&Page>) -> Option<Arc<Page>> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let ends = self.ends.lock();
        let id = match page {
            None => ends.tail,
            Some(page) => {
                assert_eq!(page.list(), Some(self.kind));
                PageId::from_raw(page.link.prev.load(Ordering::Relaxed))
            }
        };
        id.map(|id| self.page(id))
    }

    /// Snapshot of members from oldest to newest.
    pub fn ids(&self) -> Vec<PageId> {
        let ends = self.ends.lock();
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = ends.tail;
        while let Some(id) = cursor {
            out.push(id);
            cursor = PageId::from_raw(self.page(id).link.prev.load(Ordering::Relaxed));
        }
        out
    }

    fn unlink(&self, ends: &mut Ends, page: &Page) {
        let link = &page.link;
        let prev = PageId::from_raw(link.prev.load(Ordering::Relaxed));
        let next = PageId::from_raw(link.next.load(Ordering::Relaxed));

        match prev {
            Some(prev) => self
                .page(prev)
                .link
                .next
                .store(next.map_or(PageId::NIL, PageId::raw), Ordering::Relaxed),
            None => ends.head = next,
        }
        match next {
            Some(next) => self
                .page(next)
                .link
                .prev
                .store(prev.map_or(PageId::NIL, PageId::raw), Ordering::Relaxed),
            None => ends.tail = prev,
        }

        link.prev.store(PageId::NIL, Ordering::Relaxed);
        link.next.store(PageId::NIL, Ordering::Relaxed);
        link.owner.store(0, Ordering::Release);
        let before = self.len.fetch_sub(1, Ordering::Release);
        assert!(before > 0, "{} list length underflow", self.kind.name());
    }
}
