// src/allocator.rs - Splits mapping requests across tiers and carves page records
use std::sync::Arc;

use crate::backend::{BindPolicy, MapRequest};
use crate::config::{align_down, align_up};
use crate::error::Result;
use crate::page::{Page, PageArena, PageId, PageSpan, Tier};
use crate::stats::TierStats;
use crate::TierContext;

/// Where a region landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Fast,
    Slow,
    /// `[addr, addr + fast_len)` fast, the rest slow.
    Split,
}

/// A tracked mapping returned by [`TierAllocator::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub addr: u64,
    pub length: u64,
    pub fast_len: u64,
    pub pages: Vec<PageId>,
}

impl Region {
    pub fn placement(&self) -> Placement {
        if self.fast_len == self.length {
            Placement::Fast
        } else if self.fast_len == 0 {
            Placement::Slow
        } else {
            Placement::Split
        }
    }

    /// Initial tier of the page starting at `va_start`.
    pub fn tier_of(&self, va_start: u64) -> Tier {
        if va_start < self.addr + self.fast_len {
            Tier::Fast
        } else {
            Tier::Slow
        }
    }
}

/// Entry point for intercepted mappings.
#[derive(Debug, Clone)]
pub struct TierAllocator {
    ctx: Arc<TierContext>,
}

impl TierAllocator {
    pub fn new(ctx: Arc<TierContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<TierContext> {
        &self.ctx
    }

    /// Reserve, place and start tracking a mapping.
    ///
    /// Reservation and binding failures are returned as-is; a failed bind
    /// leaves the budget charged.
    pub fn allocate(&self, request: &MapRequest) -> Result<Region> {
        let ctx = &self.ctx;
        let length = align_up(request.length, ctx.config().base_page_size);
        let addr = ctx.backend().reserve(&MapRequest {
            length,
            ..*request
        })?;

        let fast_len = self.place(addr, length);
        if fast_len > 0 {
            ctx.backend()
                .bind(addr, fast_len, Tier::Fast, BindPolicy::Preferred)?;
        }
        if fast_len < length {
            ctx.backend().bind(
                addr + fast_len,
                length - fast_len,
                Tier::Slow,
                BindPolicy::Preferred,
            )?;
        }
        TierStats::add(&ctx.stats().mem_allocated, length);

        let pages = self.carve(addr, length, addr + fast_len);
        log::debug!(
            "allocate: {:#x}+{} fast {} pages {}",
            addr,
            length,
            fast_len,
            pages.len()
        );
        Ok(Region {
            addr,
            length,
            fast_len,
            pages,
        })
    }

    /// Decide how many leading bytes go to the fast tier and charge both
    /// tiers.
    fn place(&self, addr: u64, length: u64) -> u64 {
        let ctx = &self.ctx;
        let page_size = ctx.config().page_size;
        let budget = ctx.budget();

        let mut range = ctx.placement_lock();
        range.min = range.min.min(addr);
        range.max = range.max.max(addr + length);

        let fast_size = budget.fast_size();
        let fast_used = budget.fast_used();
        let fast_len = if !budget.is_fast_locked() && fast_used + length as i64 <= fast_size {
            length
        } else if budget.is_fast_locked() || fast_used + page_size as i64 > fast_size {
            0
        } else {
            align_down((fast_size - fast_used) as u64, page_size)
        };
        budget.charge(Tier::Fast, fast_len);
        budget.charge(Tier::Slow, length - fast_len);
        fast_len
    }

    fn span_for(&self, addr: u64, length: u64, index: u64, split: u64) -> PageSpan {
        let page_size = self.ctx.config().page_size;
        let va_start = addr + index * page_size;
        let remaining = length - index * page_size;
        let (va, size) = if remaining < page_size {
            (va_start, remaining.max(self.ctx.config().base_page_size))
        } else {
            (align_up(va_start, page_size), page_size)
        };
        PageSpan {
            va,
            va_start,
            size,
            tier: if va_start < split { Tier::Fast } else { Tier::Slow },
        }
    }

    /// Create or recycle one record per page and register them.
    fn carve(&self, addr: u64, length: u64, split: u64) -> Vec<PageId> {
        let ctx = &self.ctx;
        let count = length.div_ceil(ctx.config().page_size);
        let mut pages = Vec::with_capacity(count as usize);
        let mut fresh = 0;

        for index in 0..count {
            let span = self.span_for(addr, length, index, split);
            let page = match ctx.free().dequeue() {
                Some(page) => {
                    {
                        let _guard = page.lock();
                        debug_assert!(page.is_free(), "recycled page {:?} not free", page.id());
                        page.reset(span);
                        self.enlist(&page);
                    }
                    page
                }
                None => {
                    fresh += 1;
                    let page = ctx.arena().create(span);
                    self.enlist(&page);
                    page
                }
            };
            pages.push(page.id());
            ctx.table().insert(page);
        }

        TierStats::add(
            &ctx.stats().internal_mem_overhead,
            PageArena::record_bytes(fresh),
        );
        pages
    }

    fn enlist(&self, page: &Page) {
        if page.tier() == Tier::Fast {
            self.ctx.cold().enqueue(page);
        }
    }

    /// Stop tracking every page covered by `[addr, addr + length)`. The
    /// underlying memory is left mapped. Returns the pages released.
    pub fn deallocate(&self, addr: u64, length: u64) -> usize {
        let ctx = &self.ctx;
        let page_size = ctx.config().page_size;
        let length = align_up(length, ctx.config().base_page_size);
        let mut released = 0;

        for index in 0..length.div_ceil(page_size) {
            let va_start = addr + index * page_size;
            let remaining = length - index * page_size;
            let va = if remaining < page_size {
                va_start
            } else {
                align_up(va_start, page_size)
            };
            let page = match ctx.table().lookup(va) {
                Some(page) => page,
                None => continue,
            };

            let _guard = page.lock();
            if page.is_free() {
                log::warn!("deallocate: page {:#x} already free", va);
                continue;
            }
            page.set_free(true);
            ctx.table().remove(&page);
            if let Some(kind) = page.list() {
                ctx.list(kind).remove(&page);
            }
            ctx.free().enqueue(&page);
            ctx.budget().release(page.tier(), page.size());
            TierStats::sub(&ctx.stats().mem_allocated, page.size());
            released += 1;
        }

        let range = ctx.va_range();
        log::debug!(
            "deallocate: {:#x}+{} released {} pages (tracked range {:#x}..{:#x})",
            addr,
            length,
            released,
            range.min,
            range.max
        );
        released
    }
}
