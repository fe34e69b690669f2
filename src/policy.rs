// src/policy.rs - Cold list disciplines (FIFO and LRU)
use std::fmt;

use crate::config::ColdListDiscipline;
use crate::page::{ListKind, Page, Tier};
use crate::TierContext;

/// How fast-tier pages are ordered in the cold list. Callers hold the page
/// lock for every method.
pub trait ColdListPolicy: Send + Sync + fmt::Debug {
    fn discipline(&self) -> ColdListDiscipline;

    /// A cold-classified sample hit this page.
    fn on_cold(&self, ctx: &TierContext, page: &Page);

    /// A hot-classified sample hit a page already in the fast tier.
    fn on_hot_in_fast(&self, ctx: &TierContext, page: &Page);

    /// Queue a page that was just promoted.
    fn after_promotion(&self, ctx: &TierContext, page: &Page);

    /// Whether a page dequeued for demotion was re-claimed meanwhile.
    fn is_reclaimed(&self, page: &Page) -> bool;
}

/// Resolve the configured discipline once at startup.
pub fn for_discipline(discipline: ColdListDiscipline) -> Box<dyn ColdListPolicy> {
    match discipline {
        ColdListDiscipline::Fifo => Box::new(FifoColdList),
        ColdListDiscipline::Lru => Box::new(LruColdList),
    }
}

fn relink(ctx: &TierContext, page: &Page, to: ListKind) {
    if let Some(current) = page.list() {
        ctx.list(current).remove(page);
    }
    ctx.list(to).enqueue(page);
}

/// Pages join the cold list once and leave in insertion order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoColdList;

impl ColdListPolicy for FifoColdList {
    fn discipline(&self) -> ColdListDiscipline {
        ColdListDiscipline::Fifo
    }

    fn on_cold(&self, ctx: &TierContext, page: &Page) {
        if page.tier() == Tier::Fast && page.list() != Some(ListKind::Cold) {
            relink(ctx, page, ListKind::Cold);
        }
    }

    fn on_hot_in_fast(&self, _ctx: &TierContext, _page: &Page) {}

    fn after_promotion(&self, ctx: &TierContext, page: &Page) {
        page.set_hot(true);
        ctx.list(ListKind::Hot).enqueue(page);
    }

    fn is_reclaimed(&self, page: &Page) -> bool {
        page.list().is_some() || page.tier() == Tier::Slow || page.is_hot()
    }
}

/// Every fast-tier page lives in the cold list; each access moves it to the
/// most-recent end so the demoter evicts least-recently-sampled pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruColdList;

impl ColdListPolicy for LruColdList {
    fn discipline(&self) -> ColdListDiscipline {
        ColdListDiscipline::Lru
    }

    fn on_cold(&self, ctx: &TierContext, page: &Page) {
        if page.tier() == Tier::Fast {
            relink(ctx, page, ListKind::Cold);
        }
    }

    fn on_hot_in_fast(&self, ctx: &TierContext, page: &Page) {
        relink(ctx, page, ListKind::Cold);
    }

    fn after_promotion(&self, ctx: &TierContext, page: &Page) {
        page.set_hot(false);
        ctx.list(ListKind::Cold).enqueue(page);
    }

    fn is_reclaimed(&self, page: &Page) -> bool {
        page.list().is_some()
    }
}
