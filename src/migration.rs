// src/migration.rs - Promotion and demotion control loops
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::backend::BindPolicy;
use crate::clock::now_ns;
use crate::config::FastCapacity;
use crate::error::Result;
use crate::page::{Page, Tier};
use crate::runtime::CancellationToken;
use crate::stats::TierStats;
use crate::trace::{TraceRecord, TraceStream};
use crate::TierContext;

/// What happened to one dequeued hot page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    Promoted,
    /// Already fast or re-linked elsewhere since it was queued.
    Stale,
    Failed,
}

/// Result of one demotion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemoteReport {
    pub demoted_pages: usize,
    pub demoted_bytes: u64,
    pub skipped: usize,
    pub failed: usize,
    /// The cold list ran dry before headroom was restored.
    pub exhausted: bool,
}

/// Moves pages between tiers to keep the fast budget honored.
#[derive(Debug, Clone)]
pub struct Scheduler {
    ctx: Arc<TierContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<TierContext>) -> Self {
        Self { ctx }
    }

    /// Rebind one page to `to`. The caller holds the page lock. On failure
    /// the page is left as it was.
    pub fn migrate_page(&self, page: &Page, to: Tier) -> Result<()> {
        let ctx = &self.ctx;
        page.set_migrating(true);
        let bound = ctx
            .backend()
            .bind(page.va_start(), page.size(), to, BindPolicy::Bind);
        page.set_migrating(false);

        if let Err(e) = bound {
            log::warn!("migration: {:#x} to {:?} failed: {}", page.va_start(), to, e);
            TierStats::bump(&ctx.stats().migration_failures);
            return Err(e);
        }

        page.set_tier(to);
        page.set_migrated(true);
        ctx.budget().transfer(to, page.size());
        match to {
            Tier::Fast => {
                TierStats::bump(&ctx.stats().promotions);
                ctx.policy().after_promotion(ctx, page);
                ctx.trace()
                    .record(TraceStream::Promotions, TraceRecord::now(page.va()));
            }
            Tier::Slow => {
                TierStats::bump(&ctx.stats().demotions);
                page.set_hot(false);
                ctx.trace()
                    .record(TraceStream::Demotions, TraceRecord::now(page.va()));
            }
        }
        Ok(())
    }

    /// Promote the oldest hot page, if any.
    pub fn promote_once(&self) -> Option<PromoteOutcome> {
        let ctx = &self.ctx;
        let page = ctx.hot().dequeue()?;
        let _guard = page.lock();
        if page.list().is_some() || page.tier() == Tier::Fast || page.is_free() {
            return Some(PromoteOutcome::Stale);
        }

        let rate = ctx.config().latency_rate;
        let started = now_ns();
        ctx.stats()
            .mig_queue_time
            .decay_toward(started.saturating_sub(page.mig_start()) as f64, rate);

        let outcome = match self.migrate_page(&page, Tier::Fast) {
            Ok(()) => {
                ctx.budget().unlock_fast();
                PromoteOutcome::Promoted
            }
            Err(_) => PromoteOutcome::Failed,
        };
        ctx.stats()
            .mig_move_time
            .decay_toward(now_ns().saturating_sub(started) as f64, rate);
        Some(outcome)
    }

    /// Re-read node memory in reserve mode.
    fn refresh_budget(&self) {
        let ctx = &self.ctx;
        if let FastCapacity::Fixed(_) = ctx.budget().capacity() {
            return;
        }
        let fast = ctx.backend().node_memory(Tier::Fast);
        let slow = ctx.backend().node_memory(Tier::Slow);
        match (fast, slow) {
            (Ok(fast), Ok(slow)) => ctx.budget().refresh(fast, slow),
            (Err(e), _) | (_, Err(e)) => log::warn!("demote: budget refresh failed: {}", e),
        }
    }

    /// One demotion pass: evict cold pages until fast headroom reaches the
    /// buffer again.
    pub fn demote_once(&self) -> DemoteReport {
        let ctx = &self.ctx;
        let budget = ctx.budget();
        let mut report = DemoteReport::default();

        self.refresh_budget();
        let buffer = budget.buffer();
        let headroom = budget.headroom();
        if headroom >= buffer {
            return report;
        }
        budget.lock_fast();

        while headroom + (report.demoted_bytes as i64) < buffer {
            let page = match ctx.cold().dequeue() {
                Some(page) => page,
                None => {
                    log::debug!(
                        "demote: cold list empty, {} bytes short",
                        buffer - headroom - report.demoted_bytes as i64
                    );
                    report.exhausted = true;
                    break;
                }
            };
            let _guard = page.lock();
            if page.is_free() || ctx.policy().is_reclaimed(&page) {
                report.skipped += 1;
                continue;
            }
            match self.migrate_page(&page, Tier::Slow) {
                Ok(()) => {
                    report.demoted_pages += 1;
                    report.demoted_bytes += page.size();
                }
                Err(_) => report.failed += 1,
            }
        }

        if !report.exhausted {
            budget.unlock_fast();
        }
        if report.demoted_pages > 0 {
            log::debug!(
                "demote: {} pages ({} bytes), skipped {}, failed {}",
                report.demoted_pages,
                report.demoted_bytes,
                report.skipped,
                report.failed
            );
        }
        report
    }

    /// Busy-poll the hot list until cancelled.
    pub fn run_promoter(&self, token: &CancellationToken) {
        let backoff = Backoff::new();
        while !token.is_cancelled() {
            match self.promote_once() {
                Some(_) => backoff.reset(),
                None if backoff.is_completed() => {
                    token.wait_timeout(std::time::Duration::from_micros(100));
                }
                None => backoff.snooze(),
            }
        }
        log::debug!("promoter stopped");
    }

    /// Run a demotion pass every `demote_interval` until cancelled.
    pub fn run_demoter(&self, token: &CancellationToken) {
        let interval = self.ctx.config().demote_interval;
        while !token.is_cancelled() {
            self.demote_once();
            if token.wait_timeout(interval) {
                break;
            }
        }
        log::debug!("demoter stopped");
    }
}
