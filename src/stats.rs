// src/stats.rs - Shared counters and the periodic stats report
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::budget::BudgetSnapshot;
use crate::clock::AtomicF64;

/// Counters shared by every component. Windowed counters are zeroed after
/// each report; the rest are cumulative.
#[derive(Debug, Default)]
pub struct TierStats {
    // windowed
    pub throttles: AtomicU64,
    pub unthrottles: AtomicU64,
    pub fast_accesses: AtomicU64,
    pub slow_accesses: AtomicU64,
    pub promotions: AtomicU64,
    pub demotions: AtomicU64,
    pub counter_resets: AtomicU64,
    // cumulative
    pub unknown_samples: AtomicU64,
    pub wrapped_records: AtomicU64,
    pub wrapped_headers: AtomicU64,
    pub malformed_records: AtomicU64,
    pub samples_processed: AtomicU64,
    pub untracked_samples: AtomicU64,
    pub dropped_requests: AtomicU64,
    pub predictions: AtomicU64,
    pub migration_failures: AtomicU64,
    pub internal_mem_overhead: AtomicU64,
    pub mem_allocated: AtomicU64,
    pub non_tracked_mem: AtomicU64,
    // gauges
    pub mig_queue_time: AtomicF64,
    pub mig_move_time: AtomicF64,
    pub bot_dist: AtomicF64,
    pub avg_dist: AtomicF64,
}

/// Snapshot used for reporting and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub throttles: u64,
    pub unthrottles: u64,
    pub fast_accesses: u64,
    pub slow_accesses: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub counter_resets: u64,
    pub unknown_samples: u64,
    pub wrapped_records: u64,
    pub wrapped_headers: u64,
    pub malformed_records: u64,
    pub samples_processed: u64,
    pub untracked_samples: u64,
    pub dropped_requests: u64,
    pub predictions: u64,
    pub migration_failures: u64,
    pub internal_mem_overhead: u64,
    pub mem_allocated: u64,
    pub non_tracked_mem: u64,
    pub mig_queue_time: f64,
    pub mig_move_time: f64,
    pub bot_dist: f64,
    pub avg_dist: f64,
}

impl StatsSnapshot {
    /// Percentage of sampled loads served by the fast tier.
    pub fn percent_fast(&self) -> f64 {
        let total = self.fast_accesses + self.slow_accesses;
        if total == 0 {
            0.0
        } else {
            100.0 * self.fast_accesses as f64 / total as f64
        }
    }
}

impl TierStats {
    pub fn new() -> Self {
        let stats = Self::default();
        stats.bot_dist.store(1.0);
        stats.avg_dist.store(1.0);
        stats
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub(counter: &AtomicU64, n: u64) {
        counter.fetch_sub(n, Ordering::Relaxed);
    }

    /// Fraction (0..=1) of fast-tier accesses in the current window.
    pub fn fast_fraction(&self) -> f64 {
        let fast = self.fast_accesses.load(Ordering::Relaxed) as f64;
        let slow = self.slow_accesses.load(Ordering::Relaxed) as f64;
        fast / (fast + slow + 1.0)
    }

    /// Hardware signal throttled more often than released.
    pub fn is_throttled(&self) -> bool {
        self.throttles.load(Ordering::Relaxed) > self.unthrottles.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            throttles: load(&self.throttles),
            unthrottles: load(&self.unthrottles),
            fast_accesses: load(&self.fast_accesses),
            slow_accesses: load(&self.slow_accesses),
            promotions: load(&self.promotions),
            demotions: load(&self.demotions),
            counter_resets: load(&self.counter_resets),
            unknown_samples: load(&self.unknown_samples),
            wrapped_records: load(&self.wrapped_records),
            wrapped_headers: load(&self.wrapped_headers),
            malformed_records: load(&self.malformed_records),
            samples_processed: load(&self.samples_processed),
            untracked_samples: load(&self.untracked_samples),
            dropped_requests: load(&self.dropped_requests),
            predictions: load(&self.predictions),
            migration_failures: load(&self.migration_failures),
            internal_mem_overhead: load(&self.internal_mem_overhead),
            mem_allocated: load(&self.mem_allocated),
            non_tracked_mem: load(&self.non_tracked_mem),
            mig_queue_time: self.mig_queue_time.load(),
            mig_move_time: self.mig_move_time.load(),
            bot_dist: self.bot_dist.load(),
            avg_dist: self.avg_dist.load(),
        }
    }

    /// Zero the windowed counters, returning their values.
    pub fn take_window(&self) -> StatsSnapshot {
        let snapshot = self.snapshot();
        for counter in [
            &self.throttles,
            &self.unthrottles,
            &self.fast_accesses,
            &self.slow_accesses,
            &self.promotions,
            &self.demotions,
            &self.counter_resets,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        snapshot
    }
}

/// One stats interval, ready for the log sink.
#[derive(Debug, Clone, Copy)]
pub struct StatsReport {
    pub stats: StatsSnapshot,
    pub budget: BudgetSnapshot,
    pub cold_pages: usize,
    pub hot_pages: usize,
    pub free_pages: usize,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        let b = &self.budget;
        writeln!(
            f,
            "internal_mem_overhead: [{}]\ttracked_allocated: [{}]\tnon_tracked_mem: [{}]\tthrottles: [{}]\tunthrottles: [{}]\tunknown_samples: [{}]",
            s.internal_mem_overhead, s.mem_allocated, s.non_tracked_mem, s.throttles, s.unthrottles, s.unknown_samples
        )?;
        writeln!(
            f,
            "\twrapped_records: [{}]\twrapped_headers: [{}]\tmalformed_records: [{}]",
            s.wrapped_records, s.wrapped_headers, s.malformed_records
        )?;
        writeln!(
            f,
            "\tfast_free: [{}]\tfast_used: [{}]\tfast_size: [{}]\tslow_used: [{}]\tfast_locked: [{}]",
            b.fast_free, b.fast_used, b.fast_size, b.slow_used, b.fast_locked
        )?;
        writeln!(
            f,
            "\tfast_accesses: [{}]\tslow_accesses: [{}]\tpercent_fast: [{:.2}]",
            s.fast_accesses,
            s.slow_accesses,
            s.percent_fast()
        )?;
        writeln!(
            f,
            "\tpromotions: [{}]\tdemotions: [{}]\tmigrations: [{}]\tcounter_resets: [{}]\tmig_move_time: [{:.2}]\tmig_queue_time: [{:.2}]",
            s.promotions,
            s.demotions,
            s.promotions + s.demotions,
            s.counter_resets,
            s.mig_move_time,
            s.mig_queue_time
        )?;
        writeln!(
            f,
            "\tthreshold: [{:.2}]\tavg_dist: [{:.2}]\tdiff: [{:.2}]",
            s.bot_dist,
            s.avg_dist,
            s.avg_dist - s.bot_dist
        )?;
        write!(
            f,
            "\tcold_pages: [{}]\thot_pages: [{}]\tfree_pages: [{}]",
            self.cold_pages, self.hot_pages, self.free_pages
        )
    }
}
