// src/budget.rs - Lock-free fast-tier budget accounting
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crossbeam::utils::CachePadded;

use crate::backend::NodeMemory;
use crate::config::FastCapacity;
use crate::page::Tier;

/// Byte accounting for both tiers plus the fast-allocation lock.
///
/// Counters are signed so a transient overshoot during promotion or a
/// refresh from node statistics never wraps.
#[derive(Debug)]
pub struct TierBudget {
    capacity: FastCapacity,
    fast_size: CachePadded<AtomicI64>,
    fast_used: CachePadded<AtomicI64>,
    fast_free: AtomicI64,
    slow_used: CachePadded<AtomicI64>,
    fast_locked: AtomicBool,
}

/// Point-in-time copy of the budget counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub fast_size: i64,
    pub fast_used: i64,
    pub fast_free: i64,
    pub slow_used: i64,
    pub fast_locked: bool,
}

impl TierBudget {
    pub fn new(capacity: FastCapacity) -> Self {
        let fast_size = match capacity {
            FastCapacity::Fixed(size) => size as i64,
            FastCapacity::Reserve(_) => 0,
        };
        Self {
            capacity,
            fast_size: CachePadded::new(AtomicI64::new(fast_size)),
            fast_used: CachePadded::new(AtomicI64::new(0)),
            fast_free: AtomicI64::new(fast_size),
            slow_used: CachePadded::new(AtomicI64::new(0)),
            fast_locked: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> FastCapacity {
        self.capacity
    }

    pub fn fast_size(&self) -> i64 {
        self.fast_size.load(Ordering::Acquire)
    }

    pub fn fast_used(&self) -> i64 {
        self.fast_used.load(Ordering::Acquire)
    }

    pub fn slow_used(&self) -> i64 {
        self.slow_used.load(Ordering::Acquire)
    }

    pub fn is_fast_locked(&self) -> bool {
        self.fast_locked.load(Ordering::Acquire)
    }

    /// Block new fast-tier placements until the next promotion.
    pub fn lock_fast(&self) {
        self.fast_locked.store(true, Ordering::Release);
    }

    pub fn unlock_fast(&self) {
        self.fast_locked.store(false, Ordering::Release);
    }

    /// Bytes the demoter tries to keep available on the fast node.
    pub fn buffer(&self) -> i64 {
        match self.capacity {
            FastCapacity::Fixed(_) => 0,
            FastCapacity::Reserve(buffer) => buffer as i64,
        }
    }

    /// Available fast bytes as the demoter sees them: node free memory in
    /// reserve mode, unused budget in fixed mode.
    pub fn headroom(&self) -> i64 {
        match self.capacity {
            FastCapacity::Fixed(_) => self.fast_size() - self.fast_used(),
            FastCapacity::Reserve(_) => self.fast_free.load(Ordering::Acquire),
        }
    }

    /// Record bytes placed on a tier.
    pub fn charge(&self, tier: Tier, bytes: u64) {
        match tier {
            Tier::Fast => self.fast_used.fetch_add(bytes as i64, Ordering::AcqRel),
            Tier::Slow => self.slow_used.fetch_add(bytes as i64, Ordering::AcqRel),
        };
    }

    /// Release bytes from a tier.
    pub fn release(&self, tier: Tier, bytes: u64) {
        match tier {
            Tier::Fast => self.fast_used.fetch_sub(bytes as i64, Ordering::AcqRel),
            Tier::Slow => self.slow_used.fetch_sub(bytes as i64, Ordering::AcqRel),
        };
    }

    /// Move accounting for a migrated page.
    pub fn transfer(&self, to: Tier, bytes: u64) {
        let from = match to {
            Tier::Fast => Tier::Slow,
            Tier::Slow => Tier::Fast,
        };
        self.charge(to, bytes);
        self.release(from, bytes);
    }

    /// Re-derive counters from node statistics in reserve mode. Fixed mode
    /// keeps its own accounting.
    pub fn refresh(&self, fast: NodeMemory, slow: NodeMemory) {
        if let FastCapacity::Reserve(buffer) = self.capacity {
            let fast_total = fast.total as i64;
            let fast_free = fast.free as i64;
            self.fast_free.store(fast_free, Ordering::Release);
            self.fast_used.store(fast_total - fast_free, Ordering::Release);
            self.fast_size.store(fast_total - buffer as i64, Ordering::Release);
            self.slow_used
                .store(slow.total as i64 - slow.free as i64, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            fast_size: self.fast_size(),
            fast_used: self.fast_used(),
            fast_free: self.fast_free.load(Ordering::Acquire),
            slow_used: self.slow_used(),
            fast_locked: self.is_fast_locked(),
        }
    }
}
