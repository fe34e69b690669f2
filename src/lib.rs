pub mod allocator;
pub mod backend;
pub mod budget;
pub mod clock;
pub mod config;
pub mod error;
pub mod ffi;
pub mod intercept;
pub mod list;
pub mod migration;
pub mod page;
pub mod policy;
pub mod predictor;
pub mod runtime;
pub mod sampling;
pub mod stats;
pub mod table;
pub mod trace;

use std::sync::Arc;

use parking_lot::Mutex;

pub use allocator::{Region, TierAllocator};
pub use backend::{BindPolicy, MapRequest, MemoryBackend, NodeMemory, NumaBackend, SimulatedBackend};
pub use budget::{BudgetSnapshot, TierBudget};
pub use config::{ColdListDiscipline, FastCapacity, PredictionMode, PredictorConfig, TierConfig};
pub use error::{Result, TierError};
pub use list::PageList;
pub use migration::Scheduler;
pub use page::{ListKind, Page, PageArena, PageId, Tier};
pub use policy::ColdListPolicy;
pub use predictor::NeighborPredictor;
pub use runtime::{CancellationToken, Runtime};
pub use sampling::{Classifier, EventKind, SampleRecord, SampleRing};
pub use stats::{StatsReport, StatsSnapshot, TierStats};
pub use table::PageTable;
pub use trace::{TraceRecord, TraceRecorder, TraceStream};

/// Lowest and highest tracked addresses seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    pub min: u64,
    pub max: u64,
}

impl Default for VaRange {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
        }
    }
}

/// Process-wide tiering state shared by the allocator, the classifier and
/// the migration loops.
#[derive(Debug)]
pub struct TierContext {
    config: TierConfig,
    backend: Arc<dyn MemoryBackend>,
    arena: Arc<PageArena>,
    table: PageTable,
    cold: PageList,
    hot: PageList,
    free: PageList,
    budget: TierBudget,
    stats: TierStats,
    trace: TraceRecorder,
    policy: Box<dyn ColdListPolicy>,
    placement: Mutex<VaRange>,
}

impl TierContext {
    pub fn new(config: TierConfig, backend: Arc<dyn MemoryBackend>) -> Result<Self> {
        config.validate()?;
        let arena = Arc::new(PageArena::new());
        let budget = TierBudget::new(config.fast_capacity);
        if let FastCapacity::Reserve(_) = config.fast_capacity {
            budget.refresh(
                backend.node_memory(Tier::Fast)?,
                backend.node_memory(Tier::Slow)?,
            );
        }
        let trace = match &config.trace_dir {
            Some(dir) => TraceRecorder::create(dir)?,
            None => TraceRecorder::disabled(),
        };
        log::info!(
            "tiermem context: page size {} fast node {} slow node {} capacity {:?} cold list {:?} prediction {:?}",
            config.page_size,
            config.fast_node,
            config.slow_node,
            config.fast_capacity,
            config.cold_list,
            config.prediction
        );
        Ok(Self {
            table: PageTable::new(config.page_size, config.base_page_size),
            cold: PageList::new(ListKind::Cold, Arc::clone(&arena)),
            hot: PageList::new(ListKind::Hot, Arc::clone(&arena)),
            free: PageList::new(ListKind::Free, Arc::clone(&arena)),
            policy: policy::for_discipline(config.cold_list),
            arena,
            budget,
            stats: TierStats::new(),
            trace,
            backend,
            config,
            placement: Mutex::new(VaRange::default()),
        })
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn MemoryBackend {
        self.backend.as_ref()
    }

    pub fn arena(&self) -> &PageArena {
        &self.arena
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn list(&self, kind: ListKind) -> &PageList {
        match kind {
            ListKind::Cold => &self.cold,
            ListKind::Hot => &self.hot,
            ListKind::Free => &self.free,
        }
    }

    pub fn cold(&self) -> &PageList {
        &self.cold
    }

    pub fn hot(&self) -> &PageList {
        &self.hot
    }

    pub fn free(&self) -> &PageList {
        &self.free
    }

    pub fn budget(&self) -> &TierBudget {
        &self.budget
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn trace(&self) -> &TraceRecorder {
        &self.trace
    }

    pub fn policy(&self) -> &dyn ColdListPolicy {
        self.policy.as_ref()
    }

    pub fn va_range(&self) -> VaRange {
        *self.placement.lock()
    }

    /// Serializes placement decisions and widens the tracked VA range.
    pub(crate) fn placement_lock(&self) -> parking_lot::MutexGuard<'_, VaRange> {
        self.placement.lock()
    }

    /// Collect one reporting interval, zeroing the windowed counters.
    pub fn take_report(&self) -> StatsReport {
        StatsReport {
            stats: self.stats.take_window(),
            budget: self.budget.snapshot(),
            cold_pages: self.cold.len(),
            hot_pages: self.hot.len(),
            free_pages: self.free.len(),
        }
    }
}
