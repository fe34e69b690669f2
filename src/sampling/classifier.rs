// src/sampling/classifier.rs - Turns raw access samples into hot/cold decisions
use std::sync::Arc;

use crate::clock::now_ns;
use crate::page::{ListKind, Page, Tier};
use crate::predictor::{self, NeighborPredictor};
use crate::sampling::ring::{EventKind, RingRecord, SampleRecord, SampleRing};
use crate::stats::TierStats;
use crate::trace::{TraceRecord, TraceStream};
use crate::TierContext;

/// Outcome of one processed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Hot,
    Cold,
}

#[derive(Debug)]
struct RingCursor {
    ring: Arc<SampleRing>,
    /// Last time a tracked sample arrived, for the staleness watchdog.
    last_sample: u64,
}

/// Single-threaded consumer of every sample ring.
#[derive(Debug)]
pub struct Classifier {
    ctx: Arc<TierContext>,
    rings: Vec<RingCursor>,
    predictor: Option<NeighborPredictor>,
    global_clock: u64,
    since_cooling: u64,
}

impl Classifier {
    pub fn new(ctx: Arc<TierContext>) -> Self {
        let config = ctx.config();
        let predictor = predictor::strategy_for(config.prediction, &config.predictor)
            .map(|strategy| NeighborPredictor::new(config.predictor.clone(), strategy));
        Self {
            ctx,
            rings: Vec::new(),
            predictor,
            global_clock: 0,
            since_cooling: 0,
        }
    }

    pub fn attach(&mut self, ring: Arc<SampleRing>) {
        log::debug!(
            "classifier: attached ring cpu {} event {:?}",
            ring.cpu(),
            ring.event()
        );
        self.rings.push(RingCursor {
            ring,
            last_sample: now_ns(),
        });
    }

    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    /// Cooling epoch; advances every `sample_cooling_threshold` samples.
    pub fn global_clock(&self) -> u64 {
        self.global_clock
    }

    pub fn predictor(&self) -> Option<&NeighborPredictor> {
        self.predictor.as_ref()
    }

    /// Drain every ring once. Returns the tracked samples processed.
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;
        for index in 0..self.rings.len() {
            processed += self.drain(index);
        }
        processed
    }

    /// Consume up to `batch_cap` records from one ring. Anything left stays
    /// for the next poll.
    fn drain(&mut self, index: usize) -> usize {
        let ring = Arc::clone(&self.rings[index].ring);
        let ctx = Arc::clone(&self.ctx);
        let stats = ctx.stats();
        let mut processed = 0;

        for _ in 0..ctx.config().batch_cap {
            let record = match ring.next_record() {
                Some(record) => record,
                None => break,
            };
            match record {
                RingRecord::Sample(sample) => {
                    if sample.addr == 0 {
                        continue;
                    }
                    if self.process(&sample, ring.event(), ring.cpu()).is_some() {
                        processed += 1;
                        self.rings[index].last_sample = now_ns();
                    }
                }
                RingRecord::Throttle => TierStats::bump(&stats.throttles),
                RingRecord::Unthrottle => TierStats::bump(&stats.unthrottles),
                RingRecord::Unknown(kind) => {
                    log::trace!("classifier: unknown record type {}", kind);
                    TierStats::bump(&stats.unknown_samples);
                }
                RingRecord::Malformed => TierStats::bump(&stats.malformed_records),
                RingRecord::Wrapped => TierStats::bump(&stats.wrapped_records),
                RingRecord::WrappedHeader => TierStats::bump(&stats.wrapped_headers),
            }
        }

        self.check_stale(index);
        processed
    }

    fn check_stale(&mut self, index: usize) {
        let stale_after = self.ctx.config().stale_reset.as_nanos() as u64;
        let now = now_ns();
        let cursor = &mut self.rings[index];
        if now.saturating_sub(cursor.last_sample) <= stale_after {
            return;
        }
        TierStats::bump(&self.ctx.stats().counter_resets);
        if let Err(e) = cursor.ring.reset_counter() {
            log::warn!(
                "classifier: failed to reset counter on cpu {}: {}",
                cursor.ring.cpu(),
                e
            );
        }
        cursor.last_sample = now;
    }

    /// Classify one sample. Returns `None` when the address is not tracked
    /// (or the table was busy).
    pub fn process(
        &mut self,
        sample: &SampleRecord,
        event: EventKind,
        cpu: u32,
    ) -> Option<Classification> {
        let ctx = Arc::clone(&self.ctx);
        let stats = ctx.stats();
        let page = match ctx.table().resolve(sample.addr, true) {
            Some(page) => page,
            None => {
                TierStats::bump(&stats.untracked_samples);
                return None;
            }
        };

        ctx.trace().record(
            TraceStream::Samples,
            TraceRecord {
                cyc: sample.time,
                va: page.va(),
                ip: sample.ip,
                cpu,
                evt: event_code(event),
            },
        );

        let accesses = page.record_access(self.global_clock, sample.time, sample.ip);
        match event {
            EventKind::FastRead => TierStats::bump(&stats.fast_accesses),
            EventKind::SlowRead => TierStats::bump(&stats.slow_accesses),
        }
        TierStats::bump(&stats.samples_processed);

        let class = if accesses >= ctx.config().hot_threshold {
            self.hot_request(&page);
            Classification::Hot
        } else {
            self.cold_request(&page);
            Classification::Cold
        };

        self.since_cooling += 1;
        if self.since_cooling >= ctx.config().sample_cooling_threshold {
            self.global_clock += 1;
            self.since_cooling = 0;
        }

        self.predict_from(&page);
        Some(class)
    }

    fn predict_from(&mut self, page: &Arc<Page>) {
        let ctx = Arc::clone(&self.ctx);
        let stats = ctx.stats();
        let predictor = match self.predictor.as_mut() {
            Some(predictor) => predictor,
            None => return,
        };
        if ctx.cold().is_empty() {
            return;
        }

        predictor.observe(page, stats.fast_fraction());
        stats.bot_dist.store(predictor.floor());
        stats.avg_dist.store(predictor.mean());

        if stats.is_throttled() {
            return;
        }
        if ctx.hot().is_empty() {
            stats.mig_queue_time.store(0.0);
        }
        let due_after = stats.mig_queue_time.load() + stats.mig_move_time.load();
        let predicted = predictor.predict(ctx.arena(), page, due_after);

        for id in predicted {
            let target = match ctx.arena().get(id) {
                Some(target) => target,
                None => continue,
            };
            TierStats::bump(&stats.predictions);
            ctx.trace().record(TraceStream::Predictions, TraceRecord::now(target.va()));
            self.hot_request(&target);
        }
    }

    /// Mark a page hot. Slow-tier pages are queued for promotion. Dropped
    /// when the page lock is contended.
    pub fn hot_request(&self, page: &Page) -> bool {
        let ctx = &self.ctx;
        let _guard = match page.try_lock() {
            Some(guard) => guard,
            None => {
                TierStats::bump(&ctx.stats().dropped_requests);
                return false;
            }
        };
        if page.is_free() {
            return false;
        }
        page.set_hot(true);
        match page.tier() {
            Tier::Slow if page.list() != Some(ListKind::Hot) => {
                if let Some(kind) = page.list() {
                    ctx.list(kind).remove(page);
                }
                page.set_mig_start(now_ns());
                ctx.hot().enqueue(page);
            }
            Tier::Fast => ctx.policy().on_hot_in_fast(ctx, page),
            Tier::Slow => {}
        }
        true
    }

    /// Mark a page cold and let the cold list discipline place it.
    pub fn cold_request(&self, page: &Page) -> bool {
        let ctx = &self.ctx;
        let _guard = match page.try_lock() {
            Some(guard) => guard,
            None => {
                TierStats::bump(&ctx.stats().dropped_requests);
                return false;
            }
        };
        if page.is_free() {
            return false;
        }
        page.set_hot(false);
        ctx.policy().on_cold(ctx, page);
        true
    }
}

fn event_code(event: EventKind) -> u8 {
    match event {
        EventKind::FastRead => 0,
        EventKind::SlowRead => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::TierAllocator;
    use crate::backend::{MapRequest, SimulatedBackend};
    use crate::config::{ColdListDiscipline, FastCapacity, PredictionMode, TierConfig};
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;
    const PAGE: u64 = 2 * MB;

    fn setup(config: TierConfig) -> (Classifier, TierAllocator) {
        let backend = Arc::new(SimulatedBackend::new(64 * MB, 256 * MB, PAGE));
        let ctx = Arc::new(TierContext::new(config, backend).unwrap());
        (Classifier::new(ctx.clone()), TierAllocator::new(ctx))
    }

    fn fixed(fast: u64) -> TierConfig {
        TierConfig {
            fast_capacity: FastCapacity::Fixed(fast),
            prediction: PredictionMode::Disabled,
            ..TierConfig::default()
        }
    }

    fn sample(addr: u64, time: u64) -> SampleRecord {
        SampleRecord {
            ip: 0x40_1000,
            time,
            addr,
        }
    }

    #[test]
    fn test_slow_page_turns_hot_on_threshold() {
        let (mut classifier, alloc) = setup(fixed(0));
        let region = alloc.allocate(&MapRequest::anonymous(PAGE)).unwrap();
        let ctx = alloc.context().clone();
        let page = ctx.arena().get(region.pages[0]).unwrap();
        assert_eq!(page.tier(), Tier::Slow);

        for t in 1..=7 {
            let class = classifier.process(&sample(region.addr + 64, t), EventKind::SlowRead, 0);
            assert_eq!(class, Some(Classification::Cold));
        }
        assert!(!page.is_hot());
        assert_eq!(page.list(), None);

        let class = classifier.process(&sample(region.addr + 64, 8), EventKind::SlowRead, 0);
        assert_eq!(class, Some(Classification::Hot));
        assert!(page.is_hot());
        assert_eq!(page.list(), Some(ListKind::Hot));
        assert_eq!(ctx.stats().snapshot().slow_accesses, 8);
    }

    #[test]
    fn test_fast_page_stays_in_cold_list() {
        let (mut classifier, alloc) = setup(fixed(16 * MB));
        let region = alloc.allocate(&MapRequest::anonymous(PAGE)).unwrap();
        let ctx = alloc.context().clone();
        let page = ctx.arena().get(region.pages[0]).unwrap();
        for t in 1..=10 {
            classifier.process(&sample(region.addr, t), EventKind::FastRead, 0);
        }
        assert!(page.is_hot());
        assert_eq!(page.list(), Some(ListKind::Cold));
        assert!(ctx.hot().is_empty());
    }

    #[test]
    fn test_untracked_samples_are_counted() {
        let (mut classifier, alloc) = setup(fixed(16 * MB));
        assert_eq!(classifier.process(&sample(0xdead_0000, 1), EventKind::FastRead, 0), None);
        assert_eq!(alloc.context().stats().snapshot().untracked_samples, 1);
    }

    #[test]
    fn test_cooling_epoch_advances() {
        let config = TierConfig {
            sample_cooling_threshold: 4,
            ..fixed(0)
        };
        let (mut classifier, alloc) = setup(config);
        let region = alloc.allocate(&MapRequest::anonymous(PAGE)).unwrap();
        let page = alloc.context().arena().get(region.pages[0]).unwrap();
        for t in 1..=7 {
            classifier.process(&sample(region.addr, t), EventKind::SlowRead, 0);
        }
        assert_eq!(classifier.global_clock(), 1);
        // Samples 1..=4 accumulate to 4; the 5th sample halves it first.
        assert_eq!(page.accesses(), (4 >> 1) + 3);
        assert!(!page.is_hot());
    }

    #[test]
    fn test_lru_touch_moves_to_recent_end() {
        let config = TierConfig {
            cold_list: ColdListDiscipline::Lru,
            ..fixed(16 * MB)
        };
        let (mut classifier, alloc) = setup(config);
        let region = alloc.allocate(&MapRequest::anonymous(3 * PAGE)).unwrap();
        let ctx = alloc.context().clone();
        assert_eq!(ctx.cold().ids(), region.pages);

        classifier.process(&sample(region.addr, 1), EventKind::FastRead, 0);
        let ids = ctx.cold().ids();
        assert_eq!(ids.last(), Some(&region.pages[0]));
        assert_eq!(ids[0], region.pages[1]);
    }

    #[test]
    fn test_drain_counts_control_records() {
        let (mut classifier, alloc) = setup(fixed(0));
        let region = alloc.allocate(&MapRequest::anonymous(PAGE)).unwrap();
        let ring = Arc::new(SampleRing::new(2, EventKind::SlowRead, 4096).unwrap());
        ring.push_record(crate::sampling::ring::RECORD_THROTTLE, &[]);
        ring.push_record(42, &[0u8; 8]);
        ring.push_sample(sample(region.addr, 5));
        ring.push_sample(sample(0, 6));
        classifier.attach(ring.clone());

        assert_eq!(classifier.poll(), 1);
        assert!(ring.is_empty());
        let stats = alloc.context().stats().snapshot();
        assert_eq!(stats.throttles, 1);
        assert_eq!(stats.unknown_samples, 1);
        assert_eq!(stats.samples_processed, 1);
    }

    #[test]
    fn test_batch_cap_leaves_remainder() {
        let config = TierConfig {
            batch_cap: 2,
            ..fixed(0)
        };
        let (mut classifier, alloc) = setup(config);
        let region = alloc.allocate(&MapRequest::anonymous(PAGE)).unwrap();
        let ring = Arc::new(SampleRing::new(0, EventKind::SlowRead, 4096).unwrap());
        for t in 0..5 {
            ring.push_sample(sample(region.addr, t + 1));
        }
        classifier.attach(ring.clone());
        assert_eq!(classifier.poll(), 2);
        assert_eq!(classifier.poll(), 2);
        assert_eq!(classifier.poll(), 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_stale_ring_is_reset() {
        let config = TierConfig {
            stale_reset: Duration::from_millis(1),
            ..fixed(0)
        };
        let (mut classifier, alloc) = setup(config);
        let ring = Arc::new(SampleRing::new(0, EventKind::FastRead, 4096).unwrap());
        classifier.attach(ring);
        std::thread::sleep(Duration::from_millis(5));
        classifier.poll();
        assert_eq!(alloc.context().stats().snapshot().counter_resets, 1);
    }

    #[test]
    fn test_free_pages_ignore_requests() {
        let (classifier, alloc) = setup(fixed(0));
        let region = alloc.allocate(&MapRequest::anonymous(PAGE)).unwrap();
        let page = alloc.context().arena().get(region.pages[0]).unwrap();
        alloc.deallocate(region.addr, region.length);
        assert!(!classifier.hot_request(&page));
        assert_eq!(page.list(), Some(ListKind::Free));

        let _held = page.lock();
        assert!(!classifier.cold_request(&page));
        assert_eq!(alloc.context().stats().snapshot().dropped_requests, 1);
    }

    #[test]
    fn test_prediction_feeds_hot_requests() {
        let config = TierConfig {
            fast_capacity: FastCapacity::Fixed(PAGE),
            prediction: PredictionMode::Flat,
            ..TierConfig::default()
        };
        let (mut classifier, alloc) = setup(config);
        let ctx = alloc.context().clone();
        // One fast page keeps the cold list non-empty; the rest are slow.
        let region = alloc.allocate(&MapRequest::anonymous(4 * PAGE)).unwrap();
        let origin = ctx.arena().get(region.pages[1]).unwrap();
        let target = ctx.arena().get(region.pages[2]).unwrap();
        origin.neighbors().offer(crate::page::Neighbor {
            page: target.id(),
            distance: 0.0,
            time_diff: 1_000,
        });

        classifier.process(&sample(origin.va_start(), 1), EventKind::SlowRead, 0);
        assert!(target.is_hot());
        assert_eq!(target.list(), Some(ListKind::Hot));
        assert_eq!(ctx.stats().snapshot().predictions, 1);
    }
}
