// tests/integration_tests.rs - End-to-end tiering scenarios on the simulated backend
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tiermem::allocator::Placement;
use tiermem::config::BASE_PAGE_SIZE;
use tiermem::migration::PromoteOutcome;
use tiermem::sampling::Classification;
use tiermem::*;

const MB: u64 = 1024 * 1024;
const PAGE: u64 = 2 * MB;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

struct System {
    backend: Arc<SimulatedBackend>,
    ctx: Arc<TierContext>,
    alloc: TierAllocator,
    classifier: Classifier,
    scheduler: Scheduler,
}

fn system(config: TierConfig) -> std::result::Result<System, TierError> {
    let alignment = config.page_size;
    system_aligned(config, alignment)
}

/// Like [`system`], but the backend hands out addresses aligned only to
/// `alignment`.
fn system_aligned(config: TierConfig, alignment: u64) -> std::result::Result<System, TierError> {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(SimulatedBackend::new(256 * MB, 1024 * MB, alignment));
    let ctx = Arc::new(TierContext::new(config, backend.clone())?);
    Ok(System {
        backend,
        alloc: TierAllocator::new(ctx.clone()),
        classifier: Classifier::new(ctx.clone()),
        scheduler: Scheduler::new(ctx.clone()),
        ctx,
    })
}

fn fixed(fast: u64) -> TierConfig {
    TierConfig {
        fast_capacity: FastCapacity::Fixed(fast),
        prediction: PredictionMode::Disabled,
        ..TierConfig::default()
    }
}

fn tracked_bytes(ctx: &TierContext, pages: &[PageId]) -> u64 {
    pages
        .iter()
        .filter_map(|id| ctx.arena().get(*id))
        .filter(|p| !p.is_free())
        .map(|p| p.size())
        .sum()
}

/// Every record is linked into at most one list and the tag matches.
fn assert_list_exclusive(ctx: &TierContext) {
    let mut seen = HashSet::new();
    for kind in [ListKind::Cold, ListKind::Hot, ListKind::Free] {
        for id in ctx.list(kind).ids() {
            assert!(seen.insert(id), "page {:?} linked twice", id);
            let page = ctx.arena().get(id).expect("known page");
            assert_eq!(page.list(), Some(kind));
        }
    }
}

#[test]
fn test_split_placement_scenario() -> TestResult {
    let sys = system(fixed(2 * PAGE))?;
    let region = sys.alloc.allocate(&MapRequest::anonymous(4 * PAGE))?;
    assert_eq!(region.placement(), Placement::Split);

    let tiers: Vec<Tier> = region
        .pages
        .iter()
        .map(|id| sys.ctx.arena().get(*id).map(|p| p.tier()))
        .collect::<Option<_>>()
        .ok_or("missing page")?;
    assert_eq!(tiers, vec![Tier::Fast, Tier::Fast, Tier::Slow, Tier::Slow]);
    assert_eq!(sys.ctx.cold().ids(), region.pages[..2].to_vec());
    assert!(sys.ctx.hot().is_empty());
    assert_eq!(sys.ctx.budget().fast_used(), (2 * PAGE) as i64);
    assert_eq!(sys.backend.bound_bytes(Tier::Fast), 2 * PAGE);
    assert_eq!(sys.backend.bound_bytes(Tier::Slow), 2 * PAGE);
    assert_eq!(sys.backend.bind_calls(), 2);
    Ok(())
}

#[test]
fn test_hot_threshold_scenario() -> TestResult {
    let config = TierConfig {
        fast_capacity: FastCapacity::Fixed(PAGE),
        ..fixed(0)
    };
    let mut sys = system(config)?;
    let region = sys.alloc.allocate(&MapRequest::anonymous(2 * PAGE))?;
    let fast = sys.ctx.arena().get(region.pages[0]).ok_or("fast page")?;
    let slow = sys.ctx.arena().get(region.pages[1]).ok_or("slow page")?;
    assert_eq!(slow.tier(), Tier::Slow);

    let ring = Arc::new(SampleRing::new(0, EventKind::SlowRead, 8192)?);
    sys.classifier.attach(ring.clone());
    for t in 1..=7 {
        ring.push_sample(SampleRecord {
            ip: 0x40_0000,
            time: t,
            addr: slow.va_start() + 4096,
        });
    }
    assert_eq!(sys.classifier.poll(), 7);
    assert!(!slow.is_hot());
    assert_eq!(slow.list(), None);

    ring.push_sample(SampleRecord {
        ip: 0x40_0000,
        time: 8,
        addr: slow.va_start() + 4096,
    });
    sys.classifier.poll();
    assert!(slow.is_hot());
    assert_eq!(slow.list(), Some(ListKind::Hot));

    for t in 1..=8 {
        let sample = SampleRecord {
            ip: 0x40_0000,
            time: t,
            addr: fast.va_start(),
        };
        sys.classifier.process(&sample, EventKind::FastRead, 1);
    }
    assert!(fast.is_hot());
    assert_eq!(fast.list(), Some(ListKind::Cold));
    assert_list_exclusive(&sys.ctx);
    Ok(())
}

#[test]
fn test_demotion_scenario() -> TestResult {
    let sys = system(fixed(3 * PAGE))?;
    let resident = sys.alloc.allocate(&MapRequest::anonymous(3 * PAGE))?;
    let extra = sys.alloc.allocate(&MapRequest::anonymous(PAGE))?;
    assert_eq!(extra.placement(), Placement::Slow);

    let newcomer = sys.ctx.arena().get(extra.pages[0]).ok_or("page")?;
    assert!(sys.classifier.hot_request(&newcomer));
    assert_eq!(sys.scheduler.promote_once(), Some(PromoteOutcome::Promoted));

    let report = sys.scheduler.demote_once();
    assert_eq!(report.demoted_pages, 1);
    assert_eq!(sys.ctx.stats().snapshot().demotions, 1);

    let evicted = sys.ctx.arena().get(resident.pages[0]).ok_or("page")?;
    assert_eq!(evicted.tier(), Tier::Slow);
    assert_eq!(evicted.list(), None);
    for id in &resident.pages[1..] {
        let kept = sys.ctx.arena().get(*id).ok_or("page")?;
        assert_eq!(kept.tier(), Tier::Fast);
        assert_eq!(kept.list(), Some(ListKind::Cold));
        assert!(!kept.is_migrated());
    }
    assert_eq!(sys.ctx.cold().len(), resident.pages.len() - 1);
    assert_eq!(sys.backend.tier_of(evicted.va_start()), Some(Tier::Slow));
    assert_eq!(newcomer.tier(), Tier::Fast);
    assert!(sys.ctx.budget().fast_used() <= sys.ctx.budget().fast_size());

    let all: Vec<PageId> = resident.pages.iter().chain(&extra.pages).copied().collect();
    let budget = sys.ctx.budget();
    assert_eq!(
        (budget.fast_used() + budget.slow_used()) as u64,
        tracked_bytes(&sys.ctx, &all)
    );
    assert_list_exclusive(&sys.ctx);
    Ok(())
}

#[test]
fn test_allocate_lookup_deallocate_round_trip() -> TestResult {
    let sys = system(fixed(8 * PAGE))?;
    let mut regions = Vec::new();
    for pages in [1u64, 3, 5, 2] {
        regions.push(sys.alloc.allocate(&MapRequest::anonymous(pages * PAGE))?);
    }

    for region in &regions {
        for i in 0..region.length / PAGE {
            let va = region.addr + i * PAGE;
            let page = sys.ctx.table().lookup(va).ok_or("tracked page")?;
            assert_eq!(page.va_start(), va);
            assert_eq!(page.tier(), region.tier_of(va));
            assert!(sys.ctx.table().resolve(va + PAGE - 1, true).is_some());
        }
    }

    for region in &regions {
        let released = sys.alloc.deallocate(region.addr, region.length);
        assert_eq!(released as u64, region.length / PAGE);
        for i in 0..region.length / PAGE {
            assert!(sys.ctx.table().lookup(region.addr + i * PAGE).is_none());
        }
    }
    assert!(sys.ctx.table().is_empty());
    assert_eq!(sys.ctx.free().len(), 11);
    assert_eq!(sys.ctx.budget().fast_used(), 0);
    assert_eq!(sys.ctx.budget().slow_used(), 0);
    assert_list_exclusive(&sys.ctx);
    Ok(())
}

#[test]
fn test_unaligned_region_with_partial_tail_round_trip() -> TestResult {
    let sys = system_aligned(fixed(8 * PAGE), BASE_PAGE_SIZE)?;
    // A single base page first, so the next region starts off a page boundary.
    let lead = sys.alloc.allocate(&MapRequest::anonymous(BASE_PAGE_SIZE))?;
    let region = sys.alloc.allocate(&MapRequest::anonymous(PAGE + PAGE / 2))?;
    assert_ne!(region.addr % PAGE, 0);
    assert_eq!(region.pages.len(), 2);

    let mut misses = Vec::new();
    for off in (0..region.length).step_by(BASE_PAGE_SIZE as usize) {
        let addr = region.addr + off;
        match sys.ctx.table().resolve(addr, false) {
            Some(page) if page.covers(addr) && region.pages.contains(&page.id()) => {}
            _ => misses.push(off),
        }
    }
    assert!(misses.is_empty(), "{} unresolved offsets, first {:?}", misses.len(), misses.first());
    let tail = sys.ctx.arena().get(region.pages[1]).ok_or("tail")?;
    assert_eq!(tail.size(), PAGE / 2);
    assert!(sys.ctx.table().resolve(region.addr + region.length, false).is_none());

    assert_eq!(sys.alloc.deallocate(region.addr, region.length), 2);
    for off in (0..region.length).step_by(BASE_PAGE_SIZE as usize) {
        assert!(sys.ctx.table().resolve(region.addr + off, false).is_none());
    }
    let free: HashSet<PageId> = sys.ctx.free().ids().into_iter().collect();
    assert!(region.pages.iter().all(|id| free.contains(id)));
    assert!(sys.ctx.table().resolve(lead.addr, false).is_some());
    assert_list_exclusive(&sys.ctx);
    Ok(())
}

#[test]
fn test_table_insert_is_idempotent() -> TestResult {
    let sys = system(fixed(4 * PAGE))?;
    let region = sys.alloc.allocate(&MapRequest::anonymous(PAGE))?;
    let page = sys.ctx.arena().get(region.pages[0]).ok_or("page")?;
    assert!(!sys.ctx.table().insert(page.clone()));
    assert_eq!(sys.ctx.table().len(), 1);
    let found = sys.ctx.table().lookup(page.va()).ok_or("page")?;
    assert_eq!(found.id(), page.id());
    Ok(())
}

#[test]
fn test_cooling_halves_per_epoch() -> TestResult {
    let config = TierConfig {
        sample_cooling_threshold: 10,
        ..fixed(0)
    };
    let mut sys = system(config)?;
    let hot = sys.alloc.allocate(&MapRequest::anonymous(PAGE))?;
    let other = sys.alloc.allocate(&MapRequest::anonymous(PAGE))?;
    let page = sys.ctx.arena().get(hot.pages[0]).ok_or("page")?;

    for t in 0..6 {
        let sample = SampleRecord { ip: 1, time: t, addr: hot.addr };
        sys.classifier.process(&sample, EventKind::SlowRead, 0);
    }
    assert_eq!(page.accesses(), 6);
    // Two full epochs elapse on another page.
    for t in 0..24 {
        let sample = SampleRecord { ip: 1, time: t, addr: other.addr };
        sys.classifier.process(&sample, EventKind::SlowRead, 0);
    }
    assert_eq!(sys.classifier.global_clock(), 3);
    let class = sys
        .classifier
        .process(&SampleRecord { ip: 1, time: 99, addr: hot.addr }, EventKind::SlowRead, 0);
    assert_eq!(class, Some(Classification::Cold));
    assert_eq!(page.accesses(), (6 >> 3) + 1);
    Ok(())
}

#[test]
fn test_trace_files_written() -> TestResult {
    let dir = tempfile::tempdir()?;
    let config = TierConfig {
        trace_dir: Some(dir.path().to_path_buf()),
        ..fixed(0)
    };
    let mut sys = system(config)?;
    let region = sys.alloc.allocate(&MapRequest::anonymous(PAGE))?;
    for t in 1..=8 {
        let sample = SampleRecord { ip: 7, time: t, addr: region.addr };
        sys.classifier.process(&sample, EventKind::SlowRead, 2);
    }
    sys.scheduler.promote_once();
    assert_eq!(sys.ctx.trace().flush()?, 9);

    let samples = std::fs::read(dir.path().join("samples.bin"))?;
    assert_eq!(samples.len(), 8 * trace::TRACE_RECORD_SIZE);
    let mig = std::fs::read(dir.path().join("mig.bin"))?;
    assert_eq!(mig.len(), trace::TRACE_RECORD_SIZE);
    Ok(())
}

#[test]
fn test_concurrent_allocation_with_runtime() -> TestResult {
    let config = TierConfig {
        prediction: PredictionMode::DepthFirst,
        stats_interval: Duration::from_millis(5),
        demote_interval: Duration::from_millis(1),
        ..fixed(8 * PAGE)
    };
    let sys = system(config)?;
    let ring = Arc::new(SampleRing::new(0, EventKind::SlowRead, 64 * 1024)?);
    let runtime = Runtime::start(sys.ctx.clone(), vec![ring.clone()])?;

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let alloc = sys.alloc.clone();
            let ring = ring.clone();
            thread::spawn(move || -> std::result::Result<(), TierError> {
                for round in 0..20u64 {
                    let region = alloc.allocate(&MapRequest::anonymous(3 * PAGE))?;
                    for t in 0..16 {
                        ring.push_sample(SampleRecord {
                            ip: 0x40_0000 + w,
                            time: round * 100 + t,
                            addr: region.addr + (t % 3) * PAGE,
                        });
                    }
                    if round % 2 == 0 {
                        alloc.deallocate(region.addr, region.length);
                    }
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().map_err(|_| "worker panicked")??;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while !ring.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    runtime.shutdown();

    assert_list_exclusive(&sys.ctx);
    let budget = sys.ctx.budget();
    assert_eq!(
        (budget.fast_used() + budget.slow_used()) as u64,
        sys.ctx.stats().snapshot().mem_allocated
    );
    assert_eq!(sys.ctx.table().len(), 4 * 10 * 3);
    Ok(())
}
