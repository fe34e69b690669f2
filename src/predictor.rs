// src/predictor.rs - Spatio-temporal neighbor prediction over recent samples
use std::fmt;
use std::sync::Arc;

use crate::config::{PredictionMode, PredictorConfig};
use crate::page::{Neighbor, Page, PageArena, PageId};

/// Walk over neighbor sets producing promotion candidates.
pub trait PredictionStrategy: Send + Sync + fmt::Debug {
    /// Append to `out` the pages expected to be touched after `due_after`
    /// time units from `page`'s last access, considering only neighbors
    /// closer than `threshold`.
    fn predict(
        &self,
        arena: &PageArena,
        page: &Page,
        threshold: f64,
        due_after: f64,
        out: &mut Vec<PageId>,
    );
}

fn push_unique(out: &mut Vec<PageId>, origin: PageId, candidate: PageId) {
    if candidate != origin && !out.contains(&candidate) {
        out.push(candidate);
    }
}

/// Direct neighbors of the sampled page.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatNeighbors;

impl PredictionStrategy for FlatNeighbors {
    fn predict(
        &self,
        _arena: &PageArena,
        page: &Page,
        threshold: f64,
        due_after: f64,
        out: &mut Vec<PageId>,
    ) {
        let neighbors = page.neighbors().clone();
        for n in neighbors.iter() {
            if n.distance < threshold && n.time_diff as f64 > due_after {
                push_unique(out, page.id(), n.page);
            }
        }
    }
}

/// Follows the closest-neighbor chain, accumulating time offsets.
#[derive(Debug, Clone, Copy)]
pub struct DepthFirstChain {
    pub max_depth: usize,
}

impl PredictionStrategy for DepthFirstChain {
    fn predict(
        &self,
        arena: &PageArena,
        page: &Page,
        threshold: f64,
        due_after: f64,
        out: &mut Vec<PageId>,
    ) {
        let origin = page.id();
        let mut offset = 0i64;
        let mut current: Option<Arc<Page>> = None;

        for _ in 0..self.max_depth {
            let neighbors = match &current {
                Some(p) => p.neighbors().clone(),
                None => page.neighbors().clone(),
            };
            for n in neighbors.iter() {
                if n.distance < threshold && (offset + n.time_diff) as f64 > due_after {
                    push_unique(out, origin, n.page);
                }
            }
            let next = match neighbors.closest_below(threshold) {
                Some(next) => next,
                None => break,
            };
            offset += next.time_diff;
            current = arena.get(next.page);
            if current.is_none() {
                break;
            }
        }
    }
}

/// Resolve the configured strategy; `None` when prediction is off.
pub fn strategy_for(
    mode: PredictionMode,
    config: &PredictorConfig,
) -> Option<Box<dyn PredictionStrategy>> {
    match mode {
        PredictionMode::Disabled => None,
        PredictionMode::Flat => Some(Box::new(FlatNeighbors)),
        PredictionMode::DepthFirst => Some(Box::new(DepthFirstChain {
            max_depth: config.max_pred_depth,
        })),
    }
}

/// Bounded history of recently sampled pages plus the adaptive distance
/// floor that decides which neighbors are close enough to act on.
#[derive(Debug)]
pub struct NeighborPredictor {
    config: PredictorConfig,
    strategy: Box<dyn PredictionStrategy>,
    history: Vec<Option<Arc<Page>>>,
    bot_dist: f64,
    avg_dist: f64,
}

impl NeighborPredictor {
    pub fn new(config: PredictorConfig, strategy: Box<dyn PredictionStrategy>) -> Self {
        Self {
            history: vec![None; config.history_size],
            config,
            strategy,
            bot_dist: 1.0,
            avg_dist: 1.0,
        }
    }

    /// Adaptive floor: neighbors closer than this are considered related.
    pub fn floor(&self) -> f64 {
        self.bot_dist
    }

    pub fn mean(&self) -> f64 {
        self.avg_dist
    }

    pub fn history_len(&self) -> usize {
        self.history.iter().flatten().count()
    }

    /// Add a sampled page. Once the history is full the oldest entry has its
    /// neighbors recomputed against the rest and is then replaced.
    /// `fast_fraction` is the current share of fast-tier accesses.
    pub fn observe(&mut self, page: &Arc<Page>, fast_fraction: f64) {
        if let Some(slot) = self.history.iter_mut().find(|s| s.is_none()) {
            *slot = Some(Arc::clone(page));
            return;
        }

        let oldest = self
            .history
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|p| (i, p.cyc_accessed())))
            .min_by_key(|(_, cyc)| *cyc)
            .map(|(i, _)| i);
        let oldest = match oldest {
            Some(i) => i,
            None => return,
        };
        if let Some(old) = self.history[oldest].take() {
            self.update_neighbors(&old, fast_fraction);
        }
        self.history[oldest] = Some(Arc::clone(page));
    }

    fn update_neighbors(&mut self, old: &Page, fast_fraction: f64) {
        let mut candidates = Vec::with_capacity(self.history.len());
        for cur in self.history.iter().flatten() {
            if cur.id() == old.id() {
                continue;
            }
            candidates.push((
                cur.id(),
                cur.va_start(),
                cur.cyc_accessed(),
                cur.ip(),
            ));
        }

        let mut updates = Vec::with_capacity(candidates.len());
        for (id, va, cyc, ip) in candidates {
            let distance = self.distance(old, va, cyc, ip, fast_fraction);
            updates.push(Neighbor {
                page: id,
                distance,
                time_diff: cyc as i64 - old.cyc_accessed() as i64,
            });
        }

        let mut neighbors = old.neighbors();
        neighbors.decay(self.config.neighbor_decay);
        for n in updates {
            neighbors.offer(n);
        }
    }

    /// Weighted distance between `old` and a candidate; also feeds the floor
    /// and mean estimates.
    fn distance(&mut self, old: &Page, va: u64, cyc: u64, ip: u64, fast_fraction: f64) -> f64 {
        let cfg = &self.config;
        let d = cfg.va_weight * old.va_start().abs_diff(va) as f64
            + cfg.cyc_weight * old.cyc_accessed().abs_diff(cyc) as f64
            + cfg.ip_weight * old.ip().abs_diff(ip) as f64;

        let scaled = d * (1.0 - fast_fraction * fast_fraction);
        self.bot_dist = self.next_floor(scaled);
        self.avg_dist = cfg.avg_rate * d + (1.0 - cfg.avg_rate) * self.avg_dist;
        d
    }

    fn next_floor(&self, sample: f64) -> f64 {
        let floor = self.bot_dist;
        let sample = sample.clamp(floor / 10.0, floor * 10.0);
        let rate = if sample < floor {
            self.config.floor_rate_below
        } else {
            self.config.floor_rate_above
        };
        rate * sample + (1.0 - rate) * floor
    }

    /// Pages predicted to be accessed soon after `page`, excluding ones due
    /// before a migration could complete (`due_after`).
    pub fn predict(&self, arena: &PageArena, page: &Page, due_after: f64) -> Vec<PageId> {
        let mut out = Vec::new();
        self.strategy
            .predict(arena, page, self.bot_dist, due_after, &mut out);
        out
    }
}
