// src/config.rs - Runtime configuration, resolved once at startup
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TierError};

/// Tracked page size (2 MiB).
pub const DEFAULT_PAGE_SIZE: u64 = 2 * 1024 * 1024;
/// Base page size used for rounding requests and partial tails.
pub const BASE_PAGE_SIZE: u64 = 4096;
/// Neighbor slots per page.
pub const MAX_NEIGHBORS: usize = 4;

const GIB: u64 = 1024 * 1024 * 1024;

/// How the fast-tier budget is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastCapacity {
    /// Fixed byte budget for tracked memory on the fast node.
    Fixed(u64),
    /// Budget is the fast node's total memory minus this many bytes, which
    /// the demoter also keeps free.
    Reserve(u64),
}

/// Cold list ordering discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdListDiscipline {
    /// Pages enter the cold list once and age out in insertion order.
    Fifo,
    /// Every fast-tier access moves the page to the most-recent end.
    Lru,
}

/// Which neighbor walk feeds extra promotion candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionMode {
    Disabled,
    /// Direct neighbors of the sampled page.
    Flat,
    /// Follow the closest-neighbor chain up to `max_pred_depth`.
    DepthFirst,
}

/// Weights and decay rates for the neighbor predictor.
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    pub history_size: usize,
    pub max_pred_depth: usize,
    pub va_weight: f64,
    pub cyc_weight: f64,
    pub ip_weight: f64,
    /// Floor update rate when a distance sample is below the floor.
    pub floor_rate_below: f64,
    /// Floor update rate when a distance sample is at or above the floor.
    pub floor_rate_above: f64,
    /// Running mean distance update rate.
    pub avg_rate: f64,
    /// Multiplier applied to every neighbor distance on each update.
    pub neighbor_decay: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            history_size: 16,
            max_pred_depth: 16,
            va_weight: 1.0,
            cyc_weight: 1.0,
            ip_weight: 1.0,
            floor_rate_below: 0.01,
            floor_rate_above: 0.0001,
            avg_rate: 0.0001,
            neighbor_decay: 1.1,
        }
    }
}

/// Configuration for the tiering runtime
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub page_size: u64,
    pub base_page_size: u64,
    pub fast_node: u32,
    pub slow_node: u32,
    pub fast_capacity: FastCapacity,
    /// Decayed access count at which a page becomes hot.
    pub hot_threshold: u64,
    /// Processed samples per cooling epoch.
    pub sample_cooling_threshold: u64,
    /// Maximum records drained from one ring per poll.
    pub batch_cap: usize,
    /// Reset a sample counter that has been silent this long.
    pub stale_reset: Duration,
    pub cold_list: ColdListDiscipline,
    pub prediction: PredictionMode,
    pub predictor: PredictorConfig,
    /// Decay rate for the migration queue/move latency averages.
    pub latency_rate: f64,
    pub demote_interval: Duration,
    pub stats_interval: Duration,
    pub stats_enabled: bool,
    /// Directory for binary trace files; tracing is off when unset.
    pub trace_dir: Option<PathBuf>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            base_page_size: BASE_PAGE_SIZE,
            fast_node: 0,
            slow_node: 1,
            fast_capacity: FastCapacity::Reserve(GIB),
            hot_threshold: 8,
            sample_cooling_threshold: 100_000,
            batch_cap: 128,
            stale_reset: Duration::from_millis(50),
            cold_list: ColdListDiscipline::Fifo,
            prediction: PredictionMode::DepthFirst,
            predictor: PredictorConfig::default(),
            latency_rate: 0.01,
            demote_interval: Duration::from_millis(10),
            stats_interval: Duration::from_secs(1),
            stats_enabled: true,
            trace_dir: None,
        }
    }
}

impl TierConfig {
    /// Build a configuration from `TIERMEM_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u64>("TIERMEM_PAGE_SIZE")? {
            config.page_size = v;
        }
        if let Some(v) = env_parse::<u32>("TIERMEM_FAST_NODE")? {
            config.fast_node = v;
        }
        if let Some(v) = env_parse::<u32>("TIERMEM_SLOW_NODE")? {
            config.slow_node = v;
        }
        match (
            env_parse::<u64>("TIERMEM_FAST_SIZE")?,
            env_parse::<u64>("TIERMEM_FAST_BUFFER")?,
        ) {
            (Some(_), Some(_)) => {
                return Err(TierError::InvalidConfig(
                    "TIERMEM_FAST_SIZE and TIERMEM_FAST_BUFFER are mutually exclusive".into(),
                ))
            }
            (Some(size), None) => config.fast_capacity = FastCapacity::Fixed(size),
            (None, Some(buffer)) => config.fast_capacity = FastCapacity::Reserve(buffer),
            (None, None) => {}
        }
        if let Some(v) = env_parse::<u64>("TIERMEM_HOT_THRESHOLD")? {
            config.hot_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("TIERMEM_COOLING_SAMPLES")? {
            config.sample_cooling_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("TIERMEM_HISTORY_SIZE")? {
            config.predictor.history_size = v;
        }
        if let Some(v) = env_parse::<u64>("TIERMEM_DEMOTE_INTERVAL_MS")? {
            config.demote_interval = Duration::from_millis(v);
        }
        if let Ok(v) = env::var("TIERMEM_COLD_LIST") {
            config.cold_list = match v.to_ascii_lowercase().as_str() {
                "fifo" => ColdListDiscipline::Fifo,
                "lru" => ColdListDiscipline::Lru,
                other => {
                    return Err(TierError::InvalidConfig(format!(
                        "unknown cold list discipline '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(v) = env::var("TIERMEM_PREDICTION") {
            config.prediction = match v.to_ascii_lowercase().as_str() {
                "off" | "disabled" => PredictionMode::Disabled,
                "flat" => PredictionMode::Flat,
                "dfs" | "depth-first" => PredictionMode::DepthFirst,
                other => {
                    return Err(TierError::InvalidConfig(format!(
                        "unknown prediction mode '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(v) = env_parse::<bool>("TIERMEM_STATS")? {
            config.stats_enabled = v;
        }
        if let Ok(dir) = env::var("TIERMEM_TRACE_DIR") {
            config.trace_dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the allocator and predictor cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.base_page_size.is_power_of_two() {
            return Err(TierError::InvalidConfig(format!(
                "base page size {} is not a power of two",
                self.base_page_size
            )));
        }
        if !self.page_size.is_power_of_two() || self.page_size < self.base_page_size {
            return Err(TierError::InvalidConfig(format!(
                "page size {} must be a power of two no smaller than {}",
                self.page_size, self.base_page_size
            )));
        }
        if self.fast_node == self.slow_node {
            return Err(TierError::InvalidConfig(
                "fast and slow tiers must be different nodes".into(),
            ));
        }
        if self.hot_threshold == 0 || self.sample_cooling_threshold == 0 || self.batch_cap == 0 {
            return Err(TierError::InvalidConfig(
                "hot threshold, cooling threshold and batch cap must be non-zero".into(),
            ));
        }
        if self.predictor.history_size < 2 {
            return Err(TierError::InvalidConfig(
                "history must hold at least two pages".into(),
            ));
        }
        Ok(())
    }

    pub fn page_mask(&self) -> u64 {
        !(self.page_size - 1)
    }

    pub fn base_page_mask(&self) -> u64 {
        !(self.base_page_size - 1)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| TierError::InvalidConfig(format!("{}='{}' is not valid", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Round `value` up to a power-of-two `align`.
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a power-of-two `align`.
pub fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}
