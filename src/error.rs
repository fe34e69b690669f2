// src/error.rs - Error taxonomy for placement, migration and configuration
use std::io;

use thiserror::Error;

use crate::page::Tier;

/// Errors surfaced by the tiering core.
///
/// Reservation and binding failures during `allocate` are fatal for the
/// caller: placement is not rolled back. A binding failure during migration
/// only affects the one page and leaves its state unchanged.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("failed to reserve {len} bytes: {source}")]
    Reserve {
        len: u64,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {len} bytes at {addr:#x} to the {tier:?} node: {source}")]
    Bind {
        addr: u64,
        len: u64,
        tier: Tier,
        #[source]
        source: io::Error,
    },
    #[error("failed to read memory info for node {node}: {source}")]
    NodeInfo {
        node: u32,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("tiering runtime is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TierError>;
