// src/ffi.rs - C ABI called by the syscall interception hook
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::allocator::TierAllocator;
use crate::backend::{MapRequest, NumaBackend};
use crate::config::TierConfig;
use crate::error::TierError;
use crate::intercept::{current_pid, Interposer};
use crate::runtime::Runtime;
use crate::TierContext;

// Return codes
pub const TIERMEM_SUCCESS: i32 = 0;
/// The hook should let the original system call run.
pub const TIERMEM_PASSTHROUGH: i32 = 1;
pub const TIERMEM_ERROR_INIT: i32 = -1;
pub const TIERMEM_ERROR_INVALID_PARAM: i32 = -2;
pub const TIERMEM_ERROR_NOT_INITIALIZED: i32 = -3;
pub const TIERMEM_ERROR_CONFIG: i32 = -4;

/// Counters exported to C callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CTierStats {
    pub fast_size: i64,
    pub fast_used: i64,
    pub slow_used: i64,
    pub mem_allocated: u64,
    pub non_tracked_mem: u64,
    pub samples_processed: u64,
    pub migration_failures: u64,
    pub cold_pages: u64,
    pub hot_pages: u64,
    pub free_pages: u64,
}

struct Global {
    interposer: Interposer,
    runtime: Runtime,
}

lazy_static::lazy_static! {
    static ref GLOBAL: RwLock<Option<Global>> = RwLock::new(None);
}

/// Interposer for the hook, or `None` when uninitialized or mid-(de)init.
fn interposer() -> Option<Interposer> {
    let global = GLOBAL.try_read()?;
    global.as_ref().map(|g| g.interposer.clone())
}

fn error_code(err: &TierError) -> i32 {
    match err {
        TierError::InvalidConfig(_) => TIERMEM_ERROR_CONFIG,
        TierError::NotInitialized => TIERMEM_ERROR_NOT_INITIALIZED,
        _ => TIERMEM_ERROR_INIT,
    }
}

fn init_from_env() -> Result<Global, TierError> {
    let config = TierConfig::from_env()?;
    let backend = Arc::new(NumaBackend::new(config.fast_node, config.slow_node));
    let ctx = Arc::new(TierContext::new(config, backend)?);
    let runtime = Runtime::start(Arc::clone(&ctx), Vec::new())?;
    Ok(Global {
        interposer: Interposer::new(TierAllocator::new(ctx)),
        runtime,
    })
}

/// Initialize the runtime from `TIERMEM_*` environment variables.
/// Calling it again after success is a no-op.
#[no_mangle]
pub extern "C" fn tiermem_init() -> i32 {
    let _ = env_logger::try_init();
    let mut global = GLOBAL.write();
    if global.is_some() {
        return TIERMEM_SUCCESS;
    }
    match init_from_env() {
        Ok(g) => {
            *global = Some(g);
            TIERMEM_SUCCESS
        }
        Err(e) => {
            log::error!("tiermem_init: {}", e);
            error_code(&e)
        }
    }
}

/// Intercepted `mmap`. Returns `TIERMEM_SUCCESS` with `*result` set when the
/// mapping was handled (the address, or `MAP_FAILED` if reservation
/// failed), or `TIERMEM_PASSTHROUGH` when the original call should run.
/// Aborts the process if a handled mapping cannot be placed.
#[no_mangle]
pub extern "C" fn tiermem_mmap(
    addr: *mut c_void,
    length: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
    result: *mut *mut c_void,
) -> i32 {
    if result.is_null() {
        return TIERMEM_ERROR_INVALID_PARAM;
    }
    let interposer = match interposer() {
        Some(interposer) => interposer,
        None => return TIERMEM_PASSTHROUGH,
    };
    let request = MapRequest {
        addr_hint: addr as u64,
        length: length as u64,
        prot,
        flags,
        fd,
        offset,
    };
    match interposer.mmap(&request, current_pid()) {
        Ok(Some(region)) => {
            unsafe { *result = region.addr as *mut c_void };
            TIERMEM_SUCCESS
        }
        Ok(None) => TIERMEM_PASSTHROUGH,
        Err(e @ TierError::Bind { .. }) => {
            log::error!("tiermem_mmap: {}", e);
            std::process::abort();
        }
        Err(e) => {
            log::error!("tiermem_mmap: {}", e);
            unsafe { *result = libc::MAP_FAILED };
            TIERMEM_SUCCESS
        }
    }
}

/// Intercepted `munmap`. Releases tracking for the range; the original call
/// always runs, so this returns `TIERMEM_PASSTHROUGH`.
#[no_mangle]
pub extern "C" fn tiermem_munmap(addr: *mut c_void, length: usize) -> i32 {
    if let Some(interposer) = interposer() {
        interposer.munmap(addr as u64, length as u64);
    }
    TIERMEM_PASSTHROUGH
}

fn snapshot() -> Result<CTierStats, TierError> {
    let global = GLOBAL.read();
    let g = global.as_ref().ok_or(TierError::NotInitialized)?;
    let ctx = g.runtime.context();
    let budget = ctx.budget().snapshot();
    let stats = ctx.stats().snapshot();
    Ok(CTierStats {
        fast_size: budget.fast_size,
        fast_used: budget.fast_used,
        slow_used: budget.slow_used,
        mem_allocated: stats.mem_allocated,
        non_tracked_mem: stats.non_tracked_mem,
        samples_processed: stats.samples_processed,
        migration_failures: stats.migration_failures,
        cold_pages: ctx.cold().len() as u64,
        hot_pages: ctx.hot().len() as u64,
        free_pages: ctx.free().len() as u64,
    })
}

/// Copy current counters into `out`.
#[no_mangle]
pub extern "C" fn tiermem_stats(out: *mut CTierStats) -> i32 {
    if out.is_null() {
        return TIERMEM_ERROR_INVALID_PARAM;
    }
    match snapshot() {
        Ok(stats) => {
            unsafe { *out = stats };
            TIERMEM_SUCCESS
        }
        Err(e) => error_code(&e),
    }
}

/// Stop the background threads. Tracked mappings stay valid.
#[no_mangle]
pub extern "C" fn tiermem_shutdown() -> i32 {
    let global = GLOBAL.write().take();
    match global.ok_or(TierError::NotInitialized) {
        Ok(g) => {
            g.runtime.shutdown();
            TIERMEM_SUCCESS
        }
        Err(e) => error_code(&e),
    }
}
