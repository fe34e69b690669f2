// src/intercept.rs - Routing of intercepted mmap/munmap calls
use std::cell::Cell;

use crate::allocator::{Region, TierAllocator};
use crate::backend::MapRequest;
use crate::error::Result;
use crate::stats::TierStats;

thread_local! {
    static IN_RUNTIME: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as executing tiering code, so mappings made
/// underneath (metadata growth, trace buffers) are not tracked.
#[derive(Debug)]
pub struct InternalGuard {
    previous: bool,
}

impl InternalGuard {
    pub fn enter() -> Self {
        let previous = IN_RUNTIME.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for InternalGuard {
    fn drop(&mut self) {
        IN_RUNTIME.with(|flag| flag.set(self.previous));
    }
}

pub fn is_internal_call() -> bool {
    IN_RUNTIME.with(|flag| flag.get())
}

/// Why a mapping is left to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Untracked {
    /// Issued by the tiering runtime itself.
    Internal,
    /// File-backed or shared mapping.
    NotAnonymous,
    /// Issued by a child process that inherited the hook.
    ForeignProcess,
}

/// Routing decision for one intercepted mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tracked,
    Untracked(Untracked),
}

/// Decide whether a mapping made by process `pid` should be tracked, given
/// the pid that initialized the runtime.
pub fn route(request: &MapRequest, pid: u32, main_pid: u32) -> Route {
    if is_internal_call() {
        Route::Untracked(Untracked::Internal)
    } else if !request.is_anonymous() {
        Route::Untracked(Untracked::NotAnonymous)
    } else if pid != main_pid {
        Route::Untracked(Untracked::ForeignProcess)
    } else {
        Route::Tracked
    }
}

pub fn current_pid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

/// The allocator as seen from the syscall hook.
#[derive(Debug, Clone)]
pub struct Interposer {
    allocator: TierAllocator,
    main_pid: u32,
}

impl Interposer {
    pub fn new(allocator: TierAllocator) -> Self {
        Self::with_main_pid(allocator, current_pid())
    }

    pub fn with_main_pid(allocator: TierAllocator, main_pid: u32) -> Self {
        Self {
            allocator,
            main_pid,
        }
    }

    pub fn allocator(&self) -> &TierAllocator {
        &self.allocator
    }

    /// Handle an intercepted mmap from `pid`. `Ok(None)` means the caller
    /// should let the original call proceed.
    pub fn mmap(&self, request: &MapRequest, pid: u32) -> Result<Option<Region>> {
        match route(request, pid, self.main_pid) {
            Route::Tracked => {
                let _guard = InternalGuard::enter();
                self.allocator.allocate(request).map(Some)
            }
            Route::Untracked(reason) => {
                log::trace!("mmap {} bytes untracked: {:?}", request.length, reason);
                TierStats::add(
                    &self.allocator.context().stats().non_tracked_mem,
                    request.length,
                );
                Ok(None)
            }
        }
    }

    /// Handle an intercepted munmap. The original call always proceeds;
    /// this only releases tracking. Returns the pages released.
    pub fn munmap(&self, addr: u64, length: u64) -> usize {
        if is_internal_call() {
            return 0;
        }
        let _guard = InternalGuard::enter();
        self.allocator.deallocate(addr, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::config::{FastCapacity, TierConfig};
    use crate::TierContext;
    use std::sync::Arc;

    const MB: u64 = 1024 * 1024;

    fn interposer() -> Interposer {
        let config = TierConfig {
            fast_capacity: FastCapacity::Fixed(16 * MB),
            ..TierConfig::default()
        };
        let backend = Arc::new(SimulatedBackend::new(64 * MB, 256 * MB, config.page_size));
        let ctx = Arc::new(TierContext::new(config, backend).unwrap());
        Interposer::with_main_pid(TierAllocator::new(ctx), 100)
    }

    #[test]
    fn test_route_rules() {
        let anon = MapRequest::anonymous(MB);
        assert_eq!(route(&anon, 7, 7), Route::Tracked);
        assert_eq!(
            route(&anon, 8, 7),
            Route::Untracked(Untracked::ForeignProcess)
        );
        let file = MapRequest {
            flags: libc::MAP_PRIVATE,
            fd: 3,
            ..anon
        };
        assert_eq!(route(&file, 7, 7), Route::Untracked(Untracked::NotAnonymous));

        let guard = InternalGuard::enter();
        assert_eq!(route(&anon, 7, 7), Route::Untracked(Untracked::Internal));
        drop(guard);
        assert!(!is_internal_call());
    }

    #[test]
    fn test_guard_nests() {
        let outer = InternalGuard::enter();
        {
            let _inner = InternalGuard::enter();
            assert!(is_internal_call());
        }
        assert!(is_internal_call());
        drop(outer);
        assert!(!is_internal_call());
    }

    #[test]
    fn test_untracked_bytes_are_counted() {
        let interposer = interposer();
        let result = interposer.mmap(&MapRequest::anonymous(MB), 101).unwrap();
        assert!(result.is_none());
        let stats = interposer.allocator().context().stats().snapshot();
        assert_eq!(stats.non_tracked_mem, MB);
        assert_eq!(stats.mem_allocated, 0);
    }

    #[test]
    fn test_tracked_round_trip() {
        let interposer = interposer();
        let region = interposer
            .mmap(&MapRequest::anonymous(4 * MB), 100)
            .unwrap()
            .expect("tracked");
        assert!(!is_internal_call());
        let ctx = interposer.allocator().context().clone();
        assert_eq!(ctx.table().len(), 2);
        assert_eq!(interposer.munmap(region.addr, region.length), 2);
        assert!(ctx.table().is_empty());
    }
}
