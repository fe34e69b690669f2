// src/backend.rs - Memory reservation and node binding backends
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::align_up;
use crate::error::{Result, TierError};
use crate::page::Tier;

const MPOL_PREFERRED: libc::c_ulong = 1;
const MPOL_BIND: libc::c_ulong = 2;
const MPOL_MF_STRICT: libc::c_ulong = 1 << 0;
const MPOL_MF_MOVE: libc::c_ulong = 1 << 1;

/// Total and free bytes on one memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMemory {
    pub total: u64,
    pub free: u64,
}

/// Memory policy applied when binding a range to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPolicy {
    /// Initial placement of a fresh reservation.
    Preferred,
    /// Migration of an existing page.
    Bind,
}

/// A mapping request forwarded by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub addr_hint: u64,
    pub length: u64,
    pub prot: i32,
    pub flags: i32,
    pub fd: i32,
    pub offset: i64,
}

impl MapRequest {
    /// Anonymous private read/write mapping of `length` bytes.
    pub fn anonymous(length: u64) -> Self {
        Self {
            addr_hint: 0,
            length,
            prot: libc::PROT_READ | libc::PROT_WRITE,
            flags: libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            fd: -1,
            offset: 0,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags & libc::MAP_ANONYMOUS == libc::MAP_ANONYMOUS
    }
}

/// Platform seam for reserving memory and placing it on a node. Bind calls
/// always move existing pages and fail if placement cannot be honored.
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    fn reserve(&self, request: &MapRequest) -> Result<u64>;
    fn bind(&self, addr: u64, len: u64, tier: Tier, policy: BindPolicy) -> Result<()>;
    fn node_memory(&self, tier: Tier) -> Result<NodeMemory>;
}

/// Linux backend: `mmap` plus the `mbind` syscall, node sizes from sysfs.
#[derive(Debug, Clone)]
pub struct NumaBackend {
    fast_node: u32,
    slow_node: u32,
}

impl NumaBackend {
    pub fn new(fast_node: u32, slow_node: u32) -> Self {
        Self {
            fast_node,
            slow_node,
        }
    }

    fn node(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Fast => self.fast_node,
            Tier::Slow => self.slow_node,
        }
    }
}

impl MemoryBackend for NumaBackend {
    fn reserve(&self, request: &MapRequest) -> Result<u64> {
        let ptr = unsafe {
            libc::mmap(
                request.addr_hint as *mut libc::c_void,
                request.length as libc::size_t,
                request.prot,
                request.flags,
                request.fd,
                request.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TierError::Reserve {
                len: request.length,
                source: io::Error::last_os_error(),
            });
        }
        Ok(ptr as u64)
    }

    fn bind(&self, addr: u64, len: u64, tier: Tier, policy: BindPolicy) -> Result<()> {
        let node = self.node(tier);
        let nodemask: libc::c_ulong = 1 << node;
        let mode = match policy {
            BindPolicy::Preferred => MPOL_PREFERRED,
            BindPolicy::Bind => MPOL_BIND,
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr as *mut libc::c_void,
                len as libc::c_ulong,
                mode,
                &nodemask as *const libc::c_ulong,
                64 as libc::c_ulong,
                MPOL_MF_MOVE | MPOL_MF_STRICT,
            )
        };
        if ret == -1 {
            return Err(TierError::Bind {
                addr,
                len,
                tier,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn node_memory(&self, tier: Tier) -> Result<NodeMemory> {
        let node = self.node(tier);
        let path = format!("/sys/devices/system/node/node{}/meminfo", node);
        let text =
            fs::read_to_string(&path).map_err(|source| TierError::NodeInfo { node, source })?;
        parse_meminfo(&text).ok_or_else(|| TierError::NodeInfo {
            node,
            source: io::Error::new(io::ErrorKind::InvalidData, "missing MemTotal/MemFree"),
        })
    }
}

/// Parse `Node N MemTotal: X kB` / `Node N MemFree: Y kB` lines.
fn parse_meminfo(text: &str) -> Option<NodeMemory> {
    let mut total = None;
    let mut free = None;
    for line in text.lines() {
        let mut fields = line.split_whitespace().skip(2);
        let key = fields.next();
        let kb = fields.next().and_then(|v| v.parse::<u64>().ok());
        match (key, kb) {
            (Some("MemTotal:"), Some(kb)) => total = Some(kb * 1024),
            (Some("MemFree:"), Some(kb)) => free = Some(kb * 1024),
            _ => {}
        }
    }
    Some(NodeMemory {
        total: total?,
        free: free?,
    })
}

#[derive(Debug, Default)]
struct SimState {
    /// Disjoint bound ranges: start -> (len, tier).
    ranges: BTreeMap<u64, (u64, Tier)>,
    fast_bound: u64,
    slow_bound: u64,
    fail_binds_to: Option<Tier>,
}

impl SimState {
    fn account(&mut self, tier: Tier, bytes: u64, add: bool) {
        let counter = match tier {
            Tier::Fast => &mut self.fast_bound,
            Tier::Slow => &mut self.slow_bound,
        };
        if add {
            *counter += bytes;
        } else {
            *counter -= bytes;
        }
    }

    /// Rebind `[start, start + len)`, trimming any overlapped ranges.
    fn rebind(&mut self, start: u64, len: u64, tier: Tier) {
        let end = start + len;
        let overlapping: Vec<(u64, u64, Tier)> = self
            .ranges
            .range(..end)
            .filter(|(s, (l, _))| **s + *l > start)
            .map(|(s, (l, t))| (*s, *l, *t))
            .collect();
        for (s, l, t) in overlapping {
            self.ranges.remove(&s);
            self.account(t, l, false);
            if s < start {
                self.ranges.insert(s, (start - s, t));
                self.account(t, start - s, true);
            }
            if s + l > end {
                self.ranges.insert(end, (s + l - end, t));
                self.account(t, s + l - end, true);
            }
        }
        self.ranges.insert(start, (len, tier));
        self.account(tier, len, true);
    }
}

/// In-process two-node model. Reservations hand out page-aligned address
/// ranges without touching real memory; node usage is the sum of bound
/// ranges.
#[derive(Debug)]
pub struct SimulatedBackend {
    fast_total: u64,
    slow_total: u64,
    alignment: u64,
    next_addr: AtomicU64,
    binds: AtomicUsize,
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    pub fn new(fast_total: u64, slow_total: u64, alignment: u64) -> Self {
        Self {
            fast_total,
            slow_total,
            alignment,
            next_addr: AtomicU64::new(0x7f00_0000_0000),
            binds: AtomicUsize::new(0),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Make every subsequent bind to `tier` fail; `None` clears it.
    pub fn fail_binds_to(&self, tier: Option<Tier>) {
        self.state.lock().fail_binds_to = tier;
    }

    /// Tier that `addr` is currently bound to.
    pub fn tier_of(&self, addr: u64) -> Option<Tier> {
        let state = self.state.lock();
        let (start, (len, tier)) = state.ranges.range(..=addr).next_back()?;
        if addr < start + len {
            Some(*tier)
        } else {
            None
        }
    }

    pub fn bound_bytes(&self, tier: Tier) -> u64 {
        let state = self.state.lock();
        match tier {
            Tier::Fast => state.fast_bound,
            Tier::Slow => state.slow_bound,
        }
    }

    pub fn bind_calls(&self) -> usize {
        self.binds.load(Ordering::Relaxed)
    }
}

impl MemoryBackend for SimulatedBackend {
    fn reserve(&self, request: &MapRequest) -> Result<u64> {
        if request.length == 0 {
            return Err(TierError::Reserve {
                len: 0,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        // Leave a one-granule gap so neighboring regions never touch.
        let span = align_up(request.length, self.alignment) + self.alignment;
        Ok(self.next_addr.fetch_add(span, Ordering::Relaxed))
    }

    fn bind(&self, addr: u64, len: u64, tier: Tier, _policy: BindPolicy) -> Result<()> {
        self.binds.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.fail_binds_to == Some(tier) {
            return Err(TierError::Bind {
                addr,
                len,
                tier,
                source: io::Error::from_raw_os_error(libc::EIO),
            });
        }
        state.rebind(addr, len, tier);
        Ok(())
    }

    fn node_memory(&self, tier: Tier) -> Result<NodeMemory> {
        let state = self.state.lock();
        let (total, used) = match tier {
            Tier::Fast => (self.fast_total, state.fast_bound),
            Tier::Slow => (self.slow_total, state.slow_bound),
        };
        Ok(NodeMemory {
            total,
            free: total.saturating_sub(used),
        })
    }
}
