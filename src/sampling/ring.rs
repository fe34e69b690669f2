// src/sampling/ring.rs - perf-style sample ring shared with the hardware sampler
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, TierError};

pub const RECORD_THROTTLE: u32 = 5;
pub const RECORD_UNTHROTTLE: u32 = 6;
pub const RECORD_SAMPLE: u32 = 9;

/// `{type: u32, misc: u16, size: u16}`
pub const HEADER_SIZE: u64 = 8;
/// `{ip: u64, time: u64, addr: u64}`
pub const SAMPLE_BODY_SIZE: u64 = 24;

const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
const PERF_EVENT_IOC_RESET: u64 = 0x2403;

/// Which load event produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Load served from the fast node.
    FastRead,
    /// Load served from the slow node.
    SlowRead,
}

/// One raw access sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRecord {
    pub ip: u64,
    pub time: u64,
    pub addr: u64,
}

/// A decoded ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRecord {
    Sample(SampleRecord),
    Throttle,
    Unthrottle,
    /// Record type the classifier does not understand.
    Unknown(u32),
    /// Sample whose payload size does not match the expected layout.
    Malformed,
    /// Record body straddles the ring boundary; dropped.
    Wrapped,
    /// Record header straddles the ring boundary; dropped.
    WrappedHeader,
}

/// Disable/reset/enable hook for the counter feeding a ring.
pub trait EventControl: Send + Sync {
    fn reset(&self) -> io::Result<()>;
}

/// A perf event file descriptor.
#[derive(Debug, Clone, Copy)]
pub struct PerfEventFd(pub RawFd);

impl EventControl for PerfEventFd {
    fn reset(&self) -> io::Result<()> {
        for request in [
            PERF_EVENT_IOC_DISABLE,
            PERF_EVENT_IOC_RESET,
            PERF_EVENT_IOC_ENABLE,
        ] {
            if unsafe { libc::ioctl(self.0, request as _, 0) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Single-producer byte ring with `data_head`/`data_tail` cursors.
///
/// Cursors grow monotonically; positions are taken modulo the power-of-two
/// `data_size`. The producer publishes `data_head` with release ordering and
/// the consumer publishes `data_tail` the same way.
pub struct SampleRing {
    cpu: u32,
    event: EventKind,
    data: Box<[AtomicU8]>,
    data_head: AtomicU64,
    data_tail: AtomicU64,
    lost: AtomicU64,
    writer: Mutex<()>,
    control: Option<Box<dyn EventControl>>,
}

impl fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleRing")
            .field("cpu", &self.cpu)
            .field("event", &self.event)
            .field("data_size", &self.data_size())
            .field("data_head", &self.data_head())
            .field("data_tail", &self.data_tail())
            .finish()
    }
}

impl SampleRing {
    pub fn new(cpu: u32, event: EventKind, data_size: u64) -> Result<Self> {
        if !data_size.is_power_of_two() || data_size < HEADER_SIZE + SAMPLE_BODY_SIZE {
            return Err(TierError::InvalidConfig(format!(
                "sample ring size {} must be a power of two holding at least one sample",
                data_size
            )));
        }
        Ok(Self {
            cpu,
            event,
            data: (0..data_size).map(|_| AtomicU8::new(0)).collect(),
            data_head: AtomicU64::new(0),
            data_tail: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            writer: Mutex::new(()),
            control: None,
        })
    }

    /// Attach the counter control used by the staleness watchdog.
    pub fn with_control(mut self, control: Box<dyn EventControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn event(&self) -> EventKind {
        self.event
    }

    pub fn data_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Offset of the data area; the ring is its own data area.
    pub fn data_offset(&self) -> u64 {
        0
    }

    pub fn data_head(&self) -> u64 {
        self.data_head.load(Ordering::Acquire)
    }

    pub fn data_tail(&self) -> u64 {
        self.data_tail.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.data_head() == self.data_tail()
    }

    /// Records the producer had to drop because the ring was full.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Reset the underlying counter, if one is attached.
    pub fn reset_counter(&self) -> io::Result<()> {
        match &self.control {
            Some(control) => control.reset(),
            None => Ok(()),
        }
    }

    fn mask(&self) -> u64 {
        self.data_size() - 1
    }

    fn write_bytes(&self, pos: u64, bytes: &[u8]) {
        let mask = self.mask();
        for (i, b) in bytes.iter().enumerate() {
            self.data[((pos + i as u64) & mask) as usize].store(*b, Ordering::Relaxed);
        }
    }

    fn read_bytes<const N: usize>(&self, pos: u64) -> [u8; N] {
        let mask = self.mask();
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.data[((pos + i as u64) & mask) as usize].load(Ordering::Relaxed);
        }
        out
    }

    fn read_u64(&self, pos: u64) -> u64 {
        u64::from_le_bytes(self.read_bytes::<8>(pos))
    }

    /// Producer side: append a record. Returns false (and counts it lost)
    /// when the ring lacks space.
    pub fn push_record(&self, record_type: u32, body: &[u8]) -> bool {
        let _writer = self.writer.lock();
        let size = HEADER_SIZE + body.len() as u64;
        let head = self.data_head.load(Ordering::Relaxed);
        let tail = self.data_tail.load(Ordering::Acquire);
        if size > u16::MAX as u64 || size > self.data_size() - (head - tail) {
            self.lost.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        header[..4].copy_from_slice(&record_type.to_le_bytes());
        header[6..8].copy_from_slice(&(size as u16).to_le_bytes());
        self.write_bytes(head, &header);
        self.write_bytes(head + HEADER_SIZE, body);
        self.data_head.store(head + size, Ordering::Release);
        true
    }

    /// Producer side: append an access sample.
    pub fn push_sample(&self, sample: SampleRecord) -> bool {
        let mut body = [0u8; SAMPLE_BODY_SIZE as usize];
        body[..8].copy_from_slice(&sample.ip.to_le_bytes());
        body[8..16].copy_from_slice(&sample.time.to_le_bytes());
        body[16..24].copy_from_slice(&sample.addr.to_le_bytes());
        self.push_record(RECORD_SAMPLE, &body)
    }

    /// Consumer side: decode and consume the oldest record.
    pub fn next_record(&self) -> Option<RingRecord> {
        let tail = self.data_tail.load(Ordering::Relaxed);
        let head = self.data_head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let avail = head - tail;
        let wrapped_tail = tail & self.mask();

        let header = self.read_bytes::<{ HEADER_SIZE as usize }>(tail);
        let record_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = u16::from_le_bytes([header[6], header[7]]) as u64;

        if size < HEADER_SIZE || size > avail {
            // Corrupt cursor state; resynchronize at the producer position.
            self.data_tail.store(head, Ordering::Release);
            return Some(RingRecord::Malformed);
        }

        let record = if wrapped_tail + HEADER_SIZE > self.data_size() {
            RingRecord::WrappedHeader
        } else if wrapped_tail + size > self.data_size() {
            RingRecord::Wrapped
        } else {
            match record_type {
                RECORD_SAMPLE if size - HEADER_SIZE == SAMPLE_BODY_SIZE => {
                    let body = tail + HEADER_SIZE;
                    RingRecord::Sample(SampleRecord {
                        ip: self.read_u64(body),
                        time: self.read_u64(body + 8),
                        addr: self.read_u64(body + 16),
                    })
                }
                RECORD_SAMPLE => RingRecord::Malformed,
                RECORD_THROTTLE => RingRecord::Throttle,
                RECORD_UNTHROTTLE => RingRecord::Unthrottle,
                other => RingRecord::Unknown(other),
            }
        };
        self.data_tail.store(tail + size, Ordering::Release);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn sample(n: u64) -> SampleRecord {
        SampleRecord {
            ip: 0x400000 + n,
            time: 1000 + n,
            addr: 0x7f00_0000_0000 + n * 64,
        }
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(SampleRing::new(0, EventKind::FastRead, 1000).is_err());
        assert!(SampleRing::new(0, EventKind::FastRead, 16).is_err());
    }

    #[test]
    fn test_samples_and_control_records() {
        let ring = SampleRing::new(0, EventKind::SlowRead, 256).unwrap();
        assert!(ring.push_sample(sample(1)));
        assert!(ring.push_record(RECORD_THROTTLE, &[]));
        assert!(ring.push_record(RECORD_UNTHROTTLE, &[]));
        assert!(ring.push_record(42, &[0; 8]));

        assert_eq!(ring.next_record(), Some(RingRecord::Sample(sample(1))));
        assert_eq!(ring.next_record(), Some(RingRecord::Throttle));
        assert_eq!(ring.next_record(), Some(RingRecord::Unthrottle));
        assert_eq!(ring.next_record(), Some(RingRecord::Unknown(42)));
        assert_eq!(ring.next_record(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_record_straddling_boundary_is_dropped() {
        // 64-byte ring, 32-byte samples: an 8-byte pad shifts the third
        // sample across the boundary.
        let ring = SampleRing::new(0, EventKind::FastRead, 64).unwrap();
        assert!(ring.push_record(77, &[]));
        assert!(ring.push_sample(sample(1)));
        assert_eq!(ring.next_record(), Some(RingRecord::Unknown(77)));
        assert_eq!(ring.next_record(), Some(RingRecord::Sample(sample(1))));

        assert!(ring.push_sample(sample(2)));
        assert_eq!(ring.next_record(), Some(RingRecord::Wrapped));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_full_ring_counts_lost() {
        let ring = SampleRing::new(0, EventKind::FastRead, 64).unwrap();
        assert!(ring.push_sample(sample(1)));
        assert!(ring.push_sample(sample(2)));
        assert!(!ring.push_sample(sample(3)));
        assert_eq!(ring.lost(), 1);
    }

    struct CountingControl(Arc<AtomicUsize>);

    impl EventControl for CountingControl {
        fn reset(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_reset_counter_uses_control() {
        let resets = Arc::new(AtomicUsize::new(0));
        let ring = SampleRing::new(1, EventKind::FastRead, 128)
            .unwrap()
            .with_control(Box::new(CountingControl(Arc::clone(&resets))));
        ring.reset_counter().unwrap();
        assert_eq!(resets.load(Ordering::Relaxed), 1);
    }
}
