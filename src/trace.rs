// src/trace.rs - Optional binary traces of samples, predictions and migrations
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::clock::now_ns;
use crate::error::Result;

/// Size of one encoded record: `{cyc: u64, va: u64, ip: u64, cpu: u32, evt: u8}`.
pub const TRACE_RECORD_SIZE: usize = 29;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStream {
    Samples,
    Predictions,
    Promotions,
    Demotions,
}

impl TraceStream {
    const ALL: [TraceStream; 4] = [
        TraceStream::Samples,
        TraceStream::Predictions,
        TraceStream::Promotions,
        TraceStream::Demotions,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            TraceStream::Samples => "samples.bin",
            TraceStream::Predictions => "preds.bin",
            TraceStream::Promotions => "mig.bin",
            TraceStream::Demotions => "cold.bin",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub cyc: u64,
    pub va: u64,
    pub ip: u64,
    pub cpu: u32,
    pub evt: u8,
}

impl TraceRecord {
    /// Record stamped with the current time.
    pub fn now(va: u64) -> Self {
        Self {
            cyc: now_ns(),
            va,
            ip: 0,
            cpu: 0,
            evt: 0,
        }
    }

    pub fn encode(&self) -> [u8; TRACE_RECORD_SIZE] {
        let mut out = [0u8; TRACE_RECORD_SIZE];
        out[0..8].copy_from_slice(&self.cyc.to_le_bytes());
        out[8..16].copy_from_slice(&self.va.to_le_bytes());
        out[16..24].copy_from_slice(&self.ip.to_le_bytes());
        out[24..28].copy_from_slice(&self.cpu.to_le_bytes());
        out[28] = self.evt;
        out
    }
}

/// Lock-free record buffers drained to files by the stats thread. When
/// disabled every `record` is a no-op.
#[derive(Debug)]
pub struct TraceRecorder {
    queues: Option<[SegQueue<TraceRecord>; 4]>,
    files: Mutex<Vec<BufWriter<File>>>,
}

impl TraceRecorder {
    pub fn disabled() -> Self {
        Self {
            queues: None,
            files: Mutex::new(Vec::new()),
        }
    }

    /// Create one trace file per stream inside `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut files = Vec::with_capacity(TraceStream::ALL.len());
        for stream in TraceStream::ALL {
            files.push(BufWriter::new(File::create(dir.join(stream.file_name()))?));
        }
        log::info!("Recording traces to {}", dir.display());
        Ok(Self {
            queues: Some([
                SegQueue::new(),
                SegQueue::new(),
                SegQueue::new(),
                SegQueue::new(),
            ]),
            files: Mutex::new(files),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.queues.is_some()
    }

    pub fn record(&self, stream: TraceStream, record: TraceRecord) {
        if let Some(queues) = &self.queues {
            queues[stream.index()].push(record);
        }
    }

    /// Write out everything buffered so far. Returns the records written.
    pub fn flush(&self) -> Result<usize> {
        let queues = match &self.queues {
            Some(queues) => queues,
            None => return Ok(0),
        };
        let mut files = self.files.lock();
        let mut written = 0;
        for stream in TraceStream::ALL {
            let file = &mut files[stream.index()];
            while let Some(record) = queues[stream.index()].pop() {
                file.write_all(&record.encode())?;
                written += 1;
            }
            file.flush()?;
        }
        Ok(written)
    }
}
