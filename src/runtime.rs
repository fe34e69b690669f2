// src/runtime.rs - Background threads: sampler, promoter, demoter, stats reporter
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use crate::error::Result;
use crate::migration::Scheduler;
use crate::sampling::{Classifier, SampleRing};
use crate::TierContext;

/// Cooperative stop signal. Sleeping loops are woken by dropping the
/// channel sender.
#[derive(Debug)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    wake: Mutex<Option<Sender<()>>>,
    sleeper: Receiver<()>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            cancelled: AtomicBool::new(false),
            wake: Mutex::new(Some(tx)),
            sleeper: rx,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleep up to `timeout`. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.sleeper.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }
}

/// Owns the background threads for one [`TierContext`].
#[derive(Debug)]
pub struct Runtime {
    ctx: Arc<TierContext>,
    token: Arc<CancellationToken>,
    rings: Sender<Arc<SampleRing>>,
    threads: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Spawn every worker. Rings can be attached now or later with
    /// [`attach_ring`](Self::attach_ring).
    pub fn start(ctx: Arc<TierContext>, rings: Vec<Arc<SampleRing>>) -> Result<Self> {
        let token = Arc::new(CancellationToken::new());
        let (ring_tx, ring_rx) = channel::unbounded();
        for ring in rings {
            // Receiver is alive; cannot fail.
            let _ = ring_tx.send(ring);
        }

        let mut runtime = Self {
            ctx: Arc::clone(&ctx),
            token: Arc::clone(&token),
            rings: ring_tx,
            threads: Vec::with_capacity(4),
        };

        let mut classifier = Classifier::new(Arc::clone(&ctx));
        runtime.spawn("tiermem-sampler", move |token| {
            run_sampler(&mut classifier, &ring_rx, token)
        })?;

        let scheduler = Scheduler::new(Arc::clone(&ctx));
        let promoter = scheduler.clone();
        runtime.spawn("tiermem-promote", move |token| promoter.run_promoter(token))?;
        runtime.spawn("tiermem-demote", move |token| scheduler.run_demoter(token))?;

        if ctx.config().stats_enabled || ctx.trace().is_enabled() {
            let reporter = Arc::clone(&ctx);
            runtime.spawn("tiermem-stats", move |token| run_reporter(&reporter, token))?;
        }

        log::info!("tiermem runtime started ({} threads)", runtime.threads.len());
        Ok(runtime)
    }

    fn spawn<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let token = Arc::clone(&self.token);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(&token))?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn context(&self) -> &Arc<TierContext> {
        &self.ctx
    }

    /// Hand a new sample ring to the sampler thread.
    pub fn attach_ring(&self, ring: Arc<SampleRing>) {
        if self.rings.send(ring).is_err() {
            log::warn!("sampler thread is gone; ring not attached");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop and join every worker, then flush traces.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.token.cancel();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("tiermem").to_string();
            if handle.join().is_err() {
                log::error!("{} panicked", name);
            }
        }
        if let Err(e) = self.ctx.trace().flush() {
            log::warn!("trace flush failed: {}", e);
        }
        log::info!("tiermem runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sampler(
    classifier: &mut Classifier,
    rings: &Receiver<Arc<SampleRing>>,
    token: &CancellationToken,
) {
    let backoff = Backoff::new();
    while !token.is_cancelled() {
        while let Ok(ring) = rings.try_recv() {
            classifier.attach(ring);
        }
        if classifier.poll() > 0 {
            backoff.reset();
        } else if backoff.is_completed() {
            token.wait_timeout(Duration::from_micros(100));
        } else {
            backoff.snooze();
        }
    }
    log::debug!("sampler stopped after {} rings", classifier.ring_count());
}

fn run_reporter(ctx: &TierContext, token: &CancellationToken) {
    let interval = ctx.config().stats_interval;
    loop {
        let cancelled = token.wait_timeout(interval);
        if ctx.config().stats_enabled {
            log::info!(target: "tiermem::stats", "{}", ctx.take_report());
        }
        match ctx.trace().flush() {
            Ok(0) => {}
            Ok(n) => log::trace!("flushed {} trace records", n),
            Err(e) => log::warn!("trace flush failed: {}", e),
        }
        if cancelled {
            break;
        }
    }
}
