//! Background reclaiming agent.

use crate::tree::Btree;
use cambium_common::{CacheConfig, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    passes: AtomicU64,
    evicted: AtomicU64,
}

/// A thread that evicts pages while the cache is over budget.
///
/// Stopped and joined when dropped.
#[derive(Debug)]
pub struct Evictor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Evictor {
    /// Starts the agent for `tree`.
    pub fn spawn(tree: Arc<Btree>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            cache_size = config.cache_size_bytes,
            batch = config.eviction_batch,
            "starting evictor"
        );
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("cambium-evict".to_string())
            .spawn(move || run(&tree, &config, &worker))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Passes run so far.
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }

    /// Pages evicted so far.
    pub fn evicted(&self) -> u64 {
        self.shared.evicted.load(Ordering::Relaxed)
    }

    /// Stops the agent and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::error!("evictor thread panicked");
            }
        }
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(tree: &Btree, config: &CacheConfig, shared: &Shared) {
    let interval = Duration::from_millis(config.eviction_interval_ms);
    while !shared.stop.load(Ordering::Acquire) {
        let used = tree.resident_bytes() as u64;
        if used > config.cache_size_bytes {
            shared.passes.fetch_add(1, Ordering::Relaxed);
            match tree.evict_pass(config.eviction_batch) {
                Ok(evicted) => {
                    shared.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
                    if evicted > 0 {
                        // Still over budget: go again without sleeping.
                        continue;
                    }
                }
                Err(e) => tracing::warn!(error = %e, used, "eviction pass failed"),
            }
        }
        thread::park_timeout(interval);
    }
}
