//! Background reclamation daemon
//!
//! Runs in a background thread and periodically sweeps every eligible root
//! with a collect pass. Graceful shutdown via an atomic flag; the sleep is
//! chopped into short intervals so shutdown is picked up promptly.

use crate::service::SnapshotService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Background collect-pass loop.
pub struct CollectorDaemon {
    service: Arc<SnapshotService>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl CollectorDaemon {
    /// Create a daemon sweeping all roots every `interval`.
    pub fn new(service: Arc<SnapshotService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background thread. The thread runs until `shutdown()`.
    pub fn start(&self) -> JoinHandle<()> {
        let service = Arc::clone(&self.service);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                // sleep first so a fresh daemon does not race its setup;
                // short sub-sleeps keep shutdown responsive
                let sleep_interval = Duration::from_millis(100).min(interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(sleep_interval);
                    elapsed += sleep_interval;
                }

                service.collect_all();
            }
        })
    }

    /// Signal shutdown; the thread exits at its next check.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
