//! Recurring maintenance jobs.
//!
//! Three timers run until shutdown: memory GC (12 h), blacklist sweep
//! (10 m), and AI graph cleanup (4 h, bounded users per run). Each job
//! catches and logs its own failures; one bad pass never stops the loop.
//! First firings happen one full period after start so a restart storm
//! doesn't trigger every job at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{error, info};

use aika_core::config::SchedulerConfig;
use aika_graph::GraphCleaner;
use aika_guard::TempBlacklist;
use aika_memory::MemoryGc;

pub struct Scheduler {
    config: SchedulerConfig,
    gc: Arc<MemoryGc>,
    blacklist: Arc<TempBlacklist>,
    cleaner: Arc<GraphCleaner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        gc: Arc<MemoryGc>,
        blacklist: Arc<TempBlacklist>,
        cleaner: Arc<GraphCleaner>,
    ) -> Self {
        Self {
            config,
            gc,
            blacklist,
            cleaner,
        }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let gc_period = Duration::from_secs(self.config.memory_gc_hours * 3600);
        let sweep_period = Duration::from_secs(self.config.blacklist_sweep_minutes * 60);
        let graph_period = Duration::from_secs(self.config.graph_cleanup_hours * 3600);

        let mut gc_timer = interval_at(Instant::now() + gc_period, gc_period);
        let mut sweep_timer = interval_at(Instant::now() + sweep_period, sweep_period);
        let mut graph_timer = interval_at(Instant::now() + graph_period, graph_period);

        info!(
            gc_hours = self.config.memory_gc_hours,
            sweep_minutes = self.config.blacklist_sweep_minutes,
            graph_hours = self.config.graph_cleanup_hours,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = gc_timer.tick() => {
                    let results = self.gc.gc_all_users().await;
                    let errors = results.iter().filter(|r| r.error.is_some()).count();
                    info!(users = results.len(), errors, "scheduled memory GC pass done");
                }
                _ = sweep_timer.tick() => {
                    match self.blacklist.cleanup_expired() {
                        Ok(swept) => {
                            if swept > 0 {
                                info!(swept, "scheduled blacklist sweep done");
                            }
                        }
                        Err(e) => error!("blacklist sweep failed: {e}"),
                    }
                }
                _ = graph_timer.tick() => {
                    match self.cleaner.cleanup_users(self.config.graph_users_per_run).await {
                        Ok(outcome) => info!(
                            merged = outcome.merged,
                            deleted = outcome.deleted,
                            "scheduled graph cleanup done"
                        ),
                        Err(e) => error!("graph cleanup failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
