//! Reservation sweeper — background reaper for abandoned holds.
//!
//! A reservation never committed or released within its TTL would otherwise
//! pin `pending` credits until midnight. The sweeper releases lapsed
//! reservations on an interval so a crashed caller cannot strand quota.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::ledger::BudgetLedger;

/// Configuration for the reservation sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweep passes (default: 60s)
    pub sweep_interval_secs: u64,
    /// Maximum reservations to reap per pass (default: 100)
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            batch_size: 100,
        }
    }
}

/// Sweeper statistics
#[derive(Debug, Clone, Default)]
pub struct SweeperStats {
    pub passes: u64,
    pub reservations_reaped: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct ReservationSweeper {
    config: SweeperConfig,
    ledger: Arc<BudgetLedger>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<SweeperStats>>,
}

impl ReservationSweeper {
    pub fn new(config: SweeperConfig, ledger: Arc<BudgetLedger>) -> Self {
        Self {
            config,
            ledger,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(SweeperStats::default())),
        }
    }

    pub fn with_defaults(ledger: Arc<BudgetLedger>) -> Self {
        Self::new(SweeperConfig::default(), ledger)
    }

    /// Run one sweep pass immediately.
    pub async fn sweep_once(&self) -> usize {
        let reaped = match self
            .ledger
            .release_expired(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(reaped) => reaped,
            Err(e) => {
                error!("sweep pass failed: {}", e);
                let mut stats = self.stats.write().await;
                stats.last_error = Some(e.to_string());
                return 0;
            }
        };

        let mut stats = self.stats.write().await;
        stats.passes += 1;
        stats.reservations_reaped += reaped as u64;
        stats.last_run = Some(Utc::now());
        if reaped > 0 {
            info!(reaped, "sweep pass reaped expired reservations");
        } else {
            debug!("sweep pass found nothing to reap");
        }
        reaped
    }

    /// Spawn the sweep loop. Returns the task handle; call `stop()` to end it.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let sweeper = self.clone();

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(sweeper.config.sweep_interval_secs));
            info!(
                interval_secs = sweeper.config.sweep_interval_secs,
                "reservation sweeper started"
            );

            while sweeper.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !sweeper.running.load(Ordering::SeqCst) {
                    break;
                }
                sweeper.sweep_once().await;
            }

            info!("reservation sweeper stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> SweeperStats {
        self.stats.read().await.clone()
    }
}
