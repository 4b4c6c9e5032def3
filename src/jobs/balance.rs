//! Balance reconciler
//!
//! Periodically compares each pinning address's storage usage against its
//! balance and flags overage files (least recently touched first) with a
//! deletion time. Pure bookkeeping: actual removal stays with the garbage
//! collector once the pins drop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::context::NodeContext;
use crate::db::balances::{addresses_with_pins, total_balance};
use crate::db::files::{files_by_lru, schedule_delete, usage_for_address};
use crate::db::unix_now;
use crate::error::NodeError;

const MIB: f64 = 1024.0 * 1024.0;

/// Bytes of storage one token pays for.
const BYTES_PER_TOKEN: f64 = 3.0 * MIB;

pub struct BalanceReconciler {
    ctx: Arc<NodeContext>,
}

impl BalanceReconciler {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.ctx.config.balances.interval_secs);
        info!(interval_secs = interval.as_secs(), "Balance reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.reconcile_once(unix_now()) {
                        Ok(flagged) if flagged > 0 => {
                            info!(flagged, "Balance pass flagged overage files");
                        }
                        Ok(_) => debug!("Balance pass: all addresses within budget"),
                        Err(e) => error!(error = %e, "Balance pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Balance reconciler stopping");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass. Returns how many files were flagged.
    pub fn reconcile_once(&self, now: i64) -> Result<u64, NodeError> {
        let free_allowance = self.ctx.config.storage.free_storage_limit_bytes;
        let grace = self.ctx.config.storage.grace_period_secs as i64;

        self.ctx.db.with_conn(|conn| {
            let mut flagged = 0u64;

            for address in addresses_with_pins(conn)? {
                let usage = usage_for_address(conn, &address)?;
                let balance = total_balance(conn, &address)?;
                let allowed = free_allowance + (balance * BYTES_PER_TOKEN) as u64;
                if usage <= allowed {
                    continue;
                }

                debug!(
                    address = %address,
                    usage,
                    allowed,
                    "Address over storage budget"
                );

                let mut excess = usage - allowed;
                for file in files_by_lru(conn, &address)? {
                    if excess == 0 {
                        break;
                    }
                    if file.pin_delete_at.is_some() {
                        continue;
                    }
                    schedule_delete(conn, &file.file_hash, now + grace)?;
                    flagged += 1;
                    excess = excess.saturating_sub(file.size);
                }
            }

            Ok(flagged)
        })
    }
}
