// =============================================
// Retention sweep
// =============================================
// Out-of-band storage hygiene. Validation never depends on it having run.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::access_log::AccessLog;
use crate::config::GateConfig;
use crate::error::GateResult;
use crate::store::TokenStore;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub tokens_deleted: u64,
    pub logs_pruned: u64,
}

/// Deletes tokens expired for longer than the token retention and log rows
/// older than the log retention.
pub async fn sweep(
    tokens: &dyn TokenStore,
    log: &AccessLog,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> GateResult<SweepReport> {
    let tokens_deleted = tokens
        .delete_expired_older_than(cutoff(now, cfg.token_retention))
        .await?;
    let logs_pruned = log.prune(cutoff(now, cfg.log_retention)).await?;

    tracing::info!(tokens_deleted, logs_pruned, "sweep finished");
    Ok(SweepReport {
        tokens_deleted,
        logs_pruned,
    })
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
