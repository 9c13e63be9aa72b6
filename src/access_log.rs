// =============================================
// Access log
// =============================================
// Writing an entry never fails the caller: a failed append is handed to a
// background task that retries a few times and then gives up loudly.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::GateResult;
use crate::model::AccessLogEntry;
use crate::store::AccessLogSink;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct AccessLog {
    sink: Arc<dyn AccessLogSink>,
}

impl AccessLog {
    pub fn new(sink: Arc<dyn AccessLogSink>) -> Self {
        Self { sink }
    }

    pub fn clamp_limit(limit: Option<usize>) -> usize {
        limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    /// Appends `entry`. When the first attempt fails the retry task's handle
    /// is returned; callers on the request path just drop it.
    pub async fn record(&self, entry: AccessLogEntry) -> Option<JoinHandle<()>> {
        match self.sink.append(&entry).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(
                    link_id = %entry.link_id,
                    access_type = entry.access_type.as_str(),
                    error = %e,
                    "access log append failed, retrying in background"
                );
                let sink = self.sink.clone();
                Some(tokio::spawn(retry_append(sink, entry)))
            }
        }
    }

    pub async fn for_link(
        &self,
        link_id: &str,
        limit: Option<usize>,
    ) -> GateResult<Vec<AccessLogEntry>> {
        self.sink
            .query_by_link(link_id, Self::clamp_limit(limit))
            .await
    }

    pub async fn for_account(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> GateResult<Vec<AccessLogEntry>> {
        self.sink
            .query_by_account(account_id, Self::clamp_limit(limit))
            .await
    }

    pub async fn prune(&self, older_than: DateTime<Utc>) -> GateResult<u64> {
        self.sink.prune_older_than(older_than).await
    }
}

async fn retry_append(sink: Arc<dyn AccessLogSink>, entry: AccessLogEntry) {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        tokio::time::sleep(delay).await;
        match sink.append(&entry).await {
            Ok(()) => {
                tracing::info!(link_id = %entry.link_id, attempt, "access log append recovered");
                return;
            }
            Err(e) => {
                tracing::warn!(link_id = %entry.link_id, attempt, error = %e, "access log retry failed");
                delay *= 2;
            }
        }
    }
    tracing::error!(
        link_id = %entry.link_id,
        access_type = entry.access_type.as_str(),
        accessed_at = %entry.accessed_at,
        "access log entry dropped"
    );
}
