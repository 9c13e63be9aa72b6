// =============================================
// Token validation
// =============================================
// Steps short-circuit in order:
//   1. token lookup (unknown, used, expired or bound to another link)
//   2. link lookup (unknown or inactive)
//   3. signal screening (critical checks, then the suspicion threshold)
//   4. compare-and-set consumption of the token
//   5. best-effort access counter increment
//   6. success log entry
//
// Every denial writes exactly one `blocked` entry. Storage failures are not
// denials: they surface as `GateError::StorageUnavailable` and write nothing.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::access_log::AccessLog;
use crate::clock::Clock;
use crate::config::GateConfig;
use crate::error::{GateError, GateResult, Subject};
use crate::model::{AccessLogEntry, AccessType, RequestMeta, ValidateReq};
use crate::signals::{Check, ClientSignalReport, Verdict};
use crate::store::{LinkStore, TokenStore};
use crate::ticket::GateTicket;
use crate::util::token_prefix;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed { destination: String },
    Denied(GateError),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Decision::Allowed { .. } => 200,
            Decision::Denied(e) => e.http_status(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Decision::Allowed { destination } => json!({
                "allowed": true,
                "destination": destination,
            }),
            Decision::Denied(e) => json!({
                "allowed": false,
                "reason": e.public_reason(),
            }),
        }
    }
}

pub struct ValidationEngine {
    links: Arc<dyn LinkStore>,
    tokens: Arc<dyn TokenStore>,
    log: AccessLog,
    clock: Arc<dyn Clock>,
    cfg: Arc<GateConfig>,
}

impl ValidationEngine {
    pub fn new(
        links: Arc<dyn LinkStore>,
        tokens: Arc<dyn TokenStore>,
        log: AccessLog,
        clock: Arc<dyn Clock>,
        cfg: Arc<GateConfig>,
    ) -> Self {
        Self {
            links,
            tokens,
            log,
            clock,
            cfg,
        }
    }

    pub async fn validate(&self, req: &ValidateReq, meta: &RequestMeta) -> GateResult<Decision> {
        if req.token.trim().is_empty() || req.link_id.trim().is_empty() {
            return Err(GateError::InvalidInput(
                "token and link_id are required".into(),
            ));
        }

        let now = self.clock.now();
        // the page reports document.referrer; the header is the page itself
        let meta = RequestMeta {
            referrer: non_empty(req.referrer.as_deref())
                .or(non_empty(meta.referrer.as_deref()))
                .map(str::to_string),
            ..meta.clone()
        };

        match self.decide(req, &meta, now).await {
            Ok(destination) => {
                tracing::info!(
                    link_id = %req.link_id,
                    token = %token_prefix(&req.token),
                    "access granted"
                );
                let _ = self
                    .log
                    .record(entry(req, &meta, now, AccessType::Success, None))
                    .await;
                Ok(Decision::Allowed { destination })
            }
            Err(e) if e.is_denial() => {
                tracing::info!(
                    link_id = %req.link_id,
                    token = %token_prefix(&req.token),
                    kind = e.kind(),
                    detail = %e,
                    "access denied"
                );
                let reason = e.public_reason();
                let _ = self
                    .log
                    .record(entry(req, &meta, now, AccessType::Blocked, Some(reason)))
                    .await;
                Ok(Decision::Denied(e))
            }
            Err(e) => {
                tracing::error!(
                    link_id = %req.link_id,
                    token = %token_prefix(&req.token),
                    error = %e,
                    "validation failed"
                );
                Err(e)
            }
        }
    }

    async fn decide(
        &self,
        req: &ValidateReq,
        meta: &RequestMeta,
        now: DateTime<Utc>,
    ) -> GateResult<String> {
        let token = self
            .tokens
            .find_by_value(&req.token)
            .await?
            .ok_or(GateError::NotFound(Subject::Token))?;
        if token.is_used {
            return Err(GateError::AlreadyUsed);
        }
        if token.is_expired(now) {
            return Err(GateError::Expired);
        }
        if token.link_id != req.link_id {
            return Err(GateError::LinkMismatch);
        }

        let link = self
            .links
            .get(&req.link_id)
            .await?
            .ok_or(GateError::NotFound(Subject::Link))?;
        if !link.is_active {
            return Err(GateError::LinkInactive);
        }

        self.screen(req, meta, now)?;

        let rows = self
            .tokens
            .compare_and_set_used(
                &token.value,
                now,
                meta.user_agent.as_deref(),
                meta.ip_address.as_deref(),
            )
            .await?;
        if rows == 0 {
            // a concurrent request won the write
            return Err(GateError::AlreadyUsed);
        }

        if let Err(e) = self.links.increment_access_count(&link.link_id).await {
            tracing::warn!(link_id = %link.link_id, error = %e, "access count increment failed");
        }

        Ok(link.destination_url)
    }

    /// Server view of the client report: the referrer and the ticket are
    /// re-derived here, and the score is recomputed from the server's weights.
    fn screen(&self, req: &ValidateReq, meta: &RequestMeta, now: DateTime<Utc>) -> GateResult<()> {
        let policy = &self.cfg.signals;
        let mut view = req.report.clone().unwrap_or_else(|| {
            let mut r = ClientSignalReport::default();
            r.set(Check::Script, false);
            r
        });

        if let Some(r) = req.referrer.as_deref().filter(|r| !r.trim().is_empty()) {
            view.set(Check::Referrer, policy.check_referrer(Some(r)).is_ok());
        }

        let ticket_ok = match req.ticket.as_deref() {
            Some(t) => GateTicket::verify(
                t,
                &self.cfg.ticket_key,
                &req.link_id,
                now,
                policy.ticket_max_age,
            )
            .map_err(|e| tracing::debug!(link_id = %req.link_id, error = %e, "ticket rejected"))
            .is_ok(),
            None => false,
        };
        view.set(Check::Token, ticket_ok);

        let client_score = view.suspicion_score;
        view.suspicion_score = policy.score(&view.checks);
        tracing::debug!(
            link_id = %req.link_id,
            referrer = ?meta.referrer,
            client_score,
            score = view.suspicion_score,
            failed = ?view.failed_checks(),
            "signals screened"
        );

        match policy.verdict(&view) {
            Verdict::Allow { .. } => Ok(()),
            Verdict::CriticalFailed(check) => Err(GateError::CriticalCheckFailed(check)),
            Verdict::ThresholdExceeded { score } => {
                Err(GateError::SuspicionThresholdExceeded { score })
            }
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn entry(
    req: &ValidateReq,
    meta: &RequestMeta,
    at: DateTime<Utc>,
    access_type: AccessType,
    reason: Option<String>,
) -> AccessLogEntry {
    AccessLogEntry {
        link_id: req.link_id.clone(),
        token: req.token.clone(),
        access_type,
        reason,
        referrer: meta.referrer.clone(),
        user_agent: meta.user_agent.clone(),
        ip_address: meta.ip_address.clone(),
        accessed_at: at,
    }
}
