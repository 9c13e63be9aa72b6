// =============================================
// Client signals & suspicion policy
// =============================================
// Every check here runs on facts observed in the requester's browser, so the
// whole report is untrusted telemetry. The server reads it through
// `SignalPolicy::verdict` after overriding whatever it can derive itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use url::Url;

use crate::ticket::{GateTicket, TicketError};

/// Hard ceiling of the suspicion score.
pub const MAX_SCORE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Check {
    Referrer,
    Script,
    Timing,
    Token,
    Tooling,
    Integrity,
    SessionReuse,
}

impl Check {
    pub const ALL: [Check; 7] = [
        Check::Referrer,
        Check::Script,
        Check::Timing,
        Check::Token,
        Check::Tooling,
        Check::Integrity,
        Check::SessionReuse,
    ];

    /// Key used in a report's `checks` map.
    pub fn name(&self) -> &'static str {
        match self {
            Check::Referrer => "referrer",
            Check::Script => "javascript",
            Check::Timing => "timing",
            Check::Token => "token",
            Check::Tooling => "devtools",
            Check::Integrity => "integrity",
            Check::SessionReuse => "oneTimeUse",
        }
    }

    pub fn from_name(s: &str) -> Option<Check> {
        let s = s.trim();
        Check::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One way a check can fail; each kind carries its own weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failure {
    NoReferrer,
    ForeignReferrer,
    StorageUnavailable,
    StorageNotWritable,
    MissingLinkId,
    RevisitTooSoon,
    TicketMissing,
    TicketMismatch,
    TicketExpired,
    TicketUndecodable,
    ToolingDetected,
    LandmarksMissing,
    UsedInSession,
}

impl Failure {
    pub const ALL: [Failure; 13] = [
        Failure::NoReferrer,
        Failure::ForeignReferrer,
        Failure::StorageUnavailable,
        Failure::StorageNotWritable,
        Failure::MissingLinkId,
        Failure::RevisitTooSoon,
        Failure::TicketMissing,
        Failure::TicketMismatch,
        Failure::TicketExpired,
        Failure::TicketUndecodable,
        Failure::ToolingDetected,
        Failure::LandmarksMissing,
        Failure::UsedInSession,
    ];

    pub fn check(&self) -> Check {
        match self {
            Failure::NoReferrer | Failure::ForeignReferrer => Check::Referrer,
            Failure::StorageUnavailable | Failure::StorageNotWritable => Check::Script,
            Failure::MissingLinkId | Failure::RevisitTooSoon => Check::Timing,
            Failure::TicketMissing
            | Failure::TicketMismatch
            | Failure::TicketExpired
            | Failure::TicketUndecodable => Check::Token,
            Failure::ToolingDetected => Check::Tooling,
            Failure::LandmarksMissing => Check::Integrity,
            Failure::UsedInSession => Check::SessionReuse,
        }
    }

    /// Configuration key, as used in `SIGNAL_WEIGHTS`.
    pub fn key(&self) -> &'static str {
        match self {
            Failure::NoReferrer => "no_referrer",
            Failure::ForeignReferrer => "foreign_referrer",
            Failure::StorageUnavailable => "storage_unavailable",
            Failure::StorageNotWritable => "storage_not_writable",
            Failure::MissingLinkId => "missing_link_id",
            Failure::RevisitTooSoon => "revisit_too_soon",
            Failure::TicketMissing => "ticket_missing",
            Failure::TicketMismatch => "ticket_mismatch",
            Failure::TicketExpired => "ticket_expired",
            Failure::TicketUndecodable => "ticket_undecodable",
            Failure::ToolingDetected => "tooling_detected",
            Failure::LandmarksMissing => "landmarks_missing",
            Failure::UsedInSession => "used_in_session",
        }
    }

    pub fn from_key(s: &str) -> Option<Failure> {
        let s = s.trim();
        Failure::ALL.into_iter().find(|f| f.key() == s)
    }
}

impl From<TicketError> for Failure {
    fn from(e: TicketError) -> Self {
        match e {
            TicketError::Malformed | TicketError::BadSignature => Failure::TicketUndecodable,
            TicketError::LinkMismatch => Failure::TicketMismatch,
            TicketError::Expired => Failure::TicketExpired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalWeights(BTreeMap<&'static str, u32>);

impl Default for SignalWeights {
    fn default() -> Self {
        let mut w = BTreeMap::new();
        for f in Failure::ALL {
            let v = match f {
                Failure::NoReferrer => 30,
                Failure::ForeignReferrer => 40,
                Failure::StorageUnavailable => 20,
                Failure::StorageNotWritable => 25,
                Failure::MissingLinkId => 50,
                Failure::RevisitTooSoon => 35,
                Failure::TicketMissing => 50,
                Failure::TicketMismatch => 60,
                Failure::TicketExpired => 40,
                Failure::TicketUndecodable => 70,
                Failure::ToolingDetected => 15,
                Failure::LandmarksMissing => 25,
                Failure::UsedInSession => 50,
            };
            w.insert(f.key(), v);
        }
        Self(w)
    }
}

impl SignalWeights {
    pub fn of(&self, failure: Failure) -> u32 {
        self.0.get(failure.key()).copied().unwrap_or(0)
    }

    pub fn set(&mut self, failure: Failure, weight: u32) {
        self.0.insert(failure.key(), weight);
    }

    /// Weight charged for a failed check when only the pass/fail bit is known:
    /// the lightest of that check's failure kinds.
    pub fn for_check(&self, check: Check) -> u32 {
        Failure::ALL
            .into_iter()
            .filter(|f| f.check() == check)
            .map(|f| self.of(f))
            .min()
            .unwrap_or(0)
    }

    /// Applies `kind=weight` pairs; unknown kinds and bad numbers are skipped.
    pub fn apply_overrides(&mut self, raw: &str) {
        for pair in raw.split(',') {
            let Some((k, v)) = pair.split_once('=') else {
                continue;
            };
            match (Failure::from_key(k), v.trim().parse::<u32>()) {
                (Some(f), Ok(w)) => self.set(f, w),
                _ => tracing::warn!(pair = %pair.trim(), "ignoring signal weight override"),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalPolicy {
    pub weights: SignalWeights,
    /// Deny when the score is strictly greater than this.
    pub threshold: u32,
    pub critical: BTreeSet<Check>,
    pub allowed_referrers: Vec<String>,
    pub revisit_cooldown: Duration,
    pub ticket_max_age: Duration,
    pub tooling_dimension_threshold: u32,
    pub debugger_pause_threshold_ms: u64,
    pub landmarks: Vec<String>,
}

pub const DEFAULT_ALLOWED_REFERRERS: [&str; 9] = [
    "shrinkme.io",
    "shrinkme.us",
    "exe.io",
    "exey.io",
    "linkvertise.com",
    "link-to.net",
    "shorte.st",
    "ouo.io",
    "ouo.press",
];

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            threshold: 50,
            critical: BTreeSet::from([Check::Referrer, Check::Script, Check::Token]),
            allowed_referrers: DEFAULT_ALLOWED_REFERRERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            revisit_cooldown: Duration::seconds(5),
            ticket_max_age: Duration::hours(24),
            tooling_dimension_threshold: 160,
            debugger_pause_threshold_ms: 100,
            landmarks: vec![
                "countdown-display".into(),
                "security-checks".into(),
                "protection-script".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow { score: u32 },
    CriticalFailed(Check),
    ThresholdExceeded { score: u32 },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }
}

impl SignalPolicy {
    /// Matches the referrer's host against the allow-list, subdomains included.
    pub fn referrer_allowed(&self, referrer: &str) -> bool {
        let raw = referrer.trim().to_ascii_lowercase();
        let host = match Url::parse(&raw) {
            Ok(u) => u.host_str().map(str::to_string),
            Err(_) => raw.split('/').next().map(str::to_string),
        };
        let Some(host) = host.filter(|h| !h.is_empty()) else {
            return false;
        };
        self.allowed_referrers.iter().any(|d| {
            let d = d.trim().to_ascii_lowercase();
            host == d || host.ends_with(&format!(".{d}"))
        })
    }

    pub fn check_referrer(&self, referrer: Option<&str>) -> Result<(), Failure> {
        match referrer.map(str::trim).filter(|r| !r.is_empty()) {
            None => Err(Failure::NoReferrer),
            Some(r) if self.referrer_allowed(r) => Ok(()),
            Some(_) => Err(Failure::ForeignReferrer),
        }
    }

    /// Score from pass/fail bits alone. A check absent from the map adds nothing.
    pub fn score(&self, checks: &BTreeMap<String, bool>) -> u32 {
        let sum: u32 = Check::ALL
            .into_iter()
            .filter(|c| checks.get(c.name()) == Some(&false))
            .map(|c| self.weights.for_check(c))
            .sum();
        sum.min(MAX_SCORE)
    }

    /// Critical checks fail closed: a critical check missing from the report
    /// counts as failed.
    pub fn verdict(&self, report: &ClientSignalReport) -> Verdict {
        for check in Check::ALL {
            if self.critical.contains(&check) && report.passed(check) != Some(true) {
                return Verdict::CriticalFailed(check);
            }
        }
        if report.suspicion_score > self.threshold {
            return Verdict::ThresholdExceeded {
                score: report.suspicion_score,
            };
        }
        Verdict::Allow {
            score: report.suspicion_score,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSignalReport {
    pub checks: BTreeMap<String, bool>,
    pub suspicion_score: u32,
    #[serde(default)]
    pub log: Vec<String>,
}

impl ClientSignalReport {
    pub fn passed(&self, check: Check) -> Option<bool> {
        self.checks.get(check.name()).copied()
    }

    pub fn set(&mut self, check: Check, passed: bool) {
        self.checks.insert(check.name().to_string(), passed);
    }

    pub fn failed_checks(&self) -> Vec<Check> {
        Check::ALL
            .into_iter()
            .filter(|c| self.passed(*c) == Some(false))
            .collect()
    }
}

/// What the gate page observed during one load.
#[derive(Debug, Clone)]
pub struct Observations {
    pub now: DateTime<Utc>,
    pub link_id: Option<String>,
    pub referrer: Option<String>,
    pub storage_available: bool,
    pub storage_writable: bool,
    /// Previous visit to this link id, from local storage.
    pub last_visit: Option<DateTime<Utc>>,
    pub ticket: Option<String>,
    pub outer_size: (u32, u32),
    pub inner_size: (u32, u32),
    pub debugger_pause_ms: u64,
    pub landmarks_present: Vec<String>,
    pub used_in_session: bool,
}

impl Observations {
    /// A clean page load: every check would pass.
    pub fn clean(now: DateTime<Utc>, link_id: &str, ticket: &str, referrer: &str) -> Self {
        Self {
            now,
            link_id: Some(link_id.to_string()),
            referrer: Some(referrer.to_string()),
            storage_available: true,
            storage_writable: true,
            last_visit: None,
            ticket: Some(ticket.to_string()),
            outer_size: (1280, 800),
            inner_size: (1280, 720),
            debugger_pause_ms: 0,
            landmarks_present: SignalPolicy::default().landmarks,
            used_in_session: false,
        }
    }
}

type CheckOutcome = Result<String, (Failure, String)>;

/// Runs every check once against a set of observations.
pub struct Collector<'a> {
    policy: &'a SignalPolicy,
}

impl<'a> Collector<'a> {
    pub fn new(policy: &'a SignalPolicy) -> Self {
        Self { policy }
    }

    pub fn collect(&self, obs: &Observations) -> ClientSignalReport {
        let mut report = ClientSignalReport::default();
        let mut sum = 0u32;

        for check in Check::ALL {
            let outcome = match check {
                Check::Referrer => self.referrer(obs),
                Check::Script => self.script(obs),
                Check::Timing => self.timing(obs),
                Check::Token => self.token(obs),
                Check::Tooling => self.tooling(obs),
                Check::Integrity => self.integrity(obs),
                Check::SessionReuse => self.session(obs),
            };
            match outcome {
                Ok(msg) => {
                    report.set(check, true);
                    report.log.push(format!("ok {check}: {msg}"));
                }
                Err((failure, msg)) => {
                    let w = self.policy.weights.of(failure);
                    sum = sum.saturating_add(w);
                    report.set(check, false);
                    report.log.push(format!("SUSPICIOUS {check} (+{w}): {msg}"));
                }
            }
        }

        report.suspicion_score = sum.min(MAX_SCORE);
        report.log.push(format!(
            "suspicion score {}/{}",
            report.suspicion_score, MAX_SCORE
        ));
        report
    }

    fn referrer(&self, obs: &Observations) -> CheckOutcome {
        match self.policy.check_referrer(obs.referrer.as_deref()) {
            Ok(()) => Ok(format!(
                "valid referrer {}",
                obs.referrer.as_deref().unwrap_or_default()
            )),
            Err(f @ Failure::NoReferrer) => Err((f, "no referrer".into())),
            Err(f) => Err((
                f,
                format!(
                    "referrer not allowed: {}",
                    obs.referrer.as_deref().unwrap_or_default()
                ),
            )),
        }
    }

    fn script(&self, obs: &Observations) -> CheckOutcome {
        if !obs.storage_available {
            return Err((Failure::StorageUnavailable, "storage APIs unavailable".into()));
        }
        if !obs.storage_writable {
            return Err((Failure::StorageNotWritable, "cannot write to storage".into()));
        }
        Ok("script execution verified".into())
    }

    fn timing(&self, obs: &Observations) -> CheckOutcome {
        if obs.link_id.as_deref().map_or(true, str::is_empty) {
            return Err((Failure::MissingLinkId, "no link id".into()));
        }
        if let Some(last) = obs.last_visit {
            let since = obs.now - last;
            if since < self.policy.revisit_cooldown {
                return Err((
                    Failure::RevisitTooSoon,
                    format!("revisited after {} ms", since.num_milliseconds()),
                ));
            }
        }
        Ok("timing ok".into())
    }

    fn token(&self, obs: &Observations) -> CheckOutcome {
        let (Some(link_id), Some(ticket)) = (obs.link_id.as_deref(), obs.ticket.as_deref())
        else {
            return Err((Failure::TicketMissing, "missing link id or ticket".into()));
        };
        let decoded = GateTicket::decode_unverified(ticket)
            .map_err(|e| (Failure::from(e), e.to_string()))?;
        decoded
            .check(link_id, obs.now, self.policy.ticket_max_age)
            .map_err(|e| (Failure::from(e), e.to_string()))?;
        Ok("ticket decodes and matches".into())
    }

    fn tooling(&self, obs: &Observations) -> CheckOutcome {
        let limit = self.policy.tooling_dimension_threshold;
        let dw = obs.outer_size.0.saturating_sub(obs.inner_size.0);
        let dh = obs.outer_size.1.saturating_sub(obs.inner_size.1);
        if dw > limit || dh > limit {
            return Err((
                Failure::ToolingDetected,
                format!("window delta {dw}x{dh}"),
            ));
        }
        if obs.debugger_pause_ms > self.policy.debugger_pause_threshold_ms {
            return Err((
                Failure::ToolingDetected,
                format!("debugger pause {} ms", obs.debugger_pause_ms),
            ));
        }
        Ok("no inspection tooling".into())
    }

    fn integrity(&self, obs: &Observations) -> CheckOutcome {
        let missing: Vec<&str> = self
            .policy
            .landmarks
            .iter()
            .filter(|id| !obs.landmarks_present.contains(id))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok("page landmarks present".into())
        } else {
            Err((
                Failure::LandmarksMissing,
                format!("missing {}", missing.join(", ")),
            ))
        }
    }

    // Best-effort only: session storage belongs to the client.
    fn session(&self, obs: &Observations) -> CheckOutcome {
        if obs.used_in_session {
            Err((Failure::UsedInSession, "link already used this session".into()))
        } else {
            Ok("first use this session".into())
        }
    }
}
