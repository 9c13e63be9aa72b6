use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signals::ClientSignalReport;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Link {
    pub link_id: String,
    pub destination_url: String,
    pub owner_id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Which shortener the owner routes this link through.
    #[serde(default)]
    pub source_label: Option<String>,
    pub is_active: bool,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Token {
    pub value: String,
    pub link_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_by_user_agent: Option<String>,
    #[serde(default)]
    pub used_by_ip: Option<String>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Success,
    Blocked,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Success => "success",
            AccessType::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AccessType::Success),
            "blocked" => Some(AccessType::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AccessLogEntry {
    pub link_id: String,
    pub token: String,
    pub access_type: AccessType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub accessed_at: DateTime<Utc>,
}

/// Request-scoped facts shared by every log entry written for one validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMeta {
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

// ---- HTTP payloads ----

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateLinkReq {
    pub destination_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source_label: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UpdateLinkReq {
    #[serde(default)]
    pub destination_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source_label: Option<String>,
}

impl UpdateLinkReq {
    pub fn is_empty(&self) -> bool {
        self.destination_url.is_none() && self.title.is_none() && self.source_label.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct IssueTokenReq {
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub link_id: String,
    pub expires_at: DateTime<Utc>,
    pub ticket: String,
    pub gate_url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValidateReq {
    pub token: String,
    pub link_id: String,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub report: Option<ClientSignalReport>,
}

/// Public view of a link for the gate page; carries no destination.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LinkMetadata {
    pub title: Option<String>,
    pub source_label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Link> for LinkMetadata {
    fn from(link: &Link) -> Self {
        Self {
            title: link.title.clone(),
            source_label: link.source_label.clone(),
            created_at: link.created_at,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Default)]
pub struct LinkStats {
    pub total_links: u64,
    pub total_accesses: u64,
    pub last_created: Option<DateTime<Utc>>,
}

impl LinkStats {
    pub fn from_links(links: &[Link]) -> Self {
        let mut stats = Self::default();
        for l in links {
            stats.add(l.access_count, Some(l.created_at));
        }
        stats
    }

    /// Folds one active link into the totals.
    pub fn add(&mut self, access_count: u64, created_at: Option<DateTime<Utc>>) {
        self.total_links += 1;
        self.total_accesses += access_count;
        self.last_created = self.last_created.max(created_at);
    }
}
