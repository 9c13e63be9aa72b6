// =============================================
// In-process store
// =============================================
// Backs the unit tests and local runs. Under `cfg(test)` it can also be told
// to fail appends, token consumption or counter increments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::{AccessLogSink, LinkStore, TokenStore};
use crate::error::GateResult;
use crate::model::{AccessLogEntry, Link, LinkStats, Token, UpdateLinkReq};

#[cfg(test)]
use crate::error::GateError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    links: RwLock<HashMap<String, Link>>,
    tokens: RwLock<HashMap<String, Token>>,
    // insertion order doubles as the tie-break for equal timestamps
    logs: RwLock<Vec<AccessLogEntry>>,
    #[cfg(test)]
    fail_appends: AtomicU32,
    #[cfg(test)]
    fail_consume: AtomicBool,
    #[cfg(test)]
    fail_increment: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_logs(&self) -> Vec<AccessLogEntry> {
        self.logs.read().await.clone()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Makes the next `n` log appends fail.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_consume(&self, on: bool) {
        self.fail_consume.store(on, Ordering::SeqCst);
    }

    pub fn fail_increment(&self, on: bool) {
        self.fail_increment.store(on, Ordering::SeqCst);
    }

    fn unavailable(what: &str) -> GateError {
        GateError::StorageUnavailable(format!("memory: {what} failure injected"))
    }
}

#[async_trait]
impl LinkStore for MemoryStore {
    async fn get(&self, link_id: &str) -> GateResult<Option<Link>> {
        Ok(self.links.read().await.get(link_id).cloned())
    }

    async fn insert(&self, link: &Link) -> GateResult<bool> {
        let mut links = self.links.write().await;
        if links.contains_key(&link.link_id) {
            return Ok(false);
        }
        links.insert(link.link_id.clone(), link.clone());
        Ok(true)
    }

    async fn update(
        &self,
        link_id: &str,
        owner_id: &str,
        changes: &UpdateLinkReq,
    ) -> GateResult<bool> {
        let mut links = self.links.write().await;
        let Some(link) = links
            .get_mut(link_id)
            .filter(|l| l.owner_id == owner_id && l.is_active)
        else {
            return Ok(false);
        };
        if let Some(d) = &changes.destination_url {
            link.destination_url = d.clone();
        }
        if let Some(t) = &changes.title {
            link.title = Some(t.clone());
        }
        if let Some(s) = &changes.source_label {
            link.source_label = Some(s.clone());
        }
        Ok(true)
    }

    async fn deactivate(&self, link_id: &str, owner_id: &str) -> GateResult<bool> {
        let mut links = self.links.write().await;
        match links.get_mut(link_id) {
            Some(link) if link.owner_id == owner_id => {
                link.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> GateResult<Vec<Link>> {
        let links = self.links.read().await;
        let mut out: Vec<Link> = links
            .values()
            .filter(|l| l.owner_id == owner_id && l.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn stats(&self, owner_id: &str) -> GateResult<LinkStats> {
        let links = self.links.read().await;
        let active: Vec<Link> = links
            .values()
            .filter(|l| l.owner_id == owner_id && l.is_active)
            .cloned()
            .collect();
        Ok(LinkStats::from_links(&active))
    }

    async fn increment_access_count(&self, link_id: &str) -> GateResult<()> {
        #[cfg(test)]
        if self.fail_increment.load(Ordering::SeqCst) {
            return Err(Self::unavailable("increment"));
        }
        if let Some(link) = self.links.write().await.get_mut(link_id) {
            link.access_count += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert(&self, token: &Token) -> GateResult<()> {
        self.tokens
            .write()
            .await
            .insert(token.value.clone(), token.clone());
        Ok(())
    }

    async fn find_by_value(&self, value: &str) -> GateResult<Option<Token>> {
        Ok(self.tokens.read().await.get(value).cloned())
    }

    async fn compare_and_set_used(
        &self,
        value: &str,
        used_at: DateTime<Utc>,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> GateResult<u64> {
        #[cfg(test)]
        if self.fail_consume.load(Ordering::SeqCst) {
            return Err(Self::unavailable("consume"));
        }
        // check and write under one guard
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(value) {
            Some(t) if !t.is_used => {
                t.is_used = true;
                t.used_at = Some(used_at);
                t.used_by_user_agent = user_agent.map(str::to_string);
                t.used_by_ip = ip.map(str::to_string);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_expired_older_than(&self, cutoff: DateTime<Utc>) -> GateResult<u64> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at >= cutoff);
        Ok((before - tokens.len()) as u64)
    }
}

#[async_trait]
impl AccessLogSink for MemoryStore {
    async fn append(&self, entry: &AccessLogEntry) -> GateResult<()> {
        #[cfg(test)]
        {
            let pending = self.fail_appends.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_appends.store(pending - 1, Ordering::SeqCst);
                return Err(Self::unavailable("append"));
            }
        }
        self.logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn query_by_link(&self, link_id: &str, limit: usize) -> GateResult<Vec<AccessLogEntry>> {
        let logs = self.logs.read().await;
        Ok(newest_first(logs.iter().filter(|e| e.link_id == link_id), limit))
    }

    async fn query_by_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> GateResult<Vec<AccessLogEntry>> {
        let links = self.links.read().await;
        let logs = self.logs.read().await;
        let owned = |e: &&AccessLogEntry| {
            links
                .get(&e.link_id)
                .is_some_and(|l| l.owner_id == account_id)
        };
        Ok(newest_first(logs.iter().filter(owned), limit))
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> GateResult<u64> {
        let mut logs = self.logs.write().await;
        let before = logs.len();
        logs.retain(|e| e.accessed_at >= cutoff);
        Ok((before - logs.len()) as u64)
    }
}

fn newest_first<'a>(
    entries: impl Iterator<Item = &'a AccessLogEntry>,
    limit: usize,
) -> Vec<AccessLogEntry> {
    let mut out: Vec<AccessLogEntry> = entries.cloned().collect();
    out.reverse();
    // stable: equal timestamps keep reverse insertion order
    out.sort_by(|a, b| b.accessed_at.cmp(&a.accessed_at));
    out.truncate(limit);
    out
}
