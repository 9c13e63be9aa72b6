// =============================================
// DynamoDB backing store
// =============================================
// Tables:
//   links        PK: link_id (S)
//                GSI1-owner: owner_id (S) / created_at (N)
//                attrs: destination_url, owner_id, title, source_label,
//                       is_active (BOOL), access_count (N), created_at (N ms)
//   tokens       PK: token (S)
//                attrs: link_id, created_at, expires_at (N ms), is_used (BOOL),
//                       used_at, used_by_ua, used_by_ip, ttl (N epoch seconds)
//   access_logs  PK: link_id (S), SK: sk (S) = "{accessed_at ms:013}#{uuid}"
//                attrs: token, access_type, reason, referrer, user_agent,
//                       ip_address, accessed_at (N ms)
//
// `ttl` on tokens lets DynamoDB's native TTL reap rows; the sweeper does the
// same job explicitly, so neither is load-bearing for validation.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb as ddb;
use aws_sdk_dynamodb::error::ProvideErrorMetadata; // for .code()
use chrono::{DateTime, Duration, TimeZone, Utc};
use ddb::types::AttributeValue as Av;
use std::collections::HashMap;

use super::{AccessLogSink, LinkStore, TokenStore};
use crate::config::GateConfig;
use crate::error::{storage_err, GateError, GateResult};
use crate::model::{AccessLogEntry, AccessType, Link, LinkStats, Token, UpdateLinkReq};

type Item = HashMap<String, Av>;

const CONDITIONAL_FAILED: &str = "ConditionalCheckFailedException";
const OWNER_INDEX: &str = "GSI1-owner";

#[derive(Clone)]
pub struct DynamoStore {
    ddb: ddb::Client,
    table_links: String,
    table_tokens: String,
    table_logs: String,
    token_retention: Duration,
}

impl DynamoStore {
    pub async fn connect(cfg: &GateConfig) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::new(ddb::Client::new(&config), cfg)
    }

    pub fn new(ddb: ddb::Client, cfg: &GateConfig) -> Self {
        Self {
            ddb,
            table_links: cfg.table_links.clone(),
            table_tokens: cfg.table_tokens.clone(),
            table_logs: cfg.table_access_logs.clone(),
            token_retention: cfg.token_retention,
        }
    }

    /// Every link id the owner has ever had, active or not.
    async fn owner_link_ids(&self, owner_id: &str) -> GateResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut start: Option<Item> = None;
        loop {
            let resp = self
                .ddb
                .query()
                .table_name(&self.table_links)
                .index_name(OWNER_INDEX)
                .key_condition_expression("owner_id = :o")
                .expression_attribute_values(":o", Av::S(owner_id.to_string()))
                .projection_expression("link_id")
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .map_err(storage_err("ddb query owner links"))?;
            ids.extend(resp.items().iter().filter_map(|it| s(it, "link_id")));
            match resp.last_evaluated_key() {
                Some(k) => start = Some(k.clone()),
                None => break,
            }
        }
        Ok(ids)
    }
}

// ---------------- item mapping ----------------

fn s(item: &Item, k: &str) -> Option<String> {
    item.get(k).and_then(|v| v.as_s().ok()).cloned()
}

fn n<T: std::str::FromStr>(item: &Item, k: &str) -> Option<T> {
    item.get(k)
        .and_then(|v| v.as_n().ok())
        .and_then(|s| s.parse::<T>().ok())
}

fn b(item: &Item, k: &str) -> Option<bool> {
    item.get(k).and_then(|v| v.as_bool().ok()).copied()
}

fn ts(item: &Item, k: &str) -> Option<DateTime<Utc>> {
    n::<i64>(item, k).and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn ms(dt: DateTime<Utc>) -> Av {
    Av::N(dt.timestamp_millis().to_string())
}

fn page_size(n: usize) -> i32 {
    n.clamp(1, i32::MAX as usize) as i32
}

fn put_opt(item: &mut Item, k: &str, v: Option<&str>) {
    if let Some(v) = v {
        item.insert(k.to_string(), Av::S(v.to_string()));
    }
}

fn link_from_item(item: &Item) -> Option<Link> {
    Some(Link {
        link_id: s(item, "link_id")?,
        destination_url: s(item, "destination_url")?,
        owner_id: s(item, "owner_id").unwrap_or_else(|| "system".to_string()),
        title: s(item, "title"),
        source_label: s(item, "source_label"),
        is_active: b(item, "is_active").unwrap_or(false),
        access_count: n(item, "access_count").unwrap_or(0),
        created_at: ts(item, "created_at").unwrap_or_default(),
    })
}

fn link_to_item(link: &Link) -> Item {
    let mut item = HashMap::new();
    item.insert("link_id".into(), Av::S(link.link_id.clone()));
    item.insert("destination_url".into(), Av::S(link.destination_url.clone()));
    item.insert("owner_id".into(), Av::S(link.owner_id.clone()));
    put_opt(&mut item, "title", link.title.as_deref());
    put_opt(&mut item, "source_label", link.source_label.as_deref());
    item.insert("is_active".into(), Av::Bool(link.is_active));
    item.insert("access_count".into(), Av::N(link.access_count.to_string()));
    item.insert("created_at".into(), ms(link.created_at));
    item
}

fn token_from_item(item: &Item) -> Option<Token> {
    Some(Token {
        value: s(item, "token")?,
        link_id: s(item, "link_id")?,
        created_at: ts(item, "created_at").unwrap_or_default(),
        expires_at: ts(item, "expires_at")?,
        is_used: b(item, "is_used").unwrap_or(true),
        used_at: ts(item, "used_at"),
        used_by_user_agent: s(item, "used_by_ua"),
        used_by_ip: s(item, "used_by_ip"),
    })
}

fn entry_from_item(item: &Item) -> Option<AccessLogEntry> {
    Some(AccessLogEntry {
        link_id: s(item, "link_id")?,
        token: s(item, "token").unwrap_or_default(),
        access_type: s(item, "access_type").and_then(|v| AccessType::parse(&v))?,
        reason: s(item, "reason"),
        referrer: s(item, "referrer"),
        user_agent: s(item, "user_agent"),
        ip_address: s(item, "ip_address"),
        accessed_at: ts(item, "accessed_at")?,
    })
}

fn entry_to_item(entry: &AccessLogEntry) -> Item {
    let mut item = HashMap::new();
    let sk = format!(
        "{:013}#{}",
        entry.accessed_at.timestamp_millis().max(0),
        uuid::Uuid::new_v4()
    );
    item.insert("link_id".into(), Av::S(entry.link_id.clone()));
    item.insert("sk".into(), Av::S(sk));
    item.insert("token".into(), Av::S(entry.token.clone()));
    item.insert(
        "access_type".into(),
        Av::S(entry.access_type.as_str().to_string()),
    );
    put_opt(&mut item, "reason", entry.reason.as_deref());
    put_opt(&mut item, "referrer", entry.referrer.as_deref());
    put_opt(&mut item, "user_agent", entry.user_agent.as_deref());
    put_opt(&mut item, "ip_address", entry.ip_address.as_deref());
    item.insert("accessed_at".into(), ms(entry.accessed_at));
    item
}

// ---------------- links ----------------

#[async_trait]
impl LinkStore for DynamoStore {
    async fn get(&self, link_id: &str) -> GateResult<Option<Link>> {
        let r = self
            .ddb
            .get_item()
            .table_name(&self.table_links)
            .key("link_id", Av::S(link_id.to_string()))
            .send()
            .await
            .map_err(storage_err("ddb get link"))?;
        Ok(r.item().and_then(link_from_item))
    }

    async fn insert(&self, link: &Link) -> GateResult<bool> {
        let r = self
            .ddb
            .put_item()
            .table_name(&self.table_links)
            .set_item(Some(link_to_item(link)))
            .condition_expression("attribute_not_exists(link_id)")
            .send()
            .await;

        match r {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some(CONDITIONAL_FAILED) => Ok(false),
            Err(e) => {
                tracing::error!(table = %self.table_links, err_code = ?e.code(), "DDB PutItem link failed");
                Err(GateError::StorageUnavailable(format!("ddb put link: {e}")))
            }
        }
    }

    async fn update(
        &self,
        link_id: &str,
        owner_id: &str,
        changes: &UpdateLinkReq,
    ) -> GateResult<bool> {
        let mut sets = Vec::new();
        let mut names = HashMap::new();
        let mut vals = HashMap::new();

        let fields = [
            ("#d", ":d", "destination_url", changes.destination_url.as_deref()),
            ("#t", ":t", "title", changes.title.as_deref()),
            ("#s", ":s", "source_label", changes.source_label.as_deref()),
        ];
        for (name, val, attr, v) in fields {
            if let Some(v) = v {
                sets.push(format!("{name} = {val}"));
                names.insert(name.to_string(), attr.to_string());
                vals.insert(val.to_string(), Av::S(v.to_string()));
            }
        }
        if sets.is_empty() {
            return Ok(false);
        }
        vals.insert(":o".to_string(), Av::S(owner_id.to_string()));
        vals.insert(":on".to_string(), Av::Bool(true));

        let r = self
            .ddb
            .update_item()
            .table_name(&self.table_links)
            .key("link_id", Av::S(link_id.to_string()))
            .update_expression(format!("SET {}", sets.join(", ")))
            .condition_expression("owner_id = :o AND is_active = :on")
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(vals))
            .send()
            .await;

        match r {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some(CONDITIONAL_FAILED) => Ok(false),
            Err(e) => Err(GateError::StorageUnavailable(format!("ddb update link: {e}"))),
        }
    }

    async fn deactivate(&self, link_id: &str, owner_id: &str) -> GateResult<bool> {
        let r = self
            .ddb
            .update_item()
            .table_name(&self.table_links)
            .key("link_id", Av::S(link_id.to_string()))
            .update_expression("SET is_active = :off")
            .condition_expression("owner_id = :o")
            .expression_attribute_values(":off", Av::Bool(false))
            .expression_attribute_values(":o", Av::S(owner_id.to_string()))
            .send()
            .await;

        match r {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some(CONDITIONAL_FAILED) => Ok(false),
            Err(e) => Err(GateError::StorageUnavailable(format!("ddb deactivate link: {e}"))),
        }
    }

    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> GateResult<Vec<Link>> {
        // Limit applies before the is_active filter, so keep paging until
        // enough active links have come back
        let mut links: Vec<Link> = Vec::new();
        let mut start: Option<Item> = None;
        loop {
            let resp = self
                .ddb
                .query()
                .table_name(&self.table_links)
                .index_name(OWNER_INDEX)
                .key_condition_expression("owner_id = :o")
                .filter_expression("is_active = :on")
                .expression_attribute_values(":o", Av::S(owner_id.to_string()))
                .expression_attribute_values(":on", Av::Bool(true))
                .scan_index_forward(false)
                .limit(page_size(limit - links.len()))
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .map_err(storage_err("ddb query links"))?;

            links.extend(resp.items().iter().filter_map(link_from_item));
            match resp.last_evaluated_key() {
                Some(k) if links.len() < limit => start = Some(k.clone()),
                _ => break,
            }
        }

        links.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        links.truncate(limit);
        Ok(links)
    }

    async fn stats(&self, owner_id: &str) -> GateResult<LinkStats> {
        let mut stats = LinkStats::default();
        let mut start: Option<Item> = None;
        loop {
            let resp = self
                .ddb
                .query()
                .table_name(&self.table_links)
                .index_name(OWNER_INDEX)
                .key_condition_expression("owner_id = :o")
                .filter_expression("is_active = :on")
                .projection_expression("access_count, created_at")
                .expression_attribute_values(":o", Av::S(owner_id.to_string()))
                .expression_attribute_values(":on", Av::Bool(true))
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .map_err(storage_err("ddb query link stats"))?;

            for it in resp.items() {
                stats.add(n(it, "access_count").unwrap_or(0), ts(it, "created_at"));
            }
            match resp.last_evaluated_key() {
                Some(k) => start = Some(k.clone()),
                None => break,
            }
        }
        Ok(stats)
    }

    async fn increment_access_count(&self, link_id: &str) -> GateResult<()> {
        let r = self
            .ddb
            .update_item()
            .table_name(&self.table_links)
            .key("link_id", Av::S(link_id.to_string()))
            .update_expression("ADD access_count :inc")
            .condition_expression("attribute_exists(link_id)")
            .expression_attribute_values(":inc", Av::N("1".into()))
            .send()
            .await;

        match r {
            Ok(_) => Ok(()),
            // link vanished between lookup and increment: nothing to count
            Err(e) if e.code() == Some(CONDITIONAL_FAILED) => Ok(()),
            Err(e) => Err(GateError::StorageUnavailable(format!("ddb increment: {e}"))),
        }
    }
}

// ---------------- tokens ----------------

#[async_trait]
impl TokenStore for DynamoStore {
    async fn insert(&self, token: &Token) -> GateResult<()> {
        let ttl = (token.expires_at + self.token_retention).timestamp();
        let r = self
            .ddb
            .put_item()
            .table_name(&self.table_tokens)
            .item("token", Av::S(token.value.clone()))
            .item("link_id", Av::S(token.link_id.clone()))
            .item("created_at", ms(token.created_at))
            .item("expires_at", ms(token.expires_at))
            .item("is_used", Av::Bool(token.is_used))
            .item("ttl", Av::N(ttl.to_string()))
            .condition_expression("attribute_not_exists(#tok)")
            .expression_attribute_names("#tok", "token")
            .send()
            .await;

        match r {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(table = %self.table_tokens, err_code = ?e.code(), err_msg = ?e.message(), "DDB PutItem token failed");
                Err(GateError::StorageUnavailable(format!("ddb put token: {e}")))
            }
        }
    }

    async fn find_by_value(&self, value: &str) -> GateResult<Option<Token>> {
        let r = self
            .ddb
            .get_item()
            .table_name(&self.table_tokens)
            .key("token", Av::S(value.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(storage_err("ddb get token"))?;
        Ok(r.item().and_then(token_from_item))
    }

    async fn compare_and_set_used(
        &self,
        value: &str,
        used_at: DateTime<Utc>,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> GateResult<u64> {
        let mut expr = String::from("SET is_used = :used, used_at = :at");
        let mut req = self
            .ddb
            .update_item()
            .table_name(&self.table_tokens)
            .key("token", Av::S(value.to_string()))
            .condition_expression("attribute_exists(#tok) AND is_used = :unused")
            .expression_attribute_names("#tok", "token")
            .expression_attribute_values(":used", Av::Bool(true))
            .expression_attribute_values(":unused", Av::Bool(false))
            .expression_attribute_values(":at", ms(used_at));
        if let Some(ua) = user_agent {
            expr.push_str(", used_by_ua = :ua");
            req = req.expression_attribute_values(":ua", Av::S(ua.to_string()));
        }
        if let Some(ip) = ip {
            expr.push_str(", used_by_ip = :ip");
            req = req.expression_attribute_values(":ip", Av::S(ip.to_string()));
        }

        match req.update_expression(expr).send().await {
            Ok(_) => Ok(1),
            Err(e) if e.code() == Some(CONDITIONAL_FAILED) => Ok(0),
            Err(e) => {
                tracing::error!(table = %self.table_tokens, err_code = ?e.code(), err_msg = ?e.message(), "DDB conditional consume failed");
                Err(GateError::StorageUnavailable(format!("ddb consume token: {e}")))
            }
        }
    }

    async fn delete_expired_older_than(&self, cutoff: DateTime<Utc>) -> GateResult<u64> {
        let mut deleted = 0u64;
        let mut start: Option<Item> = None;
        loop {
            let resp = self
                .ddb
                .scan()
                .table_name(&self.table_tokens)
                .filter_expression("expires_at < :cutoff")
                .projection_expression("#tok")
                .expression_attribute_names("#tok", "token")
                .expression_attribute_values(":cutoff", ms(cutoff))
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .map_err(storage_err("ddb scan tokens"))?;

            for value in resp.items().iter().filter_map(|it| s(it, "token")) {
                self.ddb
                    .delete_item()
                    .table_name(&self.table_tokens)
                    .key("token", Av::S(value))
                    .send()
                    .await
                    .map_err(storage_err("ddb delete token"))?;
                deleted += 1;
            }
            match resp.last_evaluated_key() {
                Some(k) => start = Some(k.clone()),
                None => break,
            }
        }
        Ok(deleted)
    }
}

// ---------------- access logs ----------------

#[async_trait]
impl AccessLogSink for DynamoStore {
    async fn append(&self, entry: &AccessLogEntry) -> GateResult<()> {
        self.ddb
            .put_item()
            .table_name(&self.table_logs)
            .set_item(Some(entry_to_item(entry)))
            .send()
            .await
            .map_err(storage_err("ddb put access log"))?;
        Ok(())
    }

    async fn query_by_link(&self, link_id: &str, limit: usize) -> GateResult<Vec<AccessLogEntry>> {
        let resp = self
            .ddb
            .query()
            .table_name(&self.table_logs)
            .key_condition_expression("link_id = :l")
            .expression_attribute_values(":l", Av::S(link_id.to_string()))
            .scan_index_forward(false)
            .limit(page_size(limit))
            .send()
            .await
            .map_err(storage_err("ddb query access logs"))?;
        Ok(resp.items().iter().filter_map(entry_from_item).collect())
    }

    async fn query_by_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> GateResult<Vec<AccessLogEntry>> {
        // no joins: fan out over the owner's links and merge
        let mut out = Vec::new();
        for link_id in self.owner_link_ids(account_id).await? {
            out.extend(self.query_by_link(&link_id, limit).await?);
        }
        out.sort_by(|a, b| b.accessed_at.cmp(&a.accessed_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> GateResult<u64> {
        let mut deleted = 0u64;
        let mut start: Option<Item> = None;
        loop {
            let resp = self
                .ddb
                .scan()
                .table_name(&self.table_logs)
                .filter_expression("accessed_at < :cutoff")
                .projection_expression("link_id, sk")
                .expression_attribute_values(":cutoff", ms(cutoff))
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .map_err(storage_err("ddb scan access logs"))?;

            for it in resp.items() {
                let (Some(link_id), Some(sk)) = (s(it, "link_id"), s(it, "sk")) else {
                    continue;
                };
                self.ddb
                    .delete_item()
                    .table_name(&self.table_logs)
                    .key("link_id", Av::S(link_id))
                    .key("sk", Av::S(sk))
                    .send()
                    .await
                    .map_err(storage_err("ddb delete access log"))?;
                deleted += 1;
            }
            match resp.last_evaluated_key() {
                Some(k) => start = Some(k.clone()),
                None => break,
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_stays_positive_and_fits_i32() {
        assert_eq!(page_size(0), 1);
        assert_eq!(page_size(25), 25);
        assert_eq!(page_size(usize::MAX), i32::MAX);
    }

    fn sample_link() -> Link {
        Link {
            link_id: "L1".into(),
            destination_url: "https://example.com/x".into(),
            owner_id: "alice".into(),
            title: Some("Docs".into()),
            source_label: None,
            is_active: true,
            access_count: 7,
            created_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        }
    }

    #[test]
    fn link_item_round_trips() {
        let link = sample_link();
        let item = link_to_item(&link);
        assert!(!item.contains_key("source_label"));
        assert_eq!(link_from_item(&item), Some(link));
    }

    #[test]
    fn token_without_is_used_reads_as_used() {
        let mut item = HashMap::new();
        item.insert("token".to_string(), Av::S("T".into()));
        item.insert("link_id".to_string(), Av::S("L1".into()));
        item.insert("expires_at".to_string(), Av::N("1700000000000".into()));
        let t = token_from_item(&item).unwrap();
        assert!(t.is_used);
    }

    #[test]
    fn token_without_expiry_is_unreadable() {
        let mut item = HashMap::new();
        item.insert("token".to_string(), Av::S("T".into()));
        item.insert("link_id".to_string(), Av::S("L1".into()));
        assert!(token_from_item(&item).is_none());
    }

    #[test]
    fn log_sort_key_orders_by_time() {
        let mk = |ms: i64| AccessLogEntry {
            link_id: "L1".into(),
            token: "T".into(),
            access_type: AccessType::Blocked,
            reason: Some("Link not found".into()),
            referrer: None,
            user_agent: Some("ua".into()),
            ip_address: None,
            accessed_at: Utc.timestamp_millis_opt(ms).unwrap(),
        };
        let early = entry_to_item(&mk(999));
        let late = entry_to_item(&mk(1_700_000_000_000));
        assert!(s(&early, "sk").unwrap() < s(&late, "sk").unwrap());
        assert_eq!(entry_from_item(&late), Some(mk(1_700_000_000_000)));
    }
}
