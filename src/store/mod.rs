// =============================================
// Storage traits
// =============================================
// Every mutation single use depends on is a conditional or atomic operation
// on the store itself, never a read-modify-write in memory.

pub mod dynamo;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::GateResult;
use crate::model::{AccessLogEntry, Link, LinkStats, Token, UpdateLinkReq};

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Returns the link whether or not it is active.
    async fn get(&self, link_id: &str) -> GateResult<Option<Link>>;

    /// Inserts a new link. Returns `false` if the id is already taken.
    async fn insert(&self, link: &Link) -> GateResult<bool>;

    /// Applies the set fields if `owner_id` owns the active link.
    /// Returns `false` when nothing matched.
    async fn update(&self, link_id: &str, owner_id: &str, changes: &UpdateLinkReq)
        -> GateResult<bool>;

    /// Soft delete. Returns `false` when nothing matched.
    async fn deactivate(&self, link_id: &str, owner_id: &str) -> GateResult<bool>;

    /// Active links of an owner, newest first.
    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> GateResult<Vec<Link>>;

    /// Totals over all of the owner's active links, not just one page.
    async fn stats(&self, owner_id: &str) -> GateResult<LinkStats>;

    /// Atomic `+1` on the access counter.
    async fn increment_access_count(&self, link_id: &str) -> GateResult<()>;

    async fn is_owner(&self, link_id: &str, account_id: &str) -> GateResult<bool> {
        Ok(self
            .get(link_id)
            .await?
            .is_some_and(|l| l.owner_id == account_id))
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, token: &Token) -> GateResult<()>;

    async fn find_by_value(&self, value: &str) -> GateResult<Option<Token>>;

    /// Marks the token used only if it is still unused. Returns rows affected
    /// (0 or 1).
    async fn compare_and_set_used(
        &self,
        value: &str,
        used_at: DateTime<Utc>,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> GateResult<u64>;

    /// Deletes tokens whose `expires_at` is before `cutoff`. Returns the count.
    async fn delete_expired_older_than(&self, cutoff: DateTime<Utc>) -> GateResult<u64>;
}

#[async_trait]
pub trait AccessLogSink: Send + Sync {
    async fn append(&self, entry: &AccessLogEntry) -> GateResult<()>;

    /// Newest first.
    async fn query_by_link(&self, link_id: &str, limit: usize) -> GateResult<Vec<AccessLogEntry>>;

    /// Entries of every link the account owns, newest first.
    async fn query_by_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> GateResult<Vec<AccessLogEntry>>;

    /// Retention sweep. Returns the number of rows removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> GateResult<u64>;
}
