use chrono::Duration;
use std::sync::Arc;
use url::Url;

use crate::clock::Clock;
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::id::new_token_value;
use crate::model::{IssuedToken, Token};
use crate::store::TokenStore;
use crate::ticket::GateTicket;
use crate::util::token_prefix;

/// Mints single-use tokens. The only side effect is the token row itself.
pub struct TokenIssuer {
    tokens: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    cfg: Arc<GateConfig>,
}

impl TokenIssuer {
    pub fn new(tokens: Arc<dyn TokenStore>, clock: Arc<dyn Clock>, cfg: Arc<GateConfig>) -> Self {
        Self { tokens, clock, cfg }
    }

    pub async fn issue(&self, link_id: &str, ttl_minutes: Option<u32>) -> GateResult<IssuedToken> {
        if link_id.trim().is_empty() {
            return Err(GateError::InvalidInput("link_id is required".into()));
        }

        let now = self.clock.now();
        let ttl = self.cfg.ttl_minutes(ttl_minutes);
        let token = Token {
            value: new_token_value(),
            link_id: link_id.to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(i64::from(ttl)),
            is_used: false,
            used_at: None,
            used_by_user_agent: None,
            used_by_ip: None,
        };
        self.tokens.insert(&token).await?;

        let ticket = GateTicket::new(link_id, now).seal(&self.cfg.ticket_key);
        let gate_url = gate_url(&self.cfg.public_domain, link_id, &token.value, &ticket)?;

        tracing::info!(
            link_id,
            token = %token_prefix(&token.value),
            ttl_minutes = ttl,
            "token issued"
        );

        Ok(IssuedToken {
            token: token.value,
            link_id: token.link_id,
            expires_at: token.expires_at,
            ticket,
            gate_url,
        })
    }
}

fn gate_url(domain: &str, link_id: &str, token: &str, ticket: &str) -> GateResult<String> {
    let mut u = Url::parse(&format!("https://{domain}/go"))
        .map_err(|e| GateError::InvalidInput(format!("bad PUBLIC_DOMAIN: {e}")))?;
    u.query_pairs_mut()
        .append_pair("id", link_id)
        .append_pair("token", token)
        .append_pair("ticket", ticket);
    Ok(u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn issuer(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>) -> TokenIssuer {
        TokenIssuer::new(store.clone(), clock.clone(), Arc::new(GateConfig::default()))
    }

    #[tokio::test]
    async fn issued_token_is_persisted_unused() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let issued = issuer(&store, &clock).issue("L1", None).await.unwrap();

        let row = store.find_by_value(&issued.token).await.unwrap().unwrap();
        assert_eq!(row.link_id, "L1");
        assert!(!row.is_used);
        assert_eq!(row.created_at, clock.now());
        assert_eq!(row.expires_at, clock.now() + Duration::minutes(30));
        assert_eq!(issued.expires_at, row.expires_at);
    }

    #[tokio::test]
    async fn ttl_is_clamped_to_configured_bounds() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let issuer = issuer(&store, &clock);

        let short = issuer.issue("L1", Some(0)).await.unwrap();
        assert_eq!(short.expires_at, clock.now() + Duration::minutes(1));
        let long = issuer.issue("L1", Some(99_999)).await.unwrap();
        assert_eq!(long.expires_at, clock.now() + Duration::minutes(1440));
    }

    #[tokio::test]
    async fn several_outstanding_tokens_per_link() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let issuer = issuer(&store, &clock);
        let a = issuer.issue("L1", None).await.unwrap();
        let b = issuer.issue("L1", None).await.unwrap();
        assert_ne!(a.token, b.token);
        assert!(store.find_by_value(&a.token).await.unwrap().is_some());
        assert!(store.find_by_value(&b.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn gate_url_carries_id_token_and_verifiable_ticket() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let issued = issuer(&store, &clock).issue("L1", None).await.unwrap();

        let u = Url::parse(&issued.gate_url).unwrap();
        assert_eq!(u.host_str(), Some("gate.example.com"));
        assert_eq!(u.path(), "/go");
        let q: HashMap<String, String> = u.query_pairs().into_owned().collect();
        assert_eq!(q["id"], "L1");
        assert_eq!(q["token"], issued.token);
        assert_eq!(q["ticket"], issued.ticket);

        let cfg = GateConfig::default();
        let t = GateTicket::verify(
            &issued.ticket,
            &cfg.ticket_key,
            "L1",
            clock.now(),
            Duration::hours(24),
        )
        .unwrap();
        assert_eq!(t.created_at(), Some(clock.now()));
    }

    #[tokio::test]
    async fn empty_link_id_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let err = issuer(&store, &clock).issue("  ", None).await.unwrap_err();
        assert!(matches!(err, GateError::InvalidInput(_)));
    }
}
