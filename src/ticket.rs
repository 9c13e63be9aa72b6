// =============================================
// Gate ticket
// =============================================
// Format: `b64u(json) "." b64u(HMAC-SHA256(key, b64u(json)))`, the same shape as
// a signed OAuth state value. The browser can read the payload without the key,
// which makes any client-side decode a hint only; `GateTicket::verify` is the
// server's check.

use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::{b64u, b64u_to_bytes};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket could not be decoded")]
    Malformed,
    #[error("ticket signature does not match")]
    BadSignature,
    #[error("ticket is bound to another link")]
    LinkMismatch,
    #[error("ticket is older than the allowed age")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateTicket {
    /// Link id the ticket was minted for.
    pub id: String,
    /// Creation time, epoch milliseconds.
    pub created: i64,
}

impl GateTicket {
    pub fn new(link_id: &str, created: DateTime<Utc>) -> Self {
        Self {
            id: link_id.to_string(),
            created: created.timestamp_millis(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created).single()
    }

    pub fn seal(&self, key: &[u8]) -> String {
        // serializing two plain fields cannot fail
        let payload = serde_json::to_vec(self).unwrap_or_default();
        let payload_b64 = b64u(&payload);
        let sig_b64 = b64u(&sign(key, &payload_b64));
        format!("{}.{}", payload_b64, sig_b64)
    }

    /// Reads the payload without checking the signature.
    pub fn decode_unverified(ticket: &str) -> Result<Self, TicketError> {
        let (payload_b64, _) = ticket.split_once('.').ok_or(TicketError::Malformed)?;
        let payload = b64u_to_bytes(payload_b64).ok_or(TicketError::Malformed)?;
        serde_json::from_slice(&payload).map_err(|_| TicketError::Malformed)
    }

    /// Checks what the client can check (link id, age) against a decoded ticket.
    pub fn check(
        &self,
        link_id: &str,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<(), TicketError> {
        if self.id != link_id {
            return Err(TicketError::LinkMismatch);
        }
        let created = self.created_at().ok_or(TicketError::Malformed)?;
        if now - created > max_age {
            return Err(TicketError::Expired);
        }
        Ok(())
    }

    pub fn verify(
        ticket: &str,
        key: &[u8],
        link_id: &str,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Self, TicketError> {
        let (payload_b64, sig_b64) = ticket.split_once('.').ok_or(TicketError::Malformed)?;
        let sig = b64u_to_bytes(sig_b64).ok_or(TicketError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TicketError::BadSignature)?;
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| TicketError::BadSignature)?;

        let decoded = Self::decode_unverified(ticket)?;
        decoded.check(link_id, now, max_age)?;
        Ok(decoded)
    }
}

fn sign(key: &[u8], payload_b64: &str) -> Vec<u8> {
    // HMAC takes keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    mac.update(payload_b64.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-ticket-key";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn sealed_ticket_verifies() {
        let sealed = GateTicket::new("L1", now()).seal(KEY);
        let t = GateTicket::verify(&sealed, KEY, "L1", now(), Duration::hours(24)).unwrap();
        assert_eq!(t.id, "L1");
        assert_eq!(t.created_at(), Some(now()));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = GateTicket::new("L1", now()).seal(KEY);
        let err = GateTicket::verify(&sealed, b"other", "L1", now(), Duration::hours(24));
        assert_eq!(err, Err(TicketError::BadSignature));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let sealed = GateTicket::new("L1", now()).seal(KEY);
        let (_, sig) = sealed.split_once('.').unwrap();
        let forged_payload = b64u(&serde_json::to_vec(&GateTicket::new("L2", now())).unwrap());
        let forged = format!("{forged_payload}.{sig}");
        assert_eq!(
            GateTicket::verify(&forged, KEY, "L2", now(), Duration::hours(24)),
            Err(TicketError::BadSignature)
        );
        // the client-side decode still reads it: it is only a hint
        assert_eq!(GateTicket::decode_unverified(&forged).unwrap().id, "L2");
    }

    #[test]
    fn link_mismatch_and_age_are_checked() {
        let sealed = GateTicket::new("L1", now()).seal(KEY);
        assert_eq!(
            GateTicket::verify(&sealed, KEY, "L2", now(), Duration::hours(24)),
            Err(TicketError::LinkMismatch)
        );
        assert_eq!(
            GateTicket::verify(
                &sealed,
                KEY,
                "L1",
                now() + Duration::hours(25),
                Duration::hours(24)
            ),
            Err(TicketError::Expired)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            GateTicket::decode_unverified("not-a-ticket"),
            Err(TicketError::Malformed)
        );
        assert_eq!(
            GateTicket::decode_unverified("%%%.abc"),
            Err(TicketError::Malformed)
        );
    }
}
