//! Deduplication window for inbound display messages
//!
//! QoS 1 delivery is at-least-once, so the broker may hand us the same
//! message more than once. An id is admitted once per TTL window; deliveries
//! whose timestamp is already older than the window are rejected outright.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

/// Opaque per-delivery identifier taken from transport metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for a QoS >= 1 delivery. Packet ids are recycled by the broker as
    /// soon as they are acknowledged, so the payload digest is part of the key.
    pub fn from_packet(pkid: u16, payload: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        Self(format!("pkid-{pkid}-{:016x}", hasher.finish()))
    }

    /// QoS 0 deliveries carry no packet id and are never redelivered
    pub fn ephemeral() -> Self {
        Self(format!("qos0-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Id already admitted inside the window
    Duplicate,
    /// Delivery timestamp older than the window
    Stale,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

struct SeenMessages {
    first_seen: HashMap<MessageId, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

pub struct MessageDeduplicator {
    ttl: chrono::Duration,
    seen: Mutex<SeenMessages>,
}

impl MessageDeduplicator {
    pub fn new(ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            ttl,
            seen: Mutex::new(SeenMessages {
                first_seen: HashMap::new(),
                last_sweep: Utc::now(),
            }),
        }
    }

    /// Admit a delivery against the wall clock. True exactly once per id
    /// within the window.
    pub fn admit(&self, id: &MessageId, received_at: DateTime<Utc>) -> bool {
        self.admit_at(id, received_at, Utc::now()).is_admitted()
    }

    /// Check-and-insert under a single lock
    pub fn admit_at(
        &self,
        id: &MessageId,
        received_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Admission {
        let mut seen = self.seen.lock();

        if now - seen.last_sweep >= self.ttl {
            let removed = Self::sweep_locked(&mut seen, self.ttl, now);
            if removed > 0 {
                debug!(removed, "Swept expired message ids");
            }
        }

        if now - received_at > self.ttl {
            return Admission::Stale;
        }

        if let Some(first_seen) = seen.first_seen.get(id) {
            if now - *first_seen <= self.ttl {
                return Admission::Duplicate;
            }
        }

        seen.first_seen.insert(id.clone(), now);
        Admission::Admitted
    }

    /// Drop records older than the window. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut seen = self.seen.lock();
        Self::sweep_locked(&mut seen, self.ttl, now)
    }

    fn sweep_locked(seen: &mut SeenMessages, ttl: chrono::Duration, now: DateTime<Utc>) -> usize {
        let before = seen.first_seen.len();
        seen.first_seen
            .retain(|_, first_seen| now - *first_seen <= ttl);
        seen.last_sweep = now;
        before - seen.first_seen.len()
    }

    /// Number of ids currently tracked
    pub fn len(&self) -> usize {
        self.seen.lock().first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: u64 = 300;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_second_admission_is_duplicate() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let id = MessageId::new("m1");
        let t = Utc::now();

        assert!(dedup.admit(&id, t));
        assert!(!dedup.admit(&id, t));
    }

    #[test]
    fn test_window_expiry_readmits() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let id = MessageId::new("m1");
        let t = Utc::now();

        assert_eq!(dedup.admit_at(&id, t, t), Admission::Admitted);
        assert_eq!(
            dedup.admit_at(&id, t + secs(TTL as i64), t + secs(TTL as i64)),
            Admission::Duplicate
        );

        let later = t + secs(TTL as i64 + 1);
        assert_eq!(dedup.admit_at(&id, later, later), Admission::Admitted);
    }

    #[test]
    fn test_stale_delivery_rejected_even_if_unseen() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let now = Utc::now();
        let sent = now - secs(TTL as i64 + 1);

        assert_eq!(
            dedup.admit_at(&MessageId::new("old"), sent, now),
            Admission::Stale
        );
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_boundary_delivery_is_not_stale() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let now = Utc::now();
        let sent = now - secs(TTL as i64);

        assert_eq!(
            dedup.admit_at(&MessageId::new("edge"), sent, now),
            Admission::Admitted
        );
    }

    #[test]
    fn test_distinct_ids_are_independent() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let t = Utc::now();

        assert!(dedup.admit(&MessageId::from_packet(1, b"a"), t));
        assert!(dedup.admit(&MessageId::from_packet(2, b"a"), t));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_recycled_packet_id_with_new_payload_is_admitted() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let t = Utc::now();

        assert!(dedup.admit(&MessageId::from_packet(7, b"frame-1"), t));
        assert!(!dedup.admit(&MessageId::from_packet(7, b"frame-1"), t));
        assert!(dedup.admit(&MessageId::from_packet(7, b"frame-2"), t));
    }

    #[test]
    fn test_sweep_removes_expired_records() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let t = Utc::now();
        dedup.admit_at(&MessageId::new("a"), t, t);
        dedup.admit_at(&MessageId::new("b"), t + secs(200), t + secs(200));

        assert_eq!(dedup.sweep(t + secs(TTL as i64 + 1)), 1);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_opportunistic_sweep_on_admission() {
        let dedup = MessageDeduplicator::new(Duration::from_secs(TTL));
        let t = Utc::now();
        for pkid in 0..10 {
            dedup.admit_at(&MessageId::from_packet(pkid, &[]), t, t);
        }
        assert_eq!(dedup.len(), 10);

        let later = t + secs(2 * TTL as i64);
        dedup.admit_at(&MessageId::new("fresh"), later, later);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_ephemeral_ids_are_unique() {
        assert_ne!(MessageId::ephemeral(), MessageId::ephemeral());
    }

    #[test]
    fn test_concurrent_admission_is_atomic() {
        let dedup = Arc::new(MessageDeduplicator::new(Duration::from_secs(TTL)));
        let id = MessageId::new("race");
        let t = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let dedup = dedup.clone();
                let id = id.clone();
                std::thread::spawn(move || dedup.admit(&id, t))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
