//! Suppliers and their health
//!
//! A supplier moves `Probing → Healthy` once it answers a probe, drops to
//! `Suspect` after `K` consecutive failures inside a window `W`, and to
//! `Evicted` after `M` more, or at once when its identity is withdrawn from
//! the DHT. Any success brings it back to `Healthy`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ports::PeerId;

/// Health thresholds for suppliers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive failures inside `window` before a supplier is Suspect (K)
    pub suspect_after: u32,
    /// Window the failures must fall in (W)
    pub window: Duration,
    /// Further failures before a Suspect supplier is Evicted (M)
    pub evict_after: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            suspect_after: 3,
            window: Duration::from_secs(600),
            evict_after: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupplierState {
    Probing,
    Healthy,
    Suspect,
    Evicted,
}

impl SupplierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupplierState::Probing => "Probing",
            SupplierState::Healthy => "Healthy",
            SupplierState::Suspect => "Suspect",
            SupplierState::Evicted => "Evicted",
        }
    }

    /// Whether fragments held by this supplier may be read
    pub fn serves_reads(&self) -> bool {
        !matches!(self, SupplierState::Evicted)
    }
}

impl std::fmt::Display for SupplierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One slot of a family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    pub peer_id: PeerId,
    pub position: usize,
    pub state: SupplierState,
    pub last_seen: Option<DateTime<Utc>>,

    /// Logical identity the peer publishes rotated identifiers under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    /// Whether the nickname has been observed in the DHT; only then does
    /// its absence count as a withdrawal
    #[serde(default)]
    pub identity_seen: bool,

    /// Timestamps of the current run of failures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    failures: Vec<DateTime<Utc>>,

    /// Failures since the supplier became Suspect
    #[serde(default)]
    strikes: u32,
}

impl Supplier {
    pub fn new(peer_id: PeerId, position: usize) -> Self {
        Self {
            peer_id,
            position,
            state: SupplierState::Probing,
            last_seen: None,
            nickname: None,
            identity_seen: false,
            failures: Vec::new(),
            strikes: 0,
        }
    }

    /// Consecutive failures currently counted against the supplier
    pub fn failure_count(&self) -> usize {
        self.failures.len() + self.strikes as usize
    }

    /// Record a successful exchange. Returns the previous state if it changed.
    pub fn record_success(&mut self, now: DateTime<Utc>) -> Option<SupplierState> {
        self.last_seen = Some(now);
        self.failures.clear();
        self.strikes = 0;
        self.transition(SupplierState::Healthy)
    }

    /// Record a failed exchange. Returns the previous state if it changed.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        policy: &HealthPolicy,
    ) -> Option<SupplierState> {
        match self.state {
            SupplierState::Evicted => None,
            SupplierState::Suspect => {
                self.strikes += 1;
                if self.strikes >= policy.evict_after {
                    self.transition(SupplierState::Evicted)
                } else {
                    None
                }
            }
            SupplierState::Probing | SupplierState::Healthy => {
                let window = chrono::Duration::from_std(policy.window)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
                self.failures.retain(|t| now - *t <= window);
                self.failures.push(now);
                if self.failures.len() as u32 >= policy.suspect_after {
                    self.failures.clear();
                    self.transition(SupplierState::Suspect)
                } else {
                    None
                }
            }
        }
    }

    /// Force eviction, e.g. on a DHT eviction signal
    pub fn evict(&mut self) -> Option<SupplierState> {
        self.transition(SupplierState::Evicted)
    }

    fn transition(&mut self, to: SupplierState) -> Option<SupplierState> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_suspect_then_evicted() {
        let policy = HealthPolicy::default();
        let mut s = Supplier::new(PeerId::from("p"), 0);
        s.record_success(at(0));

        assert_eq!(s.record_failure(at(1), &policy), None);
        assert_eq!(s.record_failure(at(2), &policy), None);
        assert_eq!(
            s.record_failure(at(3), &policy),
            Some(SupplierState::Healthy)
        );
        assert_eq!(s.state, SupplierState::Suspect);

        assert_eq!(s.record_failure(at(4), &policy), None);
        assert_eq!(
            s.record_failure(at(5), &policy),
            Some(SupplierState::Suspect)
        );
        assert_eq!(s.state, SupplierState::Evicted);
        assert!(!s.state.serves_reads());
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let policy = HealthPolicy::default();
        let mut s = Supplier::new(PeerId::from("p"), 0);
        s.record_success(at(0));
        s.record_failure(at(0), &policy);
        s.record_failure(at(700), &policy);
        s.record_failure(at(1400), &policy);
        assert_eq!(s.state, SupplierState::Healthy);
    }

    #[test]
    fn test_success_resets() {
        let policy = HealthPolicy::default();
        let mut s = Supplier::new(PeerId::from("p"), 0);
        for t in 0..3 {
            s.record_failure(at(t), &policy);
        }
        assert_eq!(s.state, SupplierState::Suspect);
        assert_eq!(s.record_success(at(10)), Some(SupplierState::Suspect));
        assert_eq!(s.failure_count(), 0);
        assert_eq!(s.last_seen, Some(at(10)));
    }

    #[test]
    fn test_serde_skips_empty_counters() {
        let mut s = Supplier::new(PeerId::from("p"), 3);
        s.nickname = Some("alice".to_string());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["peerId"], "p");
        assert_eq!(json["nickname"], "alice");
        assert!(json.get("failures").is_none());
    }

    #[test]
    fn test_identity_seen_defaults_for_older_files() {
        let s: Supplier = serde_json::from_value(serde_json::json!({
            "peerId": "p",
            "position": 0,
            "state": "Healthy",
            "lastSeen": null
        }))
        .unwrap();
        assert!(!s.identity_seen);
        assert_eq!(s.state, SupplierState::Healthy);
    }
}
