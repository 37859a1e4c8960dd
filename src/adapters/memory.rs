//! In-Memory Adapters
//!
//! Transport and DHT that live entirely in process memory. Used by tests
//! and failure drills; the transport has knobs for unreachable peers,
//! latency, transient failures and dropped fragments.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::ports::{Dht, PeerId, Transport, IDENTITY_PREFIX};
use crate::error::{Error, Result};
use crate::pipeline::FragmentName;

// =============================================================================
// Transport
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryTransport {
    stores: RwLock<HashMap<PeerId, BTreeMap<String, Bytes>>>,
    unreachable: DashSet<PeerId>,
    latency: DashMap<PeerId, Duration>,
    fail_next: DashMap<PeerId, u32>,
    cut_offs: DashMap<PeerId, u64>,
    inflight: DashMap<PeerId, usize>,
    peak: DashMap<PeerId, usize>,
    sends: AtomicU64,
    fetches: AtomicU64,
}

struct Inflight<'a> {
    transport: &'a InMemoryTransport,
    peer: PeerId,
}

impl<'a> Inflight<'a> {
    fn enter(transport: &'a InMemoryTransport, peer: &PeerId) -> Self {
        let now = {
            let mut count = transport.inflight.entry(peer.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let mut peak = transport.peak.entry(peer.clone()).or_insert(0);
        if now > *peak {
            *peak = now;
        }
        Self {
            transport,
            peer: peer.clone(),
        }
    }
}

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.transport.inflight.get_mut(&self.peer) {
            *count = count.saturating_sub(1);
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every exchange with `peer`
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(peer.clone());
        } else {
            self.unreachable.remove(peer);
        }
    }

    /// Delay every exchange with `peer`
    pub fn set_latency(&self, peer: &PeerId, latency: Duration) {
        self.latency.insert(peer.clone(), latency);
    }

    /// Fail the next `count` exchanges with `peer`
    pub fn fail_next(&self, peer: &PeerId, count: u32) {
        self.fail_next.insert(peer.clone(), count);
    }

    /// Make `peer` unreachable as soon as any fragment of block `block` or
    /// later is sent to any peer
    pub fn cut_off_at_block(&self, peer: &PeerId, block: u64) {
        self.cut_offs.insert(peer.clone(), block);
    }

    /// Remove one stored fragment; returns whether it existed
    pub fn drop_fragment(&self, peer: &PeerId, name: &str) -> bool {
        self.stores
            .write()
            .get_mut(peer)
            .map(|store| store.remove(name).is_some())
            .unwrap_or(false)
    }

    /// Remove every stored fragment whose name matches
    pub fn drop_where(&self, mut matches: impl FnMut(&FragmentName) -> bool) -> usize {
        let mut dropped = 0;
        for store in self.stores.write().values_mut() {
            store.retain(|name, _| {
                let drop = name.parse::<FragmentName>().map(|n| matches(&n)).unwrap_or(false);
                if drop {
                    dropped += 1;
                }
                !drop
            });
        }
        dropped
    }

    pub fn holds(&self, peer: &PeerId, name: &str) -> bool {
        self.stores
            .read()
            .get(peer)
            .map(|store| store.contains_key(name))
            .unwrap_or(false)
    }

    pub fn fragments_on(&self, peer: &PeerId) -> Vec<String> {
        self.stores
            .read()
            .get(peer)
            .map(|store| store.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest number of simultaneous exchanges seen with `peer`
    pub fn peak_concurrency(&self, peer: &PeerId) -> usize {
        self.peak.get(peer).map(|p| *p).unwrap_or(0)
    }

    pub fn send_count(&self) -> u64 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn trip_cut_offs(&self, name: &str) {
        let Ok(fragment) = name.parse::<FragmentName>() else {
            return;
        };
        for entry in self.cut_offs.iter() {
            if fragment.block_number >= *entry.value() && !self.unreachable.contains(entry.key()) {
                debug!(peer = %entry.key(), block = fragment.block_number, "Cutting off peer");
                self.unreachable.insert(entry.key().clone());
            }
        }
    }

    async fn gate(&self, peer: &PeerId) -> Result<()> {
        if let Some(latency) = self.latency.get(peer).map(|l| *l) {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.contains(peer) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("peer {} unreachable", peer),
            )));
        }
        if let Some(mut remaining) = self.fail_next.get_mut(peer) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    format!("peer {} reset the connection", peer),
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, peer: &PeerId, name: &str, bytes: Bytes) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.trip_cut_offs(name);
        let _inflight = Inflight::enter(self, peer);
        self.gate(peer).await?;
        self.stores
            .write()
            .entry(peer.clone())
            .or_default()
            .insert(name.to_string(), bytes);
        Ok(())
    }

    async fn fetch(&self, peer: &PeerId, name: &str) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let _inflight = Inflight::enter(self, peer);
        self.gate(peer).await?;
        self.stores
            .read()
            .get(peer)
            .and_then(|store| store.get(name).cloned())
            .ok_or_else(|| Error::FragmentNotFound(name.to_string()))
    }

    async fn ping(&self, peer: &PeerId) -> Result<()> {
        if self.unreachable.contains(peer) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("peer {} unreachable", peer),
            )));
        }
        Ok(())
    }

    async fn delete(&self, peer: &PeerId, name: &str) -> Result<()> {
        self.gate(peer).await?;
        self.drop_fragment(peer, name);
        Ok(())
    }
}

// =============================================================================
// DHT
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryDht {
    entries: DashMap<String, Vec<(String, Instant)>>,
}

impl InMemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `peer` as the current identifier of `nickname`
    pub fn publish_identity(&self, nickname: &str, peer: &PeerId) {
        let expires = Instant::now() + Duration::from_secs(3600);
        self.entries
            .entry(format!("{}{}", IDENTITY_PREFIX, nickname))
            .or_default()
            .push((peer.to_string(), expires));
    }

    /// Remove every identifier published under `nickname`
    pub fn withdraw_identity(&self, nickname: &str) {
        self.entries.remove(&format!("{}{}", IDENTITY_PREFIX, nickname));
    }

    fn live(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut values) => {
                values.retain(|(_, expires)| *expires > now);
                values.iter().map(|(v, _)| v.clone()).collect()
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Dht for InMemoryDht {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires = Instant::now() + ttl;
        let mut values = self.entries.entry(key.to_string()).or_default();
        values.retain(|(v, _)| v != value);
        values.push((value.to_string(), expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.live(key))
    }

    async fn observe(&self, nickname: &str) -> Result<Option<PeerId>> {
        Ok(self
            .live(&format!("{}{}", IDENTITY_PREFIX, nickname))
            .pop()
            .map(PeerId::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_transport_roundtrip_and_faults() {
        let transport = InMemoryTransport::new();
        let peer = PeerId::from("p");
        transport
            .send(&peer, "F1/0-0-Data", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(
            transport.fetch(&peer, "F1/0-0-Data").await.unwrap(),
            Bytes::from_static(b"abc")
        );

        transport.fail_next(&peer, 1);
        assert!(transport.fetch(&peer, "F1/0-0-Data").await.is_err());
        assert!(transport.fetch(&peer, "F1/0-0-Data").await.is_ok());

        transport.set_unreachable(&peer, true);
        assert!(transport.ping(&peer).await.is_err());
        transport.set_unreachable(&peer, false);

        assert!(transport.drop_fragment(&peer, "F1/0-0-Data"));
        assert_matches!(
            transport.fetch(&peer, "F1/0-0-Data").await,
            Err(Error::FragmentNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_cut_off_trips_on_block() {
        let transport = InMemoryTransport::new();
        let victim = PeerId::from("victim");
        transport.cut_off_at_block(&victim, 5);
        transport
            .send(&victim, "F1/4-0-Data", Bytes::from_static(b"x"))
            .await
            .unwrap();
        transport
            .send(&PeerId::from("other"), "F1/5-1-Data", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(transport.ping(&victim).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_where() {
        let transport = InMemoryTransport::new();
        for (peer, name) in [("a", "F1/0-0-Data"), ("b", "F1/1-0-Data"), ("c", "F1/1-1-Data")] {
            transport
                .send(&PeerId::from(peer), name, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        assert_eq!(transport.drop_where(|n| n.index == 0), 2);
        assert!(transport.holds(&PeerId::from("c"), "F1/1-1-Data"));
    }

    #[tokio::test]
    async fn test_dht_values_and_identities() {
        let dht = InMemoryDht::new();
        dht.put("k", "v1", Duration::from_secs(60)).await.unwrap();
        dht.put("k", "v2", Duration::from_secs(60)).await.unwrap();
        dht.put("k", "v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(dht.get("k").await.unwrap(), vec!["v2", "v1"]);

        assert_eq!(dht.observe("alice").await.unwrap(), None);
        dht.publish_identity("alice", &PeerId::from("alice-2"));
        assert_eq!(
            dht.observe("alice").await.unwrap(),
            Some(PeerId::from("alice-2"))
        );
        dht.withdraw_identity("alice");
        assert_eq!(dht.observe("alice").await.unwrap(), None);
    }
}
