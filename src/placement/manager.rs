//! Family Manager
//!
//! Owns every supplier family, persists them to `families.db` and is the
//! only place positions are reassigned. Transfers ask it who currently
//! holds a position and report back how the exchange went; repeated
//! failures evict a supplier and trigger an automatic replacement.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::family::SupplierFamily;
use super::supplier::{HealthPolicy, SupplierState};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{Dht, EventPublisher, PeerId, Transport, SUPPLIERS_KEY};
use crate::ec::{EccMap, EccRegistry};
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::transfer::{Holder, HolderResolver};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for supplier selection and health
#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Replacement peers tried before the DHT, in order
    pub candidates: Vec<PeerId>,

    /// Reachability probe timeout
    pub probe_timeout: std::time::Duration,

    /// Automatic replacements allowed at once; `None` uses the scheme's
    /// fire-hire limit
    pub max_pending_replacements: Option<usize>,

    pub health: HealthPolicy,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            probe_timeout: std::time::Duration::from_secs(10),
            max_pending_replacements: None,
            health: HealthPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FamiliesFile {
    families: BTreeMap<String, SupplierFamily>,
    #[serde(default)]
    aliases: BTreeMap<PeerId, PeerId>,
}

// =============================================================================
// Manager
// =============================================================================

pub struct FamilyManager {
    path: PathBuf,
    config: PlacementConfig,
    transport: Arc<dyn Transport>,
    dht: Arc<dyn Dht>,
    events: Arc<dyn EventPublisher>,
    families: RwLock<BTreeMap<String, SupplierFamily>>,
    /// Rotated identifiers, old → new
    aliases: RwLock<BTreeMap<PeerId, PeerId>>,
    /// Cancelled whenever the position is reassigned
    tokens: DashMap<(String, usize), CancellationToken>,
    /// Serializes hire/replace/switch/resize
    mutation: tokio::sync::Mutex<()>,
    /// Serializes writes of `families.db`
    persist_lock: tokio::sync::Mutex<()>,
    pending_replacements: AtomicUsize,
}

impl std::fmt::Debug for FamilyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyManager")
            .field("path", &self.path)
            .field("families", &self.families.read().len())
            .finish()
    }
}

impl FamilyManager {
    /// Load families from `path`, starting empty if the file does not exist
    pub async fn open(
        path: impl Into<PathBuf>,
        config: PlacementConfig,
        transport: Arc<dyn Transport>,
        dht: Arc<dyn Dht>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let path = path.into();
        let file = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<FamiliesFile>(&raw).map_err(|e| {
                Error::IndexCorrupt(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FamiliesFile::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), families = file.families.len(), "Loaded supplier families");

        Ok(Self {
            path,
            config,
            transport,
            dht,
            events,
            families: RwLock::new(file.families),
            aliases: RwLock::new(file.aliases),
            tokens: DashMap::new(),
            mutation: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            pending_replacements: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Snapshot of a scope's family
    pub fn family(&self, scope: &str) -> Option<SupplierFamily> {
        self.families.read().get(scope).cloned()
    }

    pub fn families(&self) -> Vec<SupplierFamily> {
        self.families.read().values().cloned().collect()
    }

    /// Current identifier for a peer, following identity rotations
    pub fn resolve_peer(&self, peer: &PeerId) -> PeerId {
        let aliases = self.aliases.read();
        let mut current = peer.clone();
        for _ in 0..=aliases.len() {
            match aliases.get(&current) {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        current
    }

    /// Whether fragments on this peer may be read
    pub fn serves_reads(&self, peer: &PeerId) -> bool {
        let peer = self.resolve_peer(peer);
        !self.families.read().values().any(|f| {
            f.suppliers()
                .iter()
                .any(|s| s.peer_id == peer && !s.state.serves_reads())
        })
    }

    /// Token cancelled when `position` of `scope` is reassigned
    pub fn reassignment_token(&self, scope: &str, position: usize) -> CancellationToken {
        self.tokens
            .entry((scope.to_string(), position))
            .or_default()
            .clone()
    }

    fn reassigned(&self, scope: &str, position: usize) {
        if let Some((_, token)) = self.tokens.remove(&(scope.to_string(), position)) {
            token.cancel();
        }
    }

    // =========================================================================
    // Hire / Resize
    // =========================================================================

    /// Build the first family for `scope`, or return the existing one if it
    /// already uses `map`
    #[instrument(skip(self, map), fields(map = %map.name()))]
    pub async fn hire(&self, scope: &str, map: &EccMap) -> Result<SupplierFamily> {
        let _guard = self.mutation.lock().await;
        if let Some(existing) = self.family(scope) {
            if existing.ecc_map == map.name() {
                return Ok(existing);
            }
        }
        let family = self.hire_locked(scope, map, Vec::new()).await?;
        info!(scope, peers = ?family.peers(), "Hired supplier family");
        Ok(family)
    }

    /// Re-hire `scope` under a different scheme. Backups already placed keep
    /// the peers recorded in their manifests until they are migrated.
    #[instrument(skip(self, map), fields(map = %map.name()))]
    pub async fn resize(&self, scope: &str, map: &EccMap) -> Result<SupplierFamily> {
        let _guard = self.mutation.lock().await;
        let old = self.family(scope);
        if let Some(old) = &old {
            if old.ecc_map == map.name() {
                return Ok(old.clone());
            }
        }
        let preferred = old.as_ref().map(|f| f.peers()).unwrap_or_default();
        let mut family = self.hire_locked(scope, map, preferred).await?;

        if let Some(old) = old {
            family.generation = old.generation + 1;
            self.families
                .write()
                .insert(scope.to_string(), family.clone());
            for position in 0..old.len().max(family.len()) {
                self.reassigned(scope, position);
            }
            self.persist().await?;
            self.emit(DomainEvent::FamilyResized {
                scope: scope.to_string(),
                old_map: old.ecc_map.clone(),
                new_map: family.ecc_map.clone(),
                timestamp: Utc::now(),
            })
            .await;
            info!(scope, old_map = %old.ecc_map, "Resized supplier family");
        }
        Ok(family)
    }

    async fn hire_locked(
        &self,
        scope: &str,
        map: &EccMap,
        preferred: Vec<PeerId>,
    ) -> Result<SupplierFamily> {
        let peers = self
            .pick(map.total_fragments(), &HashSet::new(), preferred)
            .await?;
        let mut family = SupplierFamily::new(scope, map, peers)?;
        let now = Utc::now();
        for position in 0..family.len() {
            if let Some(supplier) = family.supplier_mut(position) {
                supplier.nickname = Some(supplier.peer_id.to_string());
                supplier.record_success(now);
            }
        }
        self.families
            .write()
            .insert(scope.to_string(), family.clone());
        self.persist().await?;
        Ok(family)
    }

    // =========================================================================
    // Replace / Switch
    // =========================================================================

    /// Give `position` a new peer: configured candidates first, then a random
    /// reachable DHT peer. Returns the new peer.
    #[instrument(skip(self))]
    pub async fn replace(&self, scope: &str, position: usize, reason: &str) -> Result<PeerId> {
        let _guard = self.mutation.lock().await;
        let family = self
            .family(scope)
            .ok_or_else(|| Error::Config(format!("no supplier family for scope {}", scope)))?;
        let old = family
            .peer_at(position)
            .cloned()
            .ok_or_else(|| Error::Config(format!("position {} out of range", position)))?;

        let exclude: HashSet<PeerId> = family.peers().into_iter().collect();
        let new = self
            .pick(1, &exclude, Vec::new())
            .await?
            .pop()
            .ok_or_else(|| Error::NoCandidate(format!("position {} of {}", position, scope)))?;

        self.reassign(scope, position, old, new.clone(), reason).await?;
        Ok(new)
    }

    /// Administrative override of one position
    #[instrument(skip(self))]
    pub async fn switch(&self, scope: &str, position: usize, peer: PeerId) -> Result<PeerId> {
        let _guard = self.mutation.lock().await;
        let family = self
            .family(scope)
            .ok_or_else(|| Error::Config(format!("no supplier family for scope {}", scope)))?;
        let old = family
            .peer_at(position)
            .cloned()
            .ok_or_else(|| Error::Config(format!("position {} out of range", position)))?;
        if old == peer {
            return Ok(old);
        }
        self.reassign(scope, position, old.clone(), peer, "switch")
            .await?;
        Ok(old)
    }

    async fn reassign(
        &self,
        scope: &str,
        position: usize,
        old: PeerId,
        new: PeerId,
        reason: &str,
    ) -> Result<()> {
        {
            let mut families = self.families.write();
            let family = families
                .get_mut(scope)
                .ok_or_else(|| Error::Config(format!("no supplier family for scope {}", scope)))?;
            family.assign(position, new.clone())?;
            if let Some(supplier) = family.supplier_mut(position) {
                supplier.nickname = Some(new.to_string());
                supplier.record_success(Utc::now());
            }
        }
        self.reassigned(scope, position);
        self.persist().await?;

        METRICS.supplier_replacements.inc();
        info!(scope, position, old_peer = %old, new_peer = %new, reason, "Reassigned supplier position");
        self.emit(DomainEvent::SupplierReplaced {
            scope: scope.to_string(),
            position,
            old_peer: old.to_string(),
            new_peer: new.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    /// Pick `count` distinct reachable peers not in `exclude`
    async fn pick(
        &self,
        count: usize,
        exclude: &HashSet<PeerId>,
        preferred: Vec<PeerId>,
    ) -> Result<Vec<PeerId>> {
        let mut discovered: Vec<PeerId> = match self.dht.get(SUPPLIERS_KEY).await {
            Ok(values) => values.into_iter().map(PeerId::from).collect(),
            Err(e) => {
                warn!(error = %e, "Supplier discovery through the DHT failed");
                Vec::new()
            }
        };
        discovered.shuffle(&mut rand::thread_rng());

        let mut seen: HashSet<PeerId> = exclude.clone();
        let mut picked = Vec::with_capacity(count);
        let ordered = preferred
            .into_iter()
            .chain(self.config.candidates.iter().cloned())
            .chain(discovered);
        for peer in ordered {
            if picked.len() == count {
                break;
            }
            if !seen.insert(peer.clone()) {
                continue;
            }
            if self.probe(&peer).await {
                picked.push(peer);
            }
        }

        if picked.len() < count {
            return Err(Error::NoCandidate(format!(
                "needed {} reachable peers, found {}",
                count,
                picked.len()
            )));
        }
        Ok(picked)
    }

    async fn probe(&self, peer: &PeerId) -> bool {
        match tokio::time::timeout(self.config.probe_timeout, self.transport.ping(peer)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(peer = %peer, "Probe timed out");
                false
            }
        }
    }

    // =========================================================================
    // Identity Rotation
    // =========================================================================

    /// Swap a rotated identifier in place across every family
    #[instrument(skip(self))]
    pub async fn rotate_identity(&self, old: &PeerId, new: &PeerId) -> Result<usize> {
        if old == new {
            return Ok(0);
        }
        let renamed = {
            let mut families = self.families.write();
            families
                .values_mut()
                .map(|f| f.rename(old, new))
                .filter(|renamed| *renamed)
                .count()
        };
        self.aliases.write().insert(old.clone(), new.clone());
        self.persist().await?;

        info!(old_peer = %old, new_peer = %new, families = renamed, "Supplier identity rotated");
        self.emit(DomainEvent::SupplierIdentityRotated {
            old_peer: old.to_string(),
            new_peer: new.to_string(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(renamed)
    }

    /// Observe every supplier's nickname in the DHT and apply rotations.
    /// A supplier whose identity was seen before and is now withdrawn from
    /// the DHT is evicted. Returns the number of rotations.
    pub async fn refresh_identities(&self) -> Result<usize> {
        let watched: Vec<(String, usize, String, PeerId, bool)> = self
            .families
            .read()
            .iter()
            .flat_map(|(scope, f)| {
                f.suppliers().iter().filter_map(move |s| {
                    s.nickname.clone().map(|n| {
                        (scope.clone(), s.position, n, s.peer_id.clone(), s.identity_seen)
                    })
                })
            })
            .collect();

        let mut rotated = 0;
        for (scope, position, nickname, current, seen) in watched {
            match self.dht.observe(&nickname).await {
                Ok(Some(observed)) => {
                    if !seen {
                        self.mark_identity_seen(&scope, position, &current);
                    }
                    if observed != current {
                        self.rotate_identity(&current, &observed).await?;
                        rotated += 1;
                    }
                }
                Ok(None) if seen => {
                    warn!(scope, position, nickname, peer = %current, "Supplier withdrew from the DHT");
                    self.evict(&scope, position, &current).await;
                }
                Ok(None) => {}
                Err(e) => warn!(nickname, error = %e, "Identity lookup failed"),
            }
        }
        Ok(rotated)
    }

    fn mark_identity_seen(&self, scope: &str, position: usize, peer: &PeerId) {
        let mut families = self.families.write();
        if let Some(supplier) = families
            .get_mut(scope)
            .and_then(|f| f.supplier_mut(position))
        {
            if &supplier.peer_id == peer {
                supplier.identity_seen = true;
            }
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    fn locate(&self, holder: &Holder, peer: &PeerId) -> Option<(String, usize)> {
        match holder {
            Holder::Slot { scope, position } => Some((scope.clone(), *position)),
            Holder::Peer(_) => self
                .families
                .read()
                .iter()
                .find_map(|(scope, f)| f.position_of(peer).map(|p| (scope.clone(), p))),
        }
    }

    async fn record(&self, holder: &Holder, peer: &PeerId, success: bool) {
        let Some((scope, position)) = self.locate(holder, peer) else {
            return;
        };
        let change = {
            let mut families = self.families.write();
            let Some(supplier) = families
                .get_mut(&scope)
                .and_then(|f| f.supplier_mut(position))
            else {
                return;
            };
            // Reports about a peer that no longer holds the slot are stale.
            if &supplier.peer_id != peer {
                return;
            }
            let from = if success {
                supplier.record_success(Utc::now())
            } else {
                supplier.record_failure(Utc::now(), &self.config.health)
            };
            from.map(|from| (from, supplier.state))
        };

        if let Some((from, to)) = change {
            self.state_changed(&scope, position, peer, from, to).await;
        }
    }

    /// Evict the supplier at `position` if it is still `peer`
    async fn evict(&self, scope: &str, position: usize, peer: &PeerId) {
        let change = {
            let mut families = self.families.write();
            families
                .get_mut(scope)
                .and_then(|f| f.supplier_mut(position))
                .filter(|s| &s.peer_id == peer)
                .and_then(|s| s.evict().map(|from| (from, s.state)))
        };
        if let Some((from, to)) = change {
            self.state_changed(scope, position, peer, from, to).await;
        }
    }

    async fn state_changed(
        &self,
        scope: &str,
        position: usize,
        peer: &PeerId,
        from: SupplierState,
        to: SupplierState,
    ) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist supplier state");
        }
        info!(peer = %peer, position, from = %from, to = %to, "Supplier state changed");
        self.emit(DomainEvent::SupplierStateChanged {
            peer: peer.to_string(),
            position,
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
        })
        .await;

        if to == SupplierState::Evicted {
            self.replace_evicted(scope, position).await;
        }
    }

    async fn replace_evicted(&self, scope: &str, position: usize) {
        let limit = self.replacement_limit(scope);
        let pending = self.pending_replacements.fetch_add(1, Ordering::SeqCst);
        if pending >= limit {
            self.pending_replacements.fetch_sub(1, Ordering::SeqCst);
            warn!(scope, position, limit, "Replacement limit reached, position stays evicted");
            return;
        }
        if let Err(e) = self.replace(scope, position, "evicted").await {
            warn!(scope, position, error = %e, "Automatic replacement failed");
        }
        self.pending_replacements.fetch_sub(1, Ordering::SeqCst);
    }

    fn replacement_limit(&self, scope: &str) -> usize {
        if let Some(limit) = self.config.max_pending_replacements {
            return limit;
        }
        self.family(scope)
            .and_then(|f| EccRegistry::builtin().lookup(&f.ecc_map).ok())
            .map(|m| m.fire_hire_errors().max(1))
            .unwrap_or(1)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = FamiliesFile {
            families: self.families.read().clone(),
            aliases: self.aliases.read().clone(),
        };
        let raw = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("db.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish placement event");
        }
    }
}

#[async_trait]
impl HolderResolver for FamilyManager {
    fn resolve(&self, holder: &Holder) -> Result<(PeerId, CancellationToken)> {
        match holder {
            Holder::Slot { scope, position } => {
                let token = self.reassignment_token(scope, *position);
                let peer = self
                    .families
                    .read()
                    .get(scope)
                    .and_then(|f| f.peer_at(*position).cloned())
                    .ok_or_else(|| {
                        Error::Config(format!("no supplier at position {} of {}", position, scope))
                    })?;
                Ok((peer, token))
            }
            Holder::Peer(peer) => Ok((self.resolve_peer(peer), CancellationToken::new())),
        }
    }

    async fn report_success(&self, holder: &Holder, peer: &PeerId) {
        self.record(holder, peer, true).await;
    }

    async fn report_failure(&self, holder: &Holder, peer: &PeerId, error: &Error) {
        debug!(peer = %peer, error = %error, "Exchange failed");
        self.record(holder, peer, false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryDht, InMemoryEventCollector, InMemoryTransport};
    use crate::ec::lookup;
    use crate::placement::DEFAULT_SCOPE;
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        transport: Arc<InMemoryTransport>,
        dht: Arc<InMemoryDht>,
        events: Arc<InMemoryEventCollector>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                path: dir.path().join("index/families.db"),
                _dir: dir,
                transport: Arc::new(InMemoryTransport::new()),
                dht: Arc::new(InMemoryDht::new()),
                events: Arc::new(InMemoryEventCollector::new()),
            }
        }

        async fn manager(&self, candidates: &[&str]) -> FamilyManager {
            let config = PlacementConfig {
                candidates: candidates.iter().map(|c| PeerId::from(*c)).collect(),
                probe_timeout: Duration::from_millis(200),
                ..Default::default()
            };
            FamilyManager::open(
                &self.path,
                config,
                self.transport.clone(),
                self.dht.clone(),
                self.events.clone(),
            )
            .await
            .unwrap()
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("peer-{i}")).collect()
    }

    // =========================================================================
    // Hire
    // =========================================================================

    #[tokio::test]
    async fn test_hire_prefers_configured_candidates() {
        let fx = Fixture::new();
        let all = names(6);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;

        let map = lookup("ecc/2x2").unwrap();
        let family = manager.hire(DEFAULT_SCOPE, &map).await.unwrap();
        assert_eq!(
            family.peers(),
            vec![
                PeerId::from("peer-0"),
                PeerId::from("peer-1"),
                PeerId::from("peer-2"),
                PeerId::from("peer-3")
            ]
        );
        assert!(family
            .suppliers()
            .iter()
            .all(|s| s.state == SupplierState::Healthy));
    }

    #[tokio::test]
    async fn test_hire_skips_unreachable_and_uses_dht() {
        let fx = Fixture::new();
        fx.transport.set_unreachable(&PeerId::from("peer-1"), true);
        for peer in ["dht-a", "dht-b"] {
            fx.dht
                .put(SUPPLIERS_KEY, peer, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let manager = fx.manager(&["peer-0", "peer-1", "peer-2"]).await;

        let family = manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();
        assert!(!family.contains(&PeerId::from("peer-1")));
        assert!(family.contains(&PeerId::from("dht-a")));
        assert!(family.contains(&PeerId::from("dht-b")));
    }

    #[tokio::test]
    async fn test_hire_without_enough_peers() {
        let fx = Fixture::new();
        let manager = fx.manager(&["peer-0"]).await;
        assert_matches!(
            manager.hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap()).await,
            Err(Error::NoCandidate(_))
        );
    }

    #[tokio::test]
    async fn test_families_persist() {
        let fx = Fixture::new();
        let all = names(4);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let hired = {
            let manager = fx.manager(&refs).await;
            manager
                .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
                .await
                .unwrap()
        };
        let reopened = fx.manager(&[]).await;
        assert_eq!(reopened.family(DEFAULT_SCOPE).unwrap().peers(), hired.peers());
    }

    #[tokio::test]
    async fn test_unreadable_families_file() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
        std::fs::write(&fx.path, b"{not json").unwrap();
        let result = FamilyManager::open(
            &fx.path,
            PlacementConfig::default(),
            fx.transport.clone(),
            fx.dht.clone(),
            fx.events.clone(),
        )
        .await;
        assert_matches!(result, Err(Error::IndexCorrupt(_)));
    }

    // =========================================================================
    // Replace / Switch
    // =========================================================================

    #[tokio::test]
    async fn test_replace_mutates_only_that_position() {
        let fx = Fixture::new();
        let all = names(5);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;
        let before = manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();
        let token = manager.reassignment_token(DEFAULT_SCOPE, 2);

        let new = manager.replace(DEFAULT_SCOPE, 2, "test").await.unwrap();
        assert_eq!(new, PeerId::from("peer-4"));
        assert!(token.is_cancelled());

        let after = manager.family(DEFAULT_SCOPE).unwrap();
        assert_eq!(after.generation, before.generation + 1);
        for pos in [0, 1, 3] {
            assert_eq!(after.peer_at(pos), before.peer_at(pos));
        }
        assert_eq!(fx.events.events_of_type("SupplierReplaced").len(), 1);
    }

    #[tokio::test]
    async fn test_switch_rejects_member_of_family() {
        let fx = Fixture::new();
        let all = names(4);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();

        assert!(manager
            .switch(DEFAULT_SCOPE, 0, PeerId::from("peer-3"))
            .await
            .is_err());
        let old = manager
            .switch(DEFAULT_SCOPE, 0, PeerId::from("outsider"))
            .await
            .unwrap();
        assert_eq!(old, PeerId::from("peer-0"));
        assert_eq!(
            manager.family(DEFAULT_SCOPE).unwrap().peer_at(0),
            Some(&PeerId::from("outsider"))
        );
    }

    // =========================================================================
    // Health
    // =========================================================================

    #[tokio::test]
    async fn test_repeated_failures_evict_and_replace() {
        let fx = Fixture::new();
        let all = names(5);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();

        let holder = Holder::Slot {
            scope: DEFAULT_SCOPE.to_string(),
            position: 1,
        };
        let peer = PeerId::from("peer-1");
        let err = Error::Internal("refused".into());
        for _ in 0..5 {
            manager.report_failure(&holder, &peer, &err).await;
        }

        let family = manager.family(DEFAULT_SCOPE).unwrap();
        assert_eq!(family.peer_at(1), Some(&PeerId::from("peer-4")));
        assert_eq!(fx.events.events_of_type("SupplierStateChanged").len(), 2);
    }

    #[tokio::test]
    async fn test_replacement_limit_leaves_position_evicted() {
        let fx = Fixture::new();
        let all = names(5);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let config = PlacementConfig {
            candidates: refs.iter().map(|c| PeerId::from(*c)).collect(),
            max_pending_replacements: Some(0),
            ..Default::default()
        };
        let manager = FamilyManager::open(
            &fx.path,
            config,
            fx.transport.clone(),
            fx.dht.clone(),
            fx.events.clone(),
        )
        .await
        .unwrap();
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();

        let holder = Holder::Peer(PeerId::from("peer-0"));
        for _ in 0..5 {
            manager
                .report_failure(&holder, &PeerId::from("peer-0"), &Error::Internal("x".into()))
                .await;
        }
        let family = manager.family(DEFAULT_SCOPE).unwrap();
        assert_eq!(family.evicted_positions(), vec![0]);
        assert!(!manager.serves_reads(&PeerId::from("peer-0")));
    }

    #[tokio::test]
    async fn test_stale_reports_are_ignored() {
        let fx = Fixture::new();
        let all = names(4);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();
        let holder = Holder::Slot {
            scope: DEFAULT_SCOPE.to_string(),
            position: 0,
        };
        for _ in 0..10 {
            manager
                .report_failure(&holder, &PeerId::from("someone-else"), &Error::Internal("x".into()))
                .await;
        }
        assert!(manager.family(DEFAULT_SCOPE).unwrap().evicted_positions().is_empty());
    }

    // =========================================================================
    // Identity Rotation
    // =========================================================================

    #[tokio::test]
    async fn test_refresh_identities_from_dht() {
        let fx = Fixture::new();
        let all = names(4);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();
        let token = manager.reassignment_token(DEFAULT_SCOPE, 3);

        fx.dht.publish_identity("peer-3", &PeerId::from("peer-3-rotated"));
        assert_eq!(manager.refresh_identities().await.unwrap(), 1);

        let family = manager.family(DEFAULT_SCOPE).unwrap();
        assert_eq!(family.peer_at(3), Some(&PeerId::from("peer-3-rotated")));
        assert_eq!(family.generation, 1);
        assert!(!token.is_cancelled());
        assert_eq!(
            manager.resolve_peer(&PeerId::from("peer-3")),
            PeerId::from("peer-3-rotated")
        );
        assert_eq!(manager.refresh_identities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_identity_evicts_and_replaces() {
        let fx = Fixture::new();
        let all = names(5);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();
        let peer_1 = PeerId::from("peer-1");

        // never published: nothing to act on
        assert_eq!(manager.refresh_identities().await.unwrap(), 0);
        assert!(manager.serves_reads(&peer_1));
        assert!(fx.events.events_of_type("SupplierStateChanged").is_empty());

        fx.dht.publish_identity("peer-1", &peer_1);
        assert_eq!(manager.refresh_identities().await.unwrap(), 0);
        assert!(manager.family(DEFAULT_SCOPE).unwrap().supplier(1).unwrap().identity_seen);

        fx.dht.withdraw_identity("peer-1");
        manager.refresh_identities().await.unwrap();

        let family = manager.family(DEFAULT_SCOPE).unwrap();
        assert_eq!(family.peer_at(1), Some(&PeerId::from("peer-4")));
        assert!(family.evicted_positions().is_empty());
        let changes = fx.events.events_of_type("SupplierStateChanged");
        assert_eq!(changes.len(), 1);
        assert_matches!(
            &changes[0],
            DomainEvent::SupplierStateChanged { peer, to, .. } if peer == "peer-1" && to == "Evicted"
        );
        assert_eq!(fx.events.events_of_type("SupplierReplaced").len(), 1);
    }

    #[tokio::test]
    async fn test_withdrawn_identity_stays_evicted_at_replacement_limit() {
        let fx = Fixture::new();
        let all = names(5);
        let config = PlacementConfig {
            candidates: all.iter().map(|c| PeerId::from(c.as_str())).collect(),
            max_pending_replacements: Some(0),
            ..Default::default()
        };
        let manager = FamilyManager::open(
            &fx.path,
            config,
            fx.transport.clone(),
            fx.dht.clone(),
            fx.events.clone(),
        )
        .await
        .unwrap();
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();

        fx.dht.publish_identity("peer-2", &PeerId::from("peer-2"));
        manager.refresh_identities().await.unwrap();
        fx.dht.withdraw_identity("peer-2");
        manager.refresh_identities().await.unwrap();

        assert_eq!(manager.family(DEFAULT_SCOPE).unwrap().evicted_positions(), vec![2]);
        assert!(!manager.serves_reads(&PeerId::from("peer-2")));
    }

    #[tokio::test]
    async fn test_resize_rehires_under_new_map() {
        let fx = Fixture::new();
        let all = names(8);
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let manager = fx.manager(&refs).await;
        manager
            .hire(DEFAULT_SCOPE, &lookup("ecc/2x2").unwrap())
            .await
            .unwrap();

        let resized = manager
            .resize(DEFAULT_SCOPE, &lookup("ecc/4x4").unwrap())
            .await
            .unwrap();
        assert_eq!(resized.len(), 8);
        assert_eq!(resized.ecc_map, "ecc/4x4");
        assert_eq!(resized.generation, 2);
        assert_eq!(resized.peer_at(0), Some(&PeerId::from("peer-0")));
        assert_eq!(fx.events.events_of_type("FamilyResized").len(), 1);
    }
}
