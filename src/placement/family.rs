//! Supplier families
//!
//! A family is the ordered list of `D+P` suppliers for a scope. Position
//! `i` holds fragment slot `i` of every block placed under the family:
//! data index `i` for `i < D`, parity index `i - D` after that.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::supplier::{Supplier, SupplierState};
use crate::domain::ports::PeerId;
use crate::ec::EccMap;
use crate::error::{Error, Result};

/// Scope of the customer-wide family
pub const DEFAULT_SCOPE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierFamily {
    pub scope: String,
    pub ecc_map: String,
    pub data_fragments: usize,
    pub generation: u64,
    pub updated_at: DateTime<Utc>,
    suppliers: Vec<Supplier>,
}

impl SupplierFamily {
    /// Build a family from exactly `D+P` distinct peers
    pub fn new(scope: impl Into<String>, map: &EccMap, peers: Vec<PeerId>) -> Result<Self> {
        let scope = scope.into();
        if peers.len() != map.total_fragments() {
            return Err(Error::NoCandidate(format!(
                "family {} needs {} suppliers for {}, got {}",
                scope,
                map.total_fragments(),
                map.name(),
                peers.len()
            )));
        }
        let distinct: HashSet<&PeerId> = peers.iter().collect();
        if distinct.len() != peers.len() {
            return Err(Error::Config(format!(
                "family {} lists a peer more than once",
                scope
            )));
        }
        let suppliers = peers
            .into_iter()
            .enumerate()
            .map(|(position, peer)| Supplier::new(peer, position))
            .collect();
        Ok(Self {
            scope,
            ecc_map: map.name().to_string(),
            data_fragments: map.data_fragments(),
            generation: 1,
            updated_at: Utc::now(),
            suppliers,
        })
    }

    pub fn len(&self) -> usize {
        self.suppliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suppliers.is_empty()
    }

    pub fn suppliers(&self) -> &[Supplier] {
        &self.suppliers
    }

    pub fn supplier(&self, position: usize) -> Option<&Supplier> {
        self.suppliers.get(position)
    }

    pub(crate) fn supplier_mut(&mut self, position: usize) -> Option<&mut Supplier> {
        self.suppliers.get_mut(position)
    }

    pub fn peer_at(&self, position: usize) -> Option<&PeerId> {
        self.suppliers.get(position).map(|s| &s.peer_id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.suppliers.iter().map(|s| s.peer_id.clone()).collect()
    }

    pub fn position_of(&self, peer: &PeerId) -> Option<usize> {
        self.suppliers.iter().position(|s| &s.peer_id == peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.position_of(peer).is_some()
    }

    /// Positions whose supplier is Evicted
    pub fn evicted_positions(&self) -> Vec<usize> {
        self.suppliers
            .iter()
            .filter(|s| s.state == SupplierState::Evicted)
            .map(|s| s.position)
            .collect()
    }

    /// Put a different peer at one position. Nothing else changes.
    pub(crate) fn assign(&mut self, position: usize, peer: PeerId) -> Result<PeerId> {
        if let Some(existing) = self.position_of(&peer) {
            if existing != position {
                return Err(Error::Config(format!(
                    "peer {} already holds position {} of family {}",
                    peer, existing, self.scope
                )));
            }
        }
        let len = self.suppliers.len();
        let slot = self.suppliers.get_mut(position).ok_or_else(|| {
            Error::Config(format!("position {} out of range 0..{}", position, len))
        })?;
        let old = std::mem::replace(slot, Supplier::new(peer, position));
        self.generation += 1;
        self.updated_at = Utc::now();
        Ok(old.peer_id)
    }

    /// Swap an identifier in place, keeping state and history
    pub(crate) fn rename(&mut self, old: &PeerId, new: &PeerId) -> bool {
        match self.suppliers.iter_mut().find(|s| &s.peer_id == old) {
            Some(supplier) => {
                supplier.peer_id = new.clone();
                self.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::BackupId;
    use crate::ec::lookup;
    use crate::pipeline::{FragmentKind, FragmentName};
    use assert_matches::assert_matches;

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n).map(|i| PeerId::from(format!("peer-{i}"))).collect()
    }

    #[test]
    fn test_family_positions() {
        let map = lookup("ecc/4x4").unwrap();
        let family = SupplierFamily::new(DEFAULT_SCOPE, &map, peers(8)).unwrap();
        assert_eq!(family.len(), 8);

        let parity = FragmentName::new(BackupId::from("F1"), 0, FragmentKind::Parity, 1);
        assert_eq!(family.peer_at(parity.position(family.data_fragments)), Some(&PeerId::from("peer-5")));
        let data = FragmentName::new(BackupId::from("F1"), 9, FragmentKind::Data, 3);
        assert_eq!(family.peer_at(data.position(family.data_fragments)), Some(&PeerId::from("peer-3")));
    }

    #[test]
    fn test_family_requires_exact_size() {
        let map = lookup("ecc/4x4").unwrap();
        assert_matches!(
            SupplierFamily::new(DEFAULT_SCOPE, &map, peers(7)),
            Err(Error::NoCandidate(_))
        );
        let mut dup = peers(7);
        dup.push(PeerId::from("peer-0"));
        assert_matches!(
            SupplierFamily::new(DEFAULT_SCOPE, &map, dup),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_assign_mutates_one_position() {
        let map = lookup("ecc/2x2").unwrap();
        let mut family = SupplierFamily::new(DEFAULT_SCOPE, &map, peers(4)).unwrap();
        let before = family.peers();

        let old = family.assign(2, PeerId::from("spare")).unwrap();
        assert_eq!(old, PeerId::from("peer-2"));
        assert_eq!(family.generation, 2);
        for (pos, peer) in family.peers().iter().enumerate() {
            if pos == 2 {
                assert_eq!(peer, &PeerId::from("spare"));
            } else {
                assert_eq!(peer, &before[pos]);
            }
        }
        assert!(family.assign(0, PeerId::from("peer-1")).is_err());
    }

    #[test]
    fn test_rename_keeps_composition() {
        let map = lookup("ecc/2x2").unwrap();
        let mut family = SupplierFamily::new(DEFAULT_SCOPE, &map, peers(4)).unwrap();
        assert!(family.rename(&PeerId::from("peer-1"), &PeerId::from("peer-1b")));
        assert_eq!(family.position_of(&PeerId::from("peer-1b")), Some(1));
        assert_eq!(family.generation, 1);
        assert!(!family.rename(&PeerId::from("ghost"), &PeerId::from("x")));
    }
}
