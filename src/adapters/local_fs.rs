//! Loopback adapters for the command line
//!
//! `DirectoryTransport` stores each peer's fragments under
//! `<root>/peers/<peerID>/<fragment name>`, which is enough to exercise
//! every code path on one machine. `StaticDht` answers supplier discovery
//! from the configured peer list.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;

use crate::domain::ports::{Dht, PeerId, Transport, IDENTITY_PREFIX, SUPPLIERS_KEY};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    root: PathBuf,
}

impl DirectoryTransport {
    /// `root` is the service root; peers live under `root/peers`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().join("peers"),
        }
    }

    fn peer_dir(&self, peer: &PeerId) -> Result<PathBuf> {
        let id = peer.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(Error::Config(format!("invalid peer identifier {:?}", id)));
        }
        Ok(self.root.join(id))
    }

    fn path_for(&self, peer: &PeerId, name: &str) -> Result<PathBuf> {
        if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(Error::Config(format!("invalid fragment name {:?}", name)));
        }
        Ok(self.peer_dir(peer)?.join(name))
    }
}

#[async_trait]
impl Transport for DirectoryTransport {
    async fn send(&self, peer: &PeerId, name: &str, bytes: Bytes) -> Result<()> {
        let path = self.path_for(peer, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn fetch(&self, peer: &PeerId, name: &str) -> Result<Bytes> {
        match tokio::fs::read(self.path_for(peer, name)?).await {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::FragmentNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self, peer: &PeerId) -> Result<()> {
        tokio::fs::create_dir_all(self.peer_dir(peer)?).await?;
        Ok(())
    }

    async fn delete(&self, peer: &PeerId, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(peer, name)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// DHT answering from a fixed peer list, plus whatever is put at runtime
#[derive(Debug, Default)]
pub struct StaticDht {
    peers: Vec<PeerId>,
    values: DashMap<String, Vec<String>>,
}

impl StaticDht {
    pub fn new(peers: Vec<PeerId>) -> Self {
        Self {
            peers,
            values: DashMap::new(),
        }
    }
}

#[async_trait]
impl Dht for StaticDht {
    async fn put(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        let mut values = self.values.entry(key.to_string()).or_default();
        values.retain(|v| v != value);
        values.push(value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<String>> {
        let mut values: Vec<String> = if key == SUPPLIERS_KEY {
            self.peers.iter().map(|p| p.to_string()).collect()
        } else {
            Vec::new()
        };
        if let Some(extra) = self.values.get(key) {
            for value in extra.iter() {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        Ok(values)
    }

    async fn observe(&self, nickname: &str) -> Result<Option<PeerId>> {
        Ok(self
            .values
            .get(&format!("{}{}", IDENTITY_PREFIX, nickname))
            .and_then(|v| v.last().cloned())
            .map(PeerId::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_directory_transport_layout() {
        let dir = tempfile::tempdir().unwrap();
        let transport = DirectoryTransport::new(dir.path());
        let peer = PeerId::from("peer-1");

        transport
            .send(&peer, "F1/0-2-Parity", Bytes::from_static(b"xyz"))
            .await
            .unwrap();
        assert!(dir.path().join("peers/peer-1/F1/0-2-Parity").exists());
        assert_eq!(
            transport.fetch(&peer, "F1/0-2-Parity").await.unwrap(),
            Bytes::from_static(b"xyz")
        );

        transport.delete(&peer, "F1/0-2-Parity").await.unwrap();
        transport.delete(&peer, "F1/0-2-Parity").await.unwrap();
        assert_matches!(
            transport.fetch(&peer, "F1/0-2-Parity").await,
            Err(Error::FragmentNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_directory_transport_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = DirectoryTransport::new(dir.path());
        assert!(transport
            .send(&PeerId::from(".."), "F1/0-0-Data", Bytes::new())
            .await
            .is_err());
        assert!(transport
            .send(&PeerId::from("p"), "../0-0-Data", Bytes::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_static_dht() {
        let dht = StaticDht::new(vec![PeerId::from("a"), PeerId::from("b")]);
        dht.put(SUPPLIERS_KEY, "c", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(dht.get(SUPPLIERS_KEY).await.unwrap(), vec!["a", "b", "c"]);

        dht.put("identity/a", "a2", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(dht.observe("a").await.unwrap(), Some(PeerId::from("a2")));
    }
}
