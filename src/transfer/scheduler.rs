//! Scheduler implementation

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{Holder, HolderResolver, TransferConfig};
use crate::domain::ports::{PeerId, Transport};
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::pipeline::{ContentHash, Fragment, FragmentName};

/// A fragment to place
#[derive(Debug, Clone)]
pub struct OutboundFragment {
    pub fragment: Fragment,
    pub position: usize,
    pub holder: Holder,
}

/// A fragment to retrieve, with the hash recorded when it was placed
#[derive(Debug, Clone)]
pub struct InboundFragment {
    pub name: FragmentName,
    pub position: usize,
    pub holder: Holder,
    pub hash: ContentHash,
}

/// Acknowledged placement of one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub name: FragmentName,
    pub position: usize,
    pub peer: PeerId,
    pub hash: ContentHash,
}

#[derive(Debug, Default)]
pub struct BlockUploadReport {
    pub acked: Vec<Ack>,
    pub failed: Vec<(usize, Error)>,
}

#[derive(Debug)]
pub struct BlockFetch {
    /// Verified fragment bytes by position
    pub fragments: Vec<Option<Bytes>>,
    pub failed: Vec<(usize, Error)>,
    /// The decodability check passed before every fetch finished
    pub ready: bool,
}

impl BlockFetch {
    pub fn present(&self) -> Vec<bool> {
        self.fragments.iter().map(Option::is_some).collect()
    }
}

struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        METRICS.inflight_transfers.inc();
        Self
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        METRICS.inflight_transfers.dec();
    }
}

pub struct TransferScheduler {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    global: Semaphore,
    per_peer: DashMap<PeerId, Arc<Semaphore>>,
}

impl std::fmt::Debug for TransferScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferScheduler")
            .field("config", &self.config)
            .field("peers", &self.per_peer.len())
            .finish()
    }
}

impl TransferScheduler {
    pub fn new(transport: Arc<dyn Transport>, config: TransferConfig) -> Self {
        Self {
            transport,
            global: Semaphore::new(config.total_concurrency),
            per_peer: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn peer_semaphore(&self, peer: &PeerId) -> Arc<Semaphore> {
        self.per_peer
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_peer_concurrency)))
            .clone()
    }

    /// One transport call under both caps and the fragment timeout
    async fn exchange<T>(&self, peer: &PeerId, call: impl Future<Output = Result<T>>) -> Result<T> {
        let _global = self
            .global
            .acquire()
            .await
            .map_err(|_| Error::Internal("transfer scheduler closed".into()))?;
        let local = self.peer_semaphore(peer);
        let _local = local
            .acquire()
            .await
            .map_err(|_| Error::Internal("transfer scheduler closed".into()))?;
        let _inflight = InflightGuard::new();

        match tokio::time::timeout(self.config.fragment_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("exchange with {}", peer),
                duration: self.config.fragment_timeout,
            }),
        }
    }

    /// Retry loop shared by sends and fetches
    async fn with_retries<T, F, Fut>(
        &self,
        op: &'static str,
        name: &FragmentName,
        holder: &Holder,
        resolver: &dyn HolderResolver,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<(T, PeerId)>
    where
        F: FnMut(PeerId) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        let mut backoff = self.config.initial_backoff;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(name.to_string()));
            }
            let (peer, reassigned) = resolver.resolve(holder)?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled(name.to_string())),
                _ = reassigned.cancelled() => {
                    debug!(fragment = %name, peer = %peer, "Holder reassigned, requeueing");
                    failures = 0;
                    backoff = self.config.initial_backoff;
                    continue;
                }
                result = self.exchange(&peer, call(peer.clone())) => result,
            };

            let error = match outcome {
                Ok(value) => {
                    resolver.report_success(holder, &peer).await;
                    return Ok((value, peer));
                }
                Err(Error::FragmentNotFound(missing)) => {
                    return Err(Error::FragmentNotFound(missing));
                }
                Err(e) => e,
            };

            failures += 1;
            resolver.report_failure(holder, &peer, &error).await;
            if reassigned.is_cancelled() {
                debug!(fragment = %name, peer = %peer, "Holder replaced after failure, requeueing");
                failures = 0;
                backoff = self.config.initial_backoff;
                continue;
            }
            if failures >= self.config.max_attempts {
                METRICS.transfer_failures.with_label_values(&[op]).inc();
                warn!(fragment = %name, peer = %peer, attempts = failures, error = %error, "Giving up on fragment");
                return Err(Error::PeerUnreachable {
                    peer: peer.to_string(),
                    attempts: failures,
                    reason: error.to_string(),
                });
            }

            debug!(fragment = %name, peer = %peer, attempt = failures, backoff = ?backoff, error = %error, "Exchange failed, backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled(name.to_string())),
                _ = reassigned.cancelled() => {
                    failures = 0;
                    backoff = self.config.initial_backoff;
                    continue;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            METRICS.transfer_retries.inc();
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Place one fragment, returning the peer that acknowledged it
    pub async fn send_fragment(
        &self,
        fragment: &Fragment,
        holder: &Holder,
        resolver: &dyn HolderResolver,
        cancel: &CancellationToken,
    ) -> Result<PeerId> {
        let wire_name = fragment.name.to_string();
        let transport = &self.transport;
        let ((), peer) = self
            .with_retries("send", &fragment.name, holder, resolver, cancel, |peer| {
                let bytes = fragment.bytes.clone();
                let wire_name = wire_name.as_str();
                async move { transport.send(&peer, wire_name, bytes).await }
            })
            .await?;
        METRICS.fragments_sent.inc();
        Ok(peer)
    }

    /// Retrieve one fragment. A holder reporting the fragment missing is not
    /// asked again.
    pub async fn fetch_fragment(
        &self,
        name: &FragmentName,
        holder: &Holder,
        resolver: &dyn HolderResolver,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let wire_name = name.to_string();
        let transport = &self.transport;
        let (bytes, _) = self
            .with_retries("fetch", name, holder, resolver, cancel, |peer| {
                let wire_name = wire_name.as_str();
                async move { transport.fetch(&peer, wire_name).await }
            })
            .await?;
        METRICS.fragments_fetched.inc();
        Ok(bytes)
    }

    /// Send every fragment of a block concurrently. `on_ack` runs for each
    /// acknowledgement as it arrives, before the next one is looked at.
    ///
    /// The block is complete once all but `upload_tolerance` fragments are
    /// acknowledged.
    #[instrument(skip_all, fields(fragments = fragments.len()))]
    pub async fn upload_block<F, Fut>(
        &self,
        fragments: Vec<OutboundFragment>,
        resolver: &dyn HolderResolver,
        cancel: &CancellationToken,
        mut on_ack: F,
    ) -> Result<BlockUploadReport>
    where
        F: FnMut(Ack) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let required = fragments.len().saturating_sub(self.config.upload_tolerance);
        let block_cancel = cancel.child_token();
        let label = fragments
            .first()
            .map(|f| format!("{}/{}", f.fragment.name.backup_id, f.fragment.name.block_number))
            .unwrap_or_default();

        let work = async {
            let token = &block_cancel;
            let mut pending: FuturesUnordered<_> = fragments
                .iter()
                .map(|out| async move {
                    let result = self
                        .send_fragment(&out.fragment, &out.holder, resolver, token)
                        .await;
                    (out, result)
                })
                .collect();

            let mut report = BlockUploadReport::default();
            while let Some((out, result)) = pending.next().await {
                match result {
                    Ok(peer) => {
                        let ack = Ack {
                            name: out.fragment.name.clone(),
                            position: out.position,
                            peer,
                            hash: out.fragment.hash,
                        };
                        on_ack(ack.clone()).await?;
                        report.acked.push(ack);
                    }
                    Err(Error::Cancelled(what)) if cancel.is_cancelled() => {
                        return Err(Error::Cancelled(what));
                    }
                    Err(e) => {
                        warn!(fragment = %out.fragment.name, error = %e, "Fragment not placed");
                        report.failed.push((out.position, e));
                    }
                }
            }
            Ok::<_, Error>(report)
        };

        let report = match tokio::time::timeout(self.config.block_timeout, work).await {
            Ok(report) => report?,
            Err(_) => {
                block_cancel.cancel();
                return Err(Error::Timeout {
                    operation: format!("upload of block {}", label),
                    duration: self.config.block_timeout,
                });
            }
        };

        if report.acked.len() < required {
            let mut failed = report.failed;
            return Err(match failed.drain(..).next() {
                Some((_, error)) => error,
                None => Error::Internal(format!("block {} incomplete", label)),
            });
        }
        Ok(report)
    }

    /// Fetch a block's fragments concurrently until `decodable` accepts the
    /// set of positions present. Outstanding fetches are dropped as soon as
    /// it does. Fragments whose hash does not match are treated as missing.
    #[instrument(skip_all, fields(sources = sources.len()))]
    pub async fn fetch_block<F>(
        &self,
        sources: Vec<InboundFragment>,
        slots: usize,
        resolver: &dyn HolderResolver,
        cancel: &CancellationToken,
        mut decodable: F,
    ) -> Result<BlockFetch>
    where
        F: FnMut(&[bool]) -> bool,
    {
        let mut fragments: Vec<Option<Bytes>> = vec![None; slots];
        let mut failed = Vec::new();
        let mut ready = false;
        let block_cancel = cancel.child_token();

        let work = async {
            let token = &block_cancel;
            let mut pending: FuturesUnordered<_> = sources
                .iter()
                .filter(|src| src.position < slots)
                .map(|src| async move {
                    let result = self
                        .fetch_fragment(&src.name, &src.holder, resolver, token)
                        .await;
                    (src, result)
                })
                .collect();

            while let Some((src, result)) = pending.next().await {
                match result {
                    Ok(bytes) if ContentHash::of(&bytes) == src.hash => {
                        fragments[src.position] = Some(bytes);
                        let present: Vec<bool> = fragments.iter().map(Option::is_some).collect();
                        if decodable(&present) {
                            ready = true;
                            break;
                        }
                    }
                    Ok(_) => {
                        warn!(fragment = %src.name, "Fragment content hash mismatch");
                        failed.push((
                            src.position,
                            Error::FragmentNotFound(format!("{} (content hash mismatch)", src.name)),
                        ));
                    }
                    Err(e) => {
                        debug!(fragment = %src.name, error = %e, "Fragment fetch failed");
                        failed.push((src.position, e));
                    }
                }
            }
        };

        if tokio::time::timeout(self.config.block_timeout, work)
            .await
            .is_err()
        {
            warn!(timeout = ?self.config.block_timeout, "Block fetch timed out");
        }
        block_cancel.cancel();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("block fetch".into()));
        }
        Ok(BlockFetch {
            fragments,
            failed,
            ready,
        })
    }
}
