//! etcd v3 directory backend

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions};
use futures_util::StreamExt as _;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::directory::{
    DirectoryClient, DirectoryError, DirectoryLookup, KeepAliveStream, KeyValue, LeaseId,
    RenewalEvent, ttl_seconds,
};

/// Renewals are never sent more often than this.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);

const KEEPALIVE_BUFFER: usize = 16;

const GRPC_DEADLINE_EXCEEDED: i32 = 4;
const GRPC_UNAVAILABLE: i32 = 14;

/// Directory backed by an etcd cluster.
///
/// The underlying client multiplexes one channel; clones are cheap and every
/// call works on its own clone.
#[derive(Clone)]
pub struct EtcdDirectory {
    client: Client,
}

impl std::fmt::Debug for EtcdDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdDirectory").finish_non_exhaustive()
    }
}

impl EtcdDirectory {
    /// Connect to the cluster.
    ///
    /// # Errors
    /// [`DirectoryError::Unavailable`] if no endpoint can be reached within
    /// `dial_timeout`.
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self, DirectoryError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        tracing::info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn classify(err: etcd_client::Error, lease: Option<LeaseId>) -> DirectoryError {
    match err {
        etcd_client::Error::TransportError(e) => DirectoryError::Unavailable(e.to_string()),
        etcd_client::Error::IoError(e) => DirectoryError::Unavailable(e.to_string()),
        etcd_client::Error::GRpcStatus(status) => {
            classify_status(i32::from(status.code()), status.message(), lease)
        }
        other => DirectoryError::Rejected(other.to_string()),
    }
}

fn classify_status(code: i32, message: &str, lease: Option<LeaseId>) -> DirectoryError {
    if code == GRPC_UNAVAILABLE || code == GRPC_DEADLINE_EXCEEDED {
        return DirectoryError::Unavailable(message.to_owned());
    }
    match lease {
        Some(lease) if message.contains("lease not found") => {
            DirectoryError::LeaseNotFound(lease)
        }
        _ => DirectoryError::Rejected(message.to_owned()),
    }
}

fn renew_interval(ttl_secs: i64) -> Duration {
    (Duration::from_secs(ttl_secs.unsigned_abs()) / 3).max(MIN_RENEW_INTERVAL)
}

#[async_trait]
impl DirectoryClient for EtcdDirectory {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, DirectoryError> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_seconds(ttl), None)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(LeaseId(resp.id()))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), DirectoryError> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease.0)
            .await
            .map_err(|e| classify(e, Some(lease)))?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, DirectoryError> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease.0)
            .await
            .map_err(|e| classify(e, Some(lease)))?;

        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER);
        tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(lease_id = %lease, error = %e, "Keepalive request failed");
                    break;
                }
                let ttl = match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => resp.ttl(),
                    Ok(Some(_)) => {
                        tracing::debug!(lease_id = %lease, "Lease expired on the server");
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(lease_id = %lease, error = %e, "Keepalive response failed");
                        break;
                    }
                };
                if tx.send(RenewalEvent { ttl }).await.is_err() {
                    break;
                }
                tokio::select! {
                    () = tx.closed() => break,
                    () = tokio::time::sleep(renew_interval(ttl)) => {}
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn register_key(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<(), DirectoryError> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await
            .map_err(|e| classify(e, Some(lease)))?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryLookup for EtcdDirectory {
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, DirectoryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| classify(e, None))?;

        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let (Ok(key), Ok(value)) = (kv.key_str(), kv.value_str()) else {
                tracing::warn!("Skipping non UTF-8 directory entry");
                continue;
            };
            out.push(KeyValue {
                key: key.to_owned(),
                value: value.to_owned(),
                lease: (kv.lease() != 0).then_some(LeaseId(kv.lease())),
            });
        }
        Ok(out)
    }
}
