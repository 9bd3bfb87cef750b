//! In-process directory
//!
//! `MemoryDirectory` implements the full directory contract inside the
//! process: leases expire when they are not renewed within their TTL, keys
//! disappear with their lease, and keepalive streams are driven by a renewer
//! task per stream. It backs the `standalone` mode of the greeter binary and
//! doubles as the directory in tests, with hooks to force lease loss and
//! inject failures.

use async_trait::async_trait;
use futures_util::StreamExt as _;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::directory::{
    DirectoryClient, DirectoryError, DirectoryLookup, KeepAliveStream, KeyValue, LeaseId,
    RenewalEvent, ttl_seconds,
};

/// Renewals are sent this many times per TTL window.
const RENEWALS_PER_TTL: u32 = 3;

const KEEPALIVE_BUFFER: usize = 16;

struct LeaseEntry {
    ttl: Duration,
    expires_at: Instant,
    /// Cancelled when the lease is revoked or expires; stops its renewers.
    gone: CancellationToken,
}

struct Entry {
    value: String,
    lease: LeaseId,
}

#[derive(Default)]
struct State {
    leases: HashMap<LeaseId, LeaseEntry>,
    keys: BTreeMap<String, Entry>,
}

impl State {
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&id) else {
            return false;
        };
        entry.gone.cancel();
        self.keys.retain(|_, e| e.lease != id);
        true
    }

    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(lease_id = %id, "Lease expired");
            self.drop_lease(id);
        }
    }
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    failing_grants: AtomicU32,
    read_only: AtomicBool,
    failing_revokes: AtomicBool,
    renewals_paused: AtomicBool,
}

struct Inner {
    state: Mutex<State>,
    next_lease: AtomicI64,
    faults: Faults,
    grants: AtomicUsize,
    revoked: Mutex<Vec<LeaseId>>,
}

impl Inner {
    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable(
                "memory directory is offline".to_owned(),
            ));
        }
        Ok(())
    }

    /// Extend a lease by its TTL; `None` once it can no longer be renewed.
    fn renew(&self, id: LeaseId) -> Option<i64> {
        if self.faults.unavailable.load(Ordering::SeqCst)
            || self.faults.renewals_paused.load(Ordering::SeqCst)
        {
            return None;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reap_expired(now);
        let lease = state.leases.get_mut(&id)?;
        lease.expires_at = now + lease.ttl;
        Some(ttl_seconds(lease.ttl))
    }
}

/// Directory kept in process memory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<Inner>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryDirectory")
            .field("leases", &state.leases.len())
            .field("keys", &state.keys.len())
            .finish()
    }
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_lease: AtomicI64::new(1),
                faults: Faults::default(),
                grants: AtomicUsize::new(0),
                revoked: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current entry under `key`, if its lease is still alive.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        let mut state = self.inner.state.lock();
        state.reap_expired(Instant::now());
        state.keys.get(key).map(|e| KeyValue {
            key: key.to_owned(),
            value: e.value.clone(),
            lease: Some(e.lease),
        })
    }

    /// Whether `lease` is granted and not yet expired or revoked.
    #[must_use]
    pub fn is_lease_alive(&self, lease: LeaseId) -> bool {
        let mut state = self.inner.state.lock();
        state.reap_expired(Instant::now());
        state.leases.contains_key(&lease)
    }

    /// Number of leases currently alive.
    #[must_use]
    pub fn live_leases(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.reap_expired(Instant::now());
        state.leases.len()
    }

    /// Number of successful grants so far.
    #[must_use]
    pub fn grant_count(&self) -> usize {
        self.inner.grants.load(Ordering::SeqCst)
    }

    /// Leases revoked through [`DirectoryClient::revoke`], in call order.
    #[must_use]
    pub fn revoked(&self) -> Vec<LeaseId> {
        self.inner.revoked.lock().clone()
    }

    /// Drop a lease as if its TTL ran out: its keys vanish and its
    /// keepalive streams end. Returns `false` if the lease was not alive.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.inner.state.lock().drop_lease(lease)
    }

    /// Make every operation fail with [`DirectoryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner
            .faults
            .unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` grants with [`DirectoryError::Unavailable`].
    pub fn fail_next_grants(&self, n: u32) {
        self.inner.faults.failing_grants.store(n, Ordering::SeqCst);
    }

    /// Reject key writes with [`DirectoryError::Rejected`].
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.faults.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Fail revokes with [`DirectoryError::Unavailable`]; the lease stays.
    pub fn set_failing_revokes(&self, failing: bool) {
        self.inner
            .faults
            .failing_revokes
            .store(failing, Ordering::SeqCst);
    }

    /// Stop renewing leases; open keepalive streams end at their next tick
    /// and the leases expire once their TTL runs out.
    pub fn pause_renewals(&self, paused: bool) {
        self.inner
            .faults
            .renewals_paused
            .store(paused, Ordering::SeqCst);
    }

    fn renew_interval(ttl: Duration) -> Duration {
        (ttl / RENEWALS_PER_TTL).max(Duration::from_millis(1))
    }
}

#[async_trait]
impl DirectoryClient for MemoryDirectory {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, DirectoryError> {
        self.inner.check_available()?;

        let failing = &self.inner.faults.failing_grants;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DirectoryError::Unavailable(
                "lease grant timed out".to_owned(),
            ));
        }

        let id = LeaseId(self.inner.next_lease.fetch_add(1, Ordering::SeqCst));
        let ttl = Duration::from_secs(ttl_seconds(ttl).unsigned_abs());
        self.inner.state.lock().leases.insert(
            id,
            LeaseEntry {
                ttl,
                expires_at: Instant::now() + ttl,
                gone: CancellationToken::new(),
            },
        );
        self.inner.grants.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), DirectoryError> {
        self.inner.check_available()?;
        if self.inner.faults.failing_revokes.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable(
                "lease revoke timed out".to_owned(),
            ));
        }

        let removed = {
            let mut state = self.inner.state.lock();
            state.reap_expired(Instant::now());
            state.drop_lease(lease)
        };
        if !removed {
            return Err(DirectoryError::LeaseNotFound(lease));
        }
        self.inner.revoked.lock().push(lease);
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, DirectoryError> {
        self.inner.check_available()?;

        let (ttl, gone) = {
            let mut state = self.inner.state.lock();
            state.reap_expired(Instant::now());
            let entry = state
                .leases
                .get(&lease)
                .ok_or(DirectoryError::LeaseNotFound(lease))?;
            (entry.ttl, entry.gone.clone())
        };

        let (tx, rx) = mpsc::channel(KEEPALIVE_BUFFER);
        let inner = Arc::clone(&self.inner);
        let interval = Self::renew_interval(ttl);

        tokio::spawn(async move {
            loop {
                let Some(ttl) = inner.renew(lease) else {
                    tracing::debug!(lease_id = %lease, "Renewal failed, closing keepalive");
                    break;
                };
                if tx.send(RenewalEvent { ttl }).await.is_err() {
                    break;
                }
                tokio::select! {
                    () = gone.cancelled() => break,
                    () = tx.closed() => break,
                    () = tokio::time::sleep(interval) => {}
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
        self.inner.check_available()?;
        if self.inner.faults.read_only.load(Ordering::SeqCst) {
            return Err(DirectoryError::Rejected(
                "memory directory is read-only".to_owned(),
            ));
        }

        let mut state = self.inner.state.lock();
        state.reap_expired(Instant::now());
        if !state.leases.contains_key(&lease) {
            return Err(DirectoryError::LeaseNotFound(lease));
        }
        state.keys.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                lease,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl DirectoryLookup for MemoryDirectory {
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, DirectoryError> {
        self.inner.check_available()?;

        let mut state = self.inner.state.lock();
        state.reap_expired(Instant::now());
        Ok(state
            .keys
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                lease: Some(e.lease),
            })
            .collect())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn grant_issues_distinct_leases() {
        let dir = MemoryDirectory::new();
        let a = dir.grant_lease(TTL).await.unwrap();
        let b = dir.grant_lease(TTL).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(dir.grant_count(), 2);
        assert_eq!(dir.live_leases(), 2);
    }

    #[tokio::test]
    async fn key_requires_live_lease() {
        let dir = MemoryDirectory::new();
        let err = dir
            .register_key("app/h:1", "v", LeaseId(42))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::LeaseNotFound(LeaseId(42))));
    }

    #[tokio::test]
    async fn revoke_removes_bound_keys() {
        let dir = MemoryDirectory::new();
        let lease = dir.grant_lease(TTL).await.unwrap();
        dir.register_key("app/h:1", "v", lease).await.unwrap();
        assert!(dir.get("app/h:1").is_some());

        dir.revoke(lease).await.unwrap();
        assert!(dir.get("app/h:1").is_none());
        assert_eq!(dir.revoked(), vec![lease]);

        let err = dir.revoke(lease).await.unwrap_err();
        assert!(matches!(err, DirectoryError::LeaseNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unrenewed_lease_expires_after_ttl() {
        let dir = MemoryDirectory::new();
        let lease = dir.grant_lease(TTL).await.unwrap();
        dir.register_key("app/h:1", "v", lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(dir.is_lease_alive(lease));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!dir.is_lease_alive(lease));
        assert!(dir.get("app/h:1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_renews_and_ends_on_expiry() {
        let dir = MemoryDirectory::new();
        let lease = dir.grant_lease(TTL).await.unwrap();
        let mut stream = dir.keep_alive(lease).await.unwrap();

        assert_eq!(stream.next().await, Some(RenewalEvent { ttl: 5 }));
        // Well past the first TTL window, still alive thanks to renewals
        for _ in 0..5 {
            assert_eq!(stream.next().await, Some(RenewalEvent { ttl: 5 }));
        }
        assert!(dir.is_lease_alive(lease));

        assert!(dir.expire_lease(lease));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_renewals_close_stream_then_lease_expires() {
        let dir = MemoryDirectory::new();
        let lease = dir.grant_lease(TTL).await.unwrap();
        let mut stream = dir.keep_alive(lease).await.unwrap();
        assert!(stream.next().await.is_some());

        dir.pause_renewals(true);
        assert_eq!(stream.next().await, None);
        assert!(dir.is_lease_alive(lease));

        tokio::time::advance(TTL).await;
        assert!(!dir.is_lease_alive(lease));
    }

    #[tokio::test]
    async fn keepalive_for_unknown_lease_fails() {
        let dir = MemoryDirectory::new();
        assert!(matches!(
            dir.keep_alive(LeaseId(7)).await,
            Err(DirectoryError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let dir = MemoryDirectory::new();
        let lease = dir.grant_lease(TTL).await.unwrap();
        dir.register_key("app/a:1", "1", lease).await.unwrap();
        dir.register_key("app/b:2", "2", lease).await.unwrap();
        dir.register_key("apple/c:3", "3", lease).await.unwrap();

        let keys: Vec<String> = dir
            .list("app/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["app/a:1", "app/b:2"]);
    }

    #[tokio::test]
    async fn fault_injection() {
        let dir = MemoryDirectory::new();

        dir.fail_next_grants(1);
        assert!(dir.grant_lease(TTL).await.unwrap_err().is_unavailable());
        let lease = dir.grant_lease(TTL).await.unwrap();

        dir.set_read_only(true);
        assert!(matches!(
            dir.register_key("k", "v", lease).await,
            Err(DirectoryError::Rejected(_))
        ));
        dir.set_read_only(false);

        dir.set_failing_revokes(true);
        assert!(dir.revoke(lease).await.is_err());
        assert!(dir.is_lease_alive(lease));
        dir.set_failing_revokes(false);

        dir.set_unavailable(true);
        assert!(dir.grant_lease(TTL).await.unwrap_err().is_unavailable());
        assert!(dir.list("").await.is_err());
    }
}
