//! Self-healing service registrar
//!
//! A [`Registrar`] binds one [`Endpoint`] to a directory lease:
//!
//! 1. `register` grants a lease, publishes `<service>/<address>` under it,
//!    opens the keepalive stream and spawns the watch loop.
//! 2. The watch loop waits on the keepalive stream and the registrar's
//!    cancellation token in a single `select!`. When the stream ends it runs
//!    the registration sequence again (bounded retries with backoff). A
//!    re-registration whose keepalive closes before its first renewal counts
//!    as a failed attempt.
//! 3. `unregister` cancels the watch loop first, unconditionally, waits for
//!    it to finish, then revokes the current lease.
//!
//! Progress is published on a [`watch`] channel ([`Registrar::status`]);
//! [`RegistrarState::Lost`] signals that recovery gave up.

use futures_util::StreamExt as _;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::backoff;
use crate::config::{RecoveryConfig, RegistrarConfig};
use crate::directory::{DirectoryClient, DirectoryError, KeepAliveStream, LeaseId, RenewalEvent};
use crate::endpoint::Endpoint;
use crate::error::RegistrarError;
use crate::lease::{Lease, LeaseManager};
use crate::publisher::EndpointPublisher;

/// Observable lifecycle of a registrar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrarState {
    /// Constructed, or the last `register` call failed.
    Unregistered,
    Registering,
    /// The endpoint is published under `lease` and the lease is renewed.
    Registered { lease: LeaseId },
    /// The lease was lost; running re-registration attempt `attempt` (1-based).
    Recovering { attempt: u32 },
    /// Recovery exhausted its attempts; nothing is published until the next
    /// `register`.
    Lost,
    Unregistering,
    /// `unregister` completed; terminal.
    Terminated,
}

struct Shared<D: ?Sized> {
    endpoint: Endpoint,
    key: String,
    leases: LeaseManager<D>,
    publisher: EndpointPublisher<D>,
    recovery: RecoveryConfig,
    /// Most recently granted lease; what `unregister` revokes.
    current: Mutex<Option<LeaseId>>,
    status: watch::Sender<RegistrarState>,
}

impl<D> Shared<D>
where
    D: DirectoryClient + ?Sized,
{
    fn set_state(&self, state: RegistrarState) {
        self.status.send_replace(state);
    }

    /// Grant, publish, keep alive. Stops at the first failure; nothing is
    /// rolled back.
    async fn register_once(&self) -> Result<(Lease, KeepAliveStream), RegistrarError> {
        let lease = self.leases.grant().await?;
        *self.current.lock() = Some(lease.id);
        self.publisher.publish(&self.endpoint, &lease).await?;
        let keepalive = self.leases.keep_alive(&lease).await?;
        Ok((lease, keepalive))
    }
}

/// Keeps an endpoint registered in a directory for as long as it lives.
///
/// `register` and `unregister` take `&mut self`: one owner drives the
/// lifecycle. Dropping the registrar stops its watch loop but does not
/// revoke the lease; the directory removes the key once the TTL runs out.
pub struct Registrar<D: ?Sized = dyn DirectoryClient> {
    shared: Arc<Shared<D>>,
    cancel: CancellationToken,
    watch: Option<JoinHandle<()>>,
    terminated: bool,
}

impl<D: ?Sized> Drop for Registrar<D> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<D> Registrar<D>
where
    D: DirectoryClient + ?Sized + 'static,
{
    #[must_use]
    pub fn new(directory: Arc<D>, endpoint: Endpoint, config: RegistrarConfig) -> Self {
        let (status, _) = watch::channel(RegistrarState::Unregistered);
        let key = endpoint.key();
        Self {
            shared: Arc::new(Shared {
                endpoint,
                key,
                leases: LeaseManager::new(Arc::clone(&directory), config.lease_ttl),
                publisher: EndpointPublisher::new(directory),
                recovery: config.recovery,
                current: Mutex::new(None),
                status,
            }),
            cancel: CancellationToken::new(),
            watch: None,
            terminated: false,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Registration key, `<service>/<address>`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Lease the endpoint is currently published under, if any.
    #[must_use]
    pub fn lease_id(&self) -> Option<LeaseId> {
        *self.shared.current.lock()
    }

    #[must_use]
    pub fn state(&self) -> RegistrarState {
        *self.shared.status.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<RegistrarState> {
        self.shared.status.subscribe()
    }

    /// Publish the endpoint and start keeping its lease alive.
    ///
    /// Calling it again is allowed once the watch loop has stopped on its own
    /// ([`RegistrarState::Lost`]).
    ///
    /// # Errors
    /// - [`RegistrarError::DirectoryUnavailable`] / [`RegistrarError::GrantFailed`]
    ///   if no lease could be granted
    /// - [`RegistrarError::PublishFailed`] if the key could not be written
    /// - [`RegistrarError::KeepAliveLost`] if the lease cannot be renewed
    /// - [`RegistrarError::AlreadyRegistered`] while the watch loop is running
    /// - [`RegistrarError::Terminated`] after `unregister`
    pub async fn register(&mut self) -> Result<(), RegistrarError> {
        if self.terminated {
            return Err(RegistrarError::Terminated(self.shared.key.clone()));
        }
        if let Some(handle) = self.watch.take() {
            // A Lost watch loop has already given up and is about to return.
            if !handle.is_finished() && self.state() != RegistrarState::Lost {
                self.watch = Some(handle);
                return Err(RegistrarError::AlreadyRegistered(self.shared.key.clone()));
            }
            if let Err(e) = handle.await {
                tracing::warn!(key = %self.shared.key, error = %e, "Lease watch task failed");
            }
        }

        self.shared.set_state(RegistrarState::Registering);
        let (lease, keepalive) = match self.shared.register_once().await {
            Ok(registered) => registered,
            Err(e) => {
                self.shared.set_state(RegistrarState::Unregistered);
                return Err(e);
            }
        };
        self.shared
            .set_state(RegistrarState::Registered { lease: lease.id });

        tracing::info!(
            key = %self.shared.key,
            lease_id = %lease.id,
            ttl = ?lease.ttl,
            "Endpoint registered"
        );

        let span = tracing::info_span!("lease_watch", key = %self.shared.key);
        self.watch = Some(tokio::spawn(
            watch_loop(
                Arc::clone(&self.shared),
                keepalive,
                self.cancel.clone(),
                lease.id,
            )
            .instrument(span),
        ));
        Ok(())
    }

    /// Stop keeping the endpoint alive and revoke its lease.
    ///
    /// The watch loop is cancelled and awaited before the revoke call, and
    /// regardless of its outcome. The registrar is terminal afterwards;
    /// further calls return `Ok(())` without touching the directory.
    ///
    /// # Errors
    /// [`RegistrarError::RevokeFailed`] if the directory could not revoke the
    /// lease. A lease the directory no longer knows is treated as revoked.
    pub async fn unregister(&mut self) -> Result<(), RegistrarError> {
        self.cancel.cancel();
        if let Some(handle) = self.watch.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(key = %self.shared.key, error = %e, "Lease watch task failed");
        }

        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.shared.set_state(RegistrarState::Unregistering);

        let lease = self.shared.current.lock().take();
        let result = match lease {
            Some(id) => match self.shared.leases.revoke(id).await {
                Err(RegistrarError::RevokeFailed {
                    source: DirectoryError::LeaseNotFound(_),
                    ..
                }) => {
                    tracing::debug!(lease_id = %id, "Lease already gone at revoke");
                    Ok(())
                }
                other => other,
            },
            None => Ok(()),
        };
        self.shared.set_state(RegistrarState::Terminated);

        match &result {
            Ok(()) => tracing::info!(key = %self.shared.key, "Endpoint unregistered"),
            Err(e) => tracing::warn!(
                key = %self.shared.key,
                error = %e,
                "Endpoint unregistered locally, lease revoke failed"
            ),
        }
        result
    }
}

enum Signal {
    Cancelled,
    KeepAlive(Option<RenewalEvent>),
}

enum Recovery {
    Registered {
        lease: LeaseId,
        keepalive: KeepAliveStream,
        attempt: u32,
    },
    Cancelled,
    GaveUp,
}

async fn watch_loop<D>(
    shared: Arc<Shared<D>>,
    mut keepalive: KeepAliveStream,
    cancel: CancellationToken,
    mut lease: LeaseId,
) where
    D: DirectoryClient + ?Sized,
{
    let mut first_renewal = true;
    // Recovery attempt that produced `lease`, until its first renewal arrives.
    let mut unconfirmed: Option<u32> = None;
    loop {
        let signal = tokio::select! {
            biased;
            () = cancel.cancelled() => Signal::Cancelled,
            event = keepalive.next() => Signal::KeepAlive(event),
        };

        match signal {
            Signal::Cancelled => {
                tracing::info!(key = %shared.key, lease_id = %lease, "Lease keepalive stopped");
                return;
            }
            Signal::KeepAlive(Some(RenewalEvent { ttl })) => {
                unconfirmed = None;
                if first_renewal {
                    tracing::info!(key = %shared.key, lease_id = %lease, ttl, "Lease renewed");
                    first_renewal = false;
                } else {
                    tracing::debug!(key = %shared.key, lease_id = %lease, ttl, "Lease renewed");
                }
            }
            Signal::KeepAlive(None) => {
                let outcome = match unconfirmed {
                    None => {
                        tracing::warn!(
                            key = %shared.key,
                            lease_id = %lease,
                            "Keepalive closed, lease lost"
                        );
                        recover(&shared, &cancel, 1).await
                    }
                    Some(attempt) => {
                        // The last attempt never got a renewal through; it failed.
                        shared.set_state(RegistrarState::Recovering { attempt });
                        let closed = "keepalive closed before the first renewal";
                        match back_off(&shared, &cancel, attempt, &closed).await {
                            Some(stop) => stop,
                            None => recover(&shared, &cancel, attempt + 1).await,
                        }
                    }
                };
                match outcome {
                    Recovery::Registered {
                        lease: new_lease,
                        keepalive: stream,
                        attempt,
                    } => {
                        lease = new_lease;
                        keepalive = stream;
                        first_renewal = true;
                        unconfirmed = Some(attempt);
                    }
                    Recovery::Cancelled => {
                        tracing::info!(key = %shared.key, "Recovery cancelled");
                        return;
                    }
                    Recovery::GaveUp => return,
                }
            }
        }
    }
}

/// Re-run the registration sequence from `attempt` until it succeeds, the
/// attempts run out or the registrar is cancelled.
async fn recover<D>(shared: &Shared<D>, cancel: &CancellationToken, mut attempt: u32) -> Recovery
where
    D: DirectoryClient + ?Sized,
{
    loop {
        shared.set_state(RegistrarState::Recovering { attempt });

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Recovery::Cancelled,
            outcome = shared.register_once() => outcome,
        };

        match outcome {
            Ok((lease, keepalive)) => {
                shared.set_state(RegistrarState::Registered { lease: lease.id });
                tracing::info!(
                    key = %shared.key,
                    lease_id = %lease.id,
                    attempt,
                    "Endpoint re-registered"
                );
                return Recovery::Registered {
                    lease: lease.id,
                    keepalive,
                    attempt,
                };
            }
            Err(e) => {
                if let Some(stop) = back_off(shared, cancel, attempt, &e).await {
                    return stop;
                }
            }
        }
        attempt += 1;
    }
}

/// Account for failed attempt `attempt`: give up once the attempts are used
/// up, otherwise sleep out the backoff. `None` means try again.
async fn back_off<D>(
    shared: &Shared<D>,
    cancel: &CancellationToken,
    attempt: u32,
    err: &(dyn std::fmt::Display + Sync),
) -> Option<Recovery>
where
    D: DirectoryClient + ?Sized,
{
    if attempt >= shared.recovery.attempts() {
        shared.set_state(RegistrarState::Lost);
        tracing::error!(
            key = %shared.key,
            attempts = attempt,
            error = %err,
            "Re-registration failed, giving up"
        );
        return Some(Recovery::GaveUp);
    }

    let delay = backoff::delay_for(&shared.recovery, attempt - 1);
    tracing::warn!(
        key = %shared.key,
        attempt,
        error = %err,
        backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "Re-registration attempt failed"
    );

    tokio::select! {
        biased;
        () = cancel.cancelled() => Some(Recovery::Cancelled),
        () = tokio::time::sleep(delay) => None,
    }
}
