//! # Migration Coordinator
//!
//! Role-side half of a hand-off. The coordinator talks to the relay hub over
//! one [`RelayLink`] and correlates answers by identity:
//!
//! - outbound: [`MigrationCoordinator::request_migration`] sends a
//!   `MigrateRequest` and awaits the matching `MigrateResult`, then redirects
//!   the client or rolls the session back
//! - inbound: a corroborated migration-in sends `ClaimAuthority`; the
//!   matching `AuthorityResult` activates or closes the waiting session
//! - teardown: a closing session that held or was acquiring authority sends
//!   `ReleaseAuthority`
//!
//! No caller blocks a thread on the hub; every wait is an awaited `oneshot`.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelayConfig;
use crate::core::codec::RelayCodec;
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::opcode::server;
use crate::protocol::relay::{Endpoint, Identity, RelayMessage, RoleId};
use crate::session::connection::{CloseReason, Session, SessionListener};
use crate::session::pipeline::AuthorityClaim;
use crate::session::state::MigrateState;
use crate::utils::metrics::Metrics;

/// Build the client redirect: `accepted(bool) [ip(4) port(u16)]`.
pub fn redirect(endpoint: Option<Endpoint>) -> Message {
    let mut msg = Message::new(server::MIGRATE_COMMAND);
    msg.put_bool(endpoint.is_some());
    if let Some(endpoint) = endpoint {
        msg.put_bytes(&endpoint.ip.octets()).put_u16(endpoint.port);
    }
    msg
}

fn link_down() -> ProtocolError {
    ProtocolError::Custom(constants::ERR_RELAY_LINK_DOWN.to_string())
}

pub struct MigrationCoordinator {
    role: RoleId,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<Identity, oneshot::Sender<Option<Endpoint>>>>,
    claims: Mutex<HashMap<Identity, Weak<Session>>>,
    request_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("role", &self.role)
            .field("pending", &self.pending().len())
            .field("claims", &self.claims().len())
            .finish()
    }
}

impl MigrationCoordinator {
    /// New coordinator for the role instance `role`. The returned receiver
    /// yields encoded relay messages for the hub; hand it to [`RelayLink::spawn`].
    pub fn new(
        role: RoleId,
        config: &RelayConfig,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            role,
            outbound,
            pending: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            request_timeout: config.request_timeout,
            metrics,
        });
        (coordinator, rx)
    }

    pub fn role(&self) -> RoleId {
        self.role
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Identity, oneshot::Sender<Option<Endpoint>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<Identity, Weak<Session>>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_to_hub(&self, msg: &RelayMessage) -> Result<()> {
        let encoded = msg.to_message()?;
        self.outbound.send(encoded).map_err(|_| link_down())
    }

    /// Publish this channel's advisory population.
    pub fn report_population(&self, population: u32) -> Result<()> {
        match self.role {
            RoleId::Channel { world, channel } => self.send_to_hub(&RelayMessage::ReportPopulation {
                world_id: world,
                channel_id: channel,
                population,
            }),
            _ => Ok(()),
        }
    }

    /// Move `session` to the role `target`.
    ///
    /// On success the client has been redirected and the session waits in
    /// `WaitHandoffOut` for the client to leave. A directory miss sends a
    /// declined redirect, rolls the session back to `Active` and returns
    /// [`ProtocolError::DirectoryMiss`]. Any other error has closed the session.
    #[instrument(skip(self, session), fields(session = session.sn(), target = %target))]
    pub async fn request_migration(&self, session: &Arc<Session>, target: RoleId) -> Result<Endpoint> {
        let result = self.migrate(session, target).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                debug!(error = %e, "Migration failed, closing session");
                session.close(CloseReason::from(e));
            }
        }
        result
    }

    async fn migrate(&self, session: &Arc<Session>, target: RoleId) -> Result<Endpoint> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let identity = {
            let mut pending = self.pending();
            if let Some(identity) = session.identity() {
                if pending.contains_key(&identity) {
                    return Err(ProtocolError::Custom(constants::ERR_MIGRATION_PENDING.to_string()));
                }
            }
            let identity = session.begin_migration(target, Instant::now())?;
            pending.insert(identity, reply_tx);
            identity
        };
        self.metrics.migration_requested();

        let request = RelayMessage::MigrateRequest {
            identity,
            from: self.role,
            to: target,
        };
        if let Err(e) = self.send_to_hub(&request) {
            self.pending().remove(&identity);
            return Err(e);
        }

        let answer = match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => return Err(link_down()),
            Err(_) => {
                self.pending().remove(&identity);
                warn!(identity, "Hub did not answer the migration request");
                return Err(ProtocolError::Timeout);
            }
        };

        match answer {
            Some(endpoint) => {
                session.complete_migration()?;
                session.send_message(&redirect(Some(endpoint)))?;
                self.metrics.migration_succeeded();
                info!(identity, %endpoint, "Client redirected");
                Ok(endpoint)
            }
            None => {
                session.abort_migration()?;
                session.send_message(&redirect(None))?;
                self.metrics.migration_missed();
                info!(identity, "Migration declined, target not registered");
                Err(ProtocolError::DirectoryMiss(target))
            }
        }
    }

    /// Apply one message received from the hub.
    pub fn handle_hub_message(&self, msg: RelayMessage) {
        match msg {
            RelayMessage::MigrateResult { identity, endpoint } => {
                let waiting = self.pending().remove(&identity);
                match waiting {
                    Some(reply) => {
                        let _ = reply.send(endpoint);
                    }
                    None => debug!(identity, "Migration result with no waiting request"),
                }
            }
            RelayMessage::AuthorityResult { identity, granted } => {
                let Some(session) = self.claims().remove(&identity).and_then(|s| s.upgrade()) else {
                    debug!(identity, "Authority result for a session that is gone");
                    return;
                };
                if let Err(e) = session.confirm_authority(granted) {
                    if e.is_security_event() {
                        self.metrics.authority_denied();
                        warn!(session = session.sn(), identity, security = true, error = %e, "Closing session");
                    }
                    session.close(CloseReason::from(&e));
                }
            }
            other => warn!(opcode = other.opcode(), "Unexpected relay message from hub"),
        }
    }

    /// The hub link is gone: fail every outstanding wait.
    pub fn on_link_lost(&self) {
        let dropped = self.pending().drain().count();
        let claims: Vec<_> = self.claims().drain().collect();
        warn!(pending = dropped, claims = claims.len(), "Relay link lost");
        for (_, session) in claims {
            if let Some(session) = session.upgrade() {
                session.close(CloseReason::Fault(constants::ERR_RELAY_LINK_DOWN.to_string()));
            }
        }
    }
}

impl AuthorityClaim for MigrationCoordinator {
    fn claim(&self, session: &Arc<Session>, identity: Identity) -> Result<()> {
        {
            let mut claims = self.claims();
            let in_flight = claims
                .get(&identity)
                .and_then(Weak::upgrade)
                .is_some_and(|other| !other.is_closed());
            if in_flight {
                warn!(session = session.sn(), identity, security = true, "Identity already awaiting authority");
                return Err(ProtocolError::IdentityMismatch { claimed: identity });
            }
            claims.insert(identity, Arc::downgrade(session));
        }
        let claim = RelayMessage::ClaimAuthority {
            identity,
            role: self.role,
        };
        if let Err(e) = self.send_to_hub(&claim) {
            self.claims().remove(&identity);
            return Err(e);
        }
        debug!(session = session.sn(), identity, "Authority claim sent");
        Ok(())
    }
}

impl SessionListener for MigrationCoordinator {
    fn on_closed(&self, session: &Session, last_state: MigrateState, _reason: &CloseReason) {
        let Some(identity) = session.identity() else {
            return;
        };
        if last_state < MigrateState::WaitAuthorityConfirmed {
            return;
        }
        if last_state == MigrateState::WaitAuthorityConfirmed {
            self.claims().remove(&identity);
        }
        if let Err(e) = self.send_to_hub(&RelayMessage::ReleaseAuthority { identity }) {
            debug!(identity, error = %e, "Could not release authority");
        }
    }
}

/// The role's connection to the relay hub.
pub struct RelayLink;

impl RelayLink {
    /// Connect to the hub, send `registrations`, then pump traffic between
    /// the hub and `coordinator` until either side goes away.
    #[instrument(skip(config, registrations, coordinator, outbound), fields(hub = %config.hub_address))]
    pub async fn spawn(
        config: &RelayConfig,
        registrations: Vec<RelayMessage>,
        coordinator: Arc<MigrationCoordinator>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Result<JoinHandle<()>> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.hub_address))
            .await
            .map_err(|_| ProtocolError::ConnectionTimeout)??;
        let mut framed = Framed::new(stream, RelayCodec::new(config.max_frame_size));

        for registration in &registrations {
            framed.send(registration.to_message()?).await?;
        }
        info!(role = %coordinator.role(), "Registered with relay hub");

        let task = tokio::spawn(async move {
            let (mut sink, mut frames) = framed.split();
            loop {
                tokio::select! {
                    frame = frames.next() => {
                        match frame {
                            Some(Ok(msg)) => match RelayMessage::from_message(msg) {
                                Ok(msg) => coordinator.handle_hub_message(msg),
                                Err(e) => {
                                    error!(error = %e, "Undecodable message from hub");
                                    break;
                                }
                            },
                            Some(Err(e)) => {
                                error!(error = %e, "Relay link read failed");
                                break;
                            }
                            None => break,
                        }
                    }

                    msg = outbound.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(e) = sink.send(msg).await {
                                    error!(error = %e, "Relay link write failed");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            coordinator.on_link_lost();
        });
        Ok(task)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::cipher::CipherState;
    use crate::core::codec::FrameEncoder;
    use crate::core::obfuscation::Passthrough;
    use crate::session::connection::MemorySink;
    use crate::session::state::RoleKind;
    use std::net::Ipv4Addr;

    fn active_session(identity: Identity) -> Arc<Session> {
        let encoder = FrameEncoder::new(CipherState::new([0; 4], 1), Arc::new(Passthrough));
        let session = Session::new(3, RoleKind::Login, encoder, Box::new(MemorySink::new()), Instant::now());
        session.authenticate(identity).unwrap();
        Arc::new(session)
    }

    /// A channel session that has announced `identity` and awaits the hub.
    fn arriving_session(sn: u64, identity: Identity) -> Arc<Session> {
        let encoder = FrameEncoder::new(CipherState::new([0; 4], 1), Arc::new(Passthrough));
        let session = Session::new(sn, RoleKind::Channel, encoder, Box::new(MemorySink::new()), Instant::now());
        session.handshake_sent().unwrap();
        session.accept_migrate_in(identity, Instant::now()).unwrap();
        Arc::new(session)
    }

    fn channel_coordinator() -> (Arc<MigrationCoordinator>, mpsc::UnboundedReceiver<Message>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let (coordinator, hub_rx) = MigrationCoordinator::new(
            RoleId::Channel { world: 0, channel: 1 },
            &RelayConfig::default(),
            metrics.clone(),
        );
        (coordinator, hub_rx, metrics)
    }

    #[test]
    fn test_redirect_layout() {
        let msg = redirect(Some(Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 8585)));
        assert_eq!(msg.opcode(), server::MIGRATE_COMMAND);
        assert_eq!(msg.payload(), &[1, 127, 0, 0, 1, 0x89, 0x21]);
        assert_eq!(redirect(None).payload(), &[0]);
    }

    #[tokio::test]
    async fn test_directory_miss_rolls_back() {
        let (coordinator, mut hub_rx) =
            MigrationCoordinator::new(RoleId::Login, &RelayConfig::default(), Arc::new(Metrics::new()));
        let session = active_session(21);
        let target = RoleId::Channel { world: 3, channel: 3 };

        let hub = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let request = RelayMessage::from_message(hub_rx.recv().await.unwrap()).unwrap();
                assert!(matches!(request, RelayMessage::MigrateRequest { identity: 21, .. }));
                coordinator.handle_hub_message(RelayMessage::MigrateResult {
                    identity: 21,
                    endpoint: None,
                });
            })
        };

        let result = coordinator.request_migration(&session, target).await;
        hub.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::DirectoryMiss(t)) if t == target));
        assert_eq!(session.state(), MigrateState::Active);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_link_loss_fails_request() {
        let (coordinator, hub_rx) =
            MigrationCoordinator::new(RoleId::Login, &RelayConfig::default(), Arc::new(Metrics::new()));
        drop(hub_rx);
        let session = active_session(5);
        let result = coordinator.request_migration(&session, RoleId::Shop).await;
        assert!(result.is_err());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_request_in_wrong_state_closes() {
        let (coordinator, _hub_rx) =
            MigrationCoordinator::new(RoleId::Login, &RelayConfig::default(), Arc::new(Metrics::new()));
        let encoder = FrameEncoder::new(CipherState::new([0; 4], 1), Arc::new(Passthrough));
        let session = Arc::new(Session::new(4, RoleKind::Login, encoder, Box::new(MemorySink::new()), Instant::now()));

        let result = coordinator.request_migration(&session, RoleId::Shop).await;
        assert!(result.is_err());
        assert!(session.is_closed());
        assert_eq!(session.state(), MigrateState::Terminal);
    }

    #[tokio::test]
    async fn test_second_request_for_same_identity_closes() {
        let (coordinator, mut hub_rx) =
            MigrationCoordinator::new(RoleId::Login, &RelayConfig::default(), Arc::new(Metrics::new()));
        let session = active_session(31);

        let first = {
            let coordinator = coordinator.clone();
            let session = session.clone();
            tokio::spawn(async move { coordinator.request_migration(&session, RoleId::Shop).await })
        };
        // The first request is on the wire before the second is made.
        hub_rx.recv().await.unwrap();

        let second = coordinator.request_migration(&session, RoleId::Shop).await;
        assert!(second.is_err());
        assert!(session.is_closed());

        coordinator.handle_hub_message(RelayMessage::MigrateResult {
            identity: 31,
            endpoint: None,
        });
        assert!(first.await.unwrap().is_err());
    }

    #[test]
    fn test_denied_authority_closes_session() {
        let (coordinator, mut hub_rx, metrics) = channel_coordinator();
        let session = arriving_session(7, 12);
        coordinator.claim(&session, 12).unwrap();

        let sent = RelayMessage::from_message(hub_rx.try_recv().unwrap()).unwrap();
        assert!(matches!(sent, RelayMessage::ClaimAuthority { identity: 12, .. }));

        coordinator.handle_hub_message(RelayMessage::AuthorityResult {
            identity: 12,
            granted: false,
        });
        assert!(session.is_closed());
        assert_eq!(metrics.snapshot().authority_denials, 1);
    }

    #[test]
    fn test_duplicate_claim_is_refused() {
        let (coordinator, _hub_rx, _) = channel_coordinator();
        let first = arriving_session(1, 9);
        let second = arriving_session(2, 9);

        coordinator.claim(&first, 9).unwrap();
        assert!(matches!(
            coordinator.claim(&second, 9),
            Err(ProtocolError::IdentityMismatch { claimed: 9 })
        ));

        // The grant still reaches the session that claimed first.
        coordinator.handle_hub_message(RelayMessage::AuthorityResult {
            identity: 9,
            granted: true,
        });
        assert_eq!(first.state(), MigrateState::Active);
        assert_eq!(second.state(), MigrateState::WaitAuthorityConfirmed);
    }

    #[test]
    fn test_claim_after_closed_claimant_is_allowed() {
        let (coordinator, _hub_rx, _) = channel_coordinator();
        let stale = arriving_session(1, 10);
        coordinator.claim(&stale, 10).unwrap();
        stale.close(CloseReason::PeerClosed);

        let fresh = arriving_session(2, 10);
        coordinator.claim(&fresh, 10).unwrap();
        coordinator.handle_hub_message(RelayMessage::AuthorityResult {
            identity: 10,
            granted: true,
        });
        assert_eq!(fresh.state(), MigrateState::Active);
    }

    #[test]
    fn test_link_loss_closes_waiting_claims() {
        let (coordinator, _hub_rx, _) = channel_coordinator();
        let session = arriving_session(5, 44);
        coordinator.claim(&session, 44).unwrap();

        coordinator.on_link_lost();
        assert!(session.is_closed());
        assert_eq!(session.state(), MigrateState::Terminal);
    }
}
