//! Inbound event pipeline.
//!
//! ```text
//! bytes -> [codec] -> IdleTimerStage -> SessionStage -> business message
//! ```
//!
//! The codec stage is the [`FrameDecoder`] owned by the [`Pipeline`]; the
//! remaining stages implement [`Stage`] and may consume a message or pass it
//! downstream. Whatever reaches the end of the chain is a business message
//! that passed state gating and is returned from [`Pipeline::decode_next`].
//!
//! Every error a stage returns that [`ProtocolError::is_fatal`] closes the
//! session through [`Session::close`] before it is handed back to the caller.

use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::core::codec::FrameDecoder;
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::protocol::opcode::{client, server, MessageKind};
use crate::protocol::relay::Identity;
use crate::session::connection::{CloseReason, Session};
use crate::session::state::{allows, TimerKind};
use crate::utils::metrics::Metrics;

/// Independent check that a migration-in identity is expected on this role.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, session: &Session, identity: Identity) -> bool;
}

/// Identities announced to this role ahead of their arrival. Each
/// announcement admits exactly one migration-in.
#[derive(Debug, Default)]
pub struct ExpectedArrivals {
    expected: Mutex<HashSet<Identity>>,
}

impl ExpectedArrivals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&self, identity: Identity) {
        self.expected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity);
    }

    pub fn forget(&self, identity: Identity) -> bool {
        self.expected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&identity)
    }
}

impl IdentityVerifier for ExpectedArrivals {
    fn verify(&self, _session: &Session, identity: Identity) -> bool {
        self.forget(identity)
    }
}

/// Asks the relay hub to hand authority over an identity to this role.
///
/// Implementations must not block; the answer is applied later through
/// [`Session::confirm_authority`].
pub trait AuthorityClaim: Send + Sync {
    fn claim(&self, session: &Arc<Session>, identity: Identity) -> Result<()>;
}

/// One link in the inbound chain.
pub trait Stage: Send + Sync {
    /// Process `msg`; `Ok(None)` consumes it.
    fn on_message(&self, session: &Arc<Session>, msg: Message, now: Instant) -> Result<Option<Message>>;

    /// Periodic tick.
    fn on_tick(&self, _session: &Arc<Session>, _now: Instant) -> Result<()> {
        Ok(())
    }
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Records activity, enforces the idle and migration deadlines and keeps an
/// otherwise silent connection alive.
#[derive(Debug, Clone)]
pub struct IdleTimerStage {
    config: SessionConfig,
}

impl IdleTimerStage {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl Stage for IdleTimerStage {
    fn on_message(&self, session: &Arc<Session>, msg: Message, now: Instant) -> Result<Option<Message>> {
        session.touch(now);
        Ok(Some(msg))
    }

    fn on_tick(&self, session: &Arc<Session>, now: Instant) -> Result<()> {
        let timing = session.timing();
        match timing.state.timer() {
            TimerKind::Idle => {
                if now.saturating_duration_since(timing.last_activity) >= self.config.idle_timeout {
                    debug!(session = session.sn(), state = ?timing.state, "Idle timeout");
                    return Err(ProtocolError::ConnectionTimeout);
                }
            }
            TimerKind::Migration => {
                let started = timing.migration_started.unwrap_or(timing.last_activity);
                if now.saturating_duration_since(started) >= self.config.migration_timeout {
                    debug!(session = session.sn(), state = ?timing.state, "Migration timeout");
                    return Err(ProtocolError::Timeout);
                }
            }
            TimerKind::None => return Ok(()),
        }

        if now.saturating_duration_since(timing.last_send) >= self.config.alive_interval {
            let mut probe = Message::new(server::ALIVE_REQ);
            probe.put_u32(unix_seconds());
            session.send_message(&probe)?;
            trace!(session = session.sn(), "Sent keepalive probe");
        }
        Ok(())
    }
}

/// Gates every message kind by state and handles the core's own opcodes.
pub struct SessionStage {
    verifier: Arc<dyn IdentityVerifier>,
    authority: Arc<dyn AuthorityClaim>,
}

impl SessionStage {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, authority: Arc<dyn AuthorityClaim>) -> Self {
        Self { verifier, authority }
    }

    fn migrate_in(&self, session: &Arc<Session>, mut msg: Message, now: Instant) -> Result<()> {
        let identity = msg.get_u32()?;
        if !self.verifier.verify(session, identity) {
            return Err(ProtocolError::IdentityMismatch { claimed: identity });
        }
        session.accept_migrate_in(identity, now)?;
        self.authority.claim(session, identity)
    }
}

impl Stage for SessionStage {
    fn on_message(&self, session: &Arc<Session>, mut msg: Message, now: Instant) -> Result<Option<Message>> {
        let opcode = msg.opcode();
        let kind = MessageKind::classify(opcode);
        let state = session.state();

        if !allows(session.role(), state, kind) {
            return Err(ProtocolError::StateViolation { state, opcode });
        }

        match kind {
            MessageKind::Keepalive => {
                if opcode == client::ALIVE_REQ {
                    // The client's stamp is read only to validate the frame.
                    let _client_stamp = msg.get_u32()?;
                    let mut reply = Message::new(server::ALIVE_REQ);
                    reply.put_u32(unix_seconds());
                    session.send_message(&reply)?;
                }
                Ok(None)
            }
            MessageKind::MigrateIn => {
                self.migrate_in(session, msg, now)?;
                Ok(None)
            }
            MessageKind::Business => Ok(Some(msg)),
        }
    }
}

/// The full inbound chain of one connection.
pub struct Pipeline {
    session: Arc<Session>,
    decoder: FrameDecoder,
    stages: Vec<Box<dyn Stage>>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(session: Arc<Session>, decoder: FrameDecoder) -> Self {
        let metrics = session.metrics().clone();
        Self {
            session,
            decoder,
            stages: Vec::new(),
            metrics,
        }
    }

    /// Pipeline with the idle-timer and session stages in their usual order.
    pub fn standard(
        session: Arc<Session>,
        decoder: FrameDecoder,
        config: &SessionConfig,
        verifier: Arc<dyn IdentityVerifier>,
        authority: Arc<dyn AuthorityClaim>,
    ) -> Self {
        Self::new(session, decoder)
            .with_stage(IdleTimerStage::new(config.clone()))
            .with_stage(SessionStage::new(verifier, authority))
    }

    pub fn with_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Next business message from `buf`, or `None` when more bytes are needed.
    ///
    /// Messages consumed by a stage (keepalive, migration-in) are processed
    /// inline and never surface.
    pub fn decode_next(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        self.decode_next_at(buf, Instant::now())
    }

    pub fn decode_next_at(&mut self, buf: &mut BytesMut, now: Instant) -> Result<Option<Message>> {
        loop {
            if self.session.is_closed() {
                return Err(ProtocolError::ConnectionClosed);
            }

            let before = buf.len();
            let msg = match self.decoder.decode(buf) {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.fail(e)),
            };
            self.metrics.frame_received((before - buf.len()) as u64);

            match self.run_stages(msg, now) {
                Ok(Some(business)) => return Ok(Some(business)),
                Ok(None) => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn run_stages(&self, msg: Message, now: Instant) -> Result<Option<Message>> {
        let mut current = msg;
        for stage in &self.stages {
            match stage.on_message(&self.session, current, now)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Drive every stage's timer. A fatal result has already closed the session.
    pub fn on_tick(&self, now: Instant) -> Result<()> {
        if self.session.is_closed() {
            return Ok(());
        }
        for stage in &self.stages {
            if let Err(e) = stage.on_tick(&self.session, now) {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    fn fail(&self, err: ProtocolError) -> ProtocolError {
        if !err.is_fatal() {
            return err;
        }

        match &err {
            ProtocolError::StateViolation { .. } => self.metrics.state_violation(),
            ProtocolError::IdentityMismatch { .. } => self.metrics.identity_mismatch(),
            ProtocolError::Timeout | ProtocolError::ConnectionTimeout => self.metrics.timeout(),
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed => {}
            _ => self.metrics.protocol_error(),
        }

        if err.is_security_event() {
            warn!(
                session = self.session.sn(),
                peer = ?self.session.peer(),
                identity = ?self.session.identity(),
                security = true,
                error = %err,
                "Closing session"
            );
        } else {
            debug!(session = self.session.sn(), error = %err, "Closing session");
        }

        self.session.close(CloseReason::from(&err));
        err
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::codec::ClientCodec;
    use crate::core::obfuscation::ByteShuffle;
    use crate::session::connection::MemorySink;
    use crate::session::state::{MigrateState, RoleKind};
    use std::time::Duration;
    use tokio_util::codec::Encoder;

    struct NoClaim;

    impl AuthorityClaim for NoClaim {
        fn claim(&self, _session: &Arc<Session>, _identity: Identity) -> Result<()> {
            Ok(())
        }
    }

    fn setup(role: RoleKind) -> (Pipeline, ClientCodec, Arc<ExpectedArrivals>, Instant) {
        let (send_iv, recv_iv) = ([9, 8, 7, 6], [1, 3, 5, 7]);
        let (decoder, encoder) = ClientCodec::server_default(send_iv, recv_iv, 28).split();
        let client = ClientCodec::peer(send_iv, recv_iv, 28, Arc::new(ByteShuffle));
        let now = Instant::now();
        let session = Arc::new(Session::new(1, role, encoder, Box::new(MemorySink::new()), now));
        session.handshake_sent().unwrap();
        let arrivals = Arc::new(ExpectedArrivals::new());
        let pipeline = Pipeline::standard(
            session,
            decoder,
            &SessionConfig::default(),
            arrivals.clone(),
            Arc::new(NoClaim),
        );
        (pipeline, client, arrivals, now)
    }

    fn frame(client: &mut ClientCodec, opcode: u16, payload: &[u8]) -> BytesMut {
        let mut wire = BytesMut::new();
        client
            .encode(Message::with_payload(opcode, payload.to_vec()), &mut wire)
            .unwrap();
        wire
    }

    #[test]
    fn test_expected_migrate_in_is_consumed() {
        let (mut pipeline, mut client, arrivals, now) = setup(RoleKind::Channel);
        arrivals.expect(77);
        let mut wire = frame(&mut client, client::MIGRATE_IN, &77u32.to_le_bytes());
        assert!(pipeline.decode_next_at(&mut wire, now).unwrap().is_none());
        assert_eq!(pipeline.session().state(), MigrateState::WaitAuthorityConfirmed);
    }

    #[test]
    fn test_unexpected_migrate_in_closes() {
        let (mut pipeline, mut client, _, now) = setup(RoleKind::Channel);
        let mut wire = frame(&mut client, client::MIGRATE_IN, &77u32.to_le_bytes());
        assert!(matches!(
            pipeline.decode_next_at(&mut wire, now),
            Err(ProtocolError::IdentityMismatch { claimed: 77 })
        ));
        assert!(pipeline.session().is_closed());
    }

    #[test]
    fn test_business_before_handoff_closes() {
        let (mut pipeline, mut client, _, now) = setup(RoleKind::Shop);
        let mut wire = frame(&mut client, 0x40, &[]);
        assert!(matches!(
            pipeline.decode_next_at(&mut wire, now),
            Err(ProtocolError::StateViolation { .. })
        ));
        assert_eq!(pipeline.session().state(), MigrateState::Terminal);
    }

    #[test]
    fn test_keepalive_then_business_on_login() {
        let (mut pipeline, mut client, _, now) = setup(RoleKind::Login);
        let mut wire = frame(&mut client, client::ALIVE_ACK, &[0, 0, 0, 0]);
        wire.extend_from_slice(&frame(&mut client, 0x01, &[5]));

        let msg = pipeline.decode_next_at(&mut wire, now).unwrap().unwrap();
        assert_eq!(msg.opcode(), 0x01);
        assert!(pipeline.decode_next_at(&mut wire, now).unwrap().is_none());
    }

    #[test]
    fn test_idle_tick_closes_unidentified() {
        let (pipeline, _, _, now) = setup(RoleKind::Login);
        assert!(pipeline.on_tick(now + Duration::from_secs(5)).is_ok());
        assert!(matches!(
            pipeline.on_tick(now + Duration::from_secs(20)),
            Err(ProtocolError::ConnectionTimeout)
        ));
        assert!(pipeline.session().is_closed());
    }
}
