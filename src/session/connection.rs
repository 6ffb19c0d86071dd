//! The per-connection session object.
//!
//! A [`Session`] owns the migration state, the bound identity, the activity
//! timestamps and the send half of the client cipher. It is shared as
//! `Arc<Session>` between the reading task, the timer tick and the migration
//! coordinator; every mutation goes through one of two short-lived guards:
//!
//! - the state guard (state, identity, timestamps)
//! - the send guard (send cipher + frame sink), held for the whole encode
//!   and hand-off of one frame
//!
//! [`Session::close`] is the single teardown path. The first caller wins a
//! compare-and-swap on the closed flag; every later caller is a no-op.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::codec::FrameEncoder;
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::relay::{Identity, RoleId};
use crate::session::state::{check_transition, MigrateState, RoleKind};
use crate::utils::metrics::Metrics;

/// Destination for fully encoded client frames.
pub trait FrameSink: Send {
    /// Queue one complete frame. Must not block.
    fn send_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Stop accepting frames and release the transport.
    fn close(&mut self);
}

/// Frame sink that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames queued so far, oldest first.
    pub fn frames(&self) -> Vec<Bytes> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All queued frames concatenated, as the peer would read them.
    pub fn wire(&self) -> BytesMut {
        let mut wire = BytesMut::new();
        for frame in self.frames() {
            wire.extend_from_slice(&frame);
        }
        wire
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl FrameSink for MemorySink {
    fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport.
    PeerClosed,
    /// Server shutdown or explicit close by the game layer.
    Shutdown,
    /// An idle or migration deadline expired.
    Timeout,
    /// A fatal protocol, state or identity error.
    Fault(String),
}

impl From<&ProtocolError> for CloseReason {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed => CloseReason::PeerClosed,
            ProtocolError::Timeout | ProtocolError::ConnectionTimeout => CloseReason::Timeout,
            other => CloseReason::Fault(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Fault(reason) => write!(f, "{reason}"),
        }
    }
}

/// Callbacks into the game layer.
pub trait SessionListener: Send + Sync {
    /// The session reached `Active` with `identity`.
    fn on_identified(&self, _session: &Session, _identity: Identity) {}

    /// Teardown, called exactly once per session. `last_state` is the state
    /// the session was in before it became terminal.
    fn on_closed(&self, _session: &Session, _last_state: MigrateState, _reason: &CloseReason) {}
}

/// Timestamps the timer stage reads on every tick.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub state: MigrateState,
    pub accepted_at: Instant,
    pub last_activity: Instant,
    pub last_send: Instant,
    pub migration_started: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: MigrateState,
    identity: Option<Identity>,
    accepted_at: Instant,
    last_activity: Instant,
    last_send: Instant,
    migration_started: Option<Instant>,
    migration_target: Option<RoleId>,
}

struct Outbound {
    encoder: FrameEncoder,
    sink: Box<dyn FrameSink>,
}

pub struct Session {
    sn: u64,
    role: RoleKind,
    peer: Option<SocketAddr>,
    inner: Mutex<Inner>,
    outbound: Mutex<Outbound>,
    closed: AtomicBool,
    close_notify: Notify,
    listeners: Vec<Arc<dyn SessionListener>>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sn", &self.sn)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

impl Session {
    pub fn new(
        sn: u64,
        role: RoleKind,
        encoder: FrameEncoder,
        sink: Box<dyn FrameSink>,
        now: Instant,
    ) -> Self {
        Self {
            sn,
            role,
            peer: None,
            inner: Mutex::new(Inner {
                state: MigrateState::Unidentified,
                identity: None,
                accepted_at: now,
                last_activity: now,
                last_send: now,
                migration_started: None,
                migration_target: None,
            }),
            outbound: Mutex::new(Outbound { encoder, sink }),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            listeners: Vec::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub fn role(&self) -> RoleKind {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn state(&self) -> MigrateState {
        self.inner().state
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner().identity
    }

    /// Target of the outbound migration in flight, if any.
    pub fn migration_target(&self) -> Option<RoleId> {
        self.inner().migration_target
    }

    pub fn timing(&self) -> Timing {
        let inner = self.inner();
        Timing {
            state: inner.state,
            accepted_at: inner.accepted_at,
            last_activity: inner.last_activity,
            last_send: inner.last_send,
            migration_started: inner.migration_started,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record inbound activity.
    pub fn touch(&self, now: Instant) {
        self.inner().last_activity = now;
    }

    /// Resolves once [`Session::close`] has run.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Encode and queue one frame under the send guard.
    pub fn send(&self, opcode: u16, payload: &[u8]) -> Result<()> {
        let len = {
            let mut out = self.outbound();
            // Checked under the guard: close takes the same guard.
            if self.is_closed() {
                return Err(ProtocolError::ConnectionClosed);
            }

            let mut frame = BytesMut::new();
            out.encoder.encode_parts(opcode, payload, &mut frame)?;
            let len = frame.len();
            out.sink.send_frame(frame.freeze())?;
            len
        };

        self.inner().last_send = Instant::now();
        self.metrics.frame_sent(len as u64);
        Ok(())
    }

    pub fn send_message(&self, msg: &Message) -> Result<()> {
        self.send(msg.opcode(), msg.payload())
    }

    fn transition(&self, inner: &mut Inner, to: MigrateState) -> Result<MigrateState> {
        let from = inner.state;
        check_transition(self.role, from, to)?;
        inner.state = to;
        debug!(session = self.sn, from = ?from, to = ?to, "Session state changed");
        Ok(from)
    }

    fn bind(&self, inner: &mut Inner, identity: Identity) -> Result<()> {
        match inner.identity {
            Some(existing) if existing != identity => {
                warn!(
                    session = self.sn,
                    existing,
                    claimed = identity,
                    "{}",
                    constants::ERR_IDENTITY_CONFLICT
                );
                Err(ProtocolError::IdentityMismatch { claimed: identity })
            }
            _ => {
                inner.identity = Some(identity);
                Ok(())
            }
        }
    }

    fn notify_identified(&self, identity: Identity) {
        info!(session = self.sn, identity, role = ?self.role, "Session identified");
        for listener in &self.listeners {
            listener.on_identified(self, identity);
        }
    }

    /// The handshake has been written. Hand-off roles start waiting for the
    /// migration-in message; login sessions stay `Unidentified`.
    pub fn handshake_sent(&self) -> Result<()> {
        if self.role.accepts_handoff() {
            let mut inner = self.inner();
            self.transition(&mut inner, MigrateState::WaitHandoffIn)?;
        }
        Ok(())
    }

    /// Login layer bound an identity: `Unidentified -> Active`.
    pub fn authenticate(&self, identity: Identity) -> Result<()> {
        {
            let mut inner = self.inner();
            check_transition(self.role, inner.state, MigrateState::Active)?;
            self.bind(&mut inner, identity)?;
            self.transition(&mut inner, MigrateState::Active)?;
        }
        self.notify_identified(identity);
        Ok(())
    }

    /// A corroborated migration-in arrived; wait for the hub to hand over authority.
    pub fn accept_migrate_in(&self, identity: Identity, now: Instant) -> Result<()> {
        let mut inner = self.inner();
        check_transition(self.role, inner.state, MigrateState::WaitAuthorityConfirmed)?;
        self.bind(&mut inner, identity)?;
        self.transition(&mut inner, MigrateState::WaitAuthorityConfirmed)?;
        inner.last_activity = now;
        Ok(())
    }

    /// Apply the hub's authority decision. A denial is returned as
    /// [`ProtocolError::AuthorityDenied`]; the caller closes the session.
    pub fn confirm_authority(&self, granted: bool) -> Result<()> {
        let identity = {
            let mut inner = self.inner();
            let identity = inner.identity.ok_or_else(|| {
                ProtocolError::Custom(constants::ERR_NO_IDENTITY.to_string())
            })?;
            if !granted {
                return Err(ProtocolError::AuthorityDenied(identity));
            }
            self.transition(&mut inner, MigrateState::Active)?;
            identity
        };
        self.notify_identified(identity);
        Ok(())
    }

    /// `Active -> WaitAuthorityReleased`. Returns the identity being moved.
    pub fn begin_migration(&self, target: RoleId, now: Instant) -> Result<Identity> {
        let mut inner = self.inner();
        let identity = inner
            .identity
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_NO_IDENTITY.to_string()))?;
        self.transition(&mut inner, MigrateState::WaitAuthorityReleased)?;
        inner.migration_started = Some(now);
        inner.migration_target = Some(target);
        Ok(identity)
    }

    /// The hub resolved the target: `WaitAuthorityReleased -> WaitHandoffOut`.
    pub fn complete_migration(&self) -> Result<()> {
        let mut inner = self.inner();
        self.transition(&mut inner, MigrateState::WaitHandoffOut)?;
        Ok(())
    }

    /// Directory miss: roll back to `Active`.
    pub fn abort_migration(&self) -> Result<()> {
        let mut inner = self.inner();
        self.transition(&mut inner, MigrateState::Active)?;
        inner.migration_started = None;
        inner.migration_target = None;
        Ok(())
    }

    /// Tear the session down. Returns `true` for the one caller that ran teardown.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let last_state = {
            let mut inner = self.inner();
            std::mem::replace(&mut inner.state, MigrateState::Terminal)
        };
        self.outbound().sink.close();
        self.close_notify.notify_waiters();
        self.metrics.connection_closed();

        info!(
            session = self.sn,
            state = ?last_state,
            identity = ?self.identity(),
            reason = %reason,
            "Session closed"
        );

        for listener in &self.listeners {
            listener.on_closed(self, last_state, &reason);
        }
        true
    }
}
