//! Client-facing TCP listener for one server role.
//!
//! Each accepted connection gets:
//! - the plaintext handshake, written before anything else
//! - a writer task draining the session's frame queue into the socket
//! - a reader loop feeding the [`Pipeline`] and dispatching business messages
//! - a timer tick driving the idle, migration and keepalive deadlines
//!
//! All three end through [`Session::close`].

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::codec::FrameDecoder;
use crate::core::obfuscation::{self, Obfuscator};
use crate::error::{ProtocolError, Result};
use crate::migration::MigrationCoordinator;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::Handshake;
use crate::session::connection::{CloseReason, FrameSink, Session, SessionListener};
use crate::session::pipeline::{IdentityVerifier, Pipeline};
use crate::session::state::RoleKind;
use crate::utils::metrics::Metrics;

/// Everything a role server hands to each of its sessions.
pub struct RoleContext {
    pub config: NetworkConfig,
    pub role: RoleKind,
    pub coordinator: Arc<MigrationCoordinator>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub dispatcher: Dispatcher,
    pub metrics: Arc<Metrics>,
    obfuscator: Arc<dyn Obfuscator>,
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl RoleContext {
    pub fn new(
        config: NetworkConfig,
        role: RoleKind,
        coordinator: Arc<MigrationCoordinator>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self> {
        let obfuscator: Arc<dyn Obfuscator> = obfuscation::by_version(config.protocol.obfuscation)
            .map(Arc::from)
            .ok_or_else(|| {
                ProtocolError::ConfigError(format!(
                    "Unknown obfuscation version: {}",
                    config.protocol.obfuscation
                ))
            })?;

        Ok(Self {
            config,
            role,
            listeners: vec![coordinator.clone() as Arc<dyn SessionListener>],
            coordinator,
            verifier,
            dispatcher: Dispatcher::new(),
            metrics: Arc::new(Metrics::new()),
            obfuscator,
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Frame sink backed by the connection's writer task.
struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl FrameSink for ChannelSink {
    fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn close(&mut self) {
        // Dropping the sender lets the writer flush what is queued and exit.
        self.tx = None;
    }
}

type SessionTable = Arc<Mutex<HashMap<u64, Arc<Session>>>>;

pub struct RoleServer {
    listener: TcpListener,
    ctx: Arc<RoleContext>,
    sessions: SessionTable,
    next_sn: AtomicU64,
}

impl RoleServer {
    #[instrument(skip(ctx), fields(address = %ctx.config.server.address, role = ?ctx.role))]
    pub async fn bind(ctx: RoleContext) -> Result<Self> {
        let listener = TcpListener::bind(&ctx.config.server.address).await?;
        info!(address = %listener.local_addr()?, "Listening for clients");
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_sn: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<RoleContext> {
        &self.ctx
    }

    /// Serve until CTRL+C.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run(shutdown_rx).await
    }

    /// Serve until `shutdown_rx` fires, then close every session and wait
    /// up to the configured shutdown timeout for connections to drain.
    #[instrument(skip(self, shutdown_rx), fields(role = ?self.ctx.role))]
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server. Closing sessions...");
                    self.shutdown().await;
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => error!(error = %e, "Error accepting connection"),
                    }
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let active = self.ctx.metrics.connections_active.load(Ordering::Relaxed);
        if active >= self.ctx.config.server.max_connections as u64 {
            warn!(peer = %peer, active, "Connection limit reached, refusing client");
            return;
        }

        let sn = self.next_sn.fetch_add(1, Ordering::Relaxed);
        let ctx = self.ctx.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_client(ctx, sessions, sn, stream, peer).await {
                debug!(session = sn, peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }

    async fn shutdown(&self) {
        let open: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for session in open {
            session.close(CloseReason::Shutdown);
        }

        let timeout = tokio::time::sleep(self.ctx.config.server.shutdown_timeout);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = &mut timeout => {
                    warn!("Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    let remaining = self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len();
                    if remaining == 0 {
                        info!("All connections closed, shutting down");
                        break;
                    }
                }
            }
        }
        self.ctx.metrics.log_summary();
    }
}

async fn write_frames(
    session: Arc<Session>,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            session.close(CloseReason::Fault(e.to_string()));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn report_population(ctx: &RoleContext, sessions: &SessionTable) {
    if ctx.role != RoleKind::Channel {
        return;
    }
    let population = sessions.lock().unwrap_or_else(PoisonError::into_inner).len() as u32;
    if let Err(e) = ctx.coordinator.report_population(population) {
        debug!(error = %e, "Population report not sent");
    }
}

#[instrument(skip(ctx, sessions, stream), fields(peer = %peer))]
async fn serve_client(
    ctx: Arc<RoleContext>,
    sessions: SessionTable,
    sn: u64,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let handshake = Handshake::generate(&ctx.config.protocol);
    writer.write_all(&handshake.encode()).await?;
    let (decoder, encoder) = handshake.server_codec(ctx.obfuscator.clone()).split();

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(
        sn,
        ctx.role,
        encoder,
        Box::new(ChannelSink { tx: Some(frame_tx) }),
        Instant::now(),
    )
    .with_peer(peer)
    .with_metrics(ctx.metrics.clone());
    for listener in &ctx.listeners {
        session = session.with_listener(listener.clone());
    }
    let session = Arc::new(session);
    ctx.metrics.connection_established();
    sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(sn, session.clone());
    report_population(&ctx, &sessions);
    debug!(session = sn, "Handshake sent");

    let writer_task = tokio::spawn(write_frames(session.clone(), writer, frame_rx));
    let result = read_loop(&ctx, &session, reader_pipeline(&ctx, &session, decoder), &mut reader).await;

    session.close(close_reason(&result));
    sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&sn);
    report_population(&ctx, &sessions);
    let _ = writer_task.await;
    result
}

/// Why a connection ended, from how its read loop returned.
fn close_reason(result: &Result<()>) -> CloseReason {
    match result {
        Ok(()) => CloseReason::PeerClosed,
        Err(e) => CloseReason::from(e),
    }
}

fn reader_pipeline(
    ctx: &RoleContext,
    session: &Arc<Session>,
    decoder: FrameDecoder,
) -> Pipeline {
    Pipeline::standard(
        session.clone(),
        decoder,
        &ctx.config.session,
        ctx.verifier.clone(),
        ctx.coordinator.clone(),
    )
}

async fn read_loop(
    ctx: &RoleContext,
    session: &Arc<Session>,
    mut pipeline: Pipeline,
    reader: &mut OwnedReadHalf,
) -> Result<()> {
    session.handshake_sent()?;
    let mut buf = BytesMut::with_capacity(4096);
    let mut tick = tokio::time::interval(ctx.config.session.tick_interval);

    loop {
        tokio::select! {
            _ = session.closed() => return Ok(()),

            _ = tick.tick() => {
                pipeline.on_tick(Instant::now())?;
            }

            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
                while let Some(mut msg) = pipeline.decode_next(&mut buf)? {
                    if let Err(e) = ctx.dispatcher.dispatch(session, &mut msg) {
                        if e.is_fatal() {
                            session.close(CloseReason::from(&e));
                            return Err(e);
                        }
                        debug!(session = session.sn(), error = %e, "Handler error");
                    }
                }
            }
        }
    }
}
