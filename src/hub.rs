//! # Relay Hub
//!
//! Central coordinator the server roles connect to over relay frames.
//!
//! A single event-loop task owns the [`Directory`]. Relay connections,
//! lookups from other tasks and the expiry tick all reach it as events on one
//! queue, so every registry read and write happens on that task and a lost
//! relay connection is deregistered in the same turn its loss is observed.
//!
//! [`HubState`] is the synchronous core of the loop and can be driven without
//! a runtime; [`RelayHub`] wraps it in tokio networking.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::codec::RelayCodec;
use crate::core::message::Message;
use crate::directory::{ConnId, Directory, DirectorySnapshot};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::relay::{Endpoint, RelayMessage, RoleId};

/// Synchronous hub logic: applies relay messages to the directory.
#[derive(Debug)]
pub struct HubState {
    directory: Directory,
    handoff_timeout: Duration,
}

impl HubState {
    pub fn new(handoff_timeout: Duration) -> Self {
        Self {
            directory: Directory::new(),
            handoff_timeout,
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Apply one message from relay connection `conn`. Returns the reply to
    /// send back on the same connection, if any.
    ///
    /// An error means the peer broke the relay protocol and its link should
    /// be dropped.
    pub fn apply(&mut self, conn: ConnId, msg: RelayMessage, now: Instant) -> Result<Option<RelayMessage>> {
        match msg {
            RelayMessage::RegisterChannel {
                world_id,
                world_name,
                channel_id,
                endpoint,
            } => {
                if let Err(e) = self
                    .directory
                    .register_channel(conn, world_id, &world_name, channel_id, endpoint)
                {
                    warn!(conn, error = %e, "Channel registration refused");
                }
                Ok(None)
            }
            RelayMessage::RegisterShop { endpoint } => {
                if let Err(e) = self.directory.register_shop(conn, endpoint) {
                    warn!(conn, error = %e, "Shop registration refused");
                }
                Ok(None)
            }
            RelayMessage::ReportPopulation {
                world_id,
                channel_id,
                population,
            } => {
                if !self
                    .directory
                    .report_population(conn, world_id, channel_id, population)
                {
                    debug!(conn, world_id, channel_id, "Population report for a foreign channel");
                }
                Ok(None)
            }
            RelayMessage::MigrateRequest { identity, from, to } => {
                let endpoint =
                    self.directory
                        .begin_handoff(conn, identity, from, to, now, self.handoff_timeout);
                match endpoint {
                    Some(endpoint) => info!(identity, from = %from, to = %to, %endpoint, "Migration routed"),
                    None => info!(identity, from = %from, to = %to, "Migration target unavailable"),
                }
                Ok(Some(RelayMessage::MigrateResult { identity, endpoint }))
            }
            RelayMessage::ClaimAuthority { identity, role } => {
                let granted = self.directory.claim(conn, identity, role);
                if granted {
                    debug!(identity, role = %role, "Authority granted");
                } else {
                    warn!(identity, role = %role, security = true, "Authority denied");
                }
                Ok(Some(RelayMessage::AuthorityResult { identity, granted }))
            }
            RelayMessage::ReleaseAuthority { identity } => {
                if self.directory.release(conn, identity) {
                    debug!(identity, conn, "Authority released");
                }
                Ok(None)
            }
            RelayMessage::MigrateResult { .. } | RelayMessage::AuthorityResult { .. } => Err(
                ProtocolError::ProtocolViolation("Hub-to-role message sent to the hub"),
            ),
        }
    }

    /// Relay connection `conn` is gone.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<RoleId> {
        self.directory.remove_connection(conn)
    }

    /// Periodic maintenance: expire unclaimed hand-offs.
    pub fn tick(&mut self, now: Instant) {
        let expired = self.directory.expire(now);
        if !expired.is_empty() {
            info!(count = expired.len(), identities = ?expired, "Expired unclaimed hand-offs");
        }
    }
}

enum HubCommand {
    Frame { conn: ConnId, msg: RelayMessage },
    Disconnected { conn: ConnId },
    Lookup { role: RoleId, reply: oneshot::Sender<Option<Endpoint>> },
    Snapshot { reply: oneshot::Sender<DirectorySnapshot> },
}

/// Query interface to a running hub for other tasks.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ProtocolError::Custom(constants::ERR_HUB_STOPPED.to_string()))?;
        rx.await
            .map_err(|_| ProtocolError::Custom(constants::ERR_HUB_STOPPED.to_string()))
    }

    pub async fn lookup(&self, role: RoleId) -> Result<Option<Endpoint>> {
        self.request(|reply| HubCommand::Lookup { role, reply }).await
    }

    pub async fn snapshot(&self) -> Result<DirectorySnapshot> {
        self.request(|reply| HubCommand::Snapshot { reply }).await
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// Tokio relay hub server.
pub struct RelayHub {
    listener: TcpListener,
    state: HubState,
    tick_interval: Duration,
    max_frame_size: usize,
    tx: mpsc::Sender<HubCommand>,
    rx: mpsc::Receiver<HubCommand>,
}

impl RelayHub {
    #[instrument(skip(config), fields(address = %config.hub.address))]
    pub async fn bind(config: &NetworkConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.hub.address).await?;
        let (tx, rx) = mpsc::channel(config.hub.command_queue);
        info!(address = %listener.local_addr()?, "Relay hub listening");
        Ok(Self {
            listener,
            state: HubState::new(config.hub.handoff_timeout),
            tick_interval: config.hub.tick_interval,
            max_frame_size: config.relay.max_frame_size,
            tx,
            rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle { tx: self.tx.clone() }
    }

    /// Run the event loop until `shutdown_rx` fires.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let mut links: HashMap<ConnId, Link> = HashMap::new();
        let mut next_conn: ConnId = 1;
        let mut tick = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(links = links.len(), "Shutting down relay hub");
                    for (_, link) in links.drain() {
                        link.task.abort();
                    }
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn = next_conn;
                            next_conn += 1;
                            let (outbound, outbound_rx) = mpsc::unbounded_channel();
                            let task = tokio::spawn(serve_link(
                                conn,
                                stream,
                                self.max_frame_size,
                                self.tx.clone(),
                                outbound_rx,
                            ));
                            links.insert(conn, Link { outbound, task });
                            info!(conn, peer = %peer, "Relay connection accepted");
                        }
                        Err(e) => error!(error = %e, "Error accepting relay connection"),
                    }
                }

                Some(command) = self.rx.recv() => {
                    match command {
                        HubCommand::Frame { conn, msg } => {
                            match self.state.apply(conn, msg, Instant::now()) {
                                Ok(Some(reply)) => {
                                    if let Some(link) = links.get(&conn) {
                                        match reply.to_message() {
                                            Ok(reply) => {
                                                let _ = link.outbound.send(reply);
                                            }
                                            Err(e) => error!(conn, error = %e, "Failed to encode hub reply"),
                                        }
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(conn, error = %e, "Dropping misbehaving relay connection");
                                    if let Some(link) = links.remove(&conn) {
                                        link.task.abort();
                                    }
                                    self.state.disconnect(conn);
                                }
                            }
                        }
                        HubCommand::Disconnected { conn } => {
                            links.remove(&conn);
                            self.state.disconnect(conn);
                        }
                        HubCommand::Lookup { role, reply } => {
                            let _ = reply.send(self.state.directory().lookup(role));
                        }
                        HubCommand::Snapshot { reply } => {
                            let _ = reply.send(self.state.directory().snapshot());
                        }
                    }
                }

                _ = tick.tick() => {
                    self.state.tick(Instant::now());
                }
            }
        }
    }
}

async fn serve_link(
    conn: ConnId,
    stream: TcpStream,
    max_frame_size: usize,
    events: mpsc::Sender<HubCommand>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let (mut sink, mut frames) = Framed::new(stream, RelayCodec::new(max_frame_size)).split();

    loop {
        tokio::select! {
            frame = frames.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(conn, error = %e, "Relay frame error");
                        break;
                    }
                    None => break,
                };
                match RelayMessage::from_message(msg) {
                    Ok(msg) => {
                        if events.send(HubCommand::Frame { conn, msg }).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(conn, error = %e, "Undecodable relay message");
                        break;
                    }
                }
            }

            reply = outbound.recv() => {
                match reply {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            warn!(conn, error = %e, "Relay write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    debug!(conn, "Relay connection closed");
    let _ = events.send(HubCommand::Disconnected { conn }).await;
}
