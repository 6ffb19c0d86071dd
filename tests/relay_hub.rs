//! End-to-end tests over loopback TCP: a running relay hub, role-side
//! coordinators linked to it, and a role server talking to a real client.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures::{SinkExt, StreamExt};
use session_relay::config::NetworkConfig;
use session_relay::core::codec::{ClientCodec, RelayCodec};
use session_relay::core::message::Message;
use session_relay::core::obfuscation::{ByteShuffle, Passthrough};
use session_relay::directory::DirectorySnapshot;
use session_relay::error::ProtocolError;
use session_relay::hub::{HubHandle, RelayHub};
use session_relay::migration::{MigrationCoordinator, RelayLink};
use session_relay::protocol::handshake::{Handshake, HANDSHAKE_LEN};
use session_relay::protocol::opcode::{client, server};
use session_relay::protocol::relay::{Endpoint, Identity, RelayMessage, RoleId};
use session_relay::session::connection::{CloseReason, MemorySink, Session, SessionListener};
use session_relay::session::pipeline::{AuthorityClaim, ExpectedArrivals};
use session_relay::session::state::{MigrateState, RoleKind};
use session_relay::transport::{RoleContext, RoleServer};
use session_relay::utils::Metrics;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Framed};

const CHANNEL: RoleId = RoleId::Channel { world: 0, channel: 1 };
const CHANNEL_ENDPOINT: Endpoint = Endpoint::new(Ipv4Addr::LOCALHOST, 8585);

fn loopback_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.hub.address = "127.0.0.1:0".into();
        c.hub.tick_interval = Duration::from_millis(50);
        c.relay.request_timeout = Duration::from_secs(2);
    })
}

struct RunningHub {
    config: NetworkConfig,
    handle: HubHandle,
    _shutdown: mpsc::Sender<()>,
}

async fn start_hub() -> RunningHub {
    let mut config = loopback_config();
    let hub = RelayHub::bind(&config).await.unwrap();
    config.relay.hub_address = hub.local_addr().unwrap().to_string();
    let handle = hub.handle();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(hub.run(shutdown_rx));
    RunningHub {
        config,
        handle,
        _shutdown: shutdown_tx,
    }
}

async fn link(hub: &RunningHub, role: RoleId, registrations: Vec<RelayMessage>) -> (Arc<MigrationCoordinator>, JoinHandle<()>) {
    let (coordinator, outbound) = MigrationCoordinator::new(role, &hub.config.relay, Arc::new(Metrics::new()));
    let task = RelayLink::spawn(&hub.config.relay, registrations, coordinator.clone(), outbound)
        .await
        .unwrap();
    (coordinator, task)
}

fn channel_registration() -> RelayMessage {
    RelayMessage::RegisterChannel {
        world_id: 0,
        world_name: "Scania".into(),
        channel_id: 1,
        endpoint: CHANNEL_ENDPOINT,
    }
}

async fn wait_for_snapshot<F>(handle: &HubHandle, done: F) -> DirectorySnapshot
where
    F: Fn(&DirectorySnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = handle.snapshot().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "hub never reached the expected state: {snapshot:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_state(session: &Session, state: MigrateState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != state {
        assert!(Instant::now() < deadline, "session stuck in {:?}", session.state());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn channel_is_listed(snapshot: &DirectorySnapshot) -> bool {
    snapshot
        .worlds
        .iter()
        .any(|w| w.world_id == 0 && w.channels.contains_key(&1))
}

fn handshake() -> Handshake {
    Handshake {
        version: 28,
        patch: 1,
        subtype: 49,
        recv_iv: [7, 7, 7, 7],
        send_iv: [9, 9, 9, 9],
        locale: 1,
    }
}

/// A role-side session plus the client codec that reads what it sends.
fn role_session(role: RoleKind) -> (Arc<Session>, MemorySink, ClientCodec) {
    let hs = handshake();
    let (_, encoder) = hs.server_codec(Arc::new(Passthrough)).split();
    let sink = MemorySink::new();
    let session = Session::new(1, role, encoder, Box::new(sink.clone()), Instant::now());
    (Arc::new(session), sink, hs.peer_codec(Arc::new(Passthrough)))
}

/// Reports session lifecycle events to the test body.
struct LifecycleLog {
    identified: mpsc::UnboundedSender<Identity>,
    closed: mpsc::UnboundedSender<CloseReason>,
}

impl LifecycleLog {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Identity>, mpsc::UnboundedReceiver<CloseReason>) {
        let (identified, identified_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { identified, closed }), identified_rx, closed_rx)
    }
}

impl SessionListener for LifecycleLog {
    fn on_identified(&self, _session: &Session, identity: Identity) {
        let _ = self.identified.send(identity);
    }

    fn on_closed(&self, _session: &Session, _last_state: MigrateState, reason: &CloseReason) {
        let _ = self.closed.send(reason.clone());
    }
}

async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within deadline")
        .expect("listener alive")
}

/// Connect a client to `addr` and complete the handshake.
async fn connect_client(addr: std::net::SocketAddr) -> Framed<TcpStream, ClientCodec> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut raw = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut raw).await.unwrap();
    let hs = Handshake::decode(&raw).unwrap();
    Framed::new(stream, hs.peer_codec(Arc::new(ByteShuffle)))
}

#[tokio::test]
async fn test_registration_appears_in_snapshot() {
    let hub = start_hub().await;
    let (_channel, _task) = link(&hub, CHANNEL, vec![channel_registration()]).await;

    let snapshot = wait_for_snapshot(&hub.handle, channel_is_listed).await;
    let world = &snapshot.worlds[0];
    assert_eq!(world.name, "Scania");
    assert_eq!(world.channels[&1].endpoint, CHANNEL_ENDPOINT);
    assert_eq!(hub.handle.lookup(CHANNEL).await.unwrap(), Some(CHANNEL_ENDPOINT));
    assert_eq!(hub.handle.lookup(RoleId::Shop).await.unwrap(), None);
}

#[tokio::test]
async fn test_migration_redirects_and_target_claims_authority() {
    let hub = start_hub().await;
    let (channel, _channel_task) = link(&hub, CHANNEL, vec![channel_registration()]).await;
    let (login, _login_task) = link(&hub, RoleId::Login, Vec::new()).await;
    wait_for_snapshot(&hub.handle, channel_is_listed).await;

    let identity: Identity = 4242;
    let (outgoing, sink, mut client) = role_session(RoleKind::Login);
    outgoing.authenticate(identity).unwrap();

    let endpoint = login.request_migration(&outgoing, CHANNEL).await.unwrap();
    assert_eq!(endpoint, CHANNEL_ENDPOINT);
    assert_eq!(outgoing.state(), MigrateState::WaitHandoffOut);

    let mut wire = sink.wire();
    let redirect = client.decode(&mut wire).unwrap().expect("redirect frame");
    assert_eq!(redirect.opcode(), server::MIGRATE_COMMAND);
    assert_eq!(redirect.payload(), &[1, 127, 0, 0, 1, 0x89, 0x21]);

    // The client reconnects to the channel, which claims the identity.
    let (incoming, _, _) = role_session(RoleKind::Channel);
    incoming.handshake_sent().unwrap();
    incoming.accept_migrate_in(identity, Instant::now()).unwrap();
    channel.claim(&incoming, identity).unwrap();
    wait_for_state(&incoming, MigrateState::Active).await;
    assert_eq!(incoming.identity(), Some(identity));

    let snapshot = hub.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.owned_identities, 1);
    assert_eq!(snapshot.pending_handoffs, 0);
}

#[tokio::test]
async fn test_directory_miss_keeps_session_active() {
    let hub = start_hub().await;
    let (login, _task) = link(&hub, RoleId::Login, Vec::new()).await;

    let (session, sink, mut client) = role_session(RoleKind::Login);
    session.authenticate(7).unwrap();

    let result = login.request_migration(&session, RoleId::Shop).await;
    assert!(matches!(result, Err(ProtocolError::DirectoryMiss(RoleId::Shop))));
    assert_eq!(session.state(), MigrateState::Active);
    assert!(!session.is_closed());

    let mut wire = sink.wire();
    let declined = client.decode(&mut wire).unwrap().expect("declined redirect");
    assert_eq!(declined.payload(), &[0]);
}

#[tokio::test]
async fn test_lost_channel_link_unregisters_it() {
    let hub = start_hub().await;
    let (_channel, channel_task) = link(&hub, CHANNEL, vec![channel_registration()]).await;
    let (login, _login_task) = link(&hub, RoleId::Login, Vec::new()).await;
    wait_for_snapshot(&hub.handle, channel_is_listed).await;

    channel_task.abort();
    let snapshot = wait_for_snapshot(&hub.handle, |s| !channel_is_listed(s)).await;
    assert!(snapshot.worlds.is_empty());

    let (session, _, _) = role_session(RoleKind::Login);
    session.authenticate(9).unwrap();
    let result = login.request_migration(&session, CHANNEL).await;
    assert!(matches!(result, Err(ProtocolError::DirectoryMiss(_))));
    assert_eq!(session.state(), MigrateState::Active);
}

#[tokio::test]
async fn test_role_server_handshake_and_frames() {
    let hub = start_hub().await;
    let metrics = Arc::new(Metrics::new());
    let (coordinator, _outbound) = MigrationCoordinator::new(RoleId::Login, &hub.config.relay, metrics.clone());

    let ctx = RoleContext::new(hub.config.clone(), RoleKind::Login, coordinator, Arc::new(ExpectedArrivals::new()))
        .unwrap()
        .with_metrics(metrics.clone());
    ctx.dispatcher
        .register(0x40, |session, msg| {
            let identity = msg.get_u32()?;
            session.authenticate(identity)?;
            session.send(0x41, &identity.to_le_bytes())
        })
        .unwrap();

    let server = RoleServer::bind(ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut raw = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut raw).await.unwrap();
    let hs = Handshake::decode(&raw).unwrap();
    assert_eq!(hs.version, 28);
    assert_eq!(hs.subtype, 49);

    let mut framed = Framed::new(stream, hs.peer_codec(Arc::new(ByteShuffle)));

    let mut ping = Message::new(client::ALIVE_REQ);
    ping.put_u32(1234);
    framed.send(ping).await.unwrap();
    let mut pong = framed.next().await.unwrap().unwrap();
    assert_eq!(pong.opcode(), server::ALIVE_REQ);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
    assert!(pong.get_u32().unwrap().abs_diff(now) <= 5);

    let mut login = Message::new(0x40);
    login.put_u32(55);
    framed.send(login).await.unwrap();
    let mut welcome = framed.next().await.unwrap().unwrap();
    assert_eq!(welcome.opcode(), 0x41);
    assert_eq!(welcome.get_u32().unwrap(), 55);

    // MIGRATE_IN is never legal on a login session.
    let mut bogus = Message::new(client::MIGRATE_IN);
    bogus.put_u32(55);
    framed.send(bogus).await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(5), framed.next()).await.unwrap();
    assert!(end.is_none() || matches!(end, Some(Err(_))));
    assert_eq!(metrics.snapshot().state_violations, 1);

    shutdown_tx.send(()).await.unwrap();
    server_task.await.unwrap().unwrap();
    assert_eq!(metrics.snapshot().connections_active, 0);
}

#[tokio::test]
async fn test_business_handler_migrates_its_session() {
    let hub = start_hub().await;
    let (_channel, _channel_task) = link(&hub, CHANNEL, vec![channel_registration()]).await;
    let (login, _login_task) = link(&hub, RoleId::Login, Vec::new()).await;
    wait_for_snapshot(&hub.handle, channel_is_listed).await;

    let ctx = RoleContext::new(hub.config.clone(), RoleKind::Login, login.clone(), Arc::new(ExpectedArrivals::new()))
        .unwrap();
    ctx.dispatcher
        .register(0x40, move |session, msg| {
            session.authenticate(msg.get_u32()?)?;
            let session = session.clone();
            let login = login.clone();
            tokio::spawn(async move {
                let _ = login.request_migration(&session, CHANNEL).await;
            });
            Ok(())
        })
        .unwrap();

    let server = RoleServer::bind(ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(server.run(shutdown_rx));

    let mut framed = connect_client(addr).await;
    let mut select = Message::new(0x40);
    select.put_u32(4243);
    framed.send(select).await.unwrap();

    let redirect = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(redirect.opcode(), server::MIGRATE_COMMAND);
    assert_eq!(redirect.payload(), &[1, 127, 0, 0, 1, 0x89, 0x21]);

    let snapshot = hub.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_handoffs, 1);
}

#[tokio::test]
async fn test_channel_server_admits_migrating_client() {
    let hub = start_hub().await;
    let (channel, _channel_task) = link(&hub, CHANNEL, vec![channel_registration()]).await;
    wait_for_snapshot(&hub.handle, channel_is_listed).await;

    let arrivals = Arc::new(ExpectedArrivals::new());
    arrivals.expect(808);
    let (log, mut identified, _closed) = LifecycleLog::new();
    let ctx = RoleContext::new(hub.config.clone(), RoleKind::Channel, channel, arrivals)
        .unwrap()
        .with_listener(log);
    ctx.dispatcher
        .register(0x40, |session, _msg| session.send(0x41, &[1]))
        .unwrap();

    let server = RoleServer::bind(ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(server.run(shutdown_rx));

    let mut framed = connect_client(addr).await;
    let mut arrive = Message::new(client::MIGRATE_IN);
    arrive.put_u32(808);
    framed.send(arrive).await.unwrap();
    assert_eq!(next_event(&mut identified).await, 808);

    framed.send(Message::new(0x40)).await.unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    assert_eq!(reply.opcode(), 0x41);

    let snapshot = hub.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.owned_identities, 1);
}

#[tokio::test]
async fn test_hub_loss_fails_waiting_sessions() {
    let mut config = loopback_config();
    let fake_hub = TcpListener::bind("127.0.0.1:0").await.unwrap();
    config.relay.hub_address = fake_hub.local_addr().unwrap().to_string();

    // Reads the registration, the claim and the request, then hangs up.
    let hub_task = tokio::spawn(async move {
        let (stream, _) = fake_hub.accept().await.unwrap();
        let mut framed = Framed::new(stream, RelayCodec::default());
        let mut seen = Vec::new();
        for _ in 0..3 {
            let msg = framed.next().await.unwrap().unwrap();
            seen.push(RelayMessage::from_message(msg).unwrap());
        }
        seen
    });

    let (coordinator, outbound) = MigrationCoordinator::new(CHANNEL, &config.relay, Arc::new(Metrics::new()));
    let link_task = RelayLink::spawn(&config.relay, vec![channel_registration()], coordinator.clone(), outbound)
        .await
        .unwrap();

    let (arriving, _, _) = role_session(RoleKind::Channel);
    arriving.handshake_sent().unwrap();
    arriving.accept_migrate_in(61, Instant::now()).unwrap();
    coordinator.claim(&arriving, 61).unwrap();

    let (leaving, _, _) = role_session(RoleKind::Channel);
    leaving.handshake_sent().unwrap();
    leaving.accept_migrate_in(62, Instant::now()).unwrap();
    leaving.confirm_authority(true).unwrap();
    let request = {
        let coordinator = coordinator.clone();
        let leaving = leaving.clone();
        tokio::spawn(async move { coordinator.request_migration(&leaving, RoleId::Shop).await })
    };

    let seen = hub_task.await.unwrap();
    assert!(matches!(seen[1], RelayMessage::ClaimAuthority { identity: 61, .. }));
    assert!(matches!(seen[2], RelayMessage::MigrateRequest { identity: 62, .. }));

    let result = tokio::time::timeout(Duration::from_secs(5), request).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProtocolError::Custom(_))));
    assert!(leaving.is_closed());

    tokio::time::timeout(Duration::from_secs(5), link_task).await.unwrap().unwrap();
    assert!(arriving.is_closed());
    assert_eq!(arriving.state(), MigrateState::Terminal);
}

#[tokio::test]
async fn test_role_server_reports_close_reasons() {
    let hub = start_hub().await;
    let (coordinator, _outbound) = MigrationCoordinator::new(RoleId::Login, &hub.config.relay, Arc::new(Metrics::new()));
    let (log, _identified, mut closed) = LifecycleLog::new();
    let ctx = RoleContext::new(hub.config.clone(), RoleKind::Login, coordinator, Arc::new(ExpectedArrivals::new()))
        .unwrap()
        .with_listener(log);

    let server = RoleServer::bind(ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(server.run(shutdown_rx));

    // A client that just leaves.
    drop(connect_client(addr).await);
    assert_eq!(next_event(&mut closed).await, CloseReason::PeerClosed);

    // A client that breaks the protocol.
    let mut framed = connect_client(addr).await;
    let mut bogus = Message::new(client::MIGRATE_IN);
    bogus.put_u32(3);
    framed.send(bogus).await.unwrap();
    assert!(matches!(next_event(&mut closed).await, CloseReason::Fault(_)));
}
