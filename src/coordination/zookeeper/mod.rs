//! ZooKeeper Client
//!
//! Session-holding client for a ZooKeeper ensemble over the native TCP
//! protocol. A single I/O task owns the connection: it matches replies to
//! requests by xid, pings the server, dispatches watch notifications and
//! walks the address list again when the connection drops. A session the
//! server refuses to resume is reported as expired and replaced by a fresh
//! one.

mod proto;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::{
    Acl, CoordError, CoordResult, CoordinationClient, Connector, CreateMode, SessionEvent,
    SessionEvents, SessionState, WatchEvent, WatchReceiver,
};
use proto::{op, xid};

/// Port used when an address has none
pub const DEFAULT_PORT: u16 = 2181;

/// Pause after every server in the list refused a connection
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// How long `close` waits for the server to confirm
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens sessions against a ZooKeeper ensemble
#[derive(Debug, Clone, Copy, Default)]
pub struct ZkConnector;

impl ZkConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for ZkConnector {
    type Client = ZkClient;

    async fn connect(
        &self,
        addresses: &[String],
        session_timeout: Duration,
    ) -> CoordResult<(Arc<ZkClient>, SessionEvents)> {
        if addresses.is_empty() {
            return Err(CoordError::Other("no ZooKeeper servers configured".into()));
        }

        let shared = Arc::new(Mutex::new(Shared {
            state: SessionState::Connecting,
            session_id: 0,
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = Session::new(addresses, session_timeout, shared.clone(), events_tx);

        session.emit(SessionState::Connecting);
        let connection = session.establish().await?;

        let (commands, commands_rx) = mpsc::channel(64);
        tokio::spawn(session.run(connection, commands_rx));

        Ok((Arc::new(ZkClient { commands, shared }), events_rx))
    }
}

struct Shared {
    state: SessionState,
    session_id: i64,
}

struct Reply {
    body: Bytes,
    watch: Option<WatchReceiver>,
}

enum Command {
    Call {
        opcode: i32,
        path: String,
        body: BytesMut,
        watch: bool,
        reply: oneshot::Sender<CoordResult<Reply>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Client handle; cheap to share between tasks
pub struct ZkClient {
    commands: mpsc::Sender<Command>,
    shared: Arc<Mutex<Shared>>,
}

impl ZkClient {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session id (0 before the first session)
    pub fn session_id(&self) -> i64 {
        self.shared().session_id
    }

    async fn call(&self, opcode: i32, path: &str, body: BytesMut, watch: bool) -> CoordResult<Reply> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                opcode,
                path: path.to_string(),
                body,
                watch,
                reply,
            })
            .await
            .map_err(|_| CoordError::Closing)?;
        rx.await.map_err(|_| CoordError::ConnectionLoss)?
    }
}

#[async_trait]
impl CoordinationClient for ZkClient {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> CoordResult<String> {
        let body = proto::create_body(path, data, mode, acl);
        let mut reply = self.call(op::CREATE, path, body, false).await?;
        proto::get_string(&mut reply.body)
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        let body = proto::path_watch_body(path, false);
        let mut reply = self.call(op::GET_CHILDREN, path, body, false).await?;
        proto::get_string_vec(&mut reply.body)
    }

    async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
        let body = proto::path_watch_body(path, false);
        let mut reply = self.call(op::GET_DATA, path, body, false).await?;
        proto::get_buffer(&mut reply.body)
    }

    async fn get_watch(&self, path: &str) -> CoordResult<(Vec<u8>, WatchReceiver)> {
        let body = proto::path_watch_body(path, true);
        let mut reply = self.call(op::GET_DATA, path, body, true).await?;
        let data = proto::get_buffer(&mut reply.body)?;
        let watch = reply
            .watch
            .ok_or_else(|| CoordError::Other(format!("no watch registered on {}", path)))?;
        Ok((data, watch))
    }

    fn session_state(&self) -> SessionState {
        self.shared().state
    }

    async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// An established connection
struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    timeout: Duration,
    session_id: i64,
    password: Vec<u8>,
}

enum HandshakeError {
    Io(String),
    Expired,
}

/// How a served connection ended
enum Served {
    Lost(String),
    Closed(Option<oneshot::Sender<()>>),
}

struct Pending {
    path: String,
    watch: bool,
    reply: oneshot::Sender<CoordResult<Reply>>,
}

/// State owned by the I/O task
struct Session {
    servers: Vec<String>,
    next_server: usize,
    requested_timeout: Duration,
    negotiated_timeout: Duration,
    session_id: i64,
    password: Vec<u8>,
    last_zxid: i64,
    next_xid: i32,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    fn new(
        addresses: &[String],
        session_timeout: Duration,
        shared: Arc<Mutex<Shared>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let servers = addresses
            .iter()
            .map(|address| {
                if address.contains(':') {
                    address.clone()
                } else {
                    format!("{}:{}", address, DEFAULT_PORT)
                }
            })
            .collect();

        Self {
            servers,
            next_server: 0,
            requested_timeout: session_timeout,
            negotiated_timeout: session_timeout,
            session_id: 0,
            password: vec![0; proto::PASSWORD_LEN],
            last_zxid: 0,
            next_xid: 1,
            watches: HashMap::new(),
            shared,
            events,
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.state = state;
        shared.session_id = self.session_id;
    }

    fn emit(&self, state: SessionState) {
        self.set_state(state);
        let _ = self.events.send(SessionEvent {
            state,
            session_id: self.session_id,
        });
    }

    fn connect_timeout(&self) -> Duration {
        self.requested_timeout.max(Duration::from_secs(1))
    }

    fn xid(&mut self) -> i32 {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.checked_add(1).unwrap_or(1);
        xid
    }

    /// Try every server once, resuming the current session where possible
    async fn establish(&mut self) -> CoordResult<Connection> {
        for _ in 0..self.servers.len() {
            let server = self.servers[self.next_server].clone();
            self.next_server = (self.next_server + 1) % self.servers.len();

            match self.handshake(&server).await {
                Ok(connection) => {
                    let resumed = self.session_id == connection.session_id;
                    self.session_id = connection.session_id;
                    self.password = connection.password.clone();
                    self.negotiated_timeout = connection.timeout;
                    tracing::info!(
                        "ZooKeeper session {:#x} {} on {} (timeout {:?})",
                        self.session_id,
                        if resumed { "resumed" } else { "established" },
                        server,
                        connection.timeout
                    );
                    self.emit(SessionState::Connected);
                    self.emit(SessionState::HasSession);
                    return Ok(connection);
                }
                Err(HandshakeError::Expired) => {
                    tracing::warn!("ZooKeeper session {:#x} expired", self.session_id);
                    self.emit(SessionState::Expired);
                    self.session_id = 0;
                    self.password = vec![0; proto::PASSWORD_LEN];
                    self.emit(SessionState::Connecting);
                }
                Err(HandshakeError::Io(reason)) => {
                    tracing::warn!("Failed to connect to ZooKeeper at {}: {}", server, reason);
                }
            }
        }
        Err(CoordError::ConnectionLoss)
    }

    async fn handshake(&self, server: &str) -> std::result::Result<Connection, HandshakeError> {
        let io = |e: std::io::Error| HandshakeError::Io(e.to_string());
        let limit = self.connect_timeout();

        let stream = timeout(limit, TcpStream::connect(server))
            .await
            .map_err(|_| HandshakeError::Io("connect timed out".into()))?
            .map_err(io)?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let request = proto::ConnectRequest {
            last_zxid_seen: self.last_zxid,
            timeout_ms: self.requested_timeout.as_millis().min(i32::MAX as u128) as i32,
            session_id: self.session_id,
            password: self.password.clone(),
        };
        proto::write_frame(&mut writer, &request.encode()).await.map_err(io)?;

        let mut frame = timeout(limit, proto::read_frame(&mut reader))
            .await
            .map_err(|_| HandshakeError::Io("handshake timed out".into()))?
            .map_err(io)?;
        let response = proto::ConnectResponse::decode(&mut frame)
            .map_err(|e| HandshakeError::Io(e.to_string()))?;

        if response.is_expired() {
            return Err(HandshakeError::Expired);
        }

        Ok(Connection {
            reader,
            writer,
            timeout: Duration::from_millis(response.timeout_ms as u64),
            session_id: response.session_id,
            password: response.password,
        })
    }

    async fn run(mut self, connection: Connection, mut commands: mpsc::Receiver<Command>) {
        let mut next = Some(connection);
        loop {
            let connection = match next.take() {
                Some(connection) => connection,
                None => match self.reconnect(&mut commands).await {
                    Some(connection) => connection,
                    None => return,
                },
            };

            match self.serve(connection, &mut commands).await {
                Served::Lost(reason) => self.connection_lost(&reason),
                Served::Closed(done) => {
                    self.finish();
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }
            }
        }
    }

    async fn serve(&mut self, connection: Connection, commands: &mut mpsc::Receiver<Command>) -> Served {
        let Connection {
            reader,
            mut writer,
            timeout: session_timeout,
            ..
        } = connection;

        let (frames_tx, mut frames) = mpsc::channel(64);
        let reader_task = tokio::spawn(read_frames(reader, frames_tx));

        let mut pending: HashMap<i32, Pending> = HashMap::new();
        let mut ping = interval((session_timeout / 3).max(Duration::from_millis(10)));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let read_timeout = session_timeout * 2 / 3;
        let mut last_heard = Instant::now();

        let outcome = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Call { opcode, path, body, watch, reply }) => {
                        let xid = self.xid();
                        let packet = proto::request(xid, opcode, &body);
                        if let Err(e) = proto::write_frame(&mut writer, &packet).await {
                            let _ = reply.send(Err(CoordError::ConnectionLoss));
                            break Served::Lost(e.to_string());
                        }
                        pending.insert(xid, Pending { path, watch, reply });
                    }
                    Some(Command::Close { done }) => {
                        self.close_session(&mut writer, &mut frames).await;
                        break Served::Closed(Some(done));
                    }
                    None => {
                        self.close_session(&mut writer, &mut frames).await;
                        break Served::Closed(None);
                    }
                },
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        last_heard = Instant::now();
                        if let Err(e) = self.dispatch(frame, &mut pending) {
                            break Served::Lost(e.to_string());
                        }
                    }
                    None => break Served::Lost("connection closed by server".into()),
                },
                _ = ping.tick() => {
                    if last_heard.elapsed() > read_timeout {
                        break Served::Lost(format!("no reply from server in {:?}", read_timeout));
                    }
                    let packet = proto::request(xid::PING, op::PING, &[]);
                    if let Err(e) = proto::write_frame(&mut writer, &packet).await {
                        break Served::Lost(e.to_string());
                    }
                }
            }
        };

        reader_task.abort();
        for (_, request) in pending.drain() {
            let _ = request.reply.send(Err(CoordError::ConnectionLoss));
        }
        outcome
    }

    fn dispatch(&mut self, mut frame: Bytes, pending: &mut HashMap<i32, Pending>) -> CoordResult<()> {
        let header = proto::ReplyHeader::decode(&mut frame)?;
        match header.xid {
            xid::PING => Ok(()),
            xid::NOTIFICATION => {
                let event = proto::WatcherEvent::decode(&mut frame)?;
                self.on_watch_event(event);
                Ok(())
            }
            id => {
                if header.zxid > self.last_zxid {
                    self.last_zxid = header.zxid;
                }
                let Some(request) = pending.remove(&id) else {
                    tracing::warn!("ZooKeeper reply for unknown xid {}", id);
                    return Ok(());
                };

                let result = if header.err != proto::code::OK {
                    Err(proto::error_for(header.err, &request.path))
                } else {
                    let watch = request.watch.then(|| {
                        let (tx, rx) = oneshot::channel();
                        self.watches.entry(request.path.clone()).or_default().push(tx);
                        rx
                    });
                    Ok(Reply { body: frame, watch })
                };
                let _ = request.reply.send(result);
                Ok(())
            }
        }
    }

    fn on_watch_event(&mut self, event: proto::WatcherEvent) {
        let fired = match event.event_type {
            proto::event::NODE_DELETED => WatchEvent::NodeDeleted,
            proto::event::NODE_DATA_CHANGED => WatchEvent::NodeDataChanged,
            proto::event::NODE_CREATED | proto::event::NODE_CHILDREN_CHANGED | proto::event::NONE => {
                tracing::trace!(
                    "Ignoring watch event {} (state {}) on {:?}",
                    event.event_type,
                    event.state,
                    event.path
                );
                return;
            }
            other => {
                tracing::debug!("Unknown watch event type {} on {:?}", other, event.path);
                return;
            }
        };

        if let Some(watches) = self.watches.remove(&event.path) {
            for watch in watches {
                let _ = watch.send(fired);
            }
        }
    }

    /// Outstanding watches end with the session state that invalidated them
    fn fire_all(&mut self, state: SessionState) {
        for (_, watches) in self.watches.drain() {
            for watch in watches {
                let _ = watch.send(WatchEvent::Session(state));
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        tracing::warn!(
            "Lost connection for ZooKeeper session {:#x}: {}",
            self.session_id,
            reason
        );
        self.emit(SessionState::Disconnected);
        self.fire_all(SessionState::Disconnected);
    }

    async fn reconnect(&mut self, commands: &mut mpsc::Receiver<Command>) -> Option<Connection> {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Call { reply, .. }) => {
                        let _ = reply.send(Err(CoordError::ConnectionLoss));
                    }
                    Some(Command::Close { done }) => {
                        self.finish();
                        let _ = done.send(());
                        return None;
                    }
                    None => {
                        self.finish();
                        return None;
                    }
                },
                connection = self.establish() => match connection {
                    Ok(connection) => return Some(connection),
                    Err(_) => tokio::time::sleep(RECONNECT_BACKOFF).await,
                },
            }
        }
    }

    async fn close_session(&mut self, writer: &mut OwnedWriteHalf, frames: &mut mpsc::Receiver<Bytes>) {
        let close_xid = self.xid();
        let packet = proto::request(close_xid, op::CLOSE_SESSION, &[]);
        if proto::write_frame(writer, &packet).await.is_err() {
            return;
        }

        let confirmed = timeout(CLOSE_TIMEOUT, async {
            while let Some(mut frame) = frames.recv().await {
                if let Ok(header) = proto::ReplyHeader::decode(&mut frame) {
                    if header.xid == close_xid {
                        return;
                    }
                }
            }
        })
        .await;
        if confirmed.is_err() {
            tracing::debug!("ZooKeeper did not confirm closing session {:#x}", self.session_id);
        }
    }

    fn finish(&mut self) {
        tracing::info!("ZooKeeper session {:#x} closed", self.session_id);
        self.emit(SessionState::Closed);
        self.fire_all(SessionState::Closed);
    }
}

async fn read_frames(mut reader: OwnedReadHalf, frames: mpsc::Sender<Bytes>) {
    loop {
        match proto::read_frame(&mut reader).await {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("ZooKeeper connection read ended: {}", e);
                return;
            }
        }
    }
}
