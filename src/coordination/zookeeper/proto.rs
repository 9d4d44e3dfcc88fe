//! ZooKeeper Wire Protocol
//!
//! Jute encoding of the requests the election needs. Integers are
//! big-endian, strings and buffers carry an i32 length prefix (-1 for null)
//! and every packet on the wire is prefixed with its i32 length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::coordination::{Acl, CoordError, CoordResult, CreateMode};

/// Protocol version sent in the connect handshake
pub const PROTOCOL_VERSION: i32 = 0;

/// Length of the session password
pub const PASSWORD_LEN: usize = 16;

/// Largest packet accepted from a server
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Operation codes
pub mod op {
    pub const CREATE: i32 = 1;
    pub const GET_DATA: i32 = 4;
    pub const GET_CHILDREN: i32 = 8;
    pub const PING: i32 = 11;
    pub const CLOSE_SESSION: i32 = -11;
}

/// Reserved transaction ids
pub mod xid {
    pub const NOTIFICATION: i32 = -1;
    pub const PING: i32 = -2;
}

/// Watcher event types
pub mod event {
    pub const NONE: i32 = -1;
    pub const NODE_CREATED: i32 = 1;
    pub const NODE_DELETED: i32 = 2;
    pub const NODE_DATA_CHANGED: i32 = 3;
    pub const NODE_CHILDREN_CHANGED: i32 = 4;
}

/// Server error codes
pub mod code {
    pub const OK: i32 = 0;
    pub const CONNECTION_LOSS: i32 = -4;
    pub const BAD_ARGUMENTS: i32 = -8;
    pub const NO_NODE: i32 = -101;
    pub const NO_AUTH: i32 = -102;
    pub const NO_CHILDREN_FOR_EPHEMERALS: i32 = -108;
    pub const NODE_EXISTS: i32 = -110;
    pub const NOT_EMPTY: i32 = -111;
    pub const SESSION_EXPIRED: i32 = -112;
    pub const INVALID_ACL: i32 = -114;
    pub const SESSION_MOVED: i32 = -118;
}

fn truncated(what: &str) -> CoordError {
    CoordError::Other(format!("truncated {} in server reply", what))
}

fn need(buf: &Bytes, len: usize, what: &str) -> CoordResult<()> {
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    Ok(())
}

pub fn get_i32(buf: &mut Bytes) -> CoordResult<i32> {
    need(buf, 4, "int")?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut Bytes) -> CoordResult<i64> {
    need(buf, 8, "long")?;
    Ok(buf.get_i64())
}

/// Decode a length-prefixed buffer; null decodes as empty
pub fn get_buffer(buf: &mut Bytes) -> CoordResult<Vec<u8>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(Vec::new());
    }
    let len = len as usize;
    need(buf, len, "buffer")?;
    Ok(buf.split_to(len).to_vec())
}

pub fn get_string(buf: &mut Bytes) -> CoordResult<String> {
    let raw = get_buffer(buf)?;
    String::from_utf8(raw).map_err(|_| CoordError::Other("non UTF-8 string in server reply".into()))
}

pub fn get_string_vec(buf: &mut Bytes) -> CoordResult<Vec<String>> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Ok(Vec::new());
    }
    (0..count).map(|_| get_string(buf)).collect()
}

fn put_buffer(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_buffer(buf, s.as_bytes());
}

/// Session handshake sent on every (re)connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectRequest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(28 + PASSWORD_LEN);
        buf.put_i32(PROTOCOL_VERSION);
        buf.put_i64(self.last_zxid_seen);
        buf.put_i32(self.timeout_ms);
        buf.put_i64(self.session_id);
        put_buffer(&mut buf, &self.password);
        buf
    }
}

/// Server answer to the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectResponse {
    pub fn decode(buf: &mut Bytes) -> CoordResult<Self> {
        let _protocol_version = get_i32(buf)?;
        let timeout_ms = get_i32(buf)?;
        let session_id = get_i64(buf)?;
        let password = get_buffer(buf)?;
        Ok(Self {
            timeout_ms,
            session_id,
            password,
        })
    }

    /// A non-positive timeout means the server refused to resume the session
    pub fn is_expired(&self) -> bool {
        self.timeout_ms <= 0
    }
}

/// Header of every reply after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub fn decode(buf: &mut Bytes) -> CoordResult<Self> {
        Ok(Self {
            xid: get_i32(buf)?,
            zxid: get_i64(buf)?,
            err: get_i32(buf)?,
        })
    }
}

/// Watch notification pushed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl WatcherEvent {
    pub fn decode(buf: &mut Bytes) -> CoordResult<Self> {
        Ok(Self {
            event_type: get_i32(buf)?,
            state: get_i32(buf)?,
            path: get_string(buf)?,
        })
    }
}

/// Request header followed by the operation body
pub fn request(xid: i32, opcode: i32, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_i32(xid);
    buf.put_i32(opcode);
    buf.put_slice(body);
    buf
}

pub fn create_flags(mode: CreateMode) -> i32 {
    match mode {
        CreateMode::Persistent => 0,
        CreateMode::Ephemeral => 1,
        CreateMode::PersistentSequential => 2,
        CreateMode::EphemeralSequential => 3,
    }
}

pub fn create_body(path: &str, data: &[u8], mode: CreateMode, acl: &[Acl]) -> BytesMut {
    let mut buf = BytesMut::new();
    put_string(&mut buf, path);
    put_buffer(&mut buf, data);
    buf.put_i32(acl.len() as i32);
    for entry in acl {
        buf.put_i32(entry.perms as i32);
        put_string(&mut buf, &entry.scheme);
        put_string(&mut buf, &entry.id);
    }
    buf.put_i32(create_flags(mode));
    buf
}

/// Body shared by getData and getChildren
pub fn path_watch_body(path: &str, watch: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    put_string(&mut buf, path);
    buf.put_u8(watch as u8);
    buf
}

/// Map a server error code onto the client error kinds
pub fn error_for(code: i32, path: &str) -> CoordError {
    match code {
        code::NO_NODE => CoordError::NoNode(path.to_string()),
        code::NODE_EXISTS => CoordError::NodeExists(path.to_string()),
        code::CONNECTION_LOSS | code::SESSION_MOVED => CoordError::ConnectionLoss,
        code::SESSION_EXPIRED => CoordError::SessionExpired,
        code::NO_CHILDREN_FOR_EPHEMERALS => {
            CoordError::Other(format!("ephemeral node cannot have children: {}", path))
        }
        code::NO_AUTH => CoordError::Other(format!("not authorized for {}", path)),
        code::NOT_EMPTY => CoordError::Other(format!("node {} has children", path)),
        code::INVALID_ACL => CoordError::Other(format!("invalid ACL for {}", path)),
        code::BAD_ARGUMENTS => CoordError::Other(format!("bad arguments for {}", path)),
        other => CoordError::Other(format!("ZooKeeper error {} on {}", other, path)),
    }
}

/// Read one length-prefixed packet
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Bytes> {
    let len = reader.read_i32().await?;
    if len < 0 || len as usize > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid packet length {}", len),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Write one length-prefixed packet
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_layout() {
        let request = ConnectRequest {
            last_zxid_seen: 7,
            timeout_ms: 1000,
            session_id: 0x42,
            password: vec![0; PASSWORD_LEN],
        };
        let mut buf = request.encode().freeze();
        assert_eq!(buf.len(), 4 + 8 + 4 + 8 + 4 + PASSWORD_LEN);
        assert_eq!(get_i32(&mut buf).unwrap(), PROTOCOL_VERSION);
        assert_eq!(get_i64(&mut buf).unwrap(), 7);
        assert_eq!(get_i32(&mut buf).unwrap(), 1000);
        assert_eq!(get_i64(&mut buf).unwrap(), 0x42);
        assert_eq!(get_buffer(&mut buf).unwrap(), vec![0; PASSWORD_LEN]);
    }

    #[test]
    fn test_connect_response_expiry() {
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i64(0);
        put_buffer(&mut buf, &[0; PASSWORD_LEN]);
        let response = ConnectResponse::decode(&mut buf.freeze()).unwrap();
        assert!(response.is_expired());
    }

    #[test]
    fn test_create_body() {
        let mut buf = create_body("/e/node-", b"n1", CreateMode::EphemeralSequential, &Acl::open_unsafe())
            .freeze();
        assert_eq!(get_string(&mut buf).unwrap(), "/e/node-");
        assert_eq!(get_buffer(&mut buf).unwrap(), b"n1");
        assert_eq!(get_i32(&mut buf).unwrap(), 1);
        assert_eq!(get_i32(&mut buf).unwrap(), Acl::PERM_ALL as i32);
        assert_eq!(get_string(&mut buf).unwrap(), "world");
        assert_eq!(get_string(&mut buf).unwrap(), "anyone");
        assert_eq!(get_i32(&mut buf).unwrap(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_reply_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_i32(2);
        put_string(&mut buf, "node-0000000000");
        buf.put_i32(100);
        let err = get_string_vec(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, CoordError::Other(_)));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(error_for(code::NO_NODE, "/a"), CoordError::NoNode("/a".into()));
        assert_eq!(error_for(code::NODE_EXISTS, "/a"), CoordError::NodeExists("/a".into()));
        assert_eq!(error_for(code::SESSION_EXPIRED, "/a"), CoordError::SessionExpired);
        assert!(error_for(code::CONNECTION_LOSS, "/a").is_session_lost());
        assert!(matches!(error_for(-999, "/a"), CoordError::Other(_)));
    }

    #[tokio::test]
    async fn test_frame_round_trip_over_pipe() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"hello").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), Bytes::from_static(b"hello"));

        server.write_all(&(-5i32).to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut client).await.is_err());
    }
}
