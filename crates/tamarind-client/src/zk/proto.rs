//! ZooKeeper jute wire encoding
//!
//! Every packet is a big-endian `i32` length followed by the record.
//! Buffers and strings are length-prefixed; a length of `-1` means null.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tamarind_common::{
    CreateMode, EventType, KeeperError, KeeperResult, KeeperState, Stat, WatchedEvent,
};

pub const PROTOCOL_VERSION: i32 = 0;

/// Reserved xids
pub const NOTIFICATION_XID: i32 = -1;
pub const PING_XID: i32 = -2;

/// Largest frame accepted from a server
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub mod op {
    pub const CREATE: i32 = 1;
    pub const DELETE: i32 = 2;
    pub const EXISTS: i32 = 3;
    pub const GET_DATA: i32 = 4;
    pub const SET_DATA: i32 = 5;
    pub const PING: i32 = 11;
    pub const CLOSE_SESSION: i32 = -11;
}

/// Permission bits of `OPEN_ACL_UNSAFE`
const PERM_ALL: i32 = 31;

fn malformed(what: &str) -> KeeperError {
    KeeperError::Io(format!("malformed frame: {}", what))
}

/// Jute primitives on top of `BufMut`
pub trait JuteWrite: BufMut {
    fn put_jute_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_jute_buffer(&mut self, data: &[u8]) {
        self.put_i32(data.len() as i32);
        self.put_slice(data);
    }

    fn put_jute_string(&mut self, value: &str) {
        self.put_jute_buffer(value.as_bytes());
    }
}

impl<T: BufMut + ?Sized> JuteWrite for T {}

/// Bounds-checked jute reader
pub struct JuteReader<B: Buf> {
    buf: B,
}

impl<B: Buf> JuteReader<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, len: usize, what: &str) -> KeeperResult<()> {
        if self.buf.remaining() < len {
            return Err(malformed(what));
        }
        Ok(())
    }

    pub fn read_i32(&mut self) -> KeeperResult<i32> {
        self.need(4, "int")?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> KeeperResult<i64> {
        self.need(8, "long")?;
        Ok(self.buf.get_i64())
    }

    pub fn read_bool(&mut self) -> KeeperResult<bool> {
        self.need(1, "bool")?;
        Ok(self.buf.get_u8() != 0)
    }

    pub fn read_buffer(&mut self) -> KeeperResult<Option<Vec<u8>>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len, "buffer")?;
        let mut data = vec![0; len];
        self.buf.copy_to_slice(&mut data);
        Ok(Some(data))
    }

    pub fn read_string(&mut self) -> KeeperResult<Option<String>> {
        match self.read_buffer()? {
            Some(data) => String::from_utf8(data)
                .map(Some)
                .map_err(|_| malformed("string is not UTF-8")),
            None => Ok(None),
        }
    }

    pub fn read_stat(&mut self) -> KeeperResult<Stat> {
        Ok(Stat {
            czxid: self.read_i64()?,
            mzxid: self.read_i64()?,
            ctime: self.read_i64()?,
            mtime: self.read_i64()?,
            version: self.read_i32()?,
            cversion: self.read_i32()?,
            aversion: self.read_i32()?,
            ephemeral_owner: self.read_i64()?,
            data_length: self.read_i32()?,
            num_children: self.read_i32()?,
            pzxid: self.read_i64()?,
        })
    }
}

/// Session handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl ConnectRequest {
    pub fn encode(&self) -> Bytes {
        frame(|buf| {
            buf.put_i32(PROTOCOL_VERSION);
            buf.put_i64(self.last_zxid_seen);
            buf.put_i32(self.timeout_ms);
            buf.put_i64(self.session_id);
            buf.put_jute_buffer(&self.passwd);
            buf.put_jute_bool(false);
        })
    }
}

/// Session handshake response. A non-positive timeout means the
/// requested session has expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
    pub read_only: bool,
}

impl ConnectResponse {
    pub fn decode(body: Bytes) -> KeeperResult<Self> {
        let mut reader = JuteReader::new(body);
        let _protocol_version = reader.read_i32()?;
        let timeout_ms = reader.read_i32()?;
        let session_id = reader.read_i64()?;
        let passwd = reader.read_buffer()?.unwrap_or_default();
        // Servers before 3.4 omit the flag
        let read_only = if reader.remaining() > 0 {
            reader.read_bool()?
        } else {
            false
        };
        Ok(Self {
            timeout_ms,
            session_id,
            passwd,
            read_only,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.timeout_ms <= 0
    }
}

/// Header of every server reply after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

/// Client requests after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    Exists {
        path: String,
    },
    GetData {
        path: String,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },
    Ping,
    CloseSession,
}

impl Request {
    pub fn op_code(&self) -> i32 {
        match self {
            Request::Create { .. } => op::CREATE,
            Request::Delete { .. } => op::DELETE,
            Request::Exists { .. } => op::EXISTS,
            Request::GetData { .. } => op::GET_DATA,
            Request::SetData { .. } => op::SET_DATA,
            Request::Ping => op::PING,
            Request::CloseSession => op::CLOSE_SESSION,
        }
    }

    /// Node the request targets, empty for session requests.
    pub fn path(&self) -> &str {
        match self {
            Request::Create { path, .. }
            | Request::Delete { path, .. }
            | Request::Exists { path }
            | Request::GetData { path }
            | Request::SetData { path, .. } => path,
            Request::Ping | Request::CloseSession => "",
        }
    }

    /// Length-prefixed packet for this request.
    pub fn encode(&self, xid: i32) -> Bytes {
        frame(|buf| {
            buf.put_i32(xid);
            buf.put_i32(self.op_code());
            match self {
                Request::Create { path, data, mode } => {
                    buf.put_jute_string(path);
                    buf.put_jute_buffer(data);
                    // OPEN_ACL_UNSAFE: one entry granting world:anyone everything
                    buf.put_i32(1);
                    buf.put_i32(PERM_ALL);
                    buf.put_jute_string("world");
                    buf.put_jute_string("anyone");
                    buf.put_i32(mode.flags());
                }
                Request::Delete { path, version } => {
                    buf.put_jute_string(path);
                    buf.put_i32(*version);
                }
                Request::Exists { path } | Request::GetData { path } => {
                    buf.put_jute_string(path);
                    buf.put_jute_bool(false);
                }
                Request::SetData {
                    path,
                    data,
                    version,
                } => {
                    buf.put_jute_string(path);
                    buf.put_jute_buffer(data);
                    buf.put_i32(*version);
                }
                Request::Ping | Request::CloseSession => {}
            }
        })
    }
}

/// A reply frame split into header and remaining body
#[derive(Debug)]
pub struct Reply {
    pub header: ReplyHeader,
    pub body: Bytes,
}

impl Reply {
    pub fn decode(mut frame: Bytes) -> KeeperResult<Self> {
        if frame.remaining() < 16 {
            return Err(malformed("reply header"));
        }
        let header = ReplyHeader {
            xid: frame.get_i32(),
            zxid: frame.get_i64(),
            err: frame.get_i32(),
        };
        Ok(Self {
            header,
            body: frame,
        })
    }
}

/// Decode a watch notification body.
pub fn decode_watcher_event(body: Bytes) -> KeeperResult<WatchedEvent> {
    let mut reader = JuteReader::new(body);
    let event_type = reader.read_i32()?;
    let state = reader.read_i32()?;
    let path = reader.read_string()?;
    Ok(WatchedEvent {
        event_type: EventType::from_code(event_type)
            .ok_or_else(|| malformed("unknown event type"))?,
        state: KeeperState::from_code(state).ok_or_else(|| malformed("unknown keeper state"))?,
        path,
    })
}

pub fn decode_create(body: Bytes) -> KeeperResult<String> {
    JuteReader::new(body)
        .read_string()?
        .ok_or_else(|| malformed("create response without path"))
}

pub fn decode_stat(body: Bytes) -> KeeperResult<Stat> {
    JuteReader::new(body).read_stat()
}

pub fn decode_get_data(body: Bytes) -> KeeperResult<(Vec<u8>, Stat)> {
    let mut reader = JuteReader::new(body);
    let data = reader.read_buffer()?.unwrap_or_default();
    let stat = reader.read_stat()?;
    Ok((data, stat))
}

fn frame(write: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_i32(0);
    write(&mut buf);
    let len = (buf.len() - 4) as i32;
    buf[..4].copy_from_slice(&len.to_be_bytes());
    buf.freeze()
}
