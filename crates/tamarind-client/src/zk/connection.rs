//! Session engine of the ZooKeeper transport
//!
//! One task owns the TCP connection. It performs the handshake, writes
//! requests in submission order, correlates replies by xid, pings at a
//! third of the negotiated timeout, and on connection loss reconnects to
//! the next endpoint with the same session id and password.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tamarind_common::{Endpoint, EventSink, KeeperError, KeeperResult, KeeperState, WatchedEvent};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::proto::{
    ConnectRequest, ConnectResponse, MAX_FRAME_LEN, NOTIFICATION_XID, PING_XID, Reply, Request,
    decode_watcher_event,
};

/// A request waiting to be written, with its reply slot
pub(crate) struct Call {
    pub request: Request,
    pub reply: oneshot::Sender<KeeperResult<Bytes>>,
}

/// Session facts shared between the engine and client handles
pub(crate) struct SessionShared {
    pub session_id: AtomicI64,
    pub timeout_ms: AtomicU64,
    pub connected: AtomicBool,
    pub expired: AtomicBool,
}

impl SessionShared {
    pub fn new(requested: Duration) -> Self {
        Self {
            session_id: AtomicI64::new(0),
            timeout_ms: AtomicU64::new(requested.as_millis() as u64),
            connected: AtomicBool::new(false),
            expired: AtomicBool::new(false),
        }
    }
}

enum Served {
    Closed,
    Expired,
    Lost(KeeperError),
}

pub(crate) struct SessionEngine {
    endpoints: Vec<Endpoint>,
    requested: Duration,
    events: EventSink,
    shared: Arc<SessionShared>,
    calls: mpsc::UnboundedReceiver<Call>,
    session_id: i64,
    passwd: Vec<u8>,
    last_zxid: i64,
    timeout: Duration,
}

impl SessionEngine {
    pub fn new(
        endpoints: Vec<Endpoint>,
        requested: Duration,
        events: EventSink,
        shared: Arc<SessionShared>,
        calls: mpsc::UnboundedReceiver<Call>,
    ) -> Self {
        Self {
            endpoints,
            requested,
            events,
            shared,
            calls,
            session_id: 0,
            passwd: vec![0; 16],
            last_zxid: 0,
            timeout: requested,
        }
    }

    fn connect_timeout(&self) -> Duration {
        (self.requested / self.endpoints.len().max(1) as u32).max(Duration::from_millis(100))
    }

    pub async fn run(mut self) {
        let mut next = 0usize;
        let mut failures = 0usize;

        loop {
            let endpoint = self.endpoints[next % self.endpoints.len()].clone();
            next += 1;

            // Back off once every endpoint has failed in a row
            let delay = if failures > 0 && failures % self.endpoints.len() == 0 {
                Duration::from_millis(rand::rng().random_range(50..=500))
            } else {
                Duration::ZERO
            };

            let request = ConnectRequest {
                last_zxid_seen: self.last_zxid,
                timeout_ms: i32::try_from(self.requested.as_millis()).unwrap_or(i32::MAX),
                session_id: self.session_id,
                passwd: self.passwd.clone(),
            };
            let attempt = handshake(endpoint.clone(), request, self.connect_timeout(), delay);
            tokio::pin!(attempt);

            // Requests issued while disconnected fail fast
            let result = loop {
                tokio::select! {
                    result = &mut attempt => break Some(result),
                    call = self.calls.recv() => match call {
                        Some(call) if matches!(call.request, Request::CloseSession) => {
                            let _ = call.reply.send(Ok(Bytes::new()));
                            break None;
                        }
                        Some(call) => {
                            let _ = call.reply.send(Err(KeeperError::ConnectionLoss));
                        }
                        None => break None,
                    }
                }
            };
            let Some(result) = result else {
                debug!(session_id = self.session_id, "Session abandoned while disconnected");
                return;
            };

            match result {
                Ok((_, response)) if response.is_expired() => {
                    warn!(
                        endpoint = %endpoint,
                        session_id = format!("0x{:x}", self.session_id),
                        "Ensemble reports session expired"
                    );
                    self.expire();
                    return;
                }
                Ok((stream, response)) => {
                    failures = 0;
                    let resumed = self.session_id != 0;
                    self.session_id = response.session_id;
                    self.passwd = response.passwd;
                    self.timeout = Duration::from_millis(response.timeout_ms.max(1) as u64);

                    self.shared
                        .session_id
                        .store(self.session_id, Ordering::Release);
                    self.shared
                        .timeout_ms
                        .store(self.timeout.as_millis() as u64, Ordering::Release);
                    self.shared.connected.store(true, Ordering::Release);

                    info!(
                        endpoint = %endpoint,
                        session_id = format!("0x{:x}", self.session_id),
                        timeout_ms = self.timeout.as_millis() as u64,
                        resumed,
                        "Connected to ensemble"
                    );
                    let state = if response.read_only {
                        KeeperState::ConnectedReadOnly
                    } else {
                        KeeperState::SyncConnected
                    };
                    let _ = self.events.send(WatchedEvent::session(state));

                    let served = self.serve(stream).await;
                    self.shared.connected.store(false, Ordering::Release);
                    match served {
                        Served::Closed => return,
                        Served::Expired => {
                            self.expire();
                            return;
                        }
                        Served::Lost(e) => {
                            warn!(endpoint = %endpoint, error = %e, "Connection lost, reconnecting");
                            let _ = self
                                .events
                                .send(WatchedEvent::session(KeeperState::Disconnected));
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    debug!(endpoint = %endpoint, error = %e, failures, "Connect attempt failed");
                }
            }
        }
    }

    fn expire(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.expired.store(true, Ordering::Release);
        let _ = self
            .events
            .send(WatchedEvent::session(KeeperState::Expired));

        self.calls.close();
        while let Ok(call) = self.calls.try_recv() {
            let _ = call.reply.send(Err(KeeperError::SessionExpired));
        }
    }

    async fn serve(&mut self, stream: TcpStream) -> Served {
        let (read_half, mut write_half) = stream.into_split();
        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(read_half, frames_tx));

        let mut pending: HashMap<i32, Call> = HashMap::new();
        let mut xid: i32 = 0;
        let ping_every = (self.timeout / 3).max(Duration::from_millis(1));
        let read_timeout = self.timeout * 2 / 3;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        let mut last_heard = Instant::now();

        let served = loop {
            tokio::select! {
                call = self.calls.recv() => {
                    let Some(call) = call else {
                        // Every client handle is gone
                        let packet = Request::CloseSession.encode(next_xid(&mut xid));
                        let _ = write_half.write_all(&packet).await;
                        break Served::Closed;
                    };
                    let id = next_xid(&mut xid);
                    let packet = call.request.encode(id);
                    if let Err(e) = write_half.write_all(&packet).await {
                        let _ = call.reply.send(Err(KeeperError::ConnectionLoss));
                        break Served::Lost(e.into());
                    }
                    pending.insert(id, call);
                }
                frame = frames.recv() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break Served::Lost(e),
                        None => break Served::Lost(KeeperError::ConnectionLoss),
                    };
                    last_heard = Instant::now();

                    let reply = match Reply::decode(frame) {
                        Ok(reply) => reply,
                        Err(e) => break Served::Lost(e),
                    };
                    if reply.header.zxid > 0 {
                        self.last_zxid = reply.header.zxid;
                    }

                    match reply.header.xid {
                        NOTIFICATION_XID => match decode_watcher_event(reply.body) {
                            Ok(event) => {
                                let _ = self.events.send(event);
                            }
                            Err(e) => warn!(error = %e, "Dropping malformed notification"),
                        },
                        PING_XID => trace!("Ping reply"),
                        id => match pending.remove(&id) {
                            Some(call) => {
                                let closing = matches!(call.request, Request::CloseSession);
                                let result = if reply.header.err == 0 {
                                    Ok(reply.body)
                                } else {
                                    Err(KeeperError::from_code(reply.header.err, call.request.path()))
                                };
                                let expired = matches!(result, Err(KeeperError::SessionExpired));
                                let _ = call.reply.send(result);
                                if closing {
                                    break Served::Closed;
                                }
                                if expired {
                                    break Served::Expired;
                                }
                            }
                            None => warn!(xid = id, "Reply to unknown request"),
                        },
                    }
                }
                _ = ping.tick() => {
                    if last_heard.elapsed() > read_timeout {
                        break Served::Lost(KeeperError::OperationTimeout);
                    }
                    let packet = Request::Ping.encode(PING_XID);
                    if let Err(e) = write_half.write_all(&packet).await {
                        break Served::Lost(e.into());
                    }
                }
            }
        };

        reader.abort();
        let failure = match served {
            Served::Expired => KeeperError::SessionExpired,
            _ => KeeperError::ConnectionLoss,
        };
        for (_, call) in pending.drain() {
            let _ = call.reply.send(Err(failure.clone()));
        }
        served
    }
}

fn next_xid(xid: &mut i32) -> i32 {
    *xid = xid.wrapping_add(1);
    if *xid <= 0 {
        *xid = 1;
    }
    *xid
}

/// Read one length-prefixed frame.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> KeeperResult<Bytes> {
    let len = reader.read_i32().await?;
    if len < 0 || len as usize > MAX_FRAME_LEN {
        return Err(KeeperError::Io(format!("invalid frame length {}", len)));
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn read_frames(mut reader: OwnedReadHalf, frames: mpsc::UnboundedSender<KeeperResult<Bytes>>) {
    loop {
        let frame = read_frame(&mut reader).await;
        let failed = frame.is_err();
        if frames.send(frame).is_err() || failed {
            break;
        }
    }
}

async fn handshake(
    endpoint: Endpoint,
    request: ConnectRequest,
    timeout: Duration,
    delay: Duration,
) -> KeeperResult<(TcpStream, ConnectResponse)> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let attempt = async {
        let mut stream = TcpStream::connect(endpoint.address()).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&request.encode()).await?;
        let body = read_frame(&mut stream).await?;
        let response = ConnectResponse::decode(body)?;
        Ok::<_, KeeperError>((stream, response))
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| KeeperError::OperationTimeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_xid_skips_reserved() {
        let mut xid = 0;
        assert_eq!(next_xid(&mut xid), 1);
        assert_eq!(next_xid(&mut xid), 2);

        let mut xid = i32::MAX;
        assert_eq!(next_xid(&mut xid), 1);
    }

    #[tokio::test]
    async fn test_read_frame() {
        let mut input: &[u8] = &[0, 0, 0, 2, 7, 8, 0, 0, 0];
        assert_eq!(read_frame(&mut input).await.unwrap(), Bytes::from_static(&[7, 8]));
        assert!(read_frame(&mut input).await.is_err());

        let mut negative: &[u8] = &[0xff, 0xff, 0xff, 0xfe];
        assert!(matches!(
            read_frame(&mut negative).await,
            Err(KeeperError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = handshake(
            Endpoint::new("127.0.0.1", port),
            ConnectRequest {
                last_zxid_seen: 0,
                timeout_ms: 1000,
                session_id: 0,
                passwd: vec![0; 16],
            },
            Duration::from_millis(500),
            Duration::ZERO,
        )
        .await;
        assert!(result.is_err());
    }
}
