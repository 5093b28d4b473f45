//! One TCP connection to one cluster node.
//!
//! A connection owns its socket, stream-id table, and read loop. Writes are
//! serialized through a single writer lock so frame boundaries stay
//! coherent; reads run on a dedicated task that resolves pending slots as
//! response frames arrive, in whatever order the server completes them.
//! `send` suspends its caller only until that request's own response, never
//! behind the round trips of other requests sharing the connection.
//!
//! Lifecycle: `Connecting → Ready → Draining → Closed`, with `Failed`
//! reachable from any state on I/O error. Every transition emits an
//! observer event.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::{Credentials, DriverConfig};
use crate::error::{DriverError, Result};
use crate::frame::{
    self, Compression, Frame, FrameCodec, Opcode, PROTOCOL_VERSION,
};
use crate::mux::{RequestMultiplexer, ResolveOutcome};
use crate::observer::{DriverEvent, DriverObserver};
use crate::topology::{NodeId, ServerEvent};

const STATE_CONNECTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_FAILED: u8 = 3;
const STATE_CLOSED: u8 = 4;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket and handshake in progress.
    Connecting,
    /// Accepting sends.
    Ready,
    /// Rejecting new sends, waiting for in-flight requests to resolve.
    Draining,
    /// Died on an I/O error or protocol fault.
    Failed,
    /// Closed after drain or explicit shutdown.
    Closed,
}

impl From<u8> for ConnectionState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_READY => ConnectionState::Ready,
            STATE_DRAINING => ConnectionState::Draining,
            STATE_FAILED => ConnectionState::Failed,
            STATE_CLOSED => ConnectionState::Closed,
            _ => ConnectionState::Connecting,
        }
    }
}

/// Out-of-band notice from a connection to its owning pool.
#[derive(Debug, Clone)]
pub enum ConnectionSignal {
    /// The connection transitioned to `Failed`.
    Failed {
        /// Node the connection belonged to.
        node: NodeId,
    },
}

/// Connection-level settings distilled from [`DriverConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Timeout covering the whole startup exchange.
    pub handshake_timeout: Duration,
    /// In-flight bound, capped by the protocol stream-id limit.
    pub max_inflight: usize,
    /// Negotiated body compression.
    pub compression: Compression,
    /// Frame body cap.
    pub max_frame_len: usize,
    /// Credentials for the authentication exchange, if any.
    pub credentials: Option<Credentials>,
    /// Register this connection for server topology/status events.
    pub register_for_events: bool,
    /// Poll interval while draining.
    pub drain_check_interval: Duration,
}

impl From<&DriverConfig> for ConnectionOptions {
    fn from(config: &DriverConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            max_inflight: config.max_inflight_per_connection,
            compression: config.compression,
            max_frame_len: config.max_frame_len,
            credentials: config.credentials.clone(),
            register_for_events: config.register_for_events,
            drain_check_interval: config.drain_check_interval,
        }
    }
}

/// A live connection to one node.
pub struct Connection {
    node: NodeId,
    addr: SocketAddr,
    state: AtomicU8,
    mux: RequestMultiplexer,
    writer: Mutex<OwnedWriteHalf>,
    codec: FrameCodec,
    observer: Arc<dyn DriverObserver>,
    signal: mpsc::UnboundedSender<ConnectionSignal>,
    drain_check_interval: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node)
            .field("addr", &self.addr)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a socket, runs the startup handshake, and spawns the read
    /// loop. The returned connection is `Ready`.
    pub async fn connect(
        node: NodeId,
        addr: SocketAddr,
        opts: ConnectionOptions,
        observer: Arc<dyn DriverObserver>,
        events: mpsc::UnboundedSender<ServerEvent>,
        signal: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(opts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DriverError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: opts.connect_timeout.as_millis() as u64,
            })?
            .map_err(DriverError::Io)?;
        stream.set_nodelay(true).map_err(DriverError::Io)?;

        let mut stream = stream;
        tokio::time::timeout(opts.handshake_timeout, handshake(&mut stream, &opts))
            .await
            .map_err(|_| DriverError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: opts.handshake_timeout.as_millis() as u64,
            })??;

        debug!(node = %node, %addr, "connection ready");

        let codec = FrameCodec::new(PROTOCOL_VERSION, opts.compression, opts.max_frame_len);
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Self {
            node,
            addr,
            state: AtomicU8::new(STATE_READY),
            mux: RequestMultiplexer::new(opts.max_inflight),
            writer: Mutex::new(write_half),
            codec,
            observer,
            signal,
            drain_check_interval: opts.drain_check_interval,
        });

        conn.observer.on_event(&DriverEvent::ConnectionOpened {
            node,
            addr: addr.to_string(),
        });
        tokio::spawn(read_loop(Arc::clone(&conn), read_half, events));
        Ok(conn)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    /// True when the connection accepts new sends.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Node this connection belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Peer address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.mux.in_flight()
    }

    /// Late responses discarded after cancellation.
    pub fn orphaned_responses(&self) -> u64 {
        self.mux.orphaned_responses()
    }

    /// Writes a request frame and registers its pending slot.
    ///
    /// Fails with `Backpressure` when all stream ids are leased and with
    /// `ConnectionLost` when the connection is not `Ready`. The returned
    /// handle resolves with this request's response only; concurrent
    /// requests on the same connection complete independently.
    pub async fn send(self: &Arc<Self>, opcode: Opcode, body: Bytes) -> Result<InflightRequest> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(DriverError::ConnectionLost {
                reason: format!("connection is {state:?}"),
            });
        }

        let (stream_id, rx) = self.mux.register().ok_or_else(|| DriverError::Backpressure {
            reason: format!("all {} stream ids in flight", self.mux.capacity()),
        })?;

        let frame = Frame::request(opcode, stream_id, body);
        let mut buf = BytesMut::new();
        if let Err(e) = self.codec.encode(&frame, &mut buf) {
            // Never hit the wire; the id goes straight back.
            let _ = self.mux.discard_unsent(stream_id);
            return Err(e);
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&buf).await {
                drop(writer);
                self.fail(&format!("write failed: {e}"));
                return Err(DriverError::ConnectionLost {
                    reason: format!("write failed: {e}"),
                });
            }
        }

        self.observer
            .on_event(&DriverEvent::RequestSubmitted { node: self.node });
        Ok(InflightRequest {
            conn: Arc::clone(self),
            stream_id,
            rx: Some(rx),
        })
    }

    /// Stops accepting sends, waits for in-flight requests to resolve (up
    /// to `timeout`), then closes. Requests still pending at the timeout
    /// are failed with `ConnectionLost`.
    pub async fn drain(&self, timeout: Duration) {
        let swapped = self.state.compare_exchange(
            STATE_READY,
            STATE_DRAINING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_err() {
            return;
        }
        debug!(node = %self.node, in_flight = self.mux.in_flight(), "draining connection");

        let started = Instant::now();
        while self.mux.in_flight() > 0 && started.elapsed() < timeout {
            if matches!(
                self.state(),
                ConnectionState::Failed | ConnectionState::Closed
            ) {
                return;
            }
            tokio::time::sleep(self.drain_check_interval).await;
        }

        let leftover = self.mux.fail_all("connection drained before response");
        if leftover > 0 {
            warn!(node = %self.node, leftover, "drain timeout with requests still pending");
        }
        self.close().await;
    }

    /// Closes the socket and marks the connection `Closed`.
    pub async fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED || prev == STATE_FAILED {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.observer
            .on_event(&DriverEvent::ConnectionClosed { node: self.node });
    }

    /// Marks the connection `Failed`, resolves every pending request with
    /// `ConnectionLost`, and notifies the pool. Idempotent.
    pub(crate) fn fail(&self, reason: &str) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur == STATE_FAILED || cur == STATE_CLOSED {
                return;
            }
            match self.state.compare_exchange(
                cur,
                STATE_FAILED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let failed = self.mux.fail_all(reason);
        warn!(node = %self.node, reason, failed, "connection failed");
        self.observer.on_event(&DriverEvent::ConnectionFailed {
            node: self.node,
            reason: reason.to_string(),
        });
        let _ = self.signal.send(ConnectionSignal::Failed { node: self.node });
    }
}

/// Handle for one written request. Resolves with the response frame, or
/// with `ConnectionLost` if the connection dies first. Dropping the handle
/// before resolution cancels the request: the pending slot is removed and
/// the eventual response is discarded as an expected orphan.
pub struct InflightRequest {
    conn: Arc<Connection>,
    stream_id: i16,
    rx: Option<oneshot::Receiver<Result<Frame>>>,
}

impl std::fmt::Debug for InflightRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightRequest")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl InflightRequest {
    /// The stream id this request occupies on its connection.
    pub fn stream_id(&self) -> i16 {
        self.stream_id
    }

    /// Waits for this request's resolution.
    pub async fn response(mut self) -> Result<Frame> {
        let outcome = match self.rx.as_mut() {
            Some(rx) => rx.await,
            None => {
                return Err(DriverError::InvariantViolation {
                    reason: "response polled twice".to_string(),
                })
            }
        };
        self.rx = None;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(DriverError::ConnectionLost {
                reason: "connection closed with request pending".to_string(),
            }),
        }
    }
}

impl Drop for InflightRequest {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.conn.mux.cancel(self.stream_id);
        }
    }
}

/// Runs the startup exchange on a fresh socket, before it is split.
///
/// OPTIONS is sent first; the SUPPORTED reply confirms the peer speaks the
/// protocol. STARTUP then carries the driver identity and the compression
/// choice. The server answers READY directly or demands authentication,
/// which is satisfied with a SASL PLAIN initial response built from the
/// configured credentials. Registration for server events follows when
/// enabled.
async fn handshake(stream: &mut TcpStream, opts: &ConnectionOptions) -> Result<()> {
    // Startup frames are never compressed; responses are decompressed per
    // their own flag, so one codec serves the whole exchange.
    let codec = FrameCodec::new(PROTOCOL_VERSION, Compression::None, opts.max_frame_len);
    let mut buf = BytesMut::with_capacity(4096);

    write_frame(stream, &codec, Opcode::Options, Bytes::new()).await?;
    let supported = read_frame(stream, &codec, &mut buf).await?;
    expect_opcode(&supported, Opcode::Supported)?;

    let mut startup = BytesMut::new();
    let mut options: Vec<(&str, &str)> = vec![
        ("CQL_VERSION", "4.0.0"),
        ("DRIVER_NAME", "ringline"),
        ("DRIVER_VERSION", env!("CARGO_PKG_VERSION")),
    ];
    if let Some(name) = opts.compression.wire_name() {
        options.push(("COMPRESSION", name));
    }
    frame::put_string_map(&mut startup, &options);
    write_frame(stream, &codec, Opcode::Startup, startup.freeze()).await?;

    let mut reply = read_frame(stream, &codec, &mut buf).await?;
    if reply.header.opcode == Opcode::Authenticate {
        let creds = opts.credentials.as_ref().ok_or_else(|| DriverError::Config {
            reason: "server requires authentication but no credentials configured".to_string(),
        })?;
        let token = plain_auth_token(creds);

        write_frame(stream, &codec, Opcode::AuthResponse, token.clone()).await?;
        reply = read_frame(stream, &codec, &mut buf).await?;
        if reply.header.opcode == Opcode::AuthChallenge {
            write_frame(stream, &codec, Opcode::AuthResponse, token).await?;
            reply = read_frame(stream, &codec, &mut buf).await?;
        }
        expect_opcode(&reply, Opcode::AuthSuccess)?;
    } else {
        expect_opcode(&reply, Opcode::Ready)?;
    }

    if opts.register_for_events {
        let mut body = BytesMut::new();
        body.put_u16(2);
        frame::put_string(&mut body, "TOPOLOGY_CHANGE");
        frame::put_string(&mut body, "STATUS_CHANGE");
        write_frame(stream, &codec, Opcode::Register, body.freeze()).await?;
        let ready = read_frame(stream, &codec, &mut buf).await?;
        expect_opcode(&ready, Opcode::Ready)?;
    }

    Ok(())
}

/// SASL PLAIN initial response wrapped in `[bytes]` notation.
fn plain_auth_token(creds: &Credentials) -> Bytes {
    let token_len = creds.username.len() + creds.password.len() + 2;
    let mut body = BytesMut::with_capacity(4 + token_len);
    body.put_i32(token_len as i32);
    body.put_u8(0);
    body.put_slice(creds.username.as_bytes());
    body.put_u8(0);
    body.put_slice(creds.password.as_bytes());
    body.freeze()
}

fn expect_opcode(frame: &Frame, expected: Opcode) -> Result<()> {
    if frame.header.opcode == expected {
        return Ok(());
    }
    if frame.header.opcode == Opcode::Error {
        let (code, message) = frame::parse_error_body(&frame.body)?;
        return Err(DriverError::from_server_error(code, message));
    }
    Err(DriverError::ProtocolViolation {
        reason: format!(
            "expected {:?} during handshake, got {:?}",
            expected, frame.header.opcode
        ),
    })
}

async fn write_frame(
    stream: &mut TcpStream,
    codec: &FrameCodec,
    opcode: Opcode,
    body: Bytes,
) -> Result<()> {
    let frame = Frame::request(opcode, 0, body);
    let mut buf = BytesMut::new();
    codec.encode(&frame, &mut buf)?;
    stream.write_all(&buf).await.map_err(DriverError::Io)
}

async fn read_frame(
    stream: &mut TcpStream,
    codec: &FrameCodec,
    buf: &mut BytesMut,
) -> Result<Frame> {
    loop {
        if let Some(frame) = codec.decode(buf)? {
            return Ok(frame);
        }
        let n = stream.read_buf(buf).await.map_err(DriverError::Io)?;
        if n == 0 {
            return Err(DriverError::ConnectionLost {
                reason: "peer closed during handshake".to_string(),
            });
        }
    }
}

/// Dedicated per-connection reader: decodes frames as bytes arrive and
/// resolves the matching pending slots. Server events ride negative stream
/// ids and are forwarded to the topology-hint channel. An unmatched
/// non-negative stream id means the peer broke correlation; the connection
/// is failed rather than resynced.
async fn read_loop(
    conn: Arc<Connection>,
    mut read: OwnedReadHalf,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match conn.codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    if frame.header.stream < 0 {
                        if frame.header.opcode == Opcode::Event {
                            match ServerEvent::parse(&frame.body) {
                                Ok(event) => {
                                    let _ = events.send(event);
                                }
                                Err(e) => {
                                    debug!(node = %conn.node, error = %e, "ignoring unparseable server event");
                                }
                            }
                        }
                        continue;
                    }
                    match conn.mux.resolve(frame.header.stream, Ok(frame)) {
                        Ok(ResolveOutcome::Completed) => {}
                        Ok(ResolveOutcome::ExpectedOrphan) => {
                            debug!(node = %conn.node, "discarded response for cancelled request");
                        }
                        Err(e) => {
                            conn.fail(&e.to_string());
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    conn.fail(&e.to_string());
                    return;
                }
            }
        }

        match read.read_buf(&mut buf).await {
            Ok(0) => {
                if conn.state() != ConnectionState::Closed {
                    conn.fail("peer closed connection");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if conn.state() != ConnectionState::Closed {
                    conn.fail(&format!("read error: {e}"));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::RecordingObserver;
    use crate::observer::NoopObserver;
    use crate::testserver::{MockBehavior, MockNode};

    fn options() -> ConnectionOptions {
        ConnectionOptions::from(&DriverConfig::default())
    }

    async fn connect(
        node: &MockNode,
        opts: ConnectionOptions,
    ) -> (
        Arc<Connection>,
        mpsc::UnboundedReceiver<ServerEvent>,
        mpsc::UnboundedReceiver<ConnectionSignal>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(
            NodeId::new(1),
            node.addr(),
            opts,
            Arc::new(NoopObserver),
            events_tx,
            signal_tx,
        )
        .await
        .unwrap();
        (conn, events_rx, signal_rx)
    }

    #[tokio::test]
    async fn test_handshake_and_echo_query() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (conn, _events, _signals) = connect(&server, options()).await;
        assert!(conn.is_ready());

        let pending = conn
            .send(Opcode::Query, Bytes::from_static(b"select 1"))
            .await
            .unwrap();
        let frame = pending.response().await.unwrap();
        assert_eq!(frame.header.opcode, Opcode::Result);
        assert_eq!(frame.body, Bytes::from_static(b"select 1"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (conn, _events, _signals) = connect(&server, options()).await;

        // The slow request is issued first but must not block the fast one.
        let slow = conn
            .send(Opcode::Query, Bytes::from_static(b"slow:select 1"))
            .await
            .unwrap();
        let fast = conn
            .send(Opcode::Query, Bytes::from_static(b"select 2"))
            .await
            .unwrap();

        let started = Instant::now();
        let fast_frame = fast.response().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "fast request must not wait behind the slow one"
        );
        assert_eq!(fast_frame.body, Bytes::from_static(b"select 2"));

        let slow_frame = slow.response().await.unwrap();
        assert_eq!(slow_frame.body, Bytes::from_static(b"slow:select 1"));
    }

    #[tokio::test]
    async fn test_stream_id_exhaustion_is_backpressure() {
        let server = MockNode::start(MockBehavior {
            silent: true,
            ..Default::default()
        })
        .await;
        let mut opts = options();
        opts.max_inflight = 2;
        let (conn, _events, _signals) = connect(&server, opts).await;

        let _a = conn.send(Opcode::Query, Bytes::from_static(b"q")).await.unwrap();
        let _b = conn.send(Opcode::Query, Bytes::from_static(b"q")).await.unwrap();
        let err = conn.send(Opcode::Query, Bytes::from_static(b"q")).await.unwrap_err();
        assert!(matches!(err, DriverError::Backpressure { .. }));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_with_connection_lost() {
        let server = MockNode::start(MockBehavior {
            silent: true,
            ..Default::default()
        })
        .await;
        let (conn, _events, mut signals) = connect(&server, options()).await;

        let a = conn.send(Opcode::Query, Bytes::from_static(b"q1")).await.unwrap();
        let b = conn.send(Opcode::Query, Bytes::from_static(b"q2")).await.unwrap();
        assert_eq!(conn.in_flight(), 2);

        server.kill_connections();

        let ra = a.response().await;
        let rb = b.response().await;
        assert!(matches!(ra, Err(DriverError::ConnectionLost { .. })));
        assert!(matches!(rb, Err(DriverError::ConnectionLost { .. })));
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(matches!(
            signals.recv().await,
            Some(ConnectionSignal::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_slot_and_discards_late_response() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (conn, _events, _signals) = connect(&server, options()).await;

        let pending = conn
            .send(Opcode::Query, Bytes::from_static(b"slow:q"))
            .await
            .unwrap();
        assert_eq!(conn.in_flight(), 1);
        drop(pending);
        assert_eq!(conn.in_flight(), 0);

        // The late response must be swallowed without failing the
        // connection.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(conn.is_ready());
        assert_eq!(conn.orphaned_responses(), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_inflight_then_closes() {
        let server = MockNode::start(MockBehavior::default()).await;
        let observer = Arc::new(RecordingObserver::default());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(
            NodeId::new(1),
            server.addr(),
            options(),
            Arc::clone(&observer) as Arc<dyn DriverObserver>,
            events_tx,
            signal_tx,
        )
        .await
        .unwrap();

        let pending = conn
            .send(Opcode::Query, Bytes::from_static(b"slow:q"))
            .await
            .unwrap();

        let drainer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.drain(Duration::from_secs(2)).await })
        };

        // Draining connections refuse new work.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.state(), ConnectionState::Draining);
        let err = conn.send(Opcode::Query, Bytes::from_static(b"q")).await.unwrap_err();
        assert!(matches!(err, DriverError::ConnectionLost { .. }));

        // The in-flight request still resolves normally.
        let frame = pending.response().await.unwrap();
        assert_eq!(frame.header.opcode, Opcode::Result);

        drainer.await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            observer.count(|e| matches!(e, DriverEvent::ConnectionClosed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_authentication_flow() {
        let server = MockNode::start(MockBehavior {
            require_auth: true,
            ..Default::default()
        })
        .await;
        let mut opts = options();
        opts.credentials = Some(Credentials {
            username: "app".to_string(),
            password: "secret".to_string(),
        });
        let (conn, _events, _signals) = connect(&server, opts).await;
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn test_auth_required_without_credentials() {
        let server = MockNode::start(MockBehavior {
            require_auth: true,
            ..Default::default()
        })
        .await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        let err = Connection::connect(
            NodeId::new(1),
            server.addr(),
            options(),
            Arc::new(NoopObserver),
            events_tx,
            signal_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DriverError::Config { .. }));
    }

    #[tokio::test]
    async fn test_bad_credentials_rejected() {
        let server = MockNode::start(MockBehavior {
            require_auth: true,
            reject_auth: true,
            ..Default::default()
        })
        .await;
        let mut opts = options();
        opts.credentials = Some(Credentials {
            username: "app".to_string(),
            password: "wrong".to_string(),
        });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        let err = Connection::connect(
            NodeId::new(1),
            server.addr(),
            opts,
            Arc::new(NoopObserver),
            events_tx,
            signal_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DriverError::UnrecoverableServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_server_event_forwarded_to_hint_channel() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (conn, mut events, _signals) = connect(&server, options()).await;

        server.push_status_change(false, "10.0.0.9:9042".parse().unwrap());

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ServerEvent::StatusChange { up, addr } => {
                assert!(!up);
                assert_eq!(addr, "10.0.0.9:9042".parse().unwrap());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let server = MockNode::start(MockBehavior::default()).await;
        let mut opts = options();
        opts.compression = Compression::Lz4;
        let (conn, _events, _signals) = connect(&server, opts).await;

        let body: Vec<u8> = std::iter::repeat(b"row-data-".iter().copied())
            .take(200)
            .flatten()
            .collect();
        let pending = conn
            .send(Opcode::Query, Bytes::from(body.clone()))
            .await
            .unwrap();
        let frame = pending.response().await.unwrap();
        assert_eq!(frame.body, Bytes::from(body));
    }
}
