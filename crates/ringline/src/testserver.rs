//! In-process mock node speaking the native framing, for tests.
//!
//! Accepts connections on a loopback port, answers the startup exchange,
//! and echoes query bodies back as RESULT frames. Behavior switches let
//! tests inject auth demands, server errors, slow responses (bodies with a
//! `slow:` prefix), total silence, connection kills, and pushed events.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use crate::frame::{self, Frame, FrameCodec, Opcode, EVENT_STREAM_ID};

#[derive(Debug, Clone)]
pub(crate) struct MockBehavior {
    /// Demand authentication after STARTUP.
    pub require_auth: bool,
    /// Reject any AUTH_RESPONSE with a bad-credentials error.
    pub reject_auth: bool,
    /// Answer queries with this error code instead of RESULT.
    pub error_code: Option<i32>,
    /// Never answer queries (handshake still completes).
    pub silent: bool,
    /// Delay applied to queries whose body starts with `slow:`.
    pub slow_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            require_auth: false,
            reject_auth: false,
            error_code: None,
            silent: false,
            slow_delay: Duration::from_millis(80),
        }
    }
}

#[derive(Clone)]
enum Control {
    Kill,
    Event(Bytes),
}

pub(crate) struct MockNode {
    addr: SocketAddr,
    control: broadcast::Sender<Control>,
    accepted: Arc<AtomicUsize>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockNode {
    pub(crate) async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control, _) = broadcast::channel(16);
        let accepted = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn({
            let control = control.clone();
            let accepted = Arc::clone(&accepted);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, behavior.clone(), control.subscribe()));
                }
            }
        });

        Self {
            addr,
            control,
            accepted,
            accept_task,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drops every active connection.
    pub(crate) fn kill_connections(&self) {
        let _ = self.control.send(Control::Kill);
    }

    /// Pushes a STATUS_CHANGE event to every active connection.
    pub(crate) fn push_status_change(&self, up: bool, subject: SocketAddr) {
        let mut body = BytesMut::new();
        frame::put_string(&mut body, "STATUS_CHANGE");
        frame::put_string(&mut body, if up { "UP" } else { "DOWN" });
        match subject.ip() {
            std::net::IpAddr::V4(v4) => {
                body.put_u8(4);
                body.put_slice(&v4.octets());
            }
            std::net::IpAddr::V6(v6) => {
                body.put_u8(16);
                body.put_slice(&v6.octets());
            }
        }
        body.put_i32(subject.port() as i32);
        let _ = self.control.send(Control::Event(body.freeze()));
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    behavior: MockBehavior,
    mut control: broadcast::Receiver<Control>,
) {
    let codec = FrameCodec::default();
    let (mut read, write) = stream.into_split();
    let write = Arc::new(Mutex::new(write));
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(request)) => handle(request, &behavior, &write).await,
                Ok(None) => break,
                Err(_) => return,
            }
        }

        tokio::select! {
            n = read.read_buf(&mut buf) => match n {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            c = control.recv() => match c {
                Ok(Control::Kill) => {
                    let _ = write.lock().await.shutdown().await;
                    return;
                }
                Ok(Control::Event(body)) => {
                    respond(&write, Opcode::Event, EVENT_STREAM_ID, body).await;
                }
                Err(_) => {}
            },
        }
    }
}

async fn handle(request: Frame, behavior: &MockBehavior, write: &Arc<Mutex<OwnedWriteHalf>>) {
    let stream = request.header.stream;
    match request.header.opcode {
        Opcode::Options => respond(write, Opcode::Supported, stream, Bytes::new()).await,
        Opcode::Startup => {
            if behavior.require_auth {
                let mut body = BytesMut::new();
                frame::put_string(&mut body, "PasswordAuthenticator");
                respond(write, Opcode::Authenticate, stream, body.freeze()).await;
            } else {
                respond(write, Opcode::Ready, stream, Bytes::new()).await;
            }
        }
        Opcode::AuthResponse => {
            if behavior.reject_auth {
                respond(write, Opcode::Error, stream, error_body(0x0100, "bad credentials")).await;
            } else {
                respond(write, Opcode::AuthSuccess, stream, Bytes::new()).await;
            }
        }
        Opcode::Register => respond(write, Opcode::Ready, stream, Bytes::new()).await,
        Opcode::Query | Opcode::Execute | Opcode::Batch | Opcode::Prepare => {
            if behavior.silent {
                return;
            }
            let reply = match behavior.error_code {
                Some(code) => (Opcode::Error, error_body(code, "injected error")),
                None => (Opcode::Result, request.body.clone()),
            };
            if request.body.starts_with(b"slow:") {
                let write = Arc::clone(write);
                let delay = behavior.slow_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    respond(&write, reply.0, stream, reply.1).await;
                });
            } else {
                respond(write, reply.0, stream, reply.1).await;
            }
        }
        _ => {}
    }
}

fn error_body(code: i32, message: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(code);
    frame::put_string(&mut body, message);
    body.freeze()
}

async fn respond(write: &Arc<Mutex<OwnedWriteHalf>>, opcode: Opcode, stream: i16, body: Bytes) {
    let frame = Frame::response(opcode, stream, body);
    let mut buf = BytesMut::new();
    if FrameCodec::default().encode(&frame, &mut buf).is_ok() {
        let _ = write.lock().await.write_all(&buf).await;
    }
}
