//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use forward_proxy::forward::ForwardError;
use forward_proxy::http::sink::ResponseSink;
use forward_proxy::http::transport::{BoxError, ResponseBody, Transport};
use forward_proxy::net::dial::{BoxConnection, Dialer, PendingRequest, RequestDialer};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper::body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

/// What a mock peer does once its request arrived.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write these bytes, then wait for the other side to close.
    Close(Vec<u8>),
    /// Write these bytes, then echo everything received.
    Upgrade(Vec<u8>),
}

impl Reply {
    pub fn close(raw: &str) -> Self {
        Reply::Close(raw.as_bytes().to_vec())
    }

    pub fn upgrade(raw: &str) -> Self {
        Reply::Upgrade(raw.as_bytes().to_vec())
    }
}

/// A 302 pointing at `location`.
pub fn found(location: &str) -> Reply {
    Reply::close(&format!(
        "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n"
    ))
}

pub const SWITCHING: &str =
    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

/// What one mock peer saw.
#[derive(Debug, Default)]
pub struct PeerLog {
    /// Request head bytes (raw dialers only).
    pub received: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl PeerLog {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> String {
        String::from_utf8_lossy(&self.received.lock().unwrap()).into_owned()
    }
}

async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    head
}

/// Run a peer on `stream` according to `reply`, recording into `log`.
fn spawn_peer(mut stream: DuplexStream, read_request: bool, reply: Reply, log: Arc<PeerLog>) {
    tokio::spawn(async move {
        if read_request {
            let head = read_head(&mut stream).await;
            log.received.lock().unwrap().extend_from_slice(&head);
        }
        let (raw, echo) = match reply {
            Reply::Close(raw) => (raw, false),
            Reply::Upgrade(raw) => (raw, true),
        };
        let _ = stream.write_all(&raw).await;

        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) if echo => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
            }
        }
        log.closed.store(true, Ordering::SeqCst);
    });
}

/// [`RequestDialer`] answering each dial with the next scripted reply.
#[derive(Default)]
pub struct ScriptedRequestDialer {
    script: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<PendingRequest>>,
    pub peers: Mutex<Vec<Arc<PeerLog>>>,
}

impl ScriptedRequestDialer {
    pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<PendingRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn peers(&self) -> Vec<Arc<PeerLog>> {
        self.peers.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestDialer for ScriptedRequestDialer {
    async fn dial(&self, request: &PendingRequest) -> io::Result<BoxConnection> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "script exhausted"))?;

        let (proxy_side, peer_side) = tokio::io::duplex(64 * 1024);
        let log = Arc::new(PeerLog::default());
        self.peers.lock().unwrap().push(Arc::clone(&log));
        spawn_peer(peer_side, false, reply, log);
        Ok(Box::new(proxy_side))
    }
}

/// Raw [`Dialer`] whose peers read a request head, then follow a reply.
pub struct ScriptedDialer {
    reply: Option<Reply>,
    pub addresses: Mutex<Vec<String>>,
    pub peers: Mutex<Vec<Arc<PeerLog>>>,
}

impl ScriptedDialer {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            addresses: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// A dialer whose dials are refused.
    pub fn refusing() -> Self {
        Self {
            reply: None,
            addresses: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self, index: usize) -> Arc<PeerLog> {
        Arc::clone(&self.peers.lock().unwrap()[index])
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxConnection> {
        self.addresses.lock().unwrap().push(addr.to_string());
        let Some(reply) = self.reply.clone() else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        };
        let (proxy_side, peer_side) = tokio::io::duplex(64 * 1024);
        let log = Arc::new(PeerLog::default());
        self.peers.lock().unwrap().push(Arc::clone(&log));
        spawn_peer(peer_side, true, reply, log);
        Ok(Box::new(proxy_side))
    }
}

/// One thing a [`RecordingSink`] was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Head(StatusCode),
    Write(Vec<u8>),
    Flush,
}

/// In-memory [`ResponseSink`] recording every call.
#[derive(Default)]
pub struct RecordingSink {
    pub headers: HeaderMap,
    pub sent_headers: Option<HeaderMap>,
    pub events: Vec<SinkEvent>,
    client: Option<DuplexStream>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that can be hijacked; the returned stream is the client's end.
    pub fn hijackable() -> (Self, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let sink = Self {
            client: Some(server),
            ..Default::default()
        };
        (sink, client)
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.events.iter().find_map(|event| match event {
            SinkEvent::Head(status) => Some(*status),
            _ => None,
        })
    }

    pub fn body(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Write(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.events.iter().filter(|e| **e == SinkEvent::Flush).count()
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn head_written(&self) -> bool {
        self.sent_headers.is_some()
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        self.sent_headers = Some(self.headers.clone());
        self.events.push(SinkEvent::Head(status));
        Ok(())
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        self.events.push(SinkEvent::Write(data.to_vec()));
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.events.push(SinkEvent::Flush);
        Ok(())
    }

    fn hijack(&mut self) -> Result<BoxConnection, ForwardError> {
        self.client
            .take()
            .map(|stream| Box::new(stream) as BoxConnection)
            .ok_or(ForwardError::HijackUnsupported)
    }
}

/// How a [`MockTransport`] answers.
pub enum MockReply {
    Fixed {
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static [u8],
    },
    /// Body chunks separated by `delay`, optionally failing at the end.
    Streaming {
        chunks: Vec<&'static [u8]>,
        delay: Duration,
        fail: bool,
    },
    Error(io::ErrorKind),
}

/// A request as the transport received it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// [`Transport`] returning a canned response and recording requests.
pub struct MockTransport {
    reply: MockReply,
    pub requests: Mutex<Vec<SeenRequest>>,
}

impl MockTransport {
    pub fn new(reply: MockReply) -> Self {
        Self {
            reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> SeenRequest {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no request recorded")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<ResponseBody>, BoxError> {
        self.requests.lock().unwrap().push(SeenRequest {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            body: request.body().clone(),
        });
        match &self.reply {
            MockReply::Fixed { status, headers, body } => {
                let mut response = Response::new(
                    Full::new(Bytes::from_static(body))
                        .map_err(|never| match never {})
                        .boxed_unsync(),
                );
                *response.status_mut() = *status;
                for (name, value) in headers {
                    response
                        .headers_mut()
                        .append(*name, http::HeaderValue::from_static(value));
                }
                Ok(response)
            }
            MockReply::Streaming { chunks, delay, fail } => {
                let delay = *delay;
                let fail = *fail;
                let chunks: VecDeque<&'static [u8]> = chunks.iter().copied().collect();
                let stream = futures_util::stream::unfold((chunks, false), move |(mut chunks, done)| async move {
                    if done {
                        return None;
                    }
                    match chunks.pop_front() {
                        Some(chunk) => {
                            tokio::time::sleep(delay).await;
                            Some((Ok(Frame::data(Bytes::from_static(chunk))), (chunks, false)))
                        }
                        None if fail => Some((
                            Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream reset")),
                            (chunks, true),
                        )),
                        None => None,
                    }
                });
                Ok(Response::new(StreamBody::new(stream).boxed_unsync()))
            }
            MockReply::Error(kind) => Err(Box::new(io::Error::new(*kind, "transport failed"))),
        }
    }
}

/// Poll `check` until it holds or two seconds passed.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Start a TCP backend answering each request head with `respond(head)`.
/// The connection is closed after the response.
pub async fn start_backend<F>(respond: F) -> SocketAddr
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    start_body_backend(move |head, _| respond(head)).await
}

/// Like [`start_backend`], but `respond` also sees the request body.
pub async fn start_body_backend<F>(respond: F) -> SocketAddr
where
    F: Fn(&str, &[u8]) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let head = String::from_utf8_lossy(&head).into_owned();
                let mut body = vec![0u8; content_length(&head)];
                if !body.is_empty() {
                    let _ = socket.read_exact(&mut body).await;
                }
                let _ = socket.write_all(respond(&head, &body).as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// A `200 OK` response carrying `body`.
pub fn ok_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Start a TCP backend that accepts upgrades: it answers `101` followed by
/// `HELLO`, then echoes.
pub async fn start_upgrade_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_head(&mut socket).await;
                let _ = socket.write_all(format!("{SWITCHING}HELLO").as_bytes()).await;
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Read one `Content-Length` framed response off `stream`.
pub async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let head = String::from_utf8(read_head(stream).await).unwrap();
    let mut body = vec![0u8; content_length(&head)];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

/// Read from `stream` until `needle` was seen, returning everything read.
pub async fn read_until<S: tokio::io::AsyncRead + Unpin>(stream: &mut S, needle: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    while !out.windows(needle.len()).any(|w| w == needle) {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "closed before {:?}", String::from_utf8_lossy(needle));
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
