//! # Connection Multiplexer
//!
//! One TCP listener carries two protocols: gRPC (HTTP/2 with an
//! `application/grpc` content type) for the coordination RPC server, and
//! everything else for the HTTP server. The multiplexer accepts each
//! connection, optionally terminates TLS, peeks at the opening bytes and
//! hands the connection to one of two [`MuxListener`]s.
//!
//! ## Classification
//!
//! | Opening bytes | Result |
//! |---------------|--------|
//! | not a prefix of the HTTP/2 client preface | HTTP |
//! | preface, then a HEADERS block with `content-type: application/grpc*` | RPC |
//! | preface, then a HEADERS block with any other content type | HTTP |
//! | preface, then nothing further within [`PREFACE_SETTLE_TIMEOUT`] | RPC |
//! | EOF, [`SNIFF_TIMEOUT`] or [`MAX_SNIFF_BYTES`] before a decision | HTTP |
//!
//! Bytes read while sniffing are buffered and replayed by [`MuxStream`], so
//! the chosen server sees the connection from its first byte.
//!
//! ## Lifetime
//!
//! [`ConnectionMultiplexer::run`] is the accept loop. It returns `Ok(())`
//! when its cancellation token fires and `Err` on a non-transient accept
//! failure; either way the supervising group treats its exit as the end of the
//! server. Per-connection work (TLS handshake and sniffing) runs in its own
//! task so a slow client never stalls the accept loop.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tracing::{debug, error, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// HTTP/2 client connection preface (RFC 9113 §3.4).
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Time allowed for a TLS handshake to complete.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the opening bytes to reach a decision.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// After a complete HTTP/2 preface, how long to wait for the first HEADERS
/// block. Some gRPC clients send nothing until they see server SETTINGS.
pub const PREFACE_SETTLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on bytes buffered while sniffing.
pub const MAX_SNIFF_BYTES: usize = 64 * 1024;

/// Pending connections per sub-listener before the accept side waits.
const SUBLISTENER_BACKLOG: usize = 128;

/// Consecutive non-transient accept failures tolerated before the loop gives up.
const MAX_ACCEPT_FAILURES: u32 = 10;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

const FRAME_HEADER_LEN: usize = 9;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

// ============================================================================
// Classification
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Rpc,
    Http,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Sniff {
    NeedMore,
    Decided(Protocol),
}

/// Classify a connection from the bytes read so far.
pub(crate) fn classify(buf: &[u8]) -> Sniff {
    if buf.len() < HTTP2_PREFACE.len() {
        return if HTTP2_PREFACE.starts_with(buf) {
            Sniff::NeedMore
        } else {
            Sniff::Decided(Protocol::Http)
        };
    }
    if &buf[..HTTP2_PREFACE.len()] != HTTP2_PREFACE {
        return Sniff::Decided(Protocol::Http);
    }

    let mut offset = HTTP2_PREFACE.len();
    let mut block: Option<Vec<u8>> = None;

    loop {
        let Some(header) = buf.get(offset..offset + FRAME_HEADER_LEN) else {
            return Sniff::NeedMore;
        };
        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let frame_type = header[3];
        let flags = header[4];
        let start = offset + FRAME_HEADER_LEN;
        let Some(payload) = buf.get(start..start + length) else {
            return Sniff::NeedMore;
        };
        offset = start + length;

        match frame_type {
            FRAME_HEADERS if block.is_none() => {
                let Some(fragment) = headers_fragment(payload, flags) else {
                    return Sniff::Decided(Protocol::Http);
                };
                block = Some(fragment.to_vec());
            }
            FRAME_CONTINUATION if block.is_some() => {
                if let Some(collected) = block.as_mut() {
                    collected.extend_from_slice(payload);
                }
            }
            // Only CONTINUATION may follow an unfinished header block.
            _ if block.is_some() => return Sniff::Decided(Protocol::Http),
            _ => continue,
        }

        if flags & FLAG_END_HEADERS != 0 {
            let block = block.unwrap_or_default();
            return Sniff::Decided(classify_header_block(&block));
        }
    }
}

/// Strip padding and priority fields from a HEADERS payload.
fn headers_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut start = 0;
    let mut end = payload.len();
    if flags & FLAG_PADDED != 0 {
        let pad = *payload.first()? as usize;
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }
    payload.get(start..end)
}

fn classify_header_block(block: &[u8]) -> Protocol {
    let Ok(headers) = hpack::Decoder::new().decode(block) else {
        return Protocol::Http;
    };
    let is_grpc = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case(b"content-type") && value.starts_with(b"application/grpc")
    });
    if is_grpc { Protocol::Rpc } else { Protocol::Http }
}

// ============================================================================
// Streams
// ============================================================================

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Peer information exposed to tonic request extensions.
#[derive(Clone, Copy, Debug)]
pub struct MuxConnectInfo {
    pub remote_addr: SocketAddr,
    pub tls: bool,
}

/// An accepted, classified connection. Replays the sniffed bytes first.
pub struct MuxStream {
    prefix: Vec<u8>,
    consumed: usize,
    inner: Transport,
    remote_addr: SocketAddr,
}

impl MuxStream {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner, Transport::Tls(_))
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("remote_addr", &self.remote_addr)
            .field("tls", &self.is_tls())
            .field("buffered", &(self.prefix.len() - self.consumed))
            .finish()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.consumed < this.prefix.len() {
            let remaining = &this.prefix[this.consumed..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.consumed += n;
            if this.consumed == this.prefix.len() {
                this.prefix = Vec::new();
                this.consumed = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connected for MuxStream {
    type ConnectInfo = MuxConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        MuxConnectInfo {
            remote_addr: self.remote_addr,
            tls: self.is_tls(),
        }
    }
}

// ============================================================================
// Sub-Listeners
// ============================================================================

/// One side of the multiplexer. Serves axum directly and tonic via [`MuxListener::into_incoming`].
pub struct MuxListener {
    protocol: Protocol,
    rx: mpsc::Receiver<MuxStream>,
    local_addr: SocketAddr,
}

impl MuxListener {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Connection stream in the shape tonic's `serve_with_incoming*` expects.
    pub fn into_incoming(self) -> impl Stream<Item = Result<MuxStream, io::Error>> {
        ReceiverStream::new(self.rx).map(Ok::<_, io::Error>)
    }
}

impl std::fmt::Debug for MuxListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxListener")
            .field("protocol", &self.protocol)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl axum::serve::Listener for MuxListener {
    type Io = MuxStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(stream) => {
                let addr = stream.remote_addr();
                (stream, addr)
            }
            // The accept loop is gone; the supervising group is already resolving.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

pub struct ConnectionMultiplexer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    rpc_tx: mpsc::Sender<MuxStream>,
    http_tx: mpsc::Sender<MuxStream>,
    local_addr: SocketAddr,
}

impl ConnectionMultiplexer {
    /// Wrap a bound listener. Returns the multiplexer plus its RPC and HTTP sub-listeners.
    pub fn new(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> io::Result<(Self, MuxListener, MuxListener)> {
        let local_addr = listener.local_addr()?;
        let (rpc_tx, rpc_rx) = mpsc::channel(SUBLISTENER_BACKLOG);
        let (http_tx, http_rx) = mpsc::channel(SUBLISTENER_BACKLOG);

        let mux = Self {
            listener,
            acceptor,
            rpc_tx,
            http_tx,
            local_addr,
        };
        let rpc = MuxListener {
            protocol: Protocol::Rpc,
            rx: rpc_rx,
            local_addr,
        };
        let http = MuxListener {
            protocol: Protocol::Http,
            rx: http_rx,
            local_addr,
        };
        Ok((mux, rpc, http))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `token` is cancelled or the listener fails.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => {
                    debug!(addr = %self.local_addr, "multiplexer stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, remote_addr)) => {
                    failures = 0;
                    let _ = tcp.set_nodelay(true);
                    let acceptor = self.acceptor.clone();
                    let rpc_tx = self.rpc_tx.clone();
                    let http_tx = self.http_tx.clone();
                    let conn_token = token.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = conn_token.cancelled() => {}
                            _ = route_connection(tcp, remote_addr, acceptor, rpc_tx, http_tx) => {}
                        }
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    trace!(error = %e, "connection dropped before accept completed");
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_ACCEPT_FAILURES {
                        error!(error = %e, failures, "accept loop giving up");
                        bail!("accept failed {failures} times in a row: {e}");
                    }
                    warn!(error = %e, failures, "accept failed, retrying");
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMultiplexer")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.acceptor.is_some())
            .finish()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

async fn route_connection(
    tcp: TcpStream,
    remote_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    rpc_tx: mpsc::Sender<MuxStream>,
    http_tx: mpsc::Sender<MuxStream>,
) {
    let mut transport = match acceptor {
        Some(acceptor) => match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
            Ok(Ok(tls)) => Transport::Tls(Box::new(tls)),
            Ok(Err(e)) => {
                debug!(peer = %remote_addr, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                debug!(peer = %remote_addr, timeout = ?TLS_HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                return;
            }
        },
        None => Transport::Plain(tcp),
    };

    let (protocol, prefix) = match sniff(&mut transport).await {
        Ok(decided) => decided,
        Err(e) => {
            debug!(peer = %remote_addr, error = %e, "connection failed while sniffing");
            return;
        }
    };
    trace!(peer = %remote_addr, ?protocol, buffered = prefix.len(), "connection classified");

    let stream = MuxStream {
        prefix,
        consumed: 0,
        inner: transport,
        remote_addr,
    };
    let tx = match protocol {
        Protocol::Rpc => rpc_tx,
        Protocol::Http => http_tx,
    };
    if tx.send(stream).await.is_err() {
        debug!(peer = %remote_addr, ?protocol, "sub-listener closed, dropping connection");
    }
}

async fn sniff<R: AsyncRead + Unpin>(io: &mut R) -> io::Result<(Protocol, Vec<u8>)> {
    let started = Instant::now();
    let mut preface_at: Option<Instant> = None;
    let mut buf = Vec::with_capacity(1024);

    loop {
        if let Sniff::Decided(protocol) = classify(&buf) {
            return Ok((protocol, buf));
        }
        if buf.len() >= MAX_SNIFF_BYTES {
            return Ok((Protocol::Http, buf));
        }
        if preface_at.is_none() && buf.len() >= HTTP2_PREFACE.len() {
            preface_at = Some(Instant::now());
        }
        let deadline = match preface_at {
            Some(at) => at + PREFACE_SETTLE_TIMEOUT,
            None => started + SNIFF_TIMEOUT,
        };

        match tokio::time::timeout_at(deadline, io.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Ok((Protocol::Http, buf)),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) if preface_at.is_some() => return Ok((Protocol::Rpc, buf)),
            Err(_) => return Ok((Protocol::Http, buf)),
        }
    }
}
