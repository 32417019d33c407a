// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! TLS-terminating loopback listener: accepts connections, completes the
//! handshake with the issued certificate, and serves HTTP/1.1 to an attached
//! request handler.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Sleep};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::port::BoxFuture;

pub type RequestHandler =
    Arc<dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> + Send + Sync>;
pub type PeerHandler = Arc<dyn Fn(SocketAddr) + Send + Sync>;
pub type TlsClientErrorHandler = Arc<dyn Fn(SocketAddr, &io::Error) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&io::Error) + Send + Sync>;

/// Named event handlers attached to a listener.
#[derive(Clone, Default)]
pub struct ListenerEvents {
    /// Called for every HTTP request on a secured connection.
    pub request: Option<RequestHandler>,
    /// Called when a TCP connection is accepted, before the handshake.
    pub connection: Option<PeerHandler>,
    /// Called when a TLS handshake completes.
    pub secure_connection: Option<PeerHandler>,
    /// Called when a TLS handshake fails.
    pub tls_client_error: Option<TlsClientErrorHandler>,
    /// Called when the listening socket fails.
    pub error: Option<ErrorHandler>,
}

impl ListenerEvents {
    pub fn on_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        self.request = Some(request_handler(handler));
        self
    }

    pub fn on_connection(mut self, handler: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        self.connection = Some(Arc::new(handler));
        self
    }

    pub fn on_secure_connection(
        mut self,
        handler: impl Fn(SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        self.secure_connection = Some(Arc::new(handler));
        self
    }

    pub fn on_tls_client_error(
        mut self,
        handler: impl Fn(SocketAddr, &io::Error) + Send + Sync + 'static,
    ) -> Self {
        self.tls_client_error = Some(Arc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&io::Error) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(handler));
        self
    }
}

/// What a caller attaches to the listener it asks the pool for.
#[derive(Clone, Default)]
pub enum Handlers {
    #[default]
    None,
    /// A single handler for inbound requests.
    Request(RequestHandler),
    /// Handlers attached by event name.
    Events(ListenerEvents),
}

impl Handlers {
    pub fn request<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        Self::Request(request_handler(handler))
    }

    fn into_events(self) -> ListenerEvents {
        match self {
            Self::None => ListenerEvents::default(),
            Self::Request(handler) => ListenerEvents {
                request: Some(handler),
                ..ListenerEvents::default()
            },
            Self::Events(events) => events,
        }
    }
}

impl From<ListenerEvents> for Handlers {
    fn from(events: ListenerEvents) -> Self {
        Self::Events(events)
    }
}

fn request_handler<F, Fut>(handler: F) -> RequestHandler
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(handler(req)))
}

/// Lifecycle signals the owner of a listener reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenerSignal {
    SecureConnection(SocketAddr),
    HandshakeFailed { peer: SocketAddr, reason: String },
    Failed { reason: String },
}

pub(crate) type SignalHook = Arc<dyn Fn(ListenerSignal) + Send + Sync>;

struct ConnectionContext {
    acceptor: TlsAcceptor,
    events: ListenerEvents,
    protocol_timeout: Option<Duration>,
    hook: SignalHook,
    connections: Arc<AtomicUsize>,
}

/// A bound TLS listener. Closing (or dropping) it stops the accept loop;
/// connections already accepted run to completion.
pub struct TlsListener {
    local_addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl TlsListener {
    /// Bind `addr` and start accepting.
    ///
    /// `protocol_timeout` bounds the TLS handshake, and afterwards closes any
    /// connection that has neither read nor written for that long.
    pub(crate) async fn bind(
        addr: SocketAddr,
        tls_config: Arc<ServerConfig>,
        handlers: Handlers,
        protocol_timeout: Option<Duration>,
        hook: SignalHook,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let ctx = Arc::new(ConnectionContext {
            acceptor: TlsAcceptor::from(tls_config),
            events: handlers.into_events(),
            protocol_timeout,
            hook,
            connections: Arc::clone(&connections),
        });
        tokio::spawn(accept_loop(listener, ctx, shutdown.clone()));

        Ok(Self {
            local_addr,
            connections,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of accepted connections that are still open.
    pub async fn connection_count(&self) -> io::Result<usize> {
        if self.is_closed() {
            return Err(not_running());
        }
        Ok(self.connections.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting. Fails if the listener was already closed.
    pub fn close(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(not_running());
        }
        self.shutdown.cancel();
        Ok(())
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn not_running() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener is not running")
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let guard = ConnectionGuard::new(&ctx.connections);
                tokio::spawn(serve_connection(stream, peer, Arc::clone(&ctx), guard));
            }
            Err(e) => {
                warn!(addr = ?listener.local_addr().ok(), error = %e, "accept failed");
                if let Some(on_error) = &ctx.events.error {
                    on_error(&e);
                }
                (ctx.hook)(ListenerSignal::Failed {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    debug!(addr = ?listener.local_addr().ok(), "accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
    _guard: ConnectionGuard,
) {
    if let Some(on_connection) = &ctx.events.connection {
        on_connection(peer);
    }

    let handshake = ctx.acceptor.accept(stream);
    let accepted = match ctx.protocol_timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                ))
            }),
        None => handshake.await,
    };

    let tls_stream = match accepted {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            debug!(%peer, error = %e, "TLS handshake failed");
            if let Some(on_tls_client_error) = &ctx.events.tls_client_error {
                on_tls_client_error(peer, &e);
            }
            (ctx.hook)(ListenerSignal::HandshakeFailed {
                peer,
                reason: e.to_string(),
            });
            return;
        }
    };

    (ctx.hook)(ListenerSignal::SecureConnection(peer));
    if let Some(on_secure_connection) = &ctx.events.secure_connection {
        on_secure_connection(peer);
    }

    match ctx.protocol_timeout {
        Some(limit) => serve_secured(IdleTimeout::new(tls_stream, limit), peer, &ctx).await,
        None => serve_secured(tls_stream, peer, &ctx).await,
    }
}

async fn serve_secured<S>(mut stream: S, peer: SocketAddr, ctx: &ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(handler) = ctx.events.request.clone() else {
        // No request handler: keep the connection open until the peer leaves
        if let Err(e) = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await {
            debug!(%peer, error = %e, "connection ended");
        }
        return;
    };

    let svc = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler(req).await) }
    });

    let mut builder = http1::Builder::new();
    if let Some(limit) = ctx.protocol_timeout {
        builder.timer(TokioTimer::new()).header_read_timeout(limit);
    }

    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
        if !e.to_string().contains("connection closed") {
            debug!(%peer, error = %e, "connection error");
        }
    }
}

/// Stream that fails with `TimedOut` once neither direction has made
/// progress for `limit`.
struct IdleTimeout<S> {
    inner: S,
    limit: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeout<S> {
    fn new(inner: S, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            deadline: Box::pin(tokio::time::sleep(limit)),
        }
    }

    fn touch(&mut self) {
        let next = Instant::now() + self.limit;
        self.deadline.as_mut().reset(next);
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.deadline.as_mut().poll(cx).is_ready()
    }
}

fn idle_expired() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if buf.filled().len() > before {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending if this.poll_expired(cx) => Poll::Ready(Err(idle_expired())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                if matches!(result, Ok(n) if n > 0) {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending if this.poll_expired(cx) => Poll::Ready(Err(idle_expired())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Counts a connection as live for as long as it is held.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(connections: &Arc<AtomicUsize>) -> Self {
        connections.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(connections))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::RootAuthority;
    use crate::cert::LeafCertificate;
    use crate::config::CaSubject;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    struct Fixture {
        root: RootAuthority,
        listener: TlsListener,
        signals: mpsc::UnboundedReceiver<ListenerSignal>,
    }

    async fn bind(hostname: &str, handlers: Handlers, protocol_timeout: Option<Duration>) -> Fixture {
        let root = RootAuthority::build(&CaSubject::new("listener test")).unwrap();
        let leaf = LeafCertificate::issue(hostname, &root).unwrap();
        let (tx, signals) = mpsc::unbounded_channel();
        let hook: SignalHook = Arc::new(move |signal| {
            let _ = tx.send(signal);
        });

        let listener = TlsListener::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            leaf.server_config(&root).unwrap(),
            handlers,
            protocol_timeout,
            hook,
        )
        .await
        .unwrap();

        Fixture {
            root,
            listener,
            signals,
        }
    }

    async fn tls_connect(
        addr: SocketAddr,
        hostname: &str,
        root: &RootAuthority,
    ) -> io::Result<TlsStream<TcpStream>> {
        let mut roots = RootCertStore::empty();
        roots.add(root.cert_der().clone()).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let stream = TcpStream::connect(addr).await?;
        TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from(hostname.to_string()).unwrap(), stream)
            .await
    }

    async fn wait_for_count(listener: &TlsListener, expected: usize) {
        for _ in 0..100 {
            if listener.connection_count().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("connection count never reached {expected}");
    }

    #[tokio::test]
    async fn test_serves_requests_after_handshake() {
        let handlers = Handlers::request(|req: Request<Incoming>| async move {
            let host = req
                .headers()
                .get(hyper::header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Response::new(Full::new(Bytes::from(format!("hello {host}"))))
        });
        let mut fixture = bind("www.foo.com", handlers, None).await;

        let mut tls = tls_connect(fixture.listener.local_addr(), "www.foo.com", &fixture.root)
            .await
            .unwrap();
        tls.write_all(b"GET / HTTP/1.1\r\nHost: www.foo.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        tls.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("hello www.foo.com"));
        assert!(matches!(
            fixture.signals.recv().await,
            Some(ListenerSignal::SecureConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_named_events_fire() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let on_connection = tx.clone();
        let on_secure = tx.clone();
        let handlers = Handlers::from(
            ListenerEvents::default()
                .on_connection(move |_| {
                    let _ = on_connection.send("connection");
                })
                .on_secure_connection(move |_| {
                    let _ = on_secure.send("secureConnection");
                })
                .on_tls_client_error(move |_, _| {
                    let _ = tx.send("tlsClientError");
                }),
        );
        let fixture = bind("192.168.1.1", handlers, None).await;

        let _tls = tls_connect(fixture.listener.local_addr(), "192.168.1.1", &fixture.root)
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some("connection"));
        assert_eq!(events.recv().await, Some("secureConnection"));

        let mut raw = TcpStream::connect(fixture.listener.local_addr()).await.unwrap();
        raw.write_all(b"this is not a client hello").await.unwrap();
        assert_eq!(events.recv().await, Some("connection"));
        assert_eq!(events.recv().await, Some("tlsClientError"));
    }

    #[tokio::test]
    async fn test_garbage_handshake_signals_failure() {
        let mut fixture = bind("www.foo.com", Handlers::None, None).await;

        let mut raw = TcpStream::connect(fixture.listener.local_addr()).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        assert!(matches!(
            fixture.signals.recv().await,
            Some(ListenerSignal::HandshakeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_timeout_signals_failure() {
        let mut fixture = bind("www.foo.com", Handlers::None, Some(Duration::from_millis(100))).await;

        let _idle = TcpStream::connect(fixture.listener.local_addr()).await.unwrap();

        match fixture.signals.recv().await {
            Some(ListenerSignal::HandshakeFailed { reason, .. }) => {
                assert!(reason.contains("timed out"))
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_secured_connection_is_dropped_after_protocol_timeout() {
        let fixture = bind("www.foo.com", Handlers::None, Some(Duration::from_millis(200))).await;

        let _tls = tls_connect(fixture.listener.local_addr(), "www.foo.com", &fixture.root)
            .await
            .unwrap();
        wait_for_count(&fixture.listener, 1).await;

        // the client stays connected but sends nothing
        wait_for_count(&fixture.listener, 0).await;
    }

    #[tokio::test]
    async fn test_idle_keep_alive_is_dropped_after_protocol_timeout() {
        let handlers = Handlers::request(|_req: Request<Incoming>| async move {
            Response::new(Full::new(Bytes::from_static(b"ok")))
        });
        let fixture = bind("www.foo.com", handlers, Some(Duration::from_millis(300))).await;

        let mut tls = tls_connect(fixture.listener.local_addr(), "www.foo.com", &fixture.root)
            .await
            .unwrap();
        tls.write_all(b"GET / HTTP/1.1\r\nHost: www.foo.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = [0u8; 512];
        let n = tls.read(&mut response).await.unwrap();
        assert!(response[..n].starts_with(b"HTTP/1.1 200 OK"));
        wait_for_count(&fixture.listener, 1).await;

        wait_for_count(&fixture.listener, 0).await;
    }

    #[tokio::test]
    async fn test_active_connection_outlives_protocol_timeout() {
        let fixture = bind("www.foo.com", Handlers::None, Some(Duration::from_millis(300))).await;

        let mut tls = tls_connect(fixture.listener.local_addr(), "www.foo.com", &fixture.root)
            .await
            .unwrap();
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tls.write_all(b"ping").await.unwrap();
            tls.flush().await.unwrap();
        }
        assert_eq!(fixture.listener.connection_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connection_count_tracks_open_connections() {
        let fixture = bind("www.foo.com", Handlers::None, None).await;
        assert_eq!(fixture.listener.connection_count().await.unwrap(), 0);

        let first = TcpStream::connect(fixture.listener.local_addr()).await.unwrap();
        let second = TcpStream::connect(fixture.listener.local_addr()).await.unwrap();
        wait_for_count(&fixture.listener, 2).await;

        drop(first);
        drop(second);
        wait_for_count(&fixture.listener, 0).await;
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        let fixture = bind("www.foo.com", Handlers::None, None).await;
        let addr = fixture.listener.local_addr();

        fixture.listener.close().unwrap();
        assert!(fixture.listener.close().is_err());
        assert!(fixture.listener.connection_count().await.is_err());

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused);
    }
}
