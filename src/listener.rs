//! Listening sockets
//!
//! Each `Listener` is one generation: one bound socket, its accept loop and
//! the connections it accepted. Phases only move forward:
//!
//! - `Closed`: the socket is released, accepted connections run on untouched.
//! - `Retiring`: a successor took over the same address. Connections get a
//!   graceful shutdown but event streams keep flowing.
//! - `Expired`: the retiring grace period is over. Connections that are not
//!   relaying an event stream are dropped.
//! - `Draining`: connections get a graceful shutdown, event streams end.
//! - `Terminated`: whatever is left after the grace period is dropped.

use crate::error::ProxyError;
use crate::relay::ShutdownSignal;
use crate::response::ProxyBody;
use crate::tls::TlsTerminator;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A client that has not finished its TLS handshake by then is dropped
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Serving,
    Closed,
    Retiring,
    Expired,
    Draining,
    Terminated,
}

/// Per-connection facts handed to the request handler
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub remote_addr: SocketAddr,
    pub tls: bool,
    phase: watch::Receiver<Phase>,
    streaming: Arc<AtomicBool>,
}

impl ConnContext {
    pub fn new(remote_addr: SocketAddr, tls: bool, phase: watch::Receiver<Phase>) -> Self {
        Self {
            remote_addr,
            tls,
            phase,
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the current response as an event stream. Cleared when the
    /// connection reads its next request.
    pub fn mark_streaming(&self) {
        self.streaming.store(true, Ordering::SeqCst);
    }

    /// Resolves once this connection's listener starts draining
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        let mut phase = self.phase.clone();
        Box::pin(async move { wait_phase(&mut phase, Phase::Draining).await })
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>, ctx: ConnContext) -> Response<ProxyBody>;
}

/// Waits until the phase reaches `at_least`. A dropped sender means nobody
/// will ever ask for it, so this never resolves in that case.
async fn wait_phase(phase: &mut watch::Receiver<Phase>, at_least: Phase) {
    wait_until(phase, |p| p >= at_least).await
}

async fn wait_until(phase: &mut watch::Receiver<Phase>, reached: impl Fn(Phase) -> bool) {
    let seen = phase.wait_for(|p| reached(*p)).await.is_ok();
    if !seen {
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Default)]
struct ActiveConnections {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveConnections {
    fn enter(self: &Arc<Self>) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(self.clone())
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ConnectionGuard(Arc<ActiveConnections>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// One bound listening socket and the connections it accepted
pub struct Listener {
    local_addr: SocketAddr,
    tls: Option<TlsTerminator>,
    phase: watch::Sender<Phase>,
    active: Arc<ActiveConnections>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind `addr` and start accepting. Bind failures are `ProxyError::Bind`.
    pub async fn bind(
        addr: &str,
        tls: Option<TlsTerminator>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ProxyError> {
        let bind_err = |source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(
            "{} listener on {}",
            if tls.is_some() { "HTTPS" } else { "HTTP" },
            local_addr
        );

        let (phase, phase_rx) = watch::channel(Phase::Serving);
        let active = Arc::new(ActiveConnections::default());
        let task = tokio::spawn(accept_loop(
            listener,
            local_addr,
            tls.clone(),
            handler,
            phase_rx,
            active.clone(),
        ));

        Ok(Self {
            local_addr,
            tls,
            phase,
            active,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tls(&self) -> Option<TlsTerminator> {
        self.tls.clone()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.active.get()
    }

    fn advance(&self, next: Phase) {
        self.phase.send_if_modified(|phase| {
            if *phase < next {
                *phase = next;
                true
            } else {
                false
            }
        });
    }

    /// Stop accepting and release the socket. Accepted connections continue.
    pub async fn close(&self) {
        self.advance(Phase::Closed);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Hand the address over to a successor that is already bound. Idle
    /// keep-alive connections close, requests in flight get `grace` to
    /// finish, event streams run on until a later `drain`.
    pub async fn retire(&self, grace: Duration) {
        self.advance(Phase::Retiring);
        self.close().await;

        if tokio::time::timeout(grace, self.active.wait_idle()).await.is_err() {
            debug!(
                address = %self.local_addr,
                remaining = self.active_connections(),
                "Retiring grace elapsed, keeping event streams only"
            );
            self.advance(Phase::Expired);
        }
    }

    /// Stop accepting, let connections finish, cut the rest after `grace`
    pub async fn drain(&self, grace: Duration) {
        self.advance(Phase::Draining);
        self.close().await;

        if tokio::time::timeout(grace, self.active.wait_idle()).await.is_err() {
            warn!(
                address = %self.local_addr,
                remaining = self.active_connections(),
                "Grace period elapsed, terminating connections"
            );
            self.terminate();
            let _ = tokio::time::timeout(Duration::from_secs(1), self.active.wait_idle()).await;
        }
        info!("Listener on {} drained", self.local_addr);
    }

    /// Drop every remaining connection now
    pub fn terminate(&self) {
        self.advance(Phase::Terminated);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsTerminator>,
    handler: Arc<dyn RequestHandler>,
    mut phase: watch::Receiver<Phase>,
    active: Arc<ActiveConnections>,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Accept failed on {}: {}", local_addr, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = wait_phase(&mut phase, Phase::Closed) => break,
        };

        let _ = stream.set_nodelay(true);
        let guard = active.enter();
        let tls = tls.clone();
        let handler = handler.clone();
        let phase = phase.clone();

        tokio::spawn(async move {
            let _guard = guard;
            handle_connection(stream, remote_addr, tls, handler, phase).await;
        });
    }

    debug!("Listener on {} stopped accepting", local_addr);
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsTerminator>,
    handler: Arc<dyn RequestHandler>,
    phase: watch::Receiver<Phase>,
) {
    let Some(tls) = tls else {
        return serve_connection(TokioIo::new(stream), remote_addr, false, handler, phase).await;
    };

    let mut watch = phase.clone();
    let handshake = tokio::select! {
        res = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.accept(stream)) => res,
        _ = wait_phase(&mut watch, Phase::Retiring) => {
            debug!("Dropping unfinished TLS handshake from {}", remote_addr);
            return;
        }
    };

    match handshake {
        Ok(Ok(stream)) => serve_connection(TokioIo::new(stream), remote_addr, true, handler, phase).await,
        Ok(Err(e)) => debug!("TLS handshake from {} failed: {}", remote_addr, e),
        Err(_) => debug!("TLS handshake from {} timed out", remote_addr),
    }
}

async fn serve_connection<I>(
    io: I,
    remote_addr: SocketAddr,
    tls: bool,
    handler: Arc<dyn RequestHandler>,
    mut phase: watch::Receiver<Phase>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let ctx = ConnContext::new(remote_addr, tls, phase.clone());
    let streaming = ctx.streaming.clone();
    let service = service_fn(move |req| {
        let handler = handler.clone();
        let ctx = ctx.clone();
        ctx.streaming.store(false, Ordering::SeqCst);
        async move { Ok::<_, Infallible>(handler.handle(req, ctx).await) }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!("Connection from {} ended with error: {}", remote_addr, e);
            }
            return;
        }
        _ = wait_phase(&mut phase, Phase::Retiring) => {}
    }

    conn.as_mut().graceful_shutdown();

    let mut expiry = phase.clone();
    let expired = async move {
        wait_until(&mut expiry, |p| p == Phase::Expired).await;
        if streaming.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!("Draining connection from {} ended with error: {}", remote_addr, e);
            }
        }
        _ = expired => {
            debug!("Cutting retired connection from {}", remote_addr);
        }
        _ = wait_phase(&mut phase, Phase::Terminated) => {
            debug!("Cutting connection from {}", remote_addr);
        }
    }
}
