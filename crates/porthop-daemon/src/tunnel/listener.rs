//! TLS-terminating listener that forwards each connection to a backend.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Upper bound on a client's TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` (e.g. EMFILE) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of [`TlsListener::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections still open when draining started.
    pub in_flight: usize,
    /// Connections cut off at the grace deadline.
    pub forced: usize,
}

/// One public port of a tunnel.
///
/// The accept loop runs in its own task; every accepted connection runs in
/// a task on `connections`. Dropping the listener stops everything
/// immediately.
pub struct TlsListener {
    application_key: Arc<str>,
    local_addr: SocketAddr,
    accept_stop: CancellationToken,
    force_close: CancellationToken,
    connections: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("application_key", &self.application_key)
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl TlsListener {
    /// Bind `bind_address:port` and start accepting.
    pub async fn bind(
        application_key: &str,
        bind_address: IpAddr,
        port: u16,
        backend: SocketAddr,
        tls: Arc<ServerConfig>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((bind_address, port)).await?;
        let local_addr = listener.local_addr()?;

        let application_key: Arc<str> = Arc::from(application_key);
        let accept_stop = CancellationToken::new();
        let force_close = CancellationToken::new();
        let connections = TaskTracker::new();

        let task = tokio::spawn(accept_loop(AcceptContext {
            listener,
            acceptor: TlsAcceptor::from(tls),
            backend,
            application_key: Arc::clone(&application_key),
            accept_stop: accept_stop.clone(),
            force_close: force_close.clone(),
            connections: connections.clone(),
        }));

        info!(
            application_key = %application_key,
            addr = %local_addr,
            backend = %backend,
            "Listener bound"
        );

        Ok(Self {
            application_key,
            local_addr,
            accept_stop,
            force_close,
            connections,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Connections currently being forwarded.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting and release the socket. In-flight connections keep
    /// running.
    pub async fn stop_accepting(&self) {
        self.accept_stop.cancel();
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(application_key = %self.application_key, error = %e, "Accept task failed");
        }
    }

    /// Stop accepting, wait up to `grace` for in-flight connections, then
    /// force-close whatever is left.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        self.stop_accepting().await;
        self.connections.close();

        let in_flight = self.connections.len();
        if in_flight == 0 {
            return DrainReport {
                in_flight,
                forced: 0,
            };
        }

        debug!(
            application_key = %self.application_key,
            port = self.port(),
            in_flight,
            grace_ms = grace.as_millis(),
            "Draining listener"
        );

        let forced = if tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_ok()
        {
            0
        } else {
            let forced = self.connections.len();
            warn!(
                application_key = %self.application_key,
                port = self.port(),
                forced,
                "Grace period elapsed, force-closing connections"
            );
            self.force_close.cancel();
            self.connections.wait().await;
            forced
        };

        DrainReport { in_flight, forced }
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_stop.cancel();
        self.force_close.cancel();
    }
}

struct AcceptContext {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    backend: SocketAddr,
    application_key: Arc<str>,
    accept_stop: CancellationToken,
    force_close: CancellationToken,
    connections: TaskTracker,
}

async fn accept_loop(ctx: AcceptContext) {
    loop {
        tokio::select! {
            () = ctx.accept_stop.cancelled() => break,
            accepted = ctx.listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    ctx.connections.spawn(forward(
                        stream,
                        peer,
                        ctx.acceptor.clone(),
                        ctx.backend,
                        Arc::clone(&ctx.application_key),
                        ctx.force_close.clone(),
                    ));
                }
                Err(e) => {
                    warn!(application_key = %ctx.application_key, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    debug!(
        application_key = %ctx.application_key,
        addr = ?ctx.listener.local_addr().ok(),
        "Stopped accepting"
    );
}

async fn forward(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    backend: SocketAddr,
    application_key: Arc<str>,
    force_close: CancellationToken,
) {
    let session = async {
        let mut tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake"))??;
        let mut upstream = TcpStream::connect(backend).await?;
        tokio::io::copy_bidirectional(&mut tls, &mut upstream).await
    };

    tokio::select! {
        () = force_close.cancelled() => {
            debug!(application_key = %application_key, peer = %peer, "Connection force-closed");
        }
        result = session => match result {
            Ok((to_backend, to_client)) => {
                debug!(
                    application_key = %application_key,
                    peer = %peer,
                    to_backend,
                    to_client,
                    "Connection closed"
                );
            }
            Err(e) => {
                debug!(application_key = %application_key, peer = %peer, error = %e, "Connection ended");
            }
        }
    }
}
