//! NBD server implementation
//!
//! Main NBD server that accepts client connections and hands each one to
//! its own [`NbdConnection`] task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::backend::BlockBackend;
use crate::config::NbdConfig;
use crate::error::BlockResult;
use crate::nbd::NbdConnection;

/// NBD server
pub struct NbdServer<B: ?Sized> {
    /// Server configuration
    config: NbdConfig,
    /// Backend every connection dispatches into
    backend: Arc<B>,
    /// Active connections
    connections: Arc<AtomicU64>,
    /// Address of the most recently bound listener
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<B: BlockBackend + ?Sized> NbdServer<B> {
    /// Create a new NBD server
    pub fn new(backend: Arc<B>, config: NbdConfig) -> Self {
        Self {
            config,
            backend,
            connections: Arc::new(AtomicU64::new(0)),
            local_addr: Mutex::new(None),
        }
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Address the server is actually listening on, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Get the backend
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Bind the configured address
    pub async fn bind(&self) -> BlockResult<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        Ok(listener)
    }

    /// Run the NBD server
    pub async fn run(&self) -> BlockResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> BlockResult<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Connections already accepted keep running after the accept loop stops.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> BlockResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("NBD server listening on {}", addr);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("NBD server on {} shutting down", addr);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => warn!("Failed to accept NBD connection: {}", e),
                },
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let active = self.connections.load(Ordering::Relaxed);
        if active >= self.config.max_clients as u64 {
            warn!(%peer, active, "Refusing NBD connection: client limit reached");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
        }

        debug!("Accepted NBD connection from {}", peer);
        self.connections.fetch_add(1, Ordering::Relaxed);
        let guard = ConnectionGuard(self.connections.clone());
        let backend = self.backend.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match NbdConnection::new(stream, backend).with_peer(peer).run().await {
                Ok(()) => debug!("NBD connection from {} closed", peer),
                Err(e) => warn!(%peer, error = %e, "NBD connection terminated"),
            }
        });
    }
}

/// Decrements the connection count when a connection task ends
struct ConnectionGuard(Arc<AtomicU64>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
