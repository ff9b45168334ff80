//! TCP server dispatching one handler task per accepted connection.
//!
//! The caller drives accepts (usually from a dedicated thread); every
//! accepted connection is handed to the worker pool together with the
//! callback, and closed once its handler returns.

use crate::connection::{handle_client, Callback, ConnectionInfo, Outcome};
use crate::listener::Listener;
use crate::pool::WorkerPool;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Construction parameters for a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Port to listen on (0 picks an ephemeral port).
    pub port: u16,
    /// Size of the per-connection receive buffer in bytes.
    pub buffer_size: usize,
    /// Worker count and listen backlog.
    pub max_clients: usize,
    /// Bind to loopback instead of all interfaces.
    pub local_only: bool,
}

/// Server instance
pub struct Server {
    listener: Listener,
    pool: Option<WorkerPool>,
    buffer_size: usize,
    next_id: AtomicU64,
}

impl Server {
    /// Create a server listening on `port`.
    ///
    /// Never fails: check [`is_listening`](Self::is_listening) afterwards.
    pub fn new(port: u16, buffer_size: usize, max_clients: usize, local_only: bool) -> Self {
        Self::with_options(&ServerOptions {
            port,
            buffer_size,
            max_clients,
            local_only,
        })
    }

    pub fn with_options(options: &ServerOptions) -> Self {
        let mut listener = Listener::bind(options.port, options.max_clients, options.local_only);

        // A server that cannot listen never dispatches, so it gets no workers.
        let pool = if listener.is_listening() {
            match WorkerPool::new(options.max_clients) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "Failed to start worker pool");
                    listener.fail(&e);
                    None
                }
            }
        } else {
            None
        };

        if let Some(addr) = listener.local_addr() {
            info!(
                address = %addr,
                buffer_size = options.buffer_size,
                max_clients = options.max_clients,
                "Server listening"
            );
        }

        Self {
            listener,
            pool,
            buffer_size: options.buffer_size,
            next_id: AtomicU64::new(1),
        }
    }

    /// Accept one connection and dispatch it to the worker pool.
    ///
    /// Blocks until a client connects; returns immediately when the server
    /// is not listening or the accept fails.
    pub fn accept(&self, callback: &Callback) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        let Some((mut stream, peer)) = self.listener.accept_connection() else {
            return;
        };

        let info = ConnectionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
        };
        debug!(conn_id = info.id, peer = %peer, "Accepted connection");

        let callback = Arc::clone(callback);
        let buffer_size = self.buffer_size;

        let queued = pool.submit(move |stop| {
            let outcome = handle_client(&mut stream, &info, stop, buffer_size, |info, data| {
                callback(info, data)
            });

            match outcome {
                Outcome::Responded {
                    request_len,
                    reply_len,
                } => debug!(conn_id = info.id, request_len, reply_len, "Responded"),
                Outcome::Empty => debug!(conn_id = info.id, "Closed without data"),
                Outcome::Stopped { discarded } => {
                    debug!(conn_id = info.id, discarded, "Stopped")
                }
            }

            let _ = stream.shutdown(Shutdown::Both);
        });

        if !queued {
            debug!(conn_id = info.id, "Pool closed, dropping connection");
        }
    }

    /// Accept connections until `stop` is set.
    ///
    /// The flag is checked between accepts; a pending accept is not interrupted.
    pub fn serve(&self, callback: &Callback, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) && self.is_listening() {
            self.accept(callback);
        }
    }

    /// True iff no setup error was recorded.
    pub fn is_listening(&self) -> bool {
        self.error().is_none()
    }

    /// Raw OS error code captured during setup.
    pub fn error(&self) -> Option<i32> {
        self.listener.error()
    }

    /// Address the server is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of connections currently being handled.
    pub fn active_connections(&self) -> usize {
        self.pool.as_ref().map_or(0, WorkerPool::active)
    }

    /// Stop every handler and wait for the workers to exit.
    ///
    /// Handlers exit within one receive or send timeout, including those
    /// blocked on a peer that does not read its reply. Later accepts close
    /// their connections without serving them.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.as_ref() {
            pool.shutdown();
        }
    }
}
