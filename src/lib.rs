//! oneshot-server: a concurrent TCP request/response server.
//!
//! Every accepted connection is read until the client stops sending, the
//! collected bytes are passed to a caller-supplied callback once, and the
//! callback's reply is written back before the connection is closed.
//!
//! Components:
//! - `listener`: bound listening socket with captured setup errors
//! - `pool`: fixed worker pool with per-task cooperative stop signals
//! - `connection`: the per-connection receive/respond loop
//! - `server`: accept and dispatch glue
//! - `net`: explicit process-wide socket subsystem init/shutdown
//!
//! ```no_run
//! use oneshot_server::{net, Callback, ConnectionInfo, Server};
//! use std::sync::Arc;
//!
//! net::init().unwrap();
//! let server = Server::new(8080, 4096, 16, true);
//! assert!(server.is_listening());
//!
//! let echo: Callback = Arc::new(|_: &ConnectionInfo, data: &[u8]| data.to_vec());
//! loop {
//!     server.accept(&echo);
//! }
//! ```

pub mod config;
pub mod connection;
pub mod listener;
pub mod net;
pub mod pool;
pub mod responder;
pub mod server;

pub use connection::{Callback, ConnectionInfo, Outcome, RECEIVE_TIMEOUT};
pub use pool::{StopSignal, WorkerPool};
pub use responder::Responder;
pub use server::{Server, ServerOptions};
