//! Listening socket setup and accept.
//!
//! Setup never fails loudly: a bind or listen error is captured as the raw
//! OS error code and the socket is closed, leaving the listener permanently
//! in error state.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use tracing::{debug, warn};

/// Error code recorded when a setup failure carries no OS error number.
pub const UNKNOWN_ERROR: i32 = -1;

/// A bound, listening IPv4 TCP socket, or the error that prevented one.
#[derive(Debug)]
pub struct Listener {
    socket: Option<TcpListener>,
    error: Option<i32>,
}

impl Listener {
    /// Bind to loopback (`local_only`) or the wildcard address on `port` and
    /// start listening with a backlog of `backlog`.
    pub fn bind(port: u16, backlog: usize, local_only: bool) -> Self {
        let ip = if local_only {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));

        match create_listener(addr, backlog) {
            Ok(socket) => {
                debug!(addr = %addr, backlog, "Listening");
                Self {
                    socket: Some(socket),
                    error: None,
                }
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Failed to set up listener");
                Self {
                    socket: None,
                    error: Some(e.raw_os_error().unwrap_or(UNKNOWN_ERROR)),
                }
            }
        }
    }

    /// Block until a client connects.
    ///
    /// Returns `None` when the listener is in error state or accept fails.
    pub fn accept_connection(&self) -> Option<(TcpStream, SocketAddr)> {
        let socket = self.socket.as_ref()?;
        match socket.accept() {
            Ok(accepted) => Some(accepted),
            Err(e) => {
                debug!(error = %e, "Accept failed");
                None
            }
        }
    }

    /// Close the socket and record `e` as a setup failure.
    pub fn fail(&mut self, e: &io::Error) {
        self.socket = None;
        self.error.get_or_insert(e.raw_os_error().unwrap_or(UNKNOWN_ERROR));
    }

    /// True iff setup succeeded.
    pub fn is_listening(&self) -> bool {
        self.error.is_none()
    }

    /// Raw OS error code captured during setup.
    pub fn error(&self) -> Option<i32> {
        self.error
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

/// Create a blocking TCP listener with `SO_REUSEADDR`.
///
/// `SO_REUSEPORT` is left off: with it Linux lets a second socket share an
/// already-listening port, and a second server on the same port must fail.
fn create_listener(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    // Dropping `socket` on any early return above closes it.
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bind_ephemeral() {
        let listener = Listener::bind(0, 4, true);
        assert!(listener.is_listening());
        assert_eq!(listener.error(), None);

        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_wildcard_bind() {
        let listener = Listener::bind(0, 4, false);
        assert!(listener.is_listening());
        assert_eq!(listener.local_addr().unwrap().ip(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_second_bind_fails() {
        let first = Listener::bind(0, 4, true);
        let port = first.local_addr().unwrap().port();

        let second = Listener::bind(port, 4, true);
        assert!(!second.is_listening());
        assert!(second.error().is_some());
        assert!(second.local_addr().is_none());
        assert!(second.accept_connection().is_none());
    }

    #[test]
    fn test_fail_closes_socket() {
        let mut listener = Listener::bind(0, 4, true);
        let addr = listener.local_addr().unwrap();

        listener.fail(&io::Error::from_raw_os_error(libc::EMFILE));
        assert!(!listener.is_listening());
        assert_eq!(listener.error(), Some(libc::EMFILE));
        assert!(listener.local_addr().is_none());

        // The port is free again.
        assert!(Listener::bind(addr.port(), 4, true).is_listening());
    }

    #[test]
    fn test_accept_connection() {
        let listener = Listener::bind(0, 4, true);
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let (_stream, peer) = listener.accept_connection().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
