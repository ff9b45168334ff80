//! Per-connection request/response loop.
//!
//! A connection is read until the peer stops sending (closure, error, or a
//! receive timeout with no data), the accumulated bytes are handed to the
//! callback once, and its reply is written back. The stop signal is polled
//! before every receive, so a stopped handler exits within one
//! [`RECEIVE_TIMEOUT`].

use crate::pool::StopSignal;
use bytes::BytesMut;
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Receive timeout applied before every read.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Write timeout for each attempt at sending the reply.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a reply may go without any byte accepted by the peer.
pub const SEND_STALL_LIMIT: Duration = Duration::from_secs(5);

/// Identity of a connection, as seen by the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Server-assigned sequence number, unique per server instance.
    pub id: u64,
    /// Remote address of the client.
    pub peer: SocketAddr,
}

/// Request-to-reply transform invoked at most once per connection.
pub type Callback = Arc<dyn Fn(&ConnectionInfo, &[u8]) -> Vec<u8> + Send + Sync>;

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The callback ran and its reply was sent (or the send failed silently).
    Responded { request_len: usize, reply_len: usize },
    /// Input ended before any byte arrived.
    Empty,
    /// The stop signal fired; accumulated bytes were dropped unanswered.
    Stopped { discarded: usize },
}

#[derive(Debug)]
enum ConnState {
    Receiving,
    Responding,
    Closed(Outcome),
}

/// Run the receive/respond state machine on `stream`.
///
/// Any receive error ends input, except `EINTR`, which retries the read.
/// Does not close the stream; the caller owns it.
pub fn handle_client<F>(
    stream: &mut TcpStream,
    info: &ConnectionInfo,
    stop: &StopSignal,
    buffer_size: usize,
    callback: F,
) -> Outcome
where
    F: FnOnce(&ConnectionInfo, &[u8]) -> Vec<u8>,
{
    let mut chunk = vec![0u8; buffer_size.max(1)];
    let mut data = BytesMut::new();
    let mut state = ConnState::Receiving;

    while let ConnState::Receiving = state {
        if stop.is_stopped() {
            state = ConnState::Closed(Outcome::Stopped {
                discarded: data.len(),
            });
            break;
        }

        if let Err(e) = prepare_receive(stream) {
            trace!(conn_id = info.id, error = %e, "Failed to set socket options");
        }

        state = match stream.read(&mut chunk) {
            Ok(0) => end_of_input(&data),
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                trace!(conn_id = info.id, n, total = data.len(), "Received");
                ConnState::Receiving
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ConnState::Receiving,
            Err(e) => {
                trace!(conn_id = info.id, error = %e, "Receive ended");
                end_of_input(&data)
            }
        };
    }

    match state {
        ConnState::Closed(outcome) => outcome,
        ConnState::Receiving | ConnState::Responding => {
            let reply = callback(info, &data);

            if let Err(e) = send_reply(stream, &reply, stop) {
                debug!(conn_id = info.id, error = %e, "Failed to send reply");
            }

            Outcome::Responded {
                request_len: data.len(),
                reply_len: reply.len(),
            }
        }
    }
}

fn end_of_input(data: &[u8]) -> ConnState {
    if data.is_empty() {
        ConnState::Closed(Outcome::Empty)
    } else {
        ConnState::Responding
    }
}

/// Bound the next read so the stop signal gets rechecked.
fn prepare_receive(stream: &TcpStream) -> io::Result<()> {
    stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
    SockRef::from(stream).set_reuse_address(true)
}

/// Write the whole reply, retrying short writes.
///
/// Each write is bounded by [`SEND_TIMEOUT`] so the stop signal is rechecked
/// between attempts; a peer that accepts nothing for [`SEND_STALL_LIMIT`]
/// gets the rest of its reply dropped.
fn send_reply(stream: &mut TcpStream, reply: &[u8], stop: &StopSignal) -> io::Result<()> {
    stream.set_write_timeout(Some(SEND_TIMEOUT))?;

    let mut written = 0;
    let mut last_progress = Instant::now();

    while written < reply.len() {
        if stop.is_stopped() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "stopped while sending reply",
            ));
        }

        match stream.write(&reply[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                written += n;
                last_progress = Instant::now();
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if last_progress.elapsed() >= SEND_STALL_LIMIT {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("peer stalled after {written} of {} bytes", reply.len()),
                    ));
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
