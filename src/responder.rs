//! Stock request handlers for the server binary.
//!
//! - `echo`: reply with the request bytes unchanged
//! - `reverse`: reply with the request bytes in reverse order
//! - `ping`: answer `PING\r\n` with `PONG\r\n` and `PING <msg>\r\n` with
//!   `PONG <msg>\r\n`; anything else gets `ERROR\r\n`
//!
//! Useful for health checks and for verifying that replies are never mixed
//! between connections.

use crate::connection::{Callback, ConnectionInfo};
use clap::ValueEnum;
use serde::Deserialize;
use std::sync::Arc;

/// Built-in request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Responder {
    #[default]
    Echo,
    Reverse,
    Ping,
}

impl Responder {
    /// Build the reply for one request.
    pub fn respond(self, request: &[u8]) -> Vec<u8> {
        match self {
            Responder::Echo => request.to_vec(),
            Responder::Reverse => request.iter().rev().copied().collect(),
            Responder::Ping => respond_ping(request),
        }
    }

    /// Wrap as a server callback.
    pub fn into_callback(self) -> Callback {
        Arc::new(move |_: &ConnectionInfo, request: &[u8]| self.respond(request))
    }
}

fn respond_ping(request: &[u8]) -> Vec<u8> {
    let line = request.strip_suffix(b"\r\n").unwrap_or(request);

    if line.eq_ignore_ascii_case(b"PING") {
        return b"PONG\r\n".to_vec();
    }

    if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        let msg = &line[5..];
        let mut reply = Vec::with_capacity(5 + msg.len() + 2);
        reply.extend_from_slice(b"PONG ");
        reply.extend_from_slice(msg);
        reply.extend_from_slice(b"\r\n");
        return reply;
    }

    b"ERROR\r\n".to_vec()
}
