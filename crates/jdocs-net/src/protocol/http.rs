//! HTTP/1.1 WebSocket upgrade handshake.
//!
//! Accumulates the request head, validates it as an RFC 6455 opening
//! handshake and answers `101 Switching Protocols`. Anything else gets a
//! `400` followed by teardown. A `user_id` query parameter on the request
//! target binds the connection in the user directory, and the request path
//! picks the service the WebSocket handler talks to.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use jdocs_core::constants::MAX_REQUEST_HEAD;
use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;

use super::websocket::WebSocketHandler;
use super::{Protocol, ProtocolHandler};
use crate::connection::{ConnIo, Stage};
use crate::service::Service;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const RESPONSE_101: &str = "HTTP/1.1 101 Switching Protocols\r\n\
Connection: Upgrade\r\n\
Upgrade: websocket\r\n\
Server: jdocs_server\r\n\
Sec-WebSocket-Accept: ";

pub const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Server: jdocs_server\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 26\r\n\
Connection: Close\r\n\r\n\
Invalid Handshake Request!";

/// A validated opening handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub user_id: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Head not terminated yet.
    Incomplete,
    /// Valid handshake; `usize` is the length of the head including the blank line.
    Upgrade(UpgradeRequest, usize),
    Invalid(&'static str),
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

pub fn parse_upgrade(data: &[u8]) -> ParseOutcome {
    let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return ParseOutcome::Incomplete;
    };
    let head_len = end + 4;
    let Ok(head) = std::str::from_utf8(&data[..end]) else {
        return ParseOutcome::Invalid("request head is not UTF-8");
    };

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return ParseOutcome::Invalid("malformed request line");
    };
    if method != "GET" {
        return ParseOutcome::Invalid("method is not GET");
    }
    if version != "HTTP/1.1" {
        return ParseOutcome::Invalid("version is not HTTP/1.1");
    }

    let mut upgrade = false;
    let mut connection = false;
    let mut version_ok = false;
    let mut key = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return ParseOutcome::Invalid("malformed header line");
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection = value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version_ok = value == "13";
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_string());
        }
    }

    if !upgrade {
        return ParseOutcome::Invalid("missing Upgrade: websocket");
    }
    if !connection {
        return ParseOutcome::Invalid("missing Connection: upgrade");
    }
    if !version_ok {
        return ParseOutcome::Invalid("unsupported Sec-WebSocket-Version");
    }
    let Some(key) = key.filter(|k| STANDARD.decode(k).map_or(false, |raw| raw.len() == 16)) else {
        return ParseOutcome::Invalid("missing or malformed Sec-WebSocket-Key");
    };

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let user_id = query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == "user_id")
        .and_then(|(_, v)| v.parse().ok());

    ParseOutcome::Upgrade(
        UpgradeRequest { path: path.to_string(), key, user_id },
        head_len,
    )
}

/// Write the `101` response for `key` into `out`.
pub fn write_response_101(key: &str, out: &mut [u8]) -> usize {
    let accept = accept_key(key);
    let parts: [&[u8]; 3] = [RESPONSE_101.as_bytes(), accept.as_bytes(), b"\r\n\r\n"];
    let mut n = 0;
    for part in parts {
        out[n..n + part.len()].copy_from_slice(part);
        n += part.len();
    }
    n
}

#[derive(Debug, Default)]
pub struct HttpHandler {
    head: Vec<u8>,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn reject<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, reason: &str) -> Result<()> {
        warn!(conn_id = io.conn_id(), reason, "rejecting handshake");
        io.send_with(true, |buf| {
            buf[..RESPONSE_400.len()].copy_from_slice(RESPONSE_400);
            RESPONSE_400.len()
        })?;
        io.close()
    }
}

impl ProtocolHandler for HttpHandler {
    fn stage(&self) -> Stage {
        Stage::Http
    }

    fn on_recv<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, data: &[u8]) -> Result<()> {
        self.head.extend_from_slice(data);
        match parse_upgrade(&self.head) {
            ParseOutcome::Incomplete => {
                if self.head.len() > MAX_REQUEST_HEAD {
                    return self.reject(io, "request head too large");
                }
                Ok(())
            }
            ParseOutcome::Invalid(reason) => self.reject(io, reason),
            ParseOutcome::Upgrade(req, head_len) => {
                if !io.send_with(false, |buf| write_response_101(&req.key, buf))? {
                    return Ok(());
                }
                if let Some(user_id) = req.user_id {
                    io.bind_user(user_id);
                }
                let service = Service::for_path(&req.path);
                debug!(
                    conn_id = io.conn_id(),
                    path = %req.path,
                    user_id = ?req.user_id,
                    service = service.name(),
                    "upgraded to websocket"
                );
                let mut ws = WebSocketHandler::with_service(service);
                let rest = self.head.split_off(head_len);
                if !rest.is_empty() {
                    ws.on_recv(io, &rest)?;
                }
                io.upgrade(Protocol::WebSocket(ws));
                Ok(())
            }
        }
    }
}
