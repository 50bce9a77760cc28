//! Protocol handlers driven by the event loop.
//!
//! Each connection owns exactly one [`Protocol`] value. The HTTP handler
//! replaces itself with a WebSocket handler once the upgrade is answered.

pub mod frame;
pub mod http;
pub mod websocket;

use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;

use crate::connection::{ConnIo, Stage};

pub use http::HttpHandler;
pub use websocket::WebSocketHandler;

/// Callbacks the core invokes on a connection's handler.
pub trait ProtocolHandler {
    fn stage(&self) -> Stage;

    /// Bytes arrived on the connection.
    fn on_recv<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, data: &[u8]) -> Result<()>;

    /// A send of `sent` bytes completed.
    fn on_send<B: IoBackend>(&mut self, _io: &mut ConnIo<'_, B>, _sent: usize) -> Result<()> {
        Ok(())
    }

    /// The idle timer fired.
    fn on_timeout<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>) -> Result<()> {
        io.close()
    }

    /// A payload arrived from another connection through an envelope.
    fn on_message<B: IoBackend>(&mut self, _io: &mut ConnIo<'_, B>, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    /// The descriptor is closed and the connection is being dropped.
    fn on_close<B: IoBackend>(&mut self, _io: &mut ConnIo<'_, B>) -> Result<()> {
        Ok(())
    }
}

pub enum Protocol {
    Http(HttpHandler),
    WebSocket(WebSocketHandler),
}

impl Protocol {
    pub fn http() -> Self {
        Protocol::Http(HttpHandler::new())
    }
}

impl ProtocolHandler for Protocol {
    fn stage(&self) -> Stage {
        match self {
            Protocol::Http(h) => h.stage(),
            Protocol::WebSocket(h) => h.stage(),
        }
    }

    fn on_recv<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, data: &[u8]) -> Result<()> {
        match self {
            Protocol::Http(h) => h.on_recv(io, data),
            Protocol::WebSocket(h) => h.on_recv(io, data),
        }
    }

    fn on_send<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, sent: usize) -> Result<()> {
        match self {
            Protocol::Http(h) => h.on_send(io, sent),
            Protocol::WebSocket(h) => h.on_send(io, sent),
        }
    }

    fn on_timeout<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>) -> Result<()> {
        match self {
            Protocol::Http(h) => h.on_timeout(io),
            Protocol::WebSocket(h) => h.on_timeout(io),
        }
    }

    fn on_message<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, payload: &[u8]) -> Result<()> {
        match self {
            Protocol::Http(h) => h.on_message(io, payload),
            Protocol::WebSocket(h) => h.on_message(io, payload),
        }
    }

    fn on_close<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>) -> Result<()> {
        match self {
            Protocol::Http(h) => h.on_close(io),
            Protocol::WebSocket(h) => h.on_close(io),
        }
    }
}
