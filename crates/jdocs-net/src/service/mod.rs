//! Application services behind the WebSocket layer.
//!
//! Each upgraded connection talks to exactly one service, picked from the
//! request path of its opening handshake. A service turns one complete client
//! message into a reply for the sender and, through envelopes, messages for
//! other connections.

pub mod chat;
pub mod document;
pub mod ot;

use std::borrow::Cow;

use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;

use crate::connection::ConnIo;

pub use chat::{ChatService, REPLY_OK};
pub use document::{Document, DocumentService, DocumentStore};

pub const REPLY_BAD: &str = r#"{"success":false,"message":"bad request!"}"#;

#[derive(Debug)]
pub enum Service {
    Chat,
    Document(DocumentService),
}

impl Default for Service {
    fn default() -> Self {
        Service::Chat
    }
}

impl Service {
    /// `/doc` and `/document` select the document service; every other path chats.
    pub fn for_path(path: &str) -> Self {
        match path.trim_end_matches('/') {
            "/doc" | "/document" => Service::Document(DocumentService::new()),
            _ => Service::Chat,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Service::Chat => "chat",
            Service::Document(_) => "document",
        }
    }

    /// Handle one complete client message and return the reply text.
    pub fn handle<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, data: &[u8]) -> Result<Cow<'static, str>> {
        match self {
            Service::Chat => ChatService::handle(io, data).map(Cow::Borrowed),
            Service::Document(d) => d.handle(io, data),
        }
    }

    /// The connection is gone; release whatever it held.
    pub fn on_close<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>) -> Result<()> {
        match self {
            Service::Chat => Ok(()),
            Service::Document(d) => d.on_close(io),
        }
    }
}
