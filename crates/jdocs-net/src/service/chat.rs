//! Chat service: routes a JSON message to the connections of its recipients.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jdocs_core::envelope::Envelope;
use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;

use super::REPLY_BAD;
use crate::connection::ConnIo;

pub const REPLY_OK: &str = r#"{"success":true,"message":"sent successfully!"}"#;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One recipient or several.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(u32),
    Many(Vec<u32>),
}

impl Recipients {
    pub fn as_slice(&self) -> &[u32] {
        match self {
            Recipients::One(id) => std::slice::from_ref(id),
            Recipients::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub user_id: Recipients,
    pub message: String,
}

/// What recipients receive.
#[derive(Debug, Clone, Serialize)]
pub struct Forward<'a> {
    pub user_id: u32,
    pub date: String,
    pub message: &'a str,
}

pub struct ChatService;

impl ChatService {
    /// Handle one complete client message and return the reply text.
    pub fn handle<B: IoBackend>(io: &mut ConnIo<'_, B>, data: &[u8]) -> Result<&'static str> {
        let sender = io.user_id().unwrap_or(0);
        let request: ChatRequest = match serde_json::from_slice(data) {
            Ok(r) => r,
            Err(e) => {
                warn!(conn_id = io.conn_id(), error = %e, "bad chat request");
                return Ok(REPLY_BAD);
            }
        };
        info!(user_id = sender, conn_id = io.conn_id(), "chat message received");

        let mut targets: Vec<u32> = request
            .user_id
            .as_slice()
            .iter()
            .filter_map(|&user| io.directory().lookup(user))
            .collect();
        targets.sort_unstable();
        targets.dedup();
        if targets.is_empty() {
            return Ok(REPLY_OK);
        }

        let date = Utc::now().format(DATE_FORMAT).to_string();
        let forward = Forward { user_id: sender, date, message: &request.message };
        let payload = match serde_json::to_vec(&forward) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!(error = %e, "failed to encode forward");
                return Ok(REPLY_BAD);
            }
        };
        let deliveries = Envelope::new(io.conn_id(), payload, &targets);
        let sent = io.submit_cross_thread(deliveries)?;
        debug!(conn_id = io.conn_id(), recipients = sent, "chat message forwarded");
        Ok(REPLY_OK)
    }
}
