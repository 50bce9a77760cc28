//! Collaborative document service.
//!
//! Documents live in a process-wide [`DocumentStore`] keyed by name and are
//! shared by every worker. A connection opens at most one document at a time.
//! Edits name the revision they were made against; the document transforms
//! them over everything applied since, stores the result and fans it out to
//! the other members through envelopes.
//!
//! Client messages:
//!
//! ```text
//! {"type":"open","doc_name":"notes"}
//! {"type":"edit","v":3,"ops":{"ops":[{"retain":5},{"insert":"!"}]}}
//! {"type":"close"}
//! ```

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use jdocs_core::envelope::Envelope;
use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;

use super::ot::{self, Operation};
use super::REPLY_BAD;
use crate::connection::ConnIo;

/// Applied operations kept for transforming late edits.
pub const HISTORY_CAPACITY: usize = 50;

pub const REPLY_CLOSED: &str = r#"{"success":true,"message":"close successfully."}"#;
pub const REPLY_NO_DOCUMENT: &str = r#"{"success":false,"message":"no document is currently open."}"#;
pub const REPLY_REJECTED: &str = r#"{"success":false,"message":"edit rejected."}"#;

const NOTE_JOINED: &str = "new user join.";
const NOTE_LEFT: &str = "a user close the document.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("revision {version} is outside the kept history [{oldest}, {current}]")]
    StaleVersion { version: u64, oldest: u64, current: u64 },

    #[error("edit spans {base} characters but the document has {len}")]
    OutOfRange { base: u64, len: u64 },
}

#[derive(Debug, Default)]
struct DocState {
    content: Operation,
    revision: u64,
    /// Revision the front of `history` was applied to.
    oldest: u64,
    history: VecDeque<Operation>,
}

#[derive(Debug)]
pub struct Document {
    name: String,
    state: Mutex<DocState>,
    /// Member connection ids. Written only under the store lock.
    members: RwLock<Vec<u32>>,
}

impl Document {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: Mutex::new(DocState::default()), members: RwLock::new(Vec::new()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current revision and content.
    pub fn snapshot(&self) -> (u64, Operation) {
        let state = self.state.lock();
        (state.revision, state.content.clone())
    }

    /// Apply an edit made against revision `version`.
    ///
    /// Returns the new revision and the edit as it was applied, which is what
    /// the other members need.
    pub fn apply(&self, version: u64, edit: Operation) -> std::result::Result<(u64, Operation), EditError> {
        let mut state = self.state.lock();
        if version < state.oldest || version > state.revision {
            return Err(EditError::StaleVersion { version, oldest: state.oldest, current: state.revision });
        }
        let mut edit = edit.normalized();
        let skip = (version - state.oldest) as usize;
        for past in state.history.iter().skip(skip) {
            edit = ot::transform(&edit, past);
        }
        let len = state.content.target_len();
        let base = edit.base_len();
        if base > len {
            return Err(EditError::OutOfRange { base, len });
        }

        state.content = ot::compose(&state.content, &edit);
        state.revision += 1;
        if state.history.len() >= HISTORY_CAPACITY {
            state.history.pop_front();
            state.oldest += 1;
        }
        state.history.push_back(edit.clone());
        Ok((state.revision, edit))
    }

    pub fn members(&self) -> Vec<u32> {
        self.members.read().clone()
    }
}

/// Open documents by name. A document is dropped from the store when its
/// last member leaves.
#[derive(Debug, Default)]
pub struct DocumentStore {
    docs: RwLock<HashMap<String, Arc<Document>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Document>> {
        self.docs.read().get(name).cloned()
    }

    /// Open `name`, creating it if needed, and add `conn_id` to its members.
    pub fn join(&self, name: &str, conn_id: u32) -> Arc<Document> {
        let mut docs = self.docs.write();
        let doc = docs
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(doc = name, "document created");
                Arc::new(Document::new(name))
            })
            .clone();
        doc.members.write().push(conn_id);
        doc
    }

    /// Remove `conn_id` from `doc` and return the members left behind.
    pub fn leave(&self, doc: &Arc<Document>, conn_id: u32) -> Vec<u32> {
        let mut docs = self.docs.write();
        let remaining = {
            let mut members = doc.members.write();
            members.retain(|&c| c != conn_id);
            members.clone()
        };
        if remaining.is_empty() && docs.get(doc.name()).map_or(false, |d| Arc::ptr_eq(d, doc)) {
            docs.remove(doc.name());
            debug!(doc = doc.name(), "document released");
        }
        remaining
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DocRequest {
    Open { doc_name: String },
    Edit { v: u64, ops: Operation },
    Close,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DocReply<'a> {
    Open { v: u64, ops: &'a Operation },
    Ack { v: u64, user_id: u32 },
    Notify { user_id: u32, message: &'a str },
    Op { v: u64, user_id: u32, ops: &'a Operation },
}

/// One connection's document session.
#[derive(Debug, Default)]
pub struct DocumentService {
    open: Option<Arc<Document>>,
}

impl DocumentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> Option<&Arc<Document>> {
        self.open.as_ref()
    }

    pub fn handle<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, data: &[u8]) -> Result<Cow<'static, str>> {
        let request: DocRequest = match serde_json::from_slice(data) {
            Ok(r) => r,
            Err(e) => {
                warn!(conn_id = io.conn_id(), error = %e, "bad document request");
                return Ok(Cow::Borrowed(REPLY_BAD));
            }
        };
        match request {
            DocRequest::Open { doc_name } => self.open(io, &doc_name),
            DocRequest::Edit { v, ops } => self.edit(io, v, ops),
            DocRequest::Close => match self.open.take() {
                Some(doc) => {
                    self.leave(io, &doc)?;
                    Ok(Cow::Borrowed(REPLY_CLOSED))
                }
                None => Ok(Cow::Borrowed(REPLY_NO_DOCUMENT)),
            },
        }
    }

    /// Leave the open document, if any, telling the remaining members.
    pub fn on_close<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>) -> Result<()> {
        match self.open.take() {
            Some(doc) => self.leave(io, &doc),
            None => Ok(()),
        }
    }

    fn open<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, name: &str) -> Result<Cow<'static, str>> {
        if let Some(prev) = self.open.take() {
            self.leave(io, &prev)?;
        }
        let conn_id = io.conn_id();
        let doc = io.documents().join(name, conn_id);
        info!(conn_id, doc = name, members = doc.members().len(), "document opened");

        let note = DocReply::Notify { user_id: io.user_id().unwrap_or(0), message: NOTE_JOINED };
        broadcast(io, &others(&doc.members(), conn_id), &note)?;

        let (v, content) = doc.snapshot();
        self.open = Some(doc);
        encode(&DocReply::Open { v, ops: &content })
    }

    fn edit<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, version: u64, ops: Operation) -> Result<Cow<'static, str>> {
        let Some(doc) = self.open.clone() else {
            return Ok(Cow::Borrowed(REPLY_NO_DOCUMENT));
        };
        let (v, applied) = match doc.apply(version, ops) {
            Ok(r) => r,
            Err(e) => {
                warn!(conn_id = io.conn_id(), doc = doc.name(), error = %e, "edit rejected");
                return Ok(Cow::Borrowed(REPLY_REJECTED));
            }
        };
        let conn_id = io.conn_id();
        let user_id = io.user_id().unwrap_or(0);
        debug!(conn_id, doc = doc.name(), revision = v, "edit applied");
        let op = DocReply::Op { v, user_id, ops: &applied };
        broadcast(io, &others(&doc.members(), conn_id), &op)?;
        encode(&DocReply::Ack { v, user_id })
    }

    fn leave<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, doc: &Arc<Document>) -> Result<()> {
        let conn_id = io.conn_id();
        let remaining = io.documents().leave(doc, conn_id);
        debug!(conn_id, doc = doc.name(), remaining = remaining.len(), "document left");
        let note = DocReply::Notify { user_id: io.user_id().unwrap_or(0), message: NOTE_LEFT };
        broadcast(io, &remaining, &note)?;
        Ok(())
    }
}

fn others(members: &[u32], conn_id: u32) -> Vec<u32> {
    members.iter().copied().filter(|&c| c != conn_id).collect()
}

fn encode(reply: &DocReply<'_>) -> Result<Cow<'static, str>> {
    match serde_json::to_string(reply) {
        Ok(text) => Ok(Cow::Owned(text)),
        Err(e) => {
            warn!(error = %e, "failed to encode document reply");
            Ok(Cow::Borrowed(REPLY_BAD))
        }
    }
}

/// Send `reply` to every connection in `targets` through one envelope.
fn broadcast<B: IoBackend>(io: &mut ConnIo<'_, B>, targets: &[u32], reply: &DocReply<'_>) -> Result<usize> {
    if targets.is_empty() {
        return Ok(0);
    }
    let payload = match serde_json::to_vec(reply) {
        Ok(p) => Bytes::from(p),
        Err(e) => {
            warn!(error = %e, "failed to encode document broadcast");
            return Ok(0);
        }
    };
    io.submit_cross_thread(Envelope::new(io.conn_id(), payload, targets))
}
