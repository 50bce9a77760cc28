//! Error type shared by the reactor crates.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Ring creation failed.
    #[error("io_uring setup: {0}")]
    RingSetup(#[source] io::Error),

    /// Buffer ring, buffer table or descriptor table registration failed.
    #[error("register {what}: {source}")]
    Registration {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// Submission queue could not accept an entry.
    #[error("submit: {0}")]
    Submit(#[source] io::Error),

    /// Waiting for completions failed with something other than EINTR.
    #[error("wait for completions: {0}")]
    Wait(#[source] io::Error),

    /// A completion carried an op code this reactor never submits.
    #[error("unknown op code {0} in completion")]
    UnknownOp(u8),

    /// An operation that must not fail on this loop did.
    #[error("{op} failed: {source}")]
    Completion {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A completion arrived on the wrong loop flavor.
    #[error("{0} completion on the wrong loop")]
    WrongLoop(&'static str),

    #[error("listening socket: {0}")]
    Socket(#[source] io::Error),

    #[error("spawn worker: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("worker startup: {0}")]
    WorkerStartup(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wrap a negative completion result.
    pub fn completion(op: &'static str, res: i32) -> Self {
        Error::Completion { op, source: io::Error::from_raw_os_error(-res) }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
