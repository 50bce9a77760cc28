//! # jdocs-core: reactor building blocks
//!
//! Everything in this crate is independent of the kernel ring. The
//! `jdocs-net` crate plugs an io_uring implementation of [`io_backend::IoBackend`]
//! underneath these types; tests plug a recording backend instead.
//!
//! ## Thread model
//!
//! One listener thread and a fixed set of worker threads. The index bitmap,
//! timer wheel and connection map are confined to their owning worker. Only
//! the user directory ([`registry::UserDirectory`]) and envelope reference
//! counts ([`envelope::Envelope`]) are shared across threads.

pub mod bitmap;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod env;
pub mod error;
pub mod io_backend;
pub mod registry;
pub mod timer;
pub mod token;

pub use error::{Error, Result};
