//! # jdocs-net
//!
//! The io_uring side of jdocs: the ring backend, buffer pools, the
//! listener/worker event loops, the HTTP/WebSocket protocol, and the chat
//! and collaborative document services that run on top of them.
//!
//! ```text
//! listener ring ──accept──▶ fd pass ──▶ worker ring (id % W)
//!                                         ├─ recv multishot (provided buffers)
//!                                         ├─ send_zc (registered buffers)
//!                                         ├─ timeout (timer wheel)
//!                                         └─ msg_ring ◀── other workers
//! ```

pub mod buffer;
pub mod connection;
pub mod event_loop;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod service;
pub mod worker;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring;
        pub use uring::{UringBackend, UringConfig};
    } else {
        compile_error!("jdocs-net requires Linux io_uring");
    }
}

#[cfg(test)]
mod testing;

pub use connection::{ConnIo, Connection, Stage};
pub use event_loop::EventLoop;
pub use server::{Server, Shared, StopHandle};
