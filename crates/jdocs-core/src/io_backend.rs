//! The I/O backend seam.
//!
//! The event loop only talks to the kernel through this trait. The
//! production implementation is `jdocs_net::uring::UringBackend`; tests use
//! a recording backend and feed synthetic completions.
//!
//! `prep_*` methods queue work; nothing reaches the kernel until
//! [`IoBackend::submit`] or [`IoBackend::submit_and_wait`].

use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::error::Result;
use crate::token::Token;

/// Completion flag bits, as reported by the kernel.
pub mod cqe_flags {
    /// Upper 16 bits carry a selected buffer id.
    pub const BUFFER: u32 = 1 << 0;
    /// The multishot request stays armed.
    pub const MORE: u32 = 1 << 1;
    pub const SOCK_NONEMPTY: u32 = 1 << 2;
    /// Zero-copy send notification: the buffer is reclaimable.
    pub const NOTIF: u32 = 1 << 3;
    pub const BUFFER_SHIFT: u32 = 16;
}

/// One completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    /// Operation result, or negative errno.
    pub result: i32,
    pub flags: u32,
}

impl Completion {
    pub fn new(token: Token, result: i32, flags: u32) -> Self {
        Self { token, result, flags }
    }

    #[inline]
    pub fn more(&self) -> bool {
        self.flags & cqe_flags::MORE != 0
    }

    #[inline]
    pub fn is_notif(&self) -> bool {
        self.flags & cqe_flags::NOTIF != 0
    }

    /// Buffer id chosen by the kernel for a buffer-select receive.
    #[inline]
    pub fn buffer_id(&self) -> Option<u16> {
        if self.flags & cqe_flags::BUFFER != 0 {
            Some((self.flags >> cqe_flags::BUFFER_SHIFT) as u16)
        } else {
            None
        }
    }

    /// `-errno` as an `io::Error`, if the result is negative.
    pub fn error(&self) -> Option<io::Error> {
        (self.result < 0).then(|| io::Error::from_raw_os_error(-self.result))
    }
}

pub trait IoBackend {
    /// Descriptor of this ring, used as the target of ring-to-ring messages.
    fn ring_fd(&self) -> RawFd;

    /// Push queued entries to the kernel without waiting.
    fn submit(&mut self) -> Result<usize>;

    /// Push queued entries and block until `want` completions are ready.
    ///
    /// Returns the raw error so the caller can retry on `EINTR`.
    fn submit_and_wait(&mut self, want: usize) -> io::Result<usize>;

    /// Move every ready completion into `out`, in kernel order.
    fn drain_completions(&mut self, out: &mut Vec<Completion>) -> usize;

    /// Multishot accept on a plain listening descriptor, allocating a direct slot per peer.
    fn prep_accept_multishot(&mut self, listen_fd: RawFd, token: Token) -> Result<()>;

    /// Send direct slot `slot` into `target_ring`'s table, then close our copy.
    ///
    /// The target ring receives a completion carrying `token` with the new
    /// slot as its result. The close is linked and carries `close_token`.
    fn prep_fd_pass(
        &mut self,
        target_ring: RawFd,
        slot: u32,
        token: Token,
        close_token: Token,
    ) -> Result<()>;

    /// Multishot receive with kernel buffer selection from group `bgid`.
    fn prep_recv_multishot(&mut self, slot: u32, bgid: u16, token: Token) -> Result<()>;

    /// Zero-copy send from registered buffer `buf_index`.
    ///
    /// With `link`, the next queued entry runs only after this one succeeds.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` must lie inside registered buffer `buf_index` and stay
    /// untouched until the notification completion arrives.
    unsafe fn prep_send_zc(
        &mut self,
        slot: u32,
        buf: *const u8,
        len: u32,
        buf_index: u16,
        token: Token,
        link: bool,
    ) -> Result<()>;

    /// Cancel every in-flight request on direct slot `slot`.
    fn prep_cancel_fd(&mut self, slot: u32, token: Token) -> Result<()>;

    /// Linked `shutdown(SHUT_RDWR)` (completion skipped on success) then close.
    fn prep_shutdown_close(
        &mut self,
        slot: u32,
        shutdown_token: Token,
        close_token: Token,
    ) -> Result<()>;

    fn prep_close(&mut self, slot: u32, token: Token) -> Result<()>;

    /// Post a completion carrying `data` and `result` on `target_ring`.
    ///
    /// Our own completion carries `token` and is only posted on failure.
    fn prep_msg_ring(
        &mut self,
        target_ring: RawFd,
        data: Token,
        result: i32,
        token: Token,
    ) -> Result<()>;

    /// One-shot timeout that fires at `deadline` on the monotonic clock.
    fn prep_timeout_at(&mut self, deadline: Instant, token: Token) -> Result<()>;

    /// Register a provided-buffer ring under `bgid`.
    ///
    /// # Safety
    ///
    /// `ring_addr` must point at `entries` page-aligned ring entries that
    /// outlive the registration.
    unsafe fn register_buf_ring(&mut self, ring_addr: u64, entries: u16, bgid: u16) -> Result<()>;

    /// Reserve `nr` empty slots in the fixed buffer table.
    fn register_send_table(&mut self, nr: u32) -> Result<()>;

    /// Fill fixed buffer slots starting at `offset`.
    ///
    /// # Safety
    ///
    /// Every iovec must stay valid until the table is torn down.
    unsafe fn register_send_buffers(
        &mut self,
        offset: u32,
        iovecs: &[libc::iovec],
        tags: &[u64],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Op;

    #[test]
    fn test_completion_flags() {
        let t = Token::new(Op::Recv, 1, 2, 0);
        let c = Completion::new(t, 64, cqe_flags::BUFFER | cqe_flags::MORE | (37 << 16));
        assert!(c.more());
        assert_eq!(c.buffer_id(), Some(37));
        assert!(!c.is_notif());
        assert!(c.error().is_none());

        let c = Completion::new(t, -libc::ENOBUFS, 0);
        assert_eq!(c.buffer_id(), None);
        assert_eq!(c.error().and_then(|e| e.raw_os_error()), Some(libc::ENOBUFS));
    }
}
