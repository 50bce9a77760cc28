//! The io_uring implementation of [`IoBackend`].
//!
//! One ring per thread. Every connection descriptor lives in the ring's
//! sparse direct-descriptor table and is addressed by slot.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use io_uring::squeue::{self, Entry};
use io_uring::types::{self, Fd, Fixed};
use io_uring::{opcode, IoUring};
use tracing::{debug, warn};

use jdocs_core::error::{Error, Result};
use jdocs_core::io_backend::{Completion, IoBackend};
use jdocs_core::token::Token;

/// Ring sizing.
#[derive(Debug, Clone, Copy)]
pub struct UringConfig {
    /// Submission queue entries. Must be a power of two.
    pub sq_entries: u32,
    /// Direct descriptor slots.
    pub fd_table_size: u32,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self { sq_entries: 2048, fd_table_size: 2048 }
    }
}

pub struct UringBackend {
    ring: IoUring,
    /// Deadline of the outstanding timeout; read by the kernel at submit.
    timeout: Box<types::Timespec>,
}

impl UringBackend {
    pub fn new(config: UringConfig) -> Result<Self> {
        let ring = Self::build(config.sq_entries).map_err(Error::RingSetup)?;
        ring.submitter()
            .register_files_sparse(config.fd_table_size)
            .map_err(|source| Error::Registration { what: "direct descriptor table", source })?;
        debug!(
            ring_fd = ring.as_raw_fd(),
            sq_entries = config.sq_entries,
            fd_table = config.fd_table_size,
            "io_uring ready"
        );
        Ok(Self { ring, timeout: Box::new(types::Timespec::new()) })
    }

    fn build(sq_entries: u32) -> io::Result<IoUring> {
        let cq_entries = sq_entries.checked_mul(2).unwrap_or(sq_entries);
        let mut builder = IoUring::builder();
        builder
            .setup_cqsize(cq_entries)
            .setup_coop_taskrun()
            .setup_single_issuer()
            .setup_defer_taskrun();
        match builder.build(sq_entries) {
            Ok(ring) => Ok(ring),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                // Pre-6.1 kernels reject DEFER_TASKRUN.
                warn!("io_uring taskrun flags unsupported, using defaults");
                IoUring::builder().setup_cqsize(cq_entries).build(sq_entries)
            }
            Err(e) => Err(e),
        }
    }

    /// # Safety
    /// Memory referenced by `entry` must stay valid until the kernel consumes it.
    unsafe fn push(&mut self, entry: Entry) -> Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit().map_err(Error::Submit)?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| Error::Submit(io::Error::other("SQ still full after submit")))?;
            }
        }
        Ok(())
    }

    /// Push a linked pair contiguously.
    ///
    /// # Safety
    /// Same contract as [`Self::push`].
    unsafe fn push_pair(&mut self, first: Entry, second: Entry) -> Result<()> {
        let pair = [first.flags(squeue::Flags::IO_LINK), second];
        let room = {
            let sq = self.ring.submission();
            sq.capacity() - sq.len()
        };
        if room < pair.len() {
            self.ring.submit().map_err(Error::Submit)?;
        }
        unsafe {
            self.ring
                .submission()
                .push_multiple(&pair)
                .map_err(|_| Error::Submit(io::Error::other("SQ too small for linked pair")))?;
        }
        Ok(())
    }
}

/// Current CLOCK_MONOTONIC reading plus the time left until `deadline`.
fn monotonic_deadline(deadline: Instant) -> types::Timespec {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // CLOCK_MONOTONIC is the clock behind `Instant` on Linux.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    let left = deadline.saturating_duration_since(Instant::now());
    let mut sec = now.tv_sec as u64 + left.as_secs();
    let mut nsec = now.tv_nsec as u64 + left.subsec_nanos() as u64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    types::Timespec::new().sec(sec).nsec(nsec as u32)
}

impl IoBackend for UringBackend {
    fn ring_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    fn submit(&mut self) -> Result<usize> {
        self.ring.submit().map_err(Error::Submit)
    }

    fn submit_and_wait(&mut self, want: usize) -> io::Result<usize> {
        self.ring.submit_and_wait(want)
    }

    fn drain_completions(&mut self, out: &mut Vec<Completion>) -> usize {
        let before = out.len();
        // Dropping the queue advances the shared head past everything read.
        out.extend(
            self.ring
                .completion()
                .map(|cqe| Completion::new(Token(cqe.user_data()), cqe.result(), cqe.flags())),
        );
        out.len() - before
    }

    fn prep_accept_multishot(&mut self, listen_fd: RawFd, token: Token) -> Result<()> {
        let entry = opcode::AcceptMulti::new(Fd(listen_fd))
            .allocate_file_index(true)
            .build()
            .user_data(token.0);
        unsafe { self.push(entry) }
    }

    fn prep_fd_pass(
        &mut self,
        target_ring: RawFd,
        slot: u32,
        token: Token,
        close_token: Token,
    ) -> Result<()> {
        let pass = opcode::MsgRingSendFd::new(
            Fd(target_ring),
            Fixed(slot),
            types::DestinationSlot::auto_target(),
            token.0,
        )
        .build()
        .user_data(token.0);
        let close = opcode::Close::new(Fixed(slot)).build().user_data(close_token.0);
        unsafe { self.push_pair(pass, close) }
    }

    fn prep_recv_multishot(&mut self, slot: u32, bgid: u16, token: Token) -> Result<()> {
        let entry = opcode::RecvMulti::new(Fixed(slot), bgid).build().user_data(token.0);
        unsafe { self.push(entry) }
    }

    unsafe fn prep_send_zc(
        &mut self,
        slot: u32,
        buf: *const u8,
        len: u32,
        buf_index: u16,
        token: Token,
        link: bool,
    ) -> Result<()> {
        let mut entry = opcode::SendZc::new(Fixed(slot), buf, len)
            .buf_index(Some(buf_index))
            .flags(libc::MSG_WAITALL | libc::MSG_NOSIGNAL)
            .build()
            .user_data(token.0);
        if link {
            entry = entry.flags(squeue::Flags::IO_LINK);
        }
        unsafe { self.push(entry) }
    }

    fn prep_cancel_fd(&mut self, slot: u32, token: Token) -> Result<()> {
        let entry = opcode::AsyncCancel2::new(types::CancelBuilder::fd(Fixed(slot)).all())
            .build()
            .user_data(token.0);
        unsafe { self.push(entry) }
    }

    fn prep_shutdown_close(
        &mut self,
        slot: u32,
        shutdown_token: Token,
        close_token: Token,
    ) -> Result<()> {
        let shutdown = opcode::Shutdown::new(Fixed(slot), libc::SHUT_RDWR)
            .build()
            .user_data(shutdown_token.0)
            .flags(squeue::Flags::SKIP_SUCCESS);
        let close = opcode::Close::new(Fixed(slot)).build().user_data(close_token.0);
        unsafe { self.push_pair(shutdown, close) }
    }

    fn prep_close(&mut self, slot: u32, token: Token) -> Result<()> {
        let entry = opcode::Close::new(Fixed(slot)).build().user_data(token.0);
        unsafe { self.push(entry) }
    }

    fn prep_msg_ring(
        &mut self,
        target_ring: RawFd,
        data: Token,
        result: i32,
        token: Token,
    ) -> Result<()> {
        let entry = opcode::MsgRingData::new(Fd(target_ring), result, data.0, None)
            .build()
            .user_data(token.0)
            .flags(squeue::Flags::SKIP_SUCCESS);
        unsafe { self.push(entry) }
    }

    fn prep_timeout_at(&mut self, deadline: Instant, token: Token) -> Result<()> {
        *self.timeout = monotonic_deadline(deadline);
        let ts: *const types::Timespec = &*self.timeout;
        let entry = opcode::Timeout::new(ts)
            .flags(types::TimeoutFlags::ABS)
            .build()
            .user_data(token.0);
        unsafe { self.push(entry) }
    }

    unsafe fn register_buf_ring(&mut self, ring_addr: u64, entries: u16, bgid: u16) -> Result<()> {
        unsafe {
            self.ring
                .submitter()
                .register_buf_ring_with_flags(ring_addr, entries, bgid, 0)
                .map_err(|source| Error::Registration { what: "provided buffer ring", source })
        }
    }

    fn register_send_table(&mut self, nr: u32) -> Result<()> {
        self.ring
            .submitter()
            .register_buffers_sparse(nr)
            .map_err(|source| Error::Registration { what: "fixed buffer table", source })
    }

    unsafe fn register_send_buffers(
        &mut self,
        offset: u32,
        iovecs: &[libc::iovec],
        tags: &[u64],
    ) -> Result<()> {
        unsafe {
            self.ring
                .submitter()
                .register_buffers_update(offset, iovecs, Some(tags))
                .map_err(|source| Error::Registration { what: "fixed buffers", source })
        }
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        debug!(ring_fd = self.ring.as_raw_fd(), "io_uring closed");
    }
}
