//! The per-thread reactor.
//!
//! Two flavors share one loop body. The listener owns the accept socket and
//! never owns a connection; it hands every accepted descriptor to the worker
//! that owns the new connection id. Workers own connections, buffer pools
//! and a timer wheel, none of which are ever touched by another thread.
//!
//! One pass: submit queued entries, block for at least one completion, drain
//! every ready completion and dispatch it by the op code in its token.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use jdocs_core::constants::RECV_BUFFER_GROUP;
use jdocs_core::error::{Error, Result};
use jdocs_core::io_backend::{Completion, IoBackend};
use jdocs_core::registry::ConnIdAllocator;
use jdocs_core::timer::TimerWheel;
use jdocs_core::token::{Op, Token};

use crate::buffer::{BufferPool, SendBuffers};
use crate::connection::{ConnIo, Connection, Stage};
use crate::protocol::{Protocol, ProtocolHandler};
use crate::server::Shared;

/// Counters kept by a worker, logged when its loop stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopStats {
    pub accepted: u64,
    pub closed: u64,
    pub recv_grows: u64,
    pub timeouts: u64,
    pub cross_msgs: u64,
}

struct ListenerState {
    listen_fd: RawFd,
    ids: ConnIdAllocator,
}

struct WorkerState {
    index: usize,
    pool: BufferPool,
    wheel: TimerWheel<u32>,
    conns: HashMap<u32, Connection>,
    fired: Vec<u32>,
    stats: LoopStats,
    /// Set once the receive pool hit its cap and that was logged.
    recv_exhausted: bool,
}

enum Flavor {
    Listener(ListenerState),
    Worker(Box<WorkerState>),
}

pub struct EventLoop<B: IoBackend> {
    backend: B,
    flavor: Flavor,
    shared: Arc<Shared>,
    completions: Vec<Completion>,
}

impl<B: IoBackend> EventLoop<B> {
    pub fn listener(backend: B, shared: Arc<Shared>, listen_fd: RawFd) -> Self {
        Self {
            backend,
            flavor: Flavor::Listener(ListenerState { listen_fd, ids: ConnIdAllocator::new() }),
            shared,
            completions: Vec::with_capacity(256),
        }
    }

    /// Build a worker loop. Registers the buffer pools with `backend`.
    pub fn worker(mut backend: B, index: usize, shared: Arc<Shared>) -> Result<Self> {
        let pool = BufferPool::new(&mut backend)?;
        let wheel = TimerWheel::new(shared.config.tick);
        let state = WorkerState {
            index,
            pool,
            wheel,
            conns: HashMap::new(),
            fired: Vec::new(),
            stats: LoopStats::default(),
            recv_exhausted: false,
        };
        Ok(Self {
            backend,
            flavor: Flavor::Worker(Box::new(state)),
            shared,
            completions: Vec::with_capacity(256),
        })
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.flavor, Flavor::Worker(_))
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn connection(&self, id: u32) -> Option<&Connection> {
        match &self.flavor {
            Flavor::Worker(w) => w.conns.get(&id),
            Flavor::Listener(_) => None,
        }
    }

    pub fn connection_count(&self) -> usize {
        match &self.flavor {
            Flavor::Worker(w) => w.conns.len(),
            Flavor::Listener(_) => 0,
        }
    }

    pub fn stats(&self) -> LoopStats {
        match &self.flavor {
            Flavor::Worker(w) => w.stats,
            Flavor::Listener(_) => LoopStats::default(),
        }
    }

    /// Queue the first operation: the accept or the recurring timeout.
    pub fn arm(&mut self) -> Result<()> {
        match &self.flavor {
            Flavor::Listener(l) => {
                self.backend.prep_accept_multishot(l.listen_fd, Token::new(Op::Accept, 0, 0, 0))
            }
            Flavor::Worker(w) => self.backend.prep_timeout_at(w.wheel.next_deadline(), timeout_token()),
        }
    }

    /// Loop until the shared running flag clears or something fatal happens.
    pub fn run(&mut self) -> Result<()> {
        self.arm()?;
        info!(worker = self.is_worker(), ring_fd = self.backend.ring_fd(), "event loop started");
        while self.shared.is_running() {
            match self.backend.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                // Completion queue overflow; draining below frees room.
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {}
                Err(e) => return Err(Error::Wait(e)),
            }
            self.poll()?;
        }
        if let Flavor::Worker(w) = &self.flavor {
            info!(worker = w.index, connections = w.conns.len(), stats = ?w.stats, "event loop stopped");
        }
        Ok(())
    }

    /// Drain and dispatch every ready completion. Returns how many there were.
    pub fn poll(&mut self) -> Result<usize> {
        let mut batch = std::mem::take(&mut self.completions);
        batch.clear();
        let n = self.backend.drain_completions(&mut batch);
        let mut result = Ok(n);
        for c in batch.drain(..) {
            if let Err(e) = self.dispatch(c) {
                result = Err(e);
                break;
            }
        }
        batch.clear();
        self.completions = batch;
        result
    }

    fn dispatch(&mut self, c: Completion) -> Result<()> {
        let Some(op) = c.token.op() else {
            return Err(Error::UnknownOp(c.token.op_code()));
        };
        trace!(op = op.name(), conn_id = c.token.conn_id(), res = c.result, flags = c.flags, "completion");
        match &mut self.flavor {
            Flavor::Listener(l) => on_listener(&mut self.backend, l, &self.shared, op, c),
            Flavor::Worker(w) => on_worker(&mut self.backend, w, &self.shared, op, c),
        }
    }
}

#[inline]
fn timeout_token() -> Token {
    Token::new(Op::Timeout, 0, 0, 0)
}

#[inline]
fn errno(c: &Completion) -> i32 {
    -c.result
}

// ── Listener ──

fn on_listener<B: IoBackend>(
    backend: &mut B,
    l: &mut ListenerState,
    shared: &Shared,
    op: Op,
    c: Completion,
) -> Result<()> {
    match op {
        Op::Accept => {
            if c.result < 0 {
                return Err(Error::completion("accept", c.result));
            }
            let slot = c.result as u32;
            let id = l.ids.next_id();
            let owner = shared.router.owner_of(id);
            let Some(&ring) = shared.ring_fds.get(owner) else {
                warn!(conn_id = id, owner, "no ring for owner; dropping connection");
                return backend.prep_close(slot, Token::new(Op::Close, id, slot, 0));
            };
            debug!(conn_id = id, slot, worker = owner, "accepted");
            backend.prep_fd_pass(
                ring,
                slot,
                Token::new(Op::FdPass, id, slot, 0),
                Token::new(Op::Close, id, slot, 0),
            )?;
            if !c.more() {
                backend.prep_accept_multishot(l.listen_fd, Token::new(Op::Accept, 0, 0, 0))?;
            }
            Ok(())
        }
        Op::FdPass => {
            // Success is the worker's business; a failed hand-off leaves our slot open.
            if c.result < 0 {
                let slot = c.token.fd();
                warn!(conn_id = c.token.conn_id(), slot, error = %io_err(&c), "fd hand-off failed");
                backend.prep_close(slot, Token::new(Op::Close, c.token.conn_id(), slot, 0))?;
            }
            Ok(())
        }
        Op::Close => {
            if c.result < 0 && errno(&c) != libc::ECANCELED {
                warn!(slot = c.token.fd(), error = %io_err(&c), "listener slot close failed");
            }
            Ok(())
        }
        Op::Nop => {
            if c.result < 0 {
                warn!(error = %io_err(&c), "no-op failed");
            }
            Ok(())
        }
        other => Err(Error::WrongLoop(other.name())),
    }
}

// ── Worker ──

fn on_worker<B: IoBackend>(
    backend: &mut B,
    w: &mut WorkerState,
    shared: &Shared,
    op: Op,
    c: Completion,
) -> Result<()> {
    match op {
        Op::FdPass => on_fd_pass(backend, w, shared, c),
        Op::Recv => on_recv(backend, w, shared, c),
        Op::SendZc => on_send(backend, w, shared, c),
        Op::Cancel => {
            let id = c.token.conn_id();
            let slot = w.conns.get(&id).map_or(c.token.fd(), |conn| conn.meta.fd);
            backend.prep_shutdown_close(
                slot,
                Token::new(Op::Shutdown, id, slot, 0),
                Token::new(Op::Close, id, slot, 0),
            )
        }
        Op::Shutdown => {
            // Only failures are reported, and they cancel the linked close.
            let id = c.token.conn_id();
            let slot = c.token.fd();
            debug!(conn_id = id, error = %io_err(&c), "shutdown failed; closing anyway");
            backend.prep_close(slot, Token::new(Op::Close, id, slot, 0))
        }
        Op::Close => {
            if c.result < 0 {
                if errno(&c) == libc::ECANCELED {
                    return Ok(());
                }
                return Err(Error::completion("close", c.result));
            }
            let id = c.token.conn_id();
            let Some(mut conn) = w.conns.remove(&id) else {
                return Ok(());
            };
            let left = with_handler(backend, &mut w.pool.send, shared, &mut conn, |p, io| p.on_close(io));
            if let Some(user) = conn.meta.user_id {
                shared.directory.unbind(user, id);
            }
            w.stats.closed += 1;
            debug!(
                conn_id = id,
                recv_bytes = conn.meta.recv_bytes,
                sent_bytes = conn.meta.sent_bytes,
                "connection removed"
            );
            left
        }
        Op::CrossMsg => on_cross_msg(backend, w, shared),
        Op::Timeout => on_timeout(backend, w, shared, c),
        Op::Nop => {
            if c.result < 0 {
                warn!(conn_id = c.token.conn_id(), error = %io_err(&c), "ring message failed");
            }
            Ok(())
        }
        Op::Accept | Op::Send | Op::BufRelease => Err(Error::WrongLoop(op.name())),
    }
}

fn on_fd_pass<B: IoBackend>(backend: &mut B, w: &mut WorkerState, shared: &Shared, c: Completion) -> Result<()> {
    let id = c.token.conn_id();
    if c.result < 0 {
        if errno(&c) == libc::ENFILE {
            warn!(conn_id = id, "descriptor table full; connection dropped");
            return Ok(());
        }
        return Err(Error::completion("fd pass", c.result));
    }
    let slot = c.result as u32;
    let timer = w.wheel.timer(id);
    timer.arm(shared.config.idle_timeout);
    let conn = Connection::new(id, slot, timer);
    backend.prep_recv_multishot(slot, RECV_BUFFER_GROUP, Token::new(Op::Recv, id, slot, 0))?;
    if let Some(old) = w.conns.insert(id, conn) {
        warn!(conn_id = id, old_slot = old.meta.fd, "connection id reused");
    }
    w.stats.accepted += 1;
    debug!(conn_id = id, slot, worker = w.index, "connection registered");
    Ok(())
}

fn on_recv<B: IoBackend>(backend: &mut B, w: &mut WorkerState, shared: &Shared, c: Completion) -> Result<()> {
    let id = c.token.conn_id();
    let bid = c.buffer_id();
    let Some(conn) = w.conns.get_mut(&id) else {
        if let Some(bid) = bid {
            w.pool.recv.replenish(bid);
        }
        return Ok(());
    };

    if c.result < 0 {
        match errno(&c) {
            libc::ENOBUFS => {
                if !w.pool.recv.grow()? {
                    // Nothing left to provide; resubmitting would only spin.
                    if !w.recv_exhausted {
                        w.recv_exhausted = true;
                        warn!(worker = w.index, buffers = w.pool.recv.len(), "receive pool at capacity");
                    }
                    debug!(conn_id = id, "no receive buffers; closing");
                    conn.close(backend)?;
                    return Ok(());
                }
                w.stats.recv_grows += 1;
                if !conn.is_closed() {
                    let slot = conn.meta.fd;
                    backend.prep_recv_multishot(slot, RECV_BUFFER_GROUP, Token::new(Op::Recv, id, slot, 0))?;
                }
            }
            libc::ECANCELED => {}
            _ => {
                debug!(conn_id = id, error = %io_err(&c), "receive failed");
                conn.close(backend)?;
            }
        }
        return Ok(());
    }

    let Some(bid) = bid else {
        // End of stream.
        trace!(conn_id = id, "peer closed");
        conn.close(backend)?;
        return Ok(());
    };

    if !conn.is_closed() {
        conn.timer.arm(shared.config.idle_timeout);
        conn.meta.recv_bytes += c.result as u64;
        if let Some(data) = w.pool.recv.get(bid, c.result as usize) {
            with_handler(backend, &mut w.pool.send, shared, conn, |p, io| p.on_recv(io, data))?;
        } else {
            warn!(conn_id = id, bid, "completion names an unknown receive buffer");
        }
    }
    w.pool.recv.replenish(bid);

    if !c.more() && !conn.is_closed() {
        let slot = conn.meta.fd;
        backend.prep_recv_multishot(slot, RECV_BUFFER_GROUP, Token::new(Op::Recv, id, slot, 0))?;
    }
    Ok(())
}

fn on_send<B: IoBackend>(backend: &mut B, w: &mut WorkerState, shared: &Shared, c: Completion) -> Result<()> {
    let buf = c.token.buf_id() as u16;
    if c.is_notif() {
        w.pool.send.release(buf);
        return Ok(());
    }
    // No notification follows when the kernel did not set MORE.
    if !c.more() {
        w.pool.send.release(buf);
    }

    let id = c.token.conn_id();
    let Some(conn) = w.conns.get_mut(&id) else {
        return Ok(());
    };
    if c.result < 0 {
        if !(conn.is_closed() && errno(&c) == libc::ECANCELED) {
            debug!(conn_id = id, error = %io_err(&c), "send failed");
        }
        conn.close(backend)?;
        return Ok(());
    }
    let sent = c.result as usize;
    conn.meta.sent_bytes += sent as u64;
    if conn.is_closed() {
        return Ok(());
    }
    with_handler(backend, &mut w.pool.send, shared, conn, |p, io| p.on_send(io, sent))
}

fn on_cross_msg<B: IoBackend>(backend: &mut B, w: &mut WorkerState, shared: &Shared) -> Result<()> {
    let Some(mailbox) = shared.mailboxes.get(w.index) else {
        return Ok(());
    };
    while let Some(delivery) = mailbox.pop() {
        w.stats.cross_msgs += 1;
        let dest = delivery.dest();
        let payload = delivery.payload_bytes();
        let outcome = match w.conns.get_mut(&dest) {
            Some(conn) if !conn.is_closed() && conn.meta.stage == Stage::WebSocket => {
                with_handler(backend, &mut w.pool.send, shared, conn, |p, io| p.on_message(io, &payload))
            }
            _ => {
                trace!(conn_id = dest, sender = delivery.sender(), "no open websocket for message");
                Ok(())
            }
        };
        // Released on every path, before any error propagates.
        let release = delivery.release();
        trace!(conn_id = dest, ?release, "envelope released");
        outcome?;
    }
    Ok(())
}

fn on_timeout<B: IoBackend>(backend: &mut B, w: &mut WorkerState, shared: &Shared, c: Completion) -> Result<()> {
    if errno(&c) != libc::ETIME {
        return Err(Error::completion("timeout", c.result));
    }
    let mut fired = std::mem::take(&mut w.fired);
    w.wheel.update(Instant::now(), &mut fired);
    for id in fired.drain(..) {
        let Some(conn) = w.conns.get_mut(&id) else {
            continue;
        };
        if conn.is_closed() {
            continue;
        }
        w.stats.timeouts += 1;
        debug!(conn_id = id, "idle timeout");
        with_handler(backend, &mut w.pool.send, shared, conn, |p, io| p.on_timeout(io))?;
    }
    w.fired = fired;
    backend.prep_timeout_at(w.wheel.next_deadline(), timeout_token())
}

/// Run one handler callback and apply any stage transition it requested.
fn with_handler<B, F>(
    backend: &mut B,
    send: &mut SendBuffers,
    shared: &Shared,
    conn: &mut Connection,
    f: F,
) -> Result<()>
where
    B: IoBackend,
    F: FnOnce(&mut Protocol, &mut ConnIo<'_, B>) -> Result<()>,
{
    let Connection { meta, protocol, timer } = conn;
    let mut io = ConnIo::new(backend, send, meta, timer, shared);
    let result = f(protocol, &mut io);
    if let Some(next) = io.take_upgrade() {
        *protocol = next;
    }
    result
}

fn io_err(c: &Completion) -> std::io::Error {
    c.error().unwrap_or_else(|| std::io::Error::from_raw_os_error(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{mask_frame, opcode};
    use crate::testing::{Prepped, RecordingBackend};
    use jdocs_core::config::ServerConfig;
    use jdocs_core::envelope::{Envelope, Release};
    use jdocs_core::io_backend::cqe_flags;
    use bytes::Bytes;
    use std::time::Duration;

    const RING: RawFd = 100;

    fn shared(workers: usize) -> Arc<Shared> {
        let rings = (0..workers).map(|i| RING + i as RawFd).collect();
        Arc::new(Shared::new(ServerConfig::new(), rings))
    }

    fn worker() -> EventLoop<RecordingBackend> {
        EventLoop::worker(RecordingBackend::new(RING), 0, shared(1)).unwrap()
    }

    fn feed(el: &mut EventLoop<RecordingBackend>, c: Completion) {
        el.backend_mut().ready.push_back(c);
        el.poll().unwrap();
    }

    fn buffer_flags(bid: u16, more: bool) -> u32 {
        let mut flags = cqe_flags::BUFFER | ((bid as u32) << cqe_flags::BUFFER_SHIFT);
        if more {
            flags |= cqe_flags::MORE;
        }
        flags
    }

    /// Register connection `id` on slot `slot` as a freshly handed-off descriptor.
    fn open(el: &mut EventLoop<RecordingBackend>, id: u32, slot: i32) {
        feed(el, Completion::new(Token::new(Op::FdPass, id, 3, 0), slot, 0));
    }

    fn upgrade(el: &mut EventLoop<RecordingBackend>, id: u32, user: u32) {
        upgrade_to(el, id, &format!("/?user_id={user}"));
    }

    fn upgrade_to(el: &mut EventLoop<RecordingBackend>, id: u32, target: &str) {
        let req = format!(
            "GET {target} HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        recv(el, id, 0, req.as_bytes());
    }

    /// Copy `data` into receive buffer `bid` and complete a receive with it.
    fn recv(el: &mut EventLoop<RecordingBackend>, id: u32, bid: u16, data: &[u8]) {
        if let Flavor::Worker(w) = &mut el.flavor {
            w.pool.recv.fill(bid, data);
        }
        let slot = el.connection(id).map_or(0, |c| c.meta.fd);
        feed(el, Completion::new(Token::new(Op::Recv, id, slot, 0), data.len() as i32, buffer_flags(bid, true)));
    }

    #[test]
    fn test_unknown_op_is_fatal() {
        let mut el = worker();
        el.backend_mut().ready.push_back(Completion::new(Token(0xF << 60), 0, 0));
        assert!(matches!(el.poll(), Err(Error::UnknownOp(15))));
    }

    #[test]
    fn test_worker_arms_timeout_listener_arms_accept() {
        let mut el = worker();
        el.arm().unwrap();
        assert!(matches!(el.backend().prepped[..], [Prepped::TimeoutAt { .. }]));

        let mut l = EventLoop::listener(RecordingBackend::new(7), shared(2), 9);
        l.arm().unwrap();
        assert!(matches!(l.backend().prepped[..], [Prepped::AcceptMultishot { listen_fd: 9, .. }]));
    }

    #[test]
    fn test_run_exits_when_not_running() {
        let s = shared(1);
        s.running.store(false, std::sync::atomic::Ordering::Release);
        let mut el = EventLoop::worker(RecordingBackend::new(RING), 0, s).unwrap();
        assert!(el.run().is_ok());
    }

    #[test]
    fn test_run_fails_on_wait_error() {
        // The recording backend reports ETIME when it has nothing queued.
        let mut el = worker();
        assert!(matches!(el.run(), Err(Error::Wait(_))));
    }

    #[test]
    fn test_accept_routes_to_owner_ring() {
        let mut l = EventLoop::listener(RecordingBackend::new(7), shared(3), 9);
        for slot in 0..4 {
            l.backend_mut().ready.push_back(Completion::new(Token::new(Op::Accept, 0, 0, 0), slot, cqe_flags::MORE));
        }
        l.poll().unwrap();

        let passes: Vec<_> = l
            .backend()
            .prepped
            .iter()
            .map(|p| match p {
                Prepped::FdPass { target_ring, slot, token, close_token } => {
                    assert_eq!(close_token.op(), Some(Op::Close));
                    assert_eq!(close_token.fd(), *slot);
                    (*target_ring, token.conn_id())
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // ids start at 1
        assert_eq!(passes, vec![(RING + 1, 1), (RING + 2, 2), (RING, 3), (RING + 1, 4)]);
    }

    #[test]
    fn test_accept_rearms_without_more() {
        let mut l = EventLoop::listener(RecordingBackend::new(7), shared(1), 9);
        feed(&mut l, Completion::new(Token::new(Op::Accept, 0, 0, 0), 4, 0));
        assert_eq!(l.backend().count(Op::FdPass), 1);
        assert_eq!(l.backend().count(Op::Accept), 1);
    }

    #[test]
    fn test_accept_error_is_fatal() {
        let mut l = EventLoop::listener(RecordingBackend::new(7), shared(1), 9);
        l.backend_mut().ready.push_back(Completion::new(Token::new(Op::Accept, 0, 0, 0), -libc::EBADF, 0));
        assert!(matches!(l.poll(), Err(Error::Completion { op: "accept", .. })));
    }

    #[test]
    fn test_listener_closes_slot_after_failed_hand_off() {
        let mut l = EventLoop::listener(RecordingBackend::new(7), shared(1), 9);
        feed(&mut l, Completion::new(Token::new(Op::FdPass, 5, 12, 0), -libc::EINVAL, 0));
        assert!(matches!(l.backend().prepped[..], [Prepped::Close { slot: 12, .. }]));
    }

    #[test]
    fn test_recv_on_listener_is_wrong_loop() {
        let mut l = EventLoop::listener(RecordingBackend::new(7), shared(1), 9);
        l.backend_mut().ready.push_back(Completion::new(Token::new(Op::Recv, 1, 1, 0), 0, 0));
        assert!(matches!(l.poll(), Err(Error::WrongLoop("recv"))));
    }

    #[test]
    fn test_fd_pass_registers_connection() {
        let mut el = worker();
        open(&mut el, 42, 17);
        let conn = el.connection(42).unwrap();
        assert_eq!(conn.meta.fd, 17);
        assert!(conn.timer.is_pending());
        assert!(matches!(
            el.backend().prepped[..],
            [Prepped::RecvMultishot { slot: 17, bgid: RECV_BUFFER_GROUP, .. }]
        ));
    }

    #[test]
    fn test_fd_pass_table_full_is_warning() {
        let mut el = worker();
        feed(&mut el, Completion::new(Token::new(Op::FdPass, 1, 3, 0), -libc::ENFILE, 0));
        assert_eq!(el.connection_count(), 0);

        el.backend_mut().ready.push_back(Completion::new(Token::new(Op::FdPass, 1, 3, 0), -libc::EINVAL, 0));
        assert!(el.poll().is_err());
    }

    #[test]
    fn test_teardown_sequence_runs_once() {
        let mut el = worker();
        open(&mut el, 1, 8);
        el.backend_mut().take();

        // Peer closes: end of stream has no buffer flag.
        feed(&mut el, Completion::new(Token::new(Op::Recv, 1, 8, 0), 0, 0));
        // A late failed receive must not start a second teardown.
        feed(&mut el, Completion::new(Token::new(Op::Recv, 1, 8, 0), -libc::ECONNRESET, 0));
        assert_eq!(el.backend().count(Op::Cancel), 1);
        assert!(el.connection(1).unwrap().is_closed());
        assert!(!el.connection(1).unwrap().timer.is_pending());

        feed(&mut el, Completion::new(Token::new(Op::Cancel, 1, 8, 0), 0, 0));
        match el.backend().prepped.last() {
            Some(Prepped::ShutdownClose { slot: 8, shutdown_token, close_token }) => {
                assert_eq!(shutdown_token.op(), Some(Op::Shutdown));
                assert_eq!(close_token.op(), Some(Op::Close));
            }
            other => panic!("unexpected {other:?}"),
        }

        feed(&mut el, Completion::new(Token::new(Op::Close, 1, 8, 0), 0, 0));
        assert!(el.connection(1).is_none());
        assert_eq!(el.stats().closed, 1);
    }

    #[test]
    fn test_failed_shutdown_still_closes() {
        let mut el = worker();
        open(&mut el, 1, 8);
        el.backend_mut().take();
        feed(&mut el, Completion::new(Token::new(Op::Shutdown, 1, 8, 0), -libc::ENOTCONN, 0));
        assert!(matches!(el.backend().prepped[..], [Prepped::Close { slot: 8, .. }]));
        // the linked close was cancelled
        feed(&mut el, Completion::new(Token::new(Op::Close, 1, 8, 0), -libc::ECANCELED, 0));
        assert!(el.connection(1).is_some());
    }

    #[test]
    fn test_close_failure_is_fatal() {
        let mut el = worker();
        el.backend_mut().ready.push_back(Completion::new(Token::new(Op::Close, 1, 8, 0), -libc::EBADF, 0));
        assert!(matches!(el.poll(), Err(Error::Completion { op: "close", .. })));
    }

    #[test]
    fn test_enobufs_grows_and_resubmits() {
        let mut el = worker();
        open(&mut el, 1, 8);
        el.backend_mut().take();
        feed(&mut el, Completion::new(Token::new(Op::Recv, 1, 8, 0), -libc::ENOBUFS, 0));
        assert_eq!(el.stats().recv_grows, 1);
        if let Flavor::Worker(w) = &el.flavor {
            assert_eq!(w.pool.recv.len(), 2 * jdocs_core::constants::BUFFERS_PER_BLOCK);
        }
        assert!(matches!(el.backend().prepped[..], [Prepped::RecvMultishot { slot: 8, .. }]));
        assert!(!el.connection(1).unwrap().is_closed());
    }

    #[test]
    fn test_enobufs_at_capacity_closes_connection() {
        let mut el = worker();
        open(&mut el, 1, 8);
        open(&mut el, 2, 9);
        if let Flavor::Worker(w) = &mut el.flavor {
            while w.pool.recv.grow().unwrap() {}
        }
        el.backend_mut().take();

        feed(&mut el, Completion::new(Token::new(Op::Recv, 1, 8, 0), -libc::ENOBUFS, 0));
        feed(&mut el, Completion::new(Token::new(Op::Recv, 2, 9, 0), -libc::ENOBUFS, 0));
        assert!(el.connection(1).unwrap().is_closed());
        assert!(el.connection(2).unwrap().is_closed());
        assert_eq!(el.backend().count(Op::Recv), 0);
        assert_eq!(el.backend().count(Op::Cancel), 2);
        assert_eq!(el.stats().recv_grows, 0);
        if let Flavor::Worker(w) = &el.flavor {
            assert!(w.recv_exhausted);
        }
    }

    #[test]
    fn test_reserved_send_ops_are_wrong_loop() {
        for op in [Op::Send, Op::BufRelease] {
            let mut el = worker();
            el.backend_mut().ready.push_back(Completion::new(Token::new(op, 1, 8, 0), 0, 0));
            assert!(matches!(el.poll(), Err(Error::WrongLoop(_))));
        }
    }

    #[test]
    fn test_recv_upgrades_and_rearms_when_multishot_ends() {
        let mut el = worker();
        open(&mut el, 1, 8);
        el.backend_mut().take();
        upgrade(&mut el, 1, 33);
        assert_eq!(el.connection(1).unwrap().meta.stage, Stage::WebSocket);
        assert_eq!(el.shared.directory.lookup(33), Some(1));
        assert_eq!(el.backend().count(Op::SendZc), 1);
        assert_eq!(el.backend().count(Op::Recv), 0);

        // multishot terminated: a single buffer, no MORE flag
        let ping = mask_frame(true, opcode::PING, b"", [9, 9, 9, 9]);
        if let Flavor::Worker(w) = &mut el.flavor {
            w.pool.recv.fill(1, &ping);
        }
        feed(&mut el, Completion::new(Token::new(Op::Recv, 1, 8, 0), ping.len() as i32, buffer_flags(1, false)));
        assert_eq!(el.backend().count(Op::SendZc), 2);
        assert_eq!(el.backend().count(Op::Recv), 1);
        assert!(el.connection(1).unwrap().meta.recv_bytes > ping.len() as u64);
    }

    #[test]
    fn test_recv_for_unknown_connection_returns_buffer() {
        let mut el = worker();
        feed(&mut el, Completion::new(Token::new(Op::Recv, 99, 8, 0), 10, buffer_flags(3, true)));
        assert!(el.backend().prepped.is_empty());
    }

    #[test]
    fn test_send_zc_releases_on_notification() {
        let mut el = worker();
        open(&mut el, 1, 8);
        upgrade(&mut el, 1, 5);
        let (buf, token) = match el.backend().prepped.last() {
            Some(Prepped::SendZc { buf_index, token, .. }) => (*buf_index, *token),
            other => panic!("unexpected {other:?}"),
        };
        let checked_out = |el: &EventLoop<RecordingBackend>| match &el.flavor {
            Flavor::Worker(w) => w.pool.send.is_checked_out(buf),
            Flavor::Listener(_) => false,
        };
        assert!(checked_out(&el));

        feed(&mut el, Completion::new(token, 129, cqe_flags::MORE));
        assert!(checked_out(&el));
        assert_eq!(el.connection(1).unwrap().meta.sent_bytes, 129);

        feed(&mut el, Completion::new(token, 0, cqe_flags::NOTIF));
        assert!(!checked_out(&el));
    }

    #[test]
    fn test_send_failure_closes_connection() {
        let mut el = worker();
        open(&mut el, 1, 8);
        feed(&mut el, Completion::new(Token::new(Op::SendZc, 1, 8, 0), -libc::EPIPE, 0));
        assert!(el.connection(1).unwrap().is_closed());
    }

    #[test]
    fn test_cross_msg_delivers_and_releases() {
        let mut el = worker();
        open(&mut el, 1, 8);
        open(&mut el, 2, 9);
        upgrade(&mut el, 1, 10);
        el.backend_mut().take();

        let mut deliveries = Envelope::new(7, Bytes::from_static(b"{\"hi\":1}"), &[1, 2, 3]);
        let watch = deliveries.pop().unwrap();
        for d in deliveries {
            el.shared.mailboxes[0].push(d);
        }
        feed(&mut el, Completion::new(Token::new(Op::CrossMsg, 1, 0, 0), 0, 0));

        // conn 1 is a websocket, conn 2 still http: only one frame goes out
        match &el.backend().prepped[..] {
            [Prepped::SendZc { data, .. }] => assert_eq!(&data[2..], b"{\"hi\":1}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(el.shared.mailboxes[0].is_empty());
        assert_eq!(watch.pending(), 1);
        assert_eq!(watch.release(), Release::Last);
        assert_eq!(el.stats().cross_msgs, 2);
    }

    #[test]
    fn test_cross_msg_to_closing_connection_sends_nothing() {
        let mut el = worker();
        open(&mut el, 1, 8);
        upgrade(&mut el, 1, 10);
        // peer went away; teardown is in flight
        feed(&mut el, Completion::new(Token::new(Op::Recv, 1, 8, 0), 0, 0));
        assert!(el.connection(1).unwrap().is_closed());
        el.backend_mut().take();

        let mut deliveries = Envelope::new(7, Bytes::from_static(b"late"), &[1, 1]);
        let watch = deliveries.pop().unwrap();
        for d in deliveries {
            el.shared.mailboxes[0].push(d);
        }
        feed(&mut el, Completion::new(Token::new(Op::CrossMsg, 1, 0, 0), 0, 0));

        assert_eq!(el.backend().count(Op::SendZc), 0);
        assert!(el.shared.mailboxes[0].is_empty());
        assert_eq!(watch.release(), Release::Last);
    }

    #[test]
    fn test_close_leaves_open_document() {
        let mut el = worker();
        open(&mut el, 1, 8);
        upgrade_to(&mut el, 1, "/doc");
        recv(&mut el, 1, 1, &mask_frame(true, opcode::TEXT, br#"{"type":"open","doc_name":"n"}"#, [3, 1, 4, 1]));
        let doc = el.shared.documents.get("n").unwrap();
        assert_eq!(doc.members(), vec![1]);
        el.shared.documents.join("n", 2);

        feed(&mut el, Completion::new(Token::new(Op::Close, 1, 8, 0), 0, 0));
        assert!(el.connection(1).is_none());
        assert_eq!(doc.members(), vec![2]);
        // the remaining member is told through its mailbox
        let note = el.shared.mailboxes[0].pop().unwrap();
        assert_eq!(note.dest(), 2);
        assert_eq!(el.backend().count(Op::Nop), 1);
    }

    #[test]
    fn test_timeout_closes_idle_connection_and_rearms() {
        let s = shared(1);
        let mut el = EventLoop::worker(RecordingBackend::new(RING), 0, s).unwrap();
        if let Flavor::Worker(w) = &mut el.flavor {
            w.wheel = TimerWheel::with_start(Duration::from_millis(100), Instant::now() - Duration::from_secs(120));
        }
        open(&mut el, 1, 8);
        el.backend_mut().take();

        feed(&mut el, Completion::new(timeout_token(), -libc::ETIME, 0));
        assert!(el.connection(1).unwrap().is_closed());
        assert_eq!(el.stats().timeouts, 1);
        let ops: Vec<_> = el.backend().prepped.iter().map(|p| p.op()).collect();
        assert_eq!(ops, vec![Some(Op::Cancel), Some(Op::Timeout)]);
    }

    #[test]
    fn test_timeout_with_unexpected_result_is_fatal() {
        let mut el = worker();
        el.backend_mut().ready.push_back(Completion::new(timeout_token(), 0, 0));
        assert!(matches!(el.poll(), Err(Error::Completion { op: "timeout", .. })));
    }

    #[test]
    fn test_close_unbinds_user() {
        let mut el = worker();
        open(&mut el, 1, 8);
        upgrade(&mut el, 1, 44);
        assert_eq!(el.shared.directory.lookup(44), Some(1));
        feed(&mut el, Completion::new(Token::new(Op::Close, 1, 8, 0), 0, 0));
        assert_eq!(el.shared.directory.lookup(44), None);
    }
}
