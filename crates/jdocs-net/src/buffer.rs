//! Receive and send buffer pools.
//!
//! Receive buffers are handed to the kernel through a provided-buffer ring
//! and come back identified by buffer id. Send buffers are fixed (registered)
//! buffers checked out through an [`IndexBitmap`] and released only after the
//! zero-copy notification. Both grow one block of 256 buffers at a time up to
//! `BUFFER_ENTRIES_MAX`.

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;
use tracing::{debug, warn};

use jdocs_core::bitmap::IndexBitmap;
use jdocs_core::constants::{
    BLOCK_SIZE, BUFFERS_PER_BLOCK, BUFFER_ENTRIES_MAX, BUFFER_SIZE, RECV_BUFFER_GROUP,
};
use jdocs_core::error::{Error, Result};
use jdocs_core::io_backend::IoBackend;

const PAGE_SIZE: usize = 4096;

/// Page-aligned zeroed allocation.
struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Region {
    fn new(size: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid layout"))?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.layout.size());
        unsafe { self.ptr.as_ptr().add(offset) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

fn block_alloc(what: &'static str) -> Result<Region> {
    Region::new(BLOCK_SIZE).map_err(|source| Error::Registration { what, source })
}

/// Kernel-selected receive buffers.
pub struct RecvBuffers {
    ring: Region,
    tail: *const AtomicU16,
    local_tail: u16,
    mask: u16,
    blocks: Vec<Region>,
    count: usize,
}

// The ring and blocks are owned exclusively by one worker.
unsafe impl Send for RecvBuffers {}

impl RecvBuffers {
    /// Allocate and register the ring, then provide the first block.
    pub fn new<B: IoBackend>(backend: &mut B) -> Result<Self> {
        let entries = BUFFER_ENTRIES_MAX;
        let ring = Region::new(entries * std::mem::size_of::<BufRingEntry>())
            .map_err(|source| Error::Registration { what: "provided buffer ring", source })?;
        let tail = unsafe {
            BufRingEntry::tail(ring.ptr.as_ptr() as *const BufRingEntry) as *const AtomicU16
        };
        unsafe {
            backend.register_buf_ring(ring.ptr.as_ptr() as u64, entries as u16, RECV_BUFFER_GROUP)?;
        }
        let mut pool = Self {
            ring,
            tail,
            local_tail: 0,
            mask: (entries - 1) as u16,
            blocks: Vec::new(),
            count: 0,
        };
        pool.grow()?;
        Ok(pool)
    }

    /// Buffers handed to the kernel so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn at_capacity(&self) -> bool {
        self.count >= BUFFER_ENTRIES_MAX
    }

    /// Provide one more block. `Ok(false)` once the cap is reached.
    pub fn grow(&mut self) -> Result<bool> {
        if self.at_capacity() {
            return Ok(false);
        }
        let block = block_alloc("receive buffer block")?;
        for i in 0..BUFFERS_PER_BLOCK {
            let bid = (self.count + i) as u16;
            self.push_entry(block.at(i * BUFFER_SIZE), bid);
        }
        self.blocks.push(block);
        self.count += BUFFERS_PER_BLOCK;
        self.commit();
        debug!(buffers = self.count, "receive pool grown");
        Ok(true)
    }

    /// Received bytes of buffer `bid`, or `None` if `bid` was never provided.
    pub fn get(&self, bid: u16, len: usize) -> Option<&[u8]> {
        let ptr = self.buffer_ptr(bid)?;
        Some(unsafe { std::slice::from_raw_parts(ptr, len.min(BUFFER_SIZE)) })
    }

    /// Hand buffer `bid` back to the kernel.
    pub fn replenish(&mut self, bid: u16) {
        if let Some(ptr) = self.buffer_ptr(bid) {
            self.push_entry(ptr as *mut u8, bid);
            self.commit();
        }
    }

    fn buffer_ptr(&self, bid: u16) -> Option<*const u8> {
        let bid = bid as usize;
        let block = self.blocks.get(bid / BUFFERS_PER_BLOCK)?;
        Some(block.at((bid % BUFFERS_PER_BLOCK) * BUFFER_SIZE) as *const u8)
    }

    fn push_entry(&mut self, addr: *mut u8, bid: u16) {
        let idx = (self.local_tail & self.mask) as usize;
        let entry = unsafe { &mut *(self.ring.ptr.as_ptr() as *mut BufRingEntry).add(idx) };
        entry.set_addr(addr as u64);
        entry.set_len(BUFFER_SIZE as u32);
        entry.set_bid(bid);
        self.local_tail = self.local_tail.wrapping_add(1);
    }

    #[inline]
    fn commit(&self) {
        unsafe { (*self.tail).store(self.local_tail, Ordering::Release) }
    }

    /// Write `data` into buffer `bid` as if the kernel had received it.
    #[cfg(test)]
    pub(crate) fn fill(&mut self, bid: u16, data: &[u8]) {
        let Some(ptr) = self.buffer_ptr(bid) else {
            return;
        };
        let len = data.len().min(BUFFER_SIZE);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, len) };
    }

    #[cfg(test)]
    fn published_tail(&self) -> u16 {
        unsafe { (*self.tail).load(Ordering::Acquire) }
    }
}

/// Registered zero-copy send buffers.
pub struct SendBuffers {
    blocks: Vec<Region>,
    /// 1 = checked out or not yet registered.
    bitmap: IndexBitmap,
    registered: u32,
}

unsafe impl Send for SendBuffers {}

impl SendBuffers {
    /// Reserve the sparse table and register the first block.
    pub fn new<B: IoBackend>(backend: &mut B) -> Result<Self> {
        backend.register_send_table(BUFFER_ENTRIES_MAX as u32)?;
        let mut pool = Self {
            blocks: Vec::new(),
            bitmap: IndexBitmap::new_full(BUFFER_ENTRIES_MAX as u32),
            registered: 0,
        };
        pool.grow(backend)?;
        Ok(pool)
    }

    pub fn registered(&self) -> u32 {
        self.registered
    }

    /// Indices checked out by callers.
    pub fn in_use(&self) -> u32 {
        self.bitmap.used() - (BUFFER_ENTRIES_MAX as u32 - self.registered)
    }

    /// Check out a buffer index, growing once if the registered set is exhausted.
    pub fn acquire<B: IoBackend>(&mut self, backend: &mut B) -> Option<u16> {
        if let Some(idx) = self.bitmap.acquire() {
            return Some(idx as u16);
        }
        match self.grow(backend) {
            Ok(true) => self.bitmap.acquire().map(|i| i as u16),
            Ok(false) => None,
            Err(e) => {
                warn!(error = %e, registered = self.registered, "send pool growth failed");
                None
            }
        }
    }

    /// Register one more block. `Ok(false)` once the cap is reached.
    pub fn grow<B: IoBackend>(&mut self, backend: &mut B) -> Result<bool> {
        if self.registered as usize >= BUFFER_ENTRIES_MAX {
            return Ok(false);
        }
        let block = block_alloc("send buffer block")?;
        let offset = self.registered;
        let iovecs: Vec<libc::iovec> = (0..BUFFERS_PER_BLOCK)
            .map(|i| libc::iovec {
                iov_base: block.at(i * BUFFER_SIZE) as *mut libc::c_void,
                iov_len: BUFFER_SIZE,
            })
            .collect();
        let tags: Vec<u64> = (0..BUFFERS_PER_BLOCK as u64).map(|i| offset as u64 + i + 1).collect();
        // Block memory lives in `self.blocks` until the pool (and its ring) is dropped.
        unsafe { backend.register_send_buffers(offset, &iovecs, &tags)? };
        self.blocks.push(block);
        self.bitmap.remove_range(offset, BUFFERS_PER_BLOCK as u32);
        self.registered += BUFFERS_PER_BLOCK as u32;
        debug!(buffers = self.registered, "send pool grown");
        Ok(true)
    }

    /// Return an index after the kernel's zero-copy notification.
    pub fn release(&mut self, idx: u16) -> bool {
        if idx as u32 >= self.registered {
            return false;
        }
        self.bitmap.remove(idx as u32)
    }

    pub fn is_checked_out(&self, idx: u16) -> bool {
        (idx as u32) < self.registered && self.bitmap.is_set(idx as u32)
    }

    /// Writable view of a checked-out buffer.
    pub fn buffer_mut(&mut self, idx: u16) -> Option<&mut [u8]> {
        let ptr = self.buffer_ptr(idx)?;
        if !self.bitmap.is_set(idx as u32) {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, BUFFER_SIZE) })
    }

    pub fn buffer_ptr(&self, idx: u16) -> Option<*const u8> {
        let idx = idx as usize;
        let block = self.blocks.get(idx / BUFFERS_PER_BLOCK)?;
        Some(block.at((idx % BUFFERS_PER_BLOCK) * BUFFER_SIZE) as *const u8)
    }
}

/// Both halves, owned by one worker's event loop.
pub struct BufferPool {
    pub recv: RecvBuffers,
    pub send: SendBuffers,
}

impl BufferPool {
    pub fn new<B: IoBackend>(backend: &mut B) -> Result<Self> {
        Ok(Self { recv: RecvBuffers::new(backend)?, send: SendBuffers::new(backend)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingBackend;

    #[test]
    fn test_recv_pool_registers_ring() {
        let mut backend = RecordingBackend::new(3);
        let recv = RecvBuffers::new(&mut backend).unwrap();
        assert_eq!(backend.buf_rings, vec![(BUFFER_ENTRIES_MAX as u16, RECV_BUFFER_GROUP)]);
        assert_eq!(recv.len(), BUFFERS_PER_BLOCK);
        assert_eq!(recv.published_tail(), BUFFERS_PER_BLOCK as u16);
    }

    #[test]
    fn test_recv_pool_get_bounds() {
        let mut backend = RecordingBackend::new(3);
        let mut recv = RecvBuffers::new(&mut backend).unwrap();
        assert!(recv.get(0, 10).is_some());
        assert!(recv.get(255, BUFFER_SIZE * 2).map(|b| b.len()) == Some(BUFFER_SIZE));
        assert!(recv.get(256, 1).is_none());

        assert!(recv.grow().unwrap());
        assert!(recv.get(256, 1).is_some());
        assert!(recv.get(511, 1).is_some());
        assert!(recv.get(512, 1).is_none());
    }

    #[test]
    fn test_recv_pool_replenish_publishes() {
        let mut backend = RecordingBackend::new(3);
        let mut recv = RecvBuffers::new(&mut backend).unwrap();
        let before = recv.published_tail();
        recv.replenish(17);
        assert_eq!(recv.published_tail(), before.wrapping_add(1));
        // unknown buffer ids are ignored
        recv.replenish(4000);
        assert_eq!(recv.published_tail(), before.wrapping_add(1));
    }

    #[test]
    fn test_recv_pool_cap() {
        let mut backend = RecordingBackend::new(3);
        let mut recv = RecvBuffers::new(&mut backend).unwrap();
        while recv.grow().unwrap() {}
        assert_eq!(recv.len(), BUFFER_ENTRIES_MAX);
        assert!(recv.at_capacity());
        assert!(!recv.grow().unwrap());
        assert!(recv.get((BUFFER_ENTRIES_MAX - 1) as u16, 1).is_some());
    }

    #[test]
    fn test_send_pool_acquire_release() {
        let mut backend = RecordingBackend::new(3);
        let mut send = SendBuffers::new(&mut backend).unwrap();
        assert_eq!(backend.send_table, BUFFER_ENTRIES_MAX as u32);
        assert_eq!(send.registered(), BUFFERS_PER_BLOCK as u32);
        assert_eq!(send.in_use(), 0);

        let a = send.acquire(&mut backend).unwrap();
        let b = send.acquire(&mut backend).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(send.in_use(), 2);
        send.buffer_mut(a).unwrap()[..3].copy_from_slice(b"abc");

        assert!(send.release(a));
        assert!(!send.release(a));
        assert!(send.buffer_mut(a).is_none());
        assert_eq!(send.acquire(&mut backend), Some(0));
    }

    #[test]
    fn test_send_pool_grows_on_demand() {
        let mut backend = RecordingBackend::new(3);
        let mut send = SendBuffers::new(&mut backend).unwrap();
        for i in 0..BUFFERS_PER_BLOCK as u16 {
            assert_eq!(send.acquire(&mut backend), Some(i));
        }
        assert_eq!(send.registered(), BUFFERS_PER_BLOCK as u32);
        assert_eq!(send.acquire(&mut backend), Some(BUFFERS_PER_BLOCK as u16));
        assert_eq!(send.registered(), 2 * BUFFERS_PER_BLOCK as u32);
        assert_eq!(backend.send_registered, 2 * BUFFERS_PER_BLOCK as u32);
    }

    #[test]
    fn test_send_pool_growth_boundary() {
        let mut backend = RecordingBackend::new(3);
        let mut send = SendBuffers::new(&mut backend).unwrap();
        for _ in 0..BUFFER_ENTRIES_MAX {
            assert!(send.acquire(&mut backend).is_some());
        }
        assert_eq!(send.in_use(), BUFFER_ENTRIES_MAX as u32);
        assert_eq!(send.acquire(&mut backend), None);
        assert!(!send.grow(&mut backend).unwrap());
        assert_eq!(send.acquire(&mut backend), None);

        assert!(send.release(1234));
        assert_eq!(send.acquire(&mut backend), Some(1234));
    }

    #[test]
    fn test_send_pool_registration_failure_is_backpressure() {
        let mut backend = RecordingBackend::new(3);
        backend.send_register_limit = Some(BUFFERS_PER_BLOCK as u32);
        let mut send = SendBuffers::new(&mut backend).unwrap();
        for _ in 0..BUFFERS_PER_BLOCK {
            assert!(send.acquire(&mut backend).is_some());
        }
        assert_eq!(send.acquire(&mut backend), None);
        assert_eq!(send.registered(), BUFFERS_PER_BLOCK as u32);
    }
}
