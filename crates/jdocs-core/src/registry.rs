//! Connection id assignment, worker routing and the user directory.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::token::CONN_ID_MASK;

/// Maps a connection id to the worker that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    workers: u32,
}

impl ShardRouter {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) as u32 }
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers as usize
    }

    #[inline]
    pub fn owner_of(&self, conn_id: u32) -> usize {
        (conn_id % self.workers) as usize
    }
}

/// Monotonic 28-bit connection ids. Id 0 is reserved for "no connection".
///
/// Only the listener thread assigns ids, so this is plain state.
#[derive(Debug)]
pub struct ConnIdAllocator {
    next: u32,
}

impl Default for ConnIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl ConnIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = (self.next + 1) & CONN_ID_MASK;
        if self.next == 0 {
            self.next = 1;
        }
        id
    }
}

/// Application user id -> connection id.
///
/// `bind` and `unbind` are the only writers and serialize on the write lock.
#[derive(Debug, Default)]
pub struct UserDirectory {
    map: RwLock<HashMap<u32, u32>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection previously bound to `user_id`, if any.
    pub fn bind(&self, user_id: u32, conn_id: u32) -> Option<u32> {
        self.map.write().insert(user_id, conn_id)
    }

    /// Remove the binding only if it still points at `conn_id`.
    pub fn unbind(&self, user_id: u32, conn_id: u32) -> bool {
        let mut map = self.map.write();
        if map.get(&user_id) == Some(&conn_id) {
            map.remove(&user_id);
            true
        } else {
            false
        }
    }

    pub fn lookup(&self, user_id: u32) -> Option<u32> {
        self.map.read().get(&user_id).copied()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
