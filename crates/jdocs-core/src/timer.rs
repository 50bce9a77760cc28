//! Five-tier hierarchical timer wheel.
//!
//! Tier 1 has 256 one-tick slots; tiers 2 through 5 have 64 slots each,
//! tier k spanning `64^(k-1) * 256` ticks per slot. Timers are slab entries
//! addressed by generation-checked keys; a [`Timer`] handle owns one entry
//! and frees it on drop, so a dropped connection can never be fired.
//!
//! The wheel is thread-confined (`Rc`), one per worker.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::constants::{
    HIGHER_TIERS, TVN_BITS, TVN_MASK, TVN_SIZE, TVR_BITS, TVR_MASK, TVR_SIZE,
};

const NUM_BUCKETS: usize = TVR_SIZE + HIGHER_TIERS * TVN_SIZE;

/// Farthest a timer can be scheduled, in ticks.
const MAX_DELTA: u64 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Key {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    head: Option<u32>,
    tail: Option<u32>,
}

struct Node<T> {
    generation: u32,
    value: T,
    expires: u64,
    prev: Option<u32>,
    next: Option<u32>,
    bucket: Option<u16>,
    fired: bool,
}

struct Wheel<T> {
    tick: Duration,
    start: Instant,
    current: u64,
    buckets: Box<[Bucket]>,
    nodes: Slab<Node<T>>,
    /// Stamped on every allocation; slab keys are reused, generations are not.
    generation: u32,
    linked: usize,
}

impl<T: Clone> Wheel<T> {
    fn get(&self, key: Key) -> Option<&Node<T>> {
        self.nodes
            .get(key.index as usize)
            .filter(|n| n.generation == key.generation)
    }

    fn alloc(&mut self, value: T) -> Key {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let index = self.nodes.insert(Node {
            generation,
            value,
            expires: 0,
            prev: None,
            next: None,
            bucket: None,
            fired: false,
        });
        Key { index: index as u32, generation }
    }

    fn release(&mut self, key: Key) {
        if self.get(key).is_none() {
            return;
        }
        self.unlink(key.index);
        self.nodes.remove(key.index as usize);
    }

    fn arm(&mut self, key: Key, after: Duration) {
        if self.get(key).is_none() {
            return;
        }
        self.unlink(key.index);
        let ticks = (after.as_millis() / self.tick.as_millis().max(1)).max(1) as u64;
        let node = &mut self.nodes[key.index as usize];
        node.fired = false;
        node.expires = self.current + ticks.min(MAX_DELTA);
        self.place(key.index);
    }

    fn cancel(&mut self, key: Key) {
        if self.get(key).is_some() {
            self.unlink(key.index);
        }
    }

    /// Pick the bucket for a node from its `expires` relative to `current`.
    fn place(&mut self, index: u32) {
        let expires = self.nodes[index as usize].expires;
        let bucket = if expires < self.current {
            (self.current & TVR_MASK) as usize
        } else {
            let delta = expires - self.current;
            if delta < TVR_SIZE as u64 {
                (expires & TVR_MASK) as usize
            } else {
                let mut tier = 0;
                while tier + 1 < HIGHER_TIERS
                    && delta >= 1u64 << (TVR_BITS + (tier as u32 + 1) * TVN_BITS)
                {
                    tier += 1;
                }
                let shift = TVR_BITS + tier as u32 * TVN_BITS;
                TVR_SIZE + tier * TVN_SIZE + ((expires >> shift) & TVN_MASK) as usize
            }
        };
        self.link(index, bucket as u16);
    }

    fn link(&mut self, index: u32, bucket: u16) {
        let tail = self.buckets[bucket as usize].tail;
        {
            let node = &mut self.nodes[index as usize];
            node.prev = tail;
            node.next = None;
            node.bucket = Some(bucket);
        }
        match tail {
            Some(t) => self.nodes[t as usize].next = Some(index),
            None => self.buckets[bucket as usize].head = Some(index),
        }
        self.buckets[bucket as usize].tail = Some(index);
        self.linked += 1;
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next, bucket) = {
            let node = &mut self.nodes[index as usize];
            let Some(bucket) = node.bucket.take() else {
                return;
            };
            (node.prev.take(), node.next.take(), bucket as usize)
        };
        match prev {
            Some(p) => self.nodes[p as usize].next = next,
            None => self.buckets[bucket].head = next,
        }
        match next {
            Some(n) => self.nodes[n as usize].prev = prev,
            None => self.buckets[bucket].tail = prev,
        }
        self.linked -= 1;
    }

    /// Detach a whole bucket, returning its node indices in insertion order.
    fn detach(&mut self, bucket: usize, out: &mut Vec<u32>) {
        let mut cursor = self.buckets[bucket].head.take();
        self.buckets[bucket].tail = None;
        while let Some(index) = cursor {
            let node = &mut self.nodes[index as usize];
            cursor = node.next.take();
            node.prev = None;
            node.bucket = None;
            self.linked -= 1;
            out.push(index);
        }
    }

    fn cascade(&mut self, tier: usize, slot: usize, scratch: &mut Vec<u32>) {
        scratch.clear();
        self.detach(TVR_SIZE + tier * TVN_SIZE + slot, scratch);
        for &index in scratch.iter() {
            self.place(index);
        }
    }

    fn tick(&mut self, fired: &mut Vec<T>) -> usize {
        self.current += 1;
        let slot = (self.current & TVR_MASK) as usize;
        let mut scratch = Vec::new();
        if slot == 0 {
            let mut tier = 0;
            loop {
                let shift = TVR_BITS + tier as u32 * TVN_BITS;
                let index = ((self.current >> shift) & TVN_MASK) as usize;
                self.cascade(tier, index, &mut scratch);
                tier += 1;
                if index != 0 || tier == HIGHER_TIERS {
                    break;
                }
            }
        }
        scratch.clear();
        self.detach(slot, &mut scratch);
        for &index in &scratch {
            let node = &mut self.nodes[index as usize];
            node.fired = true;
            fired.push(node.value.clone());
        }
        scratch.len()
    }
}

/// Handle to a thread-local timer wheel. Cloning shares the wheel.
pub struct TimerWheel<T> {
    inner: Rc<RefCell<Wheel<T>>>,
}

impl<T> Clone for TimerWheel<T> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<T: Clone> TimerWheel<T> {
    pub fn new(tick: Duration) -> Self {
        Self::with_start(tick, Instant::now())
    }

    pub fn with_start(tick: Duration, start: Instant) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Wheel {
                tick,
                start,
                current: 0,
                buckets: vec![Bucket::default(); NUM_BUCKETS].into_boxed_slice(),
                nodes: Slab::new(),
                generation: 0,
                linked: 0,
            })),
        }
    }

    /// Allocate an unarmed timer carrying `value`.
    pub fn timer(&self, value: T) -> Timer<T> {
        let key = self.inner.borrow_mut().alloc(value);
        Timer { wheel: Rc::downgrade(&self.inner), key }
    }

    /// Advance one tick, appending the values of expired timers to `fired`.
    ///
    /// Every expired node is unlinked and marked fired before this returns,
    /// so callers are free to re-arm timers while handling `fired`.
    pub fn tick(&self, fired: &mut Vec<T>) -> usize {
        self.inner.borrow_mut().tick(fired)
    }

    /// Tick until the wheel's current tick reaches `target`.
    pub fn advance_to(&self, target: u64, fired: &mut Vec<T>) -> usize {
        let mut count = 0;
        let mut wheel = self.inner.borrow_mut();
        while wheel.current < target {
            count += wheel.tick(fired);
        }
        count
    }

    /// Catch up with the monotonic clock.
    pub fn update(&self, now: Instant, fired: &mut Vec<T>) -> usize {
        let target = {
            let wheel = self.inner.borrow();
            let elapsed = now.saturating_duration_since(wheel.start);
            (elapsed.as_millis() / wheel.tick.as_millis().max(1)) as u64
        };
        self.advance_to(target, fired)
    }

    pub fn current_tick(&self) -> u64 {
        self.inner.borrow().current
    }

    pub fn tick_duration(&self) -> Duration {
        self.inner.borrow().tick
    }

    /// Instant at which the next tick becomes due.
    pub fn next_deadline(&self) -> Instant {
        let wheel = self.inner.borrow();
        wheel.start + tick_offset(wheel.tick, wheel.current.saturating_add(1))
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.inner.borrow().linked
    }
}

/// `tick * ticks`, saturating instead of overflowing.
fn tick_offset(tick: Duration, ticks: u64) -> Duration {
    let nanos = tick.as_nanos().saturating_mul(u128::from(ticks));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// An owned timer node. Dropping it unlinks and frees the node.
pub struct Timer<T: Clone> {
    wheel: Weak<RefCell<Wheel<T>>>,
    key: Key,
}

impl<T: Clone> Timer<T> {
    /// Schedule (or reschedule) to fire `after` from the current tick.
    pub fn arm(&self, after: Duration) {
        if let Some(w) = self.wheel.upgrade() {
            w.borrow_mut().arm(self.key, after);
        }
    }

    pub fn cancel(&self) {
        if let Some(w) = self.wheel.upgrade() {
            w.borrow_mut().cancel(self.key);
        }
    }

    pub fn is_fired(&self) -> bool {
        let Some(w) = self.wheel.upgrade() else {
            return false;
        };
        let fired = w.borrow().get(self.key).map_or(false, |n| n.fired);
        fired
    }

    pub fn is_pending(&self) -> bool {
        let Some(w) = self.wheel.upgrade() else {
            return false;
        };
        let pending = w.borrow().get(self.key).map_or(false, |n| n.bucket.is_some());
        pending
    }
}

impl<T: Clone> Drop for Timer<T> {
    fn drop(&mut self) {
        if let Some(w) = self.wheel.upgrade() {
            if let Ok(mut wheel) = w.try_borrow_mut() {
                wheel.release(self.key);
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Timer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("index", &self.key.index)
            .field("pending", &self.is_pending())
            .field("fired", &self.is_fired())
            .finish()
    }
}
