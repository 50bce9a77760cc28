//! Compile-time sizing of buffers and the timer wheel.

/// Size of one receive or send buffer.
pub const BUFFER_SIZE: usize = 2048;

/// Buffers carved out of one block allocation.
pub const BUFFERS_PER_BLOCK: usize = 256;

/// Bytes per block allocation.
pub const BLOCK_SIZE: usize = BUFFER_SIZE * BUFFERS_PER_BLOCK;

/// Hard cap on receive ring entries and send buffer slots.
pub const BUFFER_ENTRIES_MAX: usize = 1 << 14;

/// Buffer group id of the provided receive ring.
pub const RECV_BUFFER_GROUP: u16 = 1;

/// Largest reassembled WebSocket message.
pub const MAX_MESSAGE_SIZE: usize = 1 << 16;

/// Largest HTTP request head accepted before the upgrade is rejected.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Tier-1 bits of the timer wheel (256 slots).
pub const TVR_BITS: u32 = 8;

/// Bits of each higher tier (64 slots).
pub const TVN_BITS: u32 = 6;

pub const TVR_SIZE: usize = 1 << TVR_BITS;
pub const TVN_SIZE: usize = 1 << TVN_BITS;
pub const TVR_MASK: u64 = (TVR_SIZE - 1) as u64;
pub const TVN_MASK: u64 = (TVN_SIZE - 1) as u64;

/// Tiers above tier 1. The wheel always has five tiers in total.
pub const HIGHER_TIERS: usize = 4;
