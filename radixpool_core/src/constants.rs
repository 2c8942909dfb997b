//! Constants and configuration for the radix pool

pub const HEADER_MAGIC: u64 = 0x5241_4449_5850_4F4C; // "RADIXPOL"
pub const HEADER_VERSION: u16 = 1;

pub const CACHE_LINE: usize = 64;

/// Default object capacity used by `Pool::open_default`.
pub const DEFAULT_CAPACITY: usize = 1_048_576;

/// Child-table width of a branch: one slot per possible next byte.
pub const FANOUT: usize = 256;

/// Worker slot marker meaning "outside any critical section".
pub const EPOCH_INACTIVE: u64 = 0;
/// First value handed out by the global epoch counter.
pub const EPOCH_FIRST: u64 = 1;

/// Busy-spins before a quiescence wait starts yielding the CPU.
pub const SPIN_BEFORE_YIELD: u32 = 64;
