//! Synchronization primitives, implemented against the scheduler's thread
//! table. Because all virtual threads share one host context and can only
//! suspend at traps, every handler here runs to completion atomically from
//! the guest's point of view; no atomics are needed anywhere.

pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod tsd;
