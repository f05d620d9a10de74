//! A user-space cooperative thread scheduler and synchronization core.
//!
//! An instrumented guest program's threading calls are redirected into this
//! crate, which multiplexes many virtual threads onto a single host execution
//! context: it dispatches translated guest code through an external runner in
//! bounded quanta, services syscalls on the guest's behalf without blocking
//! the whole process, and implements mutexes, condition variables,
//! reader-writer locks, semaphores, thread-local keys, joins, cancellation
//! and signal requests against its own thread table.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod core;
pub mod host;
pub mod shim;
pub mod utility;
