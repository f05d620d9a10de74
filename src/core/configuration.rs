//! Run-time tunables.
//!
//! Table capacities are compile-time constants next to their tables (the
//! fatal exhaustion diagnostics name them); everything an embedder may
//! reasonably vary per run lives here.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Options {
    /// Basic blocks a thread may run before the scheduler reselects.
    pub quantum: u32,

    /// Stop with the budget-done result after this many basic blocks.
    /// `None` runs until shutdown or deadlock.
    pub bb_budget: Option<u64>,

    /// Basic blocks per code-cache LRU aging epoch.
    pub epoch_interval: u64,

    /// How long to sleep on the host when no thread is runnable but some
    /// are waiting on descriptors or sleeping. Bounds the resolution of
    /// sleep expiry and timed-wait deadlines.
    pub poll_interval: Duration,

    /// Guest stack mapped for each created thread, lower bound.
    pub min_stack_size: usize,

    /// Size of the arena answering the guest's allocation requests.
    pub client_heap_size: usize,

    /// Reply to the get-trace-level request; the replacement library uses
    /// it to gate its own chatter.
    pub pthread_trace_level: u64,

    /// Run whole-machine invariant checks each scheduling round.
    pub sanity_checks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            quantum: 50_000,
            bb_budget: None,
            epoch_interval: 50_000,
            poll_interval: Duration::from_millis(10),
            min_stack_size: 64 * 1024,
            client_heap_size: 256 * 1024,
            pthread_trace_level: 0,
            sanity_checks: cfg!(debug_assertions),
        }
    }
}
