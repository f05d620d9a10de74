//! Helpers shared by the unit tests: a host over flat memory and shortcuts
//! for minting threads and guest objects.

use crate::core::configuration::Options;
use crate::host::memory::{FlatMemory, ForeignPtr};
use crate::host::thread::{ThreadId, ThreadStatus};
use crate::host::Host;

pub(crate) fn test_host() -> Host {
    let size = 2 << 20;
    let mem = FlatMemory::new(0x10000, size, size);
    Host::new(Options::default(), Box::new(mem))
}

pub(crate) fn spawn_runnable(host: &mut Host) -> ThreadId {
    let tid = host.threads.alloc();
    host.threads.slot_mut(tid).status = ThreadStatus::Runnable;
    tid
}

/// Map a zeroed guest object and return a typed pointer to it.
pub(crate) fn guest_alloc<T>(host: &mut Host) -> ForeignPtr<T> {
    let addr = host
        .mem
        .map_region(std::mem::size_of::<T>().max(8))
        .expect("test memory exhausted");
    ForeignPtr::new(addr)
}
