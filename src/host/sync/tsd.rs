//! Thread-specific keys.
//!
//! Keys are small indices into a fixed table; values live in a per-thread
//! array on the thread record. Destructor callbacks are recorded so the
//! create call round-trips, but key deletion does not run them.

use nix::errno::Errno;

use crate::host::memory::GuestWord;
use crate::host::request::{ReqResult, Request};
use crate::host::thread::ThreadId;
use crate::host::Host;

/// Keys available to the guest; create fails with EAGAIN beyond this.
pub const MAX_TSD_KEYS: usize = 50;

#[derive(Copy, Clone, Debug, Default)]
struct KeySlot {
    in_use: bool,
    /// Guest address of the destructor; recorded, never invoked.
    destructor: GuestWord,
}

pub struct KeyTable {
    slots: [KeySlot; MAX_TSD_KEYS],
}

impl KeyTable {
    pub fn new() -> Self {
        Self {
            slots: [KeySlot::default(); MAX_TSD_KEYS],
        }
    }

    fn is_live(&self, key: GuestWord) -> bool {
        (key as usize) < MAX_TSD_KEYS && self.slots[key as usize].in_use
    }
}

impl Default for KeyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    /// The new key index is stored through the caller's out pointer; the
    /// reply word is only the status.
    pub fn key_create(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let key_out = req.arg_ptr::<u32>(0);
        let destructor = req.args[1];
        if key_out.is_null() {
            return Err(Errno::EINVAL.into());
        }
        let mut found = None;
        for (i, slot) in self.keys.slots.iter_mut().enumerate() {
            if !slot.in_use {
                *slot = KeySlot {
                    in_use: true,
                    destructor,
                };
                found = Some(i);
                break;
            }
        }
        let Some(key) = found else {
            return Err(Errno::EAGAIN.into());
        };
        if self.mem.write_val(key_out, &(key as u32)).is_err() {
            self.keys.slots[key] = KeySlot::default();
            return Err(Errno::EFAULT.into());
        }
        log::trace!("PTHREAD[{tid}]: key_create -> {key}");
        Ok(0)
    }

    pub fn key_delete(&mut self, _tid: ThreadId, req: Request) -> ReqResult {
        let key = req.args[0];
        if !self.keys.is_live(key) {
            return Err(Errno::EINVAL.into());
        }
        self.keys.slots[key as usize] = KeySlot::default();
        Ok(0)
    }

    pub fn set_specific(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let (key, value) = (req.args[0], req.args[1]);
        if !self.keys.is_live(key) {
            return Err(Errno::EINVAL.into());
        }
        self.threads.thread_mut(tid).specifics[key as usize] = value;
        Ok(0)
    }

    /// A dead key reads as null, like a destroyed key's storage would.
    pub fn get_specific(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let key = req.args[0];
        if !self.keys.is_live(key) {
            return Ok(0);
        }
        Ok(self.threads.thread(tid).specifics[key as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::request::RequestCode;
    use crate::host::testutil::{guest_alloc, spawn_runnable, test_host};
    use crate::host::thread::ThreadId;

    fn req(code: RequestCode, a0: GuestWord, a1: GuestWord) -> Request {
        Request {
            code,
            args: [a0, a1, 0, 0],
        }
    }

    fn create_key(host: &mut Host, tid: ThreadId, destructor: GuestWord) -> GuestWord {
        let out = guest_alloc::<u32>(host);
        host.key_create(tid, req(RequestCode::KeyCreate, out.addr(), destructor))
            .unwrap();
        GuestWord::from(host.mem.read_val(out).unwrap())
    }

    #[test]
    fn specifics_are_per_thread() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let t1 = spawn_runnable(&mut host);
        let key = create_key(&mut host, t0, 0xcafe);

        host.set_specific(t0, req(RequestCode::SetSpecific, key, 111)).unwrap();
        host.set_specific(t1, req(RequestCode::SetSpecific, key, 222)).unwrap();
        assert_eq!(host.get_specific(t0, req(RequestCode::GetSpecific, key, 0)), Ok(111));
        assert_eq!(host.get_specific(t1, req(RequestCode::GetSpecific, key, 0)), Ok(222));
    }

    #[test]
    fn dead_keys_reject_writes_and_read_null() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let key = create_key(&mut host, t0, 0);
        host.set_specific(t0, req(RequestCode::SetSpecific, key, 5)).unwrap();
        host.key_delete(t0, req(RequestCode::KeyDelete, key, 0)).unwrap();

        assert_eq!(
            host.set_specific(t0, req(RequestCode::SetSpecific, key, 6)),
            Err(crate::host::request::ReqError::Failed(Errno::EINVAL))
        );
        assert_eq!(host.get_specific(t0, req(RequestCode::GetSpecific, key, 0)), Ok(0));
        assert_eq!(
            host.key_delete(t0, req(RequestCode::KeyDelete, 9999, 0)),
            Err(crate::host::request::ReqError::Failed(Errno::EINVAL))
        );
    }

    #[test]
    fn key_space_is_bounded() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let out = guest_alloc::<u32>(&mut host);
        for _ in 0..MAX_TSD_KEYS {
            host.key_create(t0, req(RequestCode::KeyCreate, out.addr(), 0))
                .unwrap();
        }
        assert_eq!(
            host.key_create(t0, req(RequestCode::KeyCreate, out.addr(), 0)),
            Err(crate::host::request::ReqError::Failed(Errno::EAGAIN))
        );
    }
}
