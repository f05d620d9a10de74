//! Access to the instrumented program's address space.
//!
//! The scheduler never dereferences guest pointers directly: every request
//! argument that names guest memory is wrapped in a [`ForeignPtr`] and read
//! or written through the [`GuestMemory`] trait, which the embedder
//! implements over whatever the real guest address space is. Out-of-range
//! accesses surface as `EFAULT`, which request handlers translate into the
//! "would-fault" reply.

use std::marker::PhantomData;

use bytemuck::Pod;
use nix::errno::Errno;

/// A machine word of the guest: registers, request arguments and replies.
pub type GuestWord = u64;

/// A pointer into the guest's address space, typed for documentation and for
/// the `Pod`-based accessors. The type does not imply alignment, and the
/// value is only an address: it is never dereferenced on the host, so it
/// stays `Send`/`Sync` whatever `T` is.
pub struct ForeignPtr<T> {
    addr: GuestWord,
    _phantom: PhantomData<fn() -> T>,
}

// Not derived: a derive would condition these on `T`, and the pointer itself
// is just a word.
impl<T> Copy for ForeignPtr<T> {}
impl<T> Clone for ForeignPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> std::fmt::Debug for ForeignPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignPtr({:#x})", self.addr)
    }
}

impl<T> ForeignPtr<T> {
    pub fn new(addr: GuestWord) -> Self {
        Self {
            addr,
            _phantom: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(0)
    }

    pub fn addr(&self) -> GuestWord {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    pub fn cast<U>(&self) -> ForeignPtr<U> {
        ForeignPtr::new(self.addr)
    }

    /// Pointer to element `count` of an array starting at `self`.
    pub fn add(&self, count: usize) -> Self {
        Self::new(self.addr + (count * std::mem::size_of::<T>()) as GuestWord)
    }
}

impl<T> From<GuestWord> for ForeignPtr<T> {
    fn from(addr: GuestWord) -> Self {
        Self::new(addr)
    }
}

/// The guest address space, as far as the scheduler is concerned.
///
/// `map_region` exists for the scheduler's own allocations on the guest's
/// behalf: thread stacks and the client heap arena.
pub trait GuestMemory {
    fn read_bytes(&self, addr: GuestWord, buf: &mut [u8]) -> Result<(), Errno>;
    fn write_bytes(&mut self, addr: GuestWord, data: &[u8]) -> Result<(), Errno>;

    /// Reserve `len` fresh bytes of guest address space and return their base.
    fn map_region(&mut self, len: usize) -> Result<GuestWord, Errno>;
}

impl<'m> dyn GuestMemory + 'm {
    pub fn read_val<T: Pod>(&self, ptr: ForeignPtr<T>) -> Result<T, Errno> {
        let mut val = T::zeroed();
        self.read_bytes(ptr.addr(), bytemuck::bytes_of_mut(&mut val))?;
        Ok(val)
    }

    pub fn write_val<T: Pod>(&mut self, ptr: ForeignPtr<T>, val: &T) -> Result<(), Errno> {
        self.write_bytes(ptr.addr(), bytemuck::bytes_of(val))
    }

    pub fn read_word(&self, ptr: ForeignPtr<GuestWord>) -> Result<GuestWord, Errno> {
        self.read_val(ptr)
    }

    pub fn write_word(&mut self, ptr: ForeignPtr<GuestWord>, val: GuestWord) -> Result<(), Errno> {
        self.write_val(ptr, &val)
    }
}

/// A single flat region of guest memory backed by host bytes.
///
/// This is what the test harness runs guests in, and is enough for embedders
/// whose guests live in one contiguous mapping. Region mapping is a bump
/// allocator from the top of the previously mapped space; regions are never
/// unmapped (freed thread stacks are recycled by the thread table instead).
pub struct FlatMemory {
    base: GuestWord,
    bytes: Vec<u8>,
    next_region: usize,
}

impl FlatMemory {
    /// `reserve` bytes starting at guest address `base` are available for
    /// `map_region`; everything below stays addressable through read/write.
    pub fn new(base: GuestWord, size: usize, reserve: usize) -> Self {
        assert!(base > 0, "guest address zero must stay unmapped");
        assert!(reserve <= size);
        Self {
            base,
            bytes: vec![0; size],
            next_region: size - reserve,
        }
    }

    fn offset(&self, addr: GuestWord, len: usize) -> Result<usize, Errno> {
        let off = addr.checked_sub(self.base).ok_or(Errno::EFAULT)? as usize;
        if off.checked_add(len).map_or(true, |end| end > self.bytes.len()) {
            return Err(Errno::EFAULT);
        }
        Ok(off)
    }
}

impl GuestMemory for FlatMemory {
    fn read_bytes(&self, addr: GuestWord, buf: &mut [u8]) -> Result<(), Errno> {
        let off = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[off..off + buf.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, addr: GuestWord, data: &[u8]) -> Result<(), Errno> {
        let off = self.offset(addr, data.len())?;
        self.bytes[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn map_region(&mut self, len: usize) -> Result<GuestWord, Errno> {
        let len = (len + 15) & !15;
        if self.next_region + len > self.bytes.len() {
            return Err(Errno::ENOMEM);
        }
        let addr = self.base + self.next_region as GuestWord;
        self.next_region += len;
        Ok(addr)
    }
}
