use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

const ALIGN: usize = 64;

struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for Chunk {}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Default)]
struct State {
    free: Vec<Chunk>,
    /// bytes currently lent out
    in_use: usize,
}

/// Pool of packing buffers.
///
/// Buffers are lent out as [`Workspace`] guards and come back on drop, so a
/// panicking or early-returning operation still returns its memory.
pub struct Pool {
    state: Mutex<State>,
    capacity: usize,
}

impl Pool {
    /// Pool lending out at most `capacity` bytes at a time.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn global() -> &'static Pool {
        static POOL: OnceLock<Pool> = OnceLock::new();
        POOL.get_or_init(Pool::unbounded)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a worker panicking while holding the lock leaves the free list intact
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lends out a zero-initialized buffer of at least `bytes` bytes,
    /// aligned to 64 bytes.
    pub fn acquire(&self, bytes: usize) -> Result<Workspace<'_>> {
        let bytes = Ord::max(bytes, 1).next_multiple_of(ALIGN);
        let mut state = self.lock();

        let available = self.capacity.saturating_sub(state.in_use);
        if bytes > available {
            return Err(Error::WorkspaceExhausted {
                requested: bytes,
                available,
            });
        }

        let chunk = match state
            .free
            .iter()
            .position(|c| c.layout.size() >= bytes && c.layout.size() <= available)
        {
            Some(idx) => {
                let chunk = state.free.swap_remove(idx);
                log::trace!("reusing {} byte workspace for {bytes} bytes", chunk.layout.size());
                unsafe { core::ptr::write_bytes(chunk.ptr.as_ptr(), 0, chunk.layout.size()) };
                chunk
            }
            None => {
                let layout =
                    Layout::from_size_align(bytes, ALIGN).map_err(|_| Error::Alloc { bytes })?;
                let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
                let ptr = NonNull::new(ptr).ok_or(Error::Alloc { bytes })?;
                log::debug!("allocated {bytes} byte workspace");
                Chunk { ptr, layout }
            }
        };

        state.in_use += chunk.layout.size();
        Ok(Workspace {
            pool: self,
            chunk: Some(chunk),
        })
    }

    fn release(&self, chunk: Chunk) {
        let mut state = self.lock();
        state.in_use -= chunk.layout.size();
        state.free.push(chunk);
    }

    /// Drops every cached buffer not currently lent out.
    pub fn trim(&self) {
        self.lock().free.clear();
    }
}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Scoped packing buffer, returned to its pool on drop.
pub struct Workspace<'a> {
    pool: &'a Pool,
    chunk: Option<Chunk>,
}

impl Workspace<'_> {
    pub fn len_bytes(&self) -> usize {
        self.chunk.as_ref().map_or(0, |c| c.layout.size())
    }

    pub fn as_mut_ptr<T>(&mut self) -> *mut T {
        self.chunk
            .as_ref()
            .map_or(core::ptr::null_mut(), |c| c.ptr.as_ptr() as *mut T)
    }
}

impl Drop for Workspace<'_> {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.pool.release(chunk);
        }
    }
}
