//! Slab-recycling buffer pool.
//!
//! Buffers are carved out of larger slab allocations and handed to
//! connections (ring backing stores) and datagram tasks. Returning a buffer
//! either pushes it back on the free list, or — once the free list already
//! holds `min_retained` buffers — retires it by decrementing its slab's
//! refcount. A slab is deallocated when its last buffer retires, so hot
//! memory stays resident while idle slabs are released whole.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use slab::Slab;

/// One contiguous allocation carved into fixed-size buffers.
///
/// `live` counts buffers that are either checked out or on the free list;
/// it starts at the carve count and only ever decreases, when a returned
/// buffer is retired past the retention threshold.
struct SlabBlock {
    base: NonNull<u8>,
    layout: Layout,
    live: u32,
}

unsafe impl Send for SlabBlock {}

impl Drop for SlabBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[derive(Clone, Copy)]
struct BufId {
    slab: usize,
    index: u32,
}

struct PoolInner {
    slabs: Slab<SlabBlock>,
    free: Vec<BufId>,
    checked_out: usize,
}

/// Pool of fixed-size byte buffers with whole-slab reclamation.
pub struct BufferPool {
    buf_size: usize,
    slab_count: usize,
    min_retained: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// `slab_count` buffers are allocated per slab (halved on allocation
    /// failure, down to one); the free list keeps up to `min_retained`
    /// buffers resident before returned buffers start retiring their slabs.
    pub fn new(buf_size: usize, slab_count: usize, min_retained: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            buf_size,
            slab_count,
            min_retained,
            inner: Mutex::new(PoolInner {
                slabs: Slab::new(),
                free: Vec::new(),
                checked_out: 0,
            }),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Check out one buffer, growing the pool by a slab if the free list is
    /// empty. Returns `None` only when allocation fails outright.
    pub fn get(self: &Arc<Self>) -> Option<PoolBuffer> {
        let mut inner = self.lock();

        if inner.free.is_empty() && !self.grow(&mut inner) {
            return None;
        }

        let id = inner.free.pop()?;
        inner.checked_out += 1;
        let base = inner.slabs[id.slab].base;
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(id.index as usize * self.buf_size)) };

        Some(PoolBuffer {
            ptr,
            len: self.buf_size,
            id,
            pool: Arc::clone(self),
        })
    }

    /// Number of buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of buffers currently checked out.
    pub fn outstanding_count(&self) -> usize {
        self.lock().checked_out
    }

    /// Number of live slabs.
    pub fn slab_count(&self) -> usize {
        self.lock().slabs.len()
    }

    /// Sum of live (unretired) buffers across all slabs. Equals
    /// `free_count() + outstanding_count()` at all times.
    pub fn live_buffer_count(&self) -> usize {
        self.lock().slabs.iter().map(|(_, s)| s.live as usize).sum()
    }

    /// Drop every retained slab. Fails if any buffer is still checked out.
    pub fn reset(&self) -> Result<(), crate::error::Error> {
        let mut inner = self.lock();
        if inner.checked_out != 0 {
            return Err(crate::error::Error::State(
                "pool reset with buffers still checked out",
            ));
        }
        // Retire every free-list entry; slabs drop as their counts reach zero.
        while let Some(id) = inner.free.pop() {
            let slab = &mut inner.slabs[id.slab];
            slab.live -= 1;
            if slab.live == 0 {
                inner.slabs.remove(id.slab);
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a slab of up to `slab_count` buffers, halving the request on
    /// failure. Returns false only when even a single-buffer slab fails.
    fn grow(&self, inner: &mut PoolInner) -> bool {
        let mut count = self.slab_count;
        while count > 0 {
            if let Ok(layout) = Layout::from_size_align(self.buf_size * count, 64) {
                let raw = unsafe { alloc_zeroed(layout) };
                if let Some(base) = NonNull::new(raw) {
                    let key = inner.slabs.insert(SlabBlock {
                        base,
                        layout,
                        live: count as u32,
                    });
                    for index in 0..count as u32 {
                        inner.free.push(BufId { slab: key, index });
                    }
                    return true;
                }
            }
            count /= 2;
        }
        false
    }

    fn put(&self, id: BufId) {
        let mut inner = self.lock();
        inner.checked_out -= 1;
        if inner.free.len() >= self.min_retained {
            let slab = &mut inner.slabs[id.slab];
            slab.live -= 1;
            if slab.live == 0 {
                inner.slabs.remove(id.slab);
            }
        } else {
            inner.free.push(id);
        }
    }
}

/// A checked-out pool buffer. Returns itself to the pool on drop.
pub struct PoolBuffer {
    ptr: NonNull<u8>,
    len: usize,
    id: BufId,
    pool: Arc<BufferPool>,
}

unsafe impl Send for PoolBuffer {}

impl PoolBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        self.pool.put(self.id);
    }
}
