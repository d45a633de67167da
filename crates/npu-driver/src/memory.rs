// SPDX-License-Identifier: AGPL-3.0-only

//! DMA memory for sessions.
//!
//! [`HostMemory`] backs buffers with host memory and hands out page-aligned
//! IOVAs below 4 GiB. Dropping a [`DmaBuffer`] returns its IOVA range.

use crate::error::{NpuError, Result};
use bytes::BytesMut;
use rustix::mm::{mlock, munlock};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// First IOVA handed out by [`HostMemory`]
pub const IOVA_BASE: u64 = 0x1000_0000;

/// Allocation granule
pub const PAGE_SIZE: usize = 4096;

type SharedBytes = Arc<Mutex<BytesMut>>;

fn lock(bytes: &SharedBytes) -> MutexGuard<'_, BytesMut> {
    bytes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Caller-owned NCP blob
///
/// Cloning the handle, or mapping it, shares the same bytes.
#[derive(Debug, Clone)]
pub struct NcpHandle {
    bytes: SharedBytes,
}

impl NcpHandle {
    /// Wrap a blob
    pub fn new(blob: impl AsRef<[u8]>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(BytesMut::from(blob.as_ref()))),
        }
    }

    /// Blob length in bytes
    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    /// Whether the blob is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Holders of the blob, this handle included
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.bytes).to_vec()
    }
}

/// How a buffer came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Allocated by the driver
    Allocated,
    /// Mapped from a caller handle
    Mapped,
}

/// Free ranges are kept sorted by address and coalesced
#[derive(Debug)]
struct IovaSpace {
    next: u64,
    free: Vec<(u64, u64)>,
}

impl IovaSpace {
    const fn new(base: u64) -> Self {
        Self {
            next: base,
            free: Vec::new(),
        }
    }

    /// First fit from the free list, then the untouched tail
    fn reserve(&mut self, span: u64) -> Result<u64> {
        if let Some(index) = self.free.iter().position(|&(_, len)| len >= span) {
            let (daddr, len) = self.free[index];
            if len == span {
                self.free.remove(index);
            } else {
                self.free[index] = (daddr + span, len - span);
            }
            return Ok(daddr);
        }
        let daddr = self.next;
        let end = daddr.saturating_add(span);
        if u32::try_from(end - 1).is_err() {
            return Err(NpuError::AddressOverflow { daddr });
        }
        self.next = end;
        Ok(daddr)
    }

    fn release(&mut self, daddr: u64, span: u64) {
        let mut index = self.free.partition_point(|&(start, _)| start < daddr);
        self.free.insert(index, (daddr, span));
        if let Some(&(next, len)) = self.free.get(index + 1) {
            if daddr + span == next {
                self.free[index].1 += len;
                self.free.remove(index + 1);
            }
        }
        if let Some(&(prev, len)) = index.checked_sub(1).and_then(|i| self.free.get(i)) {
            if prev + len == daddr {
                let merged = self.free.remove(index).1;
                self.free[index - 1].1 += merged;
                index -= 1;
            }
        }
        if let Some(&(start, len)) = self.free.get(index) {
            if index + 1 == self.free.len() && start + len == self.next {
                self.next = start;
                self.free.pop();
            }
        }
    }
}

type SharedSpace = Arc<Mutex<IovaSpace>>;

/// Device-visible buffer
pub struct DmaBuffer {
    bytes: SharedBytes,
    daddr: u64,
    vaddr: u64,
    size: usize,
    span: u64,
    origin: Origin,
    locked: bool,
    live: Arc<AtomicUsize>,
    space: SharedSpace,
}

impl DmaBuffer {
    /// Device address
    pub const fn daddr(&self) -> u64 {
        self.daddr
    }

    /// Host address
    pub const fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// How the buffer was obtained
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Run `f` over the contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&lock(&self.bytes))
    }

    /// Run `f` over the contents, mutably
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut lock(&self.bytes))
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("daddr", &format_args!("{:#x}", self.daddr))
            .field("size", &self.size)
            .field("origin", &self.origin)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if self.locked {
            let mut bytes = lock(&self.bytes);
            // SAFETY: the range was locked in `HostMemory::alloc` and the
            // allocation is never resized, so it still covers `size` bytes.
            if let Err(e) = unsafe { munlock(bytes.as_mut_ptr().cast(), self.size) } {
                tracing::warn!("munlock of {:#x} failed: {e}", self.daddr);
            }
        }
        self.space
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(self.daddr, self.span);
        self.live.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!("Released {:?} buffer at daddr={:#x}", self.origin, self.daddr);
    }
}

/// Source of device memory
pub trait DmaAllocator: Send + Sync + fmt::Debug {
    /// Allocate `size` zeroed bytes
    ///
    /// # Errors
    ///
    /// [`NpuError::AllocFailed`] on exhaustion, [`NpuError::AddressOverflow`]
    /// if the device address does not fit 32 bits.
    fn alloc(&self, size: usize) -> Result<DmaBuffer>;

    /// Map the caller's NCP blob for device access
    ///
    /// # Errors
    ///
    /// [`NpuError::MapFailed`] if the blob cannot be mapped.
    fn map(&self, handle: &NcpHandle) -> Result<DmaBuffer>;

    /// Make `len` bytes at `offset` visible to the device
    ///
    /// # Errors
    ///
    /// [`NpuError::InvalidArgument`] if the range exceeds the buffer.
    fn sync_for_device(&self, buffer: &DmaBuffer, offset: usize, len: usize) -> Result<()>;

    /// Buffers handed out and not yet dropped
    fn live_buffers(&self) -> usize;
}

#[derive(Debug, Default)]
struct Faults {
    fail_alloc_at: Option<usize>,
    fail_map_at: Option<usize>,
    allocs: usize,
    maps: usize,
}

/// Host-memory allocator
#[derive(Debug)]
pub struct HostMemory {
    space: SharedSpace,
    live: Arc<AtomicUsize>,
    syncs: AtomicUsize,
    lock_pages: bool,
    faults: Mutex<Faults>,
}

impl HostMemory {
    /// IOVAs start at [`IOVA_BASE`]
    pub fn new(lock_pages: bool) -> Self {
        Self::with_base(IOVA_BASE, lock_pages)
    }

    /// IOVAs start at `base`
    pub fn with_base(base: u64, lock_pages: bool) -> Self {
        Self {
            space: Arc::new(Mutex::new(IovaSpace::new(base))),
            live: Arc::new(AtomicUsize::new(0)),
            syncs: AtomicUsize::new(0),
            lock_pages,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fail the `n`-th allocation from now (1-based)
    pub fn fail_nth_alloc(&self, n: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        faults.fail_alloc_at = Some(faults.allocs + n);
    }

    /// Fail the `n`-th mapping from now (1-based)
    pub fn fail_nth_map(&self, n: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        faults.fail_map_at = Some(faults.maps + n);
    }

    /// Allocation attempts so far
    pub fn alloc_attempts(&self) -> usize {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).allocs
    }

    /// Cache syncs performed
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Acquire)
    }

    fn reserve(&self, size: usize) -> Result<(u64, u64)> {
        let span = (size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE) as u64;
        let daddr = self
            .space
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve(span)?;
        Ok((daddr, span))
    }

    fn release(&self, (daddr, span): (u64, u64)) {
        self.space
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(daddr, span);
    }

    fn buffer(
        &self,
        bytes: SharedBytes,
        (daddr, span): (u64, u64),
        size: usize,
        origin: Origin,
        locked: bool,
    ) -> DmaBuffer {
        let vaddr = lock(&bytes).as_ptr() as u64;
        self.live.fetch_add(1, Ordering::AcqRel);
        DmaBuffer {
            bytes,
            daddr,
            vaddr,
            size,
            span,
            origin,
            locked,
            live: Arc::clone(&self.live),
            space: Arc::clone(&self.space),
        }
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DmaAllocator for HostMemory {
    fn alloc(&self, size: usize) -> Result<DmaBuffer> {
        {
            let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            faults.allocs += 1;
            if faults.fail_alloc_at == Some(faults.allocs) {
                faults.fail_alloc_at = None;
                tracing::warn!("Injected failure for allocation #{}", faults.allocs);
                return Err(NpuError::alloc_failed(size, "injected fault"));
            }
        }

        let range = self.reserve(size)?;
        let mut bytes = BytesMut::zeroed(size);
        let mut locked = false;
        if self.lock_pages && size > 0 {
            // SAFETY: the pointer and length describe the live allocation
            // just created; it is never resized while the buffer exists.
            match unsafe { mlock(bytes.as_mut_ptr().cast(), size) } {
                Ok(()) => locked = true,
                Err(e) => {
                    self.release(range);
                    return Err(NpuError::alloc_failed(size, format!("failed to lock pages: {e}")));
                }
            }
        }

        tracing::debug!("Allocated DMA buffer: daddr={:#x}, size={size:#x}", range.0);
        Ok(self.buffer(Arc::new(Mutex::new(bytes)), range, size, Origin::Allocated, locked))
    }

    fn map(&self, handle: &NcpHandle) -> Result<DmaBuffer> {
        {
            let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            faults.maps += 1;
            if faults.fail_map_at == Some(faults.maps) {
                faults.fail_map_at = None;
                tracing::warn!("Injected failure for mapping #{}", faults.maps);
                return Err(NpuError::map_failed("injected fault"));
            }
        }

        let size = handle.len();
        if size == 0 {
            return Err(NpuError::map_failed("NCP handle is empty"));
        }
        let range = self.reserve(size)?;
        tracing::debug!("Mapped NCP: daddr={:#x}, size={size:#x}", range.0);
        Ok(self.buffer(Arc::clone(&handle.bytes), range, size, Origin::Mapped, false))
    }

    fn sync_for_device(&self, buffer: &DmaBuffer, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= buffer.size => {}
            _ => {
                return Err(NpuError::invalid_argument(format!(
                    "sync of {len} bytes at {offset} exceeds buffer of {}",
                    buffer.size
                )));
            }
        }
        // Host memory is coherent with itself; the fence orders our writes
        // before the worker thread observes the request.
        std::sync::atomic::fence(Ordering::Release);
        self.syncs.fetch_add(1, Ordering::AcqRel);
        tracing::trace!("Synced daddr={:#x} [{offset:#x}+{len:#x}]", buffer.daddr);
        Ok(())
    }

    fn live_buffers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iovas_are_page_aligned_and_increasing() {
        let memory = HostMemory::default();
        let a = memory.alloc(10).unwrap();
        let b = memory.alloc(PAGE_SIZE + 1).unwrap();
        let c = memory.alloc(0).unwrap();
        assert_eq!(a.daddr(), IOVA_BASE);
        assert_eq!(b.daddr(), IOVA_BASE + PAGE_SIZE as u64);
        assert_eq!(c.daddr(), IOVA_BASE + 3 * PAGE_SIZE as u64);
        assert_eq!(b.size(), PAGE_SIZE + 1);
        assert_eq!(memory.live_buffers(), 3);
        drop((a, b, c));
        assert_eq!(memory.live_buffers(), 0);
    }

    #[test]
    fn allocations_are_zeroed() {
        let memory = HostMemory::default();
        let buffer = memory.alloc(64).unwrap();
        assert!(buffer.read(|bytes| bytes.iter().all(|b| *b == 0)));
        buffer.write(|bytes| bytes[3] = 7);
        assert_eq!(buffer.read(|bytes| bytes[3]), 7);
    }

    #[test]
    fn mapping_shares_the_callers_bytes() {
        let memory = HostMemory::default();
        let handle = NcpHandle::new([1u8, 2, 3, 4]);
        assert_eq!(handle.ref_count(), 1);

        let mapped = memory.map(&handle).unwrap();
        assert_eq!(mapped.origin(), Origin::Mapped);
        assert_eq!(handle.ref_count(), 2);
        mapped.write(|bytes| bytes[0] = 9);
        assert_eq!(handle.snapshot(), vec![9, 2, 3, 4]);

        drop(mapped);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn injected_faults_fire_once() {
        let memory = HostMemory::default();
        memory.fail_nth_alloc(2);
        let first = memory.alloc(8).unwrap();
        assert!(matches!(memory.alloc(8), Err(NpuError::AllocFailed { .. })));
        let third = memory.alloc(8).unwrap();
        assert_eq!(memory.live_buffers(), 2);
        drop((first, third));

        let handle = NcpHandle::new([0u8; 16]);
        memory.fail_nth_map(1);
        assert!(matches!(memory.map(&handle), Err(NpuError::MapFailed { .. })));
        assert_eq!(handle.ref_count(), 1);
        assert!(memory.map(&handle).is_ok());
    }

    #[test]
    fn addresses_beyond_32_bits_are_refused() {
        let memory = HostMemory::with_base(0xffff_f000, false);
        let last = memory.alloc(PAGE_SIZE).unwrap();
        assert_eq!(last.daddr(), 0xffff_f000);
        assert!(matches!(memory.alloc(1), Err(NpuError::AddressOverflow { .. })));
    }

    #[test]
    fn freed_iovas_are_reused() {
        let memory = HostMemory::with_base(0xffff_0000, false);
        for _ in 0..40 {
            let buffer = memory.alloc(PAGE_SIZE).unwrap();
            assert_eq!(buffer.daddr(), 0xffff_0000);
        }

        let a = memory.alloc(PAGE_SIZE).unwrap();
        let b = memory.alloc(2 * PAGE_SIZE).unwrap();
        let c = memory.alloc(PAGE_SIZE).unwrap();
        let hole = b.daddr();
        drop(b);
        let d = memory.alloc(PAGE_SIZE).unwrap();
        let e = memory.alloc(PAGE_SIZE).unwrap();
        assert_eq!(d.daddr(), hole);
        assert_eq!(e.daddr(), hole + PAGE_SIZE as u64);
        assert!(c.daddr() > e.daddr());
        drop((a, c, d, e));

        let whole = memory.alloc(16 * PAGE_SIZE).unwrap();
        assert_eq!(whole.daddr(), 0xffff_0000);
        assert!(matches!(memory.alloc(1), Err(NpuError::AddressOverflow { .. })));
    }

    #[test]
    fn sync_checks_range() {
        let memory = HostMemory::default();
        let buffer = memory.alloc(128).unwrap();
        memory.sync_for_device(&buffer, 0, 128).unwrap();
        memory.sync_for_device(&buffer, 64, 64).unwrap();
        assert!(memory.sync_for_device(&buffer, 64, 65).is_err());
        assert!(memory.sync_for_device(&buffer, usize::MAX, 2).is_err());
        assert_eq!(memory.sync_count(), 2);
    }
}
