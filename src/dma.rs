//! DMA-coherent memory.
//!
//! The capture chip only addresses 32-bit bus space, so every region carries
//! the bus address the chip must be told about alongside the host pointer.
//! Regions are shared with the device: the chip writes them while the host
//! reads them, with no lock in between.

use std::{
    alloc::{self, Layout},
    collections::BTreeMap,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
};

use crate::{
    error::{Error, Result},
    PAGE_SIZE,
};

/// Supplier of DMA-coherent memory for one PCI function.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `size` zeroed bytes, page aligned, below 4 GiB on the bus
    fn alloc_coherent(&self, size: usize) -> Result<Arc<DmaMemory>>;
}

/// One physically contiguous DMA region.
pub struct DmaMemory {
    ptr: NonNull<u8>,
    layout: Layout,
    bus_addr: u32,
    live: Arc<AtomicUsize>,
}

// Safety: the region is shared with a bus master that writes it while the
// host reads it. Every access from this side goes through relaxed atomic byte
// cells (`cell`), so concurrent access is torn at worst, never a data race.
unsafe impl Send for DmaMemory {}
unsafe impl Sync for DmaMemory {}

impl std::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("bus_addr", &format_args!("{:#010x}", self.bus_addr))
            .field("len", &self.len())
            .finish()
    }
}

impl DmaMemory {
    pub fn bus_addr(&self) -> u32 {
        self.bus_addr
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len()),
            "DMA access {}+{} outside of {} byte region",
            offset,
            len,
            self.len()
        );
    }

    fn cell(&self, index: usize) -> &AtomicU8 {
        // Safety: callers bounds check `index`; `AtomicU8` has the layout of
        // `u8` and the allocation lives as long as `self`
        unsafe { &*(self.ptr.as_ptr().add(index) as *const AtomicU8) }
    }

    /// Copy bytes out of the region starting at `offset`
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.cell(offset + i).load(Ordering::Relaxed);
        }
    }

    /// Copy bytes into the region starting at `offset`
    pub fn write(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        for (i, &b) in src.iter().enumerate() {
            self.cell(offset + i).store(b, Ordering::Relaxed);
        }
    }

    pub fn zero(&self, offset: usize, len: usize) {
        self.check(offset, len);
        for i in offset..offset + len {
            self.cell(i).store(0, Ordering::Relaxed);
        }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        self.read(offset, &mut word);
        u32::from_le_bytes(word)
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        // Safety: allocated in `HostMemory::alloc_coherent` with this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Host RAM handed out with synthetic 32-bit bus addresses.
///
/// Backs the chip model and tests. Bus addresses are assigned from a bump
/// pointer and never reused, so a stale address can't resolve to a new region.
pub struct HostMemory {
    next_bus: Mutex<u64>,
    live: Arc<AtomicUsize>,
    // Fail every allocation once this many have succeeded
    fail_after: Option<usize>,
    allocated: AtomicUsize,
    regions: Mutex<BTreeMap<u32, Weak<DmaMemory>>>,
}

/// First bus address handed out; keeps zero and low memory unmapped
const BUS_BASE: u64 = 0x1000_0000;
const BUS_LIMIT: u64 = 1 << 32;

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemory {
    pub fn new() -> Self {
        Self {
            next_bus: Mutex::new(BUS_BASE),
            live: Arc::new(AtomicUsize::new(0)),
            fail_after: None,
            allocated: AtomicUsize::new(0),
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    /// An allocator that runs out of memory after `n` successful allocations
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new()
        }
    }

    /// Number of regions currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Find the region containing `bus_addr`, as the chip would through the bus
    pub fn resolve(&self, bus_addr: u32) -> Option<(Arc<DmaMemory>, usize)> {
        let regions = self.regions.lock().ok()?;
        let (&base, weak) = regions.range(..=bus_addr).next_back()?;
        let mem = weak.upgrade()?;
        let offset = (bus_addr - base) as usize;
        (offset < mem.len()).then(|| (mem, offset))
    }
}

impl DmaAllocator for HostMemory {
    fn alloc_coherent(&self, size: usize) -> Result<Arc<DmaMemory>> {
        if size == 0 {
            return Err(Error::Allocation("zero sized DMA region".to_owned()));
        }
        if let Some(n) = self.fail_after {
            if self.allocated.load(Ordering::Acquire) >= n {
                return Err(Error::Allocation(format!(
                    "out of DMA memory after {} allocations",
                    n
                )));
            }
        }
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let bus_addr = {
            let mut next = self
                .next_bus
                .lock()
                .map_err(|_| Error::Allocation("bus allocator poisoned".to_owned()))?;
            if *next + size as u64 > BUS_LIMIT {
                return Err(Error::Allocation(format!(
                    "{} bytes do not fit below 4 GiB",
                    size
                )));
            }
            let addr = *next as u32;
            *next += size as u64;
            addr
        };
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| Error::Allocation(e.to_string()))?;
        // Safety: layout has a non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| Error::Allocation(format!("host allocation of {} bytes", size)))?;
        self.live.fetch_add(1, Ordering::AcqRel);
        self.allocated.fetch_add(1, Ordering::AcqRel);
        let mem = Arc::new(DmaMemory {
            ptr,
            layout,
            bus_addr,
            live: self.live.clone(),
        });
        if let Ok(mut regions) = self.regions.lock() {
            regions.insert(bus_addr, Arc::downgrade(&mem));
        }
        Ok(mem)
    }
}
