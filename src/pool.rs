//! The ring of DMA pages the chip writes samples into.

use std::sync::Arc;

use tracing::info;

use crate::{
    dma::{DmaAllocator, DmaMemory},
    error::{Error, Result},
    CLUSTER_SIZE, DMA_SIZE, IRQ_PERIOD, PAGE_SIZE,
};

/// The page counter is 16 bits wide; the pool must tile its range exactly
pub const COUNTER_RANGE: usize = 1 << 16;
/// Largest byte count a RISC write instruction can carry
pub const MAX_CLUSTER_SIZE: usize = 0xfff;

/// Shape of the capture ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total bytes in the ring
    pub capacity: usize,
    pub page_size: usize,
    /// Bytes moved by one RISC write
    pub cluster_size: usize,
    /// Pages between interrupt requests
    pub irq_period: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            capacity: DMA_SIZE,
            page_size: PAGE_SIZE,
            cluster_size: CLUSTER_SIZE,
            irq_period: IRQ_PERIOD,
        }
    }
}

impl Geometry {
    /// The default page/cluster layout with a different total size
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn pages(&self) -> usize {
        if self.page_size == 0 {
            0
        } else {
            self.capacity / self.page_size
        }
    }

    pub fn clusters_per_page(&self) -> usize {
        if self.cluster_size == 0 {
            0
        } else {
            self.page_size / self.cluster_size
        }
    }

    /// Checks everything the pool, descriptor table and program rely on.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::Configuration(msg));
        if self.page_size == 0 || self.capacity % self.page_size != 0 {
            return bad(format!(
                "capacity {} is not a whole number of {} byte pages",
                self.capacity, self.page_size
            ));
        }
        if self.cluster_size == 0 || self.page_size % self.cluster_size != 0 {
            return bad(format!(
                "page size {} is not a whole number of {} byte clusters",
                self.page_size, self.cluster_size
            ));
        }
        if self.cluster_size % 8 != 0 || self.cluster_size > MAX_CLUSTER_SIZE {
            return bad(format!(
                "cluster size {} must be a multiple of 8 no larger than {}",
                self.cluster_size, MAX_CLUSTER_SIZE
            ));
        }
        let pages = self.pages();
        if pages == 0 {
            return bad("a ring needs at least one page".to_owned());
        }
        if COUNTER_RANGE % pages != 0 {
            return bad(format!(
                "{} pages do not divide the 16-bit page counter",
                pages
            ));
        }
        if !self.irq_period.is_power_of_two() {
            return bad(format!(
                "interrupt period {} is not a power of two",
                self.irq_period
            ));
        }
        Ok(())
    }
}

/// Fixed array of DMA pages, logically circular.
pub struct RingPool {
    geometry: Geometry,
    pages: Vec<Arc<DmaMemory>>,
}

impl RingPool {
    /// Allocate every page of the ring.
    ///
    /// On failure the pages obtained so far are dropped before returning, so a
    /// failed allocation leaves nothing behind.
    pub fn allocate(alloc: &dyn DmaAllocator, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let pages = (0..geometry.pages())
            .map(|_| alloc.alloc_coherent(geometry.page_size))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "DMA buffer: {} MiB in {} pages",
            geometry.capacity / (1024 * 1024),
            pages.len()
        );
        Ok(Self { geometry, pages })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.geometry.page_size
    }

    pub fn page(&self, index: usize) -> &DmaMemory {
        &self.pages[index]
    }

    /// Bus address of a page, as programmed into the chip
    pub fn physical_address(&self, index: usize) -> u32 {
        self.pages[index].bus_addr()
    }

    pub fn physical_addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.iter().map(|p| p.bus_addr())
    }

    /// Ring index of the last page the chip finished, given its page counter.
    ///
    /// The counter points at the page being filled, which is not readable yet.
    pub fn page_index(&self, counter: u32) -> usize {
        let n = self.pages.len();
        ((counter as usize & (COUNTER_RANGE - 1)) + n - 1) % n
    }
}
