//! Cluster descriptor tables.
//!
//! [`DescriptorTable`] is the host side view: one bus address per cluster slot
//! across the whole ring, in the order the RISC program visits them.
//! [`setup_sram`] programs the chip's own channel 24 CDT, which describes the
//! small FIFO of cluster buffers in on-chip SRAM that feeds those writes.

use tracing::debug;

use crate::{
    error::{Error, Result},
    pool::RingPool,
    regs::{self, RegisterWindow},
    risc::Program,
};

/// Byte distance between two entries of the on-chip CDT
pub const SRAM_CDT_STRIDE: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTable {
    entries: Vec<u32>,
    cluster_size: usize,
    clusters_per_page: usize,
}

impl DescriptorTable {
    /// One entry per cluster slot: entry `i` is cluster `i % k` of page `i / k`
    pub fn build(pool: &RingPool, cluster_size: usize) -> Result<Self> {
        if cluster_size == 0 || pool.page_size() % cluster_size != 0 {
            return Err(Error::Configuration(format!(
                "{} byte clusters do not tile {} byte pages",
                cluster_size,
                pool.page_size()
            )));
        }
        let clusters_per_page = pool.page_size() / cluster_size;
        let entries = pool
            .physical_addresses()
            .flat_map(|base| (0..clusters_per_page).map(move |c| base + (c * cluster_size) as u32))
            .collect();
        Ok(Self {
            entries,
            cluster_size,
            clusters_per_page,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn clusters_per_page(&self) -> usize {
        self.clusters_per_page
    }

    /// Entry `i`, wrapping past the end back to entry 0
    pub fn entry(&self, i: usize) -> u32 {
        self.entries[i % self.entries.len()]
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// The program's write targets must be exactly this table, in order.
    /// A mismatch means the chip would scatter samples somewhere else.
    pub fn check_program(&self, program: &Program) -> Result<()> {
        let targets = program.write_targets();
        if targets.len() != self.entries.len() {
            return Err(Error::Configuration(format!(
                "program has {} cluster writes, descriptor table has {} entries",
                targets.len(),
                self.entries.len()
            )));
        }
        if let Some((i, (t, e))) = targets
            .iter()
            .zip(&self.entries)
            .enumerate()
            .find(|(_, (t, e))| t != e)
        {
            return Err(Error::Configuration(format!(
                "cluster {} written to {:#010x}, table says {:#010x}",
                i, t, e
            )));
        }
        Ok(())
    }
}

/// Program channel 24: the SRAM cluster FIFO, its CDT and the channel command
/// block pointing the RISC engine at `program_addr`.
pub fn setup_sram(
    regs: &dyn RegisterWindow,
    program_addr: u32,
    num_buffers: u32,
    cluster_size: u32,
) {
    let mut buf = regs::CLUSTER_BUF_BASE;
    for i in 0..num_buffers {
        regs.write32(regs::CDT_BASE + SRAM_CDT_STRIDE * i, buf);
        buf += cluster_size;
    }

    regs.write32(regs::CHN24_CMDS_BASE, program_addr);
    regs.write32(regs::CHN24_CMDS_BASE + 4, regs::CDT_BASE);
    regs.write32(regs::CHN24_CMDS_BASE + 8, num_buffers * 2);
    regs.write32(regs::CHN24_CMDS_BASE + 12, regs::RISC_INST_QUEUE);
    regs.write32(regs::CHN24_CMDS_BASE + 16, 0x40);

    regs.write32(regs::MO_DMA24_PTR2, regs::CDT_BASE);
    regs.write32(regs::MO_DMA24_CNT1, (cluster_size >> 3) - 1);
    regs.write32(regs::MO_DMA24_CNT2, num_buffers * 2);
    debug!(
        "channel 24: {} SRAM clusters of {} bytes, program at {:#010x}",
        num_buffers, cluster_size, program_addr
    );
}
