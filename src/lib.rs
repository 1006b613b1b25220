//! Userspace model of a CX2388x-based SDR capture driver.
//!
//! The chip's own RISC DMA engine scatters ADC samples into a ring of host
//! pages forever; the host only ever looks at the VBI page counter to know
//! how far it got. Everything here is built around that one signal.

pub mod args;
pub mod cdt;
pub mod control;
pub mod controller;
pub mod device;
pub mod dma;
pub mod error;
pub mod irq;
pub mod pool;
pub mod reader;
pub mod regs;
pub mod risc;
pub mod sim;

pub use device::{Device, DeviceRegistry, DriverParams, PciFunction};
pub use error::{Error, Result};
pub use reader::{ReadMode, Session};

pub const DRV_NAME: &str = "CX2388x SDR";
pub const MODULE_NAME: &str = "cx88_sdr";

/// Conexant PCI IDs matched at probe time
pub const PCI_VENDOR_ID: u16 = 0x14f1;
pub const PCI_DEVICE_ID: u16 = 0x8800;

pub const MAX_CARDS: usize = 32;

pub const PAGE_SIZE: usize = 4096;
/// One RISC write instruction moves one cluster
pub const CLUSTER_SIZE: usize = 2048;
/// Number of cluster buffers in the on-chip SRAM FIFO
pub const CLUSTER_BUF_NUM: u32 = 8;
pub const DMA_SIZE: usize = 64 * 1024 * 1024;
pub const DMA_PAGES: usize = DMA_SIZE / PAGE_SIZE;
/// Pages between two RISC interrupt requests
pub const IRQ_PERIOD: usize = 0x200;

pub const XTAL_FREQ: u32 = 28_636_363;
