//! CX2388x register map and access to the BAR 0 register window.
//!
//! Every register is 32 bits wide, little-endian, at a fixed byte offset from
//! the start of BAR 0.

use std::{fs::OpenOptions, path::Path, ptr::NonNull};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::error::{Error, Result};

/// Video interrupts we care about (RISC IRQs and errors on the VBI channel)
pub const INTERRUPT_MASK: u32 = 0x018888;
/// Raised in `MO_VID_INTSTAT` when a RISC instruction carries the IRQ1 flag
pub const VID_INTSTAT_VBI_RISCI1: u32 = 1 << 3;

pub const MO_DEV_CNTRL2: u32 = 0x200034; // Device control
pub const MO_PCI_INTMSK: u32 = 0x200040; // PCI interrupt mask
pub const MO_VID_INTMSK: u32 = 0x200050;
pub const MO_VID_INTSTAT: u32 = 0x200054;
pub const MO_DMA24_PTR2: u32 = 0x3000cc; // {24}RW* DMA Tab Ptr : Ch#24
pub const MO_DMA24_CNT1: u32 = 0x30010c; // {11}RW* DMA Buffer Size : Ch#24
pub const MO_DMA24_CNT2: u32 = 0x30014c; // {11}RW* DMA Table Size : Ch#24
pub const MO_VBI_GPCNT: u32 = 0x31c02c; // {16}RO VBI general purpose counter
pub const MO_VID_DMACNTRL: u32 = 0x31c040; // {8}RW Video DMA control
pub const MO_INPUT_FORMAT: u32 = 0x310104;
pub const MO_CONTR_BRIGHT: u32 = 0x310110;
pub const MO_OUTPUT_FORMAT: u32 = 0x310164;
pub const MO_PLL_REG: u32 = 0x310168; // PLL register
pub const MO_SCONV_REG: u32 = 0x310170; // sample rate conversion register
pub const MO_CAPTURE_CTRL: u32 = 0x310180; // capture control
pub const MO_COLOR_CTRL: u32 = 0x310184;
pub const MO_VBI_PACKET: u32 = 0x310188; // vbi packet size / delay
pub const MO_AGC_BACK_VBI: u32 = 0x310200;
pub const MO_AGC_SYNC_SLICER: u32 = 0x310204;
pub const MO_AGC_SYNC_TIP2: u32 = 0x31020c;
pub const MO_AGC_SYNC_TIP3: u32 = 0x310210;
pub const MO_AGC_GAIN_ADJ2: u32 = 0x310218;
pub const MO_AGC_GAIN_ADJ3: u32 = 0x31021c;
pub const MO_AGC_GAIN_ADJ4: u32 = 0x310220;
pub const MO_AFECFG_IO: u32 = 0x35c04c;

// On-chip SRAM, also addressed through BAR 0
pub const CX_SRAM_BASE: u32 = 0x180000;
pub const CHN24_CMDS_BASE: u32 = 0x180100;
pub const RISC_INST_QUEUE: u32 = CX_SRAM_BASE + 0x0800;
pub const CDT_BASE: u32 = CX_SRAM_BASE + 0x1000;
pub const CLUSTER_BUF_BASE: u32 = CX_SRAM_BASE + 0x4000;

/// Size of BAR 0 on the CX2388x
pub const BAR0_SIZE: usize = 0x100_0000;

/// Registers shown by `log_status` and the register dump
pub const REGISTER_NAMES: &[(&str, u32)] = &[
    ("MO_DEV_CNTRL2", MO_DEV_CNTRL2),
    ("MO_PCI_INTMSK", MO_PCI_INTMSK),
    ("MO_VID_INTMSK", MO_VID_INTMSK),
    ("MO_VID_INTSTAT", MO_VID_INTSTAT),
    ("MO_DMA24_PTR2", MO_DMA24_PTR2),
    ("MO_DMA24_CNT1", MO_DMA24_CNT1),
    ("MO_DMA24_CNT2", MO_DMA24_CNT2),
    ("MO_VBI_GPCNT", MO_VBI_GPCNT),
    ("MO_VID_DMACNTRL", MO_VID_DMACNTRL),
    ("MO_INPUT_FORMAT", MO_INPUT_FORMAT),
    ("MO_CONTR_BRIGHT", MO_CONTR_BRIGHT),
    ("MO_OUTPUT_FORMAT", MO_OUTPUT_FORMAT),
    ("MO_PLL_REG", MO_PLL_REG),
    ("MO_SCONV_REG", MO_SCONV_REG),
    ("MO_CAPTURE_CTRL", MO_CAPTURE_CTRL),
    ("MO_COLOR_CTRL", MO_COLOR_CTRL),
    ("MO_VBI_PACKET", MO_VBI_PACKET),
    ("MO_AGC_BACK_VBI", MO_AGC_BACK_VBI),
    ("MO_AGC_SYNC_SLICER", MO_AGC_SYNC_SLICER),
    ("MO_AGC_SYNC_TIP2", MO_AGC_SYNC_TIP2),
    ("MO_AGC_SYNC_TIP3", MO_AGC_SYNC_TIP3),
    ("MO_AGC_GAIN_ADJ2", MO_AGC_GAIN_ADJ2),
    ("MO_AGC_GAIN_ADJ3", MO_AGC_GAIN_ADJ3),
    ("MO_AGC_GAIN_ADJ4", MO_AGC_GAIN_ADJ4),
    ("MO_AFECFG_IO", MO_AFECFG_IO),
];

/// 32-bit register access through a device's mapped window.
///
/// Offsets are byte offsets into BAR 0 and must be 4-byte aligned.
pub trait RegisterWindow: Send + Sync {
    fn read32(&self, reg: u32) -> u32;
    fn write32(&self, reg: u32, val: u32);
}

/// Read every named register, in map order
pub fn snapshot(regs: &dyn RegisterWindow) -> Vec<(&'static str, u32, u32)> {
    REGISTER_NAMES
        .iter()
        .map(|&(name, reg)| (name, reg, regs.read32(reg)))
        .collect()
}

/// A memory-mapped BAR, e.g. `/sys/bus/pci/devices/<bdf>/resource0`
pub struct MappedWindow {
    base: NonNull<u8>,
    len: usize,
    // Keeps `base` valid
    _map: MmapMut,
}

// Safety: all access goes through volatile reads/writes of aligned u32s,
// which is how MMIO is shared between threads anyway.
unsafe impl Send for MappedWindow {}
unsafe impl Sync for MappedWindow {}

impl MappedWindow {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < (MO_AFECFG_IO as usize + 4) {
            return Err(Error::NoDevice(format!(
                "{} is too small for the register map ({} bytes)",
                path.display(),
                len
            )));
        }
        // Safety: the mapping is owned by this struct and outlives every access
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| Error::NoDevice("null register mapping".to_owned()))?;
        debug!("mapped {} ({} KiB)", path.display(), len / 1024);
        Ok(Self {
            base,
            len,
            _map: map,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, reg: u32) -> usize {
        let off = reg as usize;
        assert!(
            off % 4 == 0 && off + 4 <= self.len,
            "register offset {:#x} outside of {:#x} byte window",
            off,
            self.len
        );
        off
    }
}

impl RegisterWindow for MappedWindow {
    fn read32(&self, reg: u32) -> u32 {
        let off = self.check(reg);
        // Safety: bounds and alignment checked above
        let raw = unsafe { std::ptr::read_volatile(self.base.as_ptr().add(off) as *const u32) };
        u32::from_le(raw)
    }

    fn write32(&self, reg: u32, val: u32) {
        let off = self.check(reg);
        // Safety: bounds and alignment checked above
        unsafe { std::ptr::write_volatile(self.base.as_ptr().add(off) as *mut u32, val.to_le()) }
    }
}
