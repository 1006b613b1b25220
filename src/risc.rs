//! The RISC instruction program run by the chip's DMA engine.
//!
//! Layout: one sync, then for every page one write per cluster, then a jump
//! back to the first write. The engine runs it in a loop forever; the last
//! write of each page bumps the VBI page counter, and the last write of the
//! last page resets it.

use std::sync::Arc;

use byte_slice_cast::AsByteSlice;
use tracing::info;

use crate::{
    dma::{DmaAllocator, DmaMemory},
    error::{Error, Result},
    pool::{Geometry, RingPool},
};

pub const RISC_WRITE: u32 = 0x1000_0000;
pub const RISC_JUMP: u32 = 0x7000_0000;
pub const RISC_SYNC: u32 = 0x8000_0000;
pub const RISC_OPCODE_MASK: u32 = 0xf000_0000;

/// Start and end of line, every write is a complete "line"
pub const RISC_SOL_EOL: u32 = 3 << 26;
pub const RISC_IRQ1: u32 = 1 << 24;
pub const RISC_CNT_INC: u32 = 1 << 16;
pub const RISC_CNT_RESET: u32 = 3 << 16;
const RISC_CNT_MASK: u32 = 3 << 16;
const RISC_COUNT_MASK: u32 = 0xfff;

/// Words taken by the sync at the head of the program
pub const SYNC_WORDS: usize = 1;
/// Words per write: opcode, target address
pub const WRITE_WORDS: usize = 2;
/// Words per jump: opcode, target address
pub const JUMP_WORDS: usize = 2;

/// Program size in bytes for a ring of `pages` pages
pub fn program_len(pages: usize, clusters_per_page: usize) -> usize {
    4 * (SYNC_WORDS + pages * clusters_per_page * WRITE_WORDS + JUMP_WORDS)
}

/// What an instruction does to the page counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    Keep,
    Increment,
    Reset,
}

impl CounterOp {
    fn from_bits(op: u32) -> Self {
        match op & RISC_CNT_MASK {
            RISC_CNT_INC => CounterOp::Increment,
            RISC_CNT_RESET => CounterOp::Reset,
            _ => CounterOp::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Sync {
        counter: CounterOp,
    },
    Write {
        count: usize,
        addr: u32,
        irq: bool,
        counter: CounterOp,
    },
    Jump {
        addr: u32,
    },
}

impl Instruction {
    /// Number of words the instruction starting with `op` occupies
    pub fn width(op: u32) -> Option<usize> {
        match op & RISC_OPCODE_MASK {
            RISC_SYNC => Some(SYNC_WORDS),
            RISC_WRITE => Some(WRITE_WORDS),
            RISC_JUMP => Some(JUMP_WORDS),
            _ => None,
        }
    }

    /// Decode the instruction at the head of `words`
    pub fn decode(words: &[u32]) -> Option<Self> {
        let op = *words.first()?;
        match op & RISC_OPCODE_MASK {
            RISC_SYNC => Some(Instruction::Sync {
                counter: CounterOp::from_bits(op),
            }),
            RISC_WRITE => Some(Instruction::Write {
                count: (op & RISC_COUNT_MASK) as usize,
                addr: *words.get(1)?,
                irq: op & RISC_IRQ1 != 0,
                counter: CounterOp::from_bits(op),
            }),
            RISC_JUMP => Some(Instruction::Jump {
                addr: *words.get(1)?,
            }),
            _ => None,
        }
    }
}

/// Encode the looping program for the pages at `page_addrs`.
///
/// `program_addr` is the bus address the program will live at; the closing
/// jump targets the word right after the sync.
pub fn encode(page_addrs: &[u32], geometry: &Geometry, program_addr: u32) -> Result<Vec<u32>> {
    let pages = page_addrs.len();
    if pages == 0 {
        return Err(Error::Configuration(
            "cannot build a RISC program for an empty ring".to_owned(),
        ));
    }
    geometry.validate()?;
    let clusters = geometry.clusters_per_page();
    let cluster_size = geometry.cluster_size as u32;
    let irq_mask = geometry.irq_period - 1;

    let mut words = Vec::with_capacity(program_len(pages, clusters) / 4);
    words.push(RISC_SYNC | RISC_CNT_RESET);

    let mut irqt = 0usize;
    for (i, &base) in page_addrs.iter().enumerate() {
        irqt = (irqt + 1) & irq_mask;
        for c in 0..clusters {
            let mut op = RISC_WRITE | RISC_SOL_EOL | cluster_size;
            if c == clusters - 1 {
                if irqt == 0 {
                    op |= RISC_IRQ1;
                }
                op |= if i < pages - 1 {
                    RISC_CNT_INC
                } else {
                    RISC_CNT_RESET
                };
            }
            words.push(op);
            words.push(base + c as u32 * cluster_size);
        }
    }

    words.push(RISC_JUMP);
    words.push(program_addr + 4 * SYNC_WORDS as u32);
    Ok(words)
}

/// An encoded program resident in DMA memory.
pub struct Program {
    mem: Arc<DmaMemory>,
    words: Vec<u32>,
}

impl Program {
    /// Allocate program memory for `pool` and write the encoded program into it
    pub fn load(alloc: &dyn DmaAllocator, pool: &RingPool) -> Result<Self> {
        let geometry = pool.geometry();
        if pool.is_empty() {
            return Err(Error::Configuration(
                "cannot build a RISC program for an empty ring".to_owned(),
            ));
        }
        let len = program_len(pool.len(), geometry.clusters_per_page());
        let mem = alloc.alloc_coherent(len)?;
        info!("RISC buffer: {} KiB", mem.len() / 1024);

        let addrs: Vec<u32> = pool.physical_addresses().collect();
        let words = encode(&addrs, &geometry, mem.bus_addr())?;
        let program = Self { mem, words };
        program.mem.write(0, &program.to_bytes());
        info!("RISC instructions: {} KiB", program.len_bytes() / 1024);
        Ok(program)
    }

    pub fn bus_addr(&self) -> u32 {
        self.mem.bus_addr()
    }

    /// Where the closing jump lands
    pub fn loop_addr(&self) -> u32 {
        self.bus_addr() + 4 * SYNC_WORDS as u32
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    /// The program as the chip reads it, little-endian
    pub fn to_bytes(&self) -> Vec<u8> {
        let le: Vec<u32> = self.words.iter().map(|w| w.to_le()).collect();
        le.as_byte_slice().to_vec()
    }

    /// Target address of every write, in execution order
    pub fn write_targets(&self) -> Vec<u32> {
        let mut targets = Vec::new();
        let mut i = 0;
        while i < self.words.len() {
            let op = self.words[i];
            if let Some(Instruction::Write { addr, .. }) = Instruction::decode(&self.words[i..]) {
                targets.push(addr);
            }
            i += Instruction::width(op).unwrap_or(1);
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dma::HostMemory, PAGE_SIZE};

    fn geometry(pages: usize, irq_period: usize) -> Geometry {
        Geometry {
            capacity: pages * PAGE_SIZE,
            irq_period,
            ..Default::default()
        }
    }

    fn decode_all(words: &[u32]) -> Vec<Instruction> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < words.len() {
            out.push(Instruction::decode(&words[i..]).unwrap());
            i += Instruction::width(words[i]).unwrap();
        }
        out
    }

    #[test]
    fn test_program_length() {
        for pages in [1usize, 2, 16, 256] {
            let addrs: Vec<u32> = (0..pages as u32).map(|i| 0x1000_0000 + i * 4096).collect();
            let words = encode(&addrs, &geometry(pages, 0x200), 0x2000_0000).unwrap();
            assert_eq!(words.len() * 4, program_len(pages, 2));
            assert_eq!(words.len() * 4, 4 + 2 * pages * 8 + 8);
        }
    }

    #[test]
    fn test_empty_ring_rejected() {
        assert!(matches!(
            encode(&[], &geometry(0, 0x200), 0),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_encoding() {
        let addrs = [0x1000_0000, 0x1000_1000, 0x1000_2000, 0x1000_3000];
        let words = encode(&addrs, &geometry(4, 2), 0x2000_0000).unwrap();
        assert_eq!(words[0], 0x8003_0000);
        // Page 0, low then high cluster
        assert_eq!(words[1], 0x1c00_0800);
        assert_eq!(words[2], 0x1000_0000);
        assert_eq!(words[3], 0x1c01_0800);
        assert_eq!(words[4], 0x1000_0800);
        // Page 1 raises the interrupt with period 2
        assert_eq!(words[7], 0x1d01_0800);
        // Last page resets the counter
        assert_eq!(words[15], 0x1d03_0800);
        assert_eq!(words[16], 0x1000_3800);
        assert_eq!(words[17], RISC_JUMP);
        assert_eq!(words[18], 0x2000_0004);
    }

    #[test]
    fn test_interrupt_cadence() {
        let pages = 2048;
        let addrs: Vec<u32> = (0..pages as u32).map(|i| i * 4096).collect();
        let words = encode(&addrs, &geometry(pages, 0x200), 0).unwrap();
        let irq_pages: Vec<usize> = decode_all(&words)
            .iter()
            .filter_map(|ins| match ins {
                Instruction::Write { irq: true, addr, .. } => Some(*addr as usize / 4096),
                _ => None,
            })
            .collect();
        assert_eq!(irq_pages, vec![511, 1023, 1535, 2047]);
    }

    #[test]
    fn test_decode_round_structure() {
        let addrs = [0x1000_0000, 0x1000_1000];
        let words = encode(&addrs, &geometry(2, 0x200), 0x2000_0000).unwrap();
        let ins = decode_all(&words);
        assert_eq!(
            ins[0],
            Instruction::Sync {
                counter: CounterOp::Reset
            }
        );
        assert_eq!(
            ins[2],
            Instruction::Write {
                count: 2048,
                addr: 0x1000_0800,
                irq: false,
                counter: CounterOp::Increment
            }
        );
        assert_eq!(ins[5], Instruction::Jump { addr: 0x2000_0004 });
    }

    #[test]
    fn test_load_is_deterministic() {
        let host = HostMemory::new();
        let pool = RingPool::allocate(&host, geometry(8, 4)).unwrap();
        let a = Program::load(&host, &pool).unwrap();
        let b = Program::load(&host, &pool).unwrap();
        let relocated = |p: &Program| {
            let mut w = p.words().to_vec();
            let n = w.len();
            w[n - 1] -= p.bus_addr();
            w
        };
        assert_eq!(relocated(&a), relocated(&b));
        let addrs: Vec<u32> = pool.physical_addresses().collect();
        let again = encode(&addrs, &pool.geometry(), a.bus_addr()).unwrap();
        assert_eq!(again, a.words());

        // What the chip sees in memory is the little-endian program
        let mut mem = vec![0u8; a.len_bytes()];
        host.resolve(a.bus_addr()).unwrap().0.read(0, &mut mem);
        assert_eq!(mem, a.to_bytes());
        assert_eq!(a.write_targets().len(), 16);
    }
}
