//! Software model of the CX2388x capture path.
//!
//! [`SimRegisters`] is a register file with the two behaviors the driver
//! depends on: write-1-to-clear video status and a read-only page counter.
//! [`SimulatedChip`] fetches the RISC program over the (simulated) bus and
//! executes it against DMA memory the same way the real engine does, raising
//! interrupts where the program asks for them.

use std::{
    collections::HashMap,
    f32::consts::TAU,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use byte_slice_cast::AsByteSlice;
use tracing::{debug, warn};

use crate::{
    controller::PixelFormat,
    device::PciFunction,
    dma::{DmaAllocator, HostMemory},
    error::{Error, Result},
    irq::InterruptHandler,
    regs::{self, RegisterWindow},
    risc::{CounterOp, Instruction},
    PCI_DEVICE_ID, PCI_VENDOR_ID,
};

/// Instructions executed without completing a page before we call the
/// program broken
const MAX_IDLE_INSTRUCTIONS: usize = 1 << 16;

#[derive(Default)]
pub struct SimRegisters {
    regs: Mutex<HashMap<u32, u32>>,
}

impl SimRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<u32, u32>> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the VBI page counter, as the RISC engine would
    pub fn set_counter(&self, value: u32) {
        self.map().insert(regs::MO_VBI_GPCNT, value & 0xffff);
    }

    pub fn counter(&self) -> u32 {
        self.read32(regs::MO_VBI_GPCNT)
    }

    /// Latch status bits in `MO_VID_INTSTAT`
    pub fn raise(&self, bits: u32) {
        *self.map().entry(regs::MO_VID_INTSTAT).or_insert(0) |= bits;
    }

    /// Whether the chip would be asserting its interrupt line
    pub fn irq_asserted(&self) -> bool {
        let map = self.map();
        let get = |r| map.get(&r).copied().unwrap_or(0);
        get(regs::MO_PCI_INTMSK) & 1 != 0
            && get(regs::MO_VID_INTSTAT) & get(regs::MO_VID_INTMSK) != 0
    }
}

impl RegisterWindow for SimRegisters {
    fn read32(&self, reg: u32) -> u32 {
        assert!(reg % 4 == 0 && (reg as usize) < regs::BAR0_SIZE);
        self.map().get(&reg).copied().unwrap_or(0)
    }

    fn write32(&self, reg: u32, val: u32) {
        assert!(reg % 4 == 0 && (reg as usize) < regs::BAR0_SIZE);
        let mut map = self.map();
        match reg {
            regs::MO_VID_INTSTAT => {
                *map.entry(reg).or_insert(0) &= !val;
            }
            regs::MO_VBI_GPCNT => {}
            _ => {
                map.insert(reg, val);
            }
        }
    }
}

/// Something to digitize
pub trait SampleSource: Send {
    fn fill(&mut self, buf: &mut [u8]);
}

/// Byte counter, handy for checking order and loss
#[derive(Default)]
pub struct Ramp {
    next: u8,
}

impl SampleSource for Ramp {
    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b = self.next;
            self.next = self.next.wrapping_add(1);
        }
    }
}

/// A sine wave at `freq` Hz sampled at `sample_rate` Hz
pub struct Tone {
    format: PixelFormat,
    phase: f32,
    step: f32,
}

impl Tone {
    pub fn new(format: PixelFormat, freq: f32, sample_rate: f32) -> Self {
        Self {
            format,
            phase: 0.0,
            step: TAU * freq / sample_rate,
        }
    }

    fn next(&mut self) -> f32 {
        let v = self.phase.sin();
        self.phase = (self.phase + self.step) % TAU;
        v
    }
}

impl SampleSource for Tone {
    fn fill(&mut self, buf: &mut [u8]) {
        match self.format {
            PixelFormat::Ru8 => {
                for b in buf {
                    *b = (128.0 + 127.0 * self.next()) as u8;
                }
            }
            PixelFormat::Ru16Le => {
                let samples: Vec<u16> = (0..buf.len() / 2)
                    .map(|_| ((32768.0 + 32767.0 * self.next()) as u16).to_le())
                    .collect();
                buf[..samples.len() * 2].copy_from_slice(samples.as_byte_slice());
            }
        }
    }
}

struct Engine {
    // Bus address of the next instruction, fetched from the channel
    // command block on first use
    ip: Option<u32>,
    source: Box<dyn SampleSource>,
    scratch: Vec<u8>,
}

/// The VBI RISC engine and ADC of one simulated card.
pub struct SimulatedChip {
    regs: Arc<SimRegisters>,
    memory: Arc<HostMemory>,
    engine: Mutex<Engine>,
    irq: Mutex<Option<InterruptHandler>>,
}

impl SimulatedChip {
    pub fn new(regs: Arc<SimRegisters>, memory: Arc<HostMemory>) -> Self {
        Self::with_source(regs, memory, Box::new(Ramp::default()))
    }

    pub fn with_source(
        regs: Arc<SimRegisters>,
        memory: Arc<HostMemory>,
        source: Box<dyn SampleSource>,
    ) -> Self {
        Self {
            regs,
            memory,
            engine: Mutex::new(Engine {
                ip: None,
                source,
                scratch: Vec::new(),
            }),
            irq: Mutex::new(None),
        }
    }

    /// Route the chip's interrupt line to `handler`
    pub fn connect_irq(&self, handler: InterruptHandler) {
        *self.irq.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_source(&self, source: Box<dyn SampleSource>) {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .source = source;
    }

    /// RISC controller and VBI DMA both enabled
    pub fn running(&self) -> bool {
        self.regs.read32(regs::MO_DEV_CNTRL2) & (1 << 5) != 0
            && self.regs.read32(regs::MO_VID_DMACNTRL) & ((1 << 7) | (1 << 3)) != 0
    }

    fn fetch(&self, addr: u32) -> Result<Instruction> {
        let (mem, off) = self
            .memory
            .resolve(addr)
            .ok_or_else(|| Error::Configuration(format!("RISC fetch from unmapped {:#010x}", addr)))?;
        let op = mem.read_u32(off);
        let width = Instruction::width(op).ok_or_else(|| {
            Error::Configuration(format!("bad RISC opcode {:#010x} at {:#010x}", op, addr))
        })?;
        let mut words = vec![op];
        if width > 1 {
            words.push(mem.read_u32(off + 4));
        }
        Instruction::decode(&words)
            .ok_or_else(|| Error::Configuration(format!("bad RISC instruction at {:#010x}", addr)))
    }

    fn count(&self, op: CounterOp) {
        match op {
            CounterOp::Keep => {}
            CounterOp::Increment => self.regs.set_counter(self.regs.counter().wrapping_add(1)),
            CounterOp::Reset => self.regs.set_counter(0),
        }
    }

    fn interrupt(&self) {
        self.regs.raise(regs::VID_INTSTAT_VBI_RISCI1);
        if self.regs.irq_asserted() {
            if let Some(handler) = self
                .irq
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                handler.handle();
            }
        }
    }

    /// Execute the program until `pages` more pages are complete.
    /// Does nothing while the engine is stopped.
    pub fn step_pages(&self, pages: usize) -> Result<usize> {
        if !self.running() {
            return Ok(0);
        }
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ip = match engine.ip {
            Some(ip) => ip,
            None => self.regs.read32(regs::CHN24_CMDS_BASE),
        };
        let mut done = 0;
        let mut idle = 0;
        while done < pages {
            idle += 1;
            if idle > MAX_IDLE_INSTRUCTIONS {
                return Err(Error::Configuration(
                    "RISC program never completes a page".to_owned(),
                ));
            }
            match self.fetch(ip)? {
                Instruction::Sync { counter } => {
                    self.count(counter);
                    ip += 4;
                }
                Instruction::Write {
                    count,
                    addr,
                    irq,
                    counter,
                } => {
                    let (mem, off) = self.memory.resolve(addr).ok_or_else(|| {
                        Error::Configuration(format!("RISC write to unmapped {:#010x}", addr))
                    })?;
                    let Engine {
                        source, scratch, ..
                    } = &mut *engine;
                    scratch.resize(count, 0);
                    source.fill(scratch);
                    mem.write(off, scratch);
                    self.count(counter);
                    if counter != CounterOp::Keep {
                        done += 1;
                        idle = 0;
                    }
                    if irq {
                        self.interrupt();
                    }
                    ip += 8;
                }
                Instruction::Jump { addr } => ip = addr,
            }
        }
        engine.ip = Some(ip);
        Ok(done)
    }

    /// Free-run in a thread, producing `bytes_per_sec` worth of pages
    pub fn spawn(self: Arc<Self>, page_size: usize, bytes_per_sec: u64) -> ChipThread {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let pages_per_sec = (bytes_per_sec as f64 / page_size as f64).max(1.0);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let mut produced = 0u64;
            while !flag.load(Ordering::Relaxed) {
                let due = (start.elapsed().as_secs_f64() * pages_per_sec) as u64;
                if due > produced {
                    match self.step_pages((due - produced) as usize) {
                        Ok(n) => produced += n as u64,
                        Err(e) => {
                            warn!("simulated chip halted: {}", e);
                            return;
                        }
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
            debug!("simulated chip stopped after {} pages", produced);
        });
        ChipThread {
            stop,
            handle: Some(handle),
        }
    }
}

/// A free-running chip; stops when dropped
pub struct ChipThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ChipThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A CX2388x on a simulated PCI bus.
pub struct SimPci {
    pub regs: Arc<SimRegisters>,
    pub memory: Arc<HostMemory>,
    pub ids: (u16, u16),
    pub dma32: bool,
    pub enabled: bool,
    latency: u8,
}

impl SimPci {
    pub fn new() -> Self {
        Self::with_memory(HostMemory::new())
    }

    pub fn with_memory(memory: HostMemory) -> Self {
        Self {
            regs: Arc::new(SimRegisters::new()),
            memory: Arc::new(memory),
            ids: (PCI_VENDOR_ID, PCI_DEVICE_ID),
            dma32: true,
            enabled: false,
            latency: 0,
        }
    }

    /// The chip behind this function
    pub fn chip(&self) -> SimulatedChip {
        SimulatedChip::new(self.regs.clone(), self.memory.clone())
    }
}

impl Default for SimPci {
    fn default() -> Self {
        Self::new()
    }
}

impl PciFunction for SimPci {
    fn name(&self) -> String {
        "0000:00:00.0".to_owned()
    }

    fn ids(&self) -> (u16, u16) {
        self.ids
    }

    fn irq(&self) -> u32 {
        16
    }

    fn enable(&mut self) -> Result<()> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn set_dma_mask(&mut self, bits: u32) -> Result<()> {
        if bits < 32 || !self.dma32 {
            return Err(Error::NoDevice(
                "no suitable DMA support available".to_owned(),
            ));
        }
        Ok(())
    }

    fn write_latency_timer(&mut self, value: u8) {
        // The low bits of the latency timer are hardwired to zero
        self.latency = value & !0x7;
    }

    fn read_latency_timer(&self) -> u8 {
        self.latency
    }

    fn map_bar0(&mut self) -> Result<Arc<dyn RegisterWindow>> {
        Ok(self.regs.clone())
    }

    fn dma(&self) -> Arc<dyn DmaAllocator> {
        self.memory.clone()
    }
}
