//! Probe, removal and the registry of bound cards.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tracing::{error, info};

use crate::{
    cdt::{self, DescriptorTable},
    controller::{CaptureController, DeviceConfig},
    dma::DmaAllocator,
    error::{Error, Result},
    irq::InterruptHandler,
    pool::{Geometry, RingPool},
    reader::{ReadMode, RingReader, Session},
    regs::RegisterWindow,
    risc::Program,
    CLUSTER_BUF_NUM, DRV_NAME, MAX_CARDS, PCI_DEVICE_ID, PCI_VENDOR_ID,
};

pub const LATENCY_MIN: i32 = 32;
pub const LATENCY_MAX: i32 = 248;

/// What the host PCI layer has to provide for one function.
pub trait PciFunction {
    /// Bus address, e.g. `0000:03:00.0`
    fn name(&self) -> String;
    /// (vendor, device)
    fn ids(&self) -> (u16, u16);
    fn irq(&self) -> u32;
    /// Enable the function and make it a bus master
    fn enable(&mut self) -> Result<()>;
    fn disable(&mut self);
    fn set_dma_mask(&mut self, bits: u32) -> Result<()>;
    fn write_latency_timer(&mut self, value: u8);
    fn read_latency_timer(&self) -> u8;
    fn map_bar0(&mut self) -> Result<Arc<dyn RegisterWindow>>;
    fn dma(&self) -> Arc<dyn DmaAllocator>;
}

/// Load-time driver parameters
#[derive(Debug, Clone, Copy)]
pub struct DriverParams {
    /// PCI latency timer, clamped to 32..=248
    pub latency: i32,
    pub geometry: Geometry,
    /// Longest a blocked reader sleeps before looking at the counter again
    pub poll_interval: Duration,
}

impl Default for DriverParams {
    fn default() -> Self {
        Self {
            latency: LATENCY_MAX,
            geometry: Geometry::default(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl DriverParams {
    pub fn clamped_latency(&self) -> u8 {
        self.latency.clamp(LATENCY_MIN, LATENCY_MAX) as u8
    }
}

/// One bound card.
pub struct Device {
    nr: usize,
    name: String,
    bus_name: String,
    irq: u32,
    pci_latency: u8,
    regs: Arc<dyn RegisterWindow>,
    pool: Arc<RingPool>,
    program: Program,
    table: DescriptorTable,
    controller: Mutex<CaptureController>,
    reader: RingReader,
    pci: Mutex<Box<dyn PciFunction + Send>>,
    removed: AtomicBool,
}

impl Device {
    /// Bring up the card: DMA ring, RISC program, SRAM channel, ADC.
    ///
    /// Returns the device and the handler the host must call on every
    /// interrupt of the (shared) line.
    pub fn probe(
        mut pci: Box<dyn PciFunction + Send>,
        nr: usize,
        params: &DriverParams,
    ) -> Result<(Self, InterruptHandler)> {
        pci.enable()?;
        let setup = Self::setup(pci.as_mut(), params);
        match setup {
            Ok(parts) => Ok(Self::assemble(pci, nr, parts, params)),
            Err(e) => {
                error!("{}: probe failed: {}", pci.name(), e);
                pci.disable();
                Err(e)
            }
        }
    }

    fn setup(pci: &mut (dyn PciFunction + Send), params: &DriverParams) -> Result<Parts> {
        pci.set_dma_mask(32)?;

        pci.write_latency_timer(params.clamped_latency());
        let pci_latency = pci.read_latency_timer();

        let dma = pci.dma();
        let pool = RingPool::allocate(dma.as_ref(), params.geometry)?;
        let program = Program::load(dma.as_ref(), &pool)?;
        let table = DescriptorTable::build(&pool, params.geometry.cluster_size)?;
        table.check_program(&program)?;

        let regs = pci.map_bar0()?;
        Ok(Parts {
            pci_latency,
            regs,
            pool: Arc::new(pool),
            program,
            table,
        })
    }

    fn assemble(
        pci: Box<dyn PciFunction + Send>,
        nr: usize,
        parts: Parts,
        params: &DriverParams,
    ) -> (Self, InterruptHandler) {
        let Parts {
            pci_latency,
            regs,
            pool,
            program,
            table,
        } = parts;
        let cluster_size = params.geometry.cluster_size as u32;

        let controller = CaptureController::new(regs.clone(), DeviceConfig::default());
        controller.shutdown();
        cdt::setup_sram(regs.as_ref(), program.bus_addr(), CLUSTER_BUF_NUM, cluster_size);

        let (handler, ready) = InterruptHandler::new(regs.clone());

        controller.adc_setup(cluster_size);
        controller.apply();
        controller.agc_setup();
        controller.write_input();

        let reader = RingReader::new(regs.clone(), pool.clone(), ready, params.poll_interval);
        let name = format!("{} [{}]", DRV_NAME, nr);
        let bus_name = pci.name();
        let irq = pci.irq();
        info!(
            "{}: irq: {}, PCI latency: {}",
            bus_name, irq, pci_latency
        );
        info!("{}: registered as {}", bus_name, name);

        controller.enable_video_interrupts();
        let device = Self {
            nr,
            name,
            bus_name,
            irq,
            pci_latency,
            regs,
            pool,
            program,
            table,
            controller: Mutex::new(controller),
            reader,
            pci: Mutex::new(pci),
            removed: AtomicBool::new(false),
        };
        (device, handler)
    }

    /// Stop the chip and release the function. Safe to call more than once.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.controller().shutdown();
        info!("{}: removing {}", self.bus_name, self.name);
        self.pci
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disable();
    }

    /// Start a capture session
    pub fn open(&self, mode: ReadMode) -> Result<Session> {
        if self.removed.load(Ordering::Acquire) {
            return Err(Error::NoDevice(format!("{} was removed", self.name)));
        }
        self.reader.open(mode)
    }

    /// Exclusive access to the configuration registers
    pub fn controller(&self) -> MutexGuard<'_, CaptureController> {
        self.controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn nr(&self) -> usize {
        self.nr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn pci_latency(&self) -> u8 {
        self.pci_latency
    }

    pub fn regs(&self) -> &dyn RegisterWindow {
        self.regs.as_ref()
    }

    pub fn pool(&self) -> &RingPool {
        &self.pool
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn descriptor_table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_open()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.remove();
    }
}

struct Parts {
    pci_latency: u8,
    regs: Arc<dyn RegisterWindow>,
    pool: Arc<RingPool>,
    program: Program,
    table: DescriptorTable,
}

/// The cards this driver is bound to, at most `capacity` of them.
pub struct DeviceRegistry {
    slots: Vec<Option<Arc<Device>>>,
    params: DriverParams,
}

impl DeviceRegistry {
    pub fn new(params: DriverParams) -> Self {
        Self::with_capacity(MAX_CARDS, params)
    }

    pub fn with_capacity(capacity: usize, params: DriverParams) -> Self {
        Self {
            slots: vec![None; capacity],
            params,
        }
    }

    pub fn params(&self) -> &DriverParams {
        &self.params
    }

    /// Whether this driver handles the function
    pub fn matches(pci: &dyn PciFunction) -> bool {
        pci.ids() == (PCI_VENDOR_ID, PCI_DEVICE_ID)
    }

    /// Probe `pci` into the first free slot
    pub fn probe(
        &mut self,
        pci: Box<dyn PciFunction + Send>,
    ) -> Result<(Arc<Device>, InterruptHandler)> {
        if !Self::matches(pci.as_ref()) {
            let (vendor, device) = pci.ids();
            return Err(Error::NoDevice(format!(
                "{:04x}:{:04x} is not a CX2388x",
                vendor, device
            )));
        }
        let nr = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Error::NoDevice(format!("already bound to {} cards", self.slots.len())))?;
        let (device, handler) = Device::probe(pci, nr, &self.params)?;
        let device = Arc::new(device);
        self.slots[nr] = Some(device.clone());
        Ok((device, handler))
    }

    /// Stop and forget card `nr`
    pub fn remove(&mut self, nr: usize) -> Option<Arc<Device>> {
        let device = self.slots.get_mut(nr)?.take()?;
        device.remove();
        Some(device)
    }

    pub fn get(&self, nr: usize) -> Option<&Arc<Device>> {
        self.slots.get(nr)?.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.slots.iter().flatten()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for device in self.slots.iter().flatten() {
            device.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dma::HostMemory,
        regs,
        sim::SimPci,
        PAGE_SIZE,
    };

    fn params() -> DriverParams {
        DriverParams {
            geometry: Geometry {
                capacity: 16 * PAGE_SIZE,
                irq_period: 4,
                ..Default::default()
            },
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_probe_programs_chip() {
        let pci = SimPci::new();
        let regs = pci.regs.clone();
        let (device, _handler) = Device::probe(Box::new(pci), 0, &params()).unwrap();
        assert_eq!(device.name(), "CX2388x SDR [0]");
        assert_eq!(device.pci_latency(), 248);
        assert_eq!(regs.read32(regs::CHN24_CMDS_BASE), device.program().bus_addr());
        assert_eq!(regs.read32(regs::MO_VID_INTMSK), regs::INTERRUPT_MASK);
        assert_eq!(regs.read32(regs::MO_CAPTURE_CTRL), 0x46);
        assert_eq!(regs.read32(regs::MO_INPUT_FORMAT), 0x0001_6011);
        assert_eq!(regs.read32(regs::MO_PCI_INTMSK), 0);
        assert_eq!(device.descriptor_table().len(), 32);

        device.remove();
        assert_eq!(regs.read32(regs::MO_DEV_CNTRL2), 0);
        assert_eq!(regs.read32(regs::MO_VID_INTMSK), 0);
        assert!(matches!(
            device.open(ReadMode::NonBlocking),
            Err(Error::NoDevice(_))
        ));
    }

    #[test]
    fn test_latency_clamped() {
        let mut p = params();
        p.latency = 7;
        assert_eq!(p.clamped_latency(), 32);
        p.latency = 1000;
        assert_eq!(p.clamped_latency(), 248);
        let (device, _) = Device::probe(Box::new(SimPci::new()), 0, &p).unwrap();
        assert_eq!(device.pci_latency(), 248);
    }

    #[test]
    fn test_probe_unwinds_allocations() {
        for n in [0usize, 3, 16] {
            let pci = SimPci::with_memory(HostMemory::failing_after(n));
            let memory = pci.memory.clone();
            assert!(matches!(
                Device::probe(Box::new(pci), 0, &params()),
                Err(Error::Allocation(_))
            ));
            assert_eq!(memory.live(), 0);
        }
    }

    #[test]
    fn test_probe_rejects_bad_geometry() {
        let mut p = params();
        p.geometry.capacity = 0;
        let pci = SimPci::new();
        let memory = pci.memory.clone();
        assert!(matches!(
            Device::probe(Box::new(pci), 0, &p),
            Err(Error::Configuration(_))
        ));
        assert_eq!(memory.live(), 0);
    }

    #[test]
    fn test_probe_requires_dma32() {
        let mut pci = SimPci::new();
        pci.dma32 = false;
        assert!(matches!(
            Device::probe(Box::new(pci), 0, &params()),
            Err(Error::NoDevice(_))
        ));
    }

    #[test]
    fn test_registry_bounds() {
        let mut registry = DeviceRegistry::with_capacity(2, params());
        let (a, _) = registry.probe(Box::new(SimPci::new())).unwrap();
        let (b, _) = registry.probe(Box::new(SimPci::new())).unwrap();
        assert_eq!((a.nr(), b.nr()), (0, 1));
        assert!(matches!(
            registry.probe(Box::new(SimPci::new())),
            Err(Error::NoDevice(_))
        ));
        assert_eq!(registry.len(), 2);

        registry.remove(0).unwrap();
        let (c, _) = registry.probe(Box::new(SimPci::new())).unwrap();
        assert_eq!(c.nr(), 0);
        assert_eq!(c.name(), "CX2388x SDR [0]");

        let mut foreign = SimPci::new();
        foreign.ids = (0x8086, 0x1234);
        assert!(matches!(
            registry.probe(Box::new(foreign)),
            Err(Error::NoDevice(_))
        ));
    }

    #[test]
    fn test_end_to_end_capture() {
        let pci = SimPci::new();
        let chip = pci.chip();
        let regs = pci.regs.clone();
        let (device, handler) = Device::probe(Box::new(pci), 0, &params()).unwrap();
        chip.connect_irq(handler);

        // Two pages before anyone listens
        chip.step_pages(2).unwrap();
        let mut session = device.open(ReadMode::NonBlocking).unwrap();
        assert_eq!(session.start_page(), 1);
        assert_eq!(regs.read32(regs::MO_PCI_INTMSK), 1);
        assert!(matches!(session.read(&mut [0u8; 64]), Err(Error::WouldBlock)));

        // Page 3 raises the first interrupt, which gets acknowledged
        chip.step_pages(4).unwrap();
        assert_eq!(regs.read32(regs::MO_VID_INTSTAT), 0);

        let mut out = vec![0u8; 16 * PAGE_SIZE];
        let n = session.read(&mut out).unwrap();
        assert_eq!(n, 4 * PAGE_SIZE);
        // Ramp samples, starting with page 1 (the second page written)
        for (i, &b) in out[..n].iter().enumerate() {
            assert_eq!(b, ((PAGE_SIZE + i) % 256) as u8);
        }
        drop(session);
        assert!(!device.is_open());
    }

    #[test]
    fn test_blocking_capture_with_running_chip() {
        let pci = SimPci::new();
        let chip = Arc::new(pci.chip());
        let (device, handler) = Device::probe(Box::new(pci), 0, &params()).unwrap();
        chip.connect_irq(handler);
        assert!(chip.running());
        // A page every 10 ms, so one lap of the ring takes 160 ms
        let _running = chip.clone().spawn(PAGE_SIZE, 100 * PAGE_SIZE as u64);
        std::thread::sleep(Duration::from_millis(50));

        let mut session = device.open(ReadMode::Blocking).unwrap();
        let mut out = vec![0u8; 3 * PAGE_SIZE];
        assert_eq!(session.read(&mut out).unwrap(), 3 * PAGE_SIZE);
        // Consecutive ramp bytes, wherever we started
        for w in out.windows(2) {
            assert_eq!(w[1], w[0].wrapping_add(1));
        }
    }
}
