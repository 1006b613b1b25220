//! The ring reader: turns the chip's page counter into a byte stream.
//!
//! Exactly one session may be open at a time. A session remembers the page
//! the chip had last completed when it was opened and a byte cursor; the page
//! to read next is always derived from those two, modulo the ring size.
//!
//! Capture is lossy. The chip never waits for the reader: if it
//! laps the session, the pages the session had not read yet are overwritten
//! and the session carries on from where its cursor points, reading whatever
//! the chip put there. Nothing reports this; a consumer that cares has to
//! count samples itself. A single read never returns more than what lies
//! between the cursor and the chip's last completed page, so at most one ring
//! worth of data per lap.
//!
//! Every byte handed out is zeroed in the ring right after it is copied, so a
//! page the chip has not rewritten yet can't be delivered twice.

use std::{
    cmp::min,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::Receiver;
use tracing::{debug, info};

use crate::{
    dma::DmaMemory,
    error::{Error, Result},
    irq::{Canceller, DataReady},
    pool::RingPool,
    regs::{self, RegisterWindow},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait for the chip until the request is filled
    Blocking,
    /// Return what is there, or `WouldBlock` if nothing is
    NonBlocking,
}

struct ReaderShared {
    regs: Arc<dyn RegisterWindow>,
    pool: Arc<RingPool>,
    ready: DataReady,
    poll_interval: Duration,
    open: AtomicBool,
}

impl ReaderShared {
    /// Last page the chip completed
    fn producer_page(&self) -> usize {
        self.pool.page_index(self.regs.read32(regs::MO_VBI_GPCNT))
    }
}

/// Hands out the device's single capture session.
pub struct RingReader {
    shared: Arc<ReaderShared>,
}

impl RingReader {
    pub fn new(
        regs: Arc<dyn RegisterWindow>,
        pool: Arc<RingPool>,
        ready: DataReady,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ReaderShared {
                regs,
                pool,
                ready,
                poll_interval,
                open: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Open the session, starting at the chip's last completed page.
    pub fn open(&self, mode: ReadMode) -> Result<Session> {
        let shared = &self.shared;
        if shared
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ResourceExhausted);
        }
        let start_page = shared.producer_page();
        shared.ready.clear();
        shared.regs.write32(regs::MO_PCI_INTMSK, 1);
        info!("capture session opened at page {}", start_page);

        let (canceller, cancel_rx) = Canceller::new();
        Ok(Session {
            shared: self.shared.clone(),
            start_page,
            pos: 0,
            mode,
            canceller,
            cancel_rx,
            scratch: Vec::new(),
        })
    }
}

/// An open capture stream. Closing is dropping.
pub struct Session {
    shared: Arc<ReaderShared>,
    start_page: usize,
    pos: u64,
    mode: ReadMode,
    canceller: Canceller,
    cancel_rx: Receiver<()>,
    scratch: Vec<u8>,
}

impl Session {
    pub fn start_page(&self) -> usize {
        self.start_page
    }

    /// Bytes delivered so far
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ReadMode) {
        self.mode = mode;
    }

    /// Handle that interrupts a blocked read from another thread
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Ring page the cursor is in
    pub fn current_page(&self) -> usize {
        let pool = &self.shared.pool;
        let n = pool.len() as u64;
        ((self.start_page as u64 + self.pos / pool.page_size() as u64) % n) as usize
    }

    pub fn producer_page(&self) -> usize {
        self.shared.producer_page()
    }

    /// Read into `buf`. Never faults, the destination is always valid.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        self.drain(buf.len(), |mem, offset, len| {
            mem.read(offset, &mut buf[filled..filled + len]);
            filled += len;
            Ok(())
        })
    }

    /// Read up to `max_bytes` into `sink`.
    ///
    /// A failing sink aborts the read with `Fault`, reporting what was
    /// delivered before it; the chunk that failed stays unread in the ring.
    pub fn read_to<W: io::Write>(&mut self, sink: &mut W, max_bytes: usize) -> Result<usize> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(self.shared.pool.page_size(), 0);
        let res = self.drain(max_bytes, |mem, offset, len| {
            mem.read(offset, &mut scratch[..len]);
            sink.write_all(&scratch[..len])
        });
        self.scratch = scratch;
        res
    }

    fn drain<F>(&mut self, max_bytes: usize, mut copy: F) -> Result<usize>
    where
        F: FnMut(&DmaMemory, usize, usize) -> io::Result<()>,
    {
        let shared = self.shared.clone();
        let page_size = shared.pool.page_size();
        let mut remaining = max_bytes;
        let mut copied = 0;
        let mut page = self.current_page();

        loop {
            let producer = shared.producer_page();
            if page == producer && self.mode == ReadMode::NonBlocking {
                return Err(Error::WouldBlock);
            }

            while remaining > 0 && page != producer {
                let mem = shared.pool.page(page);
                let offset = (self.pos % page_size as u64) as usize;
                let len = min(page_size - offset, remaining);

                copy(mem, offset, len).map_err(|source| Error::Fault { copied, source })?;
                mem.zero(offset, len);

                copied += len;
                remaining -= len;
                self.pos += len as u64;
                page = self.current_page();
            }

            if remaining == 0 || self.mode == ReadMode::NonBlocking {
                return Ok(copied);
            }
            shared
                .ready
                .wait(&self.cancel_rx, shared.poll_interval, copied)?;
        }
    }
}

/// Bytes already handed out are never reported as an error: an interrupted or
/// faulted read that copied something returns the short count instead.
impl io::Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Session::read(self, buf) {
            Ok(n) => Ok(n),
            Err(Error::Interrupted { copied }) | Err(Error::Fault { copied, .. })
                if copied > 0 =>
            {
                Ok(copied)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.regs.write32(regs::MO_PCI_INTMSK, 0);
        self.shared.open.store(false, Ordering::Release);
        debug!("capture session closed after {} bytes", self.pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dma::HostMemory, irq::InterruptHandler, pool::Geometry, sim::SimRegisters, PAGE_SIZE};
    use rand::prelude::*;
    use std::{thread, time::Instant};

    const PAGES: usize = 8;

    struct Rig {
        regs: Arc<SimRegisters>,
        pool: Arc<RingPool>,
        reader: RingReader,
        handler: InterruptHandler,
    }

    fn rig() -> Rig {
        let host = HostMemory::new();
        let regs = Arc::new(SimRegisters::new());
        let pool = Arc::new(
            RingPool::allocate(&host, Geometry::with_capacity(PAGES * PAGE_SIZE)).unwrap(),
        );
        let (handler, ready) = InterruptHandler::new(regs.clone());
        let reader = RingReader::new(
            regs.clone(),
            pool.clone(),
            ready,
            Duration::from_millis(5),
        );
        Rig {
            regs,
            pool,
            reader,
            handler,
        }
    }

    fn fill(pool: &RingPool, page: usize, rng: &mut impl Rng) -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        rng.fill(&mut data[..]);
        pool.page(page % PAGES).write(0, &data);
        data
    }

    fn page_is_zero(pool: &RingPool, page: usize) -> bool {
        let mut buf = vec![0xffu8; PAGE_SIZE];
        pool.page(page).read(0, &mut buf);
        buf.iter().all(|&b| b == 0)
    }

    #[test]
    fn test_round_trip_and_poison() {
        let rig = rig();
        let mut rng = rand::thread_rng();
        // Chip is writing page 3, so page 2 is the last complete one
        rig.regs.set_counter(3);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        assert_eq!(session.start_page(), 2);

        let expected: Vec<u8> = (2..5).flat_map(|p| fill(&rig.pool, p, &mut rng)).collect();
        rig.regs.set_counter(6);

        let mut out = vec![0u8; 3 * PAGE_SIZE];
        assert_eq!(session.read(&mut out).unwrap(), 3 * PAGE_SIZE);
        assert_eq!(out, expected);
        for p in 2..5 {
            assert!(page_is_zero(&rig.pool, p));
        }
        assert_eq!(session.current_page(), 5);
    }

    #[test]
    fn test_partial_page_reads() {
        let rig = rig();
        let mut rng = rand::thread_rng();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        let a = fill(&rig.pool, 0, &mut rng);
        let b = fill(&rig.pool, 1, &mut rng);
        rig.regs.set_counter(3);

        let mut out = vec![0u8; 1000];
        assert_eq!(session.read(&mut out).unwrap(), 1000);
        assert_eq!(&out[..], &a[..1000]);
        let mut out = vec![0u8; PAGE_SIZE];
        assert_eq!(session.read(&mut out).unwrap(), PAGE_SIZE);
        assert_eq!(&out[..PAGE_SIZE - 1000], &a[1000..]);
        assert_eq!(&out[PAGE_SIZE - 1000..], &b[..1000]);
        assert_eq!(session.position(), 1000 + PAGE_SIZE as u64);
    }

    #[test]
    fn test_nonblocking_would_block_without_mutation() {
        let rig = rig();
        rig.regs.set_counter(5);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        let mut out = [0u8; 16];
        assert!(matches!(session.read(&mut out), Err(Error::WouldBlock)));
        assert_eq!(session.position(), 0);
        assert_eq!(session.current_page(), 4);

        // Short read once one page is there
        rig.regs.set_counter(6);
        let mut out = vec![0u8; 2 * PAGE_SIZE];
        assert_eq!(session.read(&mut out).unwrap(), PAGE_SIZE);
        assert!(matches!(session.read(&mut out), Err(Error::WouldBlock)));
    }

    #[test]
    fn test_counter_wraparound() {
        let rig = rig();
        rig.regs.set_counter(0xffff);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        assert_eq!(session.start_page(), 6);
        // Counter wraps past 16 bits, the ring wraps past page 7
        rig.regs.set_counter(0x0001);
        let mut out = vec![0u8; 8 * PAGE_SIZE];
        assert_eq!(session.read(&mut out).unwrap(), 2 * PAGE_SIZE);
        assert_eq!(session.current_page(), 0);
    }

    #[test]
    fn test_overrun_is_silent_and_bounded() {
        let rig = rig();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        // The chip runs three and a half laps ahead of the reader
        rig.regs.set_counter(1 + 3 * PAGES as u32 + 4);
        let mut out = vec![0u8; 64 * PAGE_SIZE];
        let n = session.read(&mut out).unwrap();
        assert!(n <= PAGES * PAGE_SIZE);
        assert_eq!(n, 4 * PAGE_SIZE);
        assert!(session.current_page() < PAGES);
        assert_eq!(session.current_page(), session.producer_page());
    }

    #[test]
    fn test_single_session() {
        let rig = rig();
        rig.regs.set_counter(2);
        let session = rig.reader.open(ReadMode::Blocking).unwrap();
        assert!(rig.reader.is_open());
        assert_eq!(rig.regs.read32(regs::MO_PCI_INTMSK), 1);
        assert!(matches!(
            rig.reader.open(ReadMode::Blocking),
            Err(Error::ResourceExhausted)
        ));
        assert_eq!(session.start_page(), 1);
        drop(session);
        assert_eq!(rig.regs.read32(regs::MO_PCI_INTMSK), 0);

        rig.regs.set_counter(6);
        let session = rig.reader.open(ReadMode::Blocking).unwrap();
        assert_eq!(session.start_page(), 5);
    }

    #[test]
    fn test_blocking_read_waits_for_interrupt() {
        let rig = rig();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::Blocking).unwrap();
        rig.regs.write32(regs::MO_VID_INTMSK, regs::INTERRUPT_MASK);

        let regs = rig.regs.clone();
        let handler = rig.handler;
        let producer = thread::spawn(move || {
            for counter in 2..=3 {
                thread::sleep(Duration::from_millis(20));
                regs.set_counter(counter);
                regs.raise(regs::VID_INTSTAT_VBI_RISCI1);
                handler.handle();
            }
        });

        let start = Instant::now();
        let mut out = vec![0u8; 2 * PAGE_SIZE];
        assert_eq!(session.read(&mut out).unwrap(), 2 * PAGE_SIZE);
        assert!(start.elapsed() >= Duration::from_millis(40));
        producer.join().unwrap();
    }

    #[test]
    fn test_cancel_blocking_read() {
        let rig = rig();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::Blocking).unwrap();
        let cancel = session.canceller();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        let mut out = [0u8; 64];
        assert!(matches!(
            session.read(&mut out),
            Err(Error::Interrupted { copied: 0 })
        ));
        t.join().unwrap();
    }

    struct BrokenSink;

    impl io::Write for BrokenSink {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fault_reports_and_keeps_data() {
        let rig = rig();
        let mut rng = rand::thread_rng();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        let data = fill(&rig.pool, 0, &mut rng);
        rig.regs.set_counter(2);

        assert!(matches!(
            session.read_to(&mut BrokenSink, 100),
            Err(Error::Fault { copied: 0, .. })
        ));
        assert_eq!(session.position(), 0);

        let mut sink = Vec::new();
        assert_eq!(session.read_to(&mut sink, PAGE_SIZE).unwrap(), PAGE_SIZE);
        assert_eq!(sink, data);
    }

    #[test]
    fn test_io_read() {
        use std::io::Read;
        let rig = rig();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        let mut out = [0u8; 8];
        let err = Read::read(&mut session, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_io_read_keeps_bytes_copied_before_cancel() {
        use std::io::Read;
        let rig = rig();
        let mut rng = rand::thread_rng();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::Blocking).unwrap();
        let data = fill(&rig.pool, 0, &mut rng);
        rig.regs.set_counter(2);

        // One page is there, the second never comes
        session.canceller().cancel();
        let mut out = vec![0u8; 2 * PAGE_SIZE];
        assert_eq!(Read::read(&mut session, &mut out).unwrap(), PAGE_SIZE);
        assert_eq!(&out[..PAGE_SIZE], &data[..]);
        assert_eq!(session.position(), PAGE_SIZE as u64);

        // Nothing copied this time, so the cancel surfaces as an error
        session.canceller().cancel();
        let err = Read::read(&mut session, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    /// Accepts the first write, fails every one after it
    struct FailsSecond {
        taken: Vec<u8>,
    }

    impl io::Write for FailsSecond {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.taken.is_empty() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "full"));
            }
            self.taken.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fault_after_first_page() {
        let rig = rig();
        let mut rng = rand::thread_rng();
        rig.regs.set_counter(1);
        let mut session = rig.reader.open(ReadMode::NonBlocking).unwrap();
        let a = fill(&rig.pool, 0, &mut rng);
        let b = fill(&rig.pool, 1, &mut rng);
        rig.regs.set_counter(3);

        let mut sink = FailsSecond { taken: Vec::new() };
        assert!(matches!(
            session.read_to(&mut sink, 2 * PAGE_SIZE),
            Err(Error::Fault { copied, .. }) if copied == PAGE_SIZE
        ));
        assert_eq!(sink.taken, a);
        assert_eq!(session.position(), PAGE_SIZE as u64);
        assert!(page_is_zero(&rig.pool, 0));
        assert!(!page_is_zero(&rig.pool, 1));

        let mut out = vec![0u8; PAGE_SIZE];
        assert_eq!(session.read(&mut out).unwrap(), PAGE_SIZE);
        assert_eq!(out, b);
    }
}
