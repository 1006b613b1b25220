//! Interrupt acknowledgment and the data-ready event it produces.
//!
//! Samples move without the host's help, so the interrupt handler has one
//! job: clear the chip's video status so the shared line drops. As a side
//! effect it pokes the [`DataReady`] event a blocked reader sleeps on.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::{
    error::{Error, Result},
    regs::{self, RegisterWindow},
};

/// Upper bound on status re-reads per interrupt
const MAX_IRQ_LOOPS: usize = 10;

/// Runs in interrupt context: never blocks, never touches the ring.
pub struct InterruptHandler {
    regs: Arc<dyn RegisterWindow>,
    notify: Sender<()>,
}

impl InterruptHandler {
    pub fn new(regs: Arc<dyn RegisterWindow>) -> (Self, DataReady) {
        let (tx, rx) = bounded(1);
        let ready = DataReady {
            rx,
            _tx: tx.clone(),
        };
        (Self { regs, notify: tx }, ready)
    }

    /// Acknowledge pending video interrupts. Returns whether any were ours,
    /// which is what a shared interrupt line wants to know.
    pub fn handle(&self) -> bool {
        let mut handled = false;
        for _ in 0..MAX_IRQ_LOOPS {
            let status = self.regs.read32(regs::MO_VID_INTSTAT);
            let mask = self.regs.read32(regs::MO_VID_INTMSK);
            if status & mask == 0 {
                break;
            }
            self.regs.write32(regs::MO_VID_INTSTAT, status);
            handled = true;
        }
        if handled {
            // A pending notification already covers this one
            let _ = self.notify.try_send(());
        }
        handled
    }
}

/// Data-ready event consumed by the blocking read path.
#[derive(Clone)]
pub struct DataReady {
    rx: Receiver<()>,
    // Keeps the channel connected even after the handler is gone
    _tx: Sender<()>,
}

impl DataReady {
    /// Sleep until an interrupt arrives, `poll` elapses, or `cancel` fires.
    ///
    /// The chip only interrupts every few hundred pages, so `poll` bounds how
    /// stale the reader's view of the page counter can get.
    pub fn wait(&self, cancel: &Receiver<()>, poll: Duration, copied: usize) -> Result<()> {
        select! {
            recv(self.rx) -> _ => Ok(()),
            recv(cancel) -> _ => Err(Error::Interrupted { copied }),
            default(poll) => Ok(()),
        }
    }

    /// Drop a stale notification
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Cancels a blocked read on the session it was taken from.
#[derive(Clone)]
pub struct Canceller {
    tx: Sender<()>,
}

impl Canceller {
    pub fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(1);
        (Self { tx }, rx)
    }

    /// Interrupt the next (or current) blocking wait. One cancel interrupts
    /// one wait.
    pub fn cancel(&self) {
        let _ = self.tx.try_send(());
    }
}
