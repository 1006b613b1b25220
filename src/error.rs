//! Error types for the driver.
//!
//! Setup failures (`Allocation`, `Configuration`, `NoDevice`) are terminal for
//! the probe that raised them and everything obtained before them has already
//! been released by the time the caller sees the error. The remaining variants
//! are per-operation and never change device state beyond the failed call.

use std::io;

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DMA allocation failed: {0}")]
    Allocation(String),

    #[error("Invalid DMA geometry: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Capture session already open")]
    ResourceExhausted,

    /// Non-blocking read found no completed page
    #[error("No samples available")]
    WouldBlock,

    #[error("Copy to consumer failed after {copied} bytes: {source}")]
    Fault { copied: usize, source: io::Error },

    #[error("Read interrupted after {copied} bytes")]
    Interrupted { copied: usize },

    #[error("No device: {0}")]
    NoDevice(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The errno a host character device would hand back for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::Allocation(_) => 12,        // ENOMEM
            Error::Configuration(_) => 22,     // EINVAL
            Error::InvalidArgument(_) => 22,   // EINVAL
            Error::ResourceExhausted => 16,    // EBUSY
            Error::WouldBlock => 11,           // EAGAIN
            Error::Fault { .. } => 14,         // EFAULT
            Error::Interrupted { .. } => 4,    // EINTR
            Error::NoDevice(_) => 19,          // ENODEV
            Error::Io(e) => e.raw_os_error().unwrap_or(5),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, e),
            Error::Interrupted { .. } => io::Error::new(io::ErrorKind::Interrupted, e),
            Error::InvalidArgument(_) | Error::Configuration(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            }
            Error::Fault { source, .. } => source,
            _ => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}
