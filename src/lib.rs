//! Programming support for Lattice ECP5 and Nexus FPGAs behind FTDI-based
//! JTAG probes.
//!
//! The crate is layered the way the hardware is: the [`ftdi`] module talks
//! USB, [`mpsse`] runs the FTDI serial engine, [`jtag`] drives the TAP state
//! machine over it, [`spi`] tunnels SPI transactions through DR shifts,
//! [`flash`] speaks the serial-NOR command set and [`lattice`] the ECP5/NX
//! vendor commands. [`ops`] composes those into the user-visible programming
//! flows.

pub mod flash;
pub mod ftdi;
pub mod jtag;
pub mod lattice;
pub mod mpsse;
pub mod ops;
pub mod spi;

pub use ftdi::{DeviceSelector, FtdiError, Interface};
pub use jtag::{JtagPort, TapAccess, TapState};
pub use mpsse::Mpsse;

/// Top-level error type; the variant decides the process exit code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ftdi(#[from] FtdiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IDCODE 0x{0:08x} matches no supported ECP5 or NX device")]
    UnknownIdCode(u32),

    #[error("flash contents differ from the input at address 0x{address:06X}")]
    VerifyMismatch { address: u32 },
}

impl Error {
    /// 1 for file errors, 2 for hardware trouble, 3 for a verify mismatch.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) => 1,
            Error::Ftdi(_) | Error::UnknownIdCode(_) => 2,
            Error::VerifyMismatch { .. } => 3,
        }
    }
}
