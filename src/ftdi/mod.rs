//! FTDI device access for MPSSE-capable chips.
//!
//! This is a small, self-contained driver speaking the FTDI vendor protocol
//! through nusb; no libftdi is involved. Only the pieces needed to run the
//! MPSSE engine are implemented.

mod error;
mod raw;
mod selector;
mod usb_util;

use std::time::Duration;

use nusb::DeviceInfo;
use tracing::{debug, warn};

pub use error::FtdiError;
pub use selector::{DeviceSelector, find_device};

use raw::FtdiRaw;

pub type Result<T, E = FtdiError> = std::result::Result<T, E>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChipType {
    Am,
    Bm,
    FT2232C,
    R,
    FT2232H,
    FT4232H,
    FT232H,
    FT230X,
}

impl ChipType {
    /// Size of the chip's receive buffer. Bounds how much MPSSE read-back a
    /// single command batch may produce before the host drains it.
    pub fn buffer_size(self) -> Result<usize> {
        match self {
            ChipType::FT2232H | ChipType::FT4232H => Ok(4096),
            ChipType::FT232H => Ok(1024),
            ChipType::FT2232C => Ok(128),
            not_mpsse => Err(FtdiError::UnsupportedChipType(not_mpsse)),
        }
    }
}

#[repr(u8)]
#[allow(unused)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BitMode {
    Reset = 0,
    Bitbang = 1,
    Mpsse = 2,
    SyncBb = 4,
    Mcu = 8,
    Opto = 16,
    Cbus = 32,
    SyncFf = 64,
}

/// One of the up to four serial engines on an FTDI chip.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interface {
    A = 1,
    B = 2,
    C = 3,
    D = 4,
}

impl Interface {
    fn index(self) -> u16 {
        self as u16
    }

    fn read_ep(self) -> u8 {
        match self {
            Interface::A => 0x81,
            Interface::B => 0x83,
            Interface::C => 0x85,
            Interface::D => 0x87,
        }
    }

    fn write_ep(self) -> u8 {
        match self {
            Interface::A => 0x02,
            Interface::B => 0x04,
            Interface::C => 0x06,
            Interface::D => 0x08,
        }
    }
}

pub struct Builder {
    interface: Interface,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Builder {
    pub const fn new() -> Self {
        Self {
            interface: Interface::A,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }

    pub const fn with_interface(mut self, interface: Interface) -> Self {
        self.interface = interface;
        self
    }

    pub fn usb_open(self, usb_device: &DeviceInfo) -> Result<Device> {
        let mut device = Device::open(usb_device, self.interface)?;

        device
            .context
            .set_usb_timeouts(self.read_timeout, self.write_timeout);

        Ok(device)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// An opened FTDI interface.
pub struct Device {
    context: FtdiRaw,

    chip_type: Option<ChipType>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("chip_type", &self.chip_type)
            .finish()
    }
}

impl Device {
    fn open(usb_device: &DeviceInfo, interface: Interface) -> Result<Self> {
        let context = FtdiRaw::open(usb_device, interface)?;

        // The bcdDevice field encodes the chip generation.
        let chip_type = match (
            usb_device.device_version(),
            usb_device.serial_number().unwrap_or(""),
        ) {
            (0x400, _) | (0x200, "") => Some(ChipType::Bm),
            (0x200, _) => Some(ChipType::Am),
            (0x500, _) => Some(ChipType::FT2232C),
            (0x600, _) => Some(ChipType::R),
            (0x700, _) => Some(ChipType::FT2232H),
            (0x800, _) => Some(ChipType::FT4232H),
            (0x900, _) => Some(ChipType::FT232H),
            (0x1000, _) => Some(ChipType::FT230X),

            (version, _) => {
                warn!("unknown FTDI device version: {:X?}", version);
                None
            }
        };

        debug!("opened FTDI device: {:?}", chip_type);

        Ok(Self { context, chip_type })
    }

    pub fn chip_type(&self) -> Option<ChipType> {
        self.chip_type
    }

    pub fn usb_reset(&mut self) -> Result<()> {
        self.context.usb_reset()
    }

    pub fn usb_purge_buffers(&mut self) -> Result<()> {
        self.context.usb_purge_buffers()
    }

    pub fn latency_timer(&mut self) -> Result<u8> {
        self.context.latency_timer()
    }

    pub fn set_latency_timer(&mut self, value: u8) -> Result<()> {
        self.context.set_latency_timer(value)
    }

    pub fn set_bitmode(&mut self, bitmask: u8, mode: BitMode) -> Result<()> {
        self.context.set_bitmode(bitmask, mode)
    }

    pub fn read_data(&mut self, data: &mut [u8]) -> std::io::Result<usize> {
        self.context.read_data(data)
    }

    pub fn write_data(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.context.write_data(data)
    }

    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            written += self.context.write_data(&data[written..])?;
        }
        Ok(())
    }
}
