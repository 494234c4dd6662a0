//! The MPSSE transport: byte-stream access to the FTDI serial engine.
//!
//! `Mpsse` owns the USB handle for the duration of a programming run. Opening
//! it performs the full engine bring-up (reset, purge, latency timer, MPSSE
//! bit-mode, clock, GPIO); dropping it restores the latency timer and puts the
//! chip back into its reset bit-mode, so cleanup also happens when an error
//! unwinds through the caller.

use std::time::Duration;

use tracing::{debug, warn};

use crate::ftdi::{self, BitMode, DeviceSelector, FtdiError, Interface};

/// MPSSE opcodes used by this tool (AN 108).
pub mod mc {
    /// Clock whole bytes out on TDI and in from TDO, LSB first, write on the
    /// falling edge.
    pub const DATA_BYTES_RW: u8 = 0x39;
    /// Same, but 1..8 bits of a single byte.
    pub const DATA_BITS_RW: u8 = 0x3B;
    /// Clock up to 7 TMS bits, TDI held at bit 7 of the data byte.
    pub const TMS_BITS: u8 = 0x4B;
    /// Clock TMS bits while also capturing TDO.
    pub const TMS_BITS_RW: u8 = 0x6B;
    /// Drive the low-byte GPIO pins.
    pub const SET_PINS_LOW: u8 = 0x80;
    /// Disconnect the TDI→TDO loopback.
    pub const LOOPBACK_OFF: u8 = 0x85;
    /// Set the TCK divider.
    pub const SET_CLK_DIV: u8 = 0x86;
    /// Flush the chip's response buffer back to the host immediately.
    pub const SEND_IMMEDIATE: u8 = 0x87;
    /// Disable the ×5 clock prescaler (60 MHz internal clock).
    pub const TCK_X5: u8 = 0x8A;
}

/// Low-byte GPIO after init: TCK low, TDI low, TMS high.
const GPIO_VALUE: u8 = 0x08;
/// TCK/TDI/TMS outputs, TDO input, one GPIO driven low.
const GPIO_DIRECTION: u8 = 0x0B;

pub struct Mpsse {
    device: ftdi::Device,
    /// Latency timer value found on the chip before we changed it.
    saved_latency: Option<u8>,
    buffer_size: usize,
}

impl Mpsse {
    /// Opens the selected device and brings up the MPSSE engine with
    /// TCK = 6 MHz / `clock_div`.
    pub fn open(
        selector: Option<&DeviceSelector>,
        interface: Interface,
        clock_div: u32,
    ) -> Result<Self, FtdiError> {
        debug_assert!((1..=65536).contains(&clock_div));

        let info = ftdi::find_device(selector)?;
        let device = ftdi::Builder::new()
            .with_interface(interface)
            .usb_open(&info)?;

        let buffer_size = match device.chip_type() {
            Some(ty) => ty.buffer_size()?,
            None => {
                warn!("unknown FTDI chip, assuming an FT2232H-sized buffer");
                4096
            }
        };

        let mut mpsse = Mpsse {
            device,
            saved_latency: None,
            buffer_size,
        };
        mpsse.init(clock_div)?;

        Ok(mpsse)
    }

    fn init(&mut self, clock_div: u32) -> Result<(), FtdiError> {
        self.device.usb_reset()?;
        self.device.usb_purge_buffers()?;

        // Remember the latency timer so drop() can put it back, then crank it
        // to 1 ms for responsive polling.
        let saved = self.device.latency_timer()?;
        self.device.set_latency_timer(1)?;
        self.saved_latency = Some(saved);

        self.device.set_bitmode(0xff, BitMode::Mpsse)?;
        self.device.usb_purge_buffers()?;

        let divisor = (clock_div - 1) as u16;
        let [div_lo, div_hi] = divisor.to_le_bytes();
        self.send(&[
            mc::TCK_X5,
            mc::SET_CLK_DIV,
            div_lo,
            div_hi,
            mc::SET_PINS_LOW,
            GPIO_VALUE,
            GPIO_DIRECTION,
            mc::LOOPBACK_OFF,
        ])?;

        debug!(
            "MPSSE up, TCK = {} kHz (divider {})",
            6000 / clock_div,
            clock_div
        );

        Ok(())
    }

    /// Largest read-back a single command batch may produce before the
    /// chip's receive buffer overflows.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Writes the whole buffer to the engine.
    pub fn send(&mut self, data: &[u8]) -> Result<(), FtdiError> {
        self.device.write_all(data)?;
        Ok(())
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), FtdiError> {
        self.send(&[byte])
    }

    pub fn recv_byte(&mut self) -> Result<u8, FtdiError> {
        let mut byte = [0u8; 1];
        self.recv(&mut byte)?;
        Ok(byte[0])
    }

    /// Reads exactly `data.len()` response bytes, looping over short USB
    /// reads until satisfied.
    pub fn recv(&mut self, data: &mut [u8]) -> Result<(), FtdiError> {
        let mut received = 0;
        while received < data.len() {
            let n = self.device.read_data(&mut data[received..])?;
            received += n;
            if n == 0 {
                // Nothing buffered yet; the latency timer is 1 ms, so the
                // next bulk read will block about that long.
                std::thread::sleep(Duration::from_micros(100));
            }
        }
        Ok(())
    }

    /// Sends a command batch, then reads back exactly `response.len()` bytes.
    pub fn xfer(&mut self, commands: &[u8], response: &mut [u8]) -> Result<(), FtdiError> {
        self.send(commands)?;
        self.recv(response)
    }
}

impl Drop for Mpsse {
    fn drop(&mut self) {
        if let Some(latency) = self.saved_latency {
            if let Err(e) = self.device.set_latency_timer(latency) {
                warn!("failed to restore FTDI latency timer: {e}");
            }
        }
        if let Err(e) = self.device.set_bitmode(0, BitMode::Reset) {
            warn!("failed to leave MPSSE bit-mode: {e}");
        }
    }
}
