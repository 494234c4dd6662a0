use std::{
    collections::VecDeque,
    io,
    time::Duration,
};

use nusb::{
    DeviceInfo,
    transfer::{Control, ControlType, Direction, EndpointType, Recipient},
};
use tracing::{debug, trace, warn};

use super::usb_util::InterfaceExt;
use super::{BitMode, FtdiError, Interface, Result};

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_GET_LATENCY_TIMER_REQUEST: u8 = 0x0A;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// Low-level FTDI access through nusb.
///
/// Handles the vendor control requests and the bulk pipes of one MPSSE-capable
/// interface. Incoming bulk packets carry two modem-status bytes that must be
/// stripped before the payload reaches the MPSSE decoder.
pub struct FtdiRaw {
    handle: nusb::Interface,

    interface: Interface,

    usb_read_timeout: Duration,
    usb_write_timeout: Duration,

    /// Payload bytes received beyond what the caller asked for.
    read_queue: VecDeque<u8>,
    read_buffer: Box<[u8]>,
    max_packet_size: usize,
}

impl FtdiRaw {
    pub fn open(usb_device: &DeviceInfo, interface: Interface) -> Result<Self> {
        fn open_error(e: std::io::Error, while_: &'static str) -> FtdiError {
            let help = if cfg!(windows) {
                " (on Windows this may mean no WinUSB driver is bound; use Zadig to install one)"
            } else {
                ""
            };

            FtdiError::Usb(std::io::Error::other(format!(
                "error while {while_}: {e}{help}"
            )))
        }

        let handle = usb_device
            .open()
            .map_err(|e| open_error(e, "opening the USB device"))?;

        let configs: Vec<_> = handle.configurations().collect();

        let conf = &configs[0];
        if configs.len() != 1 {
            warn!("device has {} configurations, expected 1", configs.len());

            if configs.len() > 1 {
                let configuration = handle
                    .active_configuration()
                    .map_err(FtdiError::ActiveConfiguration)?
                    .configuration_value();

                if configuration != conf.configuration_value() {
                    handle
                        .set_configuration(conf.configuration_value())
                        .map_err(FtdiError::Usb)?;
                }
            }
        }

        debug!("scanning {} interfaces", conf.interfaces().count());
        trace!("active configuration descriptor: {:#x?}", conf);

        let mut usb_interface = None;

        // Find the interface whose bulk endpoint pair belongs to the
        // requested FTDI port.
        for intf in conf.interfaces() {
            for descr in intf.alt_settings() {
                let endpoints: Vec<_> = descr.endpoints().collect();
                trace!("endpoint descriptors: {:#x?}", endpoints);

                if endpoints
                    .iter()
                    .any(|ep| ep.transfer_type() != EndpointType::Bulk)
                {
                    warn!(
                        "encountered non-bulk endpoints, skipping interface: {:#x?}",
                        endpoints
                    );
                    continue;
                }

                let endpoint_count = endpoints.len();
                let Ok::<[_; 2], _>([read_ep, write_ep]) = endpoints.try_into() else {
                    warn!(
                        "skipping interface with {} endpoints, expected 2",
                        endpoint_count
                    );
                    continue;
                };

                let (read_ep, write_ep) = if read_ep.direction() == Direction::In {
                    (read_ep, write_ep)
                } else {
                    (write_ep, read_ep)
                };

                if read_ep.address() != interface.read_ep()
                    || write_ep.address() != interface.write_ep()
                {
                    continue;
                }

                if let Some((intf, _)) = usb_interface {
                    return Err(FtdiError::Other(format!(
                        "found multiple matching USB interfaces ({} and {})",
                        intf,
                        descr.interface_number()
                    )));
                }

                usb_interface = Some((descr.interface_number(), write_ep.max_packet_size()));
                debug!("interface is #{}", descr.interface_number());
            }
        }

        let Some((intf, max_packet_size)) = usb_interface else {
            return Err(FtdiError::Other(
                "device is not an FTDI device".to_string(),
            ));
        };

        let handle = handle
            .claim_interface(intf)
            .map_err(|e| open_error(e, "taking control over the USB device"))?;

        Ok(Self {
            handle,
            interface,
            usb_read_timeout: Duration::from_secs(5),
            usb_write_timeout: Duration::from_secs(5),
            read_queue: VecDeque::new(),
            read_buffer: vec![0; max_packet_size].into_boxed_slice(),
            max_packet_size,
        })
    }

    pub fn set_usb_timeouts(&mut self, read_timeout: Duration, write_timeout: Duration) {
        self.usb_read_timeout = read_timeout;
        self.usb_write_timeout = write_timeout;
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<()> {
        self.handle
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.interface.index(),
                },
                &[],
                self.usb_write_timeout,
            )
            .map_err(std::io::Error::from)?;

        trace!("SIO request {:02X}/{:04X} ok", request, value);

        Ok(())
    }

    fn sio_read_byte(&mut self, request: u8) -> Result<u8> {
        let mut data = [0u8; 1];
        let n = self
            .handle
            .control_in_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value: 0,
                    index: self.interface.index(),
                },
                &mut data,
                self.usb_read_timeout,
            )
            .map_err(std::io::Error::from)?;

        if n != 1 {
            return Err(FtdiError::Other(format!(
                "short response to SIO request {request:02X}"
            )));
        }

        Ok(data[0])
    }

    pub fn usb_reset(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    pub fn usb_purge_buffers(&mut self) -> Result<()> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.read_queue.clear();

        Ok(())
    }

    pub fn latency_timer(&mut self) -> Result<u8> {
        self.sio_read_byte(SIO_GET_LATENCY_TIMER_REQUEST)
    }

    pub fn set_latency_timer(&mut self, value: u8) -> Result<()> {
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, value as u16)
    }

    pub fn set_bitmode(&mut self, bitmask: u8, mode: BitMode) -> Result<()> {
        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([bitmask, mode as u8]),
        )
    }

    /// Reads payload bytes, stripping the 2-byte modem status prefix of every
    /// incoming packet. Returns less than `data.len()` when the chip has
    /// nothing more to say.
    pub fn read_data(&mut self, mut data: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while !data.is_empty() {
            // Drain carry-over from a previous read first.
            while !self.read_queue.is_empty() && !data.is_empty() {
                data[0] = self.read_queue.pop_front().unwrap();
                data = &mut data[1..];
                total += 1;
            }

            if !data.is_empty() {
                let read = self.handle.read_bulk(
                    self.interface.read_ep(),
                    &mut self.read_buffer,
                    self.usb_read_timeout,
                )?;

                if read <= 2 {
                    // Status-only packet, no payload pending.
                    break;
                }

                let (status, payload) = self.read_buffer[..read].split_at(2);
                trace!("status: {:02X?} [{} payload]", status, payload.len());

                let copy = payload.len().min(data.len());
                let (to_buffer, to_save) = payload.split_at(copy);

                data[..copy].copy_from_slice(to_buffer);
                data = &mut data[copy..];
                total += copy;

                if !to_save.is_empty() {
                    self.read_queue.extend(to_save);
                    break;
                }
            }
        }

        Ok(total)
    }

    pub fn write_data(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut total = 0;
        for chunk in data.chunks(self.max_packet_size) {
            total += self
                .handle
                .write_bulk(self.interface.write_ep(), chunk, self.usb_write_timeout)?;
        }

        Ok(total)
    }
}
