use std::fmt;
use std::str::FromStr;

use nusb::DeviceInfo;

use super::{FtdiError, Result};

/// The default FTDI VID:PID pairs probed when no selector is given, in order.
const DEFAULT_IDS: [(u16, u16); 2] = [(0x0403, 0x6010), (0x0403, 0x6014)];

/// A way of picking one FTDI device among those on the bus.
///
/// Parsed from the libftdi-style device strings:
///
/// * `d:<bus>/<addr>`: topological position, e.g. `d:002/005`
/// * `i:<vid>:<pid>`: first device with that ID, e.g. `i:0x0403:0x6010`
/// * `i:<vid>:<pid>:<index>`: n-th device with that ID
/// * `s:<vid>:<pid>:<serial>`: device with that ID and serial string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Location { bus: u8, address: u8 },
    VidPid { vid: u16, pid: u16, index: usize },
    Serial { vid: u16, pid: u16, serial: String },
}

impl DeviceSelector {
    /// Does `info` match this selector, given that `nth` previous devices
    /// already matched? (`nth` disambiguates `i:vid:pid:index` selectors.)
    fn matches(&self, info: &DeviceInfo, nth: &mut usize) -> bool {
        match self {
            DeviceSelector::Location { bus, address } => {
                info.bus_number() == *bus && info.device_address() == *address
            }
            DeviceSelector::VidPid { vid, pid, index } => {
                if info.vendor_id() == *vid && info.product_id() == *pid {
                    let here = *nth;
                    *nth += 1;
                    here == *index
                } else {
                    false
                }
            }
            DeviceSelector::Serial { vid, pid, serial } => {
                info.vendor_id() == *vid
                    && info.product_id() == *pid
                    && info.serial_number() == Some(serial.as_str())
            }
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Location { bus, address } => {
                write!(f, "d:{bus:03}/{address:03}")
            }
            DeviceSelector::VidPid { vid, pid, index } => {
                write!(f, "i:0x{vid:04x}:0x{pid:04x}:{index}")
            }
            DeviceSelector::Serial { vid, pid, serial } => {
                write!(f, "s:0x{vid:04x}:0x{pid:04x}:{serial}")
            }
        }
    }
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_num(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_u16(s: &str) -> Option<u16> {
    parse_num(s)?.try_into().ok()
}

impl FromStr for DeviceSelector {
    type Err = FtdiError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FtdiError::InvalidSelector(s.to_string());

        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "d" => {
                let (bus, address) = rest.split_once('/').ok_or_else(invalid)?;
                Ok(DeviceSelector::Location {
                    bus: bus.parse().map_err(|_| invalid())?,
                    address: address.parse().map_err(|_| invalid())?,
                })
            }
            "i" => {
                let mut parts = rest.split(':');
                let vid = parts.next().and_then(parse_u16).ok_or_else(invalid)?;
                let pid = parts.next().and_then(parse_u16).ok_or_else(invalid)?;
                let index = match parts.next() {
                    Some(ix) => parse_num(ix).ok_or_else(invalid)? as usize,
                    None => 0,
                };
                if parts.next().is_some() {
                    return Err(invalid());
                }
                Ok(DeviceSelector::VidPid { vid, pid, index })
            }
            "s" => {
                let mut parts = rest.splitn(3, ':');
                let vid = parts.next().and_then(parse_u16).ok_or_else(invalid)?;
                let pid = parts.next().and_then(parse_u16).ok_or_else(invalid)?;
                let serial = parts.next().ok_or_else(invalid)?;
                Ok(DeviceSelector::Serial {
                    vid,
                    pid,
                    serial: serial.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// Finds the USB device to open. With no selector, the stock FTDI IDs
/// 0x0403:0x6010 and 0x0403:0x6014 are tried in that order.
pub fn find_device(selector: Option<&DeviceSelector>) -> Result<DeviceInfo> {
    let devices: Vec<DeviceInfo> = nusb::list_devices()
        .map_err(FtdiError::Usb)?
        .collect();

    if let Some(selector) = selector {
        let mut nth = 0;
        devices
            .into_iter()
            .find(|info| selector.matches(info, &mut nth))
            .ok_or_else(|| FtdiError::NotFound(format!("device string {selector}")))
    } else {
        for (vid, pid) in DEFAULT_IDS {
            if let Some(info) = devices
                .iter()
                .find(|info| info.vendor_id() == vid && info.product_id() == pid)
            {
                return Ok(info.clone());
            }
        }
        Err(FtdiError::NotFound(
            "vendor_id 0x0403, device_id 0x6010 or 0x6014".to_string(),
        ))
    }
}
