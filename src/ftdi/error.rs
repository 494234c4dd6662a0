use nusb::descriptors::ActiveConfigurationError;

use super::ChipType;

/// Errors produced by the FTDI transport layer.
#[derive(Debug, thiserror::Error)]
pub enum FtdiError {
    /// Reported by the operating system when performing a USB operation. May
    /// indicate that the device was unplugged, that another driver currently
    /// owns it, or that the current user lacks permission to access it.
    #[error("USB transport error: {0}")]
    Usb(#[from] std::io::Error),

    #[error("unsupported FTDI chip type without MPSSE: {0:?}")]
    UnsupportedChipType(ChipType),

    #[error("failed to get active USB configuration")]
    ActiveConfiguration(#[source] ActiveConfigurationError),

    #[error("invalid device selector `{0}`")]
    InvalidSelector(String),

    #[error("no FTDI USB device found matching {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}
