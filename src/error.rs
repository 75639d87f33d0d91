use std::time::Duration;

use thiserror::Error;

use crate::packets::{FlashStatus, PacketError};

/// Errors of the boot protocol
///
/// Framing and checksum failures never show up here: corrupt messages are
/// dropped by the link and are only seen as a [`BootError::Timeout`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BootError {
    /// No response arrived in time
    #[error("Time out after {0:?}")]
    Timeout(Duration),
    /// Every attempt to enter the bootloader failed
    #[error("Can't enter boot loader after {attempts} attempts")]
    EnterExhausted {
        /// Number of attempts made
        attempts: usize,
    },
    /// The device refused to enter the bootloader
    #[error("Can't enter bootloader: {0}")]
    EnterRejected(u8),
    /// The device refused to leave the bootloader
    #[error("Can't exit bootloader: {0}")]
    ExitRejected(u8),
    /// A sector erase failed
    #[error("Can't erase sector {sector}: {status}")]
    EraseFailed {
        /// Sector number
        sector: u32,
        /// Status reported by the device
        status: FlashStatus,
    },
    /// A chunk write failed
    #[error("Can't write data at 0x{address:08x}: {status}")]
    WriteFailed {
        /// Address of the failing chunk
        address: u32,
        /// Status reported by the device
        status: FlashStatus,
    },
    /// The device's checksum of the written range differs from the image
    #[error("Image CRC check failed. Expected 0x{expected:08x}, got 0x{actual:08x}")]
    Verification {
        /// CRC-32 of the local image
        expected: u32,
        /// CRC-32 reported by the device
        actual: u32,
    },
    /// A response did not carry the expected fields
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    /// The image has no section to flash
    #[error("Firmware image is empty")]
    EmptyImage,
    /// The image is not larger than its entry vector
    #[error("Firmware image of {len} bytes is too small, need more than {min} bytes")]
    ImageTooSmall {
        /// Length of the first section
        len: usize,
        /// Entry vector length
        min: usize,
    },
    /// A region does not fit in the 32-bit address space
    #[error("Region of {len} bytes at 0x{address:08x} runs past the end of the address space")]
    AddressOverflow {
        /// First address of the region
        address: u32,
        /// Length of the region
        len: usize,
    },
    /// A request could not be built
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// The underlying link failed
    #[error(transparent)]
    Link(#[from] anyhow::Error),
}
