//! # Messages exchanged with the flight-controller
//!
//! This module defines the message header, the boot protocol requests and the
//! parsing of bootloader responses.
//!
//! Before stuffing, a message is laid out as:
//!
//! ```text
//! [crc16: u16 LE][id: u16 LE][payload: 0..=MAX_DATA_SIZE bytes]
//! ```
//!
//! The CRC covers the id and the payload. On the wire each stuffed message is
//! preceded by one `0x00` and followed by the `0x00` terminator.

use std::fmt::{Debug, Display};

use thiserror::Error;

use crate::checksum::checksum16;
use crate::cobsr;

/// Largest payload a message can carry
pub const MAX_DATA_SIZE: usize = 256;

/// Data bytes carried by one [`MessageId::BootWriteData`] message
pub const WRITE_CHUNK_SIZE: usize = MAX_DATA_SIZE - 4;

/// Magic word the bootloader expects in [`MessageId::BootEnter`]
pub const BOOT_MAGIC: u32 = 0xB007_10AD;

// crc16 + id
const HEADER_LEN: usize = 4;

/// Longest stuffed message, terminator excluded
pub const MAX_FRAME_LEN: usize = cobsr::max_encoded_len(HEADER_LEN + MAX_DATA_SIZE);

/// Message identifiers used by the update procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageId {
    /// Text sent to the flight-controller shell
    ShellFromPc = 0x0002,
    /// Request to start the bootloader
    BootEnter = 0x0100,
    /// Request to leave the bootloader and start the application
    BootExit = 0x0101,
    /// Request to erase one flash sector
    BootEraseSector = 0x0102,
    /// Request to program data at an address
    BootWriteData = 0x0103,
    /// Request for the CRC-32 of a flash range
    BootVerify = 0x0104,
    /// Answer to any boot request
    BootResponse = 0x0105,
}

impl TryFrom<u16> for MessageId {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0002 => Ok(MessageId::ShellFromPc),
            0x0100 => Ok(MessageId::BootEnter),
            0x0101 => Ok(MessageId::BootExit),
            0x0102 => Ok(MessageId::BootEraseSector),
            0x0103 => Ok(MessageId::BootWriteData),
            0x0104 => Ok(MessageId::BootVerify),
            0x0105 => Ok(MessageId::BootResponse),
            other => Err(other),
        }
    }
}

/// Errors building or parsing a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The decoded frame is shorter than the message header
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    /// The payload does not fit in one message
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    TooLong {
        /// Length that was requested
        len: usize,
        /// Maximum allowed length
        max: usize,
    },
    /// The header checksum does not match the message content
    #[error("checksum mismatch: header 0x{received:04x}, computed 0x{computed:04x}")]
    Checksum {
        /// Checksum found in the header
        received: u16,
        /// Checksum computed over id and payload
        computed: u16,
    },
}

/// One message of the serial protocol
///
/// Messages with ids outside [`MessageId`] are valid and carried opaquely.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    id: u16,
    payload: Vec<u8>,
}

impl Message {
    /// Create a message from a raw id and payload
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooLong`] if the payload exceeds [`MAX_DATA_SIZE`]
    pub fn new(id: u16, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_DATA_SIZE {
            return Err(PacketError::TooLong { len: payload.len(), max: MAX_DATA_SIZE });
        }
        Ok(Message { id, payload })
    }

    /// Text for the flight-controller shell
    pub fn shell_from_pc(text: &str) -> Result<Self, PacketError> {
        Message::new(MessageId::ShellFromPc as u16, text.as_bytes().to_vec())
    }

    /// Bootloader entry request carrying the magic word
    pub fn boot_enter(magic: u32) -> Self {
        Message { id: MessageId::BootEnter as u16, payload: magic.to_le_bytes().to_vec() }
    }

    /// Bootloader exit request
    pub fn boot_exit() -> Self {
        Message { id: MessageId::BootExit as u16, payload: Vec::new() }
    }

    /// Sector erase request
    pub fn boot_erase_sector(sector: u32) -> Self {
        Message { id: MessageId::BootEraseSector as u16, payload: sector.to_le_bytes().to_vec() }
    }

    /// Flash write request
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooLong`] if `data` is longer than [`WRITE_CHUNK_SIZE`]
    pub fn boot_write_data(address: u32, data: &[u8]) -> Result<Self, PacketError> {
        if data.len() > WRITE_CHUNK_SIZE {
            return Err(PacketError::TooLong { len: data.len(), max: WRITE_CHUNK_SIZE });
        }
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(data);
        Ok(Message { id: MessageId::BootWriteData as u16, payload })
    }

    /// Verify request for `length` bytes starting at `address`
    pub fn boot_verify(address: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&length.to_le_bytes());
        Message { id: MessageId::BootVerify as u16, payload }
    }

    /// Bootloader response, as sent by the device
    pub fn boot_response(payload: &[u8]) -> Result<Self, PacketError> {
        Message::new(MessageId::BootResponse as u16, payload.to_vec())
    }

    /// Raw message id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Known message id, if any
    pub fn kind(&self) -> Option<MessageId> {
        MessageId::try_from(self.id).ok()
    }

    /// Message payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length as carried in the header
    pub fn data_len(&self) -> usize {
        self.payload.len()
    }

    /// Checksum stamped on this message
    pub fn crc(&self) -> u16 {
        checksum16(self.id, &self.payload)
    }

    /// Write the complete wire form of this message into `buf`
    ///
    /// `buf` is cleared first. Its contents become the resynchronisation zero,
    /// the stuffed header and payload, and the terminator.
    pub fn encode_frame(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.push(cobsr::TERMINATOR);
        let header = self.crc().to_le_bytes().into_iter().chain(self.id.to_le_bytes());
        cobsr::encode_into(header.chain(self.payload.iter().copied()), buf);
    }

    /// Parse a message from an unstuffed frame and validate its checksum
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too short or too long, or if the
    /// checksum does not match.
    pub fn from_frame(raw: &[u8]) -> Result<Self, PacketError> {
        if raw.len() < HEADER_LEN {
            return Err(PacketError::TooShort(raw.len()));
        }
        let received = u16::from_le_bytes([raw[0], raw[1]]);
        let id = u16::from_le_bytes([raw[2], raw[3]]);
        let message = Message::new(id, raw[HEADER_LEN..].to_vec())?;

        let computed = message.crc();
        if computed != received {
            return Err(PacketError::Checksum { received, computed });
        }
        Ok(message)
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut s = f.debug_struct("Message");
        match self.kind() {
            Some(kind) => s.field("id", &kind),
            None => s.field("id", &format_args!("0x{:04x}", self.id)),
        };
        s.field("data_len", &self.payload.len())
            .field("payload", &self.payload)
            .finish()
    }
}

/// Boot request, as seen by the device
///
/// The host builds requests with the [`Message`] constructors. This type is the
/// reverse direction, used to describe traffic in logs and by device
/// simulators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootRequest {
    /// Shell text
    ShellFromPc(String),
    /// Enter the bootloader
    Enter {
        /// Magic word
        magic: u32,
    },
    /// Leave the bootloader
    Exit,
    /// Erase a sector
    EraseSector {
        /// Sector number
        sector: u32,
    },
    /// Program flash
    WriteData {
        /// Flash address of the first byte
        address: u32,
        /// Bytes to program
        data: Vec<u8>,
    },
    /// Compute the CRC-32 of a flash range
    Verify {
        /// Flash address of the first byte
        address: u32,
        /// Number of bytes
        length: u32,
    },
}

impl BootRequest {
    /// Interpret a message as a request
    ///
    /// Returns `None` for responses, unknown ids and malformed payloads.
    pub fn from_message(message: &Message) -> Option<Self> {
        let p = message.payload();
        let word = |at: usize| -> Option<u32> {
            p.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        match message.kind()? {
            MessageId::ShellFromPc => Some(BootRequest::ShellFromPc(String::from_utf8_lossy(p).into_owned())),
            MessageId::BootEnter => Some(BootRequest::Enter { magic: word(0)? }),
            MessageId::BootExit => Some(BootRequest::Exit),
            MessageId::BootEraseSector => Some(BootRequest::EraseSector { sector: word(0)? }),
            MessageId::BootWriteData => Some(BootRequest::WriteData { address: word(0)?, data: p[4..].to_vec() }),
            MessageId::BootVerify => Some(BootRequest::Verify { address: word(0)?, length: word(4)? }),
            MessageId::BootResponse => None,
        }
    }
}

/// Response from the bootloader
///
/// The meaning of the payload depends on the request being answered: the
/// first byte is a status code for enter, exit, erase and write; the first four
/// bytes are a little-endian CRC-32 for verify.
pub struct BootResponse {
    payload: Vec<u8>,
}

impl BootResponse {
    /// Extract a response from a message, `None` if it is another message type
    pub fn from_message(message: &Message) -> Option<Self> {
        (message.kind() == Some(MessageId::BootResponse))
            .then(|| BootResponse { payload: message.payload().to_vec() })
    }

    /// Status byte, if present
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Status byte decoded as a flash status
    pub fn flash_status(&self) -> Option<FlashStatus> {
        self.status().map(FlashStatus::from)
    }

    /// CRC-32 carried by a verify response, if present
    pub fn checksum(&self) -> Option<u32> {
        let b = self.payload.get(..4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Raw payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Debug for BootResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BootResponse")
            .field("payload", &self.payload)
            .finish()
    }
}

/// Status of a flash operation, as reported by the device's flash controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    /// An operation is still in progress
    Busy,
    /// Read protection error
    ErrorRd,
    /// Programming sequence error
    ErrorPgs,
    /// Programming parallelism error
    ErrorPgp,
    /// Programming alignment error
    ErrorPga,
    /// Write protection error
    ErrorWrp,
    /// Generic programming error
    ErrorProgram,
    /// Operation error
    ErrorOperation,
    /// The operation completed
    Complete,
    /// A status code outside the known set
    Unknown(u8),
}

impl From<u8> for FlashStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => FlashStatus::Busy,
            2 => FlashStatus::ErrorRd,
            3 => FlashStatus::ErrorPgs,
            4 => FlashStatus::ErrorPgp,
            5 => FlashStatus::ErrorPga,
            6 => FlashStatus::ErrorWrp,
            7 => FlashStatus::ErrorProgram,
            8 => FlashStatus::ErrorOperation,
            9 => FlashStatus::Complete,
            other => FlashStatus::Unknown(other),
        }
    }
}

impl From<FlashStatus> for u8 {
    fn from(status: FlashStatus) -> Self {
        match status {
            FlashStatus::Busy => 1,
            FlashStatus::ErrorRd => 2,
            FlashStatus::ErrorPgs => 3,
            FlashStatus::ErrorPgp => 4,
            FlashStatus::ErrorPga => 5,
            FlashStatus::ErrorWrp => 6,
            FlashStatus::ErrorProgram => 7,
            FlashStatus::ErrorOperation => 8,
            FlashStatus::Complete => 9,
            FlashStatus::Unknown(other) => other,
        }
    }
}

impl Display for FlashStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FlashStatus::Busy => write!(f, "FLASH_BUSY"),
            FlashStatus::ErrorRd => write!(f, "FLASH_ERROR_RD"),
            FlashStatus::ErrorPgs => write!(f, "FLASH_ERROR_PGS"),
            FlashStatus::ErrorPgp => write!(f, "FLASH_ERROR_PGP"),
            FlashStatus::ErrorPga => write!(f, "FLASH_ERROR_PGA"),
            FlashStatus::ErrorWrp => write!(f, "FLASH_ERROR_WRP"),
            FlashStatus::ErrorProgram => write!(f, "FLASH_ERROR_PROGRAM"),
            FlashStatus::ErrorOperation => write!(f, "FLASH_ERROR_OPERATION"),
            FlashStatus::Complete => write!(f, "FLASH_COMPLETE"),
            FlashStatus::Unknown(code) => write!(f, "{}", code),
        }
    }
}
