//! # Bootloader timing and layout configuration

use std::ops::Range;
use std::time::Duration;

use crate::packets::BOOT_MAGIC;

/// Default wait for a bootloader response
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default wait for a sector erase, which can take over a second on the device
pub const DEFAULT_ERASE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default number of attempts to enter the bootloader
pub const DEFAULT_ENTER_ATTEMPTS: usize = 100;
/// Default number of unacknowledged writes kept in flight
pub const DEFAULT_ACK_WINDOW: usize = 10;
/// Sectors holding the application image
pub const DEFAULT_SECTORS: Range<u32> = 4..12;
/// Bytes at the start of the image that are written last
pub const DEFAULT_ENTRY_VECTOR_LEN: usize = 8;

/// Tunables of the update procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// Wait for enter, write, verify and exit responses
    pub response_timeout: Duration,
    /// Wait for an erase response
    pub erase_timeout: Duration,
    /// Number of enter attempts before giving up
    pub enter_attempts: usize,
    /// Maximum number of write requests awaiting acknowledgement
    pub ack_window: usize,
    /// Flash sectors erased before writing
    pub sectors: Range<u32>,
    /// Size of the entry vector withheld until the image is verified
    pub entry_vector_len: usize,
    /// Magic word sent with the enter request
    pub boot_magic: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            erase_timeout: DEFAULT_ERASE_TIMEOUT,
            enter_attempts: DEFAULT_ENTER_ATTEMPTS,
            ack_window: DEFAULT_ACK_WINDOW,
            sectors: DEFAULT_SECTORS,
            entry_vector_len: DEFAULT_ENTRY_VECTOR_LEN,
            boot_magic: BOOT_MAGIC,
        }
    }
}
