//! # Interface to the flight-controller bootloader
//!
//! Each operation sends one request and waits for the matching
//! [`BootResponse`](crate::packets::BootResponse). There is no sequence number on
//! the wire: a response belongs to the oldest unanswered request, so requests are
//! never interleaved except for the pipelined writes of
//! [`write_region`](Bootloader::write_region).
//!
//! For most use cases, prefer the high-level [`FirmwareUpdater`](crate::FirmwareUpdater).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::checksum::checksum32;
use crate::config::BootConfig;
use crate::error::BootError;
use crate::msglink::Transport;
use crate::packets::*;

// Ctrl-C followed by a shell reset, brings a running application back to the bootloader
const RESET_SEQUENCE: &str = "\x03\nreset\n";

// Status byte of a successful enter or exit
const STATUS_OK: u8 = 1;

/// Bootloader operations on a borrowed transport
pub struct Bootloader<'t, T> {
    link: &'t mut T,
    config: BootConfig,
}

impl<'t, T: Transport> Bootloader<'t, T> {
    /// Create a bootloader interface over `link`
    pub fn new(link: &'t mut T, config: BootConfig) -> Self {
        Bootloader { link, config }
    }

    /// Configuration in use
    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    // Wait for the next boot response, skipping any other message
    async fn get_response(&mut self, timeout: Duration) -> Result<BootResponse, BootError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = self.link.recv(remaining).await? else {
                return Err(BootError::Timeout(timeout));
            };

            match BootResponse::from_message(&message) {
                Some(response) => return Ok(response),
                None => log::debug!("Ignoring {:?} while waiting for a boot response", message),
            }
        }
    }

    // Discard what is already queued, such as the late answer to a timed out request
    async fn drain_inbox(&mut self) -> Result<(), BootError> {
        while let Some(message) = self.link.recv(Duration::ZERO).await? {
            log::debug!("Discarding stale {:?}", message);
        }
        Ok(())
    }

    /// Send the shell reset sequence
    ///
    /// If the application is running, this makes it reboot into the bootloader.
    pub async fn force_reset(&mut self) -> Result<(), BootError> {
        let message = Message::shell_from_pc(RESET_SEQUENCE)?;
        self.link.send(&message).await?;
        Ok(())
    }

    /// Enter the bootloader
    ///
    /// Sends the reset sequence, then the enter request. The device may still be
    /// rebooting, so callers are expected to retry on failure. Messages queued
    /// before the attempt are discarded so that a late answer to an earlier
    /// attempt is not taken for this one.
    pub async fn enter(&mut self) -> Result<(), BootError> {
        self.drain_inbox().await?;
        self.force_reset().await?;
        self.link.send(&Message::boot_enter(self.config.boot_magic)).await?;

        let response = self.get_response(self.config.response_timeout).await?;
        match status_byte(&response)? {
            STATUS_OK => Ok(()),
            status => Err(BootError::EnterRejected(status)),
        }
    }

    /// Leave the bootloader and start the application
    pub async fn exit(&mut self) -> Result<(), BootError> {
        self.link.send(&Message::boot_exit()).await?;

        let response = self.get_response(self.config.response_timeout).await?;
        match status_byte(&response)? {
            STATUS_OK => Ok(()),
            status => Err(BootError::ExitRejected(status)),
        }
    }

    /// Erase one flash sector
    ///
    /// Erasing is slow, the wait uses the erase timeout of the configuration.
    pub async fn erase_sector(&mut self, sector: u32) -> Result<(), BootError> {
        self.link.send(&Message::boot_erase_sector(sector)).await?;

        let response = self.get_response(self.config.erase_timeout).await?;
        match FlashStatus::from(status_byte(&response)?) {
            FlashStatus::Complete => Ok(()),
            status => Err(BootError::EraseFailed { sector, status }),
        }
    }

    /// Write `data` to flash at `address`
    ///
    /// The data is split in chunks of [`WRITE_CHUNK_SIZE`] bytes. Up to
    /// `ack_window` chunks are sent ahead of their acknowledgements so that the
    /// link latency overlaps with the device's programming time. The first chunk
    /// reported as failed aborts the write; acknowledgements still in flight are
    /// left unread.
    ///
    /// # Arguments
    ///
    /// * `address` - Flash address of the first byte
    /// * `data` - Bytes to write
    /// * `progress_callback` - Optional callback called before each chunk with (bytes_sent, total_bytes)
    pub async fn write_region<F>(&mut self, address: u32, data: &[u8], mut progress_callback: Option<F>) -> Result<(), BootError>
    where
        F: FnMut(usize, usize),
    {
        region_end(address, data.len())?;
        let total_chunks = data.len().div_ceil(WRITE_CHUNK_SIZE);
        let ack_window = total_chunks.min(self.config.ack_window.max(1));

        let mut chunks = data.chunks(WRITE_CHUNK_SIZE);
        let mut in_flight: VecDeque<u32> = VecDeque::with_capacity(ack_window);
        let mut offset = 0;

        for step in 0..total_chunks + ack_window {
            // Once the window is full, each step first retires the oldest write
            if step >= ack_window {
                if let Some(chunk_address) = in_flight.pop_front() {
                    let response = self.get_response(self.config.response_timeout).await?;
                    match FlashStatus::from(status_byte(&response)?) {
                        FlashStatus::Complete => {}
                        status => return Err(BootError::WriteFailed { address: chunk_address, status }),
                    }
                }
            }

            if let Some(chunk) = chunks.next() {
                let chunk_address = address + offset as u32;
                if let Some(callback) = progress_callback.as_mut() {
                    callback(offset, data.len());
                }

                self.link.send(&Message::boot_write_data(chunk_address, chunk)?).await?;
                in_flight.push_back(chunk_address);
                offset += chunk.len();
            }
        }

        log::debug!("Wrote {} bytes at 0x{:08x} in {} chunks", data.len(), address, total_chunks);
        Ok(())
    }

    /// Check that flash at `address` holds `data`
    ///
    /// The device computes a CRC-32 over the range and it is compared with the
    /// CRC-32 of `data`.
    pub async fn verify_region(&mut self, address: u32, data: &[u8]) -> Result<(), BootError> {
        let end = region_end(address, data.len())?;
        self.link.send(&Message::boot_verify(address, end - address)).await?;

        let response = self.get_response(self.config.response_timeout).await?;
        let actual = response
            .checksum()
            .ok_or_else(|| BootError::MalformedResponse(format!("verify response of {} bytes", response.payload().len())))?;

        let expected = checksum32(data);
        if actual != expected {
            return Err(BootError::Verification { expected, actual });
        }
        Ok(())
    }
}

/// Address one past the end of `len` bytes at `address`
///
/// # Errors
///
/// Returns [`BootError::AddressOverflow`] if the region does not fit in the
/// 32-bit address space.
pub fn region_end(address: u32, len: usize) -> Result<u32, BootError> {
    u32::try_from(len)
        .ok()
        .and_then(|len| address.checked_add(len))
        .ok_or(BootError::AddressOverflow { address, len })
}

fn status_byte(response: &BootResponse) -> Result<u8, BootError> {
    response
        .status()
        .ok_or_else(|| BootError::MalformedResponse("missing status byte".to_string()))
}
