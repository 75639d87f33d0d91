// High-level firmware update for the flight-controller bootloader
// Runs the enter/erase/write/verify/commit/exit sequence and reports progress

use std::time::Duration;

use tokio::time::Instant;

use crate::bootloader::Bootloader;
use crate::config::BootConfig;
use crate::error::BootError;
use crate::image::FirmwareImage;
use crate::msglink::Transport;
use crate::progress::ProgressSink;

/// How an update ended, when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The new image was written, verified, committed and started
    Completed(UpdateReport),
    /// The user cancelled between two steps
    Cancelled,
}

/// Time spent in each phase of a completed update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Number of enter attempts needed
    pub enter_attempts: usize,
    /// Time to enter the bootloader
    pub enter: Duration,
    /// Time to erase all sectors
    pub erase: Duration,
    /// Time to write the image body
    pub write: Duration,
    /// Time to verify the image body
    pub verify: Duration,
    /// Time of the whole update
    pub total: Duration,
}

/// High-level interface for firmware updates
///
/// The update is crash-safe with respect to the entry vector: the first
/// `entry_vector_len` bytes of the image, which the device reads at boot to find
/// the application, are written only after the rest of the image has been
/// written and verified. If the update is interrupted before that, the device
/// keeps booting its previous image.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> anyhow::Result<()> {
/// use quadloader::{BootConfig, FirmwareImage, FirmwareUpdater, MsgLink, NoProgress, UpdateOutcome};
///
/// let mut link = MsgLink::open_serial("/dev/ttyUSB0", 115_200)?;
/// let image = FirmwareImage::from_binary(0x0801_0000, std::fs::read("firmware.bin")?);
///
/// let mut updater = FirmwareUpdater::new(&mut link, BootConfig::default(), NoProgress);
/// if let UpdateOutcome::Completed(report) = updater.update_firmware(&image).await? {
///     println!("Flashed in {:?}", report.total);
/// }
/// # Ok(())
/// # }
/// ```
pub struct FirmwareUpdater<'t, T, P> {
    bootloader: Bootloader<'t, T>,
    progress: P,
}

impl<'t, T: Transport, P: ProgressSink> FirmwareUpdater<'t, T, P> {
    /// Create an updater over `link`
    ///
    /// # Arguments
    ///
    /// * `link` - Transport connected to the flight-controller
    /// * `config` - Timeouts, retry bound and flash layout
    /// * `progress` - Receives progress and is polled for cancellation
    pub fn new(link: &'t mut T, config: BootConfig, progress: P) -> Self {
        FirmwareUpdater { bootloader: Bootloader::new(link, config), progress }
    }

    /// Access the progress sink
    pub fn progress(&self) -> &P {
        &self.progress
    }

    /// Flash the first section of `image`
    ///
    /// Steps, with a cancellation check after each one:
    /// 1. enter the bootloader, retrying up to `enter_attempts` times
    /// 2. erase every configured sector
    /// 3. write the image without its entry vector
    /// 4. verify what was written
    /// 5. write the entry vector
    /// 6. exit the bootloader
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step. Nothing is rolled back.
    pub async fn update_firmware(&mut self, image: &FirmwareImage) -> Result<UpdateOutcome, BootError> {
        let section = image.first_section().ok_or(BootError::EmptyImage)?;
        let vector_len = self.bootloader.config().entry_vector_len;
        if section.data.len() <= vector_len {
            return Err(BootError::ImageTooSmall { len: section.data.len(), min: vector_len });
        }

        let start_address = section.offset;
        let data = section.data.as_slice();
        let end_address = section
            .end()
            .ok_or(BootError::AddressOverflow { address: start_address, len: data.len() })?;
        log::info!("Start 0x{:08x}", start_address);
        log::info!("End   0x{:08x}", end_address);

        let t0 = Instant::now();

        let Some(enter_attempts) = self.enter_bootloader().await? else {
            return Ok(UpdateOutcome::Cancelled);
        };
        let t_enter = Instant::now();

        let sectors = self.bootloader.config().sectors.clone();
        let sector_count = sectors.len().max(1);
        for (i, sector) in sectors.enumerate() {
            self.progress.set_progress(
                (10 + 10 * i / sector_count) as u8,
                &format!("Erasing sector {}...", sector),
            );
            self.bootloader.erase_sector(sector).await?;
            if self.cancelled() {
                return Ok(UpdateOutcome::Cancelled);
            }
        }
        let t_erase = Instant::now();

        // The entry vector is held back until the rest is written and verified
        let body_address = start_address + vector_len as u32;
        let body = &data[vector_len..];
        let progress = &mut self.progress;
        self.bootloader
            .write_region(
                body_address,
                body,
                Some(|sent: usize, total: usize| {
                    progress.set_progress(
                        (sent * 100 / total) as u8,
                        &format!("Writing 0x{:08x}", body_address + sent as u32),
                    )
                }),
            )
            .await?;
        if self.cancelled() {
            return Ok(UpdateOutcome::Cancelled);
        }
        let t_write = Instant::now();

        self.progress.set_progress(85, "Verifying");
        self.bootloader.verify_region(body_address, body).await?;
        if self.cancelled() {
            return Ok(UpdateOutcome::Cancelled);
        }
        let t_verify = Instant::now();

        self.progress.set_progress(90, &format!("Writing first {} bytes", vector_len));
        self.bootloader
            .write_region(start_address, &data[..vector_len], None::<fn(usize, usize)>)
            .await?;
        if self.cancelled() {
            return Ok(UpdateOutcome::Cancelled);
        }

        self.progress.set_progress(95, "Starting application");
        self.bootloader.exit().await?;

        self.progress.set_progress(100, "Done.");
        let t_total = Instant::now();

        let report = UpdateReport {
            enter_attempts,
            enter: t_enter - t0,
            erase: t_erase - t_enter,
            write: t_write - t_erase,
            verify: t_verify - t_write,
            total: t_total - t0,
        };
        log::info!("  Enter:  {} ms", report.enter.as_millis());
        log::info!("  Erase:  {} ms", report.erase.as_millis());
        log::info!("  Write:  {} ms", report.write.as_millis());
        log::info!("  Verify: {} ms", report.verify.as_millis());
        log::info!("  Total:  {} ms", report.total.as_millis());

        Ok(UpdateOutcome::Completed(report))
    }

    // Retry entering until it succeeds; None if cancelled, Some(attempts) on success
    async fn enter_bootloader(&mut self) -> Result<Option<usize>, BootError> {
        let max_attempts = self.bootloader.config().enter_attempts;

        for attempt in 1..=max_attempts {
            self.progress.set_progress(attempt.min(100) as u8, "Entering bootloader");
            let entered = match self.bootloader.enter().await {
                Ok(()) => true,
                Err(BootError::Link(e)) => return Err(BootError::Link(e)),
                Err(e) => {
                    log::debug!("Enter attempt {} failed: {}", attempt, e);
                    false
                }
            };
            if self.cancelled() {
                return Ok(None);
            }
            if entered {
                log::info!("Entered bootloader after {} attempts", attempt);
                return Ok(Some(attempt));
            }
        }

        Err(BootError::EnterExhausted { attempts: max_attempts })
    }

    fn cancelled(&self) -> bool {
        let cancelled = self.progress.is_cancelled();
        if cancelled {
            log::info!("Firmware update cancelled");
        }
        cancelled
    }
}
