//! Kernel Orchestration
//!
//! Uploading a bootstrap kernel into PCM RAM, proving it started, pulling
//! the flash image out through it, and verifying the result against the
//! kernel's own CRC engine. Chunks go in from the highest address down and
//! only the final chunk carries the execute flag, so no partially-written
//! code is ever jumped into.

use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, info, warn};

use crate::chips::{self, FlashChip};
use crate::device::TimeoutScenario;
use crate::frame::VpwFrame;
use crate::error::{ObdError, Result};
use crate::pcm::PcmInfo;
use crate::protocol::{self, copy_type};
use crate::query::{CancelToken, Query};
use crate::vehicle::Vehicle;

/// CRC-32 instance matching the kernel's table.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Send retries for one upload chunk or one memory block.
const MAX_SEND_ATTEMPTS: usize = 10;

/// The PCM refuses upload requests declaring more than 4 KiB, even though it
/// accepts any total amount delivered as chained copy frames.
const MAX_DECLARED_UPLOAD: usize = 4096;

/// Chunk ceiling while a loader is relaying: its receive buffer is small.
const LOADER_CHUNK_LIMIT: usize = 512;

/// Settle time before each chunk so the receiving code can re-enter its
/// receive loop.
const PRE_SEND_DELAY: Duration = Duration::from_millis(50);

impl Vehicle {
    /// Uploads `payload` into PCM RAM and jumps into it.
    ///
    /// Called once for the loader (on families that need one) and once for
    /// the kernel. After a loader run, `info.loader_required` is cleared so
    /// the next call targets the kernel base address through the loader.
    pub async fn pcm_execute(
        &mut self,
        info: &mut PcmInfo,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<()> {
        let load_address = if info.loader_required {
            info.loader_base_address
        } else {
            info.kernel_base_address
        };
        let is_kernel = load_address == info.kernel_base_address;
        info!(
            "uploading {} bytes to 0x{load_address:06X}",
            payload.len()
        );

        self.device.set_timeout(TimeoutScenario::SendKernel).await?;
        self.notifier.force_notify(self.device.as_mut()).await?;

        let declared = payload.len().min(MAX_DECLARED_UPLOAD) as u16;
        let hardware = info.hardware_type;
        Query::new(
            self.device.as_mut(),
            move || protocol::upload_request(hardware, declared, load_address),
            protocol::parse_upload_permission,
            cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await?;
        debug!("upload permission granted");

        let mut chunk_size = self
            .device
            .capabilities()
            .max_kernel_send_size
            .saturating_sub(12);
        // A kernel going in through a loader must respect the loader's
        // buffer, not the device's.
        if is_kernel && !info.loader_required && info.loader_base_address != 0 {
            chunk_size = chunk_size.min(LOADER_CHUNK_LIMIT);
        }
        if chunk_size == 0 {
            return Err(ObdError::protocol("device cannot carry upload chunks"));
        }

        let full_chunks = payload.len() / chunk_size;
        let remainder = payload.len() % chunk_size;

        // Highest addresses first; the chunk containing the load address
        // goes last and carries the execute flag.
        if remainder > 0 {
            let offset = full_chunks * chunk_size;
            let copy = if full_chunks == 0 {
                copy_type::EXECUTE
            } else {
                copy_type::COPY
            };
            self.write_chunk(copy, load_address + offset as u32, &payload[offset..], cancel)
                .await?;
        }
        for index in (0..full_chunks).rev() {
            let offset = index * chunk_size;
            let copy = if index == 0 {
                copy_type::EXECUTE
            } else {
                copy_type::COPY
            };
            self.write_chunk(
                copy,
                load_address + offset as u32,
                &payload[offset..offset + chunk_size],
                cancel,
            )
            .await?;
        }

        if is_kernel && info.kernel_version_support {
            let version = self.query_kernel_version(cancel).await?;
            if version == 0 {
                return Err(ObdError::protocol("kernel did not start"));
            }
            info!("kernel version {version:08X} is alive");
        }

        if !is_kernel {
            info.loader_required = false;
        }
        Ok(())
    }

    /// Sends one upload chunk, retrying until the PCM acknowledges it.
    async fn write_chunk(
        &mut self,
        copy: u8,
        address: u32,
        chunk: &[u8],
        cancel: &CancelToken,
    ) -> Result<()> {
        let packet = protocol::upload_packet(copy, address, chunk);
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            cancel.check()?;
            tokio::time::sleep(PRE_SEND_DELAY).await;
            self.notifier.notify(self.device.as_mut()).await?;

            debug!(
                "chunk 0x{address:06X} ({} bytes), attempt {attempt}",
                chunk.len()
            );
            self.device.send_message(&packet).await?;
            if self.wait_for_chunk_ack().await {
                return Ok(());
            }
            warn!("no acknowledgment for chunk 0x{address:06X}");
        }
        Err(ObdError::Timeout)
    }

    /// Drains the queue looking for a positive chunk acknowledgment.
    /// Refusals are background noise during block transfers and are skipped.
    async fn wait_for_chunk_ack(&mut self) -> bool {
        while let Some(frame) = self.device.receive_message().await {
            match protocol::parse_upload_ack(&frame) {
                Ok(()) => return true,
                Err(ObdError::Refused { code, .. }) => {
                    debug!("ignoring refusal 0x{code:02X} while uploading");
                }
                Err(_) => debug!("ignoring frame: {:02X?}", frame.as_bytes()),
            }
        }
        false
    }

    pub async fn query_kernel_version(&mut self, cancel: &CancelToken) -> Result<u32> {
        Query::new(
            self.device.as_mut(),
            protocol::kernel_version_request,
            protocol::parse_kernel_version,
            cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await
    }

    pub async fn query_flash_chip_id(&mut self, cancel: &CancelToken) -> Result<u32> {
        Query::new(
            self.device.as_mut(),
            protocol::flash_id_request,
            protocol::parse_flash_id,
            cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await
    }

    /// Asks the running kernel which operating system the flash carries,
    /// as a sanity check that RAM execution left addressing intact.
    pub async fn query_os_id_from_kernel(&mut self, cancel: &CancelToken) -> Result<u32> {
        Query::new(
            self.device.as_mut(),
            protocol::os_id_from_kernel_request,
            protocol::parse_os_id_from_kernel,
            cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await
    }

    /// Reads one memory block through the kernel into `image` at `address`.
    /// A checksum mismatch leaves `image` untouched.
    pub async fn read_memory_block(
        &mut self,
        image: &mut [u8],
        address: u32,
        length: u16,
        cancel: &CancelToken,
    ) -> Result<()> {
        let data = Query::new(
            self.device.as_mut(),
            move || protocol::read_memory_request(length, address),
            move |frame: &VpwFrame| protocol::parse_payload_read(frame, address),
            cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await?;

        let start = address as usize;
        let end = start + data.len();
        if end > image.len() {
            return Err(ObdError::protocol(format!(
                "read of 0x{address:06X}+{} overruns the image buffer",
                data.len()
            )));
        }
        image[start..end].copy_from_slice(&data);
        Ok(())
    }

    /// Reads the entire flash image. Returns `Ok(None)` when cancelled.
    /// `cleanup` runs regardless of how the read ends.
    pub async fn read_contents(
        &mut self,
        info: &PcmInfo,
        loader: Option<&[u8]>,
        kernel: &[u8],
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>> {
        let result = self.read_contents_inner(info, loader, kernel, cancel).await;
        self.cleanup().await;
        self.status.status_update_reset();
        result
    }

    async fn read_contents_inner(
        &mut self,
        info: &PcmInfo,
        loader: Option<&[u8]>,
        kernel: &[u8],
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>> {
        let mut info = info.clone();
        self.status.status_update_activity("Reading flash contents");
        self.notifier.force_notify(self.device.as_mut()).await?;

        let caps = self.device.capabilities().clone();
        if caps.enable_4x_read_write {
            if caps.supports_4x {
                self.set_vpw_4x().await?;
            } else {
                self.status.add_user_message(
                    "This device cannot signal at 4x; reading at standard speed",
                );
            }
        }

        self.send_fire_and_forget(protocol::disable_normal_tx()).await;

        if !self.unlock_ecu(info.key_algorithm).await? {
            return Err(ObdError::protocol("PCM would not unlock"));
        }

        if info.loader_required {
            let loader = loader
                .ok_or_else(|| ObdError::protocol("this PCM family requires a loader binary"))?;
            self.pcm_execute(&mut info, loader, cancel).await?;
        }
        self.pcm_execute(&mut info, kernel, cancel).await?;

        let chip = if info.flash_id_support {
            let id = self.query_flash_chip_id(cancel).await?;
            let chip = chips::lookup(id);
            self.status
                .add_user_message(&format!("Flash chip: {} (0x{id:08X})", chip.name));
            Some(chip)
        } else {
            None
        };

        self.device
            .set_timeout(TimeoutScenario::ReadMemoryBlock)
            .await?;
        let block_size = caps
            .max_receive_size
            .saturating_sub(12)
            .min(info.kernel_max_block_size);
        if block_size == 0 {
            return Err(ObdError::protocol("device cannot carry read replies"));
        }

        let mut image = vec![0xFF; info.image_size];
        let mut total_retries = 0usize;
        let started = self.clock.now();

        let mut address = 0usize;
        while address < info.image_size {
            if cancel.is_cancelled() {
                self.status.add_user_message("Read cancelled");
                return Ok(None);
            }
            let length = block_size.min(info.image_size - address) as u16;

            let mut last_error = None;
            let mut done = false;
            for _ in 0..MAX_SEND_ATTEMPTS {
                match self
                    .read_memory_block(&mut image, address as u32, length, cancel)
                    .await
                {
                    Ok(()) => {
                        done = true;
                        break;
                    }
                    Err(ObdError::Cancelled) => {
                        self.status.add_user_message("Read cancelled");
                        return Ok(None);
                    }
                    Err(e) => {
                        total_retries += 1;
                        self.status
                            .status_update_retry_count(&total_retries.to_string());
                        warn!("block 0x{address:06X} failed: {e}, retrying");
                        last_error = Some(e);
                    }
                }
            }
            if !done {
                return Err(last_error.unwrap_or(ObdError::Timeout));
            }

            address += length as usize;
            self.report_read_progress(address, info.image_size, started);
        }

        if let Some(chip) = chip {
            if info.flash_crc_support && !chip.ranges.is_empty() {
                if !self.verify_crcs(&image, &chip, cancel).await? {
                    self.status
                        .add_user_message("CRC verification failed; the image may be corrupt");
                }
            }
        }

        self.status.status_update_activity("Read complete");
        Ok(Some(image))
    }

    fn report_read_progress(&self, done: usize, total: usize, started: Duration) {
        let fraction = done as f64 / total as f64;
        self.status
            .status_update_percent_done(&format!("{:.0}%", fraction * 100.0));
        self.status.status_update_progress_bar(fraction, false);

        let elapsed = self.clock.now().saturating_sub(started).as_secs_f64();
        if elapsed > 0.5 {
            let kbps = done as f64 * 8.0 / 1000.0 / elapsed;
            self.status.status_update_kbps(&format!("{kbps:.1} Kbps"));
            let remaining = (total - done) as f64 / (done as f64 / elapsed);
            self.status
                .status_update_time_remaining(&format!("{:.0}s", remaining));
        }
    }

    /// Compares the kernel's CRC of each flash range against the CRC of the
    /// downloaded slice. Reports per-range, returns whether everything
    /// matched.
    async fn verify_crcs(
        &mut self,
        image: &[u8],
        chip: &FlashChip,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.device.set_timeout(TimeoutScenario::ReadCrc).await?;
        self.status.status_update_activity("Verifying checksums");

        let mut all_match = true;
        for range in chip.ranges {
            cancel.check()?;
            let start = range.address as usize;
            let end = start + range.length as usize;
            if end > image.len() {
                debug!(
                    "skipping range 0x{:06X}+0x{:X}: beyond image",
                    range.address, range.length
                );
                continue;
            }

            let address = range.address;
            let length = range.length;
            let remote = Query::new(
                self.device.as_mut(),
                move || protocol::kernel_crc_request(address, length),
                move |frame: &VpwFrame| protocol::parse_kernel_crc(frame, address, length),
                cancel,
            )
            .with_notifier(&mut self.notifier)
            .execute()
            .await?;

            let local = CRC32.checksum(&image[start..end]);
            let verdict = if local == remote { "match" } else { "MISMATCH" };
            self.status.add_user_message(&format!(
                "{:?} 0x{:06X}-0x{:06X}: {verdict}",
                range.block_type,
                range.address,
                range.address + range.length - 1
            ));
            if local != remote {
                warn!(
                    "CRC mismatch in range 0x{:06X}: kernel 0x{remote:08X}, image 0x{local:08X}",
                    range.address
                );
                all_match = false;
            }
        }
        Ok(all_match)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mirrors the chunking arithmetic in pcm_execute.
    fn plan(len: usize, chunk: usize) -> Vec<(usize, usize, bool)> {
        let full = len / chunk;
        let rem = len % chunk;
        let mut out = Vec::new();
        if rem > 0 {
            out.push((full * chunk, rem, full == 0));
        }
        for i in (0..full).rev() {
            out.push((i * chunk, chunk, i == 0));
        }
        out
    }

    #[test]
    fn chunk_plan_descends_and_executes_last() {
        let chunks = plan(10_000, 4096);
        let offsets: Vec<usize> = chunks.iter().map(|c| c.0).collect();
        assert_eq!(offsets, vec![8192, 4096, 0]);
        assert!(chunks.last().unwrap().2);
        assert!(chunks[..chunks.len() - 1].iter().all(|c| !c.2));
    }

    #[test]
    fn single_chunk_payload_executes_immediately() {
        let chunks = plan(100, 4096);
        assert_eq!(chunks, vec![(0, 100, true)]);
    }

    #[test]
    fn exact_multiple_has_no_remainder_chunk() {
        let chunks = plan(8192, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (4096, 4096, false));
        assert_eq!(chunks[1], (0, 4096, true));
    }
}
