//! Paged firmware reception memory.
//!
//! Reconstructs a firmware image from Create → WriteData → Store page
//! cycles, mirroring every accepted byte to disk (app-data file, firmware
//! file, sha256 file) and computing the integrity values the protocol
//! reports: a rolling CRC-32 over stored-plus-in-progress bytes and a
//! final SHA-256 over the stored image.
//!
//! The SHA-256 digest is byte-reversed before it is persisted and before
//! it is compared against the digest declared at init. Peers send the
//! digest in that reversed order; this is a wire-compatibility
//! requirement, not a convention choice.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crc::{Crc, CRC_32_ISO_HDLC};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Smallest page size the protocol can operate with.
pub const MIN_SUPPORTED_PAGE_SIZE: u16 = 21;

const FIRMWARE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error)]
pub enum PageMemoryError {
    #[error("firmware image of {requested} bytes exceeds the {limit} byte limit")]
    ImageTooLarge { requested: u32, limit: u32 },

    #[error("app data length mismatch: expected {expected} bytes, got {got}")]
    AppDataLenMismatch { expected: usize, got: usize },

    #[error("page incomplete: expected {expected} bytes, accumulated {got}")]
    PageLenMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct PageMemory {
    app_data_path: PathBuf,
    firmware_path: PathBuf,
    sha256_path: PathBuf,
    supported_page_size: u16,
    max_image_size: u32,

    app_data: Vec<u8>,
    app_data_expected_len: usize,

    firmware: Vec<u8>,
    firmware_offset: u32,

    page: Vec<u8>,
    page_expected_len: usize,
}

impl PageMemory {
    /// Create the memory, reloading any previously mirrored app-data and
    /// firmware bytes. Unreadable files yield empty buffers and offset 0;
    /// that is the resume-from-nothing case, not an error.
    pub fn new(
        app_data_path: impl Into<PathBuf>,
        firmware_path: impl Into<PathBuf>,
        sha256_path: impl Into<PathBuf>,
        supported_page_size: u16,
        max_image_size: u32,
    ) -> Self {
        let app_data_path = app_data_path.into();
        let firmware_path = firmware_path.into();

        let app_data = std::fs::read(&app_data_path).unwrap_or_else(|_| {
            debug!(path = %app_data_path.display(), "unable to open app data file");
            Vec::new()
        });
        let firmware = std::fs::read(&firmware_path).unwrap_or_else(|_| {
            debug!(path = %firmware_path.display(), "unable to open firmware file");
            Vec::new()
        });
        let firmware_offset = firmware.len() as u32;

        debug!(
            app_data_len = app_data.len(),
            firmware_offset, "initialized page memory"
        );

        Self {
            app_data_path,
            firmware_path,
            sha256_path: sha256_path.into(),
            supported_page_size,
            max_image_size,
            app_data_expected_len: app_data.len(),
            app_data,
            firmware,
            firmware_offset,
            page: Vec::new(),
            page_expected_len: 0,
        }
    }

    pub fn supported_page_size(&self) -> u16 {
        self.supported_page_size
    }

    pub fn app_data(&self) -> &[u8] {
        &self.app_data
    }

    /// Bytes stored so far (whole pages only).
    pub fn firmware_offset(&self) -> u32 {
        self.firmware_offset
    }

    /// Bytes accumulated in the in-progress page.
    pub fn page_offset(&self) -> u32 {
        self.page.len() as u32
    }

    /// Reset the firmware buffer for an image of `size` bytes.
    pub fn set_firmware_memory_size(&mut self, size: u32) -> Result<(), PageMemoryError> {
        if self.max_image_size != 0 && size > self.max_image_size {
            return Err(PageMemoryError::ImageTooLarge {
                requested: size,
                limit: self.max_image_size,
            });
        }
        self.firmware.clear();
        debug!(size, "firmware memory size set");
        Ok(())
    }

    /// Record the expected app-data length and reset the app-data buffer.
    pub fn set_app_data_memory_size(&mut self, size: usize) {
        self.app_data.clear();
        self.app_data_expected_len = size;
        debug!(size, "app data memory size set");
    }

    /// Accept the app-data blob, overwriting the mirror file.
    pub fn write_app_data(&mut self, data: &[u8]) -> Result<(), PageMemoryError> {
        if data.len() != self.app_data_expected_len {
            return Err(PageMemoryError::AppDataLenMismatch {
                expected: self.app_data_expected_len,
                got: data.len(),
            });
        }
        std::fs::write(&self.app_data_path, data)?;
        self.app_data = data.to_vec();
        debug!(len = data.len(), "app data written");
        Ok(())
    }

    /// Arm an empty page accumulator expecting exactly `size` bytes.
    ///
    /// A size above `supported_page_size` is not rejected here; the peer
    /// is expected to honour the advertised limit, and an oversized page
    /// fails at [`page_store`](Self::page_store) anyway.
    pub fn create_page(&mut self, size: u16) {
        self.page.clear();
        self.page_expected_len = size as usize;
        debug!(
            size,
            firmware_offset = self.firmware_offset,
            "page created"
        );
    }

    /// Append bytes to the in-progress page. Length checking is deferred
    /// to [`page_store`](Self::page_store).
    pub fn write_data(&mut self, data: &[u8]) {
        self.page.extend_from_slice(data);
        debug!(page_offset = self.page.len(), "page data written");
    }

    /// Commit the in-progress page: append it to the firmware buffer and
    /// the firmware file, advance the offset, reset the accumulator.
    pub fn page_store(&mut self) -> Result<(), PageMemoryError> {
        if self.page.len() != self.page_expected_len {
            return Err(PageMemoryError::PageLenMismatch {
                expected: self.page_expected_len,
                got: self.page.len(),
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.firmware_path)?;
        file.write_all(&self.page)?;

        self.firmware.extend_from_slice(&self.page);
        self.firmware_offset += self.page.len() as u32;
        self.page.clear();
        self.page_expected_len = 0;

        debug!(firmware_offset = self.firmware_offset, "page stored");
        Ok(())
    }

    /// CRC-32 over the stored firmware plus the in-progress page.
    pub fn calc_firmware_crc(&self) -> u32 {
        let mut digest = FIRMWARE_CRC.digest();
        digest.update(&self.firmware);
        digest.update(&self.page);
        digest.finalize()
    }

    /// SHA-256 of the stored firmware (the in-progress page excluded),
    /// byte-reversed, persisted to the sha256 file as lower-case hex.
    ///
    /// Persisting is best-effort: the returned digest is what the
    /// protocol compares, so a write failure must not fail a good image.
    pub fn calc_firmware_sha256(&self) -> [u8; 32] {
        let mut sha: [u8; 32] = Sha256::digest(&self.firmware).into();
        sha.reverse();

        if let Err(e) = std::fs::write(&self.sha256_path, hex::encode(sha)) {
            warn!(path = %self.sha256_path.display(), error = %e, "unable to write sha256 file");
        }

        sha
    }

    /// Truncate all three mirror files and zero every buffer and offset.
    pub fn clear(&mut self) -> Result<(), PageMemoryError> {
        File::create(&self.app_data_path)?;
        File::create(&self.firmware_path)?;
        File::create(&self.sha256_path)?;

        self.app_data.clear();
        self.app_data_expected_len = 0;
        self.firmware.clear();
        self.firmware_offset = 0;
        self.page.clear();
        self.page_expected_len = 0;

        debug!("page memory cleared");
        Ok(())
    }

    #[cfg(test)]
    fn firmware(&self) -> &[u8] {
        &self.firmware
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(dir: &tempfile::TempDir) -> PageMemory {
        PageMemory::new(
            dir.path().join("app_data"),
            dir.path().join("firmware"),
            dir.path().join("sha256"),
            64,
            0,
        )
    }

    #[test]
    fn page_cycle_advances_offset_and_mirrors_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(&dir);

        mem.set_firmware_memory_size(32).unwrap();
        mem.create_page(16);
        mem.write_data(&[0xAA; 8]);
        assert_eq!(mem.page_offset(), 8);
        mem.write_data(&[0xBB; 8]);
        mem.page_store().unwrap();

        assert_eq!(mem.firmware_offset(), 16);
        assert_eq!(mem.page_offset(), 0);

        mem.create_page(16);
        mem.write_data(&[0xCC; 16]);
        mem.page_store().unwrap();
        assert_eq!(mem.firmware_offset(), 32);

        let on_disk = std::fs::read(dir.path().join("firmware")).unwrap();
        assert_eq!(on_disk, mem.firmware());
        assert_eq!(on_disk.len(), 32);
    }

    #[test]
    fn incomplete_page_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(&dir);

        mem.create_page(16);
        mem.write_data(&[0u8; 12]);
        assert!(matches!(
            mem.page_store(),
            Err(PageMemoryError::PageLenMismatch {
                expected: 16,
                got: 12
            })
        ));
        // Offset untouched by a failed store.
        assert_eq!(mem.firmware_offset(), 0);
    }

    #[test]
    fn image_size_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = PageMemory::new(
            dir.path().join("a"),
            dir.path().join("f"),
            dir.path().join("s"),
            64,
            128,
        );

        assert!(mem.set_firmware_memory_size(128).is_ok());
        assert!(matches!(
            mem.set_firmware_memory_size(129),
            Err(PageMemoryError::ImageTooLarge {
                requested: 129,
                limit: 128
            })
        ));

        // 0 means unlimited
        let mut unlimited = memory(&dir);
        assert!(unlimited.set_firmware_memory_size(u32::MAX).is_ok());
    }

    #[test]
    fn app_data_length_checked() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(&dir);

        mem.set_app_data_memory_size(4);
        assert!(matches!(
            mem.write_app_data(&[1, 2, 3]),
            Err(PageMemoryError::AppDataLenMismatch {
                expected: 4,
                got: 3
            })
        ));

        mem.write_app_data(&[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.app_data(), &[1, 2, 3, 4]);
        assert_eq!(
            std::fs::read(dir.path().join("app_data")).unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn crc_covers_stored_and_in_progress_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(&dir);

        // CRC-32/ISO-HDLC check value
        mem.create_page(9);
        mem.write_data(b"123456789");
        assert_eq!(mem.calc_firmware_crc(), 0xCBF4_3926);

        mem.page_store().unwrap();
        assert_eq!(mem.calc_firmware_crc(), 0xCBF4_3926);

        // Same bytes split across stored firmware and an open page
        mem.create_page(4);
        mem.write_data(b"abcd");
        let split = mem.calc_firmware_crc();
        assert_eq!(split, FIRMWARE_CRC.checksum(b"123456789abcd"));
    }

    #[test]
    fn sha256_is_byte_reversed_and_persisted_as_hex() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(&dir);

        mem.create_page(4);
        mem.write_data(&[0xDE, 0xAD, 0xBE, 0xEF]);
        mem.page_store().unwrap();

        let reversed = mem.calc_firmware_sha256();
        let mut expected: [u8; 32] = Sha256::digest([0xDE, 0xAD, 0xBE, 0xEF]).into();
        expected.reverse();
        assert_eq!(reversed, expected);

        let on_disk = std::fs::read_to_string(dir.path().join("sha256")).unwrap();
        assert_eq!(on_disk, hex::encode(expected));
    }

    #[test]
    fn clear_truncates_files_and_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory(&dir);

        mem.set_app_data_memory_size(2);
        mem.write_app_data(&[9, 9]).unwrap();
        mem.create_page(2);
        mem.write_data(&[1, 2]);
        mem.page_store().unwrap();

        mem.clear().unwrap();

        assert_eq!(mem.firmware_offset(), 0);
        assert_eq!(mem.page_offset(), 0);
        assert!(mem.app_data().is_empty());
        assert_eq!(std::fs::read(dir.path().join("firmware")).unwrap(), b"");
        assert_eq!(std::fs::read(dir.path().join("app_data")).unwrap(), b"");
    }

    #[test]
    fn resume_reloads_mirrored_bytes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut mem = memory(&dir);
            mem.set_app_data_memory_size(3);
            mem.write_app_data(&[7, 8, 9]).unwrap();
            mem.create_page(16);
            mem.write_data(&[0x11; 16]);
            mem.page_store().unwrap();
        }

        let mem = memory(&dir);
        assert_eq!(mem.firmware_offset(), 16);
        assert_eq!(mem.app_data(), &[7, 8, 9]);
    }
}
