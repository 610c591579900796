#![cfg_attr(not(test), no_std)]

//! The bootloader's image-update engine (C8): given the bytes of
//! `lager.bin` already read into a buffer and a flash programmer, compares
//! the image against the currently flashed application and reprograms it
//! if they differ.
//!
//! Grounded on `rustBoot-update`'s `FlashUpdater`/`UpdateInterface` shape —
//! a small struct wrapping a `FlashInterface` impl — but with the A/B
//! swap-partition state machine, signature verification and rollback
//! stripped out: this firmware's update model is the simpler direct
//! compare-erase-program scheme §4.8 describes, not `rustBoot`'s dual-bank
//! secure boot (§1's Non-goals exclude cryptographic verification; see
//! DESIGN.md).

use lager_core::constants::{IMAGE_MIN_LEN, IMAGE_WORD_ALIGN};
use lager_core::{Error, Result};
use lager_hal::FlashInterface;

/// What `apply_update` did, so the caller can decide whether to log/blink
/// before handing off (§4.8 step 7: "If identical, fall through" is
/// silent; nothing here blinks on success).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The image on the card matches what's already flashed.
    UpToDate,
    /// The image differed and has been erased and reprogrammed.
    Applied,
}

/// Compares `image` against the `app_base` flash region and reprograms it
/// if needed (§4.8 steps 6-10).
///
/// `image` must already satisfy the length/alignment precondition (step 6);
/// callers read at most `IMAGE_BUFFER_SIZE` bytes from `lager.bin` and pass
/// the resulting slice here unchanged.
pub fn apply_update<F: FlashInterface>(image: &[u8], flash: &F, app_base: usize) -> Result<Outcome> {
    if image.len() < IMAGE_MIN_LEN || image.len() % IMAGE_WORD_ALIGN != 0 {
        return Err(Error::ImageTruncated);
    }

    // Safety: `app_base` names a flash region at least `image.len()` bytes
    // long by construction of the reference memory map (§6); flash is
    // always readable memory on this target.
    let flashed = unsafe { core::slice::from_raw_parts(app_base as *const u8, image.len()) };
    if flashed == image {
        return Ok(Outcome::UpToDate);
    }

    flash.hal_flash_erase(app_base, image.len()).map_err(|_| Error::FlashEraseFailed)?;
    flash
        .hal_flash_write(app_base, image.as_ptr(), image.len())
        .map_err(|_| Error::FlashProgramFailed)?;
    Ok(Outcome::Applied)
}

/// Resets peripheral busses and branches to the already-flashed application
/// (§4.8 step 11). Never returns.
///
/// # Safety
/// Must be the last thing the bootloader does: no peripheral state the
/// application doesn't expect to re-initialise may be left configured.
pub unsafe fn hand_off(app_base: usize) -> ! {
    lager_hal::boot_to_app(app_base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::vec;
    use std::vec::Vec;

    struct FakeFlash {
        memory: RefCell<Vec<u8>>,
        fail_erase: bool,
        fail_write: bool,
    }

    impl FakeFlash {
        fn new(initial: &[u8]) -> Self {
            FakeFlash { memory: RefCell::new(initial.to_vec()), fail_erase: false, fail_write: false }
        }
    }

    impl FlashInterface for FakeFlash {
        fn hal_init() {}
        fn hal_flash_unlock(&self) {}
        fn hal_flash_lock(&self) {}

        fn hal_flash_write(&self, addr: usize, data: *const u8, len: usize) -> Result<()> {
            if self.fail_write {
                return Err(Error::FlashProgramFailed);
            }
            let slice = unsafe { core::slice::from_raw_parts(data, len) };
            self.memory.borrow_mut()[addr..addr + len].copy_from_slice(slice);
            Ok(())
        }

        fn hal_flash_erase(&self, addr: usize, len: usize) -> Result<()> {
            if self.fail_erase {
                return Err(Error::FlashEraseFailed);
            }
            for b in self.memory.borrow_mut()[addr..addr + len].iter_mut() {
                *b = 0xFF;
            }
            Ok(())
        }
    }

    fn flashed_base_ptr(flash: &FakeFlash) -> usize {
        flash.memory.borrow().as_ptr() as usize
    }

    #[test]
    fn identical_image_reports_up_to_date() {
        let image = vec![0xAAu8; IMAGE_MIN_LEN];
        let flash = FakeFlash::new(&image);
        let base = flashed_base_ptr(&flash);
        assert_eq!(apply_update(&image, &flash, base), Ok(Outcome::UpToDate));
    }

    #[test]
    fn differing_image_is_erased_and_programmed() {
        let mut current = vec![0u8; IMAGE_MIN_LEN];
        let image = vec![0x42u8; IMAGE_MIN_LEN];
        current[0] = 0x01; // force a mismatch
        let flash = FakeFlash::new(&current);
        let base = flashed_base_ptr(&flash);
        assert_eq!(apply_update(&image, &flash, base), Ok(Outcome::Applied));
        assert_eq!(&flash.memory.borrow()[..], &image[..]);
    }

    #[test]
    fn image_shorter_than_minimum_is_truncated() {
        let image = vec![0u8; IMAGE_MIN_LEN - 4];
        let flash = FakeFlash::new(&vec![0u8; IMAGE_MIN_LEN]);
        let base = flashed_base_ptr(&flash);
        assert_eq!(apply_update(&image, &flash, base), Err(Error::ImageTruncated));
    }

    #[test]
    fn misaligned_image_length_is_truncated() {
        let image = vec![0u8; IMAGE_MIN_LEN + 1];
        let flash = FakeFlash::new(&vec![0u8; IMAGE_MIN_LEN + 4]);
        let base = flashed_base_ptr(&flash);
        assert_eq!(apply_update(&image, &flash, base), Err(Error::ImageTruncated));
    }

    #[test]
    fn erase_failure_surfaces_as_flash_erase_failed() {
        let mut current = vec![0u8; IMAGE_MIN_LEN];
        current[0] = 1;
        let image = vec![2u8; IMAGE_MIN_LEN];
        let mut flash = FakeFlash::new(&current);
        flash.fail_erase = true;
        let base = flashed_base_ptr(&flash);
        assert_eq!(apply_update(&image, &flash, base), Err(Error::FlashEraseFailed));
    }

    #[test]
    fn write_failure_surfaces_as_flash_program_failed() {
        let mut current = vec![0u8; IMAGE_MIN_LEN];
        current[0] = 1;
        let image = vec![2u8; IMAGE_MIN_LEN];
        let mut flash = FakeFlash::new(&current);
        flash.fail_write = true;
        let base = flashed_base_ptr(&flash);
        assert_eq!(apply_update(&image, &flash, base), Err(Error::FlashProgramFailed));
    }
}
