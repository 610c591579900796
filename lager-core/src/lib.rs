#![cfg_attr(not(test), no_std)]
#![allow(non_snake_case)]

//! Hardware-independent logic shared by the openlager bootloader and
//! application: the serial ring buffer (C5), the block-device shim (C4),
//! the JSON config loader (C7) and the Morse encoder used by the indicator
//! (C2). Nothing in this crate touches a register; board crates wire these
//! pieces to silicon.

pub mod blockdev;
pub mod config;
pub mod constants;
pub mod json;
pub mod morse;
pub mod ring;

use core::fmt;

/// The error type shared across the openlager workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The SD command/response loop timed out.
    SdTimeout,
    /// A CRC check failed on a command or data transfer.
    SdCrc,
    /// The card reported an error status (R1 error bits set).
    SdCardError,
    /// A block read or write did not complete cleanly.
    SdTransferFailed,
    /// A disk request named a drive other than 0.
    DiskParamError,
    /// A disk request failed after retrying every sector.
    DiskIoError,
    /// The filesystem could not be mounted.
    FsMountFailed,
    /// A filesystem write did not write the full requested length.
    FsWriteFailed,
    /// A file could not be opened or created.
    FsOpenFailed,
    /// Every `logNNN.txt` name in [000, 999] is already in use.
    LogNameExhausted,
    /// The config file did not parse as a JSON object.
    ConfigMalformed,
    /// A recognised config key held a value of the wrong kind.
    ConfigKeyTypeMismatch,
    /// A recognised config key named a feature this build does not support.
    ConfigUnsupported,
    /// The update image is not a multiple of 4 bytes, or is too short.
    ImageTruncated,
    /// No update image is present on the card.
    ImageMissing,
    /// Flash sector erase did not complete.
    FlashEraseFailed,
    /// Flash word program did not complete.
    FlashProgramFailed,

    #[doc(hidden)]
    __Nonexhaustive,
}

/// The result type used throughout openlager.
pub type Result<T> = core::result::Result<T, Error>;

#[rustfmt::skip]
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Error::SdTimeout              => write!(f, "SD command timed out"),
            &Error::SdCrc                  => write!(f, "SD CRC check failed"),
            &Error::SdCardError            => write!(f, "SD card reported an error status"),
            &Error::SdTransferFailed       => write!(f, "SD block transfer failed"),
            &Error::DiskParamError         => write!(f, "invalid drive number"),
            &Error::DiskIoError            => write!(f, "disk I/O failed after retrying"),
            &Error::FsMountFailed          => write!(f, "failed to mount filesystem"),
            &Error::FsWriteFailed          => write!(f, "short write to log file"),
            &Error::FsOpenFailed           => write!(f, "failed to open file"),
            &Error::LogNameExhausted       => write!(f, "no log*.txt name available"),
            &Error::ConfigMalformed        => write!(f, "config file is not a JSON object"),
            &Error::ConfigKeyTypeMismatch  => write!(f, "config key has the wrong value type"),
            &Error::ConfigUnsupported      => write!(f, "config requests an unsupported feature"),
            &Error::ImageTruncated         => write!(f, "update image is truncated or misaligned"),
            &Error::ImageMissing           => write!(f, "no update image present"),
            &Error::FlashEraseFailed       => write!(f, "flash sector erase failed"),
            &Error::FlashProgramFailed     => write!(f, "flash word program failed"),
            &Error::__Nonexhaustive        => unreachable!(),
        }
    }
}
