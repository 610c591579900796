//! Fixed layout and timing constants shared by every board.

/// SD/FAT block size, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Timer interrupt rate used for the tick counter, in both the bootloader
/// and the application (§6: "Tick. 250 Hz in both stages (4 ms per tick)").
pub const TICK_HZ: u32 = 250;

/// Size of the serial ring buffer, in bytes. A multiple of `SECTOR_SIZE`.
pub const RING_BUFFER_SIZE: usize = 128 * 1024;

/// Consumer poll parameters for the logger main loop (§4.6).
pub const LOGGER_CHUNK_TIMEOUT_TICKS: u32 = 200 / (1000 / TICK_HZ);
pub const LOGGER_PREFERRED_ALIGN: usize = 512;
pub const LOGGER_MIN_PREFERRED_CHUNK: usize = 2560;
pub const LOGGER_MAX_RETURN: usize = 40 * 1024;

/// Block-shim per-sector retry budget (§4.4, §7).
pub const DISK_RETRY_COUNT: u32 = 3;

/// Maximum sectors batched into a single multi-block write (§4.3.5).
pub const MULTIBLOCK_WRITE_CAP: usize = 12;

/// Bootloader image file name and constraints (§6, §4.8).
pub const IMAGE_FILE_NAME: &str = "lager.bin";
pub const IMAGE_BUFFER_SIZE: usize = 64 * 1024;
pub const IMAGE_MIN_LEN: usize = 500;
pub const IMAGE_WORD_ALIGN: usize = 4;

/// Config file name and size bound (§6, §4.7).
pub const CONFIG_FILE_NAME: &str = "lager.cfg";
pub const CONFIG_MAX_LEN: usize = 4096;

/// Log file naming (§4.6, §6): `logNNN.txt`, NNN in [0, 999].
pub const LOG_FILE_PREFIX: &str = "log";
pub const LOG_FILE_SUFFIX: &str = ".txt";
pub const LOG_FILE_MAX_INDEX: u32 = 999;

/// Diagnostic Morse strings (§7, §8).
pub const MORSE_CARD: &str = "CARD";
pub const MORSE_DATA: &str = "DATA";
pub const MORSE_TRUNC: &str = "TRUNC";
pub const MORSE_FERR: &str = "FERR";
pub const MORSE_XOSC: &str = "XOSC";
pub const MORSE_FULL: &str = "FULL";
pub const MORSE_WERR: &str = "WERR";
pub const MORSE_SERR: &str = "SERR";
pub const MORSE_BAD_SPI: &str = "?SPI?";
/// Diagnostic for a config file that fails to parse or has a recognised
/// key of the wrong type (§4.7) — not named explicitly in §7/§8's list of
/// fixed diagnostic strings; chosen to match their 3-5 character style
/// (see DESIGN.md).
pub const MORSE_CFG: &str = "CFG";
