#![no_std]
#![no_main]

use core::cell::RefCell;
use core::fmt::Write as _;

use cortex_m::interrupt::Mutex;
use cortex_m_rt::{entry, exception};
use defmt_rtt as _;
use embedded_sdmmc::{Mode, VolumeIdx, VolumeManager};
use panic_probe as _;
use stm32f4xx_hal::{pac, pac::interrupt, prelude::*, serial::Config as SerialConfig, serial::Serial};

use lager_core::blockdev::{BlockShim, NullTimeSource};
use lager_core::config;
use lager_core::constants::{
    CONFIG_FILE_NAME, LOGGER_CHUNK_TIMEOUT_TICKS, LOGGER_MAX_RETURN, LOGGER_MIN_PREFERRED_CHUNK,
    LOGGER_PREFERRED_ALIGN, LOG_FILE_MAX_INDEX, LOG_FILE_PREFIX, LOG_FILE_SUFFIX, MORSE_BAD_SPI,
    MORSE_CARD, MORSE_CFG, MORSE_DATA, MORSE_FULL, MORSE_SERR, MORSE_WERR, MORSE_XOSC,
    RING_BUFFER_SIZE,
};
use lager_core::ring::{Producer, RingStorage};
use lager_core::Error;
use lager_hal::indicator::Indicator;
use lager_hal::stm::stm32f411::SdioDriver;
use lager_hal::{startup, tick};

/// Bound on the busy-wait for HSE startup before falling back to HSI (§6).
const HSE_READY_TIMEOUT_ITERS: u32 = 100_000;

/// Target sysclk (§6) — held regardless of whether the clock tree ends up
/// fed from HSE or the HSI fallback, since both paths target this frequency.
const SYSCLK_HZ: u32 = 96_000_000;

#[exception]
fn SysTick() {
    tick::on_tick();
}

static RING: RingStorage<RING_BUFFER_SIZE> = RingStorage::new();
static PRODUCER: Mutex<RefCell<Option<Producer<'static, RING_BUFFER_SIZE>>>> =
    Mutex::new(RefCell::new(None));

#[interrupt]
fn USART1() {
    cortex_m::interrupt::free(|cs| {
        let dr = unsafe { &(*pac::USART1::ptr()).dr };
        let byte = dr.read().bits() as u8;
        if let Some(producer) = PRODUCER.borrow(cs).borrow_mut().as_mut() {
            producer.push_isr(byte);
        }
    });
}

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();
    let mut cp = cortex_m::Peripherals::take().unwrap();
    startup::enable_fpu(&mut cp.SCB);
    tick::start_systick(&mut cp.SYST, SYSCLK_HZ);

    let gpiob = dp.GPIOB.split();
    let led = gpiob.pb9.into_push_pull_output();
    let mut indicator = Indicator::new(led);

    // Application clocks (§6): HSE feeds the PLL to 96 MHz; fall back to
    // the internal 16 MHz oscillator (with a non-fatal XOSC blink) if the
    // crystal doesn't start within budget.
    let hse_ready = {
        dp.RCC.cr.modify(|_, w| w.hseon().set_bit());
        let mut iters = 0;
        while !dp.RCC.cr.read().hserdy().bit_is_set() {
            iters += 1;
            if iters >= HSE_READY_TIMEOUT_ITERS {
                break;
            }
        }
        dp.RCC.cr.read().hserdy().bit_is_set()
    };
    let rcc = dp.RCC.constrain();
    let clocks = if hse_ready {
        rcc.cfgr
            .use_hse(25.MHz())
            .sysclk(96.MHz())
            .hclk(96.MHz())
            .pclk1(48.MHz())
            .pclk2(96.MHz())
            .freeze()
    } else {
        indicator.send_morse(MORSE_XOSC);
        rcc.cfgr.sysclk(96.MHz()).hclk(96.MHz()).pclk1(48.MHz()).pclk2(96.MHz()).freeze()
    };

    let (mut producer, mut consumer) = RING.split();

    let gpioa = dp.GPIOA.split();
    let tx = gpioa.pa15.into_alternate();
    let rx = gpiob.pb3.into_alternate();

    let mut sdio = SdioDriver::new(dp.SDIO);
    if sdio.init().is_err() {
        indicator.panic(MORSE_CARD);
    }
    let shim = BlockShim::new(sdio);
    let mut volume_mgr = VolumeManager::new(shim, NullTimeSource);
    let mut volume = match volume_mgr.open_volume(VolumeIdx(0)) {
        Ok(v) => v,
        Err(_) => indicator.panic(MORSE_DATA),
    };
    let root = match volume_mgr.open_root_dir(&volume) {
        Ok(d) => d,
        Err(_) => indicator.panic(MORSE_DATA),
    };

    let cfg = load_config(&mut volume_mgr, &mut volume, &root, &mut indicator);

    if !cfg.startup_morse.is_empty() {
        indicator.send_morse(cfg.startup_morse.as_str());
    }
    if cfg.use_spi {
        indicator.panic(MORSE_BAD_SPI);
    }

    let serial_cfg = SerialConfig::default().baudrate(cfg.baud_rate.bps());
    let mut serial = Serial::new(dp.USART1, (tx, rx), serial_cfg, &clocks).unwrap();
    serial.listen(stm32f4xx_hal::serial::Event::Rxne);

    cortex_m::interrupt::free(|cs| {
        PRODUCER.borrow(cs).replace(Some(producer));
    });
    unsafe {
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::USART1);
    }

    let mut name_buf = [0u8; 16];
    let log_name = pick_log_name(&mut volume_mgr, &volume, &root, &mut name_buf)
        .unwrap_or_else(|| indicator.panic(MORSE_FULL));
    let file = volume_mgr
        .open_file_in_dir(&mut volume, &root, log_name, Mode::ReadWriteCreateOrAppend)
        .unwrap_or_else(|_| indicator.panic(MORSE_DATA));

    if cfg.prealloc_bytes > 0 {
        preallocate(&mut volume_mgr, &mut volume, &file, cfg.prealloc_bytes, &mut indicator);
    }

    // §4.7 `preallocGrow`: when `false`, the file must never grow past its
    // preallocation — cap writes at `prealloc_bytes` and drop anything
    // beyond that instead of letting the filesystem extend the file.
    let write_cap = if cfg.prealloc_grow { None } else { Some(cfg.prealloc_bytes) };
    let mut written_total = 0u32;

    loop {
        let chunk = consumer.poll(
            tick::now,
            LOGGER_CHUNK_TIMEOUT_TICKS,
            LOGGER_PREFERRED_ALIGN,
            LOGGER_MIN_PREFERRED_CHUNK,
            LOGGER_MAX_RETURN,
        );
        indicator.set(true);
        if chunk.data.is_empty() {
            if volume_mgr.flush_file(&volume, &file).is_err() {
                indicator.panic(MORSE_SERR);
            }
        } else {
            let remaining = write_cap.map(|cap| cap.saturating_sub(written_total) as usize);
            let to_write = match remaining {
                Some(r) => &chunk.data[..chunk.data.len().min(r)],
                None => chunk.data,
            };
            if !to_write.is_empty() {
                match volume_mgr.write(&mut volume, &file, to_write) {
                    Ok(written) if written == to_write.len() => written_total += written as u32,
                    _ => indicator.panic(MORSE_WERR),
                }
            }
        }
        indicator.set(false);
    }
}

fn load_config<D: embedded_sdmmc::BlockDevice, P: embedded_hal::digital::v2::OutputPin>(
    volume_mgr: &mut VolumeManager<D, NullTimeSource>,
    volume: &mut embedded_sdmmc::Volume,
    root: &embedded_sdmmc::Directory,
    indicator: &mut Indicator<P>,
) -> config::RuntimeConfig {
    let file = match volume_mgr.open_file_in_dir(volume, root, CONFIG_FILE_NAME, Mode::ReadOnly) {
        Ok(f) => f,
        Err(_) => {
            let created = volume_mgr
                .open_file_in_dir(volume, root, CONFIG_FILE_NAME, Mode::ReadWriteCreateOrTruncate)
                .unwrap_or_else(|_| indicator.panic(MORSE_DATA));
            if volume_mgr.write(volume, &created, config::DEFAULT_CONFIG).is_err() {
                indicator.panic(MORSE_WERR);
            }
            let _ = volume_mgr.flush_file(volume, &created);
            let _ = volume_mgr.close_file(volume, created);
            volume_mgr
                .open_file_in_dir(volume, root, CONFIG_FILE_NAME, Mode::ReadOnly)
                .unwrap_or_else(|_| indicator.panic(MORSE_DATA))
        }
    };

    let mut buf = [0u8; lager_core::constants::CONFIG_MAX_LEN];
    let mut total = 0usize;
    loop {
        match volume_mgr.read(volume, &file, &mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => indicator.panic(MORSE_DATA),
        }
        if total >= buf.len() {
            break;
        }
    }
    let _ = volume_mgr.close_file(volume, file);

    match config::parse(&buf[..total]) {
        Ok(cfg) => cfg,
        Err(Error::ConfigUnsupported) => indicator.panic(MORSE_BAD_SPI),
        Err(_) => indicator.panic(MORSE_CFG),
    }
}

/// Finds the lowest-numbered `logNNN.txt` that doesn't exist yet, writing
/// its name into `name_buf` (§4.6, §6). `None` once every index in
/// `[0, LOG_FILE_MAX_INDEX]` is taken.
fn pick_log_name<'a, D: embedded_sdmmc::BlockDevice>(
    volume_mgr: &mut VolumeManager<D, NullTimeSource>,
    volume: &embedded_sdmmc::Volume,
    root: &embedded_sdmmc::Directory,
    name_buf: &'a mut [u8; 16],
) -> Option<&'a str> {
    for n in 0..=LOG_FILE_MAX_INDEX {
        let mut name: heapless::String<16> = heapless::String::new();
        let _ = write!(name, "{}{:03}{}", LOG_FILE_PREFIX, n, LOG_FILE_SUFFIX);
        match volume_mgr.open_file_in_dir(volume, root, name.as_str(), Mode::ReadOnly) {
            Ok(existing) => {
                let _ = volume_mgr.close_file(volume, existing);
            }
            Err(_) => {
                let bytes = name.as_bytes();
                name_buf[..bytes.len()].copy_from_slice(bytes);
                return Some(core::str::from_utf8(&name_buf[..bytes.len()]).unwrap());
            }
        }
    }
    None
}

/// Pre-expands the log file to `bytes` so the filesystem allocates one
/// contiguous run instead of fragmenting as the logger appends (§4.6).
fn preallocate<D: embedded_sdmmc::BlockDevice, P: embedded_hal::digital::v2::OutputPin>(
    volume_mgr: &mut VolumeManager<D, NullTimeSource>,
    volume: &mut embedded_sdmmc::Volume,
    file: &embedded_sdmmc::File,
    bytes: u32,
    indicator: &mut Indicator<P>,
) {
    const CHUNK: usize = 512;
    let zeros = [0u8; CHUNK];
    let mut remaining = bytes as usize;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        if volume_mgr.write(volume, file, &zeros[..n]).is_err() {
            indicator.panic(MORSE_WERR);
        }
        remaining -= n;
    }
    let _ = volume_mgr.file_seek_from_start(file, 0);
}
