#![no_std]
#![no_main]

use defmt_rtt as _;
use panic_probe as _;

use cortex_m_rt::{entry, exception};
use embedded_sdmmc::{Mode, VolumeIdx, VolumeManager};
use stm32f4xx_hal::{pac, prelude::*};

use lager_core::blockdev::{BlockShim, NullTimeSource};
use lager_core::constants::{IMAGE_BUFFER_SIZE, IMAGE_FILE_NAME, MORSE_CARD, MORSE_DATA, MORSE_FERR, MORSE_TRUNC};
use lager_hal::indicator::Indicator;
use lager_hal::stm::stm32f411::{FlashWriterEraser, SdioDriver};
use lager_hal::{startup, tick};
use lager_update::Outcome;

/// First address of the application's flash sector, per the reference
/// layout (§6, §4.8): sector 4 of the F411's 512 KiB bank.
const APP_BASE: usize = 0x0801_0000;
const SYSCLK_HZ: u32 = 16_000_000;

#[exception]
fn SysTick() {
    tick::on_tick();
}

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();
    let mut cp = cortex_m::Peripherals::take().unwrap();
    startup::enable_fpu(&mut cp.SCB);
    tick::start_systick(&mut cp.SYST, SYSCLK_HZ);

    // Bootloader clocks (§6): internal 16 MHz direct; the PLL is configured
    // by `SdioDriver::init` solely to drive the SD peripheral at 38.4 MHz.
    let rcc = dp.RCC.constrain();
    let _clocks = rcc.cfgr.sysclk(16.MHz()).freeze();

    let gpiob = dp.GPIOB.split();
    let led = gpiob.pb9.into_push_pull_output();
    let mut indicator = Indicator::new(led);

    let sdio_driver = SdioDriver::new(dp.SDIO);
    let flash = FlashWriterEraser::new(dp.FLASH);

    run(sdio_driver, &mut indicator, &flash);
}

fn run<P: embedded_hal::digital::v2::OutputPin>(
    mut sdio: SdioDriver,
    indicator: &mut Indicator<P>,
    flash: &FlashWriterEraser,
) -> ! {
    if sdio.init().is_err() {
        indicator.send_morse(MORSE_CARD);
        unsafe { lager_update::hand_off(APP_BASE) }
    }

    let shim = BlockShim::new(sdio);
    let mut volume_mgr = VolumeManager::new(shim, NullTimeSource);
    let mut volume = match volume_mgr.open_volume(VolumeIdx(0)) {
        Ok(v) => v,
        Err(_) => {
            indicator.send_morse(MORSE_DATA);
            unsafe { lager_update::hand_off(APP_BASE) }
        }
    };
    let root = match volume_mgr.open_root_dir(&volume) {
        Ok(d) => d,
        Err(_) => {
            indicator.send_morse(MORSE_DATA);
            unsafe { lager_update::hand_off(APP_BASE) }
        }
    };

    let mut buf = [0u8; IMAGE_BUFFER_SIZE];
    let file = match volume_mgr.open_file_in_dir(&mut volume, &root, IMAGE_FILE_NAME, Mode::ReadOnly) {
        Ok(f) => f,
        Err(_) => {
            // §4.8 step 5: no image present is not an error.
            let _ = volume_mgr.close_dir(&volume, root);
            unsafe { lager_update::hand_off(APP_BASE) }
        }
    };

    let mut total = 0usize;
    loop {
        match volume_mgr.read(&volume, &file, &mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => {
                indicator.send_morse(MORSE_TRUNC);
                let _ = volume_mgr.close_file(&volume, file);
                let _ = volume_mgr.close_dir(&volume, root);
                unsafe { lager_update::hand_off(APP_BASE) }
            }
        }
        if total >= buf.len() {
            break;
        }
    }
    let _ = volume_mgr.close_file(&volume, file);
    let _ = volume_mgr.close_dir(&volume, root);

    match lager_update::apply_update(&buf[..total], flash, APP_BASE) {
        Ok(Outcome::UpToDate) | Ok(Outcome::Applied) => {}
        Err(lager_core::Error::ImageTruncated) => {
            indicator.send_morse(MORSE_TRUNC);
        }
        Err(_) => indicator.panic(MORSE_FERR),
    }

    tick::delay_ticks(1);
    unsafe { lager_update::hand_off(APP_BASE) }
}
