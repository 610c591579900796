//! Monotonic tick counter (C1): a single `AtomicU32` written only by the
//! timer ISR, read everywhere else. Per §4.1/§9, ordering is Release on the
//! write side and Acquire on every read — one word, no lock, and the only
//! thing any consumer needs to build a bounded timeout.

use core::sync::atomic::{AtomicU32, Ordering};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;
use lager_core::constants::TICK_HZ;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Configures SysTick to fire at [`TICK_HZ`] off the core clock and enables
/// its interrupt (§6, C9). The board's `#[exception] fn SysTick()` handler
/// must call [`on_tick`] — this only arms the timer, it doesn't install the
/// handler itself.
pub fn start_systick(syst: &mut SYST, sysclk_hz: u32) {
    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(sysclk_hz / TICK_HZ - 1);
    syst.clear_current();
    syst.enable_interrupt();
    syst.enable_counter();
}

/// Advances the counter by one. Call this, and only this, from the timer
/// ISR — never from base level.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Release);
}

/// Reads the current tick value.
pub fn now() -> u32 {
    TICKS.load(Ordering::Acquire)
}

/// Busy-waits until `ticks` ticks have elapsed, wraparound-safe for any
/// delay well under `u32::MAX / 2` ticks (every delay this firmware uses is
/// on the order of seconds at 250 Hz).
pub fn delay_ticks(ticks: u32) {
    let start = now();
    while now().wrapping_sub(start) < ticks {
        cortex_m::asm::nop();
    }
}
