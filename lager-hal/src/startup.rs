//! Reset/startup glue (C9). Vector table placement and the bss/data
//! relocation are `cortex-m-rt`'s job on this target (§4.9's implementation
//! note); the one piece left to board code is enabling the FPU with lazy
//! stacking before any floating-point instruction executes.

use cortex_m::peripheral::SCB;

/// Enables the FPU for lazy context save with default NaN / flush-to-zero
/// behaviour, per §4.9. Must run before any floating-point code, including
/// code the compiler may have inlined into `main`'s prologue.
pub fn enable_fpu(scb: &mut SCB) {
    unsafe {
        let cpacr = 0xE000_ED88 as *mut u32;
        let current = core::ptr::read_volatile(cpacr);
        core::ptr::write_volatile(cpacr, current | (0b11 << 20) | (0b11 << 22));
    }
    let _ = scb;
    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    // FPDSCR.{DN,FZ}: every lazily-stacked context starts in default-NaN,
    // flush-to-zero mode, so denormals and NaN-producing ops behave the
    // same regardless of which context last touched the FPU.
    unsafe {
        let fpdscr = 0xE000_EF3C as *mut u32;
        let current = core::ptr::read_volatile(fpdscr);
        core::ptr::write_volatile(fpdscr, current | (1 << 25) | (1 << 24));
    }
}
