#![no_std]
#![allow(non_snake_case)]

//! Board-specific glue that wires `lager-core`'s hardware-independent logic
//! (the ring buffer, the block-device shim, the Morse encoder) to an actual
//! STM32F411. Every module here owns a peripheral; nothing above this crate
//! touches a register.

#[cfg(feature = "stm")]
pub mod stm;

pub mod indicator;
pub mod startup;
pub mod tick;

/// The hardware-specific flash programming boundary (§4.8's implementation
/// note): erase a sector, program words, lock/unlock the controller. One
/// impl per MCU family; `lager-update` is generic over it.
///
/// Unlike `rustBoot-hal`'s `FlashInterface` (which this trait is otherwise
/// grounded on), `hal_flash_erase`/`hal_flash_write` return a `Result`
/// rather than `()`: §4.8 steps 8-9 require a failed erase or program to be
/// distinguishable so the caller can panic-blink `FERR`, which needs the
/// driver to surface the controller's error status bits rather than assume
/// every operation succeeds.
pub trait FlashInterface {
    fn hal_init();
    fn hal_flash_unlock(&self);
    fn hal_flash_lock(&self);
    fn hal_flash_write(&self, addr: usize, data: *const u8, len: usize) -> lager_core::Result<()>;
    fn hal_flash_erase(&self, addr: usize, len: usize) -> lager_core::Result<()>;
}

/// Branches to an already-flashed application image (§4.8 step 11, §4.9).
/// `fw_base_address` points at the image's two-word header: initial stack
/// pointer, then reset vector, both little-endian.
///
/// # Safety
/// Must only be called once, with interrupts masked and every peripheral the
/// bootloader touched already reset, and `fw_base_address` must genuinely
/// point at a valid vector table — undefined behaviour otherwise.
pub unsafe fn boot_to_app(fw_base_address: usize) -> ! {
    let mut core_peripherals = cortex_m::Peripherals::steal();
    let scb = &mut core_peripherals.SCB;

    let stack_pointer = *(fw_base_address as *const u32);
    let reset_vector = *((fw_base_address + 4) as *const u32) as usize;
    let jump: extern "C" fn() -> ! = core::mem::transmute(reset_vector);

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
    scb.vtor.write(fw_base_address as u32);
    cortex_m::register::msp::write(stack_pointer);
    jump()
}
