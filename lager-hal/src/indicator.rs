//! Morse-code status LED (C2). Owns a single GPIO output and the tick
//! source; everything about *what* to blink lives in
//! `lager_core::morse`, which is pure data this module just plays back by
//! busy-waiting on the tick counter between edges.

use crate::tick;
use embedded_hal::digital::v2::OutputPin;
use lager_core::morse;

/// One dot, in ticks. At 250 Hz (§6) a 60 ms dot is a brisk, legible rate.
const DOT_TICKS: u32 = 15;

/// Drives a single active-high LED (§6: "Indicator LED: PB9 (active-high)")
/// through the Morse alphabet.
pub struct Indicator<P> {
    pin: P,
    state: bool,
}

impl<P: OutputPin> Indicator<P> {
    pub fn new(pin: P) -> Self {
        Indicator { pin, state: false }
    }

    pub fn set(&mut self, on: bool) {
        if on {
            let _ = self.pin.set_high();
        } else {
            let _ = self.pin.set_low();
        }
        self.state = on;
    }

    /// Flips the indicator to the opposite of its last commanded state
    /// (§4.2's C2 `toggle` operation).
    pub fn toggle(&mut self) {
        let next = !self.state;
        self.set(next);
    }

    /// Plays `msg` once as Morse code (§4.2), blocking for the duration.
    pub fn send_morse(&mut self, msg: &str) {
        let mut events: heapless::Vec<morse::Event, 256> = heapless::Vec::new();
        morse::build_events(msg, DOT_TICKS, &mut events);
        for ev in events {
            self.set(ev.on);
            tick::delay_ticks(ev.ticks);
        }
        self.set(false);
    }

    /// Blinks `msg` forever, separated by two spaces (§4.2, §7). Never
    /// returns — this is the terminal state for every fatal error path.
    ///
    /// The trailing "  " is folded into one timeline with `msg` rather than
    /// sent as a second `send_morse` call: `build_events` only emits a gap
    /// once a real symbol has been encoded, so a call with an all-space
    /// message produces no events at all, and calling it back-to-back with
    /// `msg` would blink each repetition with no pause in between.
    #[cfg_attr(feature = "defmt", allow(unused_variables))]
    pub fn panic(&mut self, msg: &str) -> ! {
        #[cfg(feature = "defmt")]
        defmt::error!("panic: {=str}", msg);
        let mut framed: heapless::String<40> = heapless::String::new();
        let _ = framed.push_str(msg);
        let _ = framed.push_str("  ");
        loop {
            self.send_morse(framed.as_str());
        }
    }
}
