//! # Debounced Input Reader
//!
//! Samples the raw button/encoder lines once per scheduler tick and turns
//! them into discrete [`InputEvent`]s.
//!
//! Buttons follow the original firmware's debounce machine: a level change
//! only becomes an event after the new level has been observed continuously
//! for the debounce window. Shorter excursions are treated as noise and
//! produce nothing, so any physical press-then-release yields exactly one
//! Pressed and one Released, in that order.
//!
//! Encoders are decoded as quadrature: each valid (clk, dt) transition
//! contributes a quarter step, and only a full detent (four quarters) emits
//! an `EncoderStep` with an integer delta. Partial rotations stay buffered
//! in the accumulator; invalid two-bit jumps are discarded as noise.

use crate::transport::{InputPort, RawSample};
use crate::{InputEvent, InputId, Tick};
use log::trace;

/// Debounce machine for one button.
#[derive(Clone, Debug)]
struct DebouncedButton {
    /// Last accepted (debounced) level, true = pressed
    stable: bool,
    /// Level currently being qualified
    candidate: bool,
    /// Tick at which the candidate level was first observed
    candidate_since: Tick,
}

impl DebouncedButton {
    fn new() -> Self {
        DebouncedButton {
            stable: false,
            candidate: false,
            candidate_since: 0,
        }
    }

    /// Feed one raw sample; returns the new level if a transition was
    /// accepted this tick.
    fn sample(&mut self, level: bool, now: Tick, window: Tick) -> Option<bool> {
        if level == self.stable {
            // Back at the accepted level: whatever was qualifying was noise.
            self.candidate = self.stable;
            return None;
        }
        if level != self.candidate {
            // New candidate level; start qualifying it.
            self.candidate = level;
            self.candidate_since = now;
        }
        if now.saturating_sub(self.candidate_since) + 1 >= window {
            self.stable = level;
            return Some(level);
        }
        None
    }
}

// Quadrature transition table indexed by (previous state << 2) | new state,
// each state being (clk << 1) | dt. Valid single-phase transitions are ±1
// quarter step; two-bit jumps are noise and contribute 0.
const QUAD_STEPS: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

/// Quarter steps per mechanical detent on a standard encoder.
const QUARTERS_PER_DETENT: i32 = 4;

/// Detent accumulator for one rotary encoder.
#[derive(Clone, Debug)]
struct QuadratureDecoder {
    prev_state: u8,
    /// Quarter steps accumulated toward the next detent
    accumulator: i32,
}

impl QuadratureDecoder {
    fn new() -> Self {
        QuadratureDecoder {
            prev_state: 0,
            accumulator: 0,
        }
    }

    /// Feed one raw phase sample; returns whole detents completed this tick.
    fn sample(&mut self, clk: bool, dt: bool) -> i32 {
        let state = ((clk as u8) << 1) | dt as u8;
        let index = ((self.prev_state << 2) | state) as usize;
        self.prev_state = state;
        self.accumulator += QUAD_STEPS[index] as i32;

        let detents = self.accumulator / QUARTERS_PER_DETENT;
        if detents != 0 {
            self.accumulator -= detents * QUARTERS_PER_DETENT;
        }
        detents
    }
}

/// Reads every configured line once per tick and emits debounced events.
pub struct InputReader {
    buttons: Vec<DebouncedButton>,
    encoders: Vec<QuadratureDecoder>,
    debounce_window: Tick,
}

impl InputReader {
    pub fn new(n_buttons: usize, n_encoders: usize, debounce_window: Tick) -> Self {
        InputReader {
            buttons: vec![DebouncedButton::new(); n_buttons],
            encoders: vec![QuadratureDecoder::new(); n_encoders],
            debounce_window: debounce_window.max(1),
        }
    }

    /// Sample all lines once and return the events accepted this tick.
    /// Runs on every scheduler tick; input latency is the system's tightest
    /// constraint.
    pub fn step<P: InputPort + ?Sized>(&mut self, now: Tick, port: &mut P) -> Vec<InputEvent> {
        let raw = port.sample(now);
        let mut events = Vec::new();
        self.feed(now, &raw, &mut events);
        events
    }

    /// Feed one raw sample directly (test entry point).
    pub fn feed(&mut self, now: Tick, raw: &RawSample, events: &mut Vec<InputEvent>) {
        for (idx, button) in self.buttons.iter_mut().enumerate() {
            let level = raw.buttons.get(idx).copied().unwrap_or(false);
            if let Some(pressed) = button.sample(level, now, self.debounce_window) {
                let id = idx as InputId;
                trace!("button {} {}", id, if pressed { "pressed" } else { "released" });
                events.push(if pressed {
                    InputEvent::ButtonPressed { id, at: now }
                } else {
                    InputEvent::ButtonReleased { id, at: now }
                });
            }
        }
        for (idx, decoder) in self.encoders.iter_mut().enumerate() {
            let (clk, dt) = raw.encoders.get(idx).copied().unwrap_or((false, false));
            let delta = decoder.sample(clk, dt);
            if delta != 0 {
                let id = idx as InputId;
                trace!("encoder {} step {}", id, delta);
                events.push(InputEvent::EncoderStep { id, delta, at: now });
            }
        }
    }
}
