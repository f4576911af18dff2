//! # MediaDeck Core Library
//!
//! Coordination core for a small WiFi desk appliance: a controller with a
//! few media buttons, a rotary encoder, a 128x64 OLED panel, and a USB HID
//! link to the host. The device periodically syncs its clock over the
//! network, polls a weather service, renders status to the panel, and turns
//! button/encoder activity into HID reports.
//!
//! ## Design Philosophy
//!
//! ### Cooperative, single-threaded
//! Everything runs on one thread as a tick loop. Each component exposes a
//! short, non-blocking `step`; slow network operations are explicit
//! begin/poll state machines driven across many ticks, so a stalled fetch
//! never delays input sampling. Input reading and HID emission run on every
//! tick; everything else is periodic and dispatched one step per tick in
//! priority order.
//!
//! ### One writer per state record
//! Clock, weather, and connectivity state each have exactly one writing
//! task. Other components read cheap copies taken at step boundaries, so no
//! task ever observes another task's state mid-update.
//!
//! ### Collaborators behind traits
//! The WiFi link, time source, weather service, HID transport, display
//! transport, and raw input lines sit behind the traits in [`transport`].
//! The shipped implementations are host-side ([`net`], [`hid_gadget`], the
//! terminal display in [`renderer`]) plus fully scripted fakes ([`sim`])
//! that drive the test suite and the demo mode.
//!
//! ## Data Flow
//! 1. **Input**: raw lines → debounce/detent decode → [`InputEvent`]s
//! 2. **HID**: events → mapped reports → rate-limited, bounded outbound queue
//! 3. **Network**: connectivity gate → time sync / weather fetch state machines
//! 4. **Display**: state snapshots → `DisplayModel` → diff → draw

// Module declarations
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod hid;
#[cfg(unix)]
pub mod hid_gadget;
pub mod input;
pub mod net;
pub mod renderer;
pub mod scheduler;
pub mod sim;
pub mod time_sync;
pub mod transport;
pub mod weather;

/// Monotonic scheduler tick count.
///
/// Ticks start at zero on boot and only ever increase; the counter is never
/// adjusted by time sync, so debounce windows and timeouts keep their
/// ordering guarantees regardless of wall-clock corrections.
pub type Tick = u64;

/// Identifier of a configured input (button or encoder), an index into the
/// configuration's binding tables.
pub type InputId = u8;

/// A discrete, debounced input event.
///
/// Produced by the input reader, consumed once by the HID emitter, then
/// discarded. For any physical press-then-release exactly one
/// `ButtonPressed` and one `ButtonReleased` are emitted, in that order.
/// Encoder deltas are whole detents, never fractional.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputEvent {
    /// Button transitioned to pressed after the debounce window.
    ButtonPressed { id: InputId, at: Tick },
    /// Button transitioned to released after the debounce window.
    ButtonReleased { id: InputId, at: Tick },
    /// Encoder completed `delta` full detents (sign gives direction).
    EncoderStep { id: InputId, delta: i32, at: Tick },
}
