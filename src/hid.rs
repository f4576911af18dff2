//! # HID Emitter
//!
//! Translates debounced [`InputEvent`]s into outbound HID reports through a
//! fixed mapping table resolved from configuration at startup.
//!
//! ## Mapping
//! Two kinds of action exist: **consumer-control usages** (play/pause,
//! volume, track skip; sent as a 16-bit usage, released with usage 0) and
//! **keyboard chords** (the mic-mute hotkey; an 8-byte boot report carrying
//! a modifier bitmask and up to six keycodes, released with an all-zero
//! report). Button press
//! and release each produce one report; an encoder detent produces a
//! press/release pulse per step.
//!
//! ## Delivery
//! Reports wait in a bounded queue. A Busy transport means "retry next
//! tick", never "drop"; only when the queue would exceed its depth are the
//! **oldest** pending reports discarded, preserving most-recent-intent.
//! Consecutive reports to the same logical control are spaced by a minimum
//! gap so a bouncing encoder can't flood the host.

use crate::config::{ActionSpec, ConfigError, InputConfig};
use crate::scheduler::TaskError;
use crate::transport::{HidReport, HidTransport, SendOutcome};
use crate::{InputEvent, InputId, Tick};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};

// Consumer-control usage IDs (USB HID Usage Tables, page 0x0C).
const USAGE_PLAY_PAUSE: u16 = 0x00CD;
const USAGE_SCAN_NEXT: u16 = 0x00B5;
const USAGE_SCAN_PREV: u16 = 0x00B6;
const USAGE_STOP: u16 = 0x00B7;
const USAGE_FAST_FORWARD: u16 = 0x00B3;
const USAGE_REWIND: u16 = 0x00B4;
const USAGE_MUTE: u16 = 0x00E2;
const USAGE_VOLUME_UP: u16 = 0x00E9;
const USAGE_VOLUME_DOWN: u16 = 0x00EA;

/// Named consumer-control usages recognized in bindings.
fn consumer_usage(name: &str) -> Option<u16> {
    Some(match name {
        "play_pause" => USAGE_PLAY_PAUSE,
        "scan_next" => USAGE_SCAN_NEXT,
        "scan_prev" => USAGE_SCAN_PREV,
        "stop" => USAGE_STOP,
        "fast_forward" => USAGE_FAST_FORWARD,
        "rewind" => USAGE_REWIND,
        "mute" => USAGE_MUTE,
        "volume_up" => USAGE_VOLUME_UP,
        "volume_down" => USAGE_VOLUME_DOWN,
        _ => return None,
    })
}

/// Modifier bits of the boot keyboard report.
fn modifier_bit(name: &str) -> Option<u8> {
    Some(match name {
        "LEFT_CONTROL" => 0x01,
        "LEFT_SHIFT" => 0x02,
        "LEFT_ALT" => 0x04,
        "LEFT_GUI" | "WINDOWS" => 0x08,
        "RIGHT_CONTROL" => 0x10,
        "RIGHT_SHIFT" => 0x20,
        "RIGHT_ALT" => 0x40,
        "RIGHT_GUI" => 0x80,
        _ => return None,
    })
}

/// Keycodes (USB HID Usage Tables, page 0x07) for the names bindings may
/// use. Letters, digits, and a few whole-key extras cover every shortcut
/// the original firmware shipped.
fn key_usage(name: &str) -> Option<u8> {
    let bytes = name.as_bytes();
    if bytes.len() == 1 {
        match bytes[0] {
            b'A'..=b'Z' => return Some(0x04 + (bytes[0] - b'A')),
            b'1'..=b'9' => return Some(0x1E + (bytes[0] - b'1')),
            b'0' => return Some(0x27),
            _ => {}
        }
    }
    Some(match name {
        "ENTER" => 0x28,
        "ESCAPE" => 0x29,
        "TAB" => 0x2B,
        "SPACE" => 0x2C,
        _ => return None,
    })
}

/// A fully resolved HID action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HidAction {
    /// Consumer-control usage, pulsed with usage 0 to release
    Consumer(u16),
    /// Keyboard chord, released with an all-zero report
    Chord { modifiers: u8, keys: [u8; 6] },
}

impl HidAction {
    fn press_report(&self) -> HidReport {
        match *self {
            HidAction::Consumer(usage) => HidReport::Consumer { usage },
            HidAction::Chord { modifiers, keys } => HidReport::Keyboard { modifiers, keys },
        }
    }

    fn release_report(&self) -> HidReport {
        match *self {
            HidAction::Consumer(_) => HidReport::Consumer { usage: 0 },
            HidAction::Chord { .. } => HidReport::Keyboard {
                modifiers: 0,
                keys: [0; 6],
            },
        }
    }
}

fn resolve(spec: &ActionSpec) -> Result<HidAction, ConfigError> {
    match spec {
        ActionSpec::Control { control } => consumer_usage(control)
            .map(HidAction::Consumer)
            .ok_or_else(|| ConfigError::UnknownControlName(control.clone())),
        ActionSpec::Chord { keys } => {
            let mut modifiers = 0u8;
            let mut codes = [0u8; 6];
            let mut n = 0usize;
            for name in keys {
                if let Some(bit) = modifier_bit(name) {
                    modifiers |= bit;
                } else if let Some(code) = key_usage(name) {
                    if n == codes.len() {
                        return Err(ConfigError::ChordTooLong);
                    }
                    codes[n] = code;
                    n += 1;
                } else {
                    return Err(ConfigError::UnknownKeyName(name.clone()));
                }
            }
            Ok(HidAction::Chord {
                modifiers,
                keys: codes,
            })
        }
    }
}

/// The fixed input-id → HID action table, resolved once at startup.
#[derive(Clone, Debug)]
pub struct MappingTable {
    buttons: Vec<HidAction>,
    encoders: Vec<(HidAction, HidAction)>,
}

impl MappingTable {
    /// Resolve every binding name; any typo is a startup-fatal
    /// [`ConfigError`].
    pub fn from_config(input: &InputConfig) -> Result<Self, ConfigError> {
        let buttons = input
            .buttons
            .iter()
            .map(|b| resolve(&b.action))
            .collect::<Result<Vec<_>, _>>()?;
        let encoders = input
            .encoders
            .iter()
            .map(|e| -> Result<_, ConfigError> {
                Ok((resolve(&e.clockwise)?, resolve(&e.counter_clockwise)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MappingTable { buttons, encoders })
    }

    fn button(&self, id: InputId) -> Option<&HidAction> {
        self.buttons.get(id as usize)
    }

    fn encoder(&self, id: InputId) -> Option<&(HidAction, HidAction)> {
        self.encoders.get(id as usize)
    }
}

/// Identity of a logical control for rate limiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ControlId {
    Button(InputId),
    Encoder(InputId),
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    report: HidReport,
    control: ControlId,
}

/// Consumes input events, queues mapped reports, and drives the transport.
pub struct HidEmitter {
    mapping: MappingTable,
    queue: VecDeque<Pending>,
    last_sent: HashMap<ControlId, Tick>,
    min_spacing: Tick,
    depth: usize,
    /// Reports dropped by the oldest-drop overflow policy
    pub dropped_total: u64,
}

impl HidEmitter {
    pub fn new(mapping: MappingTable, min_spacing: Tick, depth: usize) -> Self {
        HidEmitter {
            mapping,
            queue: VecDeque::new(),
            last_sent: HashMap::new(),
            min_spacing,
            depth: depth.max(1),
            dropped_total: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Map one event into pending reports. Events from unmapped ids are
    /// ignored (the reader only produces configured ids).
    pub fn enqueue_event(&mut self, event: &InputEvent) {
        match *event {
            InputEvent::ButtonPressed { id, .. } => {
                if let Some(action) = self.mapping.button(id) {
                    let report = action.press_report();
                    self.push(Pending {
                        report,
                        control: ControlId::Button(id),
                    });
                }
            }
            InputEvent::ButtonReleased { id, .. } => {
                if let Some(action) = self.mapping.button(id) {
                    let report = action.release_report();
                    self.push(Pending {
                        report,
                        control: ControlId::Button(id),
                    });
                }
            }
            InputEvent::EncoderStep { id, delta, .. } => {
                if let Some(&(cw, ccw)) = self.mapping.encoder(id) {
                    let action = if delta >= 0 { cw } else { ccw };
                    for _ in 0..delta.unsigned_abs() {
                        self.push(Pending {
                            report: action.press_report(),
                            control: ControlId::Encoder(id),
                        });
                        self.push(Pending {
                            report: action.release_report(),
                            control: ControlId::Encoder(id),
                        });
                    }
                }
            }
        }
    }

    fn push(&mut self, pending: Pending) {
        self.queue.push_back(pending);
        // Oldest-drop: bound memory while keeping the most recent intent.
        while self.queue.len() > self.depth {
            self.queue.pop_front();
            self.dropped_total += 1;
            warn!("hid queue overflow, dropped oldest pending report");
        }
    }

    /// Drain as much of the queue as the transport and rate limits allow.
    /// Runs on every scheduler tick, directly after the input reader.
    pub fn step<H: HidTransport + ?Sized>(
        &mut self,
        now: Tick,
        transport: &mut H,
    ) -> Result<(), TaskError> {
        while let Some(head) = self.queue.front() {
            if let Some(&last) = self.last_sent.get(&head.control) {
                if now.saturating_sub(last) < self.min_spacing {
                    // Head-of-line wait keeps relative order intact.
                    break;
                }
            }
            match transport.send_report(&head.report) {
                SendOutcome::Sent => {
                    let control = head.control;
                    debug!("hid sent {:?}", head.report);
                    self.last_sent.insert(control, now);
                    self.queue.pop_front();
                }
                SendOutcome::Busy => break,
                SendOutcome::Failed => {
                    self.queue.pop_front();
                    return Err(TaskError::Transport("hid send failed".to_string()));
                }
            }
        }
        Ok(())
    }
}
