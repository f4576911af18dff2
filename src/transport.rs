//! # Collaborator Transport Contracts
//!
//! The coordination core never talks to hardware or the network directly;
//! every external collaborator sits behind one of these traits. Long
//! operations use an explicit begin/poll shape so a single scheduler tick
//! never blocks: a task issues work with `begin_*`, then polls it on later
//! ticks until it resolves.
//!
//! Exclusive ownership: each transport instance is owned by exactly one
//! component (the HID transport by the emitter, the display transport by the
//! renderer, and so on). Nothing else touches them.

use crate::Tick;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of polling an in-flight connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkPoll {
    /// Attempt still in progress
    Pending,
    /// Association established
    Connected,
    /// Attempt failed; caller decides backoff
    Failed,
}

/// Result of polling an in-flight query against a one-shot source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourcePoll<T> {
    /// No query in flight
    Idle,
    /// Query issued, answer not yet available
    Pending,
    /// Query completed successfully
    Ready(T),
    /// Query failed (timeout, refused, transport error)
    Failed(String),
}

/// WiFi association lifecycle, owned by the connectivity manager.
pub trait WifiLink {
    /// Start (or restart) an association attempt. Any previous in-flight
    /// attempt is abandoned.
    fn begin_connect(&mut self);
    /// Poll the in-flight attempt.
    fn poll_connect(&mut self) -> LinkPoll;
    /// Whether the link currently believes it is associated.
    fn is_associated(&self) -> bool;
}

/// Authoritative wall-clock source (NTP or equivalent), owned by the time
/// sync task.
pub trait TimeSource {
    /// Issue a time query. Any previous in-flight query is abandoned.
    fn begin_query(&mut self);
    /// Poll the in-flight query for a UTC wall-clock answer.
    fn poll_query(&mut self) -> SourcePoll<DateTime<Utc>>;
}

/// Parameters for one weather fetch, assembled from configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeatherQuery {
    pub city: String,
    pub units: String,
    pub api_key: String,
}

/// Weather data source, owned by the weather poll task. Returns raw response
/// bytes; the core owns parsing them.
pub trait WeatherSource {
    /// Issue a fetch. Any previous in-flight fetch is abandoned.
    fn begin_fetch(&mut self, query: &WeatherQuery);
    /// Poll the in-flight fetch for the raw response body.
    fn poll_fetch(&mut self) -> SourcePoll<Vec<u8>>;
}

/// A fixed-format outbound HID report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HidReport {
    /// 8-byte boot keyboard report: modifier bitmask + up to six keycodes.
    Keyboard { modifiers: u8, keys: [u8; 6] },
    /// 16-bit consumer-control usage (0 releases the control).
    Consumer { usage: u16 },
}

/// Outcome of handing a report to the HID transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Report accepted by the transport
    Sent,
    /// Transport busy or full; retry next tick
    Busy,
    /// Transport error; report is lost
    Failed,
}

/// Outbound HID link, owned by the HID emitter.
pub trait HidTransport {
    fn send_report(&mut self, report: &HidReport) -> SendOutcome;
}

impl HidTransport for Box<dyn HidTransport> {
    fn send_report(&mut self, report: &HidReport) -> SendOutcome {
        (**self).send_report(report)
    }
}

/// Display transport failure.
#[derive(Error, Debug)]
#[error("display draw failed: {0}")]
pub struct DisplayError(pub String);

/// Panel transport, owned by the display renderer. Takes a fully composed
/// frame; the transport never sees partial updates.
pub trait DisplayTransport {
    fn draw(&mut self, frame: &crate::renderer::Frame) -> Result<(), DisplayError>;
}

/// One raw sample of every configured input line, taken once per tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawSample {
    /// Logical button levels, true = pressed, in binding order
    pub buttons: Vec<bool>,
    /// Encoder (clk, dt) phase pairs, in binding order
    pub encoders: Vec<(bool, bool)>,
}

/// Raw input lines, owned by the debounced input reader.
pub trait InputPort {
    /// Sample the current electrical/logical state of every line. Must be
    /// cheap; it runs on every tick. `now` is provided for scripted ports.
    fn sample(&mut self, now: Tick) -> RawSample;
}
