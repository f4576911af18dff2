//! # Scripted Collaborators
//!
//! Deterministic stand-ins for every transport trait. Each fake replays a
//! fixed script of outcomes (succeed after N polls, fail, hang) so scheduler
//! behavior under flaky networks and busy transports can be reproduced
//! exactly.
//!
//! Used by the test suite and by the binary's `--sim` demo mode. Nothing
//! here touches the real network, USB, or GPIO.

use crate::renderer::Frame;
use crate::transport::{
    DisplayError, DisplayTransport, HidReport, HidTransport, InputPort, LinkPoll, RawSample,
    SendOutcome, SourcePoll, TimeSource, WeatherQuery, WeatherSource, WifiLink,
};
use crate::Tick;
use chrono::{DateTime, Utc};
use log::info;
use std::collections::VecDeque;

/// Outcome of one scripted association attempt.
#[derive(Clone, Copy, Debug)]
pub enum LinkScript {
    /// Resolve to Connected after this many polls
    Succeed { after_polls: u32 },
    /// Resolve to Failed after this many polls
    Fail { after_polls: u32 },
    /// Never resolve (exercises the connect timeout)
    Hang,
}

/// WiFi link that replays a script of attempt outcomes. Attempts beyond the
/// script hang forever.
pub struct ScriptedLink {
    script: VecDeque<LinkScript>,
    inflight: Option<(LinkScript, u32)>,
    associated: bool,
    /// Total `begin_connect` calls observed
    pub connect_attempts: u32,
}

impl ScriptedLink {
    pub fn new(script: Vec<LinkScript>) -> Self {
        ScriptedLink {
            script: script.into(),
            inflight: None,
            associated: false,
            connect_attempts: 0,
        }
    }

    /// Simulate the access point vanishing.
    pub fn drop_link(&mut self) {
        self.associated = false;
    }
}

impl WifiLink for ScriptedLink {
    fn begin_connect(&mut self) {
        self.connect_attempts += 1;
        self.associated = false;
        let outcome = self.script.pop_front().unwrap_or(LinkScript::Hang);
        self.inflight = Some((outcome, 0));
    }

    fn poll_connect(&mut self) -> LinkPoll {
        let (outcome, polls) = match self.inflight.as_mut() {
            Some(state) => state,
            None => return LinkPoll::Failed,
        };
        *polls += 1;
        match *outcome {
            LinkScript::Succeed { after_polls } if *polls >= after_polls => {
                self.inflight = None;
                self.associated = true;
                LinkPoll::Connected
            }
            LinkScript::Fail { after_polls } if *polls >= after_polls => {
                self.inflight = None;
                LinkPoll::Failed
            }
            _ => LinkPoll::Pending,
        }
    }

    fn is_associated(&self) -> bool {
        self.associated
    }
}

/// Outcome of one scripted time query.
#[derive(Clone, Copy, Debug)]
pub enum TimeScript {
    /// Resolve with this wall time
    Reply(DateTime<Utc>),
    /// Resolve as failed
    Fail,
    /// Never resolve (exercises the query timeout)
    Hang,
}

/// Time source that replays a script of query outcomes, each resolving after
/// `delay_polls` polls. Queries beyond the script hang.
pub struct ScriptedTimeSource {
    script: VecDeque<TimeScript>,
    inflight: Option<(TimeScript, u32)>,
    /// Polls before an outcome resolves (default 1)
    pub delay_polls: u32,
    /// Total `begin_query` calls observed
    pub queries: u32,
}

impl ScriptedTimeSource {
    pub fn new(script: Vec<TimeScript>) -> Self {
        ScriptedTimeSource {
            script: script.into(),
            inflight: None,
            delay_polls: 1,
            queries: 0,
        }
    }
}

impl TimeSource for ScriptedTimeSource {
    fn begin_query(&mut self) {
        self.queries += 1;
        let outcome = self.script.pop_front().unwrap_or(TimeScript::Hang);
        self.inflight = Some((outcome, 0));
    }

    fn poll_query(&mut self) -> SourcePoll<DateTime<Utc>> {
        let (outcome, polls) = match self.inflight.as_mut() {
            Some(state) => state,
            None => return SourcePoll::Idle,
        };
        *polls += 1;
        if *polls < self.delay_polls {
            return SourcePoll::Pending;
        }
        match *outcome {
            TimeScript::Reply(wall) => {
                self.inflight = None;
                SourcePoll::Ready(wall)
            }
            TimeScript::Fail => {
                self.inflight = None;
                SourcePoll::Failed("scripted failure".to_string())
            }
            TimeScript::Hang => SourcePoll::Pending,
        }
    }
}

/// Outcome of one scripted weather fetch.
#[derive(Clone, Debug)]
pub enum WeatherScript {
    /// Resolve with this raw response body
    Reply(Vec<u8>),
    /// Resolve as failed
    Fail,
    /// Never resolve (exercises the fetch timeout)
    Hang,
}

/// Weather source that replays a script of fetch outcomes.
pub struct ScriptedWeatherSource {
    script: VecDeque<WeatherScript>,
    inflight: Option<(WeatherScript, u32)>,
    /// Polls before an outcome resolves (default 1)
    pub delay_polls: u32,
    /// Total `begin_fetch` calls observed
    pub fetches: u32,
    /// Query parameters of the most recent fetch
    pub last_query: Option<WeatherQuery>,
}

impl ScriptedWeatherSource {
    pub fn new(script: Vec<WeatherScript>) -> Self {
        ScriptedWeatherSource {
            script: script.into(),
            inflight: None,
            delay_polls: 1,
            fetches: 0,
            last_query: None,
        }
    }
}

impl WeatherSource for ScriptedWeatherSource {
    fn begin_fetch(&mut self, query: &WeatherQuery) {
        self.fetches += 1;
        self.last_query = Some(query.clone());
        let outcome = self.script.pop_front().unwrap_or(WeatherScript::Hang);
        self.inflight = Some((outcome, 0));
    }

    fn poll_fetch(&mut self) -> SourcePoll<Vec<u8>> {
        let (outcome, polls) = match self.inflight.as_mut() {
            Some(state) => state,
            None => return SourcePoll::Idle,
        };
        *polls += 1;
        if *polls < self.delay_polls {
            return SourcePoll::Pending;
        }
        match outcome.clone() {
            WeatherScript::Reply(body) => {
                self.inflight = None;
                SourcePoll::Ready(body)
            }
            WeatherScript::Fail => {
                self.inflight = None;
                SourcePoll::Failed("scripted failure".to_string())
            }
            WeatherScript::Hang => SourcePoll::Pending,
        }
    }
}

/// A canned OpenWeather current-weather body, the shape the poll task parses.
pub fn canned_weather_body(city: &str, temp: f32, condition: &str) -> Vec<u8> {
    format!(
        r#"{{"weather":[{{"id":803,"main":"{condition}","description":"{condition}"}}],"main":{{"temp":{temp},"humidity":64}},"name":"{city}"}}"#
    )
    .into_bytes()
}

/// HID transport that reports Busy for a set number of send attempts, then
/// accepts everything, recording accepted reports in order.
#[derive(Default)]
pub struct ScriptedHid {
    /// Remaining send attempts to refuse with Busy
    pub busy_for_sends: u32,
    /// When true, every send fails outright
    pub fail_all: bool,
    /// Reports accepted, in emission order
    pub sent: Vec<HidReport>,
}

impl ScriptedHid {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HidTransport for ScriptedHid {
    fn send_report(&mut self, report: &HidReport) -> SendOutcome {
        if self.fail_all {
            return SendOutcome::Failed;
        }
        if self.busy_for_sends > 0 {
            self.busy_for_sends -= 1;
            return SendOutcome::Busy;
        }
        self.sent.push(*report);
        SendOutcome::Sent
    }
}

/// HID transport for dev modes without a USB gadget: accepts and logs every
/// report.
#[derive(Default)]
pub struct LoggingHid;

impl HidTransport for LoggingHid {
    fn send_report(&mut self, report: &HidReport) -> SendOutcome {
        info!("hid report: {:?}", report);
        SendOutcome::Sent
    }
}

/// Display transport that counts draw calls and keeps the last frame.
#[derive(Default)]
pub struct CountingDisplay {
    pub draws: usize,
    pub last_frame: Option<Frame>,
    /// When true, every draw fails
    pub fail_all: bool,
}

impl CountingDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplayTransport for CountingDisplay {
    fn draw(&mut self, frame: &Frame) -> Result<(), DisplayError> {
        if self.fail_all {
            return Err(DisplayError("scripted draw failure".to_string()));
        }
        self.draws += 1;
        self.last_frame = Some(frame.clone());
        Ok(())
    }
}

/// Input port replaying a timeline of raw line states.
///
/// Levels are set point-wise (`set_button`, `set_encoder`) and held until
/// changed, matching how real lines behave between samples. With `looping`
/// set, the timeline repeats with that period (used by the demo mode).
pub struct ScriptedInput {
    timeline: Vec<(Tick, RawSample)>,
    idle: RawSample,
    /// Repeat the timeline with this period, if set
    pub looping: Option<Tick>,
}

impl ScriptedInput {
    pub fn new(n_buttons: usize, n_encoders: usize) -> Self {
        ScriptedInput {
            timeline: Vec::new(),
            idle: RawSample {
                buttons: vec![false; n_buttons],
                encoders: vec![(false, false); n_encoders],
            },
            looping: None,
        }
    }

    fn latest(&self) -> RawSample {
        self.timeline
            .last()
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.idle.clone())
    }

    /// Set a button level from `tick` onward.
    pub fn set_button(&mut self, tick: Tick, idx: usize, pressed: bool) {
        let mut sample = self.latest();
        sample.buttons[idx] = pressed;
        self.timeline.push((tick, sample));
    }

    /// Set an encoder's (clk, dt) phase from `tick` onward.
    pub fn set_encoder(&mut self, tick: Tick, idx: usize, phase: (bool, bool)) {
        let mut sample = self.latest();
        sample.encoders[idx] = phase;
        self.timeline.push((tick, sample));
    }
}

impl InputPort for ScriptedInput {
    fn sample(&mut self, now: Tick) -> RawSample {
        let now = match self.looping {
            Some(period) if period > 0 => now % period,
            _ => now,
        };
        self.timeline
            .iter()
            .rev()
            .find(|(tick, _)| *tick <= now)
            .map(|(_, sample)| sample.clone())
            .unwrap_or_else(|| self.idle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_link_replays_outcomes() {
        let mut link = ScriptedLink::new(vec![
            LinkScript::Fail { after_polls: 2 },
            LinkScript::Succeed { after_polls: 1 },
        ]);

        link.begin_connect();
        assert_eq!(link.poll_connect(), LinkPoll::Pending);
        assert_eq!(link.poll_connect(), LinkPoll::Failed);
        assert!(!link.is_associated());

        link.begin_connect();
        assert_eq!(link.poll_connect(), LinkPoll::Connected);
        assert!(link.is_associated());
        assert_eq!(link.connect_attempts, 2);
    }

    #[test]
    fn test_scripted_input_holds_levels_between_changes() {
        let mut port = ScriptedInput::new(2, 1);
        port.set_button(5, 0, true);
        port.set_button(10, 0, false);

        assert_eq!(port.sample(0).buttons, vec![false, false]);
        assert_eq!(port.sample(5).buttons, vec![true, false]);
        assert_eq!(port.sample(7).buttons, vec![true, false]);
        assert_eq!(port.sample(10).buttons, vec![false, false]);
    }

    #[test]
    fn test_canned_weather_body_parses() {
        let body = canned_weather_body("London", 18.5, "Clouds");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["name"], "London");
        assert_eq!(value["weather"][0]["main"], "Clouds");
    }
}
