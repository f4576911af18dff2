//! # Weather Poll Task
//!
//! Periodically fetches current conditions through the [`WeatherSource`]
//! transport and parses the raw bytes into the weather record. The fetch is
//! a begin/poll state machine like time sync; the record is the task's
//! exclusive property.
//!
//! Parsing is wholesale: a malformed or partial response is rejected in its
//! entirety, the previous good report is retained, and the status flips to
//! `Error(reason)`. Only a complete successful parse replaces the report.
//! Independently of fetch attempts, a report older than the staleness
//! threshold is downgraded to `Stale` for display purposes; the data is
//! still shown, marked as potentially outdated.

use crate::connectivity::LinkStatus;
use crate::scheduler::TaskError;
use crate::transport::{SourcePoll, WeatherQuery, WeatherSource};
use crate::Tick;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a weather response body.
#[derive(Error, Debug)]
pub enum WeatherError {
    /// Body was not valid JSON of the expected shape
    #[error("weather parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// JSON was valid but carried no condition entry
    #[error("weather response missing condition")]
    MissingCondition,
}

/// One parsed weather observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    /// Temperature in the configured units
    pub temp: f32,
    /// Short condition word, e.g. "Clouds"
    pub condition: String,
    /// Numeric condition code from the service
    pub condition_id: u16,
    /// Resolved city name echoed by the service
    pub city: String,
}

impl WeatherReport {
    /// One-line panel form, e.g. "18.5°C Clouds".
    pub fn display_line(&self, units: &str) -> String {
        let suffix = if units == "imperial" { "°F" } else { "°C" };
        format!("{:.1}{} {}", self.temp, suffix, self.condition)
    }
}

/// Freshness of the weather record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    /// Nothing fetched since boot
    Unknown,
    /// Report within its freshness window
    Fresh,
    /// Report retained but older than the staleness threshold
    Stale,
    /// Last fetch failed; prior report (if any) retained
    Error(String),
}

/// Weather state record. Single writer: the weather poll task.
#[derive(Clone, Debug, PartialEq)]
pub struct WeatherState {
    pub report: Option<WeatherReport>,
    pub fetched_at: Option<Tick>,
    pub status: FetchStatus,
}

impl WeatherState {
    pub fn new() -> Self {
        WeatherState {
            report: None,
            fetched_at: None,
            status: FetchStatus::Unknown,
        }
    }
}

impl Default for WeatherState {
    fn default() -> Self {
        Self::new()
    }
}

// Wire shape of the OpenWeather current-weather endpoint; only the fields
// the panel shows.
#[derive(Deserialize)]
struct ApiResponse {
    weather: Vec<ApiCondition>,
    main: ApiMain,
    name: String,
}

#[derive(Deserialize)]
struct ApiCondition {
    id: u16,
    main: String,
}

#[derive(Deserialize)]
struct ApiMain {
    temp: f32,
}

/// Parse a raw response body into a report. All-or-nothing: any failure
/// leaves the caller's record untouched.
pub fn parse_report(body: &[u8]) -> Result<WeatherReport, WeatherError> {
    let response: ApiResponse = serde_json::from_slice(body)?;
    let condition = response
        .weather
        .first()
        .ok_or(WeatherError::MissingCondition)?;
    Ok(WeatherReport {
        temp: response.main.temp,
        condition: condition.main.clone(),
        condition_id: condition.id,
        city: response.name,
    })
}

/// Intervals for the poll cadence, in ticks.
#[derive(Clone, Copy, Debug)]
pub struct PollPolicy {
    /// Normal interval between fetches
    pub interval: Tick,
    /// Base retry delay after a failure
    pub retry_base: Tick,
    /// Report age beyond which status degrades to Stale
    pub stale_after: Tick,
    /// Max wait for an in-flight fetch
    pub timeout: Tick,
}

impl PollPolicy {
    fn retry_delay(&self, failures: u32) -> Tick {
        let shift = failures.min(16);
        self.retry_base
            .saturating_mul(1u64 << shift)
            .min(self.interval)
    }
}

enum Phase {
    Idle,
    InFlight { started: Tick },
}

/// Drives a [`WeatherSource`] and owns all mutation of the weather record.
pub struct WeatherPollTask {
    policy: PollPolicy,
    query: WeatherQuery,
    phase: Phase,
    next_attempt_at: Tick,
    consecutive_failures: u32,
}

impl WeatherPollTask {
    pub fn new(policy: PollPolicy, query: WeatherQuery) -> Self {
        WeatherPollTask {
            policy,
            query,
            phase: Phase::Idle,
            next_attempt_at: 0,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// One non-blocking step.
    pub fn step<S: WeatherSource + ?Sized>(
        &mut self,
        now: Tick,
        link: LinkStatus,
        source: &mut S,
        state: &mut WeatherState,
    ) -> Result<(), TaskError> {
        // Age-based degradation happens regardless of fetch attempts or
        // intervening errors; the report stays, marked as potentially
        // outdated.
        if state.report.is_some() && state.status != FetchStatus::Stale {
            if let Some(fetched) = state.fetched_at {
                if now.saturating_sub(fetched) >= self.policy.stale_after {
                    debug!("weather: report aged out, marking stale");
                    state.status = FetchStatus::Stale;
                }
            }
        }

        if link != LinkStatus::Connected {
            if matches!(self.phase, Phase::InFlight { .. }) {
                debug!("weather: link down, abandoning in-flight fetch");
                self.phase = Phase::Idle;
            }
            return Ok(());
        }

        match self.phase {
            Phase::Idle => {
                if now >= self.next_attempt_at {
                    debug!("weather: fetching for {}", self.query.city);
                    source.begin_fetch(&self.query);
                    self.phase = Phase::InFlight { started: now };
                }
                Ok(())
            }
            Phase::InFlight { started } => match source.poll_fetch() {
                SourcePoll::Pending => {
                    if now.saturating_sub(started) >= self.policy.timeout {
                        self.fail(now, state, TaskError::Timeout(self.policy.timeout))
                    } else {
                        Ok(())
                    }
                }
                SourcePoll::Ready(body) => {
                    self.phase = Phase::Idle;
                    match parse_report(&body) {
                        Ok(report) => {
                            info!(
                                "weather: {} for {}",
                                report.display_line(&self.query.units),
                                report.city
                            );
                            // Atomic replacement: report, timestamp, and
                            // status move together.
                            state.report = Some(report);
                            state.fetched_at = Some(now);
                            state.status = FetchStatus::Fresh;
                            self.consecutive_failures = 0;
                            self.next_attempt_at = now + self.policy.interval;
                            Ok(())
                        }
                        Err(err) => self.fail(now, state, TaskError::Malformed(err.to_string())),
                    }
                }
                SourcePoll::Failed(reason) => self.fail(now, state, TaskError::Transport(reason)),
                SourcePoll::Idle => {
                    self.fail(now, state, TaskError::Transport("source idle".to_string()))
                }
            },
        }
    }

    fn fail(
        &mut self,
        now: Tick,
        state: &mut WeatherState,
        err: TaskError,
    ) -> Result<(), TaskError> {
        let delay = self.policy.retry_delay(self.consecutive_failures);
        self.consecutive_failures += 1;
        self.next_attempt_at = now + delay;
        self.phase = Phase::Idle;
        // The status flips to Error but the last good report is retained.
        state.status = FetchStatus::Error(err.to_string());
        warn!("weather fetch failed ({}), retry in {} ticks", err, delay);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{canned_weather_body, ScriptedWeatherSource, WeatherScript};

    fn policy() -> PollPolicy {
        PollPolicy {
            interval: 1000,
            retry_base: 20,
            stale_after: 3000,
            timeout: 10,
        }
    }

    fn query() -> WeatherQuery {
        WeatherQuery {
            city: "London".to_string(),
            units: "metric".to_string(),
            api_key: "abc123".to_string(),
        }
    }

    fn run(
        task: &mut WeatherPollTask,
        source: &mut ScriptedWeatherSource,
        state: &mut WeatherState,
        ticks: std::ops::Range<Tick>,
    ) {
        for now in ticks {
            let _ = task.step(now, LinkStatus::Connected, source, state);
        }
    }

    #[test]
    fn test_parse_report_happy_path() {
        let body = canned_weather_body("London", 18.5, "Clouds");
        let report = parse_report(&body).unwrap();
        assert_eq!(report.city, "London");
        assert_eq!(report.condition, "Clouds");
        assert_eq!(report.condition_id, 803);
        assert!((report.temp - 18.5).abs() < f32::EPSILON);
        assert_eq!(report.display_line("metric"), "18.5°C Clouds");
        assert_eq!(report.display_line("imperial"), "18.5°F Clouds");
    }

    #[test]
    fn test_parse_rejects_malformed_wholesale() {
        assert!(parse_report(b"not json").is_err());
        assert!(parse_report(b"{}").is_err());
        // Valid JSON, but the condition array is empty
        let empty = br#"{"weather":[],"main":{"temp":1.0},"name":"X"}"#;
        assert!(matches!(
            parse_report(empty),
            Err(WeatherError::MissingCondition)
        ));
    }

    #[test]
    fn test_successful_fetch_replaces_report() {
        let mut task = WeatherPollTask::new(policy(), query());
        let mut source = ScriptedWeatherSource::new(vec![WeatherScript::Reply(
            canned_weather_body("London", 18.5, "Clouds"),
        )]);
        let mut state = WeatherState::new();

        run(&mut task, &mut source, &mut state, 0..3);
        assert_eq!(state.status, FetchStatus::Fresh);
        assert_eq!(state.report.as_ref().unwrap().condition, "Clouds");
        assert_eq!(state.fetched_at, Some(1));
        assert_eq!(source.last_query.as_ref().unwrap().city, "London");
    }

    #[test]
    fn test_malformed_response_retains_prior_report() {
        let mut task = WeatherPollTask::new(policy(), query());
        let mut source = ScriptedWeatherSource::new(vec![
            WeatherScript::Reply(canned_weather_body("London", 18.5, "Clouds")),
            WeatherScript::Reply(b"<html>502 Bad Gateway</html>".to_vec()),
        ]);
        let mut state = WeatherState::new();

        run(&mut task, &mut source, &mut state, 0..3);
        let good = state.report.clone();

        // Next poll window delivers garbage
        run(&mut task, &mut source, &mut state, 1001..1004);
        assert!(matches!(state.status, FetchStatus::Error(_)));
        assert_eq!(state.report, good, "prior good payload must be retained");
        assert_eq!(state.fetched_at, Some(1), "fetched_at tracks the last success");
    }

    #[test]
    fn test_report_ages_to_stale_without_successful_fetch() {
        let mut task = WeatherPollTask::new(policy(), query());
        let mut source = ScriptedWeatherSource::new(vec![WeatherScript::Reply(
            canned_weather_body("London", 18.5, "Clouds"),
        )]);
        let mut state = WeatherState::new();

        run(&mut task, &mut source, &mut state, 0..3);
        assert_eq!(state.status, FetchStatus::Fresh);

        // All later fetches hang; once the report's age crosses the
        // threshold the status degrades but the payload stays visible.
        run(&mut task, &mut source, &mut state, 3..4000);
        assert_eq!(state.status, FetchStatus::Stale);
        assert!(state.report.is_some());
    }

    #[test]
    fn test_link_down_skips_fetch() {
        let mut task = WeatherPollTask::new(policy(), query());
        let mut source = ScriptedWeatherSource::new(vec![]);
        let mut state = WeatherState::new();

        for now in 0..10 {
            let _ = task.step(now, LinkStatus::Disconnected, &mut source, &mut state);
        }
        assert_eq!(source.fetches, 0);
        assert_eq!(state, WeatherState::new());
    }
}
