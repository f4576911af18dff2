//! # Cooperative Scheduler
//!
//! Single-threaded tick loop. Each tick the input reader runs, then the
//! HID emitter, then at most one periodic task, whichever due task has
//! the highest priority. Periodic work is written as short non-blocking
//! steps (issue a request one tick, poll it on later ticks), so no task
//! can stall the loop waiting on the network.
//!
//! Task failures are absorbed at the scheduler boundary: a step that
//! returns an error is logged against its task and the loop moves on.
//! The failing task reschedules itself; nothing else is affected.

use crate::clock::ClockState;
use crate::config::{Config, ConfigError};
use crate::connectivity::{BackoffPolicy, ConnectivityManager, ConnectivityState, LinkStatus};
use crate::hid::{HidEmitter, MappingTable};
use crate::input::InputReader;
use crate::renderer::DisplayRenderer;
use crate::time_sync::{SyncPolicy, TimeSyncTask};
use crate::transport::{
    DisplayTransport, HidTransport, InputPort, TimeSource, WeatherQuery, WeatherSource, WifiLink,
};
use crate::weather::{PollPolicy, WeatherPollTask, WeatherState};
use crate::Tick;
use log::{debug, warn};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failure of a single task step. Absorbed and logged by the loop.
#[derive(Error, Debug)]
pub enum TaskError {
    /// An in-flight operation exceeded its deadline
    #[error("operation timed out after {0} ticks")]
    Timeout(Tick),
    /// The underlying transport reported a hard failure
    #[error("transport error: {0}")]
    Transport(String),
    /// A response arrived but could not be interpreted
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Identity of a periodic task, for scheduling and log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskId {
    Display,
    Connectivity,
    TimeSync,
    Weather,
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskId::Display => "display",
            TaskId::Connectivity => "connectivity",
            TaskId::TimeSync => "time-sync",
            TaskId::Weather => "weather",
        };
        f.write_str(name)
    }
}

struct Entry {
    id: TaskId,
    period: Tick,
    priority: u8,
    next_due: Tick,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Fixed task table plus the monotonic tick counter.
///
/// The counter only ever increments. Wall-clock adjustments from time
/// sync never touch it, so every interval in the system stays stable
/// across clock steps.
pub struct Scheduler {
    now: Tick,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            now: 0,
            entries: Vec::new(),
        }
    }

    /// Add a periodic task. Lower `priority` wins when several tasks are
    /// due on the same tick. Every task is due immediately at startup.
    pub fn register(&mut self, id: TaskId, period: Tick, priority: u8) {
        self.entries.push(Entry {
            id,
            period: period.max(1),
            priority,
            next_due: 0,
            consecutive_failures: 0,
            last_error: None,
        });
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    /// Advance the tick counter and return the new value.
    pub fn advance(&mut self) -> Tick {
        self.now += 1;
        self.now
    }

    /// Pick the highest-priority due task, if any, and reschedule it one
    /// period out. At most one task is dispatched per tick; anything
    /// else that was due simply stays due and wins a later tick.
    pub fn due_task(&mut self) -> Option<TaskId> {
        let now = self.now;
        let entry = self
            .entries
            .iter_mut()
            .filter(|e| e.next_due <= now)
            .min_by_key(|e| e.priority)?;
        entry.next_due = now + entry.period;
        Some(entry.id)
    }

    /// Record the outcome of a dispatched step.
    pub fn complete(&mut self, id: TaskId, result: &Result<(), TaskError>) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return;
        };
        match result {
            Ok(()) => {
                if entry.consecutive_failures > 0 {
                    debug!("task {} recovered after {} failures", id, entry.consecutive_failures);
                }
                entry.consecutive_failures = 0;
                entry.last_error = None;
            }
            Err(err) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(err.to_string());
                warn!(
                    "task {} failed ({} consecutive): {}",
                    id, entry.consecutive_failures, err
                );
            }
        }
    }

    pub fn consecutive_failures(&self, id: TaskId) -> u32 {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn priority(&self, id: TaskId) -> Option<u8> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.priority)
    }

    pub fn last_error(&self, id: TaskId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.last_error.as_deref())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

/// The transport set the runtime is wired to. Real deployments hand in
/// network and device-file implementations; tests hand in scripted ones.
pub struct Transports<W, T, S, H, D, I> {
    pub link: W,
    pub time: T,
    pub weather: S,
    pub hid: H,
    pub display: D,
    pub input: I,
}

/// Composition root: owns every task, every state record, and the
/// transports, and turns scheduler decisions into task steps.
pub struct DeckRuntime<W, T, S, H, D, I> {
    scheduler: Scheduler,
    connectivity: ConnectivityManager,
    time_sync: TimeSyncTask,
    weather_task: Option<WeatherPollTask>,
    input_reader: InputReader,
    hid: HidEmitter,
    renderer: DisplayRenderer,
    clock: ClockState,
    weather_state: WeatherState,
    transports: Transports<W, T, S, H, D, I>,
    tick_duration: Duration,
}

// Network state machines poll at this cadence rather than every tick;
// one in-flight attempt spans several polls anyway.
const NET_POLL_MS: u64 = 100;

impl<W, T, S, H, D, I> DeckRuntime<W, T, S, H, D, I>
where
    W: WifiLink,
    T: TimeSource,
    S: WeatherSource,
    H: HidTransport,
    D: DisplayTransport,
    I: InputPort,
{
    pub fn new(
        config: &Config,
        transports: Transports<W, T, S, H, D, I>,
    ) -> Result<Self, ConfigError> {
        let timing = &config.timing;
        let net_period = timing.ticks_from_ms(NET_POLL_MS);

        let mut scheduler = Scheduler::new();
        scheduler.register(
            TaskId::Display,
            timing.ticks_from_ms(timing.display_refresh_ms),
            0,
        );
        scheduler.register(TaskId::TimeSync, net_period, 1);
        scheduler.register(TaskId::Connectivity, net_period, 3);

        let weather_task = if config.weather.enabled {
            scheduler.register(TaskId::Weather, net_period, 2);
            let query = WeatherQuery {
                city: config.weather.city.clone(),
                units: config.weather.units.clone(),
                api_key: config.weather.api_key.clone(),
            };
            Some(WeatherPollTask::new(
                PollPolicy {
                    interval: timing.ticks_from_secs(timing.weather_poll_s),
                    retry_base: timing.ticks_from_secs(timing.weather_retry_base_s),
                    stale_after: timing.ticks_from_secs(timing.weather_stale_after_s),
                    timeout: timing.ticks_from_secs(timing.weather_timeout_s),
                },
                query,
            ))
        } else {
            None
        };

        let mapping = MappingTable::from_config(&config.input)?;

        Ok(DeckRuntime {
            scheduler,
            connectivity: ConnectivityManager::new(BackoffPolicy {
                base: timing.ticks_from_secs(timing.backoff_base_s),
                cap: timing.ticks_from_secs(timing.backoff_cap_s),
                connect_timeout: timing.ticks_from_secs(timing.connect_timeout_s),
            }),
            time_sync: TimeSyncTask::new(SyncPolicy {
                interval: timing.ticks_from_secs(timing.sync_interval_s),
                retry_base: timing.ticks_from_secs(timing.sync_retry_base_s),
                stale_after: timing.ticks_from_secs(timing.clock_stale_after_s),
                timeout: timing.ticks_from_secs(timing.sync_timeout_s),
            }),
            weather_task,
            input_reader: InputReader::new(
                config.input.buttons.len(),
                config.input.encoders.len(),
                timing.ticks_from_ms(timing.debounce_ms),
            ),
            hid: HidEmitter::new(
                mapping,
                timing.ticks_from_ms(timing.hid_min_spacing_ms),
                timing.hid_queue_depth,
            ),
            renderer: DisplayRenderer::new(
                config.time.utc_offset_minutes,
                config.weather.units.clone(),
            ),
            clock: ClockState::new(timing.tick_ms),
            weather_state: WeatherState::new(),
            transports,
            tick_duration: Duration::from_millis(timing.tick_ms),
        })
    }

    pub fn now(&self) -> Tick {
        self.scheduler.now()
    }

    pub fn clock(&self) -> &ClockState {
        &self.clock
    }

    pub fn weather_state(&self) -> &WeatherState {
        &self.weather_state
    }

    pub fn link_status(&self) -> LinkStatus {
        self.connectivity.status()
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity.state()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn hid_dropped_total(&self) -> u64 {
        self.hid.dropped_total
    }

    /// The wired transport set, for inspection in tests.
    pub fn transports(&self) -> &Transports<W, T, S, H, D, I> {
        &self.transports
    }

    /// Draw the startup frame before the loop begins, so the panel is not
    /// blank while the first connect attempt runs.
    pub fn show_boot_frame(&mut self) {
        if let Err(err) = self.renderer.draw_boot(&mut self.transports.display) {
            warn!("boot frame: {err}");
        }
    }

    /// One full tick: advance, sample input, drain HID, then run the one
    /// due periodic task (if any).
    pub fn tick(&mut self) {
        let now = self.scheduler.advance();

        // Input before HID, every tick. An event observed this tick can
        // reach the host this tick.
        let events = self.input_reader.step(now, &mut self.transports.input);
        for event in &events {
            self.hid.enqueue_event(event);
        }
        if let Err(err) = self.hid.step(now, &mut self.transports.hid) {
            warn!("hid emitter: {err}");
        }

        if let Some(id) = self.scheduler.due_task() {
            let started = Instant::now();
            let result = self.dispatch(id, now);
            let elapsed = started.elapsed();
            if elapsed >= self.tick_duration {
                warn!("task {} ran {}ms, over the tick budget", id, elapsed.as_millis());
            }
            self.scheduler.complete(id, &result);
        }
    }

    fn dispatch(&mut self, id: TaskId, now: Tick) -> Result<(), TaskError> {
        match id {
            TaskId::Connectivity => {
                self.connectivity.step(now, &mut self.transports.link);
                Ok(())
            }
            TaskId::TimeSync => self.time_sync.step(
                now,
                self.connectivity.status(),
                &mut self.transports.time,
                &mut self.clock,
            ),
            TaskId::Weather => match self.weather_task.as_mut() {
                Some(task) => task.step(
                    now,
                    self.connectivity.status(),
                    &mut self.transports.weather,
                    &mut self.weather_state,
                ),
                None => Ok(()),
            },
            TaskId::Display => self.renderer.step(
                now,
                &self.clock,
                &self.weather_state,
                self.connectivity.state(),
                &mut self.transports.display,
            ),
        }
    }

    /// Run forever at the configured tick rate. Work time is subtracted
    /// from the sleep so the cadence holds as long as a tick's work fits
    /// in its budget.
    pub fn run_forever(&mut self) -> ! {
        loop {
            let started = Instant::now();
            self.tick();
            let elapsed = started.elapsed();
            if let Some(remaining) = self.tick_duration.checked_sub(elapsed) {
                std::thread::sleep(remaining);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_priority_due_task_wins() {
        let mut sched = Scheduler::new();
        sched.register(TaskId::Weather, 1, 3);
        sched.register(TaskId::Display, 1, 0);
        sched.register(TaskId::TimeSync, 1, 2);

        sched.advance();
        assert_eq!(sched.due_task(), Some(TaskId::Display));
        // Same tick: display is rescheduled, next in line wins.
        assert_eq!(sched.due_task(), Some(TaskId::TimeSync));
        assert_eq!(sched.due_task(), Some(TaskId::Weather));
        assert_eq!(sched.due_task(), None);
    }

    #[test]
    fn test_one_task_per_tick_leaves_others_due() {
        let mut sched = Scheduler::new();
        sched.register(TaskId::Display, 10, 0);
        sched.register(TaskId::Connectivity, 10, 1);

        sched.advance();
        assert_eq!(sched.due_task(), Some(TaskId::Display));

        // Connectivity was due on tick 1 but not dispatched; it stays due
        // and wins the next tick.
        sched.advance();
        assert_eq!(sched.due_task(), Some(TaskId::Connectivity));
    }

    #[test]
    fn test_period_reschedules_from_dispatch_tick() {
        let mut sched = Scheduler::new();
        sched.register(TaskId::Display, 5, 0);

        sched.advance();
        assert_eq!(sched.due_task(), Some(TaskId::Display));
        for _ in 0..4 {
            sched.advance();
            assert_eq!(sched.due_task(), None);
        }
        sched.advance();
        assert_eq!(sched.due_task(), Some(TaskId::Display));
    }

    #[test]
    fn test_failure_bookkeeping_resets_on_success() {
        let mut sched = Scheduler::new();
        sched.register(TaskId::TimeSync, 1, 0);

        sched.complete(TaskId::TimeSync, &Err(TaskError::Timeout(500)));
        sched.complete(
            TaskId::TimeSync,
            &Err(TaskError::Transport("no route".to_string())),
        );
        assert_eq!(sched.consecutive_failures(TaskId::TimeSync), 2);
        assert!(sched
            .last_error(TaskId::TimeSync)
            .is_some_and(|e| e.contains("no route")));

        sched.complete(TaskId::TimeSync, &Ok(()));
        assert_eq!(sched.consecutive_failures(TaskId::TimeSync), 0);
        assert_eq!(sched.last_error(TaskId::TimeSync), None);
    }
}
