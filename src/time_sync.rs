//! # Time Sync Task
//!
//! Periodically obtains authoritative wall-clock time through the
//! [`TimeSource`] transport and folds it into the [`ClockState`] offset.
//! The query is an explicit begin/poll state machine: issued on one tick,
//! polled on later ticks, abandoned wholesale if connectivity drops or the
//! timeout lapses. The clock record is mutated only on a fully successful
//! answer; a failed or timed-out query leaves it bit-for-bit unchanged.
//!
//! After a failure the next attempt is scheduled on a shortened backoff
//! (`retry_base * 2^failures`) that never exceeds the normal sync interval.

use crate::clock::ClockState;
use crate::connectivity::LinkStatus;
use crate::scheduler::TaskError;
use crate::transport::{SourcePoll, TimeSource};
use crate::Tick;
use log::{debug, info, warn};

/// Intervals for the sync cadence, in ticks.
#[derive(Clone, Copy, Debug)]
pub struct SyncPolicy {
    /// Normal interval between successful syncs
    pub interval: Tick,
    /// Base retry delay after a failure
    pub retry_base: Tick,
    /// No success for this long ⇒ clock marked stale
    pub stale_after: Tick,
    /// Max wait for an in-flight query
    pub timeout: Tick,
}

impl SyncPolicy {
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

/// Drives a [`TimeSource`] and owns all mutation of the clock record.
pub struct TimeSyncTask {
    policy: SyncPolicy,
    phase: Phase,
    next_attempt_at: Tick,
    consecutive_failures: u32,
}

impl TimeSyncTask {
    pub fn new(policy: SyncPolicy) -> Self {
        TimeSyncTask {
            policy,
            phase: Phase::Idle,
            // Zero means: sync immediately once the link is up (the original
            // firmware forces an NTP sync during startup).
            next_attempt_at: 0,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// One non-blocking step.
    pub fn step<T: TimeSource + ?Sized>(
        &mut self,
        now: Tick,
        link: LinkStatus,
        source: &mut T,
        clock: &mut ClockState,
    ) -> Result<(), TaskError> {
        // Staleness degrades regardless of connectivity; the display must
        // distinguish a clock that has quietly drifted out of its window.
        if let Some(last) = clock.last_sync_at() {
            if now.saturating_sub(last) >= self.policy.stale_after {
                clock.mark_stale();
            }
        }

        if link != LinkStatus::Connected {
            // Gate: abandon any in-flight query without committing anything.
            if matches!(self.phase, Phase::InFlight { .. }) {
                debug!("time sync: link down, abandoning in-flight query");
                self.phase = Phase::Idle;
            }
            return Ok(());
        }

        match self.phase {
            Phase::Idle => {
                if now >= self.next_attempt_at {
                    debug!("time sync: issuing query");
                    source.begin_query();
                    self.phase = Phase::InFlight { started: now };
                }
                Ok(())
            }
            Phase::InFlight { started } => match source.poll_query() {
                SourcePoll::Pending => {
                    if now.saturating_sub(started) >= self.policy.timeout {
                        self.fail(now, clock, TaskError::Timeout(self.policy.timeout))
                    } else {
                        Ok(())
                    }
                }
                SourcePoll::Ready(wall) => {
                    clock.apply_sync(now, wall);
                    self.consecutive_failures = 0;
                    self.next_attempt_at = now + self.policy.interval;
                    self.phase = Phase::Idle;
                    info!("time sync: synced, offset {} ms", clock.sync_offset_ms());
                    Ok(())
                }
                SourcePoll::Failed(reason) => {
                    self.fail(now, clock, TaskError::Transport(reason))
                }
                SourcePoll::Idle => {
                    self.fail(now, clock, TaskError::Transport("source idle".to_string()))
                }
            },
        }
    }

    fn fail(&mut self, now: Tick, clock: &ClockState, err: TaskError) -> Result<(), TaskError> {
        let delay = self.policy.retry_delay(self.consecutive_failures);
        self.consecutive_failures += 1;
        self.next_attempt_at = now + delay;
        self.phase = Phase::Idle;
        warn!(
            "time sync failed ({}), retry in {} ticks, clock status {:?}",
            err,
            delay,
            clock.sync_status()
        );
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SyncStatus;
    use crate::sim::{ScriptedTimeSource, TimeScript};
    use chrono::{TimeZone, Utc};

    fn policy() -> SyncPolicy {
        SyncPolicy {
            interval: 1000,
            retry_base: 50,
            stale_after: 5000,
            timeout: 10,
        }
    }

    fn wall(secs: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, secs).unwrap()
    }

    /// Drive the task for a tick range against a connected link.
    fn run(
        task: &mut TimeSyncTask,
        source: &mut ScriptedTimeSource,
        clock: &mut ClockState,
        ticks: std::ops::Range<Tick>,
    ) {
        for now in ticks {
            let _ = task.step(now, LinkStatus::Connected, source, clock);
        }
    }

    #[test]
    fn test_successful_sync_sets_offset() {
        let mut task = TimeSyncTask::new(policy());
        let mut source = ScriptedTimeSource::new(vec![TimeScript::Reply(wall(0))]);
        let mut clock = ClockState::new(20);

        run(&mut task, &mut source, &mut clock, 0..3);
        assert_eq!(clock.sync_status(), SyncStatus::Synced);
        assert_eq!(source.queries, 1);
    }

    #[test]
    fn test_failed_sync_leaves_clock_unchanged() {
        let mut task = TimeSyncTask::new(policy());
        let mut source = ScriptedTimeSource::new(vec![
            TimeScript::Reply(wall(0)),
            TimeScript::Fail,
        ]);
        let mut clock = ClockState::new(20);

        run(&mut task, &mut source, &mut clock, 0..3);
        let snapshot = clock;

        // Force the next attempt and let it fail
        run(&mut task, &mut source, &mut clock, 1000..1005);
        assert_eq!(task.consecutive_failures(), 1);
        assert_eq!(clock, snapshot, "failed sync must not touch the record");
    }

    #[test]
    fn test_timeout_counts_as_failure() {
        let mut task = TimeSyncTask::new(policy());
        let mut source = ScriptedTimeSource::new(vec![TimeScript::Hang]);
        let mut clock = ClockState::new(20);

        run(&mut task, &mut source, &mut clock, 0..20);
        assert_eq!(task.consecutive_failures(), 1);
        assert_eq!(clock.sync_status(), SyncStatus::Unsynced);
    }

    #[test]
    fn test_retry_backoff_capped_at_interval() {
        let p = policy();
        assert_eq!(p.retry_delay(0), 50);
        assert_eq!(p.retry_delay(1), 100);
        assert_eq!(p.retry_delay(4), 800);
        assert_eq!(p.retry_delay(5), 1000, "retry delay caps at the interval");
        assert_eq!(p.retry_delay(12), 1000);
    }

    #[test]
    fn test_synced_then_failures_past_threshold_goes_stale() {
        // Scenario: sync succeeds at offset +5s, then every further attempt
        // fails past the staleness threshold. Status degrades Synced → Stale
        // while the learned offset is retained.
        let mut task = TimeSyncTask::new(policy());
        let mut source = ScriptedTimeSource::new(vec![
            TimeScript::Reply(wall(5)),
            TimeScript::Fail,
            TimeScript::Fail,
        ]);
        let mut clock = ClockState::new(1000); // 1 tick = 1 s for easy math

        run(&mut task, &mut source, &mut clock, 0..3);
        assert_eq!(clock.sync_status(), SyncStatus::Synced);
        let offset = clock.sync_offset_ms();

        run(&mut task, &mut source, &mut clock, 3..7000);
        assert!(task.consecutive_failures() >= 2);
        assert_eq!(clock.sync_status(), SyncStatus::Stale);
        assert_eq!(clock.sync_offset_ms(), offset, "+5s offset must survive");
    }

    #[test]
    fn test_link_down_skips_and_abandons() {
        let mut task = TimeSyncTask::new(policy());
        let mut source = ScriptedTimeSource::new(vec![TimeScript::Reply(wall(0))]);
        source.delay_polls = 5;
        let mut clock = ClockState::new(20);

        // Issue the query, then drop the link mid-flight
        let _ = task.step(0, LinkStatus::Connected, &mut source, &mut clock);
        let _ = task.step(1, LinkStatus::Disconnected, &mut source, &mut clock);
        assert_eq!(clock.sync_status(), SyncStatus::Unsynced);

        // While disconnected nothing is issued
        let _ = task.step(2, LinkStatus::Disconnected, &mut source, &mut clock);
        assert_eq!(source.queries, 1);
    }
}
