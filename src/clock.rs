//! # Offset-Corrected Wall Clock
//!
//! The device has no battery-backed RTC. Wall-clock time is derived from the
//! scheduler's monotonic tick counter plus a signed offset learned from the
//! network time source: `wall_ms = tick * tick_ms + sync_offset_ms`.
//!
//! The tick counter itself is never adjusted, since debounce windows and
//! timeouts elsewhere depend on its ordering. A resync only ever moves
//! the offset. The offset is written by exactly one task (time sync) and
//! only on a fully successful query; a failed or timed-out query leaves this
//! record untouched.

use crate::Tick;
use chrono::{DateTime, FixedOffset, TimeZone, Timelike, Utc};

/// Freshness of the clock's network synchronization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    /// Never synced since boot; wall time is unknown
    Unsynced,
    /// Synced within the staleness threshold
    Synced,
    /// Last successful sync is older than the staleness threshold
    Stale,
}

/// Clock state record. Single writer: the time sync task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockState {
    /// Milliseconds per scheduler tick, fixed at startup
    tick_ms: u64,
    /// Wall epoch-ms minus tick-derived ms, valid after the first sync
    sync_offset_ms: i64,
    /// Tick of the last successful sync
    last_sync_at: Option<Tick>,
    /// Freshness of the offset
    sync_status: SyncStatus,
}

impl ClockState {
    pub fn new(tick_ms: u64) -> Self {
        ClockState {
            tick_ms,
            sync_offset_ms: 0,
            last_sync_at: None,
            sync_status: SyncStatus::Unsynced,
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    pub fn last_sync_at(&self) -> Option<Tick> {
        self.last_sync_at
    }

    pub fn sync_offset_ms(&self) -> i64 {
        self.sync_offset_ms
    }

    /// Record a successful sync: the authoritative wall time observed at
    /// tick `now`. This is the only place the offset changes.
    pub fn apply_sync(&mut self, now: Tick, wall: DateTime<Utc>) {
        let tick_derived_ms = (now * self.tick_ms) as i64;
        self.sync_offset_ms = wall.timestamp_millis() - tick_derived_ms;
        self.last_sync_at = Some(now);
        self.sync_status = SyncStatus::Synced;
    }

    /// Degrade Synced → Stale once the staleness threshold is exceeded.
    /// The offset is kept; consumers show the time with a stale marker.
    pub fn mark_stale(&mut self) {
        if self.sync_status == SyncStatus::Synced {
            self.sync_status = SyncStatus::Stale;
        }
    }

    /// Wall-clock UTC time at tick `now`, if the clock has ever synced.
    pub fn wall_time(&self, now: Tick) -> Option<DateTime<Utc>> {
        if self.sync_status == SyncStatus::Unsynced {
            return None;
        }
        let ms = (now * self.tick_ms) as i64 + self.sync_offset_ms;
        Utc.timestamp_millis_opt(ms).single()
    }

    /// Local time at tick `now` under a fixed configured UTC offset.
    pub fn local_time(&self, now: Tick, utc_offset_minutes: i32) -> Option<DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)?;
        Some(self.wall_time(now)?.with_timezone(&offset))
    }
}

/// Format a local time the way the original panel shows it: 12-hour clock
/// with seconds and an AM/PM suffix, e.g. "3:04:05 PM".
pub fn format_local_time(t: &DateTime<FixedOffset>) -> String {
    let hour_24 = t.hour();
    let am_pm = if hour_24 < 12 { "AM" } else { "PM" };
    let mut hour_12 = hour_24 % 12;
    if hour_12 == 0 {
        hour_12 = 12;
    }
    format!("{}:{:02}:{:02} {}", hour_12, t.minute(), t.second(), am_pm)
}
