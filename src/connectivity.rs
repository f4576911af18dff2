//! # Connectivity Manager
//!
//! Owns the WiFi association lifecycle and exposes a simple up/down status
//! with exponential retry backoff. Network-dependent tasks (time sync,
//! weather) read a copy of [`ConnectivityState`] before issuing work and
//! skip their step entirely while the link is anything but `Connected`.
//!
//! State machine: `Disconnected → Connecting → {Connected | Backoff}`.
//! Each association failure doubles the backoff delay from a configured base
//! up to a cap; one success resets the retry counter to zero. A connect
//! attempt that outlives its timeout is treated exactly like an explicit
//! failure.

use crate::transport::{LinkPoll, WifiLink};
use crate::Tick;
use log::{debug, info, warn};

/// Link status, readable by any task as a cheap copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// No association and no attempt in flight
    Disconnected,
    /// Association attempt in flight
    Connecting,
    /// Associated; network work may proceed
    Connected,
    /// Waiting out a retry delay after a failure
    Backoff { until: Tick },
}

/// Connectivity state record. Single writer: the connectivity manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectivityState {
    pub status: LinkStatus,
    pub retry_count: u32,
}

/// Backoff and timeout intervals, in ticks.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Tick,
    pub cap: Tick,
    pub connect_timeout: Tick,
}

impl BackoffPolicy {
    /// Delay before the next attempt after `retry_count` prior failures:
    /// `base * 2^retry_count`, capped. Non-decreasing in `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Tick {
        let shift = retry_count.min(16);
        self.base.saturating_mul(1u64 << shift).min(self.cap)
    }
}

/// Drives a [`WifiLink`] transport and owns the connectivity record.
pub struct ConnectivityManager {
    state: ConnectivityState,
    policy: BackoffPolicy,
    attempt_started: Option<Tick>,
}

impl ConnectivityManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        ConnectivityManager {
            state: ConnectivityState {
                status: LinkStatus::Disconnected,
                retry_count: 0,
            },
            policy,
            attempt_started: None,
        }
    }

    /// Snapshot of the current record.
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Current status; the precondition gate for network tasks.
    pub fn status(&self) -> LinkStatus {
        self.state.status
    }

    /// One non-blocking step of the association state machine.
    pub fn step<W: WifiLink + ?Sized>(&mut self, now: Tick, link: &mut W) {
        match self.state.status {
            LinkStatus::Disconnected => {
                debug!(
                    "wifi: starting association attempt {}",
                    self.state.retry_count + 1
                );
                link.begin_connect();
                self.attempt_started = Some(now);
                self.state.status = LinkStatus::Connecting;
            }
            LinkStatus::Connecting => match link.poll_connect() {
                LinkPoll::Pending => {
                    let started = self.attempt_started.unwrap_or(now);
                    if now.saturating_sub(started) >= self.policy.connect_timeout {
                        warn!("wifi: connect attempt timed out");
                        self.enter_backoff(now);
                    }
                }
                LinkPoll::Connected => {
                    info!("wifi: associated");
                    self.attempt_started = None;
                    self.state.status = LinkStatus::Connected;
                    self.state.retry_count = 0;
                }
                LinkPoll::Failed => {
                    warn!("wifi: association failed");
                    self.enter_backoff(now);
                }
            },
            LinkStatus::Connected => {
                if !link.is_associated() {
                    warn!("wifi: association dropped");
                    self.state.status = LinkStatus::Disconnected;
                }
            }
            LinkStatus::Backoff { until } => {
                if now >= until {
                    self.state.status = LinkStatus::Disconnected;
                }
            }
        }
    }

    fn enter_backoff(&mut self, now: Tick) {
        let delay = self.policy.delay(self.state.retry_count);
        self.attempt_started = None;
        self.state.retry_count += 1;
        self.state.status = LinkStatus::Backoff { until: now + delay };
        debug!(
            "wifi: backing off {} ticks (retry {})",
            delay, self.state.retry_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{LinkScript, ScriptedLink};

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: 10,
            cap: 80,
            connect_timeout: 50,
        }
    }

    #[test]
    fn test_backoff_delay_doubles_up_to_cap() {
        let policy = policy();
        let delays: Vec<Tick> = (0..6).map(|n| policy.delay(n)).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 80, 80]);

        // Non-decreasing across consecutive failures
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "backoff must never shrink");
        }
    }

    #[test]
    fn test_backoff_delay_shift_saturates() {
        let policy = BackoffPolicy {
            base: 1,
            cap: Tick::MAX,
            connect_timeout: 1,
        };
        // Huge retry counts must not overflow the shift
        assert_eq!(policy.delay(64), 1u64 << 16);
    }

    #[test]
    fn test_boot_fails_twice_then_connects() {
        // Boot disconnected, two failed attempts with growing delay, then
        // success: status == Connected and retry_count resets to 0.
        let mut link = ScriptedLink::new(vec![
            LinkScript::Fail { after_polls: 1 },
            LinkScript::Fail { after_polls: 1 },
            LinkScript::Succeed { after_polls: 1 },
        ]);
        let mut manager = ConnectivityManager::new(policy());
        let mut backoffs = Vec::new();

        let mut now: Tick = 0;
        for _ in 0..500 {
            let was_backing_off = matches!(manager.status(), LinkStatus::Backoff { .. });
            manager.step(now, &mut link);
            if let LinkStatus::Backoff { until } = manager.status() {
                if !was_backing_off {
                    backoffs.push(until - now);
                }
            }
            if manager.status() == LinkStatus::Connected {
                break;
            }
            now += 1;
        }

        assert_eq!(manager.status(), LinkStatus::Connected);
        assert_eq!(manager.state().retry_count, 0);
        assert_eq!(link.connect_attempts, 3);
        assert_eq!(backoffs, vec![10, 20], "delays must grow across failures");
    }

    #[test]
    fn test_connect_timeout_counts_as_failure() {
        let mut link = ScriptedLink::new(vec![LinkScript::Hang]);
        let mut manager = ConnectivityManager::new(policy());

        manager.step(0, &mut link);
        assert_eq!(manager.status(), LinkStatus::Connecting);

        // Just under the timeout: still waiting
        manager.step(49, &mut link);
        assert_eq!(manager.status(), LinkStatus::Connecting);

        // At the timeout: treated as a failure, backoff entered
        manager.step(50, &mut link);
        assert!(matches!(manager.status(), LinkStatus::Backoff { .. }));
        assert_eq!(manager.state().retry_count, 1);
    }

    #[test]
    fn test_dropped_association_reenters_disconnected() {
        let mut link = ScriptedLink::new(vec![LinkScript::Succeed { after_polls: 1 }]);
        let mut manager = ConnectivityManager::new(policy());

        manager.step(0, &mut link);
        manager.step(1, &mut link);
        assert_eq!(manager.status(), LinkStatus::Connected);

        link.drop_link();
        manager.step(2, &mut link);
        assert_eq!(manager.status(), LinkStatus::Disconnected);
        // A fresh cycle begins on the next step
        manager.step(3, &mut link);
        assert_eq!(manager.status(), LinkStatus::Connecting);
    }
}
