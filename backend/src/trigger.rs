// 定时触发
// Boundary-aligned periodic trigger; each tick runs detached so a slow cycle never delays the next

use crate::poll_core::{PollController, TickOutcome};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error};
use std::time::Duration;

/// Fire every `period`, `offset` into each period (e.g. second 20 of every minute).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    period: Duration,
    offset: Duration,
}

impl Schedule {
    /// `None` if `period` is zero or `offset` is not shorter than `period`.
    pub fn new(period: Duration, offset: Duration) -> Option<Self> {
        if period.is_zero() || offset >= period {
            return None;
        }
        Some(Self { period, offset })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// First firing instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.period.as_millis() as i64;
        let offset = self.offset.as_millis() as i64;
        let shifted = now.timestamp_millis() - offset;
        let next = (shifted.div_euclid(period) + 1) * period + offset;
        DateTime::<Utc>::from_timestamp_millis(next)
            .unwrap_or_else(|| now + ChronoDuration::milliseconds(period))
    }
}

/// Drive `controller` forever on `schedule`.
///
/// Ticks are spawned, never awaited inline: overlap handling is left to the
/// controller's guard, which drops ticks instead of queueing them.
pub async fn run(controller: PollController, schedule: Schedule, run_immediately: bool) {
    if run_immediately {
        spawn_tick(controller.clone(), Utc::now());
    }
    loop {
        let now = Utc::now();
        let fire_at = schedule.next_after(now);
        let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        spawn_tick(controller.clone(), fire_at);
    }
}

fn spawn_tick(controller: PollController, at: DateTime<Utc>) {
    tokio::spawn(async move {
        let name = controller.job().name.clone();
        match controller.run_tick(at).await {
            TickOutcome::Skipped(reason) => debug!("[{}] Tick at {} skipped: {:?}", name, at, reason),
            TickOutcome::Completed { persisted: false, .. } => {
                error!("[{}] Tick at {} completed without storing its row", name, at)
            }
            TickOutcome::Completed { .. } => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fires_at_offset_within_each_minute() {
        let schedule = Schedule::new(Duration::from_secs(60), Duration::from_secs(20)).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 5).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 20).unwrap()
        );
        let on_boundary = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 20).unwrap();
        assert_eq!(
            schedule.next_after(on_boundary),
            Utc.with_ymd_and_hms(2025, 5, 1, 12, 1, 20).unwrap()
        );
    }

    #[test]
    fn thirty_second_slots() {
        let schedule = Schedule::new(Duration::from_secs(30), Duration::ZERO).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 31).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Utc.with_ymd_and_hms(2025, 5, 1, 12, 1, 0).unwrap()
        );
    }

    #[test]
    fn rejects_offset_past_period() {
        assert!(Schedule::new(Duration::from_secs(30), Duration::from_secs(30)).is_none());
        assert!(Schedule::new(Duration::ZERO, Duration::ZERO).is_none());
    }
}
