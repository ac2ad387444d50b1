//! Per-robot timers
//!
//! Each timer is a sleeping task that posts `EngineEvent::Timer` back into the
//! engine. The dispatcher tags every timer with a token and ignores firings
//! whose token is no longer current, so cancellation here only saves wakeups.

use crate::domain::models::{EngineEvent, RobotId, TimerKind};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

pub struct TimerRegistry {
    events: mpsc::UnboundedSender<EngineEvent>,
    pending: HashMap<RobotId, Vec<AbortHandle>>,
}

impl TimerRegistry {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            events,
            pending: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, robot: RobotId, kind: TimerKind, token: u64, after: Duration) {
        trace!("Timer {:?} #{} for robot {} in {:?}", kind, token, robot, after);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(EngineEvent::Timer { robot, kind, token });
        });

        let timers = self.pending.entry(robot).or_default();
        timers.retain(|t| !t.is_finished());
        timers.push(task.abort_handle());
    }

    pub fn cancel_robot(&mut self, robot: RobotId) {
        if let Some(timers) = self.pending.remove(&robot) {
            for timer in timers {
                timer.abort();
            }
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timers) in self.pending.drain() {
            for timer in timers {
                timer.abort();
            }
        }
    }

    pub fn active(&self, robot: RobotId) -> usize {
        self.pending
            .get(&robot)
            .map(|timers| timers.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_with_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerRegistry::new(tx);
        timers.schedule(3, TimerKind::MotionIdle, 17, Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        match rx.recv().await {
            Some(EngineEvent::Timer { robot, kind, token }) => {
                assert_eq!((robot, kind, token), (3, TimerKind::MotionIdle, 17));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timers_never_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerRegistry::new(tx);
        timers.schedule(1, TimerKind::TransformGrace, 1, Duration::from_secs(5));
        timers.schedule(2, TimerKind::ConfirmTimeout, 2, Duration::from_secs(6));
        assert_eq!(timers.active(1), 1);

        timers.cancel_robot(1);
        assert_eq!(timers.active(1), 0);

        match rx.recv().await {
            Some(EngineEvent::Timer { robot, .. }) => assert_eq!(robot, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
