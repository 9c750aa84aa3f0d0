//! Deadline-based gates that decide when a flush may run.
//!
//! Gates never sleep themselves. They are driven with explicit `now`
//! instants and expose their next deadline, so one event loop can own
//! several of them and wake with `sleep_until` on the earliest.

use tokio::time::{Duration, Instant};

/// Outcome of offering a call to a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Run now.
    Fire,
    /// A fire is now scheduled for this instant.
    Scheduled(Instant),
    /// Absorbed into an already scheduled fire.
    Pending,
}

pub trait Gate {
    fn call(&mut self, now: Instant) -> Trigger;

    /// When the scheduled fire is due, if any.
    fn deadline(&self) -> Option<Instant>;

    /// Consume the scheduled fire if it is due. Returns `true` when it fired.
    fn expire(&mut self, now: Instant) -> bool;
}

/// Trailing-only window: the first call of a burst schedules one fire at
/// `first_call + window`; everything until then is absorbed.
#[derive(Debug, Clone)]
pub struct BurstCoalescer {
    window: Duration,
    due: Option<Instant>,
}

impl BurstCoalescer {
    pub fn new(window: Duration) -> Self {
        Self { window, due: None }
    }
}

impl Gate for BurstCoalescer {
    fn call(&mut self, now: Instant) -> Trigger {
        if self.due.is_some() {
            return Trigger::Pending;
        }
        let due = now + self.window;
        self.due = Some(due);
        Trigger::Scheduled(due)
    }

    fn deadline(&self) -> Option<Instant> {
        self.due
    }

    fn expire(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if due <= now => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

/// Leading and trailing limiter: at most one fire per `spacing`.
///
/// A call in a quiet period fires immediately. Calls inside the spacing
/// collapse into one trailing fire at `last_fire + spacing`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    spacing: Duration,
    last_fire: Option<Instant>,
    trailing: Option<Instant>,
}

impl RateLimiter {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_fire: None,
            trailing: None,
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }
}

impl Gate for RateLimiter {
    fn call(&mut self, now: Instant) -> Trigger {
        if self.trailing.is_some() {
            return Trigger::Pending;
        }
        match self.last_fire {
            Some(last) if now < last + self.spacing => {
                let due = last + self.spacing;
                self.trailing = Some(due);
                Trigger::Scheduled(due)
            }
            _ => {
                self.last_fire = Some(now);
                Trigger::Fire
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.trailing
    }

    fn expire(&mut self, now: Instant) -> bool {
        match self.trailing {
            Some(due) if due <= now => {
                self.trailing = None;
                self.last_fire = Some(now);
                true
            }
            _ => false,
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_coalescer_never_leads() {
        let t0 = Instant::now();
        let mut gate = BurstCoalescer::new(10 * MS);

        assert_eq!(gate.call(t0), Trigger::Scheduled(t0 + 10 * MS));
        assert_eq!(gate.call(t0 + 3 * MS), Trigger::Pending);
        assert_eq!(gate.call(t0 + 9 * MS), Trigger::Pending);
        assert_eq!(gate.deadline(), Some(t0 + 10 * MS));
    }

    #[test]
    fn test_coalescer_window_is_fixed_from_first_call() {
        let t0 = Instant::now();
        let mut gate = BurstCoalescer::new(10 * MS);
        gate.call(t0);
        gate.call(t0 + 9 * MS);

        assert!(!gate.expire(t0 + 9 * MS));
        assert!(gate.expire(t0 + 10 * MS));
        assert!(!gate.expire(t0 + 11 * MS));
        assert_eq!(gate.deadline(), None);

        // next burst starts a fresh window
        assert_eq!(gate.call(t0 + 20 * MS), Trigger::Scheduled(t0 + 30 * MS));
    }

    #[test]
    fn test_limiter_leads_in_quiet_period() {
        let t0 = Instant::now();
        let mut gate = RateLimiter::new(333 * MS);

        assert_eq!(gate.call(t0), Trigger::Fire);
        assert_eq!(gate.deadline(), None);
        assert_eq!(gate.call(t0 + 400 * MS), Trigger::Fire);
    }

    #[test]
    fn test_limiter_collapses_into_one_trailing_fire() {
        let t0 = Instant::now();
        let mut gate = RateLimiter::new(333 * MS);

        assert_eq!(gate.call(t0), Trigger::Fire);
        assert_eq!(gate.call(t0 + 50 * MS), Trigger::Scheduled(t0 + 333 * MS));
        assert_eq!(gate.call(t0 + 100 * MS), Trigger::Pending);

        assert!(!gate.expire(t0 + 332 * MS));
        assert!(gate.expire(t0 + 333 * MS));

        // the trailing fire counts as the last fire
        assert_eq!(gate.call(t0 + 400 * MS), Trigger::Scheduled(t0 + 666 * MS));
    }

    #[test]
    fn test_limiter_three_per_second() {
        let t0 = Instant::now();
        let mut gate = RateLimiter::new(333 * MS);
        let mut fires = 0;

        for step in 0..1000u64 {
            let now = t0 + Duration::from_millis(step);
            if gate.expire(now) {
                fires += 1;
            }
            if gate.call(now) == Trigger::Fire {
                fires += 1;
            }
        }
        assert!(fires <= 4, "fired {fires} times in one second");
        assert_eq!(gate.spacing(), 333 * MS);
    }
}
