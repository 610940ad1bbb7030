use std::sync::Mutex;

use chrono::{DateTime, Duration, Local};
use tracing::trace;

/// Rate limits accepted alerts. The last accepted instant is private and only read or written
/// while holding the lock, so two intrusions racing for the same window can't both pass.
#[derive(Debug)]
pub struct CooldownGate {
    cooldown: Duration,
    last_accepted_at: Mutex<Option<DateTime<Local>>>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_accepted_at: Mutex::new(None),
        }
    }

    /// Cooldowns too long for `chrono::Duration` saturate at its maximum
    pub fn from_secs(secs: u64) -> Self {
        let cooldown = i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self::new(cooldown)
    }

    /// Returns `true` and records `now` when no alert has been accepted yet or the cooldown has
    /// fully elapsed since the last accepted one. A rejection leaves the state untouched.
    pub fn try_accept(&self, now: DateTime<Local>) -> bool {
        let mut last = self
            .last_accepted_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let accepted = match *last {
            None => true,
            Some(previous) => now.signed_duration_since(previous) >= self.cooldown,
        };
        if accepted {
            *last = Some(now);
        }
        trace!(%now, accepted, "Cooldown gate consulted");
        accepted
    }

    #[cfg(test)]
    pub fn last_accepted_at(&self) -> Option<DateTime<Local>> {
        *self
            .last_accepted_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Local, TimeZone};

    use super::CooldownGate;

    fn at(secs: i64) -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn at_millis(millis: i64) -> DateTime<Local> {
        at(0) + Duration::milliseconds(millis)
    }

    #[test]
    fn test_first_call_accepted() {
        let gate = CooldownGate::from_secs(5);
        assert_eq!(gate.last_accepted_at(), None);
        assert!(gate.try_accept(at(0)));
        assert_eq!(gate.last_accepted_at(), Some(at(0)));
    }

    #[test]
    fn test_rejects_within_window() {
        let gate = CooldownGate::from_secs(5);
        assert!(gate.try_accept(at(0)));
        assert!(!gate.try_accept(at(2)));
        assert!(!gate.try_accept(at(4)));
        // Rejections do not move the window
        assert_eq!(gate.last_accepted_at(), Some(at(0)));
        assert!(gate.try_accept(at(6)));
        assert_eq!(gate.last_accepted_at(), Some(at(6)));
    }

    #[test]
    fn test_accepts_exactly_at_cooldown() {
        let gate = CooldownGate::from_secs(5);
        assert!(gate.try_accept(at(0)));
        assert!(!gate.try_accept(at_millis(4_999)));
        assert!(gate.try_accept(at(5)));
    }

    #[test]
    fn test_clock_going_backwards_is_rejected() {
        let gate = CooldownGate::from_secs(5);
        assert!(gate.try_accept(at(100)));
        assert!(!gate.try_accept(at(10)));
    }

    #[test]
    fn test_zero_cooldown_accepts_everything() {
        let gate = CooldownGate::from_secs(0);
        assert!(gate.try_accept(at(0)));
        assert!(gate.try_accept(at(0)));
    }

    #[test]
    fn test_huge_cooldown_never_reopens() {
        let ten_years = 10 * 365 * 24 * 3600;
        for secs in [u64::MAX, u64::MAX / 2, i64::MAX as u64, i64::MAX as u64 / 1000 + 1] {
            let gate = CooldownGate::from_secs(secs);
            assert!(gate.try_accept(at(0)), "{}", secs);
            assert!(!gate.try_accept(at(1)), "{}", secs);
            assert!(!gate.try_accept(at(ten_years)), "{}", secs);
        }
    }

    #[test]
    fn test_accepted_instants_are_spaced() {
        // Irregular sequence of attempts every 700ms for a minute
        let gate = CooldownGate::from_secs(5);
        let accepted: Vec<_> = (0..86)
            .map(|i| at_millis(i * 700))
            .filter(|t| gate.try_accept(*t))
            .collect();
        assert_eq!(accepted.first(), Some(&at(0)));
        for pair in accepted.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::seconds(5));
            // Nothing should be skipped beyond the next attempt after the window closes
            assert!(pair[1] - pair[0] < Duration::milliseconds(5_700));
        }
    }

    #[test]
    fn test_concurrent_attempts_single_winner() {
        let gate = Arc::new(CooldownGate::from_secs(5));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.try_accept(at(0)))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(winners, 1);
    }
}
