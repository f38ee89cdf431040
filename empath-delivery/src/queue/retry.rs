//! Fixed-step retry backoff (§4.F).

use std::time::{Duration, SystemTime};

/// The retry schedule in seconds, indexed by attempt number (1-indexed):
/// 1 min, 5 min, 10 min, then holds at 20 min for every attempt after.
const RETRY_SCHEDULE_SECS: [u64; 4] = [60, 300, 600, 1200];

/// Calculate the next retry time for `attempt` (1-indexed), following the
/// fixed schedule `1 min -> 5 min -> 10 min -> 20 min`, capped at 20 min for
/// every attempt after the fourth (§4.F). Give-up is driven separately by
/// message age against `give_up_send_after`, not by attempt count.
#[must_use]
pub fn calculate_next_retry_time(attempt: u32) -> SystemTime {
    let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
    let delay_secs = RETRY_SCHEDULE_SECS
        .get(index)
        .copied()
        .unwrap_or_else(|| *RETRY_SCHEDULE_SECS.last().expect("schedule is non-empty"));

    SystemTime::now() + Duration::from_secs(delay_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_fixed_step_schedule() {
        let cases = [(1, 60), (2, 300), (3, 600), (4, 1200)];

        for (attempt, expected_secs) in cases {
            let now = SystemTime::now();
            let next_retry = calculate_next_retry_time(attempt);
            let delay = next_retry.duration_since(now).unwrap_or_default().as_secs();
            assert_eq!(delay, expected_secs, "attempt {attempt} should delay {expected_secs}s");
        }
    }

    #[test]
    fn holds_at_twenty_minutes_past_the_fourth_attempt() {
        let now = SystemTime::now();
        let next_retry = calculate_next_retry_time(20);
        let delay = next_retry.duration_since(now).unwrap_or_default().as_secs();
        assert_eq!(delay, 1200, "attempts past the fourth should stay capped at 20 minutes");
    }
}
