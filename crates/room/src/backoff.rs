use std::time::Duration;

use roomkit_protocol::BACKOFF_SCHEDULE_MS;

/// Exponential backoff over the fixed schedule in spec.md §4.1, with ±10%
/// jitter so many clients reconnecting at once don't thunder in lockstep.
#[derive(Debug, Default)]
pub struct Backoff {
    step: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Reset to the first delay — called on any successful `open`.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = BACKOFF_SCHEDULE_MS[self.step.min(BACKOFF_SCHEDULE_MS.len() - 1)];
        if self.step < BACKOFF_SCHEDULE_MS.len() - 1 {
            self.step += 1;
        }
        let jitter = 0.9 + rand::random::<f64>() * 0.2;
        Duration::from_millis((base as f64 * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_increase_then_cap() {
        let mut backoff = Backoff::new();
        let mut last = Duration::ZERO;
        for expected_base in BACKOFF_SCHEDULE_MS {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis((*expected_base as f64 * 0.9) as u64));
            assert!(delay > last || *expected_base == BACKOFF_SCHEDULE_MS[0]);
            last = delay;
        }
        let capped = backoff.next_delay();
        let max = *BACKOFF_SCHEDULE_MS.last().expect("schedule is non-empty");
        assert!(capped <= Duration::from_millis((max as f64 * 1.1) as u64 + 1));
    }

    #[test]
    fn reset_returns_to_first_delay() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis((BACKOFF_SCHEDULE_MS[0] as f64 * 1.1) as u64 + 1));
    }
}
