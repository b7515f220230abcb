use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and "equal jitter": each delay is half the
/// current step plus a random share of the other half.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    step: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            step: initial,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = self.step;
        self.step = step.saturating_mul(2).min(self.max);
        self.attempts += 1;
        let half = step / 2;
        let spread = (step - half).as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        (half + jitter).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.step = self.initial;
        self.attempts = 0;
    }
}
