use crate::clock::Clock;

use super::Frame;

const DEFAULT_MAX_BACKLOG: u32 = 8;

/// Converts irregular host time into fixed simulation frames. Each frame
/// produced steps the clock's game time by exactly one interval, so frame
/// times and `Clock::game_time` never diverge. Backlog beyond a few ticks
/// is dropped rather than replayed, trading accuracy for liveness after a
/// stall.
pub struct Ticker {
    interval: f64,
    pending: f64,
    max_backlog: u32,
}

impl Ticker {
    pub fn new(tick_rate: u32) -> Self {
        Self::with_backlog(tick_rate, DEFAULT_MAX_BACKLOG)
    }

    /// `max_backlog` bounds how many ticks a stalled host replays before
    /// the rest are discarded.
    pub fn with_backlog(tick_rate: u32, max_backlog: u32) -> Self {
        Self {
            interval: 1.0 / tick_rate as f64,
            pending: 0.0,
            max_backlog,
        }
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Credits elapsed host time toward future frames.
    pub fn advance(&mut self, elapsed: f64) {
        self.pending += elapsed.max(0.0);
        let cap = self.interval * self.max_backlog as f64;
        if self.pending > cap {
            log::debug!(
                "simulation fell {:.3}s behind; dropping the excess",
                self.pending - cap
            );
            self.pending = cap;
        }
    }

    /// Produces the next due frame, stepping the clock's game time, or
    /// `None` once the credited time is spent.
    pub fn next_frame(&mut self, clock: &mut Clock) -> Option<Frame> {
        if self.pending < self.interval {
            return None;
        }
        self.pending -= self.interval;
        clock.step_game_time(self.interval);
        Some(Frame::new(clock.game_time(), self.interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_track_game_time() {
        let mut clock = Clock::new();
        let mut ticker = Ticker::new(50);

        ticker.advance(0.05);
        let first = ticker.next_frame(&mut clock).expect("first frame");
        let second = ticker.next_frame(&mut clock).expect("second frame");
        assert!(ticker.next_frame(&mut clock).is_none());

        assert!((first.time - 0.02).abs() < 1e-9);
        assert!((second.time - first.time - 0.02).abs() < 1e-9);
        assert_eq!(clock.game_time(), second.time);
    }

    #[test]
    fn remainder_carries_into_next_advance() {
        let mut clock = Clock::new();
        let mut ticker = Ticker::new(50);

        ticker.advance(0.03);
        assert!(ticker.next_frame(&mut clock).is_some());
        assert!(ticker.next_frame(&mut clock).is_none());

        // The leftover 10 ms plus another 10 ms buys one more frame.
        ticker.advance(0.01);
        assert!(ticker.next_frame(&mut clock).is_some());
    }

    #[test]
    fn stalls_drop_excess_backlog() {
        let mut clock = Clock::new();
        let mut ticker = Ticker::new(50);

        ticker.advance(10.0);
        let mut frames = 0;
        while ticker.next_frame(&mut clock).is_some() {
            frames += 1;
        }
        assert!(frames <= 8);
        // Game time only advanced by what was actually simulated.
        assert!(clock.game_time() < 1.0);
    }
}
