use std::time::Instant;

const DRIFT_STEP_SECS: f64 = 0.001;
const SNAP_THRESHOLD_SECS: f64 = 0.3;

/// Tracks the three time domains of a simulation host: local wall-clock
/// seconds since construction, an estimate of the server's clock, and the
/// fixed-step game time.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    server_delta: f64,
    has_server_time: bool,
    game_time: f64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            server_delta: 0.0,
            has_server_time: false,
            game_time: 0.0,
        }
    }

    /// Monotonic seconds since this clock was created.
    pub fn client_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Estimated server time. Zero until the first `update_server_time`.
    pub fn server_time(&self) -> f64 {
        if self.has_server_time {
            self.client_time() + self.server_delta
        } else {
            0.0
        }
    }

    pub fn game_time(&self) -> f64 {
        self.game_time
    }

    /// Advances game time by a fixed step.
    pub fn step_game_time(&mut self, delta: f64) {
        self.game_time += delta;
    }

    /// Feeds a fresh server time observation. The local estimate drifts
    /// toward `(server_time + latency)` by at most 1 ms per call, snapping
    /// outright when the difference exceeds 300 ms. Game time never rewinds.
    pub fn update_server_time(&mut self, server_time: f64, latency: f64) {
        let target = server_time + latency;
        let target_delta = target - self.client_time();

        if !self.has_server_time {
            self.server_delta = target_delta;
            self.has_server_time = true;
        } else {
            let diff = target_delta - self.server_delta;
            if diff.abs() > SNAP_THRESHOLD_SECS {
                self.server_delta = target_delta;
            } else {
                self.server_delta += diff.clamp(-DRIFT_STEP_SECS, DRIFT_STEP_SECS);
            }
        }

        if target > self.game_time {
            self.game_time = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_time_zero_until_first_update() {
        let clock = Clock::new();
        assert_eq!(clock.server_time(), 0.0);
    }

    #[test]
    fn first_update_snaps() {
        let mut clock = Clock::new();
        clock.update_server_time(100.0, 0.05);
        assert!((clock.server_time() - 100.05).abs() < 0.01);
    }

    #[test]
    fn small_difference_drifts_by_one_ms() {
        let mut clock = Clock::new();
        clock.update_server_time(100.0, 0.0);
        clock.update_server_time(100.01, 0.0);
        // 10 ms of disagreement moves the estimate by only 1 ms.
        assert!((clock.server_time() - 100.001).abs() < 0.005);
    }

    #[test]
    fn large_difference_snaps() {
        let mut clock = Clock::new();
        clock.update_server_time(100.0, 0.0);
        clock.update_server_time(200.0, 0.0);
        assert!((clock.server_time() - 200.0).abs() < 0.01);
    }

    #[test]
    fn game_time_never_rewinds() {
        let mut clock = Clock::new();
        clock.step_game_time(50.0);
        clock.update_server_time(10.0, 0.0);
        assert_eq!(clock.game_time(), 50.0);

        clock.update_server_time(80.0, 0.0);
        assert_eq!(clock.game_time(), 80.0);

        clock.step_game_time(1.0 / 60.0);
        assert!(clock.game_time() > 80.0);
    }
}
