use std::time::Duration;

/// Ticks over this many intervals reset pacing instead of catching up.
const MAX_OVERRUN_INTERVALS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PacingWarning {
    /// Tick body took more than 1.5 intervals
    SlowTick { elapsed: Duration },
    /// Tick body took so long that pacing was reset
    Overrun { elapsed: Duration },
}

/// Keeps ticks on a fixed phase: the next wait absorbs the remainder of the
/// last tick, and whole missed intervals lengthen the effective loop interval.
#[derive(Clone, Debug)]
pub struct Pacer {
    interval: Duration,
    wait: Duration,
    actual_loop_interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval, wait: interval, actual_loop_interval: interval }
    }

    /// Time to sleep before the next tick.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Interval the last tick actually covered.
    pub fn actual_loop_interval(&self) -> Duration {
        self.actual_loop_interval
    }

    pub fn after_tick(&mut self, elapsed: Duration) -> Vec<PacingWarning> {
        let mut warnings = Vec::new();
        if elapsed.as_secs_f64() > 1.5 * self.interval.as_secs_f64() {
            warnings.push(PacingWarning::SlowTick { elapsed });
        }
        let interval_ns = self.interval.as_nanos().max(1);
        let mut whole = (elapsed.as_nanos() / interval_ns) as u32;
        let mut rem = Duration::from_nanos((elapsed.as_nanos() % interval_ns) as u64);
        if whole > MAX_OVERRUN_INTERVALS {
            warnings.push(PacingWarning::Overrun { elapsed });
            whole = 0;
            rem = Duration::ZERO;
        }
        self.wait = self.interval - rem;
        self.actual_loop_interval = self.interval * (whole + 1);
        warnings
    }
}
