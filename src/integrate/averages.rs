use std::collections::VecDeque;

/// Window lengths of the displayed rolling averages, seconds.
pub const AVERAGE_SECS: [u32; 3] = [3, 30, 60];

/// Fixed-length moving mean.
#[derive(Clone, Debug)]
pub struct RollingAverage {
    window: VecDeque<f64>,
    window_size: usize,
}

impl RollingAverage {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        RollingAverage { window: VecDeque::with_capacity(window_size), window_size }
    }

    /// Push a sample and return the mean of the current window.
    pub fn apply(&mut self, value: f64) -> f64 {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// 3 s / 30 s / 60 s means of one quantity.
#[derive(Clone, Debug)]
pub struct RollingAverages {
    windows: [RollingAverage; 3],
}

impl RollingAverages {
    pub fn new(interval_secs: f64) -> Self {
        let ticks = |secs: u32| (secs as f64 / interval_secs).round().max(1.0) as usize;
        Self { windows: AVERAGE_SECS.map(|s| RollingAverage::new(ticks(s))) }
    }

    pub fn push(&mut self, value: f64) {
        for w in &mut self.windows {
            w.apply(value);
        }
    }

    pub fn means(&self) -> [Option<f64>; 3] {
        [self.windows[0].mean(), self.windows[1].mean(), self.windows[2].mean()]
    }
}
