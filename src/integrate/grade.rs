use std::collections::VecDeque;

/// Shift register of the last `range` per-tick deltas. `None` marks a slot
/// never filled or a delta that could not be computed.
#[derive(Clone, Debug)]
struct DiffWindow {
    values: VecDeque<Option<f64>>,
}

impl DiffWindow {
    fn new(range: usize) -> Self {
        Self { values: std::iter::repeat(None).take(range.max(1)).collect() }
    }

    fn push(&mut self, v: Option<f64>) {
        self.values.pop_front();
        self.values.push_back(v);
    }

    fn tail(&self, n: usize) -> impl Iterator<Item = &Option<f64>> {
        self.values.iter().skip(self.values.len().saturating_sub(n))
    }

    /// Sum of the last `n` known values.
    fn sum_known(&self, n: usize) -> f64 {
        self.tail(n).flatten().sum()
    }

    /// Mean of the last `n`; unknown if any of them is unknown.
    fn mean(&self, n: usize) -> Option<f64> {
        let tail: Option<Vec<f64>> = self.tail(n).copied().collect();
        let tail = tail?;
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().sum::<f64>() / tail.len() as f64)
    }
}

/// Where the distance increments of a grade estimate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceSource {
    /// Wheel sensor; distance is along the slope
    Ant,
    /// GPS; distance is horizontal
    Gps,
}

/// Percent grade, truncated toward zero, with |g| < 1.5 flattened to 0.
pub fn conv_grade(g: f64) -> i32 {
    if g > -1.5 && g < 1.5 {
        0
    } else {
        g.trunc() as i32
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GradeEstimate {
    pub grade: Option<i32>,
    pub glide_ratio: Option<i32>,
}

/// Smoothed grade and glide ratio from distance/altitude increments.
#[derive(Clone, Debug)]
pub struct GradeEstimator {
    window_size: usize,
    alt: DiffWindow,
    dst: DiffWindow,
    alt_spd: DiffWindow,
    dst_spd: DiffWindow,
    pre: GradeEstimate,
    pre_spd: Option<i32>,
}

impl GradeEstimator {
    pub fn new(range: usize, window_size: usize) -> Self {
        Self {
            window_size,
            alt: DiffWindow::new(range),
            dst: DiffWindow::new(range),
            alt_spd: DiffWindow::new(range),
            dst_spd: DiffWindow::new(range),
            pre: GradeEstimate::default(),
            pre_spd: None,
        }
    }

    /// Distance-based grade. `dst_diff` is this tick's distance increment from
    /// `source`; a zero increment while running holds the previous estimate.
    pub fn update(
        &mut self,
        dst_diff: f64,
        alt_diff: Option<f64>,
        source: DistanceSource,
        running: bool,
    ) -> GradeEstimate {
        if dst_diff > 0.0 {
            self.alt.push(alt_diff);
            self.dst.push(Some(dst_diff));
            let y = self.alt.sum_known(self.window_size);
            let d = self.dst.sum_known(self.window_size);
            let x = match source {
                DistanceSource::Ant => (d * d - y * y).abs().sqrt(),
                DistanceSource::Gps => d,
            };
            let grade = (x > 0.0).then(|| conv_grade(100.0 * y / x));
            let glide_ratio = (y != 0.0).then(|| (-x / y).round() as i32);
            self.pre = GradeEstimate { grade, glide_ratio };
            self.pre
        } else if running {
            self.pre
        } else {
            GradeEstimate::default()
        }
    }

    /// Speed-based grade from `speed × loop interval` increments, for wheel sensors.
    pub fn update_speed(&mut self, dst_diff: f64, alt_diff: Option<f64>) -> Option<i32> {
        self.alt_spd.push(alt_diff);
        self.dst_spd.push(Some(dst_diff));
        let window = self.window_size;
        let grade = match (self.dst_spd.mean(window), self.alt_spd.mean(window)) {
            (Some(d), Some(y)) => {
                let x = d * d - y * y;
                (x > 0.0).then(|| conv_grade(100.0 * y / x.sqrt()))
            }
            _ => None,
        };
        self.pre_spd = grade;
        grade
    }

    /// No speed sensor this tick.
    pub fn hold_speed(&self, running: bool) -> Option<i32> {
        if running { self.pre_spd } else { None }
    }
}
