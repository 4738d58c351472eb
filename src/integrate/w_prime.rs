//! W′ balance: remaining anaerobic work capacity above critical power.
//!
//! Waterworth integrates the above-CP excess with an exponential kernel whose
//! time constant follows the mean sub-CP power. The differential model depletes
//! linearly above CP and recovers proportionally to the deficit below it.

use crate::config::WPrimeAlgorithm;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WPrimeState {
    /// J
    pub balance: f64,
    /// balance / W′ in percent, one decimal
    pub normalized: f64,
    pub power_sum: f64,
    pub power_count: u64,
    pub mean_under_cp: f64,
    /// s
    pub t: f64,
    pub sum: f64,
    /// s
    pub tau: f64,
}

#[derive(Clone, Debug)]
pub struct WPrimeBalance {
    cp: f64,
    w_prime: f64,
    algorithm: WPrimeAlgorithm,
    interval: f64,
    state: WPrimeState,
}

fn tau_for(cp: f64, mean_under_cp: f64) -> f64 {
    546.0 * (-0.01 * (cp - mean_under_cp)).exp() + 316.0
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

impl WPrimeBalance {
    pub fn new(cp: f64, w_prime: f64, algorithm: WPrimeAlgorithm, interval_secs: f64) -> Self {
        let mut w = Self {
            cp,
            w_prime,
            algorithm,
            interval: interval_secs,
            state: Self::initial(cp, w_prime),
        };
        w.reset();
        w
    }

    fn initial(cp: f64, w_prime: f64) -> WPrimeState {
        WPrimeState {
            balance: w_prime,
            normalized: 100.0,
            power_sum: 0.0,
            power_count: 0,
            mean_under_cp: 0.0,
            t: 0.0,
            sum: 0.0,
            tau: tau_for(cp, 0.0),
        }
    }

    pub fn reset(&mut self) {
        self.state = Self::initial(self.cp, self.w_prime);
    }

    pub fn state(&self) -> WPrimeState {
        self.state
    }

    /// Advance one tick at `power` watts.
    pub fn update(&mut self, power: f64) -> WPrimeState {
        let s = &mut self.state;
        match self.algorithm {
            WPrimeAlgorithm::Waterworth => {
                if power < self.cp {
                    s.power_sum += power;
                    s.power_count += 1;
                    s.mean_under_cp = s.power_sum / s.power_count as f64;
                    s.tau = tau_for(self.cp, s.mean_under_cp);
                }
                s.sum += (power - self.cp).max(0.0) * (s.t / s.tau).exp();
                s.t += self.interval;
                s.balance = self.w_prime - s.sum * (-s.t / s.tau).exp();
            }
            WPrimeAlgorithm::Differential => {
                let deficit = self.cp - power;
                if deficit < 0.0 {
                    s.balance += deficit;
                } else {
                    s.balance += deficit * (self.w_prime - s.balance) / self.w_prime;
                }
            }
        }
        s.normalized = round1(s.balance / self.w_prime * 100.0);
        *s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_initial_tau() {
        let w = WPrimeBalance::new(150.0, 15000.0, WPrimeAlgorithm::Waterworth, 1.0);
        assert_relative_eq!(w.state().tau, 546.0 * (-1.5f64).exp() + 316.0);
        assert_eq!(w.state().normalized, 100.0);
    }

    #[test]
    fn test_waterworth_depletes_strictly_above_cp() {
        let mut w = WPrimeBalance::new(150.0, 15000.0, WPrimeAlgorithm::Waterworth, 1.0);
        let mut prev = w.state().normalized;
        for _ in 0..10 {
            let s = w.update(200.0);
            assert!(s.normalized < prev, "{} !< {}", s.normalized, prev);
            prev = s.normalized;
        }
        assert_relative_eq!(w.state().balance, 15000.0 - 500.0, epsilon = 15.0);
    }

    #[test]
    fn test_waterworth_steady_at_cp() {
        let mut w = WPrimeBalance::new(150.0, 15000.0, WPrimeAlgorithm::Waterworth, 1.0);
        for _ in 0..30 {
            w.update(150.0);
        }
        assert_eq!(w.state().balance, 15000.0);
        assert_eq!(w.state().normalized, 100.0);
    }

    #[test]
    fn test_waterworth_recovers_below_cp() {
        let mut w = WPrimeBalance::new(150.0, 15000.0, WPrimeAlgorithm::Waterworth, 1.0);
        for _ in 0..60 {
            w.update(300.0);
        }
        let low = w.state().balance;
        for _ in 0..60 {
            w.update(50.0);
        }
        assert!(w.state().balance > low);
        assert_relative_eq!(w.state().mean_under_cp, 50.0);
    }

    #[test]
    fn test_differential() {
        let mut w = WPrimeBalance::new(150.0, 15000.0, WPrimeAlgorithm::Differential, 1.0);
        w.update(250.0);
        assert_eq!(w.state().balance, 14900.0);
        assert_eq!(w.state().normalized, 99.3);
        w.update(150.0);
        assert_eq!(w.state().balance, 14900.0);
        // recovery scales with the remaining deficit
        w.update(50.0);
        assert_relative_eq!(w.state().balance, 14900.0 + 100.0 * 100.0 / 15000.0);
    }
}
