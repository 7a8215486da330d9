//! Running round-trip statistics.
//!
//! Only counts and the first two power sums are stored. Mean and standard
//! deviation are derived from them when asked for:
//!
//! mean = S1 / n
//!
//! stddev = sqrt(S2 / n - mean ^ 2)

use std::fmt::Write as _;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub transmitted: u64,
    pub received: u64,
    pub errors: u64,
    pub min: f64,
    pub max: f64,
    sum: f64,
    sum_squares: f64,
}

/// Derived latency figures, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finalized {
    pub mean: f64,
    pub stddev: f64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transmit(&mut self) {
        self.transmitted += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Records one successful reply.
    pub fn record_latency(&mut self, ms: f64) {
        self.received += 1;

        // The first sample seeds min
        if self.received == 1 || ms < self.min {
            self.min = ms;
        }
        if ms > self.max {
            self.max = ms;
        }

        self.sum += ms;
        self.sum_squares += ms * ms;
    }

    /// `None` until at least one reply was received.
    pub fn finalize(&self) -> Option<Finalized> {
        if self.received == 0 {
            return None;
        }
        let n = self.received as f64;
        let mean = self.sum / n;
        // Rounding can push the variance a hair below zero
        let variance = (self.sum_squares / n - mean * mean).max(0.0);
        Some(Finalized {
            mean,
            stddev: variance.sqrt(),
        })
    }

    pub fn loss_percent(&self) -> f64 {
        if self.transmitted == 0 {
            return 0.0;
        }
        self.transmitted.saturating_sub(self.received) as f64 / self.transmitted as f64 * 100.0
    }

    /// The closing report, one line per `\n`.
    pub fn summary(&self, target: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "--- {} ping statistics ---", target);
        let _ = writeln!(
            out,
            "{} packets transmitted, {} received, {} errors, {:.1}% packet loss",
            self.transmitted,
            self.received,
            self.errors,
            self.loss_percent()
        );
        if let Some(fin) = self.finalize() {
            let _ = writeln!(
                out,
                "round-trip min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
                self.min, fin.mean, self.max, fin.stddev
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_run() {
        let stats = Statistics::new();
        assert_eq!(stats.finalize(), None);
        assert_eq!(stats.loss_percent(), 0.0);
        assert_eq!(
            stats.summary("example.org"),
            "--- example.org ping statistics ---\n\
             0 packets transmitted, 0 received, 0 errors, 0.0% packet loss\n"
        );
    }

    #[test]
    fn test_all_lost() {
        let mut stats = Statistics::new();
        for _ in 0..3 {
            stats.record_transmit();
            stats.record_error();
        }
        assert_eq!(stats.loss_percent(), 100.0);
        assert!(!stats.summary("h").contains("round-trip"));
    }

    #[test]
    fn test_min_seeded_by_first_sample() {
        let mut stats = Statistics::new();
        stats.record_transmit();
        stats.record_latency(12.5);
        assert_eq!(stats.min, 12.5);
        assert_eq!(stats.max, 12.5);
        stats.record_transmit();
        stats.record_latency(3.0);
        assert_eq!(stats.min, 3.0);
        assert_eq!(stats.max, 12.5);
    }

    #[test]
    fn test_mean_and_stddev() {
        let mut stats = Statistics::new();
        for ms in [10.0, 20.0, 30.0, 40.0] {
            stats.record_transmit();
            stats.record_latency(ms);
        }
        stats.record_transmit();
        stats.record_error();

        let fin = stats.finalize().unwrap();
        assert_eq!(fin.mean, 25.0);
        assert!((fin.stddev - 125f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.loss_percent(), 20.0);
        assert!(stats.summary("h").ends_with(
            "5 packets transmitted, 4 received, 1 errors, 20.0% packet loss\n\
             round-trip min/avg/max/stddev = 10.000/25.000/40.000/11.180 ms\n"
        ));
    }

    #[test]
    fn test_identical_samples_have_no_spread() {
        let mut stats = Statistics::new();
        for _ in 0..10 {
            stats.record_transmit();
            stats.record_latency(0.1);
        }
        let fin = stats.finalize().unwrap();
        assert!(!fin.stddev.is_nan());
        assert!(fin.stddev < 1e-6);
    }

    #[test]
    fn test_loss_one_decimal() {
        let mut stats = Statistics::new();
        for _ in 0..3 {
            stats.record_transmit();
        }
        stats.record_latency(1.0);
        assert!(stats.summary("h").contains("66.7% packet loss"));
    }
}
