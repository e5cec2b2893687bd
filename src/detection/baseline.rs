use crate::models::{BehavioralStats, LoginAttempt};

/// Derives a user's behavioral baseline from their recent login history
pub struct BaselineCalculator;

impl BaselineCalculator {
    /// Compute stats over `history`, ordered newest first
    ///
    /// Fewer than two records yields the cold-start (all zero) baseline.
    /// The most common location and device are taken over every record
    /// except the newest one.
    pub fn calculate(history: &[LoginAttempt]) -> BehavioralStats {
        if history.len() < 2 {
            return BehavioralStats::default();
        }

        let intervals: Vec<f64> = history
            .windows(2)
            .map(|pair| pair[0].seconds_since(&pair[1]))
            .collect();

        let (avg_login_interval, std_dev_interval) = mean_and_std_dev(&intervals);

        let older = &history[1..];
        BehavioralStats {
            avg_login_interval,
            std_dev_interval,
            most_common_location: mode(older.iter().map(|a| a.location.as_str())),
            most_common_device: mode(older.iter().map(|a| a.device_id.as_str())),
        }
    }
}

/// Arithmetic mean and population standard deviation
fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Most frequent value; ties go to the value seen first
fn mode<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(key, _)| *key == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (key, count) in counts {
        // strict > keeps the earliest key on ties
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((key, count));
        }
    }
    best.map(|(key, _)| key.to_string()).unwrap_or_default()
}
