//! Small statistics helpers shared by both estimation strategies.
//!
//! These are deliberately plain: the detection threshold adapts through a
//! histogram mode and a population standard deviation over a short signal
//! window, and the optical-flow path rejects mistracked points with a
//! coarse two-sigma cut. Nothing here retains state between calls.

/// Arithmetic mean. Returns 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation. Returns 0.0 for fewer than two samples.
pub fn std_deviation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Most frequent value after rounding to one decimal place.
///
/// Ties resolve to the smallest candidate so the result is deterministic
/// regardless of insertion order. Returns 0.0 for an empty slice.
pub fn top_mode(values: &[f64]) -> f64 {
    use std::collections::HashMap;

    if values.is_empty() {
        return 0.0;
    }

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for v in values {
        let key = (v * 10.0).round() as i64;
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut best_key = 0i64;
    let mut best_count = 0usize;
    for (&key, &count) in &counts {
        if count > best_count || (count == best_count && key < best_key) {
            best_key = key;
            best_count = count;
        }
    }
    best_key as f64 / 10.0
}

/// Indices of magnitudes that sit strictly inside two standard deviations
/// of the batch mean.
///
/// The strict comparison matters: a single far outlier can land exactly on
/// the two-sigma boundary and must still be rejected.
pub fn magnitude_inliers(magnitudes: &[f64]) -> Vec<usize> {
    let m = mean(magnitudes);
    let sigma = std_deviation(magnitudes);
    if sigma == 0.0 {
        return (0..magnitudes.len()).collect();
    }
    magnitudes
        .iter()
        .enumerate()
        .filter(|(_, &v)| (v - m).abs() < 2.0 * sigma)
        .map(|(i, _)| i)
        .collect()
}

/// Two-sigma outlier rejection over a batch of displacement magnitudes.
pub fn filter_magnitudes(magnitudes: &[f64]) -> Vec<f64> {
    magnitude_inliers(magnitudes)
        .into_iter()
        .map(|i| magnitudes[i])
        .collect()
}

/// Absolute error of a measurement against a reference value, in percent.
pub fn error_percentage(measured: f64, actual: f64) -> f64 {
    (measured - actual).abs() / actual * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_deviation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), 5.0);
        assert!((std_deviation(&values) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn top_mode_rounds_to_one_decimal() {
        let values = [0.11, 0.12, 0.14, 0.31, 0.29];
        // 0.11/0.12/0.14 all round to 0.1; 0.31/0.29 round to 0.3.
        assert_eq!(top_mode(&values), 0.1);
    }

    #[test]
    fn top_mode_tie_is_deterministic() {
        let values = [0.2, 0.2, 0.5, 0.5];
        assert_eq!(top_mode(&values), 0.2);
    }

    #[test]
    fn filter_rejects_far_outlier() {
        let filtered = filter_magnitudes(&[1.0, 1.0, 1.0, 1.0, 100.0]);
        assert_eq!(filtered, vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn filter_keeps_uniform_batch() {
        let filtered = filter_magnitudes(&[3.0, 3.0, 3.0]);
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn error_percentage_is_absolute() {
        assert!((error_percentage(9.0, 10.0) - 10.0).abs() < 1e-9);
        assert!((error_percentage(11.0, 10.0) - 10.0).abs() < 1e-9);
    }
}
