//! Small descriptive statistics over RTT series.

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Percentile with linear interpolation between the closest ranks
/// (`rank = p * (n - 1)`), `percentile` in [0, 100].
pub fn percentile(samples: &[f64], percentile: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    if samples.len() == 1 {
        return Some(samples[0]);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    let rank = (percentile / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    let fraction = rank - lower as f64;

    Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[10.0, 20.0, 30.0]), Some(20.0));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_p95_interpolates() {
        let samples: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        // rank = 0.95 * 19 = 18.05
        let p95 = percentile(&samples, 95.0).unwrap();
        assert!((p95 - 19.05).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[42.0], 95.0), Some(42.0));
        assert_eq!(percentile(&[], 95.0), None);
        assert_eq!(percentile(&[3.0, 1.0, 2.0], 0.0), Some(1.0));
        assert_eq!(percentile(&[3.0, 1.0, 2.0], 100.0), Some(3.0));
        assert_eq!(percentile(&[5.0, 1.0], 50.0), Some(3.0));
    }
}
