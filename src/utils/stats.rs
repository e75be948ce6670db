//! Robust summary statistics over voxel subsets

/// Median of a slice (average of the two middle values for even lengths)
///
/// Ordering is `f64::total_cmp`, so positive NaNs sort above `+inf`; filter
/// them out first (see [`masked_values`]). Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut buf = values.to_vec();
    Some(median_inplace(&mut buf))
}

/// Median that reorders the buffer instead of copying it
pub fn median_inplace(buf: &mut [f64]) -> f64 {
    let n = buf.len();
    let mid = n / 2;
    let (lower, upper, _) = buf.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower_max = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lower_max + upper)
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Finite values of `data` where `mask` is set, or all finite nonzero values
/// without a mask
pub fn masked_values(data: &[f64], mask: Option<&[u8]>) -> Vec<f64> {
    match mask {
        Some(m) => data
            .iter()
            .zip(m)
            .filter(|(v, &m)| m > 0 && v.is_finite())
            .map(|(&v, _)| v)
            .collect(),
        None => data.iter().copied().filter(|&v| v != 0.0 && v.is_finite()).collect(),
    }
}

/// Nearest-rank percentile of pre-sorted data, `p` in [0, 1]
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_masked_values() {
        let data = [1.0, 0.0, 3.0, 4.0];
        assert_eq!(masked_values(&data, None), vec![1.0, 3.0, 4.0]);
        assert_eq!(masked_values(&data, Some(&[0, 1, 1, 0])), vec![0.0, 3.0]);
    }

    #[test]
    fn test_masked_values_skip_non_finite() {
        let data = [1.0, f64::NAN, 3.0, f64::NEG_INFINITY];
        assert_eq!(masked_values(&data, Some(&[1, 1, 1, 1])), vec![1.0, 3.0]);
        assert_eq!(masked_values(&data, None), vec![1.0, 3.0]);
    }

    #[test]
    fn test_median_with_nan_is_deterministic() {
        // positive NaN sorts above every number under total ordering
        assert_eq!(median(&[f64::NAN, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[5.0, -1.0, f64::INFINITY, 0.0, f64::NAN]), Some(5.0));
    }

    #[test]
    fn test_percentile() {
        let sorted: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(percentile(&sorted, 0.5), 50.0);
        assert_eq!(percentile(&sorted, 1.0), 99.0);
    }
}
