//! Histogram thresholds for magnitude images

/// Otsu's method: the bin edge maximising between-class variance
///
/// All values take part, zeros included, over a `num_bins` histogram spanning
/// `[min, max]`.
pub fn otsu_threshold(data: &[f64], num_bins: usize) -> f64 {
    let finite = data.iter().copied().filter(|v| v.is_finite());
    let (min_val, max_val) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if num_bins == 0 || min_val > max_val {
        return 0.0;
    }
    if max_val - min_val < 1e-10 {
        return min_val;
    }

    let bin_width = (max_val - min_val) / num_bins as f64;
    let mut histogram = vec![0usize; num_bins];
    for v in data.iter().copied().filter(|v| v.is_finite()) {
        let bin = (((v - min_val) / bin_width).floor() as usize).min(num_bins - 1);
        histogram[bin] += 1;
    }

    let total: f64 = histogram.iter().sum::<usize>() as f64;
    let sum_total: f64 = histogram.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();

    let mut sum_bg = 0.0;
    let mut weight_bg = 0.0;
    let mut best = (0.0, 0usize);

    for (t, &c) in histogram.iter().enumerate() {
        weight_bg += c as f64;
        if weight_bg == 0.0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0.0 {
            break;
        }
        sum_bg += t as f64 * c as f64;

        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (sum_total - sum_bg) / weight_fg;
        let variance = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);
        if variance > best.0 {
            best = (variance, t);
        }
    }

    min_val + best.1 as f64 * bin_width
}
