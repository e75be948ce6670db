//! Separable box-filter smoothing
//!
//! Repeated box filters approximate a Gaussian (MriResearchTools.jl
//! `gaussiansmooth3d`). Three flavours of line filter are used:
//! plain, weighted, and NaN-aware (for smoothing inside a mask).

use crate::error::Dims;

/// Box widths whose `n` repeated passes approximate a Gaussian of `sigma` voxels
pub fn box_sizes(sigma: f64, n: usize) -> Vec<usize> {
    if sigma <= 0.0 || n == 0 {
        return vec![0; n];
    }

    let wideal = ((12.0 * sigma * sigma / n as f64) + 1.0).sqrt();

    // next lower odd width, and the odd width above it
    let wl = (wideal - (wideal + 1.0) % 2.0).round() as usize;
    let wl = if wl % 2 == 0 { wl + 1 } else { wl };
    let wu = wl + 2;

    let (wl_f, n_f) = (wl as f64, n as f64);
    let mideal = (12.0 * sigma * sigma - n_f * wl_f * wl_f - 4.0 * n_f * wl_f - 3.0 * n_f)
        / (-4.0 * wl_f - 4.0);
    let m = mideal.round().max(0.0) as usize;

    (0..n).map(|i| if i < m { wl } else { wu }).collect()
}

/// Force widths odd and no larger than half the axis length
fn clamp_box_sizes(sizes: &mut [Vec<usize>; 3], dims: Dims) {
    let lens = [dims.0, dims.1, dims.2];
    for (axis, widths) in sizes.iter_mut().enumerate() {
        let max_size = lens[axis] / 2;
        let max_odd = if max_size % 2 == 0 { max_size + 1 } else { max_size };
        for w in widths.iter_mut() {
            if *w % 2 == 0 {
                *w += 1;
            }
            if *w > max_size {
                *w = max_odd;
            }
        }
    }
}

/// Visit every line of voxels along `axis` as a list of flat indices
pub(crate) fn for_each_line<F>(dims: Dims, axis: usize, reverse: bool, mut f: F)
where
    F: FnMut(&[usize]),
{
    let (nx, ny, nz) = dims;
    let len = [nx, ny, nz][axis];
    let stride = [1, nx, nx * ny][axis];
    let mut indices = Vec::with_capacity(len);

    for start in 0..nx * ny * nz {
        let coord = match axis {
            0 => start % nx,
            1 => (start / nx) % ny,
            _ => start / (nx * ny),
        };
        if coord != 0 {
            continue;
        }
        indices.clear();
        indices.extend((0..len).map(|t| start + t * stride));
        if reverse {
            indices.reverse();
        }
        f(&indices);
    }
}

/// Running-mean box filter, window shrinks at the edges
pub fn box_filter_line(line: &mut [f64], boxsize: usize) {
    let n = line.len();
    if boxsize < 3 || n < boxsize {
        return;
    }
    let r = boxsize / 2;
    let orig = line.to_vec();

    let mut lsum: f64 = orig[..r].iter().sum();
    for i in 0..=r {
        lsum += orig[i + r];
        line[i] = lsum / (r + i + 1) as f64;
    }
    for i in (r + 1)..(n - r) {
        lsum += orig[i + r] - orig[i - r - 1];
        line[i] = lsum / boxsize as f64;
    }
    for i in (n - r)..n {
        lsum -= orig[i - r - 1];
        line[i] = lsum / (r + n - i) as f64;
    }
}

/// Weighted running mean; the weights are smoothed alongside the values
fn box_filter_line_weighted(line: &mut [f64], weight: &mut [f64], boxsize: usize) {
    let n = line.len();
    if boxsize < 3 || n < boxsize {
        return;
    }
    let r = boxsize / 2;
    let (lo, wo) = (line.to_vec(), weight.to_vec());

    // start just above zero so the divisions below are always defined
    let mut sum = f64::EPSILON;
    let mut wsum = f64::EPSILON;
    let mut wsmooth = f64::EPSILON;
    for i in 0..boxsize {
        sum += lo[i] * wo[i];
        wsum += wo[i];
        wsmooth += wo[i] * wo[i];
    }

    for i in (r + 1)..(n - r) {
        let (l, w) = (lo[i + r], wo[i + r]);
        let (lold, wold) = (lo[i - r - 1], wo[i - r - 1]);
        sum += l * w - lold * wold;
        wsum += w - wold;
        wsmooth += w * w - wold * wold;
        line[i] = sum / wsum;
        weight[i] = wsmooth / wsum;
    }
}

#[derive(PartialEq, Clone, Copy)]
enum NanMode {
    Nan,
    Normal,
    Fill,
}

/// Box filter that skips NaN runs and extrapolates across short gaps
fn nan_box_filter_line(line: &mut [f64], boxsize: usize) {
    let n = line.len();
    if boxsize < 3 || n < boxsize {
        return;
    }
    let r = boxsize / 2;
    let max_fills = r;

    let mut orig = vec![f64::NAN; n + boxsize - 1];
    orig[r..r + n].copy_from_slice(line);

    let mut lsum: f64 = orig[(r + 1)..=(2 * r)].iter().filter(|v| !v.is_nan()).sum();
    let mut n_fills = 0usize;
    let mut n_valid = 0usize;
    let mut mode = NanMode::Nan;

    for i in 0..n {
        let incoming_nan = orig[i + 2 * r].is_nan();
        match mode {
            NanMode::Normal if incoming_nan => mode = NanMode::Fill,
            NanMode::Normal => {}
            NanMode::Nan => {
                n_valid = if incoming_nan { 0 } else { n_valid + 1 };
                if n_valid == boxsize {
                    mode = NanMode::Normal;
                    lsum = orig[i..=(i + 2 * r)].iter().sum();
                    line[i] = lsum / boxsize as f64;
                    continue;
                }
            }
            NanMode::Fill if incoming_nan => {
                n_fills += 1;
                if n_fills > max_fills {
                    mode = NanMode::Nan;
                    n_fills = 0;
                    n_valid = 0;
                    lsum = 0.0;
                }
            }
            NanMode::Fill => {
                mode = NanMode::Normal;
                n_fills = 0;
            }
        }

        match mode {
            NanMode::Normal => {
                if i > 0 {
                    lsum += orig[i + 2 * r] - orig[i - 1];
                }
                line[i] = lsum / boxsize as f64;
            }
            NanMode::Fill => {
                if i > 0 {
                    lsum -= orig[i - 1];
                }
                line[i] = (lsum - orig[i]) / (boxsize - 2) as f64;

                let extrapolated = if i >= r { 2.0 * line[i] - line[i - r] } else { line[i] };
                orig[i + 2 * r] = extrapolated;
                if i + r < n {
                    line[i + r] = extrapolated;
                }
                lsum += extrapolated;
            }
            NanMode::Nan => {}
        }
    }
}

/// Gaussian smoothing by repeated box filters
///
/// * `sigma` - per-axis sigma in voxels
/// * `mask` - voxels outside are treated as NaN gaps (NaN-aware filtering,
///   alternating direction on odd passes)
/// * `weight` - per-voxel weights, smoothed in place; ignored with a mask
/// * `nbox` - number of passes
pub fn gaussian_smooth_3d(
    data: &[f64],
    sigma: [f64; 3],
    mask: Option<&[u8]>,
    mut weight: Option<&mut [f64]>,
    nbox: usize,
    dims: Dims,
) -> Vec<f64> {
    let mut result = data.to_vec();
    if let Some(m) = mask {
        for (v, &inside) in result.iter_mut().zip(m) {
            if inside == 0 {
                *v = f64::NAN;
            }
        }
    }

    let mut sizes = [box_sizes(sigma[0], nbox), box_sizes(sigma[1], nbox), box_sizes(sigma[2], nbox)];
    clamp_box_sizes(&mut sizes, dims);
    let lens = [dims.0, dims.1, dims.2];

    let mut line = Vec::new();
    let mut wline = Vec::new();
    for pass in 0..nbox {
        for axis in 0..3 {
            let bsize = sizes[axis][pass];
            if lens[axis] <= 1 || bsize < 3 {
                continue;
            }
            let reverse = mask.is_some() && pass % 2 == 1;

            for_each_line(dims, axis, reverse, |indices| {
                line.clear();
                line.extend(indices.iter().map(|&i| result[i]));

                if mask.is_some() {
                    nan_box_filter_line(&mut line, bsize);
                } else if let Some(w) = weight.as_deref_mut() {
                    wline.clear();
                    wline.extend(indices.iter().map(|&i| w[i]));
                    box_filter_line_weighted(&mut line, &mut wline, bsize);
                    for (&i, &v) in indices.iter().zip(wline.iter()) {
                        w[i] = v;
                    }
                } else {
                    box_filter_line(&mut line, bsize);
                }

                for (&i, &v) in indices.iter().zip(line.iter()) {
                    result[i] = v;
                }
            });
        }
    }

    result
}

/// Smoothing with explicit per-axis box widths and no masking
pub fn smooth_with_box_sizes(data: &[f64], sizes: &[Vec<usize>; 3], dims: Dims) -> Vec<f64> {
    let mut result = data.to_vec();
    let lens = [dims.0, dims.1, dims.2];
    let passes = sizes.iter().map(|s| s.len()).max().unwrap_or(0);

    let mut line = Vec::new();
    for pass in 0..passes {
        for axis in 0..3 {
            let Some(&bsize) = sizes[axis].get(pass) else { continue };
            if lens[axis] <= 1 || bsize < 3 {
                continue;
            }
            for_each_line(dims, axis, false, |indices| {
                line.clear();
                line.extend(indices.iter().map(|&i| result[i]));
                box_filter_line(&mut line, bsize);
                for (&i, &v) in indices.iter().zip(line.iter()) {
                    result[i] = v;
                }
            });
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_sizes_odd() {
        let sizes = box_sizes(5.0, 3);
        assert_eq!(sizes.len(), 3);
        for &s in &sizes {
            assert!(s % 2 == 1, "box size should be odd, got {}", s);
            assert!((3..=11).contains(&s));
        }
        assert_eq!(box_sizes(0.0, 2), vec![0, 0]);
    }

    #[test]
    fn test_box_filter_keeps_constant() {
        let mut line = vec![2.5; 12];
        box_filter_line(&mut line, 5);
        assert!(line.iter().all(|&v| (v - 2.5).abs() < 1e-12));
    }

    #[test]
    fn test_box_filter_preserves_linear_interior() {
        let mut line: Vec<f64> = (0..10).map(|i| i as f64).collect();
        box_filter_line(&mut line, 3);
        for i in 1..9 {
            assert!((line[i] - i as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn test_for_each_line_covers_volume() {
        let dims = (3, 4, 5);
        for axis in 0..3 {
            let mut seen = vec![0u8; 60];
            for_each_line(dims, axis, false, |indices| {
                for &i in indices {
                    seen[i] += 1;
                }
            });
            assert!(seen.iter().all(|&c| c == 1), "axis {} not covered once", axis);
        }
    }

    #[test]
    fn test_smoothing_constant_volume() {
        let dims = (8, 8, 8);
        let data = vec![1.0; 512];
        let smoothed = gaussian_smooth_3d(&data, [2.0, 2.0, 2.0], None, None, 3, dims);
        assert!(smoothed.iter().all(|&v| (v - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_masked_smoothing_stays_finite_inside() {
        let dims = (10, 10, 10);
        let data = vec![3.0; 1000];
        let mask = vec![1u8; 1000];
        let smoothed = gaussian_smooth_3d(&data, [1.5, 1.5, 1.5], Some(&mask), None, 4, dims);
        assert!(smoothed.iter().all(|v| v.is_finite()));
        assert!(smoothed.iter().all(|&v| (v - 3.0).abs() < 1e-9));
    }
}
