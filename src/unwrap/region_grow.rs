//! Quality-guided region growing
//!
//! Voxels are unwrapped one edge at a time, best edge first. An edge's
//! quality combines how small the wrapped phase step is with how similar the
//! two magnitudes are (the two ROMEO weights that need only a single echo).
//! Each connected mask component is grown from the voxel closest to its own
//! centroid, so every in-mask voxel is reached.

use std::f64::consts::PI;

use tracing::debug;

use super::{check_inputs, PhaseUnwrapper};
use crate::error::{Dims, Result};
use crate::phase::wrap_to_pi;
use crate::priority_queue::BucketQueue;
use crate::utils::mask::{components, neighbours6};
use crate::volume::{coords3d, Volume};

const TWO_PI: f64 = 2.0 * PI;
const N_BINS: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct RegionGrowUnwrapper;

/// Edge quality in `1..=255`; never zero so every in-mask edge is usable
fn edge_weight(phase: &[f64], magnitude: &[f64], a: usize, b: usize) -> usize {
    let phase_coherence = 1.0 - wrap_to_pi(phase[a] - phase[b]).abs() / PI;

    let (ma, mb) = (magnitude[a].abs(), magnitude[b].abs());
    let mag_coherence = match ma.max(mb) {
        hi if hi > 0.0 && hi.is_finite() => ma.min(mb) / hi,
        _ => 1.0,
    };

    let quality = (phase_coherence * mag_coherence).clamp(0.0, 1.0);
    1 + (quality * (N_BINS - 2) as f64).round() as usize
}

/// Component voxel nearest the component's centroid
fn seed_of(component: &[usize], dims: Dims) -> usize {
    let (nx, ny, _) = dims;
    let n = component.len() as f64;
    let centroid = component.iter().fold((0.0, 0.0, 0.0), |acc, &idx| {
        let (i, j, k) = coords3d(idx, nx, ny);
        (acc.0 + i as f64 / n, acc.1 + j as f64 / n, acc.2 + k as f64 / n)
    });
    let dist2 = |idx: usize| {
        let (i, j, k) = coords3d(idx, nx, ny);
        (i as f64 - centroid.0).powi(2) + (j as f64 - centroid.1).powi(2) + (k as f64 - centroid.2).powi(2)
    };
    component
        .iter()
        .copied()
        .min_by(|&a, &b| dist2(a).total_cmp(&dist2(b)))
        .unwrap_or(component[0])
}

/// Grow from `seed` over voxels with `state == 1`, marking them 2 once unwrapped
///
/// Returns the number of voxels unwrapped, seed included.
pub fn grow_region(
    phase: &mut [f64],
    magnitude: &[f64],
    state: &mut [u8],
    dims: Dims,
    seed: usize,
) -> usize {
    if state[seed] != 1 {
        return 0;
    }
    // queue items are (target, reference)
    let mut queue: BucketQueue<(usize, usize)> = BucketQueue::new(N_BINS);
    state[seed] = 2;
    let mut processed = 1;

    for n in neighbours6(seed, dims) {
        if state[n] == 1 {
            queue.push(edge_weight(phase, magnitude, seed, n), (n, seed));
        }
    }

    while let Some((target, reference)) = queue.pop() {
        if state[target] != 1 {
            continue;
        }
        let wraps = ((phase[target] - phase[reference]) / TWO_PI).round();
        phase[target] -= TWO_PI * wraps;
        state[target] = 2;
        processed += 1;

        for n in neighbours6(target, dims) {
            if state[n] == 1 {
                queue.push(edge_weight(phase, magnitude, target, n), (n, target));
            }
        }
    }

    processed
}

impl PhaseUnwrapper for RegionGrowUnwrapper {
    fn name(&self) -> &'static str {
        "region-grow"
    }

    fn unwrap(&self, magnitude: &Volume, phase: &Volume, mask: &[u8]) -> Result<Volume> {
        let mask = check_inputs(magnitude, phase, mask)?;
        let dims = phase.dims;

        let mut state = mask.clone();
        let mut unwrapped = phase.data.clone();

        let parts = components(&state, dims, 1);
        for part in &parts {
            let seed = seed_of(part, dims);
            let n = grow_region(&mut unwrapped, &magnitude.data, &mut state, dims, seed);
            debug!(seed, voxels = n, "grew region");
        }
        debug!(components = parts.len(), "region growing done");

        for (v, &m) in unwrapped.iter_mut().zip(&mask) {
            if m == 0 {
                *v = 0.0;
            }
        }
        phase.with_data(unwrapped)
    }
}
