//! Fieldmap post-processing: recentering, demeaning and conversion to Hz

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FmapError, Result};
use crate::metadata::check_delta_te;
use crate::utils::stats::{mean, median, masked_values};
use crate::volume::Volume;

/// Statistic removed by [`demean`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CenterStatistic {
    #[default]
    Mean,
    Median,
}

fn subtract_in_mask(vol: &Volume, mask: Option<&[u8]>, offset: f64) -> Result<Volume> {
    let data = match mask {
        Some(m) => {
            vol.check_mask(m)?;
            vol.data
                .iter()
                .zip(m)
                .map(|(&v, &inside)| if inside > 0 { v - offset } else { 0.0 })
                .collect()
        }
        None => vol.data.iter().map(|&v| if v != 0.0 { v - offset } else { 0.0 }).collect(),
    };
    vol.with_data(data)
}

/// Remove the arbitrary `2πk` offset left by unwrapping
///
/// Subtracts the median of the in-mask voxels (of the nonzero voxels when no
/// mask is given). Voxels outside stay zero.
pub fn recenter(vol: &Volume, mask: Option<&[u8]>) -> Result<Volume> {
    if let Some(m) = mask {
        vol.check_mask(m)?;
    }
    let values = masked_values(&vol.data, mask);
    let centre = median(&values).ok_or(FmapError::EmptyMask)?;
    debug!(median = centre, voxels = values.len(), "recenter");
    subtract_in_mask(vol, mask, centre)
}

/// Subtract the in-mask mean or median
pub fn demean(vol: &Volume, mask: Option<&[u8]>, statistic: CenterStatistic) -> Result<Volume> {
    if let Some(m) = mask {
        vol.check_mask(m)?;
    }
    let values = masked_values(&vol.data, mask);
    let centre = match statistic {
        CenterStatistic::Mean => mean(&values),
        CenterStatistic::Median => median(&values),
    }
    .ok_or(FmapError::EmptyMask)?;
    debug!(?statistic, centre, "demean");
    subtract_in_mask(vol, mask, centre)
}

/// Phase difference (rad) to fieldmap (Hz): `phase / (2π·ΔTE)`
pub fn phdiff_to_fmap(vol: &Volume, delta_te: f64) -> Result<Volume> {
    let delta_te = check_delta_te(delta_te)?;
    let scale = 1.0 / (2.0 * PI * delta_te);
    Ok(vol.map(|v| v * scale))
}
