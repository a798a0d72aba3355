//! Semi-global block matching on a rectified intensity pair.
//!
//! Matching cost is the block SAD of 8-bit-scaled intensities, computed per
//! disparity with an integral image. Costs are aggregated along 4 or 8 scan
//! directions with the usual `P1`/`P2` smoothness penalties, then the
//! disparity is chosen winner-take-all with a parabolic sub-pixel fit.

use crate::depth::filter::filter_speckles;
use crate::depth::{BilateralConfig, DepthError, DisparityMap};
use crate::frame::GrayImageF32;
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationPaths {
    Four,
    Eight,
}

impl AggregationPaths {
    fn directions(&self) -> &'static [(isize, isize)] {
        match self {
            AggregationPaths::Four => &[(1, 0), (-1, 0), (0, 1), (0, -1)],
            AggregationPaths::Eight => &[
                (1, 0),
                (-1, 0),
                (0, 1),
                (0, -1),
                (1, 1),
                (-1, 1),
                (1, -1),
                (-1, -1),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgmConfig {
    pub min_disparity: i32,
    /// Number of candidate disparities, starting at `min_disparity`.
    pub num_disparities: usize,
    /// Odd matching block side, 3 to 11.
    pub block_size: usize,
    /// Penalty for a disparity change of one pixel between neighbours.
    pub p1: u32,
    /// Penalty for larger disparity changes; must not be below `p1`.
    pub p2: u32,
    pub paths: AggregationPaths,
    /// Percent by which the best cost must beat every non-adjacent candidate.
    pub uniqueness_ratio: u32,
    /// Maximum left-right disparity disagreement in pixels; `None` disables the check.
    pub lr_max_diff: Option<u32>,
    /// Connected regions of at most this many pixels are removed; 0 disables.
    pub speckle_window_size: usize,
    /// Maximum disparity step inside one speckle region; 0 disables.
    pub speckle_range: f32,
    pub bilateral: BilateralConfig,
}

impl Default for SgmConfig {
    fn default() -> Self {
        SgmConfig {
            min_disparity: 0,
            num_disparities: 128,
            block_size: 9,
            p1: 600,
            p2: 2400,
            paths: AggregationPaths::Eight,
            uniqueness_ratio: 2,
            lr_max_diff: Some(20),
            speckle_window_size: 200,
            speckle_range: 25.0,
            bilateral: BilateralConfig::default(),
        }
    }
}

impl SgmConfig {
    pub fn validate(&self) -> Result<(), DepthError> {
        if self.block_size % 2 == 0 || !(3..=11).contains(&self.block_size) {
            return Err(DepthError::InvalidConfig(format!(
                "block size must be odd and within 3..=11, got {}",
                self.block_size
            )));
        }
        if self.num_disparities < 1 {
            return Err(DepthError::InvalidConfig(
                "num_disparities must be at least 1".to_string(),
            ));
        }
        if self.p2 < self.p1 {
            return Err(DepthError::InvalidConfig(format!(
                "P2 ({}) must not be smaller than P1 ({})",
                self.p2, self.p1
            )));
        }
        if self.uniqueness_ratio >= 100 {
            return Err(DepthError::InvalidConfig(
                "uniqueness ratio is a percentage below 100".to_string(),
            ));
        }
        self.bilateral.validate()
    }

    fn disparity(&self, index: usize) -> isize {
        self.min_disparity as isize + index as isize
    }

    /// Candidate indices whose matching column `x - d` lies inside the image.
    fn candidate_range(&self, x: usize, width: usize) -> Option<(usize, usize)> {
        let x = x as isize;
        let lo = (x - (width as isize - 1) - self.min_disparity as isize).max(0);
        let hi = (x - self.min_disparity as isize).min(self.num_disparities as isize - 1);
        (lo <= hi).then_some((lo as usize, hi as usize))
    }
}

fn scaled(image: &GrayImageF32) -> Vec<f32> {
    image.pixels().map(|p| p[0] * 255.0).collect()
}

/// Block SAD for every pixel and candidate, laid out as `(y * width + x) * D + d`.
fn block_costs(left: &[f32], right: &[f32], width: usize, height: usize, config: &SgmConfig) -> Vec<u16> {
    let dn = config.num_disparities;
    let half = (config.block_size / 2) as isize;
    let full_area = (config.block_size * config.block_size) as f64;
    let invalid = (255.0 * full_area).min(u16::MAX as f64) as u16;

    let mut costs = vec![invalid; width * height * dn];
    let mut integral = vec![0f64; (width + 1) * (height + 1)];
    let stride = width + 1;

    for d in 0..dn {
        let shift = config.disparity(d);
        for y in 0..height {
            let mut row_sum = 0.0;
            for x in 0..width {
                let xr = x as isize - shift;
                if (0..width as isize).contains(&xr) {
                    row_sum += (left[y * width + x] - right[y * width + xr as usize]).abs() as f64;
                }
                integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row_sum;
            }
        }

        // Columns whose right-image counterpart exists.
        let col_lo = shift.max(0);
        let col_hi = (width as isize - 1 + shift).min(width as isize - 1);
        if col_lo > col_hi {
            continue;
        }
        for y in 0..height {
            let y0 = (y as isize - half).max(0) as usize;
            let y1 = (y as isize + half).min(height as isize - 1) as usize;
            for x in col_lo as usize..=col_hi as usize {
                let x0 = (x as isize - half).max(col_lo) as usize;
                let x1 = (x as isize + half).min(col_hi) as usize;
                let sum = integral[(y1 + 1) * stride + x1 + 1] - integral[y0 * stride + x1 + 1]
                    - integral[(y1 + 1) * stride + x0]
                    + integral[y0 * stride + x0];
                let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f64;
                let cost = (sum * full_area / area).round().min(invalid as f64);
                costs[(y * width + x) * dn + d] = cost as u16;
            }
        }
    }
    costs
}

/// Sums the path costs `L_r` over all configured directions.
fn aggregate(costs: &[u16], width: usize, height: usize, config: &SgmConfig) -> Vec<u32> {
    let dn = config.num_disparities;
    let (p1, p2) = (config.p1, config.p2);
    let mut total = vec![0u32; costs.len()];

    let mut prev_row = vec![0u32; width * dn];
    let mut cur_row = vec![0u32; width * dn];
    let mut prev_min = vec![0u32; width];
    let mut cur_min = vec![0u32; width];
    let mut previous = vec![0u32; dn];

    for &(dx, dy) in config.paths.directions() {
        for step in 0..height {
            let y = if dy >= 0 { step } else { height - 1 - step };
            for step_x in 0..width {
                let x = if dx >= 0 { step_x } else { width - 1 - step_x };
                let px = x as isize - dx;
                let py = y as isize - dy;
                let base = (y * width + x) * dn;
                let cost = &costs[base..base + dn];

                let has_previous = (0..width as isize).contains(&px) && (0..height as isize).contains(&py);
                let mut min_here = u32::MAX;
                if has_previous {
                    let px = px as usize;
                    let (source, source_min) = if dy == 0 {
                        (&cur_row, cur_min[px])
                    } else {
                        (&prev_row, prev_min[px])
                    };
                    previous.copy_from_slice(&source[px * dn..(px + 1) * dn]);
                    let jump = source_min + p2;
                    for d in 0..dn {
                        let mut best = previous[d].min(jump);
                        if d > 0 {
                            best = best.min(previous[d - 1] + p1);
                        }
                        if d + 1 < dn {
                            best = best.min(previous[d + 1] + p1);
                        }
                        let value = cost[d] as u32 + best - source_min;
                        cur_row[x * dn + d] = value;
                        min_here = min_here.min(value);
                    }
                } else {
                    for d in 0..dn {
                        cur_row[x * dn + d] = cost[d] as u32;
                        min_here = min_here.min(cost[d] as u32);
                    }
                }
                cur_min[x] = min_here;
                for d in 0..dn {
                    total[base + d] += cur_row[x * dn + d];
                }
            }
            if dy != 0 {
                std::mem::swap(&mut prev_row, &mut cur_row);
                std::mem::swap(&mut prev_min, &mut cur_min);
            }
        }
    }
    total
}

/// Winner-take-all on the left view with uniqueness and sub-pixel refinement.
fn select_left(aggregated: &[u32], width: usize, height: usize, config: &SgmConfig) -> Vec<f32> {
    let dn = config.num_disparities;
    let ratio = config.uniqueness_ratio as u64;
    let mut disparity = vec![f32::NAN; width * height];

    for y in 0..height {
        for x in 0..width {
            let Some((lo, hi)) = config.candidate_range(x, width) else {
                continue;
            };
            let base = (y * width + x) * dn;
            let s = &aggregated[base..base + dn];
            let (best_d, best) = (lo..=hi)
                .map(|d| (d, s[d]))
                .min_by_key(|&(_, cost)| cost)
                .unwrap_or((lo, u32::MAX));

            let ambiguous = (lo..=hi).any(|d| {
                d.abs_diff(best_d) > 1 && (s[d] as u64) * (100 - ratio) < (best as u64) * 100
            });
            if ambiguous {
                continue;
            }

            let mut offset = 0.0f32;
            if best_d > lo && best_d < hi {
                let (a, b, c) = (s[best_d - 1] as f32, best as f32, s[best_d + 1] as f32);
                let denom = a + c - 2.0 * b;
                if denom > 0.0 {
                    offset = ((a - c) / (2.0 * denom)).clamp(-0.5, 0.5);
                }
            }
            disparity[y * width + x] = config.disparity(best_d) as f32 + offset;
        }
    }
    disparity
}

/// Integer disparity of the right view from the same cost volume.
fn select_right(aggregated: &[u32], width: usize, height: usize, config: &SgmConfig) -> Vec<Option<isize>> {
    let dn = config.num_disparities;
    let mut disparity = vec![None; width * height];
    for y in 0..height {
        for xr in 0..width {
            let best = (0..dn)
                .filter_map(|d| {
                    let x = xr as isize + config.disparity(d);
                    (0..width as isize)
                        .contains(&x)
                        .then(|| (d, aggregated[(y * width + x as usize) * dn + d]))
                })
                .min_by_key(|&(_, cost)| cost);
            disparity[y * width + xr] = best.map(|(d, _)| config.disparity(d));
        }
    }
    disparity
}

/// Computes the left-view disparity of a rectified pair. Invalid pixels are NaN.
///
/// # Errors
///
/// * [`DepthError::InvalidConfig`] for an invalid configuration.
/// * [`DepthError::SizeMismatch`] if the two images differ in size.
pub fn compute_disparity(
    left: &GrayImageF32,
    right: &GrayImageF32,
    config: &SgmConfig,
) -> Result<DisparityMap, DepthError> {
    config.validate()?;
    if left.dimensions() != right.dimensions() {
        return Err(DepthError::SizeMismatch {
            left: left.dimensions(),
            right: right.dimensions(),
        });
    }
    let (w, h) = left.dimensions();
    let (width, height) = (w as usize, h as usize);

    let costs = block_costs(&scaled(left), &scaled(right), width, height, config);
    let aggregated = aggregate(&costs, width, height, config);
    let mut data = select_left(&aggregated, width, height, config);

    if let Some(max_diff) = config.lr_max_diff {
        let right_disparity = select_right(&aggregated, width, height, config);
        let mut rejected = 0usize;
        for y in 0..height {
            for x in 0..width {
                let value = data[y * width + x];
                if value.is_nan() {
                    continue;
                }
                let xr = x as isize - value.round() as isize;
                if !(0..width as isize).contains(&xr) {
                    continue;
                }
                if let Some(dr) = right_disparity[y * width + xr as usize] {
                    if (value - dr as f32).abs() > max_diff as f32 {
                        data[y * width + x] = f32::NAN;
                        rejected += 1;
                    }
                }
            }
        }
        debug!("Left-right check rejected {} pixels", rejected);
    }

    let mut map = DisparityMap {
        width: w,
        height: h,
        data,
    };
    if config.speckle_window_size > 0 && config.speckle_range > 0.0 {
        filter_speckles(&mut map, config.speckle_window_size, config.speckle_range);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::textured_image;
    use image::DynamicImage;

    fn pair(shift: f64) -> (GrayImageF32, GrayImageF32) {
        let left = DynamicImage::ImageLuma8(textured_image(96, 72, 0.0, 11)).to_luma32f();
        let right = DynamicImage::ImageLuma8(textured_image(96, 72, shift, 11)).to_luma32f();
        (left, right)
    }

    fn config() -> SgmConfig {
        SgmConfig {
            num_disparities: 16,
            block_size: 5,
            paths: AggregationPaths::Four,
            speckle_window_size: 20,
            ..SgmConfig::default()
        }
    }

    #[test]
    fn test_recovers_constant_shift() {
        let (left, right) = pair(6.0);
        let map = compute_disparity(&left, &right, &config()).unwrap();

        assert!(map.valid_fraction() > 0.6, "valid fraction {}", map.valid_fraction());
        let mut errors: Vec<f32> = map.valid_values().map(|d| (d - 6.0).abs()).collect();
        errors.sort_by(|a, b| a.total_cmp(b));
        assert!(errors[errors.len() / 2] < 0.25);
        // Columns left of the shift have no counterpart in the right view.
        assert!(map.get(2, 30).map_or(true, |d| d <= 2.0));
    }

    #[test]
    fn test_eight_paths_match_four() {
        let (left, right) = pair(4.0);
        let eight = SgmConfig {
            paths: AggregationPaths::Eight,
            ..config()
        };
        let map = compute_disparity(&left, &right, &eight).unwrap();
        let inliers = map.valid_values().filter(|d| (d - 4.0).abs() < 0.5).count();
        assert!(inliers as f32 > 0.5 * (96.0 * 72.0));
    }

    #[test]
    fn test_rejects_invalid_config_and_sizes() {
        let (left, right) = pair(0.0);
        let even = SgmConfig {
            block_size: 8,
            ..config()
        };
        assert!(matches!(
            compute_disparity(&left, &right, &even),
            Err(DepthError::InvalidConfig(_))
        ));
        let penalties = SgmConfig {
            p1: 10,
            p2: 5,
            ..config()
        };
        assert!(penalties.validate().is_err());

        let small = GrayImageF32::new(10, 10);
        assert!(matches!(
            compute_disparity(&left, &small, &config()),
            Err(DepthError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_candidate_range() {
        let config = SgmConfig {
            min_disparity: 0,
            num_disparities: 16,
            ..SgmConfig::default()
        };
        assert_eq!(config.candidate_range(0, 100), Some((0, 0)));
        assert_eq!(config.candidate_range(5, 100), Some((0, 5)));
        assert_eq!(config.candidate_range(50, 100), Some((0, 15)));

        let negative = SgmConfig {
            min_disparity: -4,
            num_disparities: 8,
            ..SgmConfig::default()
        };
        assert_eq!(negative.candidate_range(99, 100), Some((4, 7)));
    }
}
