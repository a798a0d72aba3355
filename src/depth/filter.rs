//! Post-processing of disparity and depth maps.

use crate::depth::{DepthError, DepthMap, DisparityMap};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Invalidates 4-connected regions of at most `max_region` pixels, where
/// neighbours belong to one region if their disparities differ by at most `max_diff`.
pub fn filter_speckles(map: &mut DisparityMap, max_region: usize, max_diff: f32) -> usize {
    let (width, height) = (map.width as usize, map.height as usize);
    let mut visited = vec![false; width * height];
    let mut region = Vec::new();
    let mut queue = VecDeque::new();
    let mut removed = 0;

    for start in 0..width * height {
        if visited[start] || map.data[start].is_nan() {
            continue;
        }
        visited[start] = true;
        region.clear();
        queue.push_back(start);
        while let Some(index) = queue.pop_front() {
            region.push(index);
            let (x, y) = (index % width, index / width);
            let value = map.data[index];
            let neighbours = [
                (x > 0).then(|| index - 1),
                (x + 1 < width).then(|| index + 1),
                (y > 0).then(|| index - width),
                (y + 1 < height).then(|| index + width),
            ];
            for next in neighbours.into_iter().flatten() {
                if !visited[next] && !map.data[next].is_nan() && (map.data[next] - value).abs() <= max_diff {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }
        if region.len() <= max_region {
            for &index in &region {
                map.data[index] = f32::NAN;
            }
            removed += region.len();
        }
    }
    removed
}

/// Edge-preserving smoothing parameters (OpenCV `bilateralFilter` conventions).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BilateralConfig {
    pub enabled: bool,
    /// Neighbourhood diameter in pixels.
    pub diameter: usize,
    /// Range kernel width, in depth units.
    pub sigma_color: f32,
    /// Spatial kernel width, in pixels.
    pub sigma_space: f32,
}

impl Default for BilateralConfig {
    fn default() -> Self {
        BilateralConfig {
            enabled: true,
            diameter: 9,
            sigma_color: 75.0,
            sigma_space: 75.0,
        }
    }
}

impl BilateralConfig {
    pub fn validate(&self) -> Result<(), DepthError> {
        if self.diameter == 0 || self.sigma_color <= 0.0 || self.sigma_space <= 0.0 {
            return Err(DepthError::InvalidConfig(
                "bilateral diameter and sigmas must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bilateral filter over the valid pixels of a depth map.
///
/// Invalid pixels stay invalid and never contribute to their neighbours.
pub fn bilateral_filter(depth: &DepthMap, config: &BilateralConfig) -> DepthMap {
    let (width, height) = (depth.width as usize, depth.height as usize);
    let radius = (config.diameter / 2) as isize;
    let space_coeff = -0.5 / (config.sigma_space * config.sigma_space);
    let color_coeff = -0.5 / (config.sigma_color * config.sigma_color);

    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f32;
            if r2 <= (radius * radius) as f32 {
                offsets.push((dx, dy, (r2 * space_coeff).exp()));
            }
        }
    }

    let mut data = vec![f32::NAN; width * height];
    for y in 0..height {
        for x in 0..width {
            let center = depth.data[y * width + x];
            if center.is_nan() {
                continue;
            }
            let (mut sum, mut weights) = (0.0f32, 0.0f32);
            for &(dx, dy, spatial) in &offsets {
                let (nx, ny) = (x as isize + dx, y as isize + dy);
                if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                    continue;
                }
                let value = depth.data[ny as usize * width + nx as usize];
                if value.is_nan() {
                    continue;
                }
                let diff = value - center;
                let weight = spatial * (diff * diff * color_coeff).exp();
                sum += weight * value;
                weights += weight;
            }
            data[y * width + x] = sum / weights;
        }
    }
    DepthMap {
        width: depth.width,
        height: depth.height,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_speckles_are_removed() {
        let mut data = vec![10.0f32; 20 * 10];
        // Small island with a very different disparity.
        for (x, y) in [(5, 5), (6, 5), (5, 6)] {
            data[y * 20 + x] = 40.0;
        }
        data[0] = f32::NAN;
        let mut map = DisparityMap {
            width: 20,
            height: 10,
            data,
        };
        let removed = filter_speckles(&mut map, 5, 2.0);
        assert_eq!(removed, 3);
        assert!(map.get(5, 5).is_none());
        assert_eq!(map.get(10, 2), Some(10.0));
        assert_eq!(map.valid_count(), 200 - 4);
    }

    #[test]
    fn test_bilateral_preserves_edges_and_holes() {
        let (width, height) = (16u32, 8u32);
        let mut data: Vec<f32> = (0..width * height)
            .map(|i| if i % width < 8 { 1000.0 } else { 3000.0 })
            .collect();
        data[(3 * width + 2) as usize] = f32::NAN;
        data[(4 * width + 3) as usize] = 1010.0;
        let depth = DepthMap { width, height, data };

        let filtered = bilateral_filter(&depth, &BilateralConfig::default());
        assert!(filtered.get(2, 3).is_none());
        // The noisy pixel is pulled toward its plateau.
        assert!((filtered.get(3, 4).unwrap() - 1000.0).abs() < 10.0);
        // Far plateaus stay apart across the step.
        assert_relative_eq!(filtered.get(7, 0).unwrap(), 1000.0, epsilon = 1.0);
        assert_relative_eq!(filtered.get(8, 0).unwrap(), 3000.0, epsilon = 1.0);
    }
}
