//! Scale-invariant keypoints and gradient-histogram descriptors.
//!
//! Lowe's pipeline on a float scale space: Gaussian octaves, difference of
//! Gaussians, 3D extrema refined by a quadratic fit, contrast and edge
//! rejection, dominant orientations and a 4x4x8 descriptor.

use crate::features::{FeatureSet, Keypoint};
use crate::frame::GrayImageF32;
use log::debug;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Assumed blur of the input image.
const INITIAL_SIGMA: f32 = 0.5;
/// Keypoints closer than this to an octave border are discarded.
const IMAGE_BORDER: usize = 5;
const MAX_INTERPOLATION_STEPS: usize = 5;
const ORIENTATION_BINS: usize = 36;
const ORIENTATION_SIGMA_FACTOR: f32 = 1.5;
const ORIENTATION_RADIUS_FACTOR: f32 = 3.0 * ORIENTATION_SIGMA_FACTOR;
const ORIENTATION_PEAK_RATIO: f32 = 0.8;
const DESCRIPTOR_SCALE_FACTOR: f32 = 3.0;
const DESCRIPTOR_MAGNITUDE_CLAMP: f32 = 0.2;
const DESCRIPTOR_INT_FACTOR: f32 = 512.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    /// Keep at most this many keypoints, strongest first; 0 keeps all.
    pub max_features: usize,
    pub octave_layers: usize,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    pub sigma: f32,
    /// Spatial cells per descriptor side.
    pub descriptor_width: usize,
    /// Orientation bins per descriptor cell.
    pub descriptor_bins: usize,
}

impl Default for SiftConfig {
    fn default() -> Self {
        SiftConfig {
            max_features: 0,
            octave_layers: 4,
            contrast_threshold: 0.03,
            edge_threshold: 10.0,
            sigma: 1.6,
            descriptor_width: 4,
            descriptor_bins: 8,
        }
    }
}

impl SiftConfig {
    pub fn descriptor_len(&self) -> usize {
        self.descriptor_width * self.descriptor_width * self.descriptor_bins
    }
}

#[derive(Debug, Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_image(image: &GrayImageF32) -> Self {
        let (w, h) = image.dimensions();
        Plane {
            width: w as usize,
            height: h as usize,
            data: image.as_raw().clone(),
        }
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    fn downsample(&self) -> Plane {
        let (width, height) = (self.width / 2, self.height / 2);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(self.at(2 * x, 2 * y));
            }
        }
        Plane {
            width,
            height,
            data,
        }
    }

    fn subtract(&self, other: &Plane) -> Plane {
        Plane {
            width: self.width,
            height: self.height,
            data: self.data.iter().zip(other.data.iter()).map(|(a, b)| a - b).collect(),
        }
    }

    /// Separable Gaussian blur with reflect-101 borders.
    fn blur(&self, sigma: f32) -> Plane {
        let radius = ((4.0 * sigma).round() as usize).max(1);
        let kernel: Vec<f32> = {
            let raw: Vec<f32> = (0..=2 * radius)
                .map(|i| {
                    let d = i as f32 - radius as f32;
                    (-d * d / (2.0 * sigma * sigma)).exp()
                })
                .collect();
            let sum: f32 = raw.iter().sum();
            raw.into_iter().map(|k| k / sum).collect()
        };

        let mut horizontal = vec![0.0; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                horizontal[y * self.width + x] = kernel
                    .iter()
                    .enumerate()
                    .map(|(i, k)| k * self.at(reflect(x as isize + i as isize - radius as isize, self.width), y))
                    .sum();
            }
        }
        let mut data = vec![0.0; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                data[y * self.width + x] = kernel
                    .iter()
                    .enumerate()
                    .map(|(i, k)| {
                        let yy = reflect(y as isize + i as isize - radius as isize, self.height);
                        k * horizontal[yy * self.width + x]
                    })
                    .sum();
            }
        }
        Plane {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

fn reflect(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let len = len as isize;
    let period = 2 * (len - 1);
    let mut i = index.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as usize
}

struct ScaleSpace {
    gaussians: Vec<Vec<Plane>>,
    dogs: Vec<Vec<Plane>>,
}

impl ScaleSpace {
    fn build(base: Plane, config: &SiftConfig) -> Self {
        let layers = config.octave_layers;
        let min_side = base.width.min(base.height).max(1) as f32;
        let octaves = ((min_side.log2() - 2.0).round() as usize).max(1);

        let k = 2f32.powf(1.0 / layers as f32);
        let mut increments = vec![config.sigma; layers + 3];
        for (i, increment) in increments.iter_mut().enumerate().skip(1) {
            let previous = k.powi(i as i32 - 1) * config.sigma;
            let total = previous * k;
            *increment = (total * total - previous * previous).sqrt();
        }

        let first_blur = (config.sigma * config.sigma - INITIAL_SIGMA * INITIAL_SIGMA).max(0.01).sqrt();
        let mut gaussians: Vec<Vec<Plane>> = Vec::with_capacity(octaves);
        for octave in 0..octaves {
            let mut stack = Vec::with_capacity(layers + 3);
            let start = if octave == 0 {
                base.blur(first_blur)
            } else {
                gaussians[octave - 1][layers].downsample()
            };
            if start.width < 2 * IMAGE_BORDER + 3 || start.height < 2 * IMAGE_BORDER + 3 {
                break;
            }
            stack.push(start);
            for increment in increments.iter().skip(1) {
                let next = stack[stack.len() - 1].blur(*increment);
                stack.push(next);
            }
            gaussians.push(stack);
        }

        let dogs = gaussians
            .iter()
            .map(|stack| stack.windows(2).map(|pair| pair[1].subtract(&pair[0])).collect())
            .collect();
        ScaleSpace { gaussians, dogs }
    }
}

/// Sub-pixel, sub-scale extremum after the quadratic fit.
struct Extremum {
    x: usize,
    y: usize,
    layer: usize,
    offset: Vector3<f32>,
    contrast: f32,
}

fn is_extremum(dogs: &[Plane], layer: usize, x: usize, y: usize, threshold: f32) -> bool {
    let value = dogs[layer].at(x, y);
    if value.abs() <= threshold {
        return false;
    }
    let mut neighbours = (layer - 1..=layer + 1).flat_map(|l| {
        (y - 1..=y + 1).flat_map(move |yy| (x - 1..=x + 1).map(move |xx| (l, xx, yy)))
    });
    if value > 0.0 {
        neighbours.all(|(l, xx, yy)| dogs[l].at(xx, yy) <= value)
    } else {
        neighbours.all(|(l, xx, yy)| dogs[l].at(xx, yy) >= value)
    }
}

fn derivatives(dogs: &[Plane], layer: usize, x: usize, y: usize) -> (Vector3<f32>, Matrix3<f32>) {
    let (c, p, n) = (&dogs[layer], &dogs[layer - 1], &dogs[layer + 1]);
    let v2 = 2.0 * c.at(x, y);
    let gradient = Vector3::new(
        0.5 * (c.at(x + 1, y) - c.at(x - 1, y)),
        0.5 * (c.at(x, y + 1) - c.at(x, y - 1)),
        0.5 * (n.at(x, y) - p.at(x, y)),
    );
    let dxx = c.at(x + 1, y) + c.at(x - 1, y) - v2;
    let dyy = c.at(x, y + 1) + c.at(x, y - 1) - v2;
    let dss = n.at(x, y) + p.at(x, y) - v2;
    let dxy = 0.25 * (c.at(x + 1, y + 1) - c.at(x - 1, y + 1) - c.at(x + 1, y - 1) + c.at(x - 1, y - 1));
    let dxs = 0.25 * (n.at(x + 1, y) - n.at(x - 1, y) - p.at(x + 1, y) + p.at(x - 1, y));
    let dys = 0.25 * (n.at(x, y + 1) - n.at(x, y - 1) - p.at(x, y + 1) + p.at(x, y - 1));
    let hessian = Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss);
    (gradient, hessian)
}

fn localize(dogs: &[Plane], layer: usize, x: usize, y: usize, config: &SiftConfig) -> Option<Extremum> {
    let layers = config.octave_layers;
    let (width, height) = (dogs[0].width, dogs[0].height);
    let (mut x, mut y, mut layer) = (x as isize, y as isize, layer as isize);

    let mut converged = None;
    for _ in 0..MAX_INTERPOLATION_STEPS {
        let (gradient, hessian) = derivatives(dogs, layer as usize, x as usize, y as usize);
        let offset = -hessian.lu().solve(&gradient)?;
        if offset.iter().all(|o| o.abs() < 0.5) {
            converged = Some((gradient, offset));
            break;
        }
        if offset.iter().any(|o| o.abs() > (i32::MAX / 3) as f32) {
            return None;
        }
        x += offset.x.round() as isize;
        y += offset.y.round() as isize;
        layer += offset.z.round() as isize;
        if layer < 1
            || layer > layers as isize
            || x < IMAGE_BORDER as isize
            || x >= (width - IMAGE_BORDER) as isize
            || y < IMAGE_BORDER as isize
            || y >= (height - IMAGE_BORDER) as isize
        {
            return None;
        }
    }
    let (gradient, offset) = converged?;
    let (x, y, layer) = (x as usize, y as usize, layer as usize);

    let contrast = dogs[layer].at(x, y) + 0.5 * gradient.dot(&offset);
    if contrast.abs() * (layers as f32) < config.contrast_threshold {
        return None;
    }

    let (_, hessian) = derivatives(dogs, layer, x, y);
    let trace = hessian[(0, 0)] + hessian[(1, 1)];
    let det = hessian[(0, 0)] * hessian[(1, 1)] - hessian[(0, 1)] * hessian[(1, 0)];
    let edge = config.edge_threshold;
    if det <= 0.0 || trace * trace * edge >= (edge + 1.0) * (edge + 1.0) * det {
        return None;
    }

    Some(Extremum {
        x,
        y,
        layer,
        offset,
        contrast,
    })
}

#[inline]
fn gradient_at(image: &Plane, x: usize, y: usize) -> (f32, f32) {
    (
        image.at(x + 1, y) - image.at(x - 1, y),
        image.at(x, y + 1) - image.at(x, y - 1),
    )
}

/// Dominant gradient directions (radians) around `(x, y)` at scale `scale`.
fn orientations(image: &Plane, x: usize, y: usize, scale: f32) -> Vec<f32> {
    let radius = (ORIENTATION_RADIUS_FACTOR * scale).round() as isize;
    let weight_factor = -1.0 / (2.0 * (ORIENTATION_SIGMA_FACTOR * scale).powi(2));
    let mut histogram = [0f32; ORIENTATION_BINS];

    for dy in -radius..=radius {
        let yy = y as isize + dy;
        if yy <= 0 || yy >= image.height as isize - 1 {
            continue;
        }
        for dx in -radius..=radius {
            let xx = x as isize + dx;
            if xx <= 0 || xx >= image.width as isize - 1 {
                continue;
            }
            let (gx, gy) = gradient_at(image, xx as usize, yy as usize);
            let magnitude = (gx * gx + gy * gy).sqrt();
            let angle = gy.atan2(gx).rem_euclid(2.0 * PI);
            let weight = (((dx * dx + dy * dy) as f32) * weight_factor).exp();
            let bin = ((angle * ORIENTATION_BINS as f32 / (2.0 * PI)).round() as usize) % ORIENTATION_BINS;
            histogram[bin] += weight * magnitude;
        }
    }

    let n = ORIENTATION_BINS;
    let smoothed: Vec<f32> = (0..n)
        .map(|i| {
            let at = |offset: isize| histogram[(i as isize + offset).rem_euclid(n as isize) as usize];
            (at(-2) + at(2)) / 16.0 + (at(-1) + at(1)) * 4.0 / 16.0 + at(0) * 6.0 / 16.0
        })
        .collect();
    let peak = smoothed.iter().copied().fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return Vec::new();
    }

    (0..n)
        .filter_map(|i| {
            let left = smoothed[(i + n - 1) % n];
            let right = smoothed[(i + 1) % n];
            let value = smoothed[i];
            if value > left && value > right && value >= ORIENTATION_PEAK_RATIO * peak {
                let shift = 0.5 * (left - right) / (left - 2.0 * value + right);
                let bin = (i as f32 + shift).rem_euclid(n as f32);
                Some(bin * 2.0 * PI / n as f32)
            } else {
                None
            }
        })
        .collect()
}

/// Rotated, Gaussian-weighted histogram of gradients with trilinear binning.
fn descriptor(image: &Plane, x: usize, y: usize, angle: f32, scale: f32, config: &SiftConfig) -> Vec<f32> {
    let d = config.descriptor_width;
    let n = config.descriptor_bins;
    let hist_width = DESCRIPTOR_SCALE_FACTOR * scale;
    let diagonal = ((image.width * image.width + image.height * image.height) as f32).sqrt();
    let radius = ((hist_width * std::f32::consts::SQRT_2 * (d as f32 + 1.0) * 0.5).round()).min(diagonal) as isize;
    let (cos_t, sin_t) = (angle.cos() / hist_width, angle.sin() / hist_width);
    let bins_per_radian = n as f32 / (2.0 * PI);
    let exp_scale = -1.0 / (d as f32 * d as f32 * 0.5);

    let stride_c = n + 2;
    let stride_r = (d + 2) * stride_c;
    let mut hist = vec![0f32; (d + 2) * stride_r];

    for i in -radius..=radius {
        for j in -radius..=radius {
            // Sample offset expressed in the keypoint's rotated frame, in cells.
            let c_rot = j as f32 * cos_t + i as f32 * sin_t;
            let r_rot = -(j as f32) * sin_t + i as f32 * cos_t;
            let rbin = r_rot + d as f32 / 2.0 - 0.5;
            let cbin = c_rot + d as f32 / 2.0 - 0.5;
            if rbin <= -1.0 || rbin >= d as f32 || cbin <= -1.0 || cbin >= d as f32 {
                continue;
            }
            let (xx, yy) = (x as isize + j, y as isize + i);
            if xx <= 0 || yy <= 0 || xx >= image.width as isize - 1 || yy >= image.height as isize - 1 {
                continue;
            }
            let (gx, gy) = gradient_at(image, xx as usize, yy as usize);
            let magnitude = (gx * gx + gy * gy).sqrt()
                * ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let obin = (gy.atan2(gx) - angle).rem_euclid(2.0 * PI) * bins_per_radian;

            let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
            let (dr, dc, dob) = (rbin - r0, cbin - c0, obin - o0);
            let o0 = (o0 as usize) % n;
            // Shifted by one so that cell -1 lands in the padding row/column.
            let (r0, c0) = ((r0 + 1.0) as usize, (c0 + 1.0) as usize);

            for (ri, wr) in [(0, 1.0 - dr), (1, dr)] {
                for (ci, wc) in [(0, 1.0 - dc), (1, dc)] {
                    for (oi, wo) in [(0, 1.0 - dob), (1, dob)] {
                        let index = (r0 + ri) * stride_r + (c0 + ci) * stride_c + o0 + oi;
                        hist[index] += magnitude * wr * wc * wo;
                    }
                }
            }
        }
    }

    let mut values = Vec::with_capacity(d * d * n);
    for r in 1..=d {
        for c in 1..=d {
            let base = r * stride_r + c * stride_c;
            // Orientation bin `n` wraps around to bin 0.
            for o in 0..n {
                let wrapped = if o == 0 { hist[base + n] } else { 0.0 };
                values.push(hist[base + o] + wrapped);
            }
        }
    }

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    let clamp = DESCRIPTOR_MAGNITUDE_CLAMP * norm;
    values.iter_mut().for_each(|v| *v = v.min(clamp));
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
    values
        .iter()
        .map(|v| (v * DESCRIPTOR_INT_FACTOR / norm).min(255.0))
        .collect()
}

/// Detects keypoints and computes their descriptors.
pub fn detect_and_compute(image: &GrayImageF32, config: &SiftConfig) -> FeatureSet {
    let (width, height) = image.dimensions();
    if (width as usize) < 2 * IMAGE_BORDER + 3 || (height as usize) < 2 * IMAGE_BORDER + 3 {
        return FeatureSet::default();
    }

    let layers = config.octave_layers;
    let space = ScaleSpace::build(Plane::from_image(image), config);
    let threshold = 0.5 * config.contrast_threshold / layers as f32;

    let mut found: Vec<(Keypoint, Vec<f32>)> = Vec::new();
    for (octave, (gaussians, dogs)) in space.gaussians.iter().zip(space.dogs.iter()).enumerate() {
        let (w, h) = (dogs[0].width, dogs[0].height);
        let octave_scale = 2f32.powi(octave as i32);
        for layer in 1..=layers {
            for y in IMAGE_BORDER..h - IMAGE_BORDER {
                for x in IMAGE_BORDER..w - IMAGE_BORDER {
                    if !is_extremum(dogs, layer, x, y, threshold) {
                        continue;
                    }
                    let Some(extremum) = localize(dogs, layer, x, y, config) else {
                        continue;
                    };
                    let scale = config.sigma
                        * 2f32.powf((extremum.layer as f32 + extremum.offset.z) / layers as f32);
                    let smoothed = &gaussians[extremum.layer];
                    for angle in orientations(smoothed, extremum.x, extremum.y, scale) {
                        let keypoint = Keypoint {
                            x: (extremum.x as f32 + extremum.offset.x) * octave_scale,
                            y: (extremum.y as f32 + extremum.offset.y) * octave_scale,
                            size: 2.0 * scale * octave_scale,
                            angle,
                            response: extremum.contrast.abs(),
                            octave,
                        };
                        let values = descriptor(smoothed, extremum.x, extremum.y, angle, scale, config);
                        found.push((keypoint, values));
                    }
                }
            }
        }
    }

    found.sort_by(|a, b| b.0.response.total_cmp(&a.0.response));
    if config.max_features > 0 {
        found.truncate(config.max_features);
    }
    debug!("Detected {} keypoints on a {}x{} image", found.len(), width, height);

    let (keypoints, descriptors) = found.into_iter().unzip();
    FeatureSet {
        keypoints,
        descriptors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{match_features, MatcherConfig};
    use crate::test_utils::textured_image;
    use image::{imageops, DynamicImage};

    fn image(shift: f64) -> GrayImageF32 {
        DynamicImage::ImageLuma8(textured_image(160, 120, shift, 21)).to_luma32f()
    }

    #[test]
    fn test_reflect_border() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(-2, 5), 2);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(2, 5), 2);
        assert_eq!(reflect(3, 1), 0);
    }

    #[test]
    fn test_detects_features_with_normalized_descriptors() {
        let config = SiftConfig::default();
        let features = detect_and_compute(&image(0.0), &config);
        assert!(features.len() > 20, "only {} keypoints", features.len());
        for (keypoint, descriptor) in features.keypoints.iter().zip(features.descriptors.iter()) {
            assert_eq!(descriptor.len(), config.descriptor_len());
            assert!(descriptor.iter().all(|v| (0.0..=255.0).contains(v)));
            assert!(keypoint.x >= 0.0 && keypoint.x < 160.0);
            assert!(keypoint.y >= 0.0 && keypoint.y < 120.0);
            assert!(keypoint.size > 0.0);
        }
        assert!(features
            .keypoints
            .windows(2)
            .all(|pair| pair[0].response >= pair[1].response));

        let limited = detect_and_compute(&image(0.0), &SiftConfig { max_features: 10, ..config });
        assert_eq!(limited.len(), 10);
    }

    #[test]
    fn test_uniform_image_has_no_features() {
        let flat = GrayImageF32::from_pixel(64, 48, image::Luma([0.5]));
        assert!(detect_and_compute(&flat, &SiftConfig::default()).is_empty());
        let tiny = GrayImageF32::from_pixel(8, 8, image::Luma([0.5]));
        assert!(detect_and_compute(&tiny, &SiftConfig::default()).is_empty());
    }

    #[test]
    fn test_descriptors_survive_rotation() {
        let original = DynamicImage::ImageLuma8(textured_image(120, 120, 0.0, 5));
        let rotated = DynamicImage::ImageLuma8(imageops::rotate90(&original.to_luma8()));
        let config = SiftConfig::default();
        let a = detect_and_compute(&original.to_luma32f(), &config);
        let b = detect_and_compute(&rotated.to_luma32f(), &config);

        let matches = match_features(&a, &b, &MatcherConfig::default());
        let consistent = matches
            .point_pairs(&a, &b)
            .iter()
            .filter(|(p, q)| ((119.0 - p.y) - q.x).abs() < 1.5 && (p.x - q.y).abs() < 1.5)
            .count();
        assert!(consistent >= 10, "{} of {} matches consistent", consistent, matches.len());
    }
}
