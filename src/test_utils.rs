//! Synthetic rigs, targets and images shared by the unit tests.

use crate::calibration::{CalibrationSample, PlanarTarget};
use crate::camera::{CameraProfile, Intrinsics, RadTanModel, Resolution};
use image::{GrayImage, ImageFormat, Luma};
use nalgebra::{Isometry3, Point3, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::io::Cursor;

pub fn resolution() -> Resolution {
    Resolution {
        width: 640,
        height: 480,
    }
}

pub fn left_model() -> RadTanModel {
    RadTanModel {
        intrinsics: Intrinsics {
            fx: 800.0,
            fy: 790.0,
            cx: 318.0,
            cy: 242.0,
        },
        resolution: resolution(),
        distortions: [-0.12, 0.06, 0.0008, -0.0006, 0.0],
    }
}

pub fn right_model() -> RadTanModel {
    RadTanModel {
        intrinsics: Intrinsics {
            fx: 805.0,
            fy: 798.0,
            cx: 325.0,
            cy: 236.0,
        },
        resolution: resolution(),
        distortions: [-0.10, 0.04, -0.0005, 0.0007, 0.0],
    }
}

/// Reference-to-right-camera transform of the synthetic rig (millimetres).
pub fn rig_extrinsics() -> Isometry3<f64> {
    Isometry3::new(Vector3::new(-60.0, 0.5, 1.0), Vector3::new(0.0, 0.02, 0.0))
}

pub fn left_profile() -> CameraProfile {
    CameraProfile::new(0, left_model())
}

pub fn right_profile() -> CameraProfile {
    let mut profile = CameraProfile::new(1, right_model());
    profile.set_extrinsics(&rig_extrinsics());
    profile
}

/// Target-to-reference-camera poses that keep the whole target inside both views.
pub fn board_poses() -> Vec<Isometry3<f64>> {
    let target = PlanarTarget::default();
    let layouts = [
        (0.30, 0.00, 0.05, 30.0, 0.0, 480.0),
        (-0.30, 0.00, -0.05, 20.0, 10.0, 496.0),
        (0.00, 0.30, 0.10, 35.0, -10.0, 464.0),
        (0.00, -0.30, -0.10, 25.0, 5.0, 512.0),
        (0.25, 0.25, 0.00, 30.0, -15.0, 480.0),
        (-0.25, 0.25, 0.05, 15.0, 15.0, 520.0),
        (0.25, -0.25, -0.05, 40.0, 0.0, 488.0),
        (-0.25, -0.25, 0.00, 30.0, 10.0, 472.0),
        (0.15, -0.30, 0.15, 20.0, -5.0, 504.0),
        (-0.35, 0.10, -0.10, 35.0, 5.0, 480.0),
        (0.10, 0.35, 0.00, 25.0, 0.0, 496.0),
        (0.20, 0.05, 0.20, 30.0, -10.0, 456.0),
        (-0.10, -0.20, -0.15, 30.0, 15.0, 528.0),
        (0.30, -0.10, 0.00, 20.0, 0.0, 480.0),
        (-0.20, 0.30, 0.10, 40.0, -5.0, 512.0),
    ];
    layouts
        .iter()
        .map(|&(rx, ry, rz, x, y, z)| {
            let rotation = Isometry3::rotation(Vector3::new(rx, ry, rz));
            let center = rotation.transform_point(&Point3::from(target.center())).coords;
            Isometry3::new(Vector3::new(x, y, z) - center, Vector3::new(rx, ry, rz))
        })
        .collect()
}

/// Observes the target in every pose, dropping poses that leave the image.
pub fn observe_all(
    target: &PlanarTarget,
    model: &RadTanModel,
    poses: &[Isometry3<f64>],
) -> Vec<CalibrationSample> {
    poses
        .iter()
        .filter_map(|pose| target.observe(model, pose))
        .collect()
}

/// Index-aligned samples of the synthetic two-camera rig.
pub fn observe_rig(target: &PlanarTarget) -> (Vec<CalibrationSample>, Vec<CalibrationSample>) {
    let extrinsics = rig_extrinsics();
    let mut left = Vec::new();
    let mut right = Vec::new();
    for pose in board_poses() {
        let seen_left = target.observe(&left_model(), &pose);
        let seen_right = target.observe(&right_model(), &(extrinsics * pose));
        if let (Some(l), Some(r)) = (seen_left, seen_right) {
            left.push(l);
            right.push(r);
        }
    }
    (left, right)
}

/// Smooth random texture made of Gaussian blobs, sampled at `(x + shift_x, y)`.
pub fn textured_image(width: u32, height: u32, shift_x: f64, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let (w, h) = (width as usize, height as usize);
    let blob_count = (w * h / 12).max(1);
    let mut canvas = vec![128.0f64; w * h];

    for _ in 0..blob_count {
        let bx = rng.gen_range(-20.0..width as f64 + 40.0);
        let by = rng.gen_range(-20.0..height as f64 + 20.0);
        let sigma: f64 = rng.gen_range(1.2..3.5);
        let amplitude = rng.gen_range(-70.0..70.0);
        let reach = 4.0 * sigma;

        if bx - shift_x + reach < 0.0 || by + reach < 0.0 {
            continue;
        }
        let x_lo = (bx - shift_x - reach).floor().max(0.0) as usize;
        let x_hi = ((bx - shift_x + reach).ceil() as usize).min(w - 1);
        let y_lo = (by - reach).floor().max(0.0) as usize;
        let y_hi = ((by + reach).ceil() as usize).min(h - 1);
        for y in y_lo..=y_hi {
            for x in x_lo..=x_hi {
                let d2 = (x as f64 + shift_x - bx).powi(2) + (y as f64 - by).powi(2);
                canvas[y * w + x] += amplitude * (-d2 / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        Luma([canvas[y as usize * w + x as usize].round().clamp(0.0, 255.0) as u8])
    })
}

pub fn encode_png(image: &GrayImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

#[test]
fn test_synthetic_rig_sees_every_pose() {
    let (left, right) = observe_rig(&PlanarTarget::default());
    assert_eq!(left.len(), 15);
    assert_eq!(right.len(), 15);
}
