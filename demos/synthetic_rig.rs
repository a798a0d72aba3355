//! Synthetic Rig Demo
//!
//! Simulates a multi-camera rig looking at a planar calibration target,
//! calibrates it, refines it with bundle adjustment and runs one
//! reconstruction pass on a synthetic textured frame pair.
//!
//! Usage:
//! ```bash
//! cargo run --example synthetic_rig -- --cameras 3 --noise 0.2
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use image::{GrayImage, ImageFormat, Luma};
use log::{error, info, warn};
use multicam_recon::calibration::PlanarTarget;
use multicam_recon::camera::{Intrinsics, RadTanModel, Resolution};
use multicam_recon::pipeline::{Pipeline, PipelineConfig};
use multicam_recon::util;
use nalgebra::{Isometry3, Point3, Vector2, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::io::Cursor;
use std::path::PathBuf;

/// Multi-camera calibration and reconstruction on a simulated rig
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of cameras in the rig
    #[arg(short = 'n', long, default_value_t = 2)]
    cameras: usize,

    /// Standard deviation of the corner detection noise in pixels
    #[arg(long, default_value_t = 0.1)]
    noise: f64,

    /// Number of target poses shown to the rig
    #[arg(short = 's', long, default_value_t = 20)]
    samples: usize,

    /// Optional pipeline configuration (YAML); missing fields take defaults
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Seed of the simulation
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// Lens of camera `index`; neighbouring cameras differ slightly.
fn simulated_model(index: usize, resolution: Resolution) -> RadTanModel {
    let offset = index as f64;
    RadTanModel {
        intrinsics: Intrinsics {
            fx: 800.0 + 4.0 * offset,
            fy: 795.0 + 3.0 * offset,
            cx: resolution.width as f64 / 2.0 - 2.0 + offset,
            cy: resolution.height as f64 / 2.0 + 1.5 - offset,
        },
        resolution,
        distortions: [-0.11 + 0.01 * offset, 0.05, 0.0005, -0.0004, 0.0],
    }
}

/// Reference-to-camera transform; cameras sit on a 60 mm line.
fn simulated_extrinsics(index: usize) -> Isometry3<f64> {
    Isometry3::new(
        Vector3::new(-60.0 * index as f64, 0.3 * index as f64, 0.5),
        Vector3::new(0.0, 0.015 * index as f64, 0.0),
    )
}

fn random_board_pose(target: &PlanarTarget, rng: &mut StdRng) -> Isometry3<f64> {
    let axis = Vector3::new(
        rng.gen_range(-0.35..0.35),
        rng.gen_range(-0.35..0.35),
        rng.gen_range(-0.15..0.15),
    );
    let rotation = Isometry3::rotation(axis);
    let center = rotation.transform_point(&Point3::from(target.center())).coords;
    let placement = Vector3::new(
        rng.gen_range(-20.0..50.0),
        rng.gen_range(-20.0..20.0),
        rng.gen_range(460.0..540.0),
    );
    Isometry3::new(placement - center, axis)
}

/// Box-Muller normal sample.
fn gaussian(rng: &mut StdRng, sigma: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn textured_png(width: u32, height: u32, shift_x: f64, seed: u64) -> Result<Vec<u8>, image::ImageError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let blobs: Vec<(f64, f64, f64, f64)> = (0..(width * height / 12))
        .map(|_| {
            (
                rng.gen_range(-20.0..width as f64 + 40.0),
                rng.gen_range(-20.0..height as f64 + 20.0),
                rng.gen_range(1.2..3.5),
                rng.gen_range(-70.0..70.0),
            )
        })
        .collect();
    let image = GrayImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as f64 + shift_x, y as f64);
        let value = blobs
            .iter()
            .filter(|(bx, by, sigma, _)| (x - bx).abs() < 4.0 * sigma && (y - by).abs() < 4.0 * sigma)
            .map(|(bx, by, sigma, amplitude)| {
                amplitude * (-((x - bx).powi(2) + (y - by).powi(2)) / (2.0 * sigma * sigma)).exp()
            })
            .sum::<f64>();
        Luma([(128.0 + value).round().clamp(0.0, 255.0) as u8])
    });
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from_yaml(path)?,
        None => PipelineConfig::default(),
    };
    config.camera_count = cli.cameras;
    config.sgm.num_disparities = 32;
    let pipeline = Pipeline::with_config(config)?;
    let config = pipeline.config().clone();
    info!(
        "Simulating {} cameras at {}x{}",
        config.camera_count, config.width, config.height
    );

    // Step 1: observe the target from every camera.
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let models: Vec<RadTanModel> = config
        .camera_ids()
        .into_iter()
        .map(|id| simulated_model(id, config.resolution()))
        .collect();
    let mut shown = 0;
    while shown < cli.samples {
        let pose = random_board_pose(&config.target, &mut rng);
        let views: Option<Vec<_>> = models
            .iter()
            .enumerate()
            .map(|(id, model)| config.target.observe(model, &(simulated_extrinsics(id) * pose)))
            .collect();
        // Samples stay index-aligned across cameras, so every camera must see the target.
        let Some(views) = views else {
            continue;
        };
        for (id, view) in views.into_iter().enumerate() {
            let noisy: Vec<Vector2<f64>> = view
                .points
                .iter()
                .map(|p| p + Vector2::new(gaussian(&mut rng, cli.noise), gaussian(&mut rng, cli.noise)))
                .collect();
            pipeline.add_calibration_sample(id, noisy)?;
        }
        shown += 1;
    }
    info!("Calibration samples per camera: {:?}", pipeline.sample_counts());

    // Step 2: calibrate and refine.
    let report = pipeline.run_calibration()?;
    for (id, result) in &report.intrinsics {
        match result {
            Ok(summary) => info!("Camera {}: {}", id, summary.error),
            Err(e) => error!("Camera {}: {}", id, e),
        }
    }
    for (id, result) in &report.extrinsics {
        match result {
            Ok(stereo) => info!(
                "Camera {}: baseline {:.2} mm, RMS {:.4} px",
                id, stereo.baseline(), stereo.error.rmse
            ),
            Err(e) => error!("Camera {}: {}", id, e),
        }
    }
    if !report.is_complete() {
        warn!("Calibration is incomplete");
    }

    match pipeline.run_bundle_adjustment() {
        Ok(optimization) => {
            info!(
                "Bundle adjustment: RMS {:.4} -> {:.4} px",
                optimization.initial_rms, optimization.final_rms
            );
            for (id, reason) in &optimization.fixed {
                warn!("Camera {} held fixed: {}", id, reason);
            }
            if !optimization.published {
                warn!("Bundle adjustment result was superseded and not published");
            }
        }
        Err(e) => {
            error!("Bundle adjustment failed: {}", e);
            info!("Continuing with the linear calibration...");
        }
    }

    let state = pipeline.calibration_snapshot();
    for (id, profile) in &state.profiles {
        let truth = &models[*id].intrinsics;
        info!(
            "Camera {}: fx {:.2} (true {:.2}), fy {:.2} (true {:.2})",
            id, profile.model.intrinsics.fx, truth.fx, profile.model.intrinsics.fy, truth.fy
        );
    }

    // Step 3: one reconstruction pass on a shifted texture.
    let (left, right) = config.primary_pair;
    let timestamp = 1.0;
    pipeline.submit_frame(left, &textured_png(config.width, config.height, 0.0, cli.seed)?, timestamp)?;
    pipeline.submit_frame(
        right,
        &textured_png(config.width, config.height, 10.0, cli.seed)?,
        timestamp + 0.002,
    )?;
    let result = pipeline.process_frame_set()?;
    for issue in &result.issues {
        warn!("{}", issue);
    }
    if let Some(dense) = &result.measurement.dense {
        info!(
            "Dense depth: {:.1} mm (95% band {:.1} .. {:.1}) over {} pixels",
            dense.mean, dense.lower_95, dense.upper_95, dense.count
        );
    }
    if let Some(sparse) = &result.measurement.sparse {
        info!(
            "Sparse depth: {:.1} mm (95% band {:.1} .. {:.1}) over {} points",
            sparse.mean, sparse.lower_95, sparse.upper_95, sparse.count
        );
    }

    // Step 4: export.
    util::ensure_output_dir()?;
    pipeline.save_calibration("output/synthetic_rig_calibration.yaml")?;
    util::export_json(&report, "output/synthetic_rig_report.json")?;
    if let Some(reconstruction) = &result.reconstruction {
        util::export_points_csv(&reconstruction.points, "output/synthetic_rig_points.csv")?;
    }
    info!("Results written to output/");

    pipeline.shutdown();
    Ok(())
}
