use argh::FromArgs;
use std::path::PathBuf;
use std::str::FromStr;

use glam::DMat4;
use kornia_3d::{pointcloud::PointCloud, transforms};
use kornia_registration::{
    estimation::TransformationEstimation,
    global::{
        registration_fgr_based_on_feature_matching,
        registration_ransac_based_on_feature_matching, CorrespondenceChecker,
        FastGlobalRegistrationOption, Features, RansacParams,
    },
    registration_multi_scale_icp, ICPConvergenceCriteria, MultiScaleStage, RegistrationResult,
    VoxelDownsampler,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const DESCRIPTOR_DIMENSION: usize = 16;

/// Global registration used to initialize ICP.
#[derive(Debug, Clone, Copy, PartialEq)]
enum GlobalMethod {
    Ransac,
    Fgr,
}

impl FromStr for GlobalMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ransac" => Ok(Self::Ransac),
            "fgr" => Ok(Self::Fgr),
            _ => Err(format!("unknown global method `{s}`, expected `ransac` or `fgr`")),
        }
    }
}

#[derive(FromArgs)]
/// Register a synthetic scan against its transformed copy: global registration
/// from noisy descriptors, then multi-scale ICP.
struct Args {
    /// global registration method, `ransac` or `fgr`
    #[argh(option, default = "GlobalMethod::Ransac")]
    method: GlobalMethod,

    /// number of samples per cube face side
    #[argh(option, default = "20")]
    steps: usize,

    /// standard deviation of the point noise
    #[argh(option, default = "0.002")]
    noise: f64,

    /// fraction of source descriptors replaced by random ones
    #[argh(option, default = "0.3")]
    outlier_ratio: f64,

    /// random seed of the synthetic scene
    #[argh(option, default = "0")]
    seed: u64,

    /// optional JSON file overriding the registration parameters
    #[argh(option)]
    config: Option<PathBuf>,

    /// optional path to write the final result as JSON
    #[argh(option)]
    output: Option<PathBuf>,
}

/// Registration parameters, loadable from JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct DemoConfig {
    ransac: RansacParams,
    fgr: FastGlobalRegistrationOption,
    ransac_distance: f64,
    estimation: TransformationEstimation,
    criteria: ICPConvergenceCriteria,
    stages: Vec<MultiScaleStage>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            ransac: RansacParams::default()
                .with_max_iteration(20_000)
                .with_checker(CorrespondenceChecker::EdgeLength {
                    similarity_threshold: 0.9,
                })
                .with_checker(CorrespondenceChecker::Distance { threshold: 0.05 }),
            fgr: FastGlobalRegistrationOption::default(),
            ransac_distance: 0.05,
            estimation: TransformationEstimation::point_to_plane(),
            criteria: ICPConvergenceCriteria::default(),
            stages: vec![
                MultiScaleStage::new(0.1, 30, 0.2),
                MultiScaleStage::new(0.05, 30, 0.1),
                MultiScaleStage::full_resolution(30, 0.03),
            ],
        }
    }
}

/// Samples on the faces of the unit cube with outward normals.
fn cube_surface(steps: usize) -> Result<PointCloud, Box<dyn std::error::Error>> {
    let mut points = Vec::new();
    let mut normals = Vec::new();
    let mut colors = Vec::new();
    for axis in 0..3 {
        for side in [0.0, 1.0] {
            for i in 0..steps {
                for j in 0..steps {
                    let mut p = [0.0; 3];
                    p[axis] = side;
                    p[(axis + 1) % 3] = (i as f64 + 0.5) / steps as f64;
                    p[(axis + 2) % 3] = (j as f64 + 0.5) / steps as f64;
                    let mut n = [0.0; 3];
                    n[axis] = if side > 0.5 { 1.0 } else { -1.0 };
                    let g = (127.0 + 100.0 * (3.0 * p[0] + 2.0 * p[1] - p[2]).sin()) as u8;
                    points.push(p);
                    normals.push(n);
                    colors.push([g, g, g]);
                }
            }
        }
    }
    Ok(PointCloud::new(points, Some(colors), Some(normals))?)
}

fn random_descriptor(rng: &mut StdRng) -> Vec<f64> {
    (0..DESCRIPTOR_DIMENSION)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = match &args.config {
        Some(path) => serde_json::from_str::<DemoConfig>(&std::fs::read_to_string(path)?)?,
        None => DemoConfig::default(),
    };
    log::debug!("config: {}", serde_json::to_string(&config)?);

    let mut rng = StdRng::seed_from_u64(args.seed);

    // the source is the target seen from another pose, with noisy points
    let target = cube_surface(args.steps)?;
    let ground_truth =
        transforms::axis_angle_to_transform(&[0.3, -0.5, 1.0], 0.8, &[0.4, -0.2, 0.3])?;
    let moved = target.transform(&ground_truth.inverse());
    let noisy_points = moved
        .points()
        .iter()
        .map(|p| p.map(|v| v + args.noise * rng.random_range(-1.0..1.0)))
        .collect::<Vec<_>>();
    let source = PointCloud::new(
        noisy_points,
        moved.colors().map(<[_]>::to_vec),
        moved.normals().map(<[_]>::to_vec),
    )?;
    println!(
        "Source cloud: #{} points, target cloud: #{} points",
        source.len(),
        target.len()
    );

    let target_rows = (0..target.len())
        .map(|_| random_descriptor(&mut rng))
        .collect::<Vec<_>>();
    let source_rows = target_rows
        .iter()
        .map(|row| {
            if rng.random_bool(args.outlier_ratio.clamp(0.0, 1.0)) {
                random_descriptor(&mut rng)
            } else {
                row.iter()
                    .map(|v| v + 0.01 * rng.random_range(-1.0..1.0))
                    .collect()
            }
        })
        .collect::<Vec<_>>();
    let source_features = Features::from_rows(&source_rows)?;
    let target_features = Features::from_rows(&target_rows)?;

    let global = match args.method {
        GlobalMethod::Ransac => registration_ransac_based_on_feature_matching(
            &source,
            &target,
            &source_features,
            &target_features,
            true,
            config.ransac_distance,
            &config.ransac,
        )?,
        GlobalMethod::Fgr => registration_fgr_based_on_feature_matching(
            &source,
            &target,
            &source_features,
            &target_features,
            &config.fgr,
        )?,
    };
    report(&format!("{:?}", args.method), &global, &ground_truth);

    let refined = registration_multi_scale_icp(
        &source,
        &target,
        &config.stages,
        &global.transformation,
        &config.estimation,
        &config.criteria,
        &VoxelDownsampler,
    )?;
    report(config.estimation.name(), &refined, &ground_truth);

    if let Some(path) = &args.output {
        std::fs::write(path, serde_json::to_string_pretty(&refined)?)?;
        println!("Result written to {}", path.display());
    }

    Ok(())
}

fn report(stage: &str, result: &RegistrationResult, ground_truth: &DMat4) {
    println!(
        "{stage}: fitness {:.4}, inlier rmse {:.5}, {} iterations, converged {}",
        result.fitness, result.inlier_rmse, result.num_iterations, result.converged
    );
    println!(
        "  rotation error {:.4} deg, translation error {:.5}",
        transforms::rotation_error(&result.transformation, ground_truth).to_degrees(),
        transforms::translation_error(&result.transformation, ground_truth)
    );
}
