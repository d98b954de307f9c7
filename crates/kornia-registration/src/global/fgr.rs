use glam::{DMat4, DVec3};
use kornia_3d::{linalg, pointcloud::PointCloud};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{correspondences_from_features, validate_candidates, validate_features, Features};
use crate::error::RegistrationError;
use crate::estimation::linear_system::{accumulate, transform_from_vector};
use crate::estimation::point_to_point::MIN_CORRESPONDENCES;
use crate::icp::validate_inputs;
use crate::result::{evaluate_registration, RegistrationResult};

/// Options of fast global registration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FastGlobalRegistrationOption {
    /// Factor dividing the robust scale `μ` every four iterations.
    pub division_factor: f64,
    /// Work in the input units instead of normalizing both clouds to unit size.
    pub use_absolute_scale: bool,
    /// Whether to anneal `μ` at all.
    pub decrease_mu: bool,
    /// Final robust scale and inlier threshold, in normalized units unless
    /// `use_absolute_scale` is set.
    pub maximum_correspondence_distance: f64,
    /// Number of outer iterations.
    pub iteration_number: usize,
    /// Minimum edge length ratio accepted by the tuple test.
    pub tuple_scale: f64,
    /// Maximum number of tuples kept by the tuple test.
    pub maximum_tuple_count: usize,
    /// Whether to prune candidates with the tuple test.
    pub tuple_test: bool,
    /// Optional fixed seed for the tuple test.
    pub random_seed: Option<u64>,
}

impl Default for FastGlobalRegistrationOption {
    fn default() -> Self {
        Self {
            division_factor: 1.4,
            use_absolute_scale: false,
            decrease_mu: true,
            maximum_correspondence_distance: 0.025,
            iteration_number: 64,
            tuple_scale: 0.95,
            maximum_tuple_count: 1000,
            tuple_test: true,
            random_seed: None,
        }
    }
}

impl FastGlobalRegistrationOption {
    /// Set the inlier threshold.
    pub fn with_maximum_correspondence_distance(mut self, distance: f64) -> Self {
        self.maximum_correspondence_distance = distance;
        self
    }

    /// Set the number of iterations.
    pub fn with_iteration_number(mut self, iteration_number: usize) -> Self {
        self.iteration_number = iteration_number;
        self
    }

    /// Enable or disable the tuple test.
    pub fn with_tuple_test(mut self, tuple_test: bool) -> Self {
        self.tuple_test = tuple_test;
        self
    }

    /// Work in absolute units.
    pub fn with_absolute_scale(mut self, use_absolute_scale: bool) -> Self {
        self.use_absolute_scale = use_absolute_scale;
        self
    }

    /// Fix the random seed.
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<(), RegistrationError> {
        let invalid = |msg: String| Err(RegistrationError::InvalidParameter(msg));
        if !(self.division_factor > 1.0) {
            return invalid(format!(
                "division_factor must be greater than 1, got {}",
                self.division_factor
            ));
        }
        if !(self.maximum_correspondence_distance > 0.0) {
            return invalid(format!(
                "maximum_correspondence_distance must be positive, got {}",
                self.maximum_correspondence_distance
            ));
        }
        if self.iteration_number == 0 {
            return invalid("iteration_number must be at least 1".to_string());
        }
        if self.tuple_test && !(self.tuple_scale > 0.0 && self.tuple_scale < 1.0) {
            return invalid(format!(
                "tuple_scale must be in (0, 1), got {}",
                self.tuple_scale
            ));
        }
        Ok(())
    }
}

// Clouds moved to their centroids and optionally scaled to unit size.
struct Normalized {
    source: Vec<DVec3>,
    target: Vec<DVec3>,
    source_mean: DVec3,
    target_mean: DVec3,
    // largest distance of a point to its centroid, in input units
    extent: f64,
    // factor dividing the centered coordinates
    scale: f64,
}

fn normalize(source: &PointCloud, target: &PointCloud, use_absolute_scale: bool) -> Normalized {
    let source_mean = linalg::centroid(source.points());
    let target_mean = linalg::centroid(target.points());
    let center = |points: &[[f64; 3]], mean: DVec3| {
        points
            .iter()
            .map(|p| DVec3::from_array(*p) - mean)
            .collect::<Vec<_>>()
    };
    let mut src = center(source.points(), source_mean);
    let mut dst = center(target.points(), target_mean);

    let extent = src
        .iter()
        .chain(dst.iter())
        .map(|p| p.length())
        .fold(0.0f64, f64::max);
    let scale = if use_absolute_scale || !(extent > 0.0) {
        1.0
    } else {
        extent
    };
    if scale != 1.0 {
        src.iter_mut().chain(dst.iter_mut()).for_each(|p| *p /= scale);
    }

    Normalized {
        source: src,
        target: dst,
        source_mean,
        target_mean,
        extent,
        scale,
    }
}

// Keep candidates that form triangles of similar shape in both clouds.
fn tuple_test(
    normalized: &Normalized,
    candidates: &[(usize, usize)],
    option: &FastGlobalRegistrationOption,
    rng: &mut StdRng,
) -> Vec<(usize, usize)> {
    let n = candidates.len();
    let scale = option.tuple_scale;
    let similar = |a: f64, b: f64| a * scale < b && b < a / scale;

    let mut kept = Vec::new();
    let mut tuples = 0;
    for _ in 0..n * 100 {
        let picks = [
            candidates[rng.random_range(0..n)],
            candidates[rng.random_range(0..n)],
            candidates[rng.random_range(0..n)],
        ];
        let edge = |a: usize, b: usize| {
            let (sa, ta) = picks[a];
            let (sb, tb) = picks[b];
            (
                normalized.source[sa].distance(normalized.source[sb]),
                normalized.target[ta].distance(normalized.target[tb]),
            )
        };
        if [edge(0, 1), edge(1, 2), edge(2, 0)]
            .iter()
            .all(|&(ls, lt)| similar(ls, lt))
        {
            kept.extend_from_slice(&picks);
            tuples += 1;
        }
        if tuples >= option.maximum_tuple_count {
            break;
        }
    }

    kept.sort_unstable();
    kept.dedup();
    kept
}

/// Fast global registration over candidate correspondences.
///
/// Both clouds are centered and, unless `use_absolute_scale` is set, scaled by
/// the largest point norm. Candidates optionally go through a tuple test. Each
/// iteration solves one weighted 6x6 system where every candidate is weighted by
/// the Geman-McClure line process `(μ / (μ + r²))²`; `μ` starts at 1 (or at
/// the global scale in absolute mode) and is divided by `division_factor`
/// every four iterations while it exceeds `maximum_correspondence_distance`.
///
/// The transform is mapped back to the input units and evaluated against the
/// full clouds at `maximum_correspondence_distance` in input units.
///
/// # Errors
///
/// Returns [`RegistrationError::InsufficientCorrespondences`] when fewer than
/// three candidates remain after the tuple test.
pub fn registration_fgr_based_on_correspondence(
    source: &PointCloud,
    target: &PointCloud,
    candidates: &[(usize, usize)],
    option: &FastGlobalRegistrationOption,
) -> Result<RegistrationResult, RegistrationError> {
    validate_inputs(source, target)?;
    option.validate()?;
    validate_candidates(source, target, candidates)?;
    if candidates.len() < MIN_CORRESPONDENCES {
        return Err(RegistrationError::InsufficientCorrespondences {
            required: MIN_CORRESPONDENCES,
            actual: candidates.len(),
        });
    }

    let normalized = normalize(source, target, option.use_absolute_scale);

    let pairs = if option.tuple_test {
        let mut rng = StdRng::seed_from_u64(option.random_seed.unwrap_or_else(rand::random));
        let kept = tuple_test(&normalized, candidates, option, &mut rng);
        log::debug!("tuple test kept {} of {} candidates", kept.len(), candidates.len());
        kept
    } else {
        candidates.to_vec()
    };
    if pairs.len() < MIN_CORRESPONDENCES {
        return Err(RegistrationError::InsufficientCorrespondences {
            required: MIN_CORRESPONDENCES,
            actual: pairs.len(),
        });
    }

    let mut working = normalized.source.clone();
    let mut transformation = DMat4::IDENTITY;
    let mut mu = if option.use_absolute_scale && normalized.extent > 0.0 {
        normalized.extent
    } else {
        1.0
    };

    for itr in 0..option.iteration_number {
        if option.decrease_mu && itr % 4 == 0 && mu > option.maximum_correspondence_distance {
            mu /= option.division_factor;
        }

        let system = accumulate(&pairs, |sys, &(s, t)| {
            let p = working[s];
            let r = p - normalized.target[t];
            let w = (mu / (mu + r.length_squared())).powi(2);
            sys.add_row(&[0.0, p.z, -p.y, 1.0, 0.0, 0.0], r.x, w);
            sys.add_row(&[-p.z, 0.0, p.x, 0.0, 1.0, 0.0], r.y, w);
            sys.add_row(&[p.y, -p.x, 0.0, 0.0, 0.0, 1.0], r.z, w);
        });

        let Some(x) = system.solve() else {
            log::warn!("FGR iteration {itr}: singular system, stopping");
            break;
        };
        let delta = transform_from_vector(&x);
        transformation = delta * transformation;
        working
            .iter_mut()
            .for_each(|p| *p = delta.transform_point3(*p));

        log::debug!(
            "FGR iteration {}: mu {:.6}, weighted error {:.6}",
            itr,
            mu,
            system.residual_squared
        );
    }

    // back to input units: x_t = R x_s + μt − R μs + scale · t_n
    let rotation = linalg::rotation_part(&transformation);
    let translation = normalized.target_mean - rotation * normalized.source_mean
        + normalized.scale * linalg::translation_part(&transformation);
    let transformation = linalg::rigid_transform(&rotation, translation);

    let mut result = evaluate_registration(
        source,
        target,
        option.maximum_correspondence_distance * normalized.scale,
        &transformation,
    )?;
    result.num_iterations = option.iteration_number;
    Ok(result)
}

/// Match features, then run [`registration_fgr_based_on_correspondence`].
pub fn registration_fgr_based_on_feature_matching(
    source: &PointCloud,
    target: &PointCloud,
    source_features: &Features,
    target_features: &Features,
    option: &FastGlobalRegistrationOption,
) -> Result<RegistrationResult, RegistrationError> {
    validate_features(source, source_features, "source")?;
    validate_features(target, target_features, "target")?;
    let candidates = correspondences_from_features(source_features, target_features, true)?;
    registration_fgr_based_on_correspondence(source, target, &candidates, option)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kornia_3d::transforms;

    fn random_cloud(n: usize, seed: u64) -> PointCloud {
        let mut rng = StdRng::seed_from_u64(seed);
        PointCloud::from_points(
            (0..n)
                .map(|_| {
                    [
                        rng.random_range(-2.0..2.0),
                        rng.random_range(-1.0..1.0),
                        rng.random_range(-0.5..0.5),
                    ]
                })
                .collect(),
        )
    }

    #[test]
    fn test_normalize() {
        let source = PointCloud::from_points(vec![[1.0, 0.0, 0.0], [3.0, 0.0, 0.0]]);
        let target = PointCloud::from_points(vec![[0.0, 0.0, 0.0], [0.0, 4.0, 0.0]]);
        let n = normalize(&source, &target, false);
        assert_eq!(n.scale, 2.0);
        assert!(n.source[0].abs_diff_eq(DVec3::new(-0.5, 0.0, 0.0), 1e-12));
        assert!(n.target[1].abs_diff_eq(DVec3::new(0.0, 1.0, 0.0), 1e-12));

        let abs = normalize(&source, &target, true);
        assert_eq!(abs.scale, 1.0);
        assert!(abs.source[1].abs_diff_eq(DVec3::new(1.0, 0.0, 0.0), 1e-12));
    }

    #[test]
    fn test_fgr_with_outliers() -> Result<(), Box<dyn std::error::Error>> {
        let source = random_cloud(300, 0);
        let expected = transforms::axis_angle_to_transform(&[0.3, -0.4, 1.0], 0.9, &[1.0, 2.0, -0.5])?;
        let target = source.transform(&expected);

        // 20% wrong candidates
        let candidates = (0..300)
            .map(|i| if i % 5 == 0 { (i, (i * 11 + 7) % 300) } else { (i, i) })
            .collect::<Vec<_>>();

        let option = FastGlobalRegistrationOption::default().with_random_seed(3);
        let result = registration_fgr_based_on_correspondence(&source, &target, &candidates, &option)?;

        assert!(transforms::rotation_error(&result.transformation, &expected) < 1e-3);
        assert!(transforms::translation_error(&result.transformation, &expected) < 1e-3);
        assert!(result.fitness > 0.99);
        Ok(())
    }

    #[test]
    fn test_fgr_without_tuple_test() -> Result<(), Box<dyn std::error::Error>> {
        let source = random_cloud(100, 1);
        let expected = transforms::axis_angle_to_transform(&[1.0, 0.0, 0.0], 0.5, &[0.0, 0.3, 0.0])?;
        let target = source.transform(&expected);
        let candidates = (0..100).map(|i| (i, i)).collect::<Vec<_>>();

        let option = FastGlobalRegistrationOption::default().with_tuple_test(false);
        let result = registration_fgr_based_on_correspondence(&source, &target, &candidates, &option)?;
        assert!(transforms::rotation_error(&result.transformation, &expected) < 1e-6);
        assert!(transforms::translation_error(&result.transformation, &expected) < 1e-6);
        assert_eq!(result.num_iterations, 64);
        Ok(())
    }

    #[test]
    fn test_fgr_insufficient() {
        let cloud = random_cloud(10, 2);
        let res = registration_fgr_based_on_correspondence(
            &cloud,
            &cloud,
            &[(0, 0), (1, 1)],
            &FastGlobalRegistrationOption::default(),
        );
        assert_eq!(
            res,
            Err(RegistrationError::InsufficientCorrespondences {
                required: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_fgr_invalid_option() {
        let cloud = random_cloud(10, 3);
        let pairs = (0..10).map(|i| (i, i)).collect::<Vec<_>>();
        let bad = FastGlobalRegistrationOption {
            division_factor: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            registration_fgr_based_on_correspondence(&cloud, &cloud, &pairs, &bad),
            Err(RegistrationError::InvalidParameter(_))
        ));
    }
}
