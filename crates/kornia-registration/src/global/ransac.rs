use glam::{DMat4, DVec3};
use kornia_3d::{linalg, pointcloud::PointCloud};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;

use super::{correspondences_from_features, validate_candidates, validate_features, Features};
use crate::error::RegistrationError;
use crate::estimation::point_to_point::{estimate_rigid, MIN_CORRESPONDENCES};
use crate::icp::validate_inputs;
use crate::result::{evaluate_registration, RegistrationResult};

// trials evaluated in parallel between two sequential bookkeeping passes
const TRIAL_BATCH_SIZE: usize = 256;

/// Cheap tests that prune a RANSAC sample before it is scored.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CorrespondenceChecker {
    /// Pairwise edge lengths in the source and target samples must be similar:
    /// each ratio must be at least `similarity_threshold`, in `[0, 1]`.
    EdgeLength {
        /// Minimum ratio between corresponding edge lengths.
        similarity_threshold: f64,
    },
    /// Every sample pair must be closer than `threshold` once aligned.
    Distance {
        /// Maximum aligned distance.
        threshold: f64,
    },
    /// Aligned normals of every sample pair must be within `max_angle` radians.
    Normal {
        /// Maximum angle between normals.
        max_angle: f64,
    },
}

impl CorrespondenceChecker {
    /// Whether the check needs the transform fitted on the sample.
    pub fn requires_alignment(&self) -> bool {
        !matches!(self, Self::EdgeLength { .. })
    }

    fn validate(&self, source: &PointCloud, target: &PointCloud) -> Result<(), RegistrationError> {
        match *self {
            Self::EdgeLength {
                similarity_threshold,
            } if !(0.0..=1.0).contains(&similarity_threshold) => {
                Err(RegistrationError::InvalidParameter(format!(
                    "edge length similarity must be in [0, 1], got {similarity_threshold}"
                )))
            }
            Self::Distance { threshold } if !(threshold > 0.0) => {
                Err(RegistrationError::InvalidParameter(format!(
                    "distance checker threshold must be positive, got {threshold}"
                )))
            }
            Self::Normal { max_angle } if !(0.0..=std::f64::consts::PI).contains(&max_angle) => {
                Err(RegistrationError::InvalidParameter(format!(
                    "normal checker angle must be in [0, pi], got {max_angle}"
                )))
            }
            Self::Normal { .. } => {
                for (cloud, name) in [(source, "source"), (target, "target")] {
                    if !cloud.has_normals() {
                        return Err(RegistrationError::MissingAttribute {
                            cloud: name,
                            attribute: "normals",
                            estimation: "normal correspondence checker",
                        });
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Run the check on sample pairs.
    ///
    /// `transformation` is only read by the checks that need alignment.
    pub fn check(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        pairs: &[(usize, usize)],
        transformation: &DMat4,
    ) -> bool {
        match *self {
            Self::EdgeLength {
                similarity_threshold,
            } => pairs.iter().enumerate().all(|(a, &(si, ti))| {
                pairs[a + 1..].iter().all(|&(sj, tj)| {
                    let ds = source.point(si).distance(source.point(sj));
                    let dt = target.point(ti).distance(target.point(tj));
                    ds >= dt * similarity_threshold && dt >= ds * similarity_threshold
                })
            }),
            Self::Distance { threshold } => pairs.iter().all(|&(s, t)| {
                transformation
                    .transform_point3(source.point(s))
                    .distance_squared(target.point(t))
                    <= threshold * threshold
            }),
            Self::Normal { max_angle } => {
                let (Some(ns), Some(nt)) = (source.normals(), target.normals()) else {
                    return false;
                };
                let rotation = linalg::rotation_part(transformation);
                let min_cos = max_angle.cos();
                pairs.iter().all(|&(s, t)| {
                    (rotation * DVec3::from_array(ns[s])).dot(DVec3::from_array(nt[t])) >= min_cos
                })
            }
        }
    }
}

/// Parameters of RANSAC registration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RansacParams {
    /// Number of candidate pairs per sample, at least 3.
    pub ransac_n: usize,
    /// Maximum number of trials.
    pub max_iteration: usize,
    /// Desired probability of drawing at least one outlier-free sample, in `(0, 1]`.
    pub confidence: f64,
    /// Stop after this many consecutive trials without improvement.
    pub max_non_improving: Option<usize>,
    /// Checks applied to every sample.
    pub checkers: Vec<CorrespondenceChecker>,
    /// Optional fixed seed for reproducible sampling.
    pub random_seed: Option<u64>,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            ransac_n: 3,
            max_iteration: 100_000,
            confidence: 0.999,
            max_non_improving: None,
            checkers: Vec::new(),
            random_seed: None,
        }
    }
}

impl RansacParams {
    /// Set the sample size.
    pub fn with_ransac_n(mut self, ransac_n: usize) -> Self {
        self.ransac_n = ransac_n;
        self
    }

    /// Set the trial budget.
    pub fn with_max_iteration(mut self, max_iteration: usize) -> Self {
        self.max_iteration = max_iteration;
        self
    }

    /// Set the confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Stop after `count` consecutive non-improving trials.
    pub fn with_max_non_improving(mut self, count: usize) -> Self {
        self.max_non_improving = Some(count);
        self
    }

    /// Add a sample checker.
    pub fn with_checker(mut self, checker: CorrespondenceChecker) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Fix the random seed.
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<(), RegistrationError> {
        if self.ransac_n < MIN_CORRESPONDENCES {
            return Err(RegistrationError::InvalidParameter(format!(
                "ransac_n must be at least {MIN_CORRESPONDENCES}, got {}",
                self.ransac_n
            )));
        }
        if self.max_iteration == 0 {
            return Err(RegistrationError::InvalidParameter(
                "max_iteration must be at least 1".to_string(),
            ));
        }
        if !(self.confidence > 0.0 && self.confidence <= 1.0) {
            return Err(RegistrationError::InvalidParameter(format!(
                "confidence must be in (0, 1], got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Trial {
    transformation: DMat4,
    fitness: f64,
    rmse: f64,
    inliers: Vec<usize>,
}

impl Trial {
    fn is_better_than(&self, other: &Self) -> bool {
        self.fitness > other.fitness || (self.fitness == other.fitness && self.rmse < other.rmse)
    }
}

// Number of trials needed to draw an all-inlier sample with the given confidence.
fn required_trials(inlier_ratio: f64, ransac_n: usize, confidence: f64) -> Option<usize> {
    if !(inlier_ratio > 0.0) {
        return None;
    }
    if inlier_ratio >= 1.0 || confidence >= 1.0 {
        return (inlier_ratio >= 1.0).then_some(0);
    }
    let k = (1.0 - confidence).ln() / (1.0 - inlier_ratio.powi(ransac_n as i32)).ln();
    k.is_finite().then(|| k.ceil().max(0.0) as usize)
}

struct Problem<'a> {
    source: &'a PointCloud,
    target: &'a PointCloud,
    candidates: &'a [(usize, usize)],
    max_distance_squared: f64,
    params: &'a RansacParams,
    seed: u64,
}

impl Problem<'_> {
    fn run_trial(&self, trial: usize) -> Option<Trial> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(trial as u64));
        let sample = rand::seq::index::sample(&mut rng, self.candidates.len(), self.params.ransac_n)
            .into_iter()
            .map(|k| self.candidates[k])
            .collect::<Vec<_>>();

        let checkers = &self.params.checkers;
        if !checkers
            .iter()
            .filter(|c| !c.requires_alignment())
            .all(|c| c.check(self.source, self.target, &sample, &DMat4::IDENTITY))
        {
            return None;
        }

        let (src, dst): (Vec<_>, Vec<_>) = sample
            .iter()
            .map(|&(s, t)| (self.source.point(s), self.target.point(t)))
            .unzip();
        let transformation = estimate_rigid(&src, &dst, None).ok()?;

        if !checkers
            .iter()
            .filter(|c| c.requires_alignment())
            .all(|c| c.check(self.source, self.target, &sample, &transformation))
        {
            return None;
        }

        let mut inliers = Vec::new();
        let mut error = 0.0;
        for (k, &(s, t)) in self.candidates.iter().enumerate() {
            let d2 = transformation
                .transform_point3(self.source.point(s))
                .distance_squared(self.target.point(t));
            if d2 <= self.max_distance_squared {
                inliers.push(k);
                error += d2;
            }
        }
        if inliers.is_empty() {
            return None;
        }

        Some(Trial {
            transformation,
            fitness: inliers.len() as f64 / self.candidates.len() as f64,
            rmse: (error / inliers.len() as f64).sqrt(),
            inliers,
        })
    }
}

/// RANSAC registration over candidate correspondences.
///
/// Each trial samples `ransac_n` distinct candidates, prunes the sample with
/// the configured checkers, fits a point-to-point transform and scores it by
/// the fraction of candidates aligned within `max_correspondence_distance`.
/// Trials run in parallel batches; trial `t` draws from an RNG seeded with
/// `seed + t`, so a fixed seed gives the same result on any thread count.
///
/// The best model is refit on its inlier candidates and evaluated against the
/// full clouds. When no trial yields a model the identity is returned with
/// zero fitness.
///
/// # Errors
///
/// * [`RegistrationError::InsufficientCorrespondences`] with fewer than
///   `max(3, ransac_n)` candidates.
/// * [`RegistrationError::InvalidInput`] for empty clouds or out of range candidates.
/// * [`RegistrationError::InvalidParameter`] for bad parameters.
pub fn registration_ransac_based_on_correspondence(
    source: &PointCloud,
    target: &PointCloud,
    candidates: &[(usize, usize)],
    max_correspondence_distance: f64,
    params: &RansacParams,
) -> Result<RegistrationResult, RegistrationError> {
    validate_inputs(source, target)?;
    params.validate()?;
    for checker in &params.checkers {
        checker.validate(source, target)?;
    }
    validate_candidates(source, target, candidates)?;

    let required = params.ransac_n.max(MIN_CORRESPONDENCES);
    if candidates.len() < required {
        return Err(RegistrationError::InsufficientCorrespondences {
            required,
            actual: candidates.len(),
        });
    }
    if !(max_correspondence_distance > 0.0) {
        return Ok(RegistrationResult::new(DMat4::IDENTITY));
    }

    let problem = Problem {
        source,
        target,
        candidates,
        max_distance_squared: max_correspondence_distance * max_correspondence_distance,
        params,
        seed: params.random_seed.unwrap_or_else(rand::random),
    };

    let mut best: Option<Trial> = None;
    let mut budget = params.max_iteration;
    let mut non_improving = 0;
    let mut trials_run = 0;
    let mut early_stop = false;

    'batches: while trials_run < budget {
        let end = (trials_run + TRIAL_BATCH_SIZE).min(budget);
        let batch = (trials_run..end)
            .into_par_iter()
            .map(|t| problem.run_trial(t))
            .collect::<Vec<_>>();

        for trial in batch {
            trials_run += 1;
            match trial {
                Some(trial) if best.as_ref().map_or(true, |b| trial.is_better_than(b)) => {
                    if let Some(k) = required_trials(trial.fitness, params.ransac_n, params.confidence) {
                        budget = budget.min(k.max(trials_run));
                    }
                    best = Some(trial);
                    non_improving = 0;
                }
                _ => non_improving += 1,
            }

            if params.max_non_improving.is_some_and(|limit| non_improving >= limit) {
                early_stop = true;
                break 'batches;
            }
            if trials_run >= budget {
                early_stop = budget < params.max_iteration;
                break 'batches;
            }
        }
    }

    let Some(best) = best else {
        log::warn!("RANSAC found no valid model in {trials_run} trials");
        let mut result = RegistrationResult::new(DMat4::IDENTITY);
        result.num_iterations = trials_run;
        return Ok(result);
    };

    log::debug!(
        "RANSAC best trial: fitness {:.4}, rmse {:.6}, {} inliers after {} trials",
        best.fitness,
        best.rmse,
        best.inliers.len(),
        trials_run
    );

    // refit on all inlier candidates
    let (src, dst): (Vec<_>, Vec<_>) = best
        .inliers
        .iter()
        .map(|&k| {
            let (s, t) = candidates[k];
            (source.point(s), target.point(t))
        })
        .unzip();
    let transformation = estimate_rigid(&src, &dst, None).unwrap_or(best.transformation);

    let mut result =
        evaluate_registration(source, target, max_correspondence_distance, &transformation)?;
    result.num_iterations = trials_run;
    result.converged = early_stop;
    Ok(result)
}

/// Match features, then run [`registration_ransac_based_on_correspondence`].
#[allow(clippy::too_many_arguments)]
pub fn registration_ransac_based_on_feature_matching(
    source: &PointCloud,
    target: &PointCloud,
    source_features: &Features,
    target_features: &Features,
    mutual_filter: bool,
    max_correspondence_distance: f64,
    params: &RansacParams,
) -> Result<RegistrationResult, RegistrationError> {
    validate_features(source, source_features, "source")?;
    validate_features(target, target_features, "target")?;
    let candidates = correspondences_from_features(source_features, target_features, mutual_filter)?;
    registration_ransac_based_on_correspondence(
        source,
        target,
        &candidates,
        max_correspondence_distance,
        params,
    )
}
