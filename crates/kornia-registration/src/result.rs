use glam::DMat4;
use kornia_3d::pointcloud::PointCloud;

use crate::correspondence::{find_correspondences, Correspondence, CorrespondenceSet};
use crate::error::RegistrationError;
use crate::estimation::linear_system::accumulate;
use crate::kdtree::KdTree;

/// Outcome of a registration call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistrationResult {
    /// Rigid transform mapping the source onto the target.
    pub transformation: DMat4,
    /// Fraction of source points with a correspondence, in `[0, 1]`.
    pub fitness: f64,
    /// Root mean square distance over the correspondences, 0 when there are none.
    pub inlier_rmse: f64,
    /// Correspondences under the final transform, ordered by source index.
    pub correspondences: CorrespondenceSet,
    /// Number of iterations actually run.
    pub num_iterations: usize,
    /// Whether a convergence test fired before the iteration budget ran out.
    pub converged: bool,
}

impl Default for RegistrationResult {
    fn default() -> Self {
        Self::new(DMat4::IDENTITY)
    }
}

impl RegistrationResult {
    /// An empty result: no correspondences, zero fitness and RMSE.
    pub fn new(transformation: DMat4) -> Self {
        Self {
            transformation,
            fitness: 0.0,
            inlier_rmse: 0.0,
            correspondences: Vec::new(),
            num_iterations: 0,
            converged: false,
        }
    }

    /// Build a result from a correspondence set, computing fitness and RMSE.
    ///
    /// `source_len` is the number of points of the source cloud.
    pub fn from_correspondences(
        transformation: DMat4,
        correspondences: CorrespondenceSet,
        source_len: usize,
    ) -> Self {
        let (fitness, inlier_rmse) = fitness_and_rmse(&correspondences, source_len);
        Self {
            transformation,
            fitness,
            inlier_rmse,
            correspondences,
            num_iterations: 0,
            converged: false,
        }
    }

    /// Whether `self` beats `other`: higher fitness, or equal fitness with a lower RMSE.
    pub fn is_better_than(&self, other: &Self) -> bool {
        self.fitness > other.fitness
            || (self.fitness == other.fitness && self.inlier_rmse < other.inlier_rmse)
    }
}

/// Fitness `|C| / n` and RMSE `sqrt(Σ d² / |C|)` of a correspondence set.
pub(crate) fn fitness_and_rmse(correspondences: &[Correspondence], source_len: usize) -> (f64, f64) {
    if correspondences.is_empty() || source_len == 0 {
        return (0.0, 0.0);
    }
    let fitness = correspondences.len() as f64 / source_len as f64;
    let sum = correspondences
        .iter()
        .map(|c| c.distance_squared)
        .sum::<f64>();
    (fitness, (sum / correspondences.len() as f64).sqrt())
}

/// Score a transform without refining it.
///
/// The source is moved by `transformation` and matched against the target
/// within `max_correspondence_distance`.
///
/// # Errors
///
/// * [`RegistrationError::InvalidInput`] if the source is empty.
/// * [`RegistrationError::EmptyIndex`] if the target is empty.
pub fn evaluate_registration(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f64,
    transformation: &DMat4,
) -> Result<RegistrationResult, RegistrationError> {
    if source.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "source point cloud is empty".to_string(),
        ));
    }
    let index = KdTree::new(target.points())?;
    let moved = source.transform(transformation);
    let correspondences =
        find_correspondences(&moved, target, &index, max_correspondence_distance, None)?;
    Ok(RegistrationResult::from_correspondences(
        *transformation,
        correspondences,
        source.len(),
    ))
}

/// 6x6 information matrix of an alignment, for pose graph edges.
///
/// Accumulates `JᵀJ` over the correspondences found within
/// `max_correspondence_distance` after applying `transformation`, with the
/// rows `[0, z, −y, 1, 0, 0]`, `[−z, 0, x, 0, 1, 0]` and `[y, −x, 0, 0, 0, 1]`
/// evaluated at each matched target point. The row order is `[ωx, ωy, ωz, tx, ty, tz]`.
pub fn get_information_matrix_from_point_clouds(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f64,
    transformation: &DMat4,
) -> Result<[[f64; 6]; 6], RegistrationError> {
    let result = evaluate_registration(source, target, max_correspondence_distance, transformation)?;

    let system = accumulate(&result.correspondences, |sys, c| {
        let [x, y, z] = target.points()[c.target];
        sys.add_row(&[0.0, z, -y, 1.0, 0.0, 0.0], 0.0, 1.0);
        sys.add_row(&[-z, 0.0, x, 0.0, 1.0, 0.0], 0.0, 1.0);
        sys.add_row(&[y, -x, 0.0, 0.0, 0.0, 1.0], 0.0, 1.0);
    });
    Ok(system.hessian())
}
