use glam::{DMat3, DMat4, DVec3};
use kornia_3d::{linalg, pointcloud::PointCloud};

use crate::correspondence::Correspondence;
use crate::error::EstimationError;
use crate::robust::RobustKernel;

/// Minimum number of pairs to fully constrain a rigid transform.
///
/// Global registration requires it; [`estimate_rigid`] accepts fewer pairs and
/// returns one of the transforms that align them.
pub const MIN_CORRESPONDENCES: usize = 3;

fn faer_to_dmat3(m: faer::MatRef<'_, f64>) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(m.read(0, 0), m.read(1, 0), m.read(2, 0)),
        DVec3::new(m.read(0, 1), m.read(1, 1), m.read(2, 1)),
        DVec3::new(m.read(0, 2), m.read(1, 2), m.read(2, 2)),
    )
}

/// Weighted least-squares rigid transform mapping `source` onto `target` (Kabsch).
///
/// Minimizes `Σ wᵢ ‖R sᵢ + t − tᵢ‖²` in closed form from the SVD of the weighted
/// cross-covariance. A reflection is corrected by flipping the axis of the
/// smallest singular value so that `det(R) = +1`.
///
/// With fewer than three pairs the rotation is not unique and any minimizer is
/// returned; a single pair gives a pure translation.
///
/// # Arguments
///
/// * `source` - Source points.
/// * `target` - Target points, paired by position with `source`.
/// * `weights` - Optional non-negative per-pair weights.
///
/// # Errors
///
/// * [`EstimationError::DegenerateCorrespondence`] with no pairs or a zero total
///   weight.
/// * [`EstimationError::NumericalSingularity`] if the inputs are not finite.
pub fn estimate_rigid(
    source: &[DVec3],
    target: &[DVec3],
    weights: Option<&[f64]>,
) -> Result<DMat4, EstimationError> {
    let n = source.len().min(target.len());
    if n == 0 {
        return Err(EstimationError::DegenerateCorrespondence(0));
    }
    let weight = |i: usize| weights.and_then(|w| w.get(i).copied()).unwrap_or(1.0);

    let total_weight = (0..n).map(weight).sum::<f64>();
    if !(total_weight > 0.0) {
        return Err(EstimationError::DegenerateCorrespondence(n));
    }

    // weighted centroids
    let (sum_s, sum_t) = (0..n).fold((DVec3::ZERO, DVec3::ZERO), |(acc_s, acc_t), i| {
        let w = weight(i);
        (acc_s + w * source[i], acc_t + w * target[i])
    });
    let centroid_s = sum_s / total_weight;
    let centroid_t = sum_t / total_weight;

    // cross-covariance H = Σ w (s - cs)(t - ct)ᵀ
    let mut h = [[0.0f64; 3]; 3];
    for i in 0..n {
        let w = weight(i);
        let s = source[i] - centroid_s;
        let t = target[i] - centroid_t;
        for (r, row) in h.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v += w * s[r] * t[c];
            }
        }
    }
    if h.iter().flatten().any(|v| !v.is_finite()) {
        return Err(EstimationError::NumericalSingularity);
    }
    // coincident points leave the rotation free
    if h.iter().flatten().all(|v| *v == 0.0) {
        return Ok(DMat4::from_translation(centroid_t - centroid_s));
    }

    let h_mat = faer::Mat::<f64>::from_fn(3, 3, |r, c| h[r][c]);
    let svd = h_mat.svd();
    let u = faer_to_dmat3(svd.u());
    let mut v = faer_to_dmat3(svd.v());

    // R = V diag(1, 1, d) Uᵀ
    if (v * u.transpose()).determinant() < 0.0 {
        v.z_axis = -v.z_axis;
    }
    let rotation = v * u.transpose();
    if !rotation.is_finite() {
        return Err(EstimationError::NumericalSingularity);
    }

    let translation = centroid_t - rotation * centroid_s;

    Ok(linalg::rigid_transform(&rotation, translation))
}

/// One point-to-point step over a correspondence set.
///
/// Pairs are weighted by `kernel` evaluated on their Euclidean distance.
pub fn compute_transformation(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
    kernel: &RobustKernel,
) -> Result<DMat4, EstimationError> {
    let (src, dst): (Vec<_>, Vec<_>) = correspondences
        .iter()
        .map(|c| (source.point(c.source), target.point(c.target)))
        .unzip();
    let weights = correspondences
        .iter()
        .map(|c| kernel.weight(c.distance_squared.sqrt()))
        .collect::<Vec<_>>();

    estimate_rigid(&src, &dst, Some(&weights))
}

/// Root mean square Euclidean distance over the correspondences.
pub fn compute_rmse(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
) -> f64 {
    if correspondences.is_empty() {
        return 0.0;
    }
    let sum = correspondences
        .iter()
        .map(|c| source.point(c.source).distance_squared(target.point(c.target)))
        .sum::<f64>();
    (sum / correspondences.len() as f64).sqrt()
}
