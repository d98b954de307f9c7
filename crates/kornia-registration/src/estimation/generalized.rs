use glam::{DMat3, DMat4};
use kornia_3d::{linalg, pointcloud::PointCloud};

use super::linear_system::{accumulate, transform_from_vector};
use crate::correspondence::Correspondence;
use crate::error::EstimationError;
use crate::robust::RobustKernel;

// Information matrix of a pair, `None` when the combined covariance is singular.
fn information(cs: &[[f64; 3]; 3], ct: &[[f64; 3]; 3]) -> Option<DMat3> {
    let combined = linalg::mat3_from_rows(cs) + linalg::mat3_from_rows(ct);
    let det = combined.determinant();
    let trace = combined.x_axis.x + combined.y_axis.y + combined.z_axis.z;
    if !(det.abs() > 1e-18 * trace.abs().powi(3)) {
        return None;
    }
    let omega = combined.inverse();
    omega.is_finite().then_some(omega)
}

fn covariances<'a>(
    source: &'a PointCloud,
    target: &'a PointCloud,
) -> Result<(&'a [[[f64; 3]; 3]], &'a [[[f64; 3]; 3]]), EstimationError> {
    let cs = source
        .covariances()
        .ok_or(EstimationError::MissingAttribute("source covariances"))?;
    let ct = target
        .covariances()
        .ok_or(EstimationError::MissingAttribute("target covariances"))?;
    Ok((cs, ct))
}

/// One generalized ICP step (plane-to-plane).
///
/// Each pair contributes the Mahalanobis residual `rᵀ Ω r` with
/// `Ω = (Σs + Σt)⁻¹`, where the source covariances are already rotated into the
/// target frame. The Jacobian of `r = p − q` is `[−[p]×, I]` and the robust
/// weight is evaluated on `sqrt(rᵀ Ω r)`. Pairs with a singular combined
/// covariance are skipped.
pub fn compute_transformation(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
    kernel: &RobustKernel,
) -> Result<DMat4, EstimationError> {
    if correspondences.is_empty() {
        return Err(EstimationError::DegenerateCorrespondence(0));
    }
    let (source_covs, target_covs) = covariances(source, target)?;

    let system = accumulate(correspondences, |sys, c| {
        let Some(omega) = information(&source_covs[c.source], &target_covs[c.target]) else {
            return;
        };
        let p = source.point(c.source);
        let r = p - target.point(c.target);
        let mahalanobis = r.dot(omega * r).max(0.0).sqrt();
        sys.add_block(
            &(-linalg::skew(p)),
            &DMat3::IDENTITY,
            r,
            &omega,
            kernel.weight(mahalanobis),
        );
    });

    let x = system.solve().ok_or(EstimationError::NumericalSingularity)?;
    Ok(transform_from_vector(&x))
}

/// Root mean Mahalanobis error `sqrt(Σ rᵀ Ω r / n)` over the correspondences.
pub fn compute_rmse(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
) -> f64 {
    let Ok((source_covs, target_covs)) = covariances(source, target) else {
        return 0.0;
    };
    if correspondences.is_empty() {
        return 0.0;
    }
    let sum = correspondences
        .iter()
        .filter_map(|c| {
            let omega = information(&source_covs[c.source], &target_covs[c.target])?;
            let r = source.point(c.source) - target.point(c.target);
            Some(r.dot(omega * r))
        })
        .sum::<f64>();
    (sum / correspondences.len() as f64).sqrt()
}
