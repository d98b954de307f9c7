use glam::{DMat3, DVec3};
use kornia_3d::{linalg, pointcloud::PointCloud};
use rayon::prelude::*;

use crate::error::RegistrationError;
use crate::kdtree::KdTree;

/// Default neighborhood size for covariance estimation.
pub const DEFAULT_COVARIANCE_KNN: usize = 20;

/// Variance kept along the normal of a local plane.
pub const DEFAULT_PLANE_EPSILON: f64 = 1e-3;

/// Estimate a plane-shaped covariance for every point of `cloud`.
///
/// The empirical covariance of the `knn` nearest neighbors is decomposed with an
/// SVD and rebuilt as `U diag(1, 1, ε) Uᵀ`, so each point is modeled as a small
/// disk on its local surface. Points with fewer than three neighbors get the
/// identity.
///
/// # Errors
///
/// Returns [`RegistrationError::EmptyIndex`] for an empty cloud.
pub fn estimate_covariances(
    cloud: &PointCloud,
    knn: usize,
) -> Result<Vec<[[f64; 3]; 3]>, RegistrationError> {
    let index = KdTree::new(cloud.points())?;

    let covariances = cloud
        .points()
        .par_iter()
        .map(|p| {
            let neighbors = index.knn(p, knn);
            if neighbors.len() < 3 {
                return linalg::mat3_to_rows(&DMat3::IDENTITY);
            }
            let pts = neighbors
                .iter()
                .map(|nb| cloud.points()[nb.index])
                .collect::<Vec<_>>();
            let mean = linalg::centroid(&pts);

            let mut cov = [[0.0f64; 3]; 3];
            for q in &pts {
                let d = DVec3::from_array(*q) - mean;
                for (r, row) in cov.iter_mut().enumerate() {
                    for (c, v) in row.iter_mut().enumerate() {
                        *v += d[r] * d[c];
                    }
                }
            }
            let n = pts.len() as f64;
            let cov_mat = faer::Mat::<f64>::from_fn(3, 3, |r, c| cov[r][c] / n);

            let svd = cov_mat.svd();
            let u = svd.u();
            let values = [1.0, 1.0, DEFAULT_PLANE_EPSILON];
            let mut out = [[0.0f64; 3]; 3];
            for (r, row) in out.iter_mut().enumerate() {
                for (c, v) in row.iter_mut().enumerate() {
                    *v = (0..3)
                        .map(|k| u.read(r, k) * values[k] * u.read(c, k))
                        .sum();
                }
            }
            out
        })
        .collect();

    Ok(covariances)
}

/// Build plane covariances `I − (1 − ε) n nᵀ` from unit normals.
pub fn covariances_from_normals(normals: &[[f64; 3]], epsilon: f64) -> Vec<[[f64; 3]; 3]> {
    normals
        .iter()
        .map(|n| {
            let n = DVec3::from_array(*n);
            let nnt = DMat3::from_cols(n * n.x, n * n.y, n * n.z);
            linalg::mat3_to_rows(&(DMat3::IDENTITY - (1.0 - epsilon) * nnt))
        })
        .collect()
}
