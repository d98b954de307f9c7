//! Colored ICP: joint geometric and photometric alignment.
//!
//! The target carries a per-point intensity gradient constrained to its
//! tangent plane. The photometric residual compares the source intensity with
//! the first-order prediction of the target intensity at the projection of the
//! source point on the target tangent plane.

use glam::{DMat3, DMat4, DVec3};
use kornia_3d::pointcloud::PointCloud;
use rayon::prelude::*;

use super::linear_system::{accumulate, transform_from_vector};
use crate::correspondence::Correspondence;
use crate::error::{EstimationError, RegistrationError};
use crate::kdtree::KdTree;
use crate::robust::RobustKernel;

/// Default number of neighbors used to fit a color gradient.
pub const GRADIENT_MAX_NN: usize = 30;

// gradients fitted from fewer points are left at zero
const GRADIENT_MIN_NN: usize = 4;

/// Gray-level intensity in `[0, 1]` of an RGB color.
#[inline]
pub fn intensity(color: &[u8; 3]) -> f64 {
    (color[0] as f64 + color[1] as f64 + color[2] as f64) / (3.0 * 255.0)
}

#[inline]
fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}

/// Estimate the intensity gradient of every target point.
///
/// Neighbors within `radius` (at most `max_nn`) are projected on the tangent
/// plane of the point; the gradient is the least-squares fit of their intensity
/// differences, with an extra row that keeps it orthogonal to the normal.
///
/// # Errors
///
/// Returns [`RegistrationError::MissingAttribute`] if the cloud lacks normals or colors.
pub fn compute_color_gradients(
    target: &PointCloud,
    index: &KdTree,
    radius: f64,
    max_nn: usize,
) -> Result<Vec<[f64; 3]>, RegistrationError> {
    let missing = |attribute| RegistrationError::MissingAttribute {
        cloud: "target",
        attribute,
        estimation: "colored ICP",
    };
    let normals = target.normals().ok_or_else(|| missing("normals"))?;
    let colors = target.colors().ok_or_else(|| missing("colors"))?;

    let gradients = target
        .points()
        .par_iter()
        .enumerate()
        .map(|(k, p)| {
            let vt = DVec3::from_array(*p);
            let nt = DVec3::from_array(normals[k]);
            let it = intensity(&colors[k]);

            let neighbors = index.hybrid(p, radius, max_nn);
            let others = neighbors.iter().filter(|nb| nb.index != k);
            let count = neighbors.iter().filter(|nb| nb.index != k).count();
            if count + 1 < GRADIENT_MIN_NN {
                return [0.0; 3];
            }

            let mut ata = DMat3::ZERO;
            let mut atb = DVec3::ZERO;
            for nb in others {
                let vt_adj = DVec3::from_array(target.points()[nb.index]);
                let vt_proj = vt_adj - (vt_adj - vt).dot(nt) * nt;
                let a = vt_proj - vt;
                let b = intensity(&colors[nb.index]) - it;
                ata += outer(a, a);
                atb += a * b;
            }
            // the gradient lies in the tangent plane
            let c = count as f64 * nt;
            ata += outer(c, c);

            let det = ata.determinant();
            let trace = ata.x_axis.x + ata.y_axis.y + ata.z_axis.z;
            if !(det.abs() > 1e-15 * trace.powi(3)) {
                return [0.0; 3];
            }
            (ata.inverse() * atb).to_array()
        })
        .collect();

    Ok(gradients)
}

struct ColoredTerms {
    geometric: f64,
    photometric: f64,
    j_geometric: [f64; 6],
    j_photometric: [f64; 6],
}

fn colored_terms(
    source: &PointCloud,
    target: &PointCloud,
    gradients: &[[f64; 3]],
    c: &Correspondence,
    source_colors: &[[u8; 3]],
    target_colors: &[[u8; 3]],
    target_normals: &[[f64; 3]],
) -> ColoredTerms {
    let vs = source.point(c.source);
    let vt = target.point(c.target);
    let nt = DVec3::from_array(target_normals[c.target]);
    let dit = DVec3::from_array(gradients[c.target]);
    let is = intensity(&source_colors[c.source]);
    let it = intensity(&target_colors[c.target]);

    let geometric = (vs - vt).dot(nt);
    let vs_proj = vs - geometric * nt;
    let is0_proj = dit.dot(vs_proj - vt) + it;
    let photometric = is - is0_proj;

    // d(is0_proj)/d(vs) = ditᵀ (I - nt ntᵀ)
    let m = DMat3::IDENTITY - outer(nt, nt);
    let dit_m = -(m.transpose() * dit);

    let g = vs.cross(nt);
    let p = vs.cross(dit_m);

    ColoredTerms {
        geometric,
        photometric,
        j_geometric: [g.x, g.y, g.z, nt.x, nt.y, nt.z],
        j_photometric: [p.x, p.y, p.z, dit_m.x, dit_m.y, dit_m.z],
    }
}

/// One colored ICP step.
///
/// The geometric term is weighted by `sqrt(λ)` and the photometric term by
/// `sqrt(1 − λ)`; both go into a single 6x6 system.
pub fn compute_transformation(
    source: &PointCloud,
    target: &PointCloud,
    target_gradients: &[[f64; 3]],
    correspondences: &[Correspondence],
    lambda_geometric: f64,
    kernel: &RobustKernel,
) -> Result<DMat4, EstimationError> {
    if correspondences.is_empty() {
        return Err(EstimationError::DegenerateCorrespondence(0));
    }
    let source_colors = source
        .colors()
        .ok_or(EstimationError::MissingAttribute("source colors"))?;
    let target_colors = target
        .colors()
        .ok_or(EstimationError::MissingAttribute("target colors"))?;
    let target_normals = target
        .normals()
        .ok_or(EstimationError::MissingAttribute("target normals"))?;
    if target_gradients.len() != target.len() {
        return Err(EstimationError::MissingAttribute("target color gradients"));
    }

    let sqrt_geometric = lambda_geometric.sqrt();
    let sqrt_photometric = (1.0 - lambda_geometric).sqrt();

    let system = accumulate(correspondences, |sys, c| {
        let terms = colored_terms(
            source,
            target,
            target_gradients,
            c,
            source_colors,
            target_colors,
            target_normals,
        );

        let r0 = sqrt_geometric * terms.geometric;
        let j0 = terms.j_geometric.map(|v| sqrt_geometric * v);
        sys.add_row(&j0, r0, kernel.weight(r0));

        let r1 = sqrt_photometric * terms.photometric;
        let j1 = terms.j_photometric.map(|v| sqrt_photometric * v);
        sys.add_row(&j1, r1, kernel.weight(r1));
    });

    let x = system.solve().ok_or(EstimationError::NumericalSingularity)?;
    Ok(transform_from_vector(&x))
}

/// Root of the mean `λ r_geo² + (1 − λ) r_photo²` over the correspondences.
pub fn compute_rmse(
    source: &PointCloud,
    target: &PointCloud,
    target_gradients: &[[f64; 3]],
    correspondences: &[Correspondence],
    lambda_geometric: f64,
) -> f64 {
    let (Some(source_colors), Some(target_colors), Some(target_normals)) =
        (source.colors(), target.colors(), target.normals())
    else {
        return 0.0;
    };
    if correspondences.is_empty() || target_gradients.len() != target.len() {
        return 0.0;
    }
    let sum = correspondences
        .iter()
        .map(|c| {
            let t = colored_terms(
                source,
                target,
                target_gradients,
                c,
                source_colors,
                target_colors,
                target_normals,
            );
            lambda_geometric * t.geometric * t.geometric
                + (1.0 - lambda_geometric) * t.photometric * t.photometric
        })
        .sum::<f64>();
    (sum / correspondences.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::point_to_plane;
    use kornia_3d::transforms;

    // z = 0 plane whose gray level grows linearly along x
    fn ramp_plane() -> PointCloud {
        let mut points = Vec::new();
        let mut colors = Vec::new();
        for i in 0..21 {
            for j in 0..21 {
                let x = i as f64 * 0.05;
                let y = j as f64 * 0.05;
                points.push([x, y, 0.0]);
                let g = (x * 200.0).round() as u8;
                colors.push([g, g, g]);
            }
        }
        let n = points.len();
        PointCloud::new(points, Some(colors), Some(vec![[0.0, 0.0, 1.0]; n]))
            .unwrap_or_default()
    }

    fn cube_surface_colored(steps: usize) -> PointCloud {
        let mut points = Vec::new();
        let mut normals = Vec::new();
        let mut colors = Vec::new();
        for axis in 0..3 {
            for side in [0.0, 1.0] {
                for i in 0..steps {
                    for j in 0..steps {
                        let u = (i as f64 + 0.5) / steps as f64;
                        let v = (j as f64 + 0.5) / steps as f64;
                        let mut p = [0.0; 3];
                        p[axis] = side;
                        p[(axis + 1) % 3] = u;
                        p[(axis + 2) % 3] = v;
                        let mut n = [0.0; 3];
                        n[axis] = if side > 0.5 { 1.0 } else { -1.0 };
                        let g = (127.0 + 100.0 * (3.0 * p[0] + 2.0 * p[1] - p[2]).sin()) as u8;
                        points.push(p);
                        normals.push(n);
                        colors.push([g, g / 2, 255 - g]);
                    }
                }
            }
        }
        PointCloud::new(points, Some(colors), Some(normals)).unwrap_or_default()
    }

    fn identity_pairs(n: usize) -> Vec<Correspondence> {
        (0..n)
            .map(|i| Correspondence {
                source: i,
                target: i,
                distance_squared: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_intensity() {
        assert_eq!(intensity(&[0, 0, 0]), 0.0);
        assert_eq!(intensity(&[255, 255, 255]), 1.0);
        approx::assert_relative_eq!(intensity(&[255, 0, 0]), 1.0 / 3.0);
    }

    #[test]
    fn test_color_gradient_of_ramp() -> Result<(), Box<dyn std::error::Error>> {
        let cloud = ramp_plane();
        let index = KdTree::new(cloud.points())?;
        let gradients = compute_color_gradients(&cloud, &index, 0.12, GRADIENT_MAX_NN)?;

        // interior point, away from the border
        let k = 10 * 21 + 10;
        let expected = 200.0 / 255.0;
        assert!((gradients[k][0] - expected).abs() < 0.05, "{:?}", gradients[k]);
        assert!(gradients[k][1].abs() < 0.05);
        assert!(gradients[k][2].abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_color_gradient_sparse_neighborhood_is_zero() -> Result<(), Box<dyn std::error::Error>> {
        let cloud = ramp_plane();
        let index = KdTree::new(cloud.points())?;
        let gradients = compute_color_gradients(&cloud, &index, 0.01, GRADIENT_MAX_NN)?;
        assert!(gradients.iter().all(|g| *g == [0.0; 3]));
        Ok(())
    }

    #[test]
    fn test_color_gradient_requires_colors() -> Result<(), Box<dyn std::error::Error>> {
        let cloud = PointCloud::from_points(vec![[0.0; 3]]).with_normals(vec![[0.0, 0.0, 1.0]])?;
        let index = KdTree::new(cloud.points())?;
        assert!(matches!(
            compute_color_gradients(&cloud, &index, 1.0, 10),
            Err(RegistrationError::MissingAttribute {
                attribute: "colors",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_pure_geometric_matches_point_to_plane() -> Result<(), Box<dyn std::error::Error>> {
        let target = cube_surface_colored(5);
        let index = KdTree::new(target.points())?;
        let gradients = compute_color_gradients(&target, &index, 0.5, GRADIENT_MAX_NN)?;

        let motion = transforms::axis_angle_to_transform(&[0.0, 1.0, 1.0], 0.02, &[0.01, 0.0, -0.01])?;
        let source = target.transform(&motion.inverse());
        let corres = identity_pairs(target.len());

        let colored = compute_transformation(&source, &target, &gradients, &corres, 1.0, &RobustKernel::L2)?;
        let plane = point_to_plane::compute_transformation(&source, &target, &corres, &RobustKernel::L2)?;
        assert!(colored.abs_diff_eq(plane, 1e-9));
        Ok(())
    }

    #[test]
    fn test_colored_step_reduces_residual() -> Result<(), Box<dyn std::error::Error>> {
        let target = cube_surface_colored(8);
        let index = KdTree::new(target.points())?;
        let gradients = compute_color_gradients(&target, &index, 0.3, GRADIENT_MAX_NN)?;

        let motion = transforms::axis_angle_to_transform(&[1.0, 0.0, 1.0], 0.01, &[0.005, 0.01, 0.0])?;
        let source = target.transform(&motion.inverse());
        let corres = identity_pairs(target.len());

        let step = compute_transformation(&source, &target, &gradients, &corres, 0.968, &RobustKernel::L2)?;
        assert!(transforms::is_rigid(&step, 1e-9));

        let before = compute_rmse(&source, &target, &gradients, &corres, 0.968);
        let after = compute_rmse(&source.transform(&step), &target, &gradients, &corres, 0.968);
        assert!(after < before, "{after} >= {before}");
        Ok(())
    }
}
