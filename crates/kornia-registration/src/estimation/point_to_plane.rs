use glam::{DMat4, DVec3};
use kornia_3d::pointcloud::PointCloud;

use super::linear_system::{accumulate, transform_from_vector};
use crate::correspondence::Correspondence;
use crate::error::EstimationError;
use crate::robust::RobustKernel;

/// One Gauss-Newton step minimizing `Σ w ((p − q) · n)²` with target normals `n`.
///
/// The rotation is linearized around the current source, giving the Jacobian
/// row `[p × n, n]` for each pair.
pub fn compute_transformation(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
    kernel: &RobustKernel,
) -> Result<DMat4, EstimationError> {
    if correspondences.is_empty() {
        return Err(EstimationError::DegenerateCorrespondence(0));
    }
    let normals = target
        .normals()
        .ok_or(EstimationError::MissingAttribute("target normals"))?;

    let system = accumulate(correspondences, |sys, c| {
        let p = source.point(c.source);
        let q = target.point(c.target);
        let n = DVec3::from_array(normals[c.target]);

        let r = (p - q).dot(n);
        let pxn = p.cross(n);
        let j = [pxn.x, pxn.y, pxn.z, n.x, n.y, n.z];
        sys.add_row(&j, r, kernel.weight(r));
    });

    let x = system.solve().ok_or(EstimationError::NumericalSingularity)?;
    Ok(transform_from_vector(&x))
}

/// Root mean square point-to-plane distance over the correspondences.
pub fn compute_rmse(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
) -> f64 {
    let Some(normals) = target.normals() else {
        return 0.0;
    };
    if correspondences.is_empty() {
        return 0.0;
    }
    let sum = correspondences
        .iter()
        .map(|c| {
            let r = (source.point(c.source) - target.point(c.target))
                .dot(DVec3::from_array(normals[c.target]));
            r * r
        })
        .sum::<f64>();
    (sum / correspondences.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kornia_3d::transforms;

    // points on the faces of the unit cube with outward normals
    fn cube_surface(steps: usize) -> PointCloud {
        let mut points = Vec::new();
        let mut normals = Vec::new();
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
                        points.push(p);
                        normals.push(n);
                    }
                }
            }
        }
        PointCloud::from_points(points)
            .with_normals(normals)
            .unwrap_or_default()
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
    fn test_point_to_plane_small_motion() -> Result<(), Box<dyn std::error::Error>> {
        let target = cube_surface(6);
        let motion = transforms::axis_angle_to_transform(&[1.0, 2.0, 3.0], 0.01, &[0.01, -0.02, 0.005])?;
        let source = target.transform(&motion.inverse());
        let corres = identity_pairs(target.len());

        let step = compute_transformation(&source, &target, &corres, &RobustKernel::L2)?;
        assert!(transforms::is_rigid(&step, 1e-9));

        // a single linearized step lands close to the true motion
        assert!(transforms::rotation_error(&step, &motion) < 1e-3);
        assert!(transforms::translation_error(&step, &motion) < 1e-3);

        let moved = source.transform(&step);
        assert!(compute_rmse(&moved, &target, &corres) < compute_rmse(&source, &target, &corres));
        Ok(())
    }

    #[test]
    fn test_point_to_plane_errors() {
        let target = cube_surface(2);
        assert_eq!(
            compute_transformation(&target, &target, &[], &RobustKernel::L2),
            Err(EstimationError::DegenerateCorrespondence(0))
        );

        let bare = PointCloud::from_points(target.points().to_vec());
        let corres = identity_pairs(bare.len());
        assert_eq!(
            compute_transformation(&bare, &bare, &corres, &RobustKernel::L2),
            Err(EstimationError::MissingAttribute("target normals"))
        );

        // a single plane cannot constrain in-plane motion
        let plane = PointCloud::from_points(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])
            .with_normals(vec![[0.0, 0.0, 1.0]; 3])
            .unwrap_or_default();
        let corres = identity_pairs(3);
        assert_eq!(
            compute_transformation(&plane, &plane, &corres, &RobustKernel::L2),
            Err(EstimationError::NumericalSingularity)
        );
    }
}
