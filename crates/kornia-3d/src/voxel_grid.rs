use std::collections::HashMap;

use glam::{DMat3, DVec3};

use crate::linalg;
use crate::pointcloud::{PointCloud, PointCloudError};

/// Running sums of every attribute that falls into one voxel.
#[derive(Debug, Clone)]
struct VoxelAccumulator {
    point_sum: DVec3,
    color_sum: [u64; 3],
    normal_sum: DVec3,
    covariance_sum: DMat3,
    count: usize,
}

impl VoxelAccumulator {
    fn new() -> Self {
        Self {
            point_sum: DVec3::ZERO,
            color_sum: [0; 3],
            normal_sum: DVec3::ZERO,
            covariance_sum: DMat3::ZERO,
            count: 0,
        }
    }
}

/// A 3D voxel grid for downsampling point clouds.
///
/// Every occupied voxel is replaced by the average of its points. Colors and
/// covariances are averaged, normals are averaged and re-normalized. Output
/// points are ordered by the first point that touched each voxel.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    /// The edge length of a voxel.
    voxel_size: f64,
    /// Minimum number of points required per voxel.
    min_points_per_voxel: usize,
}

impl VoxelGrid {
    /// Creates a new `VoxelGrid` with the specified voxel size.
    ///
    /// # Errors
    ///
    /// Returns [`PointCloudError::InvalidVoxelSize`] if the size is not a positive finite number.
    pub fn new(voxel_size: f64) -> Result<Self, PointCloudError> {
        if !(voxel_size.is_finite() && voxel_size > 0.0) {
            return Err(PointCloudError::InvalidVoxelSize(voxel_size));
        }
        Ok(Self {
            voxel_size,
            min_points_per_voxel: 1,
        })
    }

    /// Sets the minimum number of points a voxel needs to be kept.
    pub fn with_min_points_per_voxel(mut self, min_points: usize) -> Self {
        self.min_points_per_voxel = min_points.max(1);
        self
    }

    /// Gets the voxel size.
    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    /// Gets the minimum number of points required per voxel.
    pub fn min_points_per_voxel(&self) -> usize {
        self.min_points_per_voxel
    }

    /// Computes the voxel index of a point relative to `origin`.
    pub fn voxel_index(&self, origin: DVec3, point: &[f64; 3]) -> (i64, i64, i64) {
        let v = (DVec3::from_array(*point) - origin) / self.voxel_size;
        (v.x.floor() as i64, v.y.floor() as i64, v.z.floor() as i64)
    }

    /// Downsamples the input point cloud by grouping points into voxels and computing centroids.
    ///
    /// # Arguments
    /// * `point_cloud` - The input point cloud to downsample.
    ///
    /// # Returns
    /// A new `PointCloud` carrying the same attributes as the input.
    pub fn downsample(&self, point_cloud: &PointCloud) -> PointCloud {
        let origin = point_cloud.get_min_bound();
        let mut slots: HashMap<(i64, i64, i64), usize> = HashMap::new();
        let mut voxels: Vec<VoxelAccumulator> = Vec::new();

        for (i, point) in point_cloud.points().iter().enumerate() {
            let key = self.voxel_index(origin, point);
            let slot = *slots.entry(key).or_insert_with(|| {
                voxels.push(VoxelAccumulator::new());
                voxels.len() - 1
            });
            let voxel = &mut voxels[slot];

            voxel.point_sum += DVec3::from_array(*point);
            voxel.count += 1;

            if let Some(colors) = point_cloud.colors() {
                let c = colors[i];
                voxel.color_sum[0] += c[0] as u64;
                voxel.color_sum[1] += c[1] as u64;
                voxel.color_sum[2] += c[2] as u64;
            }
            if let Some(normals) = point_cloud.normals() {
                voxel.normal_sum += DVec3::from_array(normals[i]);
            }
            if let Some(covariances) = point_cloud.covariances() {
                voxel.covariance_sum += linalg::mat3_from_rows(&covariances[i]);
            }
        }

        let kept = voxels
            .into_iter()
            .filter(|v| v.count >= self.min_points_per_voxel)
            .collect::<Vec<_>>();

        let points = kept
            .iter()
            .map(|v| (v.point_sum / v.count as f64).to_array())
            .collect::<Vec<_>>();

        let colors = point_cloud.colors().map(|_| {
            kept.iter()
                .map(|v| {
                    let inv_count = 1.0 / v.count as f64;
                    [
                        (v.color_sum[0] as f64 * inv_count).round() as u8,
                        (v.color_sum[1] as f64 * inv_count).round() as u8,
                        (v.color_sum[2] as f64 * inv_count).round() as u8,
                    ]
                })
                .collect::<Vec<_>>()
        });

        let normals = point_cloud.normals().map(|_| {
            kept.iter()
                .map(|v| {
                    let mean = v.normal_sum / v.count as f64;
                    mean.try_normalize().unwrap_or(mean).to_array()
                })
                .collect::<Vec<_>>()
        });

        let covariances = point_cloud.covariances().map(|_| {
            kept.iter()
                .map(|v| linalg::mat3_to_rows(&(v.covariance_sum * (1.0 / v.count as f64))))
                .collect::<Vec<_>>()
        });

        PointCloud::from_raw_parts(points, colors, normals, covariances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_voxel_grid() -> Result<(), PointCloudError> {
        let voxel_grid = VoxelGrid::new(0.5)?;
        assert_eq!(voxel_grid.voxel_size(), 0.5);
        assert_eq!(voxel_grid.min_points_per_voxel(), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_voxel_size() {
        assert_eq!(
            VoxelGrid::new(0.0).map(|_| ()),
            Err(PointCloudError::InvalidVoxelSize(0.0))
        );
        assert!(VoxelGrid::new(-1.0).is_err());
        assert!(VoxelGrid::new(f64::NAN).is_err());
    }

    #[test]
    fn test_downsample_points_only() -> Result<(), PointCloudError> {
        let points = vec![[1.0, 1.0, 1.0], [1.1, 1.1, 1.1], [3.0, 3.0, 3.0]];
        let point_cloud = PointCloud::from_points(points);
        let downsampled = VoxelGrid::new(1.0)?.downsample(&point_cloud);

        assert_eq!(downsampled.len(), 2);
        let centroid = downsampled.points()[0];
        assert!((centroid[0] - 1.05).abs() < 1e-9);
        assert!((centroid[1] - 1.05).abs() < 1e-9);
        assert!((centroid[2] - 1.05).abs() < 1e-9);
        assert_eq!(downsampled.points()[1], [3.0, 3.0, 3.0]);
        assert!(downsampled.colors().is_none());
        assert!(downsampled.normals().is_none());
        assert!(downsampled.covariances().is_none());
        Ok(())
    }

    #[test]
    fn test_downsample_all_attributes() -> Result<(), PointCloudError> {
        let point_cloud = PointCloud::new(
            vec![[1.0, 1.0, 1.0], [1.1, 1.1, 1.1]],
            Some(vec![[255, 0, 0], [0, 255, 0]]),
            Some(vec![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]),
        )?
        .with_covariances(vec![
            [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]],
            [[4.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 4.0]],
        ])?;

        let downsampled = VoxelGrid::new(1.0)?.downsample(&point_cloud);
        assert_eq!(downsampled.len(), 1);

        assert_eq!(downsampled.colors(), Some(&[[128, 128, 0]][..]));

        let normal = downsampled.normals().map(|n| n[0]).unwrap_or_default();
        let s = std::f64::consts::FRAC_1_SQRT_2;
        assert!((normal[0] - s).abs() < 1e-9);
        assert!((normal[1] - s).abs() < 1e-9);
        assert!(normal[2].abs() < 1e-9);

        let cov = downsampled.covariances().map(|c| c[0]).unwrap_or_default();
        assert!((cov[0][0] - 3.0).abs() < 1e-9);
        assert!((cov[2][2] - 3.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_min_points_per_voxel() -> Result<(), PointCloudError> {
        let point_cloud =
            PointCloud::from_points(vec![[0.1, 0.1, 0.1], [0.2, 0.2, 0.2], [5.0, 5.0, 5.0]]);
        let voxel_grid = VoxelGrid::new(1.0)?.with_min_points_per_voxel(2);
        assert_eq!(voxel_grid.min_points_per_voxel(), 2);

        let downsampled = voxel_grid.downsample(&point_cloud);
        assert_eq!(downsampled.len(), 1);
        Ok(())
    }

    #[test]
    fn test_downsample_empty() -> Result<(), PointCloudError> {
        let downsampled = VoxelGrid::new(1.0)?.downsample(&PointCloud::default());
        assert!(downsampled.is_empty());
        Ok(())
    }
}
