use glam::{DMat4, DVec3};

use crate::linalg;

/// Error types for the point cloud module.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PointCloudError {
    /// A per-point attribute does not match the number of points.
    #[error("the {attribute} attribute has {actual} entries but the cloud has {expected} points")]
    AttributeLengthMismatch {
        /// Name of the offending attribute.
        attribute: &'static str,
        /// Number of points in the cloud.
        expected: usize,
        /// Number of entries in the attribute.
        actual: usize,
    },

    /// A point index is out of range.
    #[error("point index {index} out of range for a cloud with {len} points")]
    IndexOutOfRange {
        /// The offending index.
        index: usize,
        /// Number of points in the cloud.
        len: usize,
    },

    /// The voxel size must be strictly positive and finite.
    #[error("invalid voxel size {0}")]
    InvalidVoxelSize(f64),
}

/// A point cloud with points and optional per-point colors, normals and covariances.
///
/// Every present attribute has exactly one entry per point.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawPointCloud"))]
pub struct PointCloud {
    // The points in the point cloud.
    points: Vec<[f64; 3]>,
    // The colors of the points.
    colors: Option<Vec<[u8; 3]>>,
    // The unit normals of the points.
    normals: Option<Vec<[f64; 3]>>,
    // The row-major covariance matrices of the points.
    covariances: Option<Vec<[[f64; 3]; 3]>>,
}

// Unvalidated wire form, checked by `TryFrom` before it becomes a `PointCloud`.
#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawPointCloud {
    points: Vec<[f64; 3]>,
    colors: Option<Vec<[u8; 3]>>,
    normals: Option<Vec<[f64; 3]>>,
    covariances: Option<Vec<[[f64; 3]; 3]>>,
}

#[cfg(feature = "serde")]
impl TryFrom<RawPointCloud> for PointCloud {
    type Error = PointCloudError;

    fn try_from(raw: RawPointCloud) -> Result<Self, Self::Error> {
        let cloud = Self::new(raw.points, raw.colors, raw.normals)?;
        match raw.covariances {
            Some(covariances) => cloud.with_covariances(covariances),
            None => Ok(cloud),
        }
    }
}

fn check_len(attribute: &'static str, expected: usize, actual: usize) -> Result<(), PointCloudError> {
    if expected != actual {
        return Err(PointCloudError::AttributeLengthMismatch {
            attribute,
            expected,
            actual,
        });
    }
    Ok(())
}

impl PointCloud {
    /// Create a new point cloud from points, colors (optional), and normals (optional).
    ///
    /// # Errors
    ///
    /// Returns [`PointCloudError::AttributeLengthMismatch`] if an attribute length
    /// differs from the number of points.
    pub fn new(
        points: Vec<[f64; 3]>,
        colors: Option<Vec<[u8; 3]>>,
        normals: Option<Vec<[f64; 3]>>,
    ) -> Result<Self, PointCloudError> {
        if let Some(colors) = &colors {
            check_len("colors", points.len(), colors.len())?;
        }
        if let Some(normals) = &normals {
            check_len("normals", points.len(), normals.len())?;
        }
        Ok(Self {
            points,
            colors,
            normals,
            covariances: None,
        })
    }

    // Assemble a cloud whose attribute lengths are already known to agree.
    pub(crate) fn from_raw_parts(
        points: Vec<[f64; 3]>,
        colors: Option<Vec<[u8; 3]>>,
        normals: Option<Vec<[f64; 3]>>,
        covariances: Option<Vec<[[f64; 3]; 3]>>,
    ) -> Self {
        Self {
            points,
            colors,
            normals,
            covariances,
        }
    }

    /// Create a point cloud holding only coordinates.
    pub fn from_points(points: Vec<[f64; 3]>) -> Self {
        Self {
            points,
            ..Default::default()
        }
    }

    /// Attach per-point colors.
    pub fn with_colors(mut self, colors: Vec<[u8; 3]>) -> Result<Self, PointCloudError> {
        check_len("colors", self.points.len(), colors.len())?;
        self.colors = Some(colors);
        Ok(self)
    }

    /// Attach per-point unit normals.
    pub fn with_normals(mut self, normals: Vec<[f64; 3]>) -> Result<Self, PointCloudError> {
        check_len("normals", self.points.len(), normals.len())?;
        self.normals = Some(normals);
        Ok(self)
    }

    /// Attach per-point covariance matrices in row-major layout.
    pub fn with_covariances(
        mut self,
        covariances: Vec<[[f64; 3]; 3]>,
    ) -> Result<Self, PointCloudError> {
        check_len("covariances", self.points.len(), covariances.len())?;
        self.covariances = Some(covariances);
        Ok(self)
    }

    /// Get the number of points in the point cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get as reference the points in the point cloud.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Get as reference the colors of the points in the point cloud.
    pub fn colors(&self) -> Option<&[[u8; 3]]> {
        self.colors.as_deref()
    }

    /// Get as reference the normals of the points in the point cloud.
    pub fn normals(&self) -> Option<&[[f64; 3]]> {
        self.normals.as_deref()
    }

    /// Get as reference the covariances of the points in the point cloud.
    pub fn covariances(&self) -> Option<&[[[f64; 3]; 3]]> {
        self.covariances.as_deref()
    }

    /// Whether the cloud carries colors.
    #[inline]
    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    /// Whether the cloud carries normals.
    #[inline]
    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Whether the cloud carries covariances.
    #[inline]
    pub fn has_covariances(&self) -> bool {
        self.covariances.is_some()
    }

    /// Get the point at `index` as a vector.
    #[inline]
    pub fn point(&self, index: usize) -> DVec3 {
        DVec3::from_array(self.points[index])
    }

    /// Get the minimum bound of the point cloud.
    pub fn get_min_bound(&self) -> DVec3 {
        match self.points.first() {
            None => DVec3::ZERO,
            Some(first) => self
                .points
                .iter()
                .fold(DVec3::from_array(*first), |a, b| a.min(DVec3::from_array(*b))),
        }
    }

    /// Get the maximum bound of the point cloud.
    pub fn get_max_bound(&self) -> DVec3 {
        match self.points.first() {
            None => DVec3::ZERO,
            Some(first) => self
                .points
                .iter()
                .fold(DVec3::from_array(*first), |a, b| a.max(DVec3::from_array(*b))),
        }
    }

    /// Get the centroid of the points.
    pub fn get_center(&self) -> DVec3 {
        linalg::centroid(&self.points)
    }

    /// Return a copy of the cloud with a rigid transform applied.
    ///
    /// Points are transformed, normals rotated and covariances conjugated by the
    /// rotation block. Colors are copied unchanged.
    pub fn transform(&self, transform: &DMat4) -> Self {
        let rotation = linalg::rotation_part(transform);
        Self {
            points: linalg::transform_points(&self.points, transform),
            colors: self.colors.clone(),
            normals: self
                .normals
                .as_ref()
                .map(|normals| linalg::rotate_vectors(normals, &rotation)),
            covariances: self.covariances.as_ref().map(|covs| {
                covs.iter()
                    .map(|c| linalg::rotate_covariance(c, &rotation))
                    .collect()
            }),
        }
    }

    /// Return the sub-cloud made of the points at `indices`, with all attributes.
    pub fn select(&self, indices: &[usize]) -> Result<Self, PointCloudError> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.points.len()) {
            return Err(PointCloudError::IndexOutOfRange {
                index,
                len: self.points.len(),
            });
        }
        Ok(Self {
            points: indices.iter().map(|&i| self.points[i]).collect(),
            colors: self
                .colors
                .as_ref()
                .map(|c| indices.iter().map(|&i| c[i]).collect()),
            normals: self
                .normals
                .as_ref()
                .map(|n| indices.iter().map(|&i| n[i]).collect()),
            covariances: self
                .covariances
                .as_ref()
                .map(|c| indices.iter().map(|&i| c[i]).collect()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pointcloud() -> Result<(), PointCloudError> {
        let pointcloud = PointCloud::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            Some(vec![[255, 0, 0], [0, 255, 0]]),
            Some(vec![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]),
        )?;

        assert_eq!(pointcloud.len(), 2);
        assert_eq!(pointcloud.points().len(), 2);
        assert!(pointcloud.has_colors());
        assert!(pointcloud.has_normals());
        assert!(!pointcloud.has_covariances());

        if let Some(p1) = pointcloud.points().last() {
            assert_eq!(*p1, [1.0, 0.0, 0.0]);
        }

        assert_eq!(pointcloud.get_min_bound(), DVec3::ZERO);
        assert_eq!(pointcloud.get_max_bound(), DVec3::X);
        assert_eq!(pointcloud.get_center(), DVec3::new(0.5, 0.0, 0.0));

        Ok(())
    }

    #[test]
    fn test_pointcloud_length_mismatch() {
        let res = PointCloud::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            Some(vec![[255, 0, 0]]),
            None,
        );
        assert_eq!(
            res,
            Err(PointCloudError::AttributeLengthMismatch {
                attribute: "colors",
                expected: 2,
                actual: 1,
            })
        );

        let res = PointCloud::from_points(vec![[0.0; 3]]).with_covariances(vec![]);
        assert!(matches!(
            res,
            Err(PointCloudError::AttributeLengthMismatch {
                attribute: "covariances",
                ..
            })
        ));
    }

    #[test]
    fn test_pointcloud_transform() -> Result<(), PointCloudError> {
        let cov = [[4.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let cloud = PointCloud::from_points(vec![[1.0, 0.0, 0.0]])
            .with_normals(vec![[1.0, 0.0, 0.0]])?
            .with_covariances(vec![cov])?;

        let transform = linalg::rigid_transform(
            &glam::DMat3::from_rotation_z(std::f64::consts::FRAC_PI_2),
            DVec3::new(0.0, 0.0, 1.0),
        );
        let moved = cloud.transform(&transform);

        let p = moved.points()[0];
        assert_relative_eq!(p[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(p[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(p[2], 1.0, epsilon = 1e-12);

        // normals are rotated but not translated
        let n = moved.normals().map(|n| n[0]).unwrap_or_default();
        assert_relative_eq!(n[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(n[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(n[2], 0.0, epsilon = 1e-12);

        let c = moved.covariances().map(|c| c[0]).unwrap_or_default();
        assert_relative_eq!(c[0][0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(c[1][1], 4.0, epsilon = 1e-12);

        Ok(())
    }

    #[test]
    fn test_pointcloud_select() -> Result<(), PointCloudError> {
        let cloud = PointCloud::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]],
            Some(vec![[1, 1, 1], [2, 2, 2], [3, 3, 3]]),
            None,
        )?;
        let sub = cloud.select(&[2, 0])?;
        assert_eq!(sub.points(), &[[2.0, 0.0, 0.0], [0.0, 0.0, 0.0]]);
        assert_eq!(sub.colors(), Some(&[[3, 3, 3], [1, 1, 1]][..]));

        assert_eq!(
            cloud.select(&[3]),
            Err(PointCloudError::IndexOutOfRange { index: 3, len: 3 })
        );
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_pointcloud_deserialize_validates_lengths() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"{"points":[[0,0,0],[1,0,0],[0,1,0],[1,1,0]],"colors":null,"normals":[[0,0,1]],"covariances":null}"#;
        let err = serde_json::from_str::<PointCloud>(json).map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("normals"));

        let cloud = PointCloud::from_points(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]])
            .with_normals(vec![[0.0, 0.0, 1.0]; 2])?
            .with_covariances(vec![[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]; 2])?;
        let parsed: PointCloud = serde_json::from_str(&serde_json::to_string(&cloud)?)?;
        assert_eq!(parsed, cloud);
        Ok(())
    }
}
