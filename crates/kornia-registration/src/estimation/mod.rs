use glam::DMat4;
use kornia_3d::pointcloud::PointCloud;

use crate::correspondence::Correspondence;
use crate::error::{EstimationError, RegistrationError};
use crate::kdtree::KdTree;
use crate::robust::RobustKernel;

pub mod colored;

/// Generalized ICP (plane-to-plane) estimator.
pub mod generalized;

/// 6-DoF normal equations shared by the linearized estimators.
pub mod linear_system;

/// Point-to-plane estimator.
pub mod point_to_plane;

/// Point-to-point (Kabsch) estimator.
pub mod point_to_point;

/// Default weight of the geometric term in colored ICP.
pub const DEFAULT_LAMBDA_GEOMETRIC: f64 = 0.968;

/// How a rigid increment is computed from a correspondence set.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransformationEstimation {
    /// Closed-form weighted Kabsch on point pairs.
    PointToPoint {
        /// Kernel applied to the pair distance.
        kernel: RobustKernel,
    },
    /// Linearized point-to-plane distance. Needs target normals.
    PointToPlane {
        /// Kernel applied to the signed plane distance.
        kernel: RobustKernel,
    },
    /// Joint geometric and photometric residuals. Needs target normals and colors on both clouds.
    ColoredIcp {
        /// Weight of the geometric term, in `[0, 1]`.
        lambda_geometric: f64,
        /// Kernel applied to each scaled residual.
        kernel: RobustKernel,
    },
    /// Plane-to-plane Mahalanobis residuals. Needs covariances on both clouds.
    Generalized {
        /// Kernel applied to the Mahalanobis distance.
        kernel: RobustKernel,
    },
}

impl Default for TransformationEstimation {
    fn default() -> Self {
        Self::point_to_point()
    }
}

impl TransformationEstimation {
    /// Point-to-point with an L2 kernel.
    pub fn point_to_point() -> Self {
        Self::PointToPoint {
            kernel: RobustKernel::L2,
        }
    }

    /// Point-to-plane with an L2 kernel.
    pub fn point_to_plane() -> Self {
        Self::PointToPlane {
            kernel: RobustKernel::L2,
        }
    }

    /// Colored ICP with the default geometric weight and an L2 kernel.
    pub fn colored_icp() -> Self {
        Self::ColoredIcp {
            lambda_geometric: DEFAULT_LAMBDA_GEOMETRIC,
            kernel: RobustKernel::L2,
        }
    }

    /// Generalized ICP with an L2 kernel.
    pub fn generalized() -> Self {
        Self::Generalized {
            kernel: RobustKernel::L2,
        }
    }

    /// Replace the robust kernel.
    pub fn with_kernel(self, kernel: RobustKernel) -> Self {
        match self {
            Self::PointToPoint { .. } => Self::PointToPoint { kernel },
            Self::PointToPlane { .. } => Self::PointToPlane { kernel },
            Self::ColoredIcp {
                lambda_geometric, ..
            } => Self::ColoredIcp {
                lambda_geometric,
                kernel,
            },
            Self::Generalized { .. } => Self::Generalized { kernel },
        }
    }

    /// Human readable name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PointToPoint { .. } => "point-to-point",
            Self::PointToPlane { .. } => "point-to-plane",
            Self::ColoredIcp { .. } => "colored ICP",
            Self::Generalized { .. } => "generalized ICP",
        }
    }

    /// The robust kernel of the estimator.
    pub fn kernel(&self) -> &RobustKernel {
        match self {
            Self::PointToPoint { kernel }
            | Self::PointToPlane { kernel }
            | Self::ColoredIcp { kernel, .. }
            | Self::Generalized { kernel } => kernel,
        }
    }

    /// Check the parameters and the attributes this estimator reads.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InvalidParameter`] for a bad kernel scale or geometric weight.
    /// * [`RegistrationError::MissingAttribute`] when a cloud lacks a required attribute.
    pub fn validate(&self, source: &PointCloud, target: &PointCloud) -> Result<(), RegistrationError> {
        self.kernel().validate()?;

        let estimation = self.name();
        let require = |present: bool, cloud: &'static str, attribute: &'static str| {
            if present {
                Ok(())
            } else {
                Err(RegistrationError::MissingAttribute {
                    cloud,
                    attribute,
                    estimation,
                })
            }
        };

        match *self {
            Self::PointToPoint { .. } => Ok(()),
            Self::PointToPlane { .. } => require(target.has_normals(), "target", "normals"),
            Self::ColoredIcp {
                lambda_geometric, ..
            } => {
                if !(0.0..=1.0).contains(&lambda_geometric) {
                    return Err(RegistrationError::InvalidParameter(format!(
                        "lambda_geometric must be in [0, 1], got {lambda_geometric}"
                    )));
                }
                require(target.has_normals(), "target", "normals")?;
                require(source.has_colors(), "source", "colors")?;
                require(target.has_colors(), "target", "colors")
            }
            Self::Generalized { .. } => {
                require(source.has_covariances(), "source", "covariances")?;
                require(target.has_covariances(), "target", "covariances")
            }
        }
    }

    /// Build the per-target state reused by every iteration: the spatial index
    /// and, for colored ICP, the color gradients.
    ///
    /// Gradients are fitted over neighbors within twice `max_correspondence_distance`.
    pub fn prepare_target<'a>(
        &self,
        target: &'a PointCloud,
        max_correspondence_distance: f64,
    ) -> Result<TargetContext<'a>, RegistrationError> {
        let index = KdTree::new(target.points())?;
        let color_gradients = match self {
            Self::ColoredIcp { .. } => Some(colored::compute_color_gradients(
                target,
                &index,
                2.0 * max_correspondence_distance,
                colored::GRADIENT_MAX_NN,
            )?),
            _ => None,
        };
        Ok(TargetContext {
            cloud: target,
            index,
            color_gradients,
        })
    }

    /// One rigid increment mapping `source` closer to the target.
    pub fn compute_transformation(
        &self,
        source: &PointCloud,
        target: &TargetContext<'_>,
        correspondences: &[Correspondence],
    ) -> Result<DMat4, EstimationError> {
        match self {
            Self::PointToPoint { kernel } => {
                point_to_point::compute_transformation(source, target.cloud, correspondences, kernel)
            }
            Self::PointToPlane { kernel } => {
                point_to_plane::compute_transformation(source, target.cloud, correspondences, kernel)
            }
            Self::ColoredIcp {
                lambda_geometric,
                kernel,
            } => colored::compute_transformation(
                source,
                target.cloud,
                target.color_gradients().ok_or(EstimationError::MissingAttribute(
                    "target color gradients",
                ))?,
                correspondences,
                *lambda_geometric,
                kernel,
            ),
            Self::Generalized { kernel } => {
                generalized::compute_transformation(source, target.cloud, correspondences, kernel)
            }
        }
    }

    /// Residual error the estimator minimizes, as a root mean square.
    pub fn compute_rmse(
        &self,
        source: &PointCloud,
        target: &TargetContext<'_>,
        correspondences: &[Correspondence],
    ) -> f64 {
        match self {
            Self::PointToPoint { .. } => {
                point_to_point::compute_rmse(source, target.cloud, correspondences)
            }
            Self::PointToPlane { .. } => {
                point_to_plane::compute_rmse(source, target.cloud, correspondences)
            }
            Self::ColoredIcp {
                lambda_geometric, ..
            } => target.color_gradients().map_or(0.0, |gradients| {
                colored::compute_rmse(
                    source,
                    target.cloud,
                    gradients,
                    correspondences,
                    *lambda_geometric,
                )
            }),
            Self::Generalized { .. } => {
                generalized::compute_rmse(source, target.cloud, correspondences)
            }
        }
    }
}

/// A target cloud with the state every refinement iteration reuses.
#[derive(Debug, Clone)]
pub struct TargetContext<'a> {
    cloud: &'a PointCloud,
    index: KdTree,
    color_gradients: Option<Vec<[f64; 3]>>,
}

impl<'a> TargetContext<'a> {
    /// The target cloud.
    pub fn cloud(&self) -> &'a PointCloud {
        self.cloud
    }

    /// Spatial index over the target points.
    pub fn index(&self) -> &KdTree {
        &self.index
    }

    /// Per-point intensity gradients, present for colored ICP.
    pub fn color_gradients(&self) -> Option<&[[f64; 3]]> {
        self.color_gradients.as_deref()
    }
}
