use kornia_3d::pointcloud::PointCloudError;

/// Errors that abort a registration call before any iteration runs.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RegistrationError {
    /// The spatial index was built from an empty point set.
    #[error("cannot build a spatial index from an empty point set")]
    EmptyIndex,

    /// The inputs are not usable, e.g. an empty source cloud.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A cloud lacks an attribute required by the selected estimation.
    #[error("{estimation} requires {attribute} on the {cloud} point cloud")]
    MissingAttribute {
        /// Which cloud is missing the attribute, `source` or `target`.
        cloud: &'static str,
        /// The missing attribute.
        attribute: &'static str,
        /// The estimation that needs it.
        estimation: &'static str,
    },

    /// A configuration value is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Not enough candidate correspondences for a rigid estimate.
    #[error("insufficient correspondences: required {required}, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of correspondences available.
        actual: usize,
    },

    /// Error coming from the point cloud container.
    #[error(transparent)]
    PointCloud(#[from] PointCloudError),
}

/// Non-fatal failures of a single estimation step.
///
/// The refinement loop logs them and continues with an identity increment.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimationError {
    /// The correspondence set is too small to constrain the transform.
    #[error("degenerate correspondence set with {0} pairs")]
    DegenerateCorrespondence(usize),

    /// The linear system or decomposition is singular.
    #[error("numerical singularity in the estimation solve")]
    NumericalSingularity,

    /// The clouds lack an attribute the estimator reads.
    #[error("estimator needs {0} which the clouds do not carry")]
    MissingAttribute(&'static str),
}
