use glam::DVec3;
use kornia_3d::pointcloud::PointCloud;
use rayon::prelude::*;

use crate::error::RegistrationError;
use crate::kdtree::KdTree;

/// A matched pair of source and target points.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Correspondence {
    /// Index of the point in the source cloud.
    pub source: usize,
    /// Index of the point in the target cloud.
    pub target: usize,
    /// Squared Euclidean distance between the two points.
    pub distance_squared: f64,
}

/// Correspondences ordered by source index.
pub type CorrespondenceSet = Vec<Correspondence>;

/// Reject pairs whose normals disagree by more than `max_angle` radians.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NormalGate {
    /// Maximum angle between the source and target normals, in radians.
    pub max_angle: f64,
}

impl NormalGate {
    /// Create a gate from an angle in radians.
    pub fn new(max_angle: f64) -> Result<Self, RegistrationError> {
        if !(0.0..=std::f64::consts::PI).contains(&max_angle) {
            return Err(RegistrationError::InvalidParameter(format!(
                "normal gate angle must be in [0, pi], got {max_angle}"
            )));
        }
        Ok(Self { max_angle })
    }
}

/// Find, for every source point, its nearest target point within `max_distance`.
///
/// # Arguments
///
/// * `source` - The source cloud, already expressed in the target frame.
/// * `target` - The target cloud.
/// * `index` - Spatial index built over `target`'s points.
/// * `max_distance` - Maximum accepted distance. Non-positive values accept nothing.
/// * `normal_gate` - Optional normal compatibility check; needs normals on both clouds.
///
/// # Returns
///
/// The accepted pairs ordered by source index. An empty set is a valid result.
pub fn find_correspondences(
    source: &PointCloud,
    target: &PointCloud,
    index: &KdTree,
    max_distance: f64,
    normal_gate: Option<&NormalGate>,
) -> Result<CorrespondenceSet, RegistrationError> {
    if index.len() != target.len() {
        return Err(RegistrationError::InvalidInput(format!(
            "index holds {} points but the target cloud has {}",
            index.len(),
            target.len()
        )));
    }

    let normals = match normal_gate {
        Some(gate) => {
            let source_normals = source.normals().ok_or(RegistrationError::MissingAttribute {
                cloud: "source",
                attribute: "normals",
                estimation: "normal gated correspondence search",
            })?;
            let target_normals = target.normals().ok_or(RegistrationError::MissingAttribute {
                cloud: "target",
                attribute: "normals",
                estimation: "normal gated correspondence search",
            })?;
            Some((source_normals, target_normals, gate.max_angle.cos()))
        }
        None => None,
    };

    if !(max_distance > 0.0) {
        return Ok(Vec::new());
    }
    let max_distance_squared = max_distance * max_distance;

    let correspondences = source
        .points()
        .par_iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let nn = index.nearest(p)?;
            if nn.distance_squared > max_distance_squared {
                return None;
            }
            if let Some((source_normals, target_normals, min_cos)) = normals {
                let ns = DVec3::from_array(source_normals[i]);
                let nt = DVec3::from_array(target_normals[nn.index]);
                if ns.dot(nt) < min_cos {
                    return None;
                }
            }
            Some(Correspondence {
                source: i,
                target: nn.index,
                distance_squared: nn.distance_squared,
            })
        })
        .collect();

    Ok(correspondences)
}
