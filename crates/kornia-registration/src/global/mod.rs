//! Global registration from putative correspondences.
//!
//! Both strategies start from candidate pairs, usually obtained by matching
//! per-point feature descriptors, and need no initial transform:
//!
//! * [`ransac`] samples minimal sets, fits point-to-point and keeps the model
//!   with the most inlier candidates.
//! * [`fgr`] minimizes a Geman-McClure objective over all candidates, annealing
//!   its scale from convex to strongly non-convex.

use kornia_3d::pointcloud::PointCloud;

use crate::error::RegistrationError;

/// Fast global registration.
pub mod fgr;

/// Feature descriptors and descriptor matching.
pub mod features;

/// RANSAC over correspondences.
pub mod ransac;

pub use features::{correspondences_from_features, Features};
pub use fgr::{
    registration_fgr_based_on_correspondence, registration_fgr_based_on_feature_matching,
    FastGlobalRegistrationOption,
};
pub use ransac::{
    registration_ransac_based_on_correspondence, registration_ransac_based_on_feature_matching,
    CorrespondenceChecker, RansacParams,
};

// Candidate pairs must point inside both clouds.
fn validate_candidates(
    source: &PointCloud,
    target: &PointCloud,
    candidates: &[(usize, usize)],
) -> Result<(), RegistrationError> {
    if let Some((s, t)) = candidates
        .iter()
        .find(|(s, t)| *s >= source.len() || *t >= target.len())
    {
        return Err(RegistrationError::InvalidInput(format!(
            "candidate ({s}, {t}) out of range for clouds with {} and {} points",
            source.len(),
            target.len()
        )));
    }
    Ok(())
}

// Features must describe every point of their cloud.
fn validate_features(
    cloud: &PointCloud,
    features: &Features,
    name: &str,
) -> Result<(), RegistrationError> {
    if features.len() != cloud.len() {
        return Err(RegistrationError::InvalidInput(format!(
            "{name} features describe {} points but the cloud has {}",
            features.len(),
            cloud.len()
        )));
    }
    Ok(())
}
