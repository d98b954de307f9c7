use std::borrow::Cow;

use glam::DMat4;
use kornia_3d::{pointcloud::PointCloud, voxel_grid::VoxelGrid};

use crate::error::RegistrationError;
use crate::estimation::TransformationEstimation;
use crate::icp::{refine, validate_inputs, ICPConvergenceCriteria};
use crate::result::RegistrationResult;

/// Reduces a cloud to a coarser resolution.
pub trait Downsampler {
    /// Downsample `cloud` with the given voxel size, keeping every attribute.
    fn downsample(&self, cloud: &PointCloud, voxel_size: f64) -> Result<PointCloud, RegistrationError>;
}

/// [`Downsampler`] backed by [`VoxelGrid`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VoxelDownsampler;

impl Downsampler for VoxelDownsampler {
    fn downsample(&self, cloud: &PointCloud, voxel_size: f64) -> Result<PointCloud, RegistrationError> {
        Ok(VoxelGrid::new(voxel_size)?.downsample(cloud))
    }
}

/// One resolution level of a multi-scale registration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MultiScaleStage {
    /// Voxel size used to downsample both clouds, `None` for full resolution.
    pub voxel_size: Option<f64>,
    /// Iteration budget of the stage.
    pub max_iteration: usize,
    /// Correspondence distance of the stage.
    pub max_correspondence_distance: f64,
}

impl MultiScaleStage {
    /// A downsampled stage.
    pub fn new(voxel_size: f64, max_iteration: usize, max_correspondence_distance: f64) -> Self {
        Self {
            voxel_size: Some(voxel_size),
            max_iteration,
            max_correspondence_distance,
        }
    }

    /// A full resolution stage.
    pub fn full_resolution(max_iteration: usize, max_correspondence_distance: f64) -> Self {
        Self {
            voxel_size: None,
            max_iteration,
            max_correspondence_distance,
        }
    }
}

fn validate_stages(stages: &[MultiScaleStage]) -> Result<(), RegistrationError> {
    let Some(last) = stages.last() else {
        return Err(RegistrationError::InvalidParameter(
            "multi-scale registration needs at least one stage".to_string(),
        ));
    };
    if last.voxel_size.is_some() {
        return Err(RegistrationError::InvalidParameter(
            "the last stage must run at full resolution".to_string(),
        ));
    }

    let mut previous: Option<f64> = None;
    for (i, stage) in stages.iter().enumerate() {
        if stage.max_iteration == 0 {
            return Err(RegistrationError::InvalidParameter(format!(
                "stage {i}: max_iteration must be at least 1"
            )));
        }
        let Some(size) = stage.voxel_size else {
            if i + 1 != stages.len() {
                return Err(RegistrationError::InvalidParameter(format!(
                    "stage {i}: only the last stage may run at full resolution"
                )));
            }
            continue;
        };
        if !(size.is_finite() && size > 0.0) {
            return Err(RegistrationError::InvalidParameter(format!(
                "stage {i}: voxel size must be positive and finite, got {size}"
            )));
        }
        if let Some(prev) = previous {
            if !(size < prev) {
                return Err(RegistrationError::InvalidParameter(format!(
                    "stage {i}: voxel sizes must be strictly decreasing, got {size} after {prev}"
                )));
            }
        }
        previous = Some(size);
    }
    Ok(())
}

/// Coarse-to-fine ICP.
///
/// Each stage downsamples both clouds with `downsampler` (or uses them as is
/// for the full resolution stage), then runs the refinement loop seeded with
/// the previous stage's transform. `criteria` provides the convergence
/// thresholds and time budget; the iteration budget comes from each stage.
///
/// The returned result is the one of the last stage, with `num_iterations`
/// summed over all stages.
pub fn registration_multi_scale_icp<D: Downsampler + ?Sized>(
    source: &PointCloud,
    target: &PointCloud,
    stages: &[MultiScaleStage],
    init: &DMat4,
    estimation: &TransformationEstimation,
    criteria: &ICPConvergenceCriteria,
    downsampler: &D,
) -> Result<RegistrationResult, RegistrationError> {
    validate_inputs(source, target)?;
    validate_stages(stages)?;
    criteria.validate()?;
    estimation.validate(source, target)?;

    let mut transformation = *init;
    let mut total_iterations = 0;
    let mut result = RegistrationResult::new(transformation);

    for (i, stage) in stages.iter().enumerate() {
        let (stage_source, stage_target) = match stage.voxel_size {
            Some(size) => (
                Cow::Owned(downsampler.downsample(source, size)?),
                Cow::Owned(downsampler.downsample(target, size)?),
            ),
            None => (Cow::Borrowed(source), Cow::Borrowed(target)),
        };
        log::debug!(
            "stage {}: voxel size {:?}, {} source and {} target points",
            i,
            stage.voxel_size,
            stage_source.len(),
            stage_target.len()
        );

        if !(stage.max_correspondence_distance > 0.0) || stage_source.is_empty() || stage_target.is_empty() {
            result = RegistrationResult::new(transformation);
            continue;
        }

        let context = estimation.prepare_target(&stage_target, stage.max_correspondence_distance)?;
        result = refine(
            &stage_source,
            &context,
            stage.max_correspondence_distance,
            &transformation,
            estimation,
            &criteria.with_max_iteration(stage.max_iteration),
            None,
        )?;
        transformation = result.transformation;
        total_iterations += result.num_iterations;
    }

    result.num_iterations = total_iterations;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_validate_stages() {
        assert!(validate_stages(&[]).is_err());
        assert!(validate_stages(&[MultiScaleStage::full_resolution(10, 0.1)]).is_ok());
        assert!(validate_stages(&[
            MultiScaleStage::new(0.1, 10, 0.2),
            MultiScaleStage::new(0.05, 10, 0.1),
            MultiScaleStage::full_resolution(10, 0.05),
        ])
        .is_ok());

        // increasing voxel size
        assert!(validate_stages(&[
            MultiScaleStage::new(0.05, 10, 0.2),
            MultiScaleStage::new(0.1, 10, 0.1),
            MultiScaleStage::full_resolution(10, 0.05),
        ])
        .is_err());
        // full resolution in the middle
        assert!(validate_stages(&[
            MultiScaleStage::full_resolution(10, 0.2),
            MultiScaleStage::full_resolution(10, 0.1),
        ])
        .is_err());
        // ends downsampled
        assert!(validate_stages(&[MultiScaleStage::new(0.1, 10, 0.2)]).is_err());
        assert!(validate_stages(&[
            MultiScaleStage::new(-1.0, 10, 0.2),
            MultiScaleStage::full_resolution(10, 0.1),
        ])
        .is_err());
        assert!(validate_stages(&[MultiScaleStage::full_resolution(0, 0.1)]).is_err());
    }

    #[test]
    fn test_voxel_downsampler() -> Result<(), Box<dyn std::error::Error>> {
        let cloud = PointCloud::from_points(vec![[0.0; 3], [0.01, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        let down = VoxelDownsampler.downsample(&cloud, 0.1)?;
        assert_eq!(down.len(), 2);
        assert!(matches!(
            VoxelDownsampler.downsample(&cloud, 0.0),
            Err(RegistrationError::PointCloud(_))
        ));
        Ok(())
    }

    #[test]
    fn test_multi_scale_sums_iterations() -> Result<(), Box<dyn std::error::Error>> {
        let mut rng = StdRng::seed_from_u64(11);
        let points = (0..1000)
            .map(|_| {
                [
                    rng.random_range(0.0..1.0),
                    rng.random_range(0.0..1.0),
                    rng.random_range(0.0..1.0),
                ]
            })
            .collect();
        let target = PointCloud::from_points(points);
        let motion = DMat4::from_translation(glam::DVec3::new(0.02, -0.01, 0.01));
        let source = target.transform(&motion.inverse());

        let stages = [
            MultiScaleStage::new(0.2, 5, 0.3),
            MultiScaleStage::full_resolution(20, 0.05),
        ];
        let criteria = ICPConvergenceCriteria::default().with_max_iteration(1);
        let result = registration_multi_scale_icp(
            &source,
            &target,
            &stages,
            &DMat4::IDENTITY,
            &TransformationEstimation::point_to_point(),
            &criteria,
            &VoxelDownsampler,
        )?;

        assert!(result.num_iterations >= 2);
        assert!(result.num_iterations <= 25);
        assert!(result.transformation.abs_diff_eq(motion, 1e-6));
        Ok(())
    }
}
