use std::time::{Duration, Instant};

use glam::{DMat4, DVec3};
use kornia_3d::pointcloud::PointCloud;

use crate::correspondence::{find_correspondences, NormalGate};
use crate::error::RegistrationError;
use crate::estimation::{TargetContext, TransformationEstimation};
use crate::result::RegistrationResult;

/// Stopping rules of the refinement loop.
///
/// The loop stops when both the fitness and the RMSE change by less than their
/// thresholds between two iterations, after `max_iteration` iterations, or once
/// `max_duration` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ICPConvergenceCriteria {
    /// Threshold on the absolute change of fitness.
    pub relative_fitness: f64,
    /// Threshold on the absolute change of inlier RMSE.
    pub relative_rmse: f64,
    /// Maximum number of iterations.
    pub max_iteration: usize,
    /// Optional wall-clock budget, checked between iterations.
    pub max_duration: Option<Duration>,
}

impl Default for ICPConvergenceCriteria {
    fn default() -> Self {
        Self {
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            max_iteration: 30,
            max_duration: None,
        }
    }
}

impl ICPConvergenceCriteria {
    /// Set the fitness change threshold.
    pub fn with_relative_fitness(mut self, relative_fitness: f64) -> Self {
        self.relative_fitness = relative_fitness;
        self
    }

    /// Set the RMSE change threshold.
    pub fn with_relative_rmse(mut self, relative_rmse: f64) -> Self {
        self.relative_rmse = relative_rmse;
        self
    }

    /// Set the maximum number of iterations.
    pub fn with_max_iteration(mut self, max_iteration: usize) -> Self {
        self.max_iteration = max_iteration;
        self
    }

    /// Set a wall-clock budget.
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Check that the thresholds are usable.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if !(self.relative_fitness >= 0.0) || !(self.relative_rmse >= 0.0) {
            return Err(RegistrationError::InvalidParameter(format!(
                "convergence thresholds must be non-negative, got fitness {} and rmse {}",
                self.relative_fitness, self.relative_rmse
            )));
        }
        if self.max_iteration == 0 {
            return Err(RegistrationError::InvalidParameter(
                "max_iteration must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_inputs(source: &PointCloud, target: &PointCloud) -> Result<(), RegistrationError> {
    if source.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "source point cloud is empty".to_string(),
        ));
    }
    if target.is_empty() {
        return Err(RegistrationError::InvalidInput(
            "target point cloud is empty".to_string(),
        ));
    }
    let finite = |cloud: &PointCloud| {
        cloud
            .points()
            .iter()
            .all(|p| DVec3::from_array(*p).is_finite())
    };
    if !finite(source) || !finite(target) {
        return Err(RegistrationError::InvalidInput(
            "point coordinates must be finite".to_string(),
        ));
    }
    Ok(())
}

/// Refine `init` with iterative closest point.
///
/// Each iteration matches every source point to its nearest target point within
/// `max_correspondence_distance`, computes a rigid increment with `estimation`
/// and composes it on the left of the current transform.
///
/// # Arguments
///
/// * `source` - The cloud to align.
/// * `target` - The reference cloud.
/// * `max_correspondence_distance` - Maximum pair distance. Non-positive values
///   return an empty result with zero fitness.
/// * `init` - Initial source-to-target transform.
/// * `estimation` - The estimator and its robust kernel.
/// * `criteria` - Convergence criteria.
///
/// # Returns
///
/// The final transform with its fitness, RMSE and correspondences.
///
/// # Errors
///
/// Fails before iterating on empty or non-finite inputs, missing attributes or
/// invalid parameters. Estimation failures inside the loop are logged and
/// replaced by an identity increment.
///
/// # Example
///
/// ```
/// use glam::DMat4;
/// use kornia_3d::pointcloud::PointCloud;
/// use kornia_registration::{
///     estimation::TransformationEstimation, registration_icp, ICPConvergenceCriteria,
/// };
///
/// let target = PointCloud::from_points(vec![
///     [0.0, 0.0, 0.0],
///     [1.0, 0.0, 0.0],
///     [0.0, 1.0, 0.0],
///     [0.0, 0.0, 1.0],
/// ]);
/// let source = target.transform(&DMat4::from_translation([0.05, 0.0, 0.0].into()));
///
/// let result = registration_icp(
///     &source,
///     &target,
///     0.5,
///     &DMat4::IDENTITY,
///     &TransformationEstimation::point_to_point(),
///     &ICPConvergenceCriteria::default(),
/// )?;
/// assert_eq!(result.fitness, 1.0);
/// # Ok::<(), kornia_registration::RegistrationError>(())
/// ```
pub fn registration_icp(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f64,
    init: &DMat4,
    estimation: &TransformationEstimation,
    criteria: &ICPConvergenceCriteria,
) -> Result<RegistrationResult, RegistrationError> {
    registration_icp_with_normal_gate(
        source,
        target,
        max_correspondence_distance,
        init,
        estimation,
        criteria,
        None,
    )
}

/// [`registration_icp`] with correspondences filtered by normal compatibility.
///
/// Both clouds need normals when `normal_gate` is set.
pub fn registration_icp_with_normal_gate(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f64,
    init: &DMat4,
    estimation: &TransformationEstimation,
    criteria: &ICPConvergenceCriteria,
    normal_gate: Option<&NormalGate>,
) -> Result<RegistrationResult, RegistrationError> {
    validate_inputs(source, target)?;
    criteria.validate()?;
    estimation.validate(source, target)?;
    if let Some(gate) = normal_gate {
        NormalGate::new(gate.max_angle)?;
    }
    if !init.is_finite() {
        return Err(RegistrationError::InvalidInput(
            "initial transform must be finite".to_string(),
        ));
    }

    if !(max_correspondence_distance > 0.0) {
        log::debug!("non-positive correspondence distance, nothing to register");
        return Ok(RegistrationResult::new(*init));
    }

    let context = estimation.prepare_target(target, max_correspondence_distance)?;
    refine(
        source,
        &context,
        max_correspondence_distance,
        init,
        estimation,
        criteria,
        normal_gate,
    )
}

// The loop proper, on a validated input and a prepared target.
pub(crate) fn refine(
    source: &PointCloud,
    context: &TargetContext<'_>,
    max_correspondence_distance: f64,
    init: &DMat4,
    estimation: &TransformationEstimation,
    criteria: &ICPConvergenceCriteria,
    normal_gate: Option<&NormalGate>,
) -> Result<RegistrationResult, RegistrationError> {
    let start = Instant::now();
    let target = context.cloud();

    let mut transformation = *init;
    let mut working = source.transform(&transformation);
    let correspondences = find_correspondences(
        &working,
        target,
        context.index(),
        max_correspondence_distance,
        normal_gate,
    )?;
    let mut result =
        RegistrationResult::from_correspondences(transformation, correspondences, source.len());

    log::debug!(
        "{} ICP: initial fitness {:.6}, inlier rmse {:.6}",
        estimation.name(),
        result.fitness,
        result.inlier_rmse
    );

    for i in 0..criteria.max_iteration {
        let now = Instant::now();

        let update = match estimation.compute_transformation(&working, context, &result.correspondences) {
            Ok(update) => update,
            Err(err) => {
                log::warn!("iteration {i}: {err}, keeping the current transform");
                DMat4::IDENTITY
            }
        };

        transformation = update * transformation;
        working = working.transform(&update);

        let previous = (result.fitness, result.inlier_rmse);
        let correspondences = find_correspondences(
            &working,
            target,
            context.index(),
            max_correspondence_distance,
            normal_gate,
        )?;
        result =
            RegistrationResult::from_correspondences(transformation, correspondences, source.len());
        result.num_iterations = i + 1;

        log::debug!(
            "iteration {}: fitness {:.6}, inlier rmse {:.6}, estimator rmse {:.6}, elapsed {:?}",
            i,
            result.fitness,
            result.inlier_rmse,
            estimation.compute_rmse(&working, context, &result.correspondences),
            now.elapsed()
        );

        if (previous.0 - result.fitness).abs() < criteria.relative_fitness
            && (previous.1 - result.inlier_rmse).abs() < criteria.relative_rmse
        {
            result.converged = true;
            log::info!(
                "{} ICP converged in {} iterations, fitness {:.6}, inlier rmse {:.6}",
                estimation.name(),
                result.num_iterations,
                result.fitness,
                result.inlier_rmse
            );
            break;
        }

        if let Some(budget) = criteria.max_duration {
            if start.elapsed() >= budget {
                log::info!("ICP stopped after {} iterations: time budget exhausted", i + 1);
                break;
            }
        }
    }

    Ok(result)
}
