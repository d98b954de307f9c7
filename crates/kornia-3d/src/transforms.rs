use glam::{DMat3, DMat4, DVec3};

use crate::linalg;

/// Error types for the transforms module.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TransformError {
    /// The rotation axis has zero length.
    #[error("cannot compute rotation matrix from a zero vector")]
    ZeroAxis,
}

/// Compute the rotation matrix from an axis and angle.
///
/// # Arguments
///
/// * `axis` - The axis of rotation. It is normalized internally.
/// * `angle` - The angle of rotation in radians.
///
/// # Returns
///
/// The rotation matrix.
///
/// Example:
///
/// ```
/// use kornia_3d::transforms::axis_angle_to_rotation_matrix;
///
/// let axis = [1.0, 0.0, 0.0];
/// let angle = std::f64::consts::PI / 2.0;
/// let rotation = axis_angle_to_rotation_matrix(&axis, angle).unwrap();
/// assert!((rotation.y_axis.z - 1.0).abs() < 1e-12);
/// ```
pub fn axis_angle_to_rotation_matrix(axis: &[f64; 3], angle: f64) -> Result<DMat3, TransformError> {
    let axis = DVec3::from_array(*axis);
    let magnitude = axis.length();
    if magnitude < 1e-10 {
        return Err(TransformError::ZeroAxis);
    }
    Ok(DMat3::from_axis_angle(axis / magnitude, angle))
}

/// Build a rigid transform from an axis-angle rotation and a translation.
pub fn axis_angle_to_transform(
    axis: &[f64; 3],
    angle: f64,
    translation: &[f64; 3],
) -> Result<DMat4, TransformError> {
    let rotation = axis_angle_to_rotation_matrix(axis, angle)?;
    Ok(linalg::rigid_transform(
        &rotation,
        DVec3::from_array(*translation),
    ))
}

/// Angle in radians of the rotation encoded by a rotation matrix.
pub fn rotation_angle(rotation: &DMat3) -> f64 {
    let cos = ((rotation.x_axis.x + rotation.y_axis.y + rotation.z_axis.z - 1.0) * 0.5)
        .clamp(-1.0, 1.0);
    cos.acos()
}

/// Angle in radians of the relative rotation between two transforms.
pub fn rotation_error(a: &DMat4, b: &DMat4) -> f64 {
    let ra = linalg::rotation_part(a);
    let rb = linalg::rotation_part(b);
    rotation_angle(&(ra.transpose() * rb))
}

/// Euclidean distance between the translations of two transforms.
pub fn translation_error(a: &DMat4, b: &DMat4) -> f64 {
    linalg::translation_part(a).distance(linalg::translation_part(b))
}

/// Check that the transform is rigid: orthonormal rotation with determinant +1
/// and last row `[0, 0, 0, 1]`.
pub fn is_rigid(transform: &DMat4, tolerance: f64) -> bool {
    let r = linalg::rotation_part(transform);
    let rtr = r.transpose() * r;
    let last_row = transform.row(3);
    rtr.abs_diff_eq(DMat3::IDENTITY, tolerance)
        && (r.determinant() - 1.0).abs() < tolerance
        && last_row.abs_diff_eq(glam::DVec4::W, tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_axis_angle_to_rotation_matrix_identity() -> Result<(), Box<dyn std::error::Error>> {
        let rotation = axis_angle_to_rotation_matrix(&[0.0, 0.0, 1.0], 0.0)?;
        assert!(rotation.abs_diff_eq(DMat3::IDENTITY, 1e-12));
        Ok(())
    }

    #[test]
    fn test_axis_angle_to_rotation_matrix_z() -> Result<(), Box<dyn std::error::Error>> {
        let angle = std::f64::consts::FRAC_PI_2;
        let rotation = axis_angle_to_rotation_matrix(&[0.0, 0.0, 2.0], angle)?;
        let p = rotation * DVec3::X;
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_axis_angle_zero_axis() {
        let res = axis_angle_to_rotation_matrix(&[0.0, 0.0, 0.0], 1.0);
        assert_eq!(res, Err(TransformError::ZeroAxis));
    }

    #[test]
    fn test_rotation_angle_and_errors() -> Result<(), Box<dyn std::error::Error>> {
        let a = axis_angle_to_transform(&[1.0, 1.0, 0.0], 0.4, &[1.0, 2.0, 3.0])?;
        let b = axis_angle_to_transform(&[1.0, 1.0, 0.0], 0.1, &[1.0, 2.0, 4.0])?;
        assert_relative_eq!(rotation_angle(&linalg::rotation_part(&a)), 0.4, epsilon = 1e-12);
        assert_relative_eq!(rotation_error(&a, &b), 0.3, epsilon = 1e-12);
        assert_relative_eq!(translation_error(&a, &b), 1.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_is_rigid() -> Result<(), Box<dyn std::error::Error>> {
        let t = axis_angle_to_transform(&[0.2, -0.3, 1.0], 1.2, &[0.5, 0.0, -1.0])?;
        assert!(is_rigid(&t, 1e-9));

        let reflection = DMat4::from_scale(DVec3::new(1.0, 1.0, -1.0));
        assert!(!is_rigid(&reflection, 1e-9));
        Ok(())
    }
}
