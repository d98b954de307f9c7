use glam::{DMat3, DMat4, DVec3};

/// Build a 4x4 rigid transform from a rotation matrix and a translation vector.
///
/// # Arguments
///
/// * `rotation` - The 3x3 rotation block.
/// * `translation` - The translation vector.
///
/// # Returns
///
/// The homogeneous transform `[R | t; 0 | 1]`.
pub fn rigid_transform(rotation: &DMat3, translation: DVec3) -> DMat4 {
    DMat4::from_cols(
        rotation.x_axis.extend(0.0),
        rotation.y_axis.extend(0.0),
        rotation.z_axis.extend(0.0),
        translation.extend(1.0),
    )
}

/// Get the 3x3 rotation block of a homogeneous transform.
#[inline]
pub fn rotation_part(transform: &DMat4) -> DMat3 {
    DMat3::from_mat4(*transform)
}

/// Get the translation vector of a homogeneous transform.
#[inline]
pub fn translation_part(transform: &DMat4) -> DVec3 {
    transform.w_axis.truncate()
}

/// Convert a row-major 3x3 array into a matrix.
#[inline]
pub fn mat3_from_rows(rows: &[[f64; 3]; 3]) -> DMat3 {
    DMat3::from_cols_array_2d(rows).transpose()
}

/// Convert a matrix into a row-major 3x3 array.
#[inline]
pub fn mat3_to_rows(mat: &DMat3) -> [[f64; 3]; 3] {
    mat.transpose().to_cols_array_2d()
}

/// Skew-symmetric matrix `[v]x` such that `[v]x * w = v x w`.
pub fn skew(v: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// Transform a set of points with a homogeneous transform.
///
/// Example:
///
/// ```
/// use glam::{DMat4, DVec3};
/// use kornia_3d::linalg::transform_points;
///
/// let points = vec![[2.0, 2.0, 2.0], [3.0, 4.0, 5.0]];
/// let transform = DMat4::from_translation(DVec3::new(1.0, 0.0, 0.0));
/// let transformed = transform_points(&points, &transform);
/// assert_eq!(transformed[0], [3.0, 2.0, 2.0]);
/// ```
pub fn transform_points(points: &[[f64; 3]], transform: &DMat4) -> Vec<[f64; 3]> {
    points
        .iter()
        .map(|p| {
            transform
                .transform_point3(DVec3::from_array(*p))
                .to_array()
        })
        .collect()
}

/// Rotate a set of direction vectors, leaving translation out.
pub fn rotate_vectors(vectors: &[[f64; 3]], rotation: &DMat3) -> Vec<[f64; 3]> {
    vectors
        .iter()
        .map(|v| (*rotation * DVec3::from_array(*v)).to_array())
        .collect()
}

/// Rotate a covariance matrix given in row-major layout as `R * C * R^T`.
pub fn rotate_covariance(covariance: &[[f64; 3]; 3], rotation: &DMat3) -> [[f64; 3]; 3] {
    let c = mat3_from_rows(covariance);
    mat3_to_rows(&(*rotation * c * rotation.transpose()))
}

/// Compute the centroid of a set of points.
///
/// Returns the origin for an empty set.
pub fn centroid(points: &[[f64; 3]]) -> DVec3 {
    if points.is_empty() {
        return DVec3::ZERO;
    }
    let sum = points
        .iter()
        .fold(DVec3::ZERO, |acc, p| acc + DVec3::from_array(*p));
    sum / points.len() as f64
}
