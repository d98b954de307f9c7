use rayon::prelude::*;

use crate::error::RegistrationError;

// mutual matching falls back to one-way matches below this survival ratio
const MUTUAL_CONSISTENT_RATIO: f64 = 0.1;

/// Per-point feature descriptors, stored row-major.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Features {
    data: Vec<f64>,
    dimension: usize,
}

impl Features {
    /// Create descriptors from a flat buffer of `len * dimension` values.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidInput`] if `dimension` is zero or does
    /// not divide the buffer length.
    pub fn new(data: Vec<f64>, dimension: usize) -> Result<Self, RegistrationError> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(RegistrationError::InvalidInput(format!(
                "a buffer of {} values cannot hold descriptors of dimension {dimension}",
                data.len()
            )));
        }
        Ok(Self { data, dimension })
    }

    /// Create descriptors from one row per point.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, RegistrationError> {
        let dimension = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != dimension) {
            return Err(RegistrationError::InvalidInput(
                "descriptor rows have different lengths".to_string(),
            ));
        }
        if rows.is_empty() {
            return Ok(Self::default());
        }
        Self::new(rows.concat(), dimension)
    }

    /// Length of a descriptor.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    /// Whether there are no descriptors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The descriptor of point `index`, `None` when out of range.
    pub fn descriptor(&self, index: usize) -> Option<&[f64]> {
        (index < self.len()).then(|| self.row(index))
    }

    // caller guarantees `index < len`
    fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.dimension..(index + 1) * self.dimension]
    }

    fn nearest(&self, query: &[f64]) -> Option<usize> {
        (0..self.len())
            .map(|j| {
                let d = self
                    .row(j)
                    .iter()
                    .zip(query)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>();
                (j, d)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(j, _)| j)
    }
}

/// Match every source descriptor to its nearest target descriptor.
///
/// With `mutual_filter`, a pair `(i, j)` is kept only if `i` is also the
/// nearest source descriptor of `j`. When fewer than a tenth of the pairs pass
/// the mutual check, the one-way matches are returned instead.
///
/// # Returns
///
/// Candidate pairs `(source index, target index)` ordered by source index.
pub fn correspondences_from_features(
    source: &Features,
    target: &Features,
    mutual_filter: bool,
) -> Result<Vec<(usize, usize)>, RegistrationError> {
    if source.is_empty() || target.is_empty() {
        return Ok(Vec::new());
    }
    if source.dimension() != target.dimension() {
        return Err(RegistrationError::InvalidInput(format!(
            "descriptor dimensions differ: {} and {}",
            source.dimension(),
            target.dimension()
        )));
    }

    let forward = (0..source.len())
        .into_par_iter()
        .filter_map(|i| target.nearest(source.row(i)).map(|j| (i, j)))
        .collect::<Vec<_>>();
    if !mutual_filter {
        return Ok(forward);
    }

    let backward = (0..target.len())
        .into_par_iter()
        .map(|j| source.nearest(target.row(j)))
        .collect::<Vec<_>>();
    let mutual = forward
        .iter()
        .copied()
        .filter(|&(i, j)| backward[j] == Some(i))
        .collect::<Vec<_>>();

    if (mutual.len() as f64) < MUTUAL_CONSISTENT_RATIO * forward.len() as f64 {
        log::debug!(
            "only {} of {} matches are mutual, keeping one-way matches",
            mutual.len(),
            forward.len()
        );
        return Ok(forward);
    }
    Ok(mutual)
}
