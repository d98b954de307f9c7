use faer::prelude::SpSolver;
use glam::{DMat3, DMat4, DVec3};
use kornia_3d::linalg;
use rayon::prelude::*;

// relative pivot below which the normal equations are treated as singular
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Normal equations `JᵀWJ x = -JᵀWr` for a 6-DoF update `[α, β, γ, tx, ty, tz]`.
///
/// Accumulators are summed per worker and merged with [`LinearSystem6::merge`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSystem6 {
    /// `JᵀWJ`, row-major.
    pub jtj: [[f64; 6]; 6],
    /// `JᵀWr`.
    pub jtr: [f64; 6],
    /// Weighted sum of squared residuals.
    pub residual_squared: f64,
}

impl Default for LinearSystem6 {
    fn default() -> Self {
        Self::zeros()
    }
}

impl LinearSystem6 {
    /// An empty system.
    pub fn zeros() -> Self {
        Self {
            jtj: [[0.0; 6]; 6],
            jtr: [0.0; 6],
            residual_squared: 0.0,
        }
    }

    /// Add one scalar residual `r` with Jacobian row `j` and weight `w`.
    #[inline]
    pub fn add_row(&mut self, j: &[f64; 6], r: f64, w: f64) {
        for a in 0..6 {
            let wja = w * j[a];
            for b in a..6 {
                self.jtj[a][b] += wja * j[b];
            }
            self.jtr[a] += wja * r;
        }
        self.residual_squared += w * r * r;
    }

    /// Add a 3-vector residual with a 3x6 Jacobian `[A | B]` and information matrix `omega`.
    ///
    /// The Jacobian is given as its rotational block `a` and translational block `b`.
    pub fn add_block(&mut self, a: &DMat3, b: &DMat3, r: DVec3, omega: &DMat3, w: f64) {
        // columns of J as 3-vectors
        let cols = [
            a.x_axis, a.y_axis, a.z_axis, b.x_axis, b.y_axis, b.z_axis,
        ];
        let omega_cols = cols.map(|c| *omega * c);
        let omega_r = *omega * r;
        for i in 0..6 {
            for k in i..6 {
                self.jtj[i][k] += w * cols[i].dot(omega_cols[k]);
            }
            self.jtr[i] += w * cols[i].dot(omega_r);
        }
        self.residual_squared += w * r.dot(omega_r);
    }

    /// Sum two partial systems.
    pub fn merge(mut self, other: Self) -> Self {
        for a in 0..6 {
            for b in a..6 {
                self.jtj[a][b] += other.jtj[a][b];
            }
            self.jtr[a] += other.jtr[a];
        }
        self.residual_squared += other.residual_squared;
        self
    }

    /// Full symmetric `JᵀWJ`; only the upper triangle is accumulated.
    pub fn hessian(&self) -> [[f64; 6]; 6] {
        let mut h = self.jtj;
        for a in 0..6 {
            for b in 0..a {
                h[a][b] = h[b][a];
            }
        }
        h
    }

    /// Solve for the update `x` with `JᵀWJ x = -JᵀWr` by Cholesky factorization.
    ///
    /// Returns `None` when the system is not positive definite, when a pivot of
    /// the factorization falls below `1e-12` times the largest diagonal entry, or
    /// when the solution is not finite.
    pub fn solve(&self) -> Option<[f64; 6]> {
        let h = self.hessian();
        let max_diagonal = (0..6).map(|i| h[i][i]).fold(0.0f64, f64::max);
        if !(max_diagonal > 0.0 && max_diagonal.is_finite()) {
            return None;
        }

        let a = faer::Mat::<f64>::from_fn(6, 6, |r, c| h[r][c]);
        let llt = a.cholesky(faer::Side::Lower).ok()?;

        // pivots of LLᵀ are the squared diagonal of L
        let l = llt.compute_l();
        if (0..6).any(|i| !(l.read(i, i) * l.read(i, i) >= PIVOT_TOLERANCE * max_diagonal)) {
            return None;
        }

        let rhs = faer::Mat::<f64>::from_fn(6, 1, |r, _| -self.jtr[r]);
        let solution = llt.solve(&rhs);
        let x: [f64; 6] = std::array::from_fn(|i| solution.read(i, 0));

        x.iter().all(|v| v.is_finite()).then_some(x)
    }
}

/// Accumulate a linear system over `items` in parallel.
///
/// Each worker folds into its own [`LinearSystem6`], the partial systems are
/// merged in a single reduction.
pub fn accumulate<T, F>(items: &[T], add: F) -> LinearSystem6
where
    T: Sync,
    F: Fn(&mut LinearSystem6, &T) + Sync + Send,
{
    items
        .par_iter()
        .fold(LinearSystem6::zeros, |mut acc, item| {
            add(&mut acc, item);
            acc
        })
        .reduce(LinearSystem6::zeros, LinearSystem6::merge)
}

/// Convert a 6-DoF update `[α, β, γ, tx, ty, tz]` into a rigid transform.
///
/// The rotation is `Rz(γ) * Ry(β) * Rx(α)`, which is exactly orthonormal for
/// any angles.
pub fn transform_from_vector(x: &[f64; 6]) -> DMat4 {
    let rotation =
        DMat3::from_rotation_z(x[2]) * DMat3::from_rotation_y(x[1]) * DMat3::from_rotation_x(x[0]);
    linalg::rigid_transform(&rotation, DVec3::new(x[3], x[4], x[5]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_solve_6x6() {
        // diagonally dominant system with a known solution
        let mut sys = LinearSystem6::zeros();
        let expected = [0.1, -0.2, 0.3, 1.0, -2.0, 0.5];
        for i in 0..6 {
            for k in i..6 {
                sys.jtj[i][k] = if i == k { 10.0 + i as f64 } else { 0.5 };
            }
        }
        let h = sys.hessian();
        for i in 0..6 {
            sys.jtr[i] = -(0..6).map(|k| h[i][k] * expected[k]).sum::<f64>();
        }

        let x = sys.solve().unwrap_or_default();
        for i in 0..6 {
            assert_relative_eq!(x[i], expected[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_singular_system() {
        let mut sys = LinearSystem6::zeros();
        // only constrains translation along z
        sys.add_row(&[0.0, 0.0, 0.0, 0.0, 0.0, 1.0], 0.5, 1.0);
        assert_eq!(sys.solve(), None);
        assert_eq!(LinearSystem6::zeros().solve(), None);
    }

    #[test]
    fn test_rank_deficient_system() {
        // the last column is the sum of the first two, so JᵀJ has rank 5 up to rounding
        let mut sys = LinearSystem6::zeros();
        for i in 0..50 {
            let t = 0.37 * i as f64;
            let (a, b) = (t.sin(), t.cos());
            sys.add_row(&[a, b, (2.0 * t).sin(), (0.5 * t).cos(), 0.1 * t, a + b], 0.1, 1.0);
        }
        assert_eq!(sys.solve(), None);

        // one extra independent row restores full rank
        sys.add_row(&[0.0, 0.0, 0.0, 0.0, 0.0, 1.0], 0.0, 1.0);
        let x = sys.solve();
        assert!(x.is_some_and(|x| x.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn test_add_block_matches_rows() {
        // an identity information matrix is three independent scalar rows
        let a = linalg::skew(DVec3::new(1.0, 2.0, 3.0));
        let b = DMat3::IDENTITY;
        let r = DVec3::new(0.1, -0.2, 0.3);

        let mut block = LinearSystem6::zeros();
        block.add_block(&a, &b, r, &DMat3::IDENTITY, 2.0);

        let mut rows = LinearSystem6::zeros();
        for k in 0..3 {
            let j = [
                a.x_axis[k], a.y_axis[k], a.z_axis[k], b.x_axis[k], b.y_axis[k], b.z_axis[k],
            ];
            rows.add_row(&j, r[k], 2.0);
        }

        for i in 0..6 {
            for k in 0..6 {
                assert_relative_eq!(block.jtj[i][k], rows.jtj[i][k], epsilon = 1e-12);
            }
            assert_relative_eq!(block.jtr[i], rows.jtr[i], epsilon = 1e-12);
        }
        assert_relative_eq!(block.residual_squared, rows.residual_squared, epsilon = 1e-12);
    }

    #[test]
    fn test_parallel_accumulate_matches_serial() {
        let rows = (0..1000)
            .map(|i| {
                let t = i as f64 * 0.01;
                ([t.sin(), t.cos(), t, 1.0, t * t, -t], t.sin() * 0.1)
            })
            .collect::<Vec<_>>();

        let parallel = accumulate(&rows, |sys, (j, r)| sys.add_row(j, *r, 1.0));
        let serial = rows.iter().fold(LinearSystem6::zeros(), |mut sys, (j, r)| {
            sys.add_row(j, *r, 1.0);
            sys
        });

        for i in 0..6 {
            for k in i..6 {
                assert_relative_eq!(
                    parallel.jtj[i][k],
                    serial.jtj[i][k],
                    epsilon = 1e-8,
                    max_relative = 1e-9
                );
            }
        }
    }

    #[test]
    fn test_transform_from_vector() {
        let t = transform_from_vector(&[0.0, 0.0, std::f64::consts::FRAC_PI_2, 1.0, 2.0, 3.0]);
        let p = t.transform_point3(DVec3::X);
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 3.0, epsilon = 1e-12);
        assert_relative_eq!(p.z, 3.0, epsilon = 1e-12);

        let r = linalg::rotation_part(&transform_from_vector(&[0.3, -0.2, 0.1, 0.0, 0.0, 0.0]));
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }
}
