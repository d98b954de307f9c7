//! Robust kernels for iteratively reweighted least squares.
//!
//! A kernel maps the magnitude of a residual to a weight in `[0, 1]` used to
//! scale that residual's contribution to the normal equations. The scale
//! parameter is always supplied by the caller.

use crate::error::RegistrationError;

/// Robust loss applied to correspondence residuals.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RobustKernel {
    /// Plain least squares, weight always 1.
    #[default]
    L2,
    /// Absolute loss, weight `1 / |r|`.
    L1,
    /// Quadratic below `k`, linear above.
    Huber {
        /// Transition threshold.
        k: f64,
    },
    /// Cauchy loss, weight `1 / (1 + (r / k)^2)`.
    Cauchy {
        /// Scale parameter.
        k: f64,
    },
    /// Geman-McClure loss, weight `(k^2 / (k^2 + r^2))^2`.
    GemanMcClure {
        /// Scale parameter.
        k: f64,
    },
    /// Tukey biweight, zero weight above `k`.
    Tukey {
        /// Rejection threshold.
        k: f64,
    },
}

// keeps L1 bounded for exact matches
const L1_MIN_RESIDUAL: f64 = 1e-6;

impl RobustKernel {
    /// Create a Huber kernel. Fails if `k` is not a positive finite number.
    pub fn huber(k: f64) -> Result<Self, RegistrationError> {
        Self::Huber { k }.validated()
    }

    /// Create a Cauchy kernel. Fails if `k` is not a positive finite number.
    pub fn cauchy(k: f64) -> Result<Self, RegistrationError> {
        Self::Cauchy { k }.validated()
    }

    /// Create a Geman-McClure kernel. Fails if `k` is not a positive finite number.
    pub fn geman_mcclure(k: f64) -> Result<Self, RegistrationError> {
        Self::GemanMcClure { k }.validated()
    }

    /// Create a Tukey kernel. Fails if `k` is not a positive finite number.
    pub fn tukey(k: f64) -> Result<Self, RegistrationError> {
        Self::Tukey { k }.validated()
    }

    fn scale(&self) -> Option<f64> {
        match *self {
            Self::L2 | Self::L1 => None,
            Self::Huber { k } | Self::Cauchy { k } | Self::GemanMcClure { k } | Self::Tukey { k } => {
                Some(k)
            }
        }
    }

    /// Check that the scale parameter is usable.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        match self.scale() {
            Some(k) if !(k.is_finite() && k > 0.0) => Err(RegistrationError::InvalidParameter(
                format!("robust kernel scale must be positive and finite, got {k}"),
            )),
            _ => Ok(()),
        }
    }

    fn validated(self) -> Result<Self, RegistrationError> {
        self.validate()?;
        Ok(self)
    }

    /// Weight for a residual. Only the magnitude of `residual` matters.
    pub fn weight(&self, residual: f64) -> f64 {
        let r = residual.abs();
        match *self {
            Self::L2 => 1.0,
            Self::L1 => 1.0 / r.max(L1_MIN_RESIDUAL),
            Self::Huber { k } => {
                if r <= k {
                    1.0
                } else {
                    k / r
                }
            }
            Self::Cauchy { k } => 1.0 / (1.0 + (r / k).powi(2)),
            Self::GemanMcClure { k } => {
                let k2 = k * k;
                (k2 / (k2 + r * r)).powi(2)
            }
            Self::Tukey { k } => {
                if r > k {
                    0.0
                } else {
                    (1.0 - (r / k).powi(2)).powi(2)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_l2_always_one() {
        let kernel = RobustKernel::L2;
        assert_eq!(kernel.weight(0.0), 1.0);
        assert_eq!(kernel.weight(-3.0), 1.0);
        assert_eq!(kernel.weight(100.0), 1.0);
    }

    #[test]
    fn test_l1_weights() {
        let kernel = RobustKernel::L1;
        assert_relative_eq!(kernel.weight(2.0), 0.5);
        assert!(kernel.weight(0.0).is_finite());
    }

    #[test]
    fn test_huber_weights() -> Result<(), RegistrationError> {
        let huber = RobustKernel::huber(1.0)?;
        assert_eq!(huber.weight(0.0), 1.0);
        assert_eq!(huber.weight(1.0), 1.0);
        assert_relative_eq!(huber.weight(4.0), 0.25);
        assert_relative_eq!(huber.weight(-4.0), 0.25);
        assert!(huber.weight(1e8).is_finite());
        Ok(())
    }

    #[test]
    fn test_cauchy_weights() -> Result<(), RegistrationError> {
        let cauchy = RobustKernel::cauchy(1.0)?;
        assert_eq!(cauchy.weight(0.0), 1.0);
        assert_relative_eq!(cauchy.weight(3.0), 0.1);
        // larger scale keeps more weight
        let wide = RobustKernel::cauchy(2.0)?;
        assert!(wide.weight(3.0) > cauchy.weight(3.0));
        Ok(())
    }

    #[test]
    fn test_geman_mcclure_weights() -> Result<(), RegistrationError> {
        let gm = RobustKernel::geman_mcclure(1.0)?;
        assert_eq!(gm.weight(0.0), 1.0);
        assert_relative_eq!(gm.weight(1.0), 0.25);
        assert!(gm.weight(10.0) < 1e-3);
        Ok(())
    }

    #[test]
    fn test_tukey_weights() -> Result<(), RegistrationError> {
        let tukey = RobustKernel::tukey(2.0)?;
        assert_eq!(tukey.weight(0.0), 1.0);
        assert_relative_eq!(tukey.weight(1.0), 0.5625);
        assert_eq!(tukey.weight(2.5), 0.0);
        Ok(())
    }

    #[test]
    fn test_weights_are_non_increasing() -> Result<(), RegistrationError> {
        let kernels = [
            RobustKernel::huber(0.5)?,
            RobustKernel::cauchy(0.5)?,
            RobustKernel::geman_mcclure(0.5)?,
            RobustKernel::tukey(0.5)?,
        ];
        for kernel in kernels {
            let mut last = kernel.weight(0.0);
            for i in 1..100 {
                let w = kernel.weight(i as f64 * 0.01);
                assert!(w <= last, "{kernel:?} increased at {i}");
                assert!((0.0..=1.0).contains(&w));
                last = w;
            }
        }
        Ok(())
    }

    #[test]
    fn test_invalid_scale() {
        assert!(matches!(
            RobustKernel::huber(0.0),
            Err(RegistrationError::InvalidParameter(_))
        ));
        assert!(RobustKernel::cauchy(-1.0).is_err());
        assert!(RobustKernel::tukey(f64::NAN).is_err());
        assert!(RobustKernel::GemanMcClure { k: 0.0 }.validate().is_err());
        assert!(RobustKernel::L1.validate().is_ok());
    }
}
