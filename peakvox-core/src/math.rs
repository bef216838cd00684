//! Conversions between confidence levels and Gaussian widths.
//!
//! A confidence ellipsoid encloses a given fraction of a Gaussian along
//! each principal axis, so its semi-axes are `sqrt(2) * erfinv(confidence)`
//! standard deviations long.

use std::f64::consts::{PI, SQRT_2};

pub use scilib::math::basic::erf;

const NEWTON_STEPS: usize = 32;

/// Inverse of the error function.
///
/// Returns `±inf` at `±1` and `NaN` outside `[-1, 1]`.
#[must_use]
pub fn erf_inv(y: f64) -> f64 {
    if y.is_nan() || y.abs() > 1.0 {
        return f64::NAN;
    }
    if y.abs() >= 1.0 {
        return y.signum() * f64::INFINITY;
    }

    // Winitzki's closed form, refined with Newton steps on erf.
    let a = 0.147;
    let ln = (1.0 - y * y).ln();
    let t = 2.0 / (PI * a) + 0.5 * ln;
    let mut x = y.signum() * ((t * t - ln / a).sqrt() - t).sqrt();

    let slope = 2.0 / PI.sqrt();
    for _ in 0..NEWTON_STEPS {
        let step = (erf(x) - y) / (slope * (-x * x).exp());
        x -= step;
        if step.abs() <= 1e-15 * x.abs().max(1.0) {
            break;
        }
    }
    x
}

/// Number of standard deviations enclosing `confidence` of a 1D Gaussian.
#[must_use]
pub fn confidence_to_sigmas(confidence: f64) -> f64 {
    SQRT_2 * erf_inv(confidence)
}

/// Fraction of a 1D Gaussian within `sigmas` standard deviations.
#[must_use]
pub fn sigmas_to_confidence(sigmas: f64) -> f64 {
    erf(sigmas / SQRT_2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_erf_inv_inverts_erf() {
        for &x in &[-2.5, -1.0, -0.3, 0.0, 0.1, 0.7, 1.5, 2.9] {
            assert_abs_diff_eq!(erf_inv(erf(x)), x, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_erf_inv_limits() {
        assert!(erf_inv(1.0).is_infinite());
        assert!(erf_inv(-1.0) < 0.0);
        assert!(erf_inv(1.5).is_nan());
        assert_abs_diff_eq!(erf_inv(0.0), 0.0);
    }

    #[test]
    fn test_confidence_round_trip() {
        assert_abs_diff_eq!(confidence_to_sigmas(sigmas_to_confidence(1.0)), 1.0, epsilon = 1e-7);
        // three sigma rule
        assert_abs_diff_eq!(sigmas_to_confidence(3.0), 0.9973, epsilon = 1e-4);
        assert_abs_diff_eq!(confidence_to_sigmas(0.997), 2.9677, epsilon = 1e-3);
    }
}
