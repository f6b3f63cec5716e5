use nalgebra::{DMatrix, DVector};

use crate::error::{AllocError, Result};

/// LU pivots smaller than this fraction of the largest covariance entry are
/// treated as zero.
const SINGULAR_PIVOT: f64 = 1e-12;

/// Unconstrained mean-variance optimal weights `Σ⁻¹(α − r)/γ`.
pub fn solve_merton<const N: usize>(
    gamma: f64,
    sigma: [[f64; N]; N],
    alpha: [f64; N],
    risk_free: f64,
) -> Result<[f64; N]> {
    let covariance = DMatrix::from_fn(N, N, |i, j| sigma[i][j]);
    let excess = DVector::from_iterator(N, alpha.iter().map(|a| a - risk_free));

    let scale = covariance.amax();
    if scale == 0.0 || !scale.is_finite() {
        return Err(AllocError::IdenticalCovariance);
    }
    let lu = covariance.lu();
    if lu
        .u()
        .diagonal()
        .iter()
        .any(|pivot| pivot.abs() <= SINGULAR_PIVOT * scale)
    {
        return Err(AllocError::IdenticalCovariance);
    }
    let solved = lu.solve(&excess).ok_or(AllocError::IdenticalCovariance)?;

    let mut w = [0.0; N];
    for (wi, x) in w.iter_mut().zip(solved.iter()) {
        *wi = x / gamma;
    }
    if w.iter().any(|wi| !wi.is_finite()) {
        return Err(AllocError::IdenticalCovariance);
    }
    Ok(w)
}
