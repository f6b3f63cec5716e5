use std::f64::consts::SQRT_2;

use statrs::function::erf::erfc_inv;

/// Standard normal inverse CDF.
pub fn normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

/// Value at probability `p` of the lognormal distribution whose arithmetic
/// mean and standard deviation are `mean` and `vol`.
///
/// `mean` is a gross quantity (`1 + return`). A zero-width distribution, or a
/// non-positive mean for which no lognormal fit exists, returns `mean`.
pub fn percentile(p: f64, mean: f64, vol: f64) -> f64 {
    if vol == 0.0 || mean <= 0.0 {
        return mean;
    }
    let mean_sq = mean * mean;
    let vol_sq = vol * vol;
    let mu = (mean_sq / (vol_sq + mean_sq).sqrt()).ln();
    let sigma = (vol_sq / mean_sq + 1.0).ln().sqrt();
    let value = (mu + sigma * normal_quantile(p)).exp();
    if value.is_nan() { mean } else { value }
}

pub fn geomean(mean: f64, vol: f64) -> f64 {
    percentile(0.5, mean, vol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    #[test]
    fn normal_quantile_matches_tables() {
        assert_approx_tol(normal_quantile(0.5), 0.0, 1e-12);
        assert_approx_tol(normal_quantile(0.9), 1.281_551_565_5, 1e-8);
        assert_approx_tol(normal_quantile(0.975), 1.959_963_984_5, 1e-8);
        assert_approx_tol(normal_quantile(0.06), -1.554_773_594_6, 1e-8);
    }

    #[test]
    fn zero_volatility_returns_mean() {
        for p in [0.01, 0.06, 0.5, 0.97] {
            assert_eq!(percentile(p, 1.05, 0.0), 1.05);
        }
    }

    #[test]
    fn non_positive_mean_returns_mean() {
        assert_eq!(percentile(0.06, 0.0, 0.2), 0.0);
        assert_eq!(percentile(0.5, -0.3, 0.2), -0.3);
    }

    #[test]
    fn geometric_mean_matches_closed_form() {
        let mean: f64 = 1.072;
        let vol: f64 = 0.17;
        let expected = mean / (1.0 + vol * vol / (mean * mean)).sqrt();
        assert_approx_tol(geomean(mean, vol), expected, 1e-12);
    }

    #[test]
    fn fat_tail_loss_is_positive_for_equity_like_returns() {
        let loss = 1.0 - percentile(0.06, 1.07, 0.17);
        assert!(loss > 0.15 && loss < 0.25, "loss {loss}");
    }

    proptest! {
        #[test]
        fn prop_median_is_geomean(mean in 0.5f64..1.5, vol in 0.0f64..0.6) {
            prop_assert_eq!(percentile(0.5, mean, vol), geomean(mean, vol));
        }

        #[test]
        fn prop_percentiles_are_ordered(mean in 0.5f64..1.5, vol in 0.01f64..0.6) {
            let low = percentile(0.06, mean, vol);
            let mid = percentile(0.5, mean, vol);
            let high = percentile(0.97, mean, vol);
            prop_assert!(0.0 < low && low < mid && mid < high);
        }
    }
}
